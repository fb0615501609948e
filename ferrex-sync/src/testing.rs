//! In-memory fakes for the remote API and the event stream.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use ferrex_sync_model::{
    CachedMediaItem, EntityId, StreamFrame, UserData, UserId, UserLibrary,
};
use futures::StreamExt;
use futures::stream;
use parking_lot::Mutex;

use crate::api::{ItemPage, PlaybackReport, RemoteApi};
use crate::credentials::AccessToken;
use crate::error::SyncError;
use crate::realtime::{EventStreamSource, FrameStream, StreamError};
use crate::store::{ItemSort, LibraryQuery};

#[derive(Debug, Default)]
struct FakeState {
    items: HashMap<EntityId, CachedMediaItem>,
    libraries: Vec<UserLibrary>,
    resume: Vec<EntityId>,
    next_up: Vec<EntityId>,
    failures: HashMap<&'static str, SyncError>,
    calls: HashMap<&'static str, usize>,
    reports: Vec<(&'static str, PlaybackReport)>,
    delay: Option<Duration>,
}

/// Media server stand-in holding a single user's view.
///
/// Every method counts its calls and can be made to fail with a chosen
/// [`SyncError`] or to answer after a delay.
#[derive(Debug, Default)]
pub struct FakeRemoteApi {
    state: Mutex<FakeState>,
}

impl FakeRemoteApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_item(&self, item: CachedMediaItem) {
        self.state.lock().items.insert(item.id.clone(), item);
    }

    pub fn remove_item(&self, id: &EntityId) {
        self.state.lock().items.remove(id);
    }

    /// Server-side copy of an item.
    pub fn item(&self, id: &EntityId) -> Option<CachedMediaItem> {
        self.state.lock().items.get(id).cloned()
    }

    pub fn set_libraries(&self, libraries: Vec<UserLibrary>) {
        self.state.lock().libraries = libraries;
    }

    pub fn set_resume(&self, ids: Vec<EntityId>) {
        self.state.lock().resume = ids;
    }

    pub fn set_next_up(&self, ids: Vec<EntityId>) {
        self.state.lock().next_up = ids;
    }

    /// Make `method` fail with `error` until [`FakeRemoteApi::succeed`].
    pub fn fail(&self, method: &'static str, error: SyncError) {
        self.state.lock().failures.insert(method, error);
    }

    pub fn succeed(&self, method: &'static str) {
        self.state.lock().failures.remove(method);
    }

    pub fn set_delay(&self, delay: Option<Duration>) {
        self.state.lock().delay = delay;
    }

    pub fn calls(&self, method: &str) -> usize {
        self.state.lock().calls.get(method).copied().unwrap_or(0)
    }

    pub fn reports(&self) -> Vec<(&'static str, PlaybackReport)> {
        self.state.lock().reports.clone()
    }

    async fn enter(&self, method: &'static str) -> anyhow::Result<()> {
        let (delay, failure) = {
            let mut state = self.state.lock();
            *state.calls.entry(method).or_default() += 1;
            (state.delay, state.failures.get(method).cloned())
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match failure {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }

    fn list(&self, ids: &[EntityId], limit: usize) -> Vec<CachedMediaItem> {
        let state = self.state.lock();
        ids.iter()
            .filter_map(|id| state.items.get(id).cloned())
            .take(limit)
            .collect()
    }

    fn not_found(id: &EntityId) -> anyhow::Error {
        SyncError::Validation(format!("404 Not Found: item {id}")).into()
    }

    fn update(&self, id: &EntityId, f: impl FnOnce(&mut UserData)) -> anyhow::Result<UserData> {
        let mut state = self.state.lock();
        let item = state.items.get_mut(id).ok_or_else(|| Self::not_found(id))?;
        f(&mut item.user_data);
        Ok(item.user_data.clone())
    }
}

#[async_trait]
impl RemoteApi for FakeRemoteApi {
    async fn get_user_libraries(&self, _user: &UserId) -> anyhow::Result<Vec<UserLibrary>> {
        self.enter("get_user_libraries").await?;
        Ok(self.state.lock().libraries.clone())
    }

    async fn get_items(&self, _user: &UserId, query: &LibraryQuery) -> anyhow::Result<ItemPage> {
        self.enter("get_items").await?;
        let mut items: Vec<CachedMediaItem> = self
            .state
            .lock()
            .items
            .values()
            .filter(|item| item.parent_id.as_ref() == Some(&query.parent_id))
            .filter(|item| query.kinds.is_empty() || query.kinds.contains(&item.kind))
            .cloned()
            .collect();
        match query.sort {
            ItemSort::Name => items.sort_by_key(CachedMediaItem::sort_key),
            ItemSort::DateAdded => items.sort_by_key(|item| (item.date_added, item.sort_key())),
            ItemSort::Index => {
                items.sort_by_key(|item| (item.parent_index_number, item.index_number))
            }
        }
        if query.descending {
            items.reverse();
        }
        let total_count = items.len();
        let items = items
            .into_iter()
            .skip(query.start_index)
            .take(query.limit.unwrap_or(usize::MAX))
            .collect();
        Ok(ItemPage { items, total_count })
    }

    async fn get_item(&self, _user: &UserId, id: &EntityId) -> anyhow::Result<CachedMediaItem> {
        self.enter("get_item").await?;
        self.item(id).ok_or_else(|| Self::not_found(id))
    }

    async fn get_resume_items(
        &self,
        _user: &UserId,
        limit: usize,
    ) -> anyhow::Result<Vec<CachedMediaItem>> {
        self.enter("get_resume_items").await?;
        let ids = self.state.lock().resume.clone();
        Ok(self.list(&ids, limit))
    }

    async fn get_next_up(
        &self,
        _user: &UserId,
        limit: usize,
    ) -> anyhow::Result<Vec<CachedMediaItem>> {
        self.enter("get_next_up").await?;
        let ids = self.state.lock().next_up.clone();
        Ok(self.list(&ids, limit))
    }

    async fn get_latest(
        &self,
        _user: &UserId,
        parent_id: &EntityId,
        limit: usize,
    ) -> anyhow::Result<Vec<CachedMediaItem>> {
        self.enter("get_latest").await?;
        let mut items: Vec<CachedMediaItem> = self
            .state
            .lock()
            .items
            .values()
            .filter(|item| item.parent_id.as_ref() == Some(parent_id))
            .cloned()
            .collect();
        items.sort_by(|a, b| b.date_added.cmp(&a.date_added));
        items.truncate(limit);
        Ok(items)
    }

    async fn set_favorite(
        &self,
        _user: &UserId,
        id: &EntityId,
        favorite: bool,
    ) -> anyhow::Result<UserData> {
        self.enter("set_favorite").await?;
        self.update(id, |data| data.is_favorite = favorite)
    }

    async fn set_played(
        &self,
        _user: &UserId,
        id: &EntityId,
        played: bool,
    ) -> anyhow::Result<UserData> {
        self.enter("set_played").await?;
        self.update(id, |data| {
            if played && !data.played {
                data.play_count += 1;
                data.last_played_date = Some(Utc::now());
            }
            data.played = played;
            data.playback_position_ticks = 0;
        })
    }

    async fn set_watchlist(
        &self,
        _user: &UserId,
        id: &EntityId,
        watchlist: bool,
    ) -> anyhow::Result<UserData> {
        self.enter("set_watchlist").await?;
        self.update(id, |data| data.is_watchlist = watchlist)
    }

    async fn report_playback_start(
        &self,
        _user: &UserId,
        report: &PlaybackReport,
    ) -> anyhow::Result<()> {
        self.enter("report_playback_start").await?;
        self.state.lock().reports.push(("start", report.clone()));
        Ok(())
    }

    async fn report_playback_progress(
        &self,
        _user: &UserId,
        report: &PlaybackReport,
    ) -> anyhow::Result<()> {
        self.enter("report_playback_progress").await?;
        self.state.lock().reports.push(("progress", report.clone()));
        Ok(())
    }

    async fn report_playback_stopped(
        &self,
        _user: &UserId,
        report: &PlaybackReport,
    ) -> anyhow::Result<()> {
        self.enter("report_playback_stopped").await?;
        self.state.lock().reports.push(("stopped", report.clone()));
        Ok(())
    }
}

/// What one scripted connection does.
#[derive(Debug, Clone)]
pub enum StreamScript {
    /// Refuse the connection.
    Reject(StreamError),
    /// Deliver these items, then end the stream.
    Frames(Vec<Result<StreamFrame, StreamError>>),
    /// Deliver these frames, then stay open.
    Hold(Vec<StreamFrame>),
}

impl StreamScript {
    pub fn frames(frames: impl IntoIterator<Item = StreamFrame>) -> Self {
        StreamScript::Frames(frames.into_iter().map(Ok).collect())
    }
}

/// One recorded `connect` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectAttempt {
    pub token: Option<String>,
    pub last_event_id: Option<String>,
}

/// Event source playing back queued scripts, one per connection.
///
/// Once the queue is empty, connections are accepted and stay open
/// without delivering anything.
#[derive(Debug, Default)]
pub struct ScriptedEventSource {
    scripts: Mutex<VecDeque<StreamScript>>,
    attempts: Mutex<Vec<ConnectAttempt>>,
}

impl ScriptedEventSource {
    pub fn new(scripts: impl IntoIterator<Item = StreamScript>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into_iter().collect()),
            attempts: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, script: StreamScript) {
        self.scripts.lock().push_back(script);
    }

    pub fn attempts(&self) -> Vec<ConnectAttempt> {
        self.attempts.lock().clone()
    }
}

#[async_trait]
impl EventStreamSource for ScriptedEventSource {
    async fn connect(
        &self,
        token: Option<AccessToken>,
        last_event_id: Option<String>,
    ) -> Result<FrameStream, StreamError> {
        self.attempts.lock().push(ConnectAttempt {
            token: token.map(|t| t.as_str().to_string()),
            last_event_id,
        });

        let script = self
            .scripts
            .lock()
            .pop_front()
            .unwrap_or(StreamScript::Hold(Vec::new()));
        match script {
            StreamScript::Reject(err) => Err(err),
            StreamScript::Frames(frames) => Ok(stream::iter(frames).boxed()),
            StreamScript::Hold(frames) => Ok(stream::iter(frames.into_iter().map(Ok))
                .chain(stream::pending())
                .boxed()),
        }
    }
}

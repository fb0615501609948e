//! Remote media server access.

use std::fmt::Debug;

use async_trait::async_trait;
use ferrex_sync_model::{CachedMediaItem, EntityId, UserData, UserId, UserLibrary};

use crate::store::LibraryQuery;

pub mod client;
pub mod routes;
pub mod types;

pub use client::ApiClient;
pub use types::PlaybackReport;

/// One page of a library listing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ItemPage {
    pub items: Vec<CachedMediaItem>,
    pub total_count: usize,
}

/// Operations the synchronization core needs from the media server.
///
/// Errors are raw; callers classify them through
/// [`safe_api_call`](crate::result::safe_api_call).
#[async_trait]
pub trait RemoteApi: Send + Sync + Debug {
    async fn get_user_libraries(&self, user: &UserId) -> anyhow::Result<Vec<UserLibrary>>;

    async fn get_items(&self, user: &UserId, query: &LibraryQuery) -> anyhow::Result<ItemPage>;

    async fn get_item(&self, user: &UserId, id: &EntityId) -> anyhow::Result<CachedMediaItem>;

    async fn get_resume_items(
        &self,
        user: &UserId,
        limit: usize,
    ) -> anyhow::Result<Vec<CachedMediaItem>>;

    async fn get_next_up(&self, user: &UserId, limit: usize)
    -> anyhow::Result<Vec<CachedMediaItem>>;

    /// Most recently added children of a library.
    async fn get_latest(
        &self,
        user: &UserId,
        parent_id: &EntityId,
        limit: usize,
    ) -> anyhow::Result<Vec<CachedMediaItem>>;

    /// Returns the server's user data after the change.
    async fn set_favorite(
        &self,
        user: &UserId,
        id: &EntityId,
        favorite: bool,
    ) -> anyhow::Result<UserData>;

    async fn set_played(&self, user: &UserId, id: &EntityId, played: bool)
    -> anyhow::Result<UserData>;

    async fn set_watchlist(
        &self,
        user: &UserId,
        id: &EntityId,
        watchlist: bool,
    ) -> anyhow::Result<UserData>;

    async fn report_playback_start(
        &self,
        user: &UserId,
        report: &PlaybackReport,
    ) -> anyhow::Result<()>;

    async fn report_playback_progress(
        &self,
        user: &UserId,
        report: &PlaybackReport,
    ) -> anyhow::Result<()>;

    async fn report_playback_stopped(
        &self,
        user: &UserId,
        report: &PlaybackReport,
    ) -> anyhow::Result<()>;
}

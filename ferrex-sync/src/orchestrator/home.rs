use ferrex_sync_model::{CachedMediaItem, EntityId, UserId, UserLibrary};
use futures::future::join_all;

use super::SynchronizationOrchestrator;
use crate::dispatcher::Priority;
use crate::result::ApiResult;
use crate::store::{ItemSort, LibraryQuery};

/// The "latest additions" row of one library.
#[derive(Debug, Clone, PartialEq)]
pub struct LatestSection {
    pub library: UserLibrary,
    pub items: Vec<CachedMediaItem>,
}

/// Everything the home screen shows, gathered in one call.
///
/// Sections that failed hold whatever was cached before; `errors` lists
/// each failure as `"<section>: <error>"`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HomeScreenData {
    pub libraries: Vec<UserLibrary>,
    pub resume: Vec<CachedMediaItem>,
    pub next_up: Vec<CachedMediaItem>,
    pub latest: Vec<LatestSection>,
    pub errors: Vec<String>,
}

impl HomeScreenData {
    pub fn is_complete(&self) -> bool {
        self.errors.is_empty()
    }
}

impl SynchronizationOrchestrator {
    /// Fan out every home screen section concurrently.
    ///
    /// Never fails as a whole; one section failing does not affect the
    /// others.
    pub async fn get_home_screen_data(&self, user: &UserId, force_refresh: bool) -> HomeScreenData {
        let limits = self.inner.snapshots.clone();
        let latest_limit = limits.latest_limit;

        let libraries_and_latest = async {
            let mut errors = Vec::new();
            let libraries = match self.get_user_libraries(user, force_refresh).await {
                ApiResult::Success(libraries) => libraries,
                ApiResult::Error(err) => {
                    errors.push(format!("libraries: {err}"));
                    self.inner
                        .cache
                        .libraries(user)
                        .await
                        .ok()
                        .flatten()
                        .unwrap_or_default()
                }
                ApiResult::Loading => Vec::new(),
            };

            let rows = join_all(libraries.iter().map(|library| async move {
                let result = self
                    .get_latest_items(user, &library.id, latest_limit, force_refresh)
                    .await;
                (library, result)
            }))
            .await;

            let mut latest = Vec::with_capacity(rows.len());
            for (library, result) in rows {
                let items = match result {
                    ApiResult::Success(items) => items,
                    ApiResult::Error(err) => {
                        errors.push(format!("latest ({}): {err}", library.name));
                        self.cached_latest(user, &library.id, latest_limit).await
                    }
                    ApiResult::Loading => Vec::new(),
                };
                latest.push(LatestSection {
                    library: library.clone(),
                    items,
                });
            }
            (libraries, latest, errors)
        };

        let resume = self.get_resume_items(user, limits.resume_limit, force_refresh);
        let next_up = self.get_next_up_episodes(user, limits.next_up_limit, force_refresh);

        let ((libraries, latest, mut errors), resume, next_up) =
            tokio::join!(libraries_and_latest, resume, next_up);

        let resume = match resume {
            ApiResult::Success(items) => items,
            ApiResult::Error(err) => {
                errors.push(format!("resume: {err}"));
                self.inner.resume.snapshot(limits.resume_limit)
            }
            ApiResult::Loading => Vec::new(),
        };
        let next_up = match next_up {
            ApiResult::Success(items) => items,
            ApiResult::Error(err) => {
                errors.push(format!("next_up: {err}"));
                self.inner.next_up.snapshot(limits.next_up_limit)
            }
            ApiResult::Loading => Vec::new(),
        };

        if !errors.is_empty() {
            log::warn!(
                "[Orchestrator] Home screen loaded with {} failed section(s)",
                errors.len()
            );
        }

        HomeScreenData {
            libraries,
            resume,
            next_up,
            latest,
            errors,
        }
    }

    /// Most recently added children of a library.
    pub async fn get_latest_items(
        &self,
        user: &UserId,
        library_id: &EntityId,
        limit: usize,
        force_refresh: bool,
    ) -> ApiResult<Vec<CachedMediaItem>> {
        let cached = self.cached_latest(user, library_id, limit).await;
        if self.inner.connectivity.is_online() && !force_refresh && !cached.is_empty() {
            return ApiResult::Success(cached);
        }

        let user = user.clone();
        let library_id = library_id.clone();
        let cached = (!cached.is_empty()).then_some(cached);
        self.remote(Priority::Low, cached, move |inner| async move {
            let items = inner.api.get_latest(&user, &library_id, limit).await?;
            Ok(inner.cache.upsert(&user, items).await?)
        })
        .await
    }

    async fn cached_latest(
        &self,
        user: &UserId,
        library_id: &EntityId,
        limit: usize,
    ) -> Vec<CachedMediaItem> {
        let query = LibraryQuery::new(library_id.clone())
            .sorted_by(ItemSort::DateAdded, true)
            .page(0, limit);
        self.inner.cache.query(user, &query).await.unwrap_or_else(|err| {
            log::warn!("[Orchestrator] Cached latest for {} unreadable: {}", library_id, err);
            Vec::new()
        })
    }
}

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use ferrex_sync_model::{CachedMediaItem, EntityId, UserData, UserId, UserLibrary};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;

use super::routes::{fill, v1};
use super::types::{
    ApiResponse, ItemDto, ItemPageDto, LibraryDto, PlaybackReport, UserDataDto, map_items,
};
use super::{ItemPage, RemoteApi};
use crate::credentials::{AccessToken, Credentials};
use crate::error::{ApiStatusError, SyncError};
use crate::store::{ItemSort, LibraryQuery};

/// API client with authentication support
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    credentials: Credentials,
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient")
            .field("base_url", &self.base_url)
            .field("credentials", &self.credentials)
            .finish()
    }
}

/// Add a scheme when missing and drop trailing slashes.
fn normalize_base_url(raw: &str) -> Result<String> {
    let trimmed = raw.trim().trim_end_matches('/');
    let with_scheme = if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("http://{trimmed}")
    };
    if with_scheme != raw {
        log::warn!(
            "[ApiClient] Normalized base URL from '{}' to '{}'",
            raw,
            with_scheme
        );
    }
    url::Url::parse(&with_scheme)
        .map_err(|e| SyncError::Validation(format!("invalid server URL '{raw}': {e}")))?;
    Ok(with_scheme)
}

impl ApiClient {
    pub fn new(base_url: &str, credentials: Credentials) -> Result<Self> {
        let base_url = normalize_base_url(base_url)?;
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        log::info!(
            "[ApiClient] Creating new API client with base URL: {}",
            base_url
        );

        Ok(Self {
            client,
            base_url,
            credentials,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// Shared connection pool, also used by the event stream.
    pub fn http(&self) -> &Client {
        &self.client
    }

    /// Build an absolute URL for a route path.
    pub fn build_url(&self, path: impl AsRef<str>) -> String {
        let path = path.as_ref();
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn authorize(builder: RequestBuilder, token: Option<&AccessToken>) -> RequestBuilder {
        match token {
            Some(token) => builder.header(reqwest::header::AUTHORIZATION, token.bearer()),
            None => builder,
        }
    }

    /// Send a request; on 401 refresh the token once and resend.
    async fn send<F>(&self, build: F) -> Result<Response>
    where
        F: Fn(&Client) -> RequestBuilder + Send + Sync,
    {
        let token = self.credentials.token().await;
        let response = Self::authorize(build(&self.client), token.as_ref())
            .send()
            .await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let refreshed = self.credentials.refresh(token.as_ref()).await?;
        log::info!("[ApiClient] Retrying request with refreshed token");
        Ok(Self::authorize(build(&self.client), Some(&refreshed))
            .send()
            .await?)
    }

    async fn check(response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        Err(ApiStatusError { status, body }.into())
    }

    /// Execute a request expecting an `ApiResponse<T>` envelope.
    async fn execute<T, F>(&self, build: F) -> Result<T>
    where
        T: DeserializeOwned,
        F: Fn(&Client) -> RequestBuilder + Send + Sync,
    {
        let response = Self::check(self.send(build).await?).await?;
        if response.status() == StatusCode::NO_CONTENT {
            return Err(SyncError::Validation(
                "Empty response from server (204 No Content)".to_string(),
            )
            .into());
        }
        let envelope: ApiResponse<T> = response.json().await?;
        envelope.data.ok_or_else(|| {
            SyncError::Validation(
                envelope
                    .error
                    .or(envelope.message)
                    .unwrap_or_else(|| "Empty response from server".to_string()),
            )
            .into()
        })
    }

    /// Execute a request for endpoints that answer without a body.
    async fn execute_no_content<F>(&self, build: F) -> Result<()>
    where
        F: Fn(&Client) -> RequestBuilder + Send + Sync,
    {
        Self::check(self.send(build).await?).await?;
        Ok(())
    }

    async fn toggle(
        &self,
        route: &str,
        user: &UserId,
        id: &EntityId,
        enabled: bool,
    ) -> Result<UserData> {
        let url = self.build_url(fill(route, &[("user_id", user.as_str()), ("id", id.as_str())]));
        log::debug!("[ApiClient] {} {}", if enabled { "POST" } else { "DELETE" }, url);
        let dto: UserDataDto = self
            .execute(|client| {
                if enabled {
                    client.post(&url)
                } else {
                    client.delete(&url)
                }
            })
            .await?;
        Ok(dto.into())
    }

    async fn get_item_list(
        &self,
        url: String,
        query: Vec<(&'static str, String)>,
    ) -> Result<Vec<CachedMediaItem>> {
        let items: Vec<ItemDto> = self
            .execute(|client| client.get(&url).query(&query))
            .await?;
        Ok(map_items(items))
    }
}

fn sort_params(sort: ItemSort) -> &'static str {
    match sort {
        ItemSort::Name => "SortName",
        ItemSort::DateAdded => "DateCreated,SortName",
        ItemSort::Index => "ParentIndexNumber,IndexNumber,SortName",
    }
}

fn items_query(query: &LibraryQuery) -> Vec<(&'static str, String)> {
    let mut params = vec![
        ("parentId", query.parent_id.to_string()),
        ("sortBy", sort_params(query.sort).to_string()),
        (
            "sortOrder",
            if query.descending { "Descending" } else { "Ascending" }.to_string(),
        ),
        ("startIndex", query.start_index.to_string()),
    ];
    if !query.kinds.is_empty() {
        let kinds: Vec<String> = query.kinds.iter().map(ToString::to_string).collect();
        params.push(("includeItemTypes", kinds.join(",")));
    }
    if let Some(limit) = query.limit {
        params.push(("limit", limit.to_string()));
    }
    params
}

#[async_trait]
impl RemoteApi for ApiClient {
    async fn get_user_libraries(&self, user: &UserId) -> Result<Vec<UserLibrary>> {
        let url = self.build_url(fill(v1::users::VIEWS, &[("user_id", user.as_str())]));
        let libraries: Vec<LibraryDto> = self.execute(|client| client.get(&url)).await?;
        libraries
            .into_iter()
            .map(|dto| UserLibrary::try_from(dto).map_err(anyhow::Error::from))
            .collect()
    }

    async fn get_items(&self, user: &UserId, query: &LibraryQuery) -> Result<ItemPage> {
        let url = self.build_url(fill(v1::users::ITEMS, &[("user_id", user.as_str())]));
        let params = items_query(query);
        let page: ItemPageDto = self
            .execute(|client| client.get(&url).query(&params))
            .await?;
        let total_count = page.total_record_count;
        Ok(ItemPage {
            items: map_items(page.items),
            total_count,
        })
    }

    async fn get_item(&self, user: &UserId, id: &EntityId) -> Result<CachedMediaItem> {
        let url = self.build_url(fill(
            v1::users::ITEM,
            &[("user_id", user.as_str()), ("id", id.as_str())],
        ));
        let dto: ItemDto = self.execute(|client| client.get(&url)).await?;
        Ok(CachedMediaItem::try_from(dto)?)
    }

    async fn get_resume_items(&self, user: &UserId, limit: usize) -> Result<Vec<CachedMediaItem>> {
        let url = self.build_url(fill(v1::users::RESUME, &[("user_id", user.as_str())]));
        self.get_item_list(url, vec![("limit", limit.to_string())])
            .await
    }

    async fn get_next_up(&self, user: &UserId, limit: usize) -> Result<Vec<CachedMediaItem>> {
        let url = self.build_url(fill(v1::users::NEXT_UP, &[("user_id", user.as_str())]));
        self.get_item_list(url, vec![("limit", limit.to_string())])
            .await
    }

    async fn get_latest(
        &self,
        user: &UserId,
        parent_id: &EntityId,
        limit: usize,
    ) -> Result<Vec<CachedMediaItem>> {
        let url = self.build_url(fill(v1::users::LATEST, &[("user_id", user.as_str())]));
        self.get_item_list(
            url,
            vec![
                ("parentId", parent_id.to_string()),
                ("limit", limit.to_string()),
            ],
        )
        .await
    }

    async fn set_favorite(&self, user: &UserId, id: &EntityId, favorite: bool) -> Result<UserData> {
        self.toggle(v1::user_data::FAVORITE, user, id, favorite).await
    }

    async fn set_played(&self, user: &UserId, id: &EntityId, played: bool) -> Result<UserData> {
        self.toggle(v1::user_data::PLAYED, user, id, played).await
    }

    async fn set_watchlist(
        &self,
        user: &UserId,
        id: &EntityId,
        watchlist: bool,
    ) -> Result<UserData> {
        self.toggle(v1::user_data::WATCHLIST, user, id, watchlist)
            .await
    }

    async fn report_playback_start(&self, _user: &UserId, report: &PlaybackReport) -> Result<()> {
        let url = self.build_url(v1::playback::START);
        self.execute_no_content(|client| client.post(&url).json(report))
            .await
    }

    async fn report_playback_progress(
        &self,
        _user: &UserId,
        report: &PlaybackReport,
    ) -> Result<()> {
        let url = self.build_url(v1::playback::PROGRESS);
        self.execute_no_content(|client| client.post(&url).json(report))
            .await
    }

    async fn report_playback_stopped(&self, _user: &UserId, report: &PlaybackReport) -> Result<()> {
        let url = self.build_url(v1::playback::STOPPED);
        self.execute_no_content(|client| client.post(&url).json(report))
            .await
    }
}

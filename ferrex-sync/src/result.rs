//! Result wrapper for remote calls.
//!
//! Every remote operation surfaces as an [`ApiResult`]; nothing in the
//! caller-facing surface returns a bare error or panics on failure.
//! [`safe_api_call`] is the single place where raw errors are classified
//! and where the offline fast path lives.

use std::future::Future;

use crate::connectivity::ConnectivityMonitor;
use crate::error::SyncError;

/// Outcome of a remote (or cache-backed) operation.
#[derive(Debug, Clone, PartialEq)]
pub enum ApiResult<T> {
    Success(T),
    Error(SyncError),
    /// The operation has been accepted but has not resolved yet.
    Loading,
}

impl<T> ApiResult<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, ApiResult::Success(_))
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ApiResult::Error(_))
    }

    pub fn is_loading(&self) -> bool {
        matches!(self, ApiResult::Loading)
    }

    pub fn ok(self) -> Option<T> {
        match self {
            ApiResult::Success(value) => Some(value),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&SyncError> {
        match self {
            ApiResult::Error(err) => Some(err),
            _ => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> ApiResult<U> {
        match self {
            ApiResult::Success(value) => ApiResult::Success(f(value)),
            ApiResult::Error(err) => ApiResult::Error(err),
            ApiResult::Loading => ApiResult::Loading,
        }
    }

    /// Collapse into a `Result`; `Loading` becomes an `Unknown` error.
    pub fn into_result(self) -> Result<T, SyncError> {
        match self {
            ApiResult::Success(value) => Ok(value),
            ApiResult::Error(err) => Err(err),
            ApiResult::Loading => Err(SyncError::Unknown(
                "operation has not completed".to_string(),
            )),
        }
    }
}

impl<T> From<Result<T, SyncError>> for ApiResult<T> {
    fn from(value: Result<T, SyncError>) -> Self {
        match value {
            Ok(v) => ApiResult::Success(v),
            Err(e) => ApiResult::Error(e),
        }
    }
}

/// Wrap one remote operation.
///
/// When the server is known unreachable the call is not attempted: a
/// `cached` value short-circuits to `Success`, otherwise the result is
/// `Error(Network)`. Online failures are classified into [`SyncError`].
pub async fn safe_api_call<T, F, Fut>(
    connectivity: &ConnectivityMonitor,
    cached: Option<T>,
    call: F,
) -> ApiResult<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    if !connectivity.is_online() {
        return match cached {
            Some(value) => {
                log::debug!("[SafeApiCall] Offline, serving cached value");
                ApiResult::Success(value)
            }
            None => {
                log::debug!("[SafeApiCall] Offline with no cached value");
                ApiResult::Error(SyncError::offline())
            }
        };
    }

    match call().await {
        Ok(value) => ApiResult::Success(value),
        Err(err) => {
            let classified = SyncError::classify(&err);
            log::warn!("[SafeApiCall] Remote call failed: {}", classified);
            ApiResult::Error(classified)
        }
    }
}

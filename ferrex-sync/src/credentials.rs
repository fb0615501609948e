use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::{Mutex, RwLock};

use crate::error::SyncError;

/// Bearer token presented to the media server.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken(String);

impl AccessToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.0)
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AccessToken(<redacted>)")
    }
}

/// Callback for token refresh
pub type RefreshTokenCallback =
    Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<AccessToken>> + Send + Sync>;

struct CredentialsInner {
    token: RwLock<Option<AccessToken>>,
    refresh_callback: RwLock<Option<RefreshTokenCallback>>,
    /// Held for the duration of one refresh.
    refresh_gate: Mutex<()>,
    refreshes: AtomicU64,
}

/// Session token shared by the HTTP client and the event stream.
///
/// Tokens are never minted here: a caller-supplied callback produces new
/// ones. [`Credentials::refresh`] is single-flight, so any number of
/// concurrent auth failures produce one callback invocation.
#[derive(Clone)]
pub struct Credentials {
    inner: Arc<CredentialsInner>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field(
                "has_token",
                &self
                    .inner
                    .token
                    .try_read()
                    .map(|t| t.is_some())
                    .unwrap_or(false),
            )
            .field("refreshes", &self.refresh_count())
            .finish()
    }
}

impl Default for Credentials {
    fn default() -> Self {
        Self::new(None)
    }
}

impl Credentials {
    pub fn new(token: Option<AccessToken>) -> Self {
        Self {
            inner: Arc::new(CredentialsInner {
                token: RwLock::new(token),
                refresh_callback: RwLock::new(None),
                refresh_gate: Mutex::new(()),
                refreshes: AtomicU64::new(0),
            }),
        }
    }

    pub async fn token(&self) -> Option<AccessToken> {
        self.inner.token.read().await.clone()
    }

    pub async fn set_token(&self, token: Option<AccessToken>) {
        *self.inner.token.write().await = token;
    }

    /// Set the token refresh callback
    pub async fn set_refresh_callback<F, Fut>(&self, callback: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<AccessToken>> + Send + 'static,
    {
        let boxed: RefreshTokenCallback = Arc::new(move || callback().boxed());
        *self.inner.refresh_callback.write().await = Some(boxed);
    }

    /// Obtain a token newer than `stale`.
    ///
    /// If another caller already replaced `stale` while this one waited,
    /// the current token is returned without calling the callback again.
    /// A failed refresh clears the token.
    pub async fn refresh(&self, stale: Option<&AccessToken>) -> Result<AccessToken, SyncError> {
        let _gate = self.inner.refresh_gate.lock().await;

        if let Some(current) = self.token().await
            && Some(&current) != stale
        {
            log::debug!("[Credentials] Token already refreshed by another caller");
            return Ok(current);
        }

        let Some(callback) = self.inner.refresh_callback.read().await.clone() else {
            return Err(SyncError::Auth(
                "session expired and no refresh callback is configured".to_string(),
            ));
        };

        log::info!("[Credentials] Token expired, attempting refresh");
        match callback().await {
            Ok(token) => {
                self.inner.refreshes.fetch_add(1, Ordering::Relaxed);
                self.set_token(Some(token.clone())).await;
                log::info!("[Credentials] Token refreshed successfully");
                Ok(token)
            }
            Err(e) => {
                log::warn!("[Credentials] Token refresh failed: {e:#}");
                self.set_token(None).await;
                Err(SyncError::Auth(format!("token refresh failed: {e:#}")))
            }
        }
    }

    /// Number of successful refreshes performed.
    pub fn refresh_count(&self) -> u64 {
        self.inner.refreshes.load(Ordering::Relaxed)
    }

    /// Forget the token and the refresh callback (sign-out).
    pub async fn clear(&self) {
        *self.inner.token.write().await = None;
        *self.inner.refresh_callback.write().await = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test]
    async fn concurrent_refreshes_invoke_the_callback_once() {
        let stale = AccessToken::new("old");
        let credentials = Credentials::new(Some(stale.clone()));
        let calls = Arc::new(AtomicUsize::new(0));
        {
            let calls = Arc::clone(&calls);
            credentials
                .set_refresh_callback(move || {
                    let calls = Arc::clone(&calls);
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        Ok(AccessToken::new("new"))
                    }
                })
                .await;
        }

        let mut tasks = Vec::new();
        for _ in 0..5 {
            let credentials = credentials.clone();
            let stale = stale.clone();
            tasks.push(tokio::spawn(async move {
                credentials.refresh(Some(&stale)).await
            }));
        }
        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap(), AccessToken::new("new"));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(credentials.refresh_count(), 1);
    }

    #[tokio::test]
    async fn failed_refresh_clears_the_token() {
        let credentials = Credentials::new(Some(AccessToken::new("old")));
        credentials
            .set_refresh_callback(|| async { Err(anyhow::anyhow!("revoked")) })
            .await;

        let err = credentials
            .refresh(Some(&AccessToken::new("old")))
            .await
            .unwrap_err();
        assert!(err.is_auth());
        assert_eq!(credentials.token().await, None);
    }

    #[tokio::test]
    async fn refresh_without_callback_is_an_auth_error() {
        let credentials = Credentials::default();
        assert!(credentials.refresh(None).await.unwrap_err().is_auth());
        assert_eq!(format!("{:?}", AccessToken::new("secret")), "AccessToken(<redacted>)");
    }
}

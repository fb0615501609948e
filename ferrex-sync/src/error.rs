//! Error taxonomy surfaced by every remote and cache operation.

use reqwest::StatusCode;

/// Classified failure of a synchronization operation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    /// Connectivity or transport failure (including "offline with no cache").
    #[error("Network error: {0}")]
    Network(String),

    /// Credentials or session were rejected.
    #[error("Authorization error: {0}")]
    Auth(String),

    /// Bad input, missing configuration or an undecodable payload.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Anything that could not be classified.
    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl SyncError {
    pub fn offline() -> Self {
        SyncError::Network("offline and no cached data available".to_string())
    }

    pub fn is_network(&self) -> bool {
        matches!(self, SyncError::Network(_))
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, SyncError::Auth(_))
    }

    /// Classify an HTTP status that the server answered with.
    pub fn from_status(status: StatusCode, body: impl Into<String>) -> Self {
        let msg = format!("{} {}", status, body.into());
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => SyncError::Auth(msg),
            StatusCode::BAD_REQUEST
            | StatusCode::NOT_FOUND
            | StatusCode::CONFLICT
            | StatusCode::UNPROCESSABLE_ENTITY => SyncError::Validation(msg),
            StatusCode::REQUEST_TIMEOUT
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT => SyncError::Network(msg),
            _ => SyncError::Unknown(msg),
        }
    }

    /// Classify an arbitrary error returned by a remote call.
    pub fn classify(err: &anyhow::Error) -> Self {
        if let Some(sync) = err.downcast_ref::<SyncError>() {
            return sync.clone();
        }
        if let Some(status) = err.downcast_ref::<ApiStatusError>() {
            return SyncError::from_status(status.status, status.body.clone());
        }
        if let Some(req) = err.downcast_ref::<reqwest::Error>() {
            return Self::from_reqwest(req);
        }
        if let Some(json) = err.downcast_ref::<serde_json::Error>() {
            return SyncError::Validation(format!("malformed payload: {json}"));
        }
        if let Some(store) = err.downcast_ref::<StoreError>() {
            return SyncError::from(store.clone());
        }
        if let Some(model) = err.downcast_ref::<ferrex_sync_model::ModelError>() {
            return SyncError::Validation(model.to_string());
        }
        SyncError::Unknown(format!("{err:#}"))
    }

    fn from_reqwest(err: &reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return SyncError::from_status(status, err.to_string());
        }
        if err.is_connect() || err.is_timeout() || err.is_request() {
            return SyncError::Network(err.to_string());
        }
        if err.is_decode() {
            return SyncError::Validation(err.to_string());
        }
        if err.is_builder() {
            return SyncError::Validation(err.to_string());
        }
        SyncError::Unknown(err.to_string())
    }
}

/// Non-success HTTP status returned by the media server.
#[derive(Debug, Clone, thiserror::Error)]
#[error("Request failed with status {status}: {body}")]
pub struct ApiStatusError {
    pub status: StatusCode,
    pub body: String,
}

/// Result type for local store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Local store errors with proper context
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound { entity_type: String, id: String },

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl From<StoreError> for SyncError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { .. } | StoreError::SerializationError(_) => {
                SyncError::Validation(err.to_string())
            }
            StoreError::StorageError(_) => SyncError::Unknown(err.to_string()),
        }
    }
}

impl From<ferrex_sync_model::ModelError> for SyncError {
    fn from(err: ferrex_sync_model::ModelError) -> Self {
        SyncError::Validation(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_map_onto_the_taxonomy() {
        assert!(SyncError::from_status(StatusCode::UNAUTHORIZED, "").is_auth());
        assert!(matches!(
            SyncError::from_status(StatusCode::UNPROCESSABLE_ENTITY, ""),
            SyncError::Validation(_)
        ));
        assert!(SyncError::from_status(StatusCode::SERVICE_UNAVAILABLE, "").is_network());
        assert!(matches!(
            SyncError::from_status(StatusCode::INTERNAL_SERVER_ERROR, ""),
            SyncError::Unknown(_)
        ));
    }

    #[test]
    fn classify_sees_through_anyhow() {
        let err = anyhow::Error::new(ApiStatusError {
            status: StatusCode::FORBIDDEN,
            body: "nope".into(),
        });
        assert!(SyncError::classify(&err).is_auth());

        let err = anyhow::Error::new(SyncError::Network("down".into()));
        assert_eq!(SyncError::classify(&err), SyncError::Network("down".into()));

        let json = serde_json::from_str::<u32>("x").unwrap_err();
        assert!(matches!(
            SyncError::classify(&anyhow::Error::new(json)),
            SyncError::Validation(_)
        ));

        let other = anyhow::anyhow!("boom");
        assert!(matches!(SyncError::classify(&other), SyncError::Unknown(_)));
    }
}

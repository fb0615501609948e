//! Core data model definitions for the Ferrex client synchronization core.
#![allow(missing_docs)]

pub use ::chrono;

pub mod error;
pub mod events;
pub mod ids;
pub mod media;
pub mod pending;
pub mod user_data;

pub use error::{ModelError, Result as ModelResult};
pub use events::{RealtimeEvent, StreamFrame};
pub use ids::{EntityId, UserId};
pub use media::{CachedMediaItem, MediaKind, UserLibrary};
pub use pending::{ActionType, PendingAction, PendingKey};
pub use user_data::{
    PLAYED_THRESHOLD_TICKS, TICKS_PER_SECOND, UserData, ticks_to_seconds,
};

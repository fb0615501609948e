//! # Ferrex Sync
//!
//! Offline-first state synchronization core for Ferrex clients.
//!
//! ## Overview
//!
//! `ferrex-sync` keeps a local cache of library and playback state
//! consistent with a media server under intermittent connectivity:
//!
//! - **Priority dispatch**: remote calls run through a [`RequestDispatcher`]
//!   that favors latency-sensitive work and caps concurrency per server
//! - **Optimistic mutations**: favorite, played and watchlist changes apply
//!   locally at once and are confirmed or rolled back in the background
//! - **Snapshot caches**: resume and next-up lists are served from memory
//!   and refreshed with coalesced fetches
//! - **Realtime events**: a server event stream patches the caches as
//!   playback and library state changes elsewhere
//!
//! ## Architecture
//!
//! - [`orchestrator`]: the caller-facing surface, every operation returning
//!   an [`ApiResult`]
//! - [`session`]: owns one user's services and tears them down on sign-out
//! - [`store`]: the local store collaborator and the cache adapter over it
//! - [`api`]: the remote API collaborator and its HTTP implementation
//! - [`realtime`]: the event stream bridge
//!
//! ## Feature Flags
//!
//! - `testing`: exposes in-memory fakes for the remote API and event stream

pub mod api;
pub mod config;
pub mod connectivity;
pub mod credentials;
pub mod dispatcher;
pub mod error;
pub mod locks;
pub mod orchestrator;
pub mod pending;
pub mod realtime;
pub mod result;
pub mod session;
pub mod snapshot;
pub mod store;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use api::{ApiClient, PlaybackReport, RemoteApi};
pub use config::SyncConfig;
pub use connectivity::ConnectivityMonitor;
pub use credentials::{AccessToken, Credentials};
pub use dispatcher::{DispatchHandle, Priority, RequestDispatcher, ServerKey};
pub use error::{StoreError, SyncError};
pub use orchestrator::{HomeScreenData, SynchronizationOrchestrator};
pub use pending::PendingActionQueue;
pub use realtime::{ConnectionState, EventStreamSource, RealtimeEventBridge};
pub use result::{ApiResult, safe_api_call};
pub use session::{SyncSession, SyncSessionBuilder};
pub use snapshot::VolatileSnapshotStore;
pub use store::{DiskStore, LibraryQuery, LocalCacheStore, LocalStore, MemoryStore};

pub use ferrex_sync_model as model;

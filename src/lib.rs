//! fydf library -- resumable chunked file uploads.
//!
//! Clients split a file into fixed-size chunks and send them in any order,
//! with any parallelism, across any number of interrupted attempts.  The
//! server stages chunks at their byte offsets and promotes the staging
//! file to its permanent name once the last one arrives.
//!
//! - [`upload`] -- the session core: registry, recovery, finalization,
//!   expiry.
//! - [`storage`] -- where bytes live (local filesystem or memory).
//! - [`server`] / [`handlers`] -- the HTTP surface.
//! - [`client`] -- a bounded-concurrency uploader for the HTTP API.

use std::sync::Arc;

pub mod client;
pub mod config;
pub mod errors;
pub mod handlers;
pub mod identity;
pub mod metrics;
pub mod server;
pub mod storage;
pub mod upload;

use crate::config::Config;
use crate::identity::IdentityProvider;
use crate::storage::backend::StorageBackend;
use crate::upload::{SessionLimits, SessionRegistry};

/// Shared application state passed to all handlers via `axum::extract::State`.
pub struct AppState {
    /// Server configuration.
    pub config: Config,
    /// Open upload sessions.
    pub registry: Arc<SessionRegistry>,
    /// Where staging and finalized files live.
    pub storage: Arc<dyn StorageBackend>,
    /// Resolves the owner of each request.
    pub identity: Arc<dyn IdentityProvider>,
}

impl AppState {
    pub fn new(
        config: Config,
        storage: Arc<dyn StorageBackend>,
        identity: Arc<dyn IdentityProvider>,
    ) -> Self {
        let registry = Arc::new(SessionRegistry::new(
            Arc::clone(&storage),
            SessionLimits::from(&config),
        ));
        Self {
            config,
            registry,
            storage,
            identity,
        }
    }
}

//! Update server: token-authenticated Composer feed and plugin telemetry.
//!
//! Library crate so integration tests in `tests/` can build the router
//! over in-process stores.

use std::sync::Arc;

pub mod api;
pub mod archive;
pub mod cache;
pub mod cli;
pub mod config;
pub mod entitlements;
pub mod errors;
pub mod jobs;
pub mod middleware;
pub mod models;
pub mod services;
pub mod store;
pub mod version;

use cache::TieredCache;
use config::Config;
use entitlements::EntitlementStore;
use services::{PackageFeed, TelemetryService, TokenService};
use store::postgres::PgStore;
use store::{TelemetryStore, TokenStore};

/// Shared application state passed to handlers and middleware.
pub struct AppState {
    pub config: Config,
    pub cache: TieredCache,
    pub tokens: TokenService,
    pub feed: PackageFeed,
    pub telemetry: TelemetryService,
    /// Present when backed by Postgres; used by the readiness probe.
    pub db: Option<PgStore>,
}

impl AppState {
    pub fn new(
        config: Config,
        cache: TieredCache,
        token_store: Arc<dyn TokenStore>,
        telemetry_store: Arc<dyn TelemetryStore>,
        entitlements: Arc<dyn EntitlementStore>,
    ) -> Self {
        Self {
            tokens: TokenService::new(token_store, cache.clone(), &config),
            feed: PackageFeed::new(entitlements, cache.clone(), &config),
            telemetry: TelemetryService::new(telemetry_store, cache.clone(), &config),
            cache,
            config,
            db: None,
        }
    }

    pub fn with_database(mut self, db: PgStore) -> Self {
        self.db = Some(db);
        self
    }
}

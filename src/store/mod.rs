//! Persistence seams. Services hold these as trait objects so the HTTP
//! layer, the CLI and the tests can run over Postgres or the in-process
//! store interchangeably.

use async_trait::async_trait;

use crate::models::telemetry::{ErrorSummaryRow, NewEvent, RecentError, ValueCount};
use crate::models::token::{NewToken, Token, TokenSummary};

pub mod memory;
pub mod postgres;

#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Insert unless the owner already holds `max_active` active tokens.
    /// Returns the new id, or `None` when the quota is exhausted.
    async fn insert_within_quota(&self, token: &NewToken, max_active: i64)
        -> anyhow::Result<Option<i64>>;

    /// Exact-hash lookup of a non-revoked token.
    async fn find_active_by_hash(&self, token_hash: &str) -> anyhow::Result<Option<Token>>;

    async fn touch_last_used(&self, id: i64) -> anyhow::Result<()>;

    /// Mark revoked if `id` belongs to `owner_id`. Revoking an already
    /// revoked token succeeds and keeps the original `revoked_at`.
    async fn revoke(&self, id: i64, owner_id: &str) -> anyhow::Result<bool>;

    /// Newest first.
    async fn list_for_owner(
        &self,
        owner_id: &str,
        include_revoked: bool,
    ) -> anyhow::Result<Vec<TokenSummary>>;
}

/// Per-site dimensions reported in usage events: PHP and platform
/// versions from `environment`, plugin version from the indexed column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dimension {
    PhpVersion,
    WpVersion,
    PluginVersion,
}

/// List-valued payload fields counted per distinct site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListField {
    Gateways,
    Addons,
}

impl ListField {
    pub fn payload_path(&self) -> &'static [&'static str] {
        match self {
            ListField::Gateways => &["gateways", "active_gateways"],
            ListField::Addons => &["plugin", "active_addons"],
        }
    }
}

#[async_trait]
pub trait TelemetryStore: Send + Sync {
    async fn insert_event(&self, event: &NewEvent) -> anyhow::Result<i64>;

    /// Distinct sites seen in the last `days` days, or ever when `None`.
    async fn unique_sites(&self, days: Option<i32>) -> anyhow::Result<i64>;

    /// Distinct usage-reporting sites per value, count descending.
    async fn distribution(&self, dimension: Dimension, days: i32)
        -> anyhow::Result<Vec<ValueCount>>;

    async fn network_types(&self, days: i32) -> anyhow::Result<Vec<ValueCount>>;

    /// The most recent value of `field` for each distinct usage site.
    async fn latest_lists(&self, field: ListField, days: i32)
        -> anyhow::Result<Vec<serde_json::Value>>;

    async fn error_summary(&self, days: i32, limit: i64) -> anyhow::Result<Vec<ErrorSummaryRow>>;

    async fn recent_errors(&self, limit: i64) -> anyhow::Result<Vec<RecentError>>;

    /// Delete events older than `days` days; returns the number removed.
    async fn purge_older_than(&self, days: i32) -> anyhow::Result<u64>;
}

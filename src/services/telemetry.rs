//! Usage and error reports sent by installed copies of the plugin.
//!
//! Ingestion is append-only and rate limited per site. The read side
//! computes dashboard aggregates over a trailing window of days.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;

use crate::cache::TieredCache;
use crate::config::Config;
use crate::models::telemetry::{DataType, NewEvent, TelemetryStats, ValueCount};
use crate::store::{Dimension, ListField, TelemetryStore};

pub const MIN_DAYS: i64 = 1;
pub const MAX_DAYS: i64 = 365;
pub const DEFAULT_DAYS: i64 = 30;
const ERROR_SUMMARY_LIMIT: i64 = 20;
const RECENT_ERRORS_LIMIT: i64 = 20;
const RATE_KEY_CHARS: usize = 16;
const MAX_COLUMN_CHARS: usize = 64;

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("request body is not valid JSON")]
    InvalidJson,

    #[error("site_hash is required")]
    MissingSiteHash,

    #[error("tracker_version is required")]
    MissingVersion,

    #[error("unknown telemetry type '{0}'")]
    InvalidType(String),

    #[error("too many reports from this site")]
    RateLimited { retry_after_secs: u64 },

    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

pub struct TelemetryService {
    store: Arc<dyn TelemetryStore>,
    cache: TieredCache,
    rate_limit: u64,
    rate_window_secs: u64,
    retention_days: i64,
}

impl TelemetryService {
    pub fn new(store: Arc<dyn TelemetryStore>, cache: TieredCache, config: &Config) -> Self {
        Self {
            store,
            cache,
            rate_limit: config.telemetry_rate_limit,
            rate_window_secs: config.telemetry_rate_window_secs,
            retention_days: config.telemetry_retention_days,
        }
    }

    /// Validate and store one report. `kind` is the `type` query
    /// parameter; absent means usage.
    pub async fn ingest(&self, kind: Option<&str>, body: &[u8]) -> Result<i64, TelemetryError> {
        let data_type = match kind.filter(|k| !k.is_empty()) {
            None => DataType::Usage,
            Some(k) => DataType::parse(k).ok_or_else(|| TelemetryError::InvalidType(k.to_string()))?,
        };

        let payload: Value =
            serde_json::from_slice(body).map_err(|_| TelemetryError::InvalidJson)?;

        let site_hash = text_field(&payload, "site_hash").ok_or(TelemetryError::MissingSiteHash)?;
        let site_hash: String = site_hash.chars().take(MAX_COLUMN_CHARS).collect();

        let rate_key = rate_key(&site_hash);
        let sent = self.cache.count(&rate_key).await?;
        if sent >= self.rate_limit {
            tracing::debug!(site = %rate_key, sent, "telemetry rate limited");
            return Err(TelemetryError::RateLimited {
                retry_after_secs: self.rate_window_secs,
            });
        }

        if text_field(&payload, "tracker_version").is_none() {
            return Err(TelemetryError::MissingVersion);
        }

        let event = NewEvent {
            plugin_version: plugin_version(&payload),
            site_hash,
            data_type,
            payload,
        };
        let id = self.store.insert_event(&event).await?;
        self.cache.increment(&rate_key, self.rate_window_secs).await?;

        tracing::debug!(id, kind = data_type.as_str(), "telemetry event stored");
        Ok(id)
    }

    pub async fn aggregate(&self, days: i64) -> Result<TelemetryStats, TelemetryError> {
        let days = clamp_days(days);
        let window = days as i32;
        let store = &self.store;

        let (unique_sites, total_sites, php, wp, plugin, network) = tokio::try_join!(
            store.unique_sites(Some(window)),
            store.unique_sites(None),
            store.distribution(Dimension::PhpVersion, window),
            store.distribution(Dimension::WpVersion, window),
            store.distribution(Dimension::PluginVersion, window),
            store.network_types(window),
        )?;

        let (gateways, addons, error_summary, recent_errors) = tokio::try_join!(
            store.latest_lists(ListField::Gateways, window),
            store.latest_lists(ListField::Addons, window),
            store.error_summary(window, ERROR_SUMMARY_LIMIT),
            store.recent_errors(RECENT_ERRORS_LIMIT),
        )?;

        Ok(TelemetryStats {
            unique_sites,
            total_sites,
            php_versions: php,
            wp_versions: wp,
            plugin_versions: plugin,
            network_types: network,
            gateways: count_list_usage(&gateways),
            addons: count_list_usage(&addons),
            error_summary,
            recent_errors,
            period_days: days,
        })
    }

    pub async fn purge(&self, older_than_days: i64) -> Result<u64, TelemetryError> {
        let days = older_than_days.clamp(0, i32::MAX as i64) as i32;
        let removed = self.store.purge_older_than(days).await?;
        tracing::info!(rows = removed, days, "purged old telemetry events");
        Ok(removed)
    }

    /// Purge with the configured retention horizon.
    pub async fn purge_expired(&self) -> Result<u64, TelemetryError> {
        self.purge(self.retention_days).await
    }
}

pub fn clamp_days(days: i64) -> i64 {
    days.clamp(MIN_DAYS, MAX_DAYS)
}

fn rate_key(site_hash: &str) -> String {
    let short: String = site_hash.chars().take(RATE_KEY_CHARS).collect();
    format!("rl:telemetry:{}", short)
}

/// Non-empty string (or number) at a top-level key.
fn text_field(payload: &Value, key: &str) -> Option<String> {
    match payload.get(key)? {
        Value::String(s) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn plugin_version(payload: &Value) -> Option<String> {
    ["/plugin/version", "/environment/plugin_version"]
        .iter()
        .find_map(|ptr| match payload.pointer(ptr)? {
            Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
        .map(|v| v.chars().take(MAX_COLUMN_CHARS).collect())
}

/// Flatten one list per site into per-entry site counts. A site naming an
/// entry twice still counts once.
pub fn count_list_usage(per_site: &[Value]) -> Vec<ValueCount> {
    let mut counts: HashMap<&str, i64> = HashMap::new();
    for list in per_site {
        let Some(items) = list.as_array() else { continue };
        let unique: BTreeSet<&str> = items
            .iter()
            .filter_map(Value::as_str)
            .filter(|s| !s.is_empty())
            .collect();
        for item in unique {
            *counts.entry(item).or_default() += 1;
        }
    }

    let mut out: Vec<ValueCount> = counts
        .into_iter()
        .map(|(value, count)| ValueCount::new(value, count))
        .collect();
    out.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.value.cmp(&b.value)));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use chrono::{Duration, Utc};
    use serde_json::json;

    fn service() -> (TelemetryService, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let svc = TelemetryService::new(store.clone(), TieredCache::local_only(), &Config::default());
        (svc, store)
    }

    fn usage(site: &str, php: &str) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "site_hash": site,
            "tracker_version": "1.0.0",
            "environment": {"php_version": php, "wp_version": "6.5"},
            "plugin": {"version": "2.3.0"},
        }))
        .unwrap()
    }

    #[test]
    fn test_clamp_days() {
        assert_eq!(clamp_days(0), 1);
        assert_eq!(clamp_days(-4), 1);
        assert_eq!(clamp_days(30), 30);
        assert_eq!(clamp_days(9999), 365);
    }

    #[test]
    fn test_rate_key_uses_first_sixteen_chars() {
        assert_eq!(rate_key("0123456789abcdefXYZ"), "rl:telemetry:0123456789abcdef");
        assert_eq!(rate_key("short"), "rl:telemetry:short");
    }

    #[test]
    fn test_plugin_version_fallback_path() {
        assert_eq!(
            plugin_version(&json!({"plugin": {"version": "2.0"}, "environment": {"plugin_version": "1.0"}})).as_deref(),
            Some("2.0")
        );
        assert_eq!(
            plugin_version(&json!({"environment": {"plugin_version": "1.0"}})).as_deref(),
            Some("1.0")
        );
        assert_eq!(plugin_version(&json!({"plugin": {}})), None);
    }

    #[test]
    fn test_list_usage_counts_each_site_once_per_entry() {
        let lists = vec![
            json!(["stripe", "paypal", "manual"]),
            json!(["stripe", "stripe"]),
            json!("not-a-list"),
            json!(["paypal"]),
        ];
        let got = count_list_usage(&lists);
        assert_eq!(
            got,
            vec![
                ValueCount::new("paypal", 2),
                ValueCount::new("stripe", 2),
                ValueCount::new("manual", 1),
            ]
        );
    }

    #[tokio::test]
    async fn test_ingest_validation_order() {
        let (svc, _) = service();
        assert!(matches!(
            svc.ingest(Some("bogus"), b"{}").await,
            Err(TelemetryError::InvalidType(_))
        ));
        assert!(matches!(svc.ingest(None, b"{not json").await, Err(TelemetryError::InvalidJson)));
        assert!(matches!(
            svc.ingest(None, br#"{"tracker_version":"1"}"#).await,
            Err(TelemetryError::MissingSiteHash)
        ));
        assert!(matches!(
            svc.ingest(None, br#"{"site_hash":"  "}"#).await,
            Err(TelemetryError::MissingSiteHash)
        ));
        assert!(matches!(
            svc.ingest(None, br#"{"site_hash":"abc"}"#).await,
            Err(TelemetryError::MissingVersion)
        ));
    }

    #[tokio::test]
    async fn test_ingest_stores_type_and_plugin_version() {
        let (svc, store) = service();
        let id = svc.ingest(Some("error"), &usage("site-a", "8.1")).await.unwrap();
        assert_eq!(id, 1);
        assert_eq!(store.event_count().await, 1);

        let recent = store.recent_errors(10).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].plugin_version.as_deref(), Some("2.3.0"));
    }

    #[tokio::test]
    async fn test_site_rate_limit_after_ten_events() {
        let (svc, _) = service();
        for _ in 0..10 {
            svc.ingest(None, &usage("site-a", "8.1")).await.unwrap();
        }
        assert!(matches!(
            svc.ingest(None, &usage("site-a", "8.1")).await,
            Err(TelemetryError::RateLimited { retry_after_secs: 3600 })
        ));
        svc.ingest(None, &usage("site-b", "8.1")).await.unwrap();
    }

    #[tokio::test]
    async fn test_rejected_reports_do_not_consume_quota() {
        let (svc, _) = service();
        for _ in 0..20 {
            let _ = svc.ingest(None, br#"{"site_hash":"site-a"}"#).await;
        }
        svc.ingest(None, &usage("site-a", "8.1")).await.unwrap();
    }

    #[tokio::test]
    async fn test_php_distribution_counts_distinct_sites() {
        let (svc, _) = service();
        svc.ingest(None, &usage("site-a", "8.1")).await.unwrap();
        svc.ingest(None, &usage("site-a", "8.1")).await.unwrap();
        svc.ingest(None, &usage("site-b", "8.1")).await.unwrap();
        svc.ingest(None, &usage("site-c", "8.2")).await.unwrap();

        let stats = svc.aggregate(30).await.unwrap();
        assert_eq!(stats.unique_sites, 3);
        assert_eq!(
            stats.php_versions,
            vec![ValueCount::new("8.1", 2), ValueCount::new("8.2", 1)]
        );
        assert_eq!(stats.plugin_versions, vec![ValueCount::new("2.3.0", 3)]);
        assert_eq!(stats.network_types, vec![ValueCount::new("Subdirectory", 3)]);
        assert_eq!(stats.period_days, 30);
    }

    #[tokio::test]
    async fn test_aggregate_window_and_clamping() {
        let (svc, store) = service();
        let old = NewEvent {
            site_hash: "old-site".into(),
            data_type: DataType::Usage,
            plugin_version: None,
            payload: json!({"environment": {"php_version": "7.4"}}),
        };
        store
            .insert_event_at(&old, Utc::now() - Duration::days(10))
            .await
            .unwrap();
        svc.ingest(None, &usage("new-site", "8.3")).await.unwrap();

        let stats = svc.aggregate(0).await.unwrap();
        assert_eq!(stats.period_days, 1);
        assert_eq!(stats.unique_sites, 1);
        assert_eq!(stats.total_sites, 2);
        assert_eq!(stats.php_versions, vec![ValueCount::new("8.3", 1)]);

        let stats = svc.aggregate(9999).await.unwrap();
        assert_eq!(stats.period_days, 365);
        assert_eq!(stats.unique_sites, 2);
    }

    #[tokio::test]
    async fn test_gateways_use_latest_report_per_site() {
        let (svc, store) = service();
        let report = |gateways: Value| NewEvent {
            site_hash: "site-a".into(),
            data_type: DataType::Usage,
            plugin_version: None,
            payload: json!({"gateways": {"active_gateways": gateways}}),
        };
        store
            .insert_event_at(&report(json!(["paypal"])), Utc::now() - Duration::days(2))
            .await
            .unwrap();
        store.insert_event(&report(json!(["stripe", "manual"]))).await.unwrap();

        let stats = svc.aggregate(30).await.unwrap();
        assert_eq!(
            stats.gateways,
            vec![ValueCount::new("manual", 1), ValueCount::new("stripe", 1)]
        );
    }

    #[tokio::test]
    async fn test_error_summary_groups_by_handle_and_message_prefix() {
        let (svc, _) = service();
        let long = "x".repeat(150);
        for (site, handle, message) in [
            ("s1", "checkout", long.clone()),
            ("s2", "checkout", format!("{}tail", long)),
            ("s3", "cron", "boom".to_string()),
        ] {
            let body = serde_json::to_vec(&json!({
                "site_hash": site,
                "tracker_version": "1",
                "handle": handle,
                "message": message,
            }))
            .unwrap();
            svc.ingest(Some("error"), &body).await.unwrap();
        }

        let stats = svc.aggregate(7).await.unwrap();
        assert_eq!(stats.error_summary.len(), 2);
        assert_eq!(stats.error_summary[0].handle.as_deref(), Some("checkout"));
        assert_eq!(stats.error_summary[0].count, 2);
        assert_eq!(stats.error_summary[0].message_preview.as_ref().map(|m| m.len()), Some(100));
        assert_eq!(stats.recent_errors.len(), 3);
    }

    #[tokio::test]
    async fn test_purge_uses_retention() {
        let (svc, store) = service();
        let event = NewEvent {
            site_hash: "s".into(),
            data_type: DataType::Usage,
            plugin_version: None,
            payload: json!({}),
        };
        store
            .insert_event_at(&event, Utc::now() - Duration::days(91))
            .await
            .unwrap();
        store
            .insert_event_at(&event, Utc::now() - Duration::days(89))
            .await
            .unwrap();
        assert_eq!(svc.purge_expired().await.unwrap(), 1);
        assert_eq!(store.event_count().await, 1);
    }
}

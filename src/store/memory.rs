//! In-process store with the same observable semantics as `PgStore`.
//! Used by the test suites and for running the server without Postgres.

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;

use super::{Dimension, ListField, TelemetryStore, TokenStore};
use crate::models::telemetry::{
    DataType, ErrorSummaryRow, NewEvent, RecentError, TelemetryEvent, ValueCount,
};
use crate::models::token::{NewToken, Token, TokenSummary};

#[derive(Default)]
pub struct MemoryStore {
    tokens: RwLock<Vec<Token>>,
    events: RwLock<Vec<TelemetryEvent>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an event with an explicit timestamp (backfills, tests).
    pub async fn insert_event_at(
        &self,
        event: &NewEvent,
        created_at: DateTime<Utc>,
    ) -> anyhow::Result<i64> {
        let mut events = self.events.write().await;
        let id = events.last().map(|e| e.id + 1).unwrap_or(1);
        events.push(TelemetryEvent {
            id,
            site_hash: event.site_hash.clone(),
            data_type: event.data_type,
            plugin_version: event.plugin_version.clone(),
            payload: event.payload.clone(),
            created_at,
        });
        Ok(id)
    }

    /// Snapshot of every stored token row, hashes included.
    pub async fn dump_tokens(&self) -> Vec<Token> {
        self.tokens.read().await.clone()
    }

    pub async fn event_count(&self) -> usize {
        self.events.read().await.len()
    }
}

/// Text value at `path`, mirroring Postgres `#>>`: strings verbatim,
/// scalars rendered, null or missing as `None`.
pub(crate) fn text_at(payload: &serde_json::Value, path: &[&str]) -> Option<String> {
    let mut cur = payload;
    for key in path {
        cur = cur.get(key)?;
    }
    match cur {
        serde_json::Value::Null => None,
        serde_json::Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn within(event: &TelemetryEvent, days: i32) -> bool {
    event.created_at >= Utc::now() - Duration::days(days as i64)
}

/// Distinct sites per value, count descending then value ascending.
fn distinct_site_counts<'a>(pairs: impl Iterator<Item = (String, &'a str)>) -> Vec<ValueCount> {
    let mut sites: HashMap<String, HashSet<&'a str>> = HashMap::new();
    for (value, site) in pairs {
        sites.entry(value).or_default().insert(site);
    }
    let mut out: Vec<ValueCount> = sites
        .into_iter()
        .map(|(value, s)| ValueCount::new(value, s.len() as i64))
        .collect();
    out.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.value.cmp(&b.value)));
    out
}

#[async_trait]
impl TokenStore for MemoryStore {
    async fn insert_within_quota(
        &self,
        token: &NewToken,
        max_active: i64,
    ) -> anyhow::Result<Option<i64>> {
        let mut tokens = self.tokens.write().await;

        if tokens.iter().any(|t| t.token_hash == token.token_hash) {
            anyhow::bail!("duplicate token hash");
        }

        let active = tokens
            .iter()
            .filter(|t| t.owner_id == token.owner_id && t.is_active())
            .count() as i64;
        if active >= max_active {
            return Ok(None);
        }

        let id = tokens.last().map(|t| t.id + 1).unwrap_or(1);
        tokens.push(Token {
            id,
            owner_id: token.owner_id.clone(),
            token_hash: token.token_hash.clone(),
            token_prefix: token.token_prefix.clone(),
            name: token.name.clone(),
            last_used_at: None,
            created_at: Utc::now(),
            revoked_at: None,
        });
        Ok(Some(id))
    }

    async fn find_active_by_hash(&self, token_hash: &str) -> anyhow::Result<Option<Token>> {
        let tokens = self.tokens.read().await;
        Ok(tokens
            .iter()
            .find(|t| t.token_hash == token_hash && t.is_active())
            .cloned())
    }

    async fn touch_last_used(&self, id: i64) -> anyhow::Result<()> {
        let mut tokens = self.tokens.write().await;
        if let Some(t) = tokens.iter_mut().find(|t| t.id == id) {
            t.last_used_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn revoke(&self, id: i64, owner_id: &str) -> anyhow::Result<bool> {
        let mut tokens = self.tokens.write().await;
        match tokens.iter_mut().find(|t| t.id == id && t.owner_id == owner_id) {
            Some(t) => {
                t.revoked_at.get_or_insert_with(Utc::now);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list_for_owner(
        &self,
        owner_id: &str,
        include_revoked: bool,
    ) -> anyhow::Result<Vec<TokenSummary>> {
        let tokens = self.tokens.read().await;
        let mut out: Vec<TokenSummary> = tokens
            .iter()
            .filter(|t| t.owner_id == owner_id && (include_revoked || t.is_active()))
            .cloned()
            .map(TokenSummary::from)
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        Ok(out)
    }
}

#[async_trait]
impl TelemetryStore for MemoryStore {
    async fn insert_event(&self, event: &NewEvent) -> anyhow::Result<i64> {
        self.insert_event_at(event, Utc::now()).await
    }

    async fn unique_sites(&self, days: Option<i32>) -> anyhow::Result<i64> {
        let events = self.events.read().await;
        let sites: HashSet<&str> = events
            .iter()
            .filter(|e| days.map_or(true, |d| within(e, d)))
            .map(|e| e.site_hash.as_str())
            .collect();
        Ok(sites.len() as i64)
    }

    async fn distribution(
        &self,
        dimension: Dimension,
        days: i32,
    ) -> anyhow::Result<Vec<ValueCount>> {
        let events = self.events.read().await;
        let pairs = events
            .iter()
            .filter(|e| e.data_type == DataType::Usage && within(e, days))
            .filter_map(|e| {
                let value = match dimension {
                    Dimension::PhpVersion => text_at(&e.payload, &["environment", "php_version"]),
                    Dimension::WpVersion => text_at(&e.payload, &["environment", "wp_version"]),
                    Dimension::PluginVersion => e.plugin_version.clone(),
                }?;
                Some((value, e.site_hash.as_str()))
            });
        Ok(distinct_site_counts(pairs))
    }

    async fn network_types(&self, days: i32) -> anyhow::Result<Vec<ValueCount>> {
        let events = self.events.read().await;
        let pairs = events
            .iter()
            .filter(|e| e.data_type == DataType::Usage && within(e, days))
            .map(|e| {
                let subdomain =
                    text_at(&e.payload, &["network", "is_subdomain"]).as_deref() == Some("true");
                let label = if subdomain { "Subdomain" } else { "Subdirectory" };
                (label.to_string(), e.site_hash.as_str())
            });
        Ok(distinct_site_counts(pairs))
    }

    async fn latest_lists(
        &self,
        field: ListField,
        days: i32,
    ) -> anyhow::Result<Vec<serde_json::Value>> {
        let events = self.events.read().await;
        let mut latest: BTreeMap<&str, &TelemetryEvent> = BTreeMap::new();
        for e in events
            .iter()
            .filter(|e| e.data_type == DataType::Usage && within(e, days))
        {
            let newer = latest
                .get(e.site_hash.as_str())
                .map_or(true, |cur| (e.created_at, e.id) > (cur.created_at, cur.id));
            if newer {
                latest.insert(e.site_hash.as_str(), e);
            }
        }

        Ok(latest
            .values()
            .filter_map(|e| {
                let mut cur = &e.payload;
                for key in field.payload_path() {
                    cur = cur.get(key)?;
                }
                Some(cur.clone())
            })
            .collect())
    }

    async fn error_summary(&self, days: i32, limit: i64) -> anyhow::Result<Vec<ErrorSummaryRow>> {
        let events = self.events.read().await;
        let mut groups: HashMap<(Option<String>, Option<String>), (i64, DateTime<Utc>)> =
            HashMap::new();
        for e in events
            .iter()
            .filter(|e| e.data_type == DataType::Error && within(e, days))
        {
            let handle = text_at(&e.payload, &["handle"]);
            let preview = text_at(&e.payload, &["message"]).map(|m| m.chars().take(100).collect());
            let slot = groups.entry((handle, preview)).or_insert((0, e.created_at));
            slot.0 += 1;
            slot.1 = slot.1.max(e.created_at);
        }

        let mut rows: Vec<ErrorSummaryRow> = groups
            .into_iter()
            .map(|((handle, message_preview), (count, last_seen))| ErrorSummaryRow {
                handle,
                message_preview,
                count,
                last_seen,
            })
            .collect();
        rows.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| b.last_seen.cmp(&a.last_seen)));
        rows.truncate(limit.max(0) as usize);
        Ok(rows)
    }

    async fn recent_errors(&self, limit: i64) -> anyhow::Result<Vec<RecentError>> {
        let events = self.events.read().await;
        let mut errors: Vec<&TelemetryEvent> = events
            .iter()
            .filter(|e| e.data_type == DataType::Error)
            .collect();
        errors.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));
        Ok(errors
            .into_iter()
            .take(limit.max(0) as usize)
            .map(|e| RecentError {
                id: e.id,
                site_hash: e.site_hash.clone(),
                plugin_version: e.plugin_version.clone(),
                handle: text_at(&e.payload, &["handle"]),
                message: text_at(&e.payload, &["message"]),
                created_at: e.created_at,
            })
            .collect())
    }

    async fn purge_older_than(&self, days: i32) -> anyhow::Result<u64> {
        let mut events = self.events.write().await;
        let cutoff = Utc::now() - Duration::days(days as i64);
        let before = events.len();
        events.retain(|e| e.created_at >= cutoff);
        Ok((before - events.len()) as u64)
    }
}

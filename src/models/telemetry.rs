use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Usage,
    Error,
}

impl DataType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Usage => "usage",
            DataType::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "usage" => Some(DataType::Usage),
            "error" => Some(DataType::Error),
            _ => None,
        }
    }
}

/// Append-only telemetry row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryEvent {
    pub id: i64,
    pub site_hash: String,
    pub data_type: DataType,
    pub plugin_version: Option<String>,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewEvent {
    pub site_hash: String,
    pub data_type: DataType,
    pub plugin_version: Option<String>,
    pub payload: serde_json::Value,
}

/// One bucket of a distribution: how many distinct sites report `value`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ValueCount {
    pub value: String,
    pub count: i64,
}

impl ValueCount {
    pub fn new(value: impl Into<String>, count: i64) -> Self {
        Self {
            value: value.into(),
            count,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ErrorSummaryRow {
    pub handle: Option<String>,
    pub message_preview: Option<String>,
    pub count: i64,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct RecentError {
    pub id: i64,
    pub site_hash: String,
    pub plugin_version: Option<String>,
    pub handle: Option<String>,
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Dashboard aggregate over a trailing window of `period_days`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryStats {
    pub unique_sites: i64,
    pub total_sites: i64,
    pub php_versions: Vec<ValueCount>,
    pub wp_versions: Vec<ValueCount>,
    pub plugin_versions: Vec<ValueCount>,
    pub network_types: Vec<ValueCount>,
    pub gateways: Vec<ValueCount>,
    pub addons: Vec<ValueCount>,
    pub error_summary: Vec<ErrorSummaryRow>,
    pub recent_errors: Vec<RecentError>,
    pub period_days: i64,
}

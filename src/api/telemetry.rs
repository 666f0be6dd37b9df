use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::errors::AppError;
use crate::models::telemetry::TelemetryStats;
use crate::services::telemetry::DEFAULT_DAYS;
use crate::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct TrackQuery {
    #[serde(rename = "type")]
    pub kind: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct StatsQuery {
    pub days: Option<String>,
}

/// POST /telemetry/track?type=usage|error
pub async fn track(
    State(state): State<Arc<AppState>>,
    Query(q): Query<TrackQuery>,
    body: Bytes,
) -> Result<(StatusCode, Json<Value>), AppError> {
    let id = state.telemetry.ingest(q.kind.as_deref(), &body).await?;
    Ok((StatusCode::CREATED, Json(json!({ "success": true, "id": id }))))
}

/// GET /telemetry/stats?days=N
///
/// A non-numeric `days` falls back to the default window; numeric values
/// are clamped by the service.
pub async fn stats(
    State(state): State<Arc<AppState>>,
    Query(q): Query<StatsQuery>,
) -> Result<Json<TelemetryStats>, AppError> {
    let days = q
        .days
        .as_deref()
        .and_then(|d| d.trim().parse::<i64>().ok())
        .unwrap_or(DEFAULT_DAYS);
    Ok(Json(state.telemetry.aggregate(days).await?))
}

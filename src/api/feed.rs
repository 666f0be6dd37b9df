use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::json;

use crate::errors::AppError;
use crate::middleware::client_ip::ClientIp;
use crate::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct FeedQuery {
    pub token: Option<String>,
    pub prerelease: Option<String>,
}

/// Bearer header first, then `?token=`.
fn presented_token<'a>(headers: &'a HeaderMap, query: &'a FeedQuery) -> Option<&'a str> {
    let from_header = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| {
            let (scheme, rest) = v.trim().split_once(char::is_whitespace)?;
            scheme.eq_ignore_ascii_case("bearer").then(|| rest.trim())
        })
        .filter(|t| !t.is_empty());

    from_header.or_else(|| query.token.as_deref().map(str::trim).filter(|t| !t.is_empty()))
}

async fn authenticate(
    state: &AppState,
    headers: &HeaderMap,
    query: &FeedQuery,
    client_ip: ClientIp,
) -> Result<String, AppError> {
    let raw = presented_token(headers, query).ok_or(AppError::MissingToken)?;
    Ok(state.tokens.validate(raw, client_ip.0).await?)
}

/// GET /packages.json
pub async fn packages(
    State(state): State<Arc<AppState>>,
    client_ip: ClientIp,
    headers: HeaderMap,
    Query(query): Query<FeedQuery>,
) -> Result<Response, AppError> {
    let owner_id = authenticate(&state, &headers, &query, client_ip).await?;
    let manifest = state.feed.build_feed(&owner_id).await?;

    let cache_control = format!("private, max-age={}", state.config.feed_max_age_secs);
    Ok(([(header::CACHE_CONTROL, cache_control)], Json(manifest)).into_response())
}

/// GET /downloads/:sku/:version
pub async fn download(
    State(state): State<Arc<AppState>>,
    Path((sku, version)): Path<(String, String)>,
    client_ip: ClientIp,
    headers: HeaderMap,
    Query(query): Query<FeedQuery>,
) -> Result<Response, AppError> {
    let owner_id = authenticate(&state, &headers, &query, client_ip).await?;
    let include_prerelease = matches!(query.prerelease.as_deref(), Some("1" | "true"));

    let url = state
        .feed
        .download_url_for(&owner_id, &sku, &version, include_prerelease)
        .await?;

    tracing::info!(owner = %owner_id, sku = %sku, version = %version, "download redirect");
    Ok((StatusCode::FOUND, [(header::LOCATION, url)]).into_response())
}

/// POST /api/v1/products/:product_id/invalidate
pub async fn invalidate_product(
    State(state): State<Arc<AppState>>,
    Path(product_id): Path<i64>,
) -> Result<Json<serde_json::Value>, AppError> {
    state.feed.invalidate(product_id).await?;
    Ok(Json(json!({ "invalidated": true, "product_id": product_id })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn query(token: Option<&str>) -> FeedQuery {
        FeedQuery {
            token: token.map(String::from),
            prerelease: None,
        }
    }

    #[test]
    fn test_bearer_header_wins_over_query() {
        let mut h = HeaderMap::new();
        h.insert(header::AUTHORIZATION, HeaderValue::from_static("bearer  wu_tk_header "));
        assert_eq!(presented_token(&h, &query(Some("wu_tk_query"))), Some("wu_tk_header"));
    }

    #[test]
    fn test_query_fallback() {
        let mut h = HeaderMap::new();
        h.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(presented_token(&h, &query(Some("wu_tk_query"))), Some("wu_tk_query"));
        assert_eq!(presented_token(&HeaderMap::new(), &query(Some("  "))), None);
        assert_eq!(presented_token(&HeaderMap::new(), &query(None)), None);
    }
}

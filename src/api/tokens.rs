use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::AppError;
use crate::models::token::TokenSummary;
use crate::services::tokens::TokenError;
use crate::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub include_revoked: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct CreateTokenRequest {
    pub name: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct TokenListResponse {
    pub tokens: Vec<TokenSummary>,
}

#[derive(Debug, Serialize)]
pub struct CreateTokenResponse {
    /// Shown once; only the hash is kept.
    pub token: String,
    pub id: i64,
    pub prefix: String,
    pub tokens: Vec<TokenSummary>,
}

/// GET /api/v1/owners/:owner_id/tokens
pub async fn list_tokens(
    State(state): State<Arc<AppState>>,
    Path(owner_id): Path<String>,
    Query(q): Query<ListQuery>,
) -> Result<Json<TokenListResponse>, AppError> {
    let tokens = state.tokens.list(&owner_id, q.include_revoked).await?;
    Ok(Json(TokenListResponse { tokens }))
}

/// POST /api/v1/owners/:owner_id/tokens
///
/// The body is optional; an empty one means "no name".
pub async fn create_token(
    State(state): State<Arc<AppState>>,
    Path(owner_id): Path<String>,
    body: Bytes,
) -> Result<(StatusCode, Json<CreateTokenResponse>), AppError> {
    let req = parse_create_request(&body)?;

    let generated = state.tokens.generate(&owner_id, req.name.as_deref()).await?;
    let tokens = state.tokens.list(&owner_id, false).await?;

    Ok((
        StatusCode::CREATED,
        Json(CreateTokenResponse {
            token: generated.secret.to_string(),
            id: generated.id,
            prefix: generated.prefix,
            tokens,
        }),
    ))
}

/// POST /api/v1/owners/:owner_id/tokens/revoke
pub async fn revoke_token(
    State(state): State<Arc<AppState>>,
    Path(owner_id): Path<String>,
    body: Bytes,
) -> Result<Json<TokenListResponse>, AppError> {
    let token_id = parse_token_id(&body)
        .ok_or_else(|| AppError::validation("invalid_token_id", "token_id is required"))?;

    match state.tokens.revoke(token_id, &owner_id).await {
        Ok(()) => {}
        Err(TokenError::NotFound) => {
            return Err(AppError::validation("invalid_token_id", "token not found"));
        }
        Err(e) => return Err(e.into()),
    }

    let tokens = state.tokens.list(&owner_id, false).await?;
    Ok(Json(TokenListResponse { tokens }))
}

fn parse_create_request(body: &[u8]) -> Result<CreateTokenRequest, AppError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(CreateTokenRequest::default());
    }
    serde_json::from_slice(body)
        .map_err(|_| AppError::validation("invalid_json", "request body must be a JSON object"))
}

/// `token_id` as a JSON number or a numeric string.
fn parse_token_id(body: &[u8]) -> Option<i64> {
    let v: Value = serde_json::from_slice(body).ok()?;
    let id = match v.get("token_id")? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    };
    id.filter(|id| *id > 0)
}

use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::services::feed::FeedError;
use crate::services::telemetry::TelemetryError;
use crate::services::tokens::TokenError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("missing token")]
    MissingToken,

    /// Every credential failure collapses here so callers cannot tell a
    /// malformed token from a revoked or unknown one.
    #[error("invalid token")]
    InvalidToken,

    #[error("rate limit exceeded")]
    RateLimited { retry_after_secs: u64 },

    #[error("{message}")]
    Validation { code: &'static str, message: String },

    #[error("{0}")]
    QuotaExceeded(String),

    #[error("not found")]
    NotFound,

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    pub fn validation(code: &'static str, message: impl Into<String>) -> Self {
        AppError::Validation {
            code,
            message: message.into(),
        }
    }
}

impl From<TokenError> for AppError {
    fn from(e: TokenError) -> Self {
        match e {
            TokenError::RateLimited { retry_after_secs } => {
                AppError::RateLimited { retry_after_secs }
            }
            TokenError::InvalidFormat | TokenError::NotFound => AppError::InvalidToken,
            TokenError::QuotaExceeded(max) => {
                AppError::QuotaExceeded(format!("active token quota of {} reached", max))
            }
            TokenError::Storage(inner) => AppError::Internal(inner),
        }
    }
}

impl From<TelemetryError> for AppError {
    fn from(e: TelemetryError) -> Self {
        let message = e.to_string();
        match e {
            TelemetryError::InvalidJson => AppError::validation("invalid_json", message),
            TelemetryError::MissingSiteHash => AppError::validation("missing_site_hash", message),
            TelemetryError::MissingVersion => AppError::validation("missing_version", message),
            TelemetryError::InvalidType(_) => AppError::validation("invalid_type", message),
            TelemetryError::RateLimited { retry_after_secs } => {
                AppError::RateLimited { retry_after_secs }
            }
            TelemetryError::Storage(inner) => AppError::Internal(inner),
        }
    }
}

impl From<FeedError> for AppError {
    fn from(e: FeedError) -> Self {
        match e {
            FeedError::NotFound => AppError::NotFound,
            FeedError::Entitlements(inner) => AppError::Internal(inner),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_type, code, msg) = match &self {
            AppError::MissingToken => (
                StatusCode::UNAUTHORIZED,
                "authentication_error",
                "missing_token",
                "authentication token required".to_string(),
            ),
            AppError::InvalidToken => (
                StatusCode::UNAUTHORIZED,
                "authentication_error",
                "invalid_token",
                "invalid or revoked token".to_string(),
            ),
            AppError::RateLimited { .. } => (
                StatusCode::TOO_MANY_REQUESTS,
                "rate_limit_error",
                "rate_limited",
                "too many requests, try again later".to_string(),
            ),
            AppError::Validation { code, message } => (
                StatusCode::BAD_REQUEST,
                "invalid_request_error",
                *code,
                message.clone(),
            ),
            AppError::QuotaExceeded(message) => (
                StatusCode::BAD_REQUEST,
                "invalid_request_error",
                "quota_exceeded",
                message.clone(),
            ),
            AppError::NotFound => (
                StatusCode::NOT_FOUND,
                "not_found_error",
                "not_found",
                "not found".to_string(),
            ),
            AppError::Internal(e) => {
                tracing::error!("Internal error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "internal",
                    "internal server error".to_string(),
                )
            }
        };

        let body = Json(json!({
            "error": {
                "message": msg,
                "type": error_type,
                "code": code,
            }
        }));

        let mut response = (status, body).into_response();

        if let AppError::RateLimited { retry_after_secs } = self {
            if let Ok(v) = HeaderValue::from_str(&retry_after_secs.to_string()) {
                response.headers_mut().insert("retry-after", v);
            }
        }

        response
    }
}

use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Router,
};
use subtle::ConstantTimeEq;
use tower_http::trace::TraceLayer;

use crate::middleware::headers;
use crate::AppState;

pub mod feed;
pub mod telemetry;
pub mod tokens;

const BODY_LIMIT_BYTES: usize = 1024 * 1024;

/// Full application router. Routes are wired explicitly here; nothing is
/// registered from elsewhere.
pub fn build_router(state: Arc<AppState>) -> Router {
    let admin_only = middleware::from_fn_with_state(state.clone(), admin_auth);

    Router::new()
        // Health endpoints (no auth)
        .route("/healthz", get(|| async { "ok" }))
        .route("/readyz", get(readiness_check))
        // Composer feed (token auth)
        .route("/packages.json", get(feed::packages))
        .route("/downloads/:sku/:version", get(feed::download))
        // Telemetry
        .route("/telemetry/track", post(telemetry::track))
        .route(
            "/telemetry/stats",
            get(telemetry::stats).route_layer(admin_only.clone()),
        )
        // Management API: the storefront calls these on behalf of a
        // logged-in owner.
        .nest("/api/v1", api_router().route_layer(admin_only))
        .fallback(fallback_404)
        .with_state(state)
        .layer(DefaultBodyLimit::max(BODY_LIMIT_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(headers::request_id))
        .layer(middleware::from_fn(headers::security_headers))
}

fn api_router() -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/owners/:owner_id/tokens",
            get(tokens::list_tokens).post(tokens::create_token),
        )
        .route("/owners/:owner_id/tokens/revoke", post(tokens::revoke_token))
        .route(
            "/products/:product_id/invalidate",
            post(feed::invalidate_product),
        )
}

async fn fallback_404() -> StatusCode {
    StatusCode::NOT_FOUND
}

async fn readiness_check(State(state): State<Arc<AppState>>) -> StatusCode {
    match &state.db {
        Some(db) => match db.ping().await {
            Ok(()) => StatusCode::OK,
            Err(e) => {
                tracing::warn!("readiness: database unreachable: {}", e);
                StatusCode::SERVICE_UNAVAILABLE
            }
        },
        None => StatusCode::OK,
    }
}

/// Middleware: validates `X-Admin-Key` (or `Authorization: Bearer`)
/// against the configured admin key in constant time.
async fn admin_auth(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let provided_key = req
        .headers()
        .get("x-admin-key")
        .and_then(|v| v.to_str().ok())
        .or_else(|| {
            req.headers()
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
                .map(|t| t.trim())
        });

    let expected = state.config.admin_key.as_bytes();

    match provided_key.filter(|k| !k.is_empty()) {
        Some(k) if !expected.is_empty() && bool::from(k.as_bytes().ct_eq(expected)) => {
            Ok(next.run(req).await)
        }
        Some(_) => {
            // Never log the expected key or the provided one.
            tracing::warn!(path = %req.uri().path(), "admin API: invalid key");
            Err(StatusCode::UNAUTHORIZED)
        }
        None => {
            tracing::warn!(path = %req.uri().path(), "admin API: missing X-Admin-Key header");
            Err(StatusCode::UNAUTHORIZED)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request as HttpRequest;
    use tower::ServiceExt;

    use crate::cache::TieredCache;
    use crate::config::Config;
    use crate::entitlements::{LinkSigner, StaticEntitlements};
    use crate::store::memory::MemoryStore;

    fn router() -> Router {
        router_with_key("k")
    }

    fn router_with_key(admin_key: &str) -> Router {
        let config = Config {
            admin_key: admin_key.into(),
            ..Config::default()
        };
        let signer = LinkSigner::new("https://store.example.com/", "s").unwrap();
        let store = Arc::new(MemoryStore::new());
        let state = AppState::new(
            config,
            TieredCache::local_only(),
            store.clone(),
            store,
            Arc::new(StaticEntitlements::new(signer)),
        );
        build_router(Arc::new(state))
    }

    async fn status(req: HttpRequest<Body>) -> StatusCode {
        router().oneshot(req).await.unwrap().status()
    }

    #[tokio::test]
    async fn test_admin_key_header_or_bearer() {
        let uri = "/api/v1/owners/1/tokens";
        let get = || HttpRequest::get(uri);

        assert_eq!(status(get().body(Body::empty()).unwrap()).await, StatusCode::UNAUTHORIZED);
        assert_eq!(
            status(get().header("x-admin-key", "nope").body(Body::empty()).unwrap()).await,
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            status(get().header("x-admin-key", "k").body(Body::empty()).unwrap()).await,
            StatusCode::OK
        );
        assert_eq!(
            status(get().header("authorization", "Bearer k").body(Body::empty()).unwrap()).await,
            StatusCode::OK
        );
    }

    #[tokio::test]
    async fn test_empty_keys_never_authenticate() {
        for configured in ["", "k"] {
            for header in [("x-admin-key", ""), ("authorization", "Bearer "), ("authorization", "Bearer")] {
                let req = HttpRequest::get("/telemetry/stats")
                    .header(header.0, header.1)
                    .body(Body::empty())
                    .unwrap();
                let status = router_with_key(configured).oneshot(req).await.unwrap().status();
                assert_eq!(status, StatusCode::UNAUTHORIZED, "{:?} {:?}", configured, header);
            }
        }
    }

    #[tokio::test]
    async fn test_unknown_route_is_404() {
        let req = HttpRequest::get("/wp-admin").body(Body::empty()).unwrap();
        assert_eq!(status(req).await, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_readiness_without_database() {
        let req = HttpRequest::get("/readyz").body(Body::empty()).unwrap();
        assert_eq!(status(req).await, StatusCode::OK);
    }
}

//! Response headers applied to every route.

use axum::extract::Request;
use axum::http::header::{CACHE_CONTROL, SERVER};
use axum::http::HeaderValue;
use axum::middleware::Next;
use axum::response::Response;

/// Injects a unique X-Request-Id into every response so clients can
/// correlate errors with server logs.
pub async fn request_id(req: Request, next: Next) -> Response {
    let req_id = uuid::Uuid::new_v4().to_string();
    let mut resp = next.run(req).await;
    if let Ok(val) = HeaderValue::from_str(&req_id) {
        resp.headers_mut().insert("x-request-id", val);
    }
    resp
}

/// Hardening headers. `Cache-Control` defaults to `no-store` but a
/// handler that set its own (the package feed) keeps it.
pub async fn security_headers(req: Request, next: Next) -> Response {
    let mut resp = next.run(req).await;
    let headers = resp.headers_mut();

    headers.insert("x-content-type-options", HeaderValue::from_static("nosniff"));
    headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
    headers.insert("referrer-policy", HeaderValue::from_static("no-referrer"));
    headers
        .entry(CACHE_CONTROL)
        .or_insert(HeaderValue::from_static("no-store"));
    headers.remove(SERVER);

    resp
}

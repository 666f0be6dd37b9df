//! Client address resolution for per-IP rate limiting.

use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::async_trait;
use axum::extract::{ConnectInfo, FromRequestParts};
use axum::http::request::Parts;
use axum::http::HeaderMap;

use crate::AppState;

/// Best-known client IP, `None` when neither a trusted header nor the
/// socket peer yields one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientIp(pub Option<IpAddr>);

/// Walk `trusted` headers in priority order and return the first value
/// that parses as an IP. Comma-separated lists (`X-Forwarded-For`)
/// contribute their first entry. Falls back to the connection peer.
pub fn resolve(headers: &HeaderMap, trusted: &[String], peer: Option<SocketAddr>) -> Option<IpAddr> {
    trusted
        .iter()
        .filter_map(|name| headers.get(name.as_str()))
        .filter_map(|v| v.to_str().ok())
        .filter_map(|v| v.split(',').next())
        .find_map(|v| v.trim().parse::<IpAddr>().ok())
        .or_else(|| peer.map(|p| p.ip()))
}

#[async_trait]
impl FromRequestParts<Arc<AppState>> for ClientIp {
    type Rejection = Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);
        Ok(ClientIp(resolve(
            &parts.headers,
            &state.config.trusted_ip_headers,
            peer,
        )))
    }
}

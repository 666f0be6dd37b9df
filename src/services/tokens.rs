//! Composer access tokens.
//!
//! A token is `wu_tk_` followed by 32 characters drawn uniformly from
//! `[a-z0-9]`. Only the SHA-256 hex digest is stored; the raw value is
//! handed back once from `generate` and never persisted or logged. The
//! display prefix (`wu_tk_` plus the first four random characters) is the
//! only part that may appear in listings and logs.

use std::net::IpAddr;
use std::sync::Arc;

use rand::rngs::OsRng;
use rand::Rng;
use sha2::{Digest, Sha256};
use thiserror::Error;
use zeroize::Zeroizing;

use crate::cache::TieredCache;
use crate::config::Config;
use crate::models::token::{NewToken, TokenSummary};
use crate::store::TokenStore;

pub const TOKEN_PREFIX: &str = "wu_tk_";
pub const TOKEN_RANDOM_LEN: usize = 32;
const DISPLAY_CHARS: usize = 4;
const NAME_MAX_CHARS: usize = 255;
const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("too many validation attempts")]
    RateLimited { retry_after_secs: u64 },

    #[error("malformed token")]
    InvalidFormat,

    #[error("token not found")]
    NotFound,

    #[error("active token quota of {0} reached")]
    QuotaExceeded(i64),

    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

/// Result of `generate`. The secret is wiped from memory on drop.
pub struct GeneratedToken {
    pub id: i64,
    pub secret: Zeroizing<String>,
    pub prefix: String,
}

pub struct TokenService {
    store: Arc<dyn TokenStore>,
    cache: TieredCache,
    max_active: i64,
    rate_limit: u64,
    rate_window_secs: u64,
}

impl TokenService {
    pub fn new(store: Arc<dyn TokenStore>, cache: TieredCache, config: &Config) -> Self {
        Self {
            store,
            cache,
            max_active: config.token_max_active,
            rate_limit: config.token_rate_limit,
            rate_window_secs: config.token_rate_window_secs,
        }
    }

    pub async fn generate(
        &self,
        owner_id: &str,
        name: Option<&str>,
    ) -> Result<GeneratedToken, TokenError> {
        let random = random_part();
        let secret = Zeroizing::new(format!("{}{}", TOKEN_PREFIX, random.as_str()));
        let prefix = format!("{}{}", TOKEN_PREFIX, &random.as_str()[..DISPLAY_CHARS]);

        let new_token = NewToken {
            owner_id: owner_id.to_string(),
            token_hash: hash_token(&secret),
            token_prefix: prefix.clone(),
            name: normalize_name(name),
        };

        let id = self
            .store
            .insert_within_quota(&new_token, self.max_active)
            .await?
            .ok_or(TokenError::QuotaExceeded(self.max_active))?;

        tracing::info!(owner = %owner_id, token_id = id, prefix = %prefix, "composer token created");
        Ok(GeneratedToken { id, secret, prefix })
    }

    /// Resolve a presented secret to its owner.
    ///
    /// The per-IP attempt counter is bumped before anything else so that
    /// malformed guesses cost the same as well-formed ones. Without a
    /// client address the limit cannot be applied and is skipped.
    pub async fn validate(
        &self,
        raw: &str,
        client_ip: Option<IpAddr>,
    ) -> Result<String, TokenError> {
        if let Some(ip) = client_ip {
            let key = format!("rl:token:{}", ip);
            let attempts = self.cache.increment(&key, self.rate_window_secs).await?;
            if attempts > self.rate_limit {
                tracing::warn!(ip = %ip, attempts, limit = self.rate_limit, "token validation rate limited");
                return Err(TokenError::RateLimited {
                    retry_after_secs: self.rate_window_secs,
                });
            }
        }

        if !is_well_formed(raw) {
            return Err(TokenError::InvalidFormat);
        }

        let token = self
            .store
            .find_active_by_hash(&hash_token(raw))
            .await?
            .ok_or(TokenError::NotFound)?;

        if let Err(e) = self.store.touch_last_used(token.id).await {
            tracing::warn!(token_id = token.id, "failed to record token use: {}", e);
        }

        tracing::debug!(owner = %token.owner_id, prefix = %token.token_prefix, "composer token accepted");
        Ok(token.owner_id)
    }

    /// Revoke a token owned by `owner_id`. Unknown ids and ids owned by
    /// someone else are indistinguishable.
    pub async fn revoke(&self, token_id: i64, owner_id: &str) -> Result<(), TokenError> {
        if self.store.revoke(token_id, owner_id).await? {
            tracing::info!(owner = %owner_id, token_id, "composer token revoked");
            Ok(())
        } else {
            Err(TokenError::NotFound)
        }
    }

    pub async fn list(
        &self,
        owner_id: &str,
        include_revoked: bool,
    ) -> Result<Vec<TokenSummary>, TokenError> {
        Ok(self.store.list_for_owner(owner_id, include_revoked).await?)
    }
}

fn random_part() -> Zeroizing<String> {
    let mut rng = OsRng;
    let s: String = (0..TOKEN_RANDOM_LEN)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect();
    Zeroizing::new(s)
}

pub fn hash_token(raw: &str) -> String {
    hex::encode(Sha256::digest(raw.as_bytes()))
}

/// Prefix, exact length and an alphanumeric random part.
pub fn is_well_formed(raw: &str) -> bool {
    match raw.strip_prefix(TOKEN_PREFIX) {
        Some(rest) => {
            rest.len() == TOKEN_RANDOM_LEN && rest.bytes().all(|b| b.is_ascii_alphanumeric())
        }
        None => false,
    }
}

fn normalize_name(name: Option<&str>) -> String {
    match name.map(str::trim).filter(|n| !n.is_empty()) {
        Some(n) => n.chars().take(NAME_MAX_CHARS).collect(),
        None => "Default".to_string(),
    }
}

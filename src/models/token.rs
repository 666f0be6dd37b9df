use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Full stored record. Only the store layer and the token service see
/// `token_hash`; it is skipped on serialization so it can never leak
/// through an API response or a log line that formats the struct as JSON.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Token {
    pub id: i64,
    pub owner_id: String,
    #[serde(skip_serializing)]
    pub token_hash: String,
    pub token_prefix: String,
    pub name: String,
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
}

impl Token {
    pub fn is_active(&self) -> bool {
        self.revoked_at.is_none()
    }
}

/// Listing shape: everything but the hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct TokenSummary {
    pub id: i64,
    pub owner_id: String,
    pub token_prefix: String,
    pub name: String,
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
}

impl From<Token> for TokenSummary {
    fn from(t: Token) -> Self {
        Self {
            id: t.id,
            owner_id: t.owner_id,
            token_prefix: t.token_prefix,
            name: t.name,
            last_used_at: t.last_used_at,
            created_at: t.created_at,
            revoked_at: t.revoked_at,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewToken {
    pub owner_id: String,
    pub token_hash: String,
    pub token_prefix: String,
    pub name: String,
}

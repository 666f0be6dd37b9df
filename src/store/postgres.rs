use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use super::{Dimension, ListField, TelemetryStore, TokenStore};
use crate::models::telemetry::{ErrorSummaryRow, NewEvent, RecentError, ValueCount};
use crate::models::token::{NewToken, Token, TokenSummary};

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub async fn ping(&self) -> anyhow::Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Run pending migrations from the migrations/ directory.
    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    // -- Catalog (read-only view of the storefront) --

    /// One row per distinct product the owner holds a download permission
    /// for, carrying the earliest grant.
    pub async fn list_owned_products(&self, owner_id: &str) -> anyhow::Result<Vec<OwnedProductRow>> {
        let rows = sqlx::query_as::<_, OwnedProductRow>(
            r#"
            SELECT DISTINCT ON (p.id)
                p.id, p.name, p.sku, p.tags, p.software_type, p.requires_wp, p.tested_up_to,
                dp.order_key, dp.user_email
            FROM download_permissions dp
            JOIN products p ON p.id = dp.product_id
            WHERE dp.owner_id = $1
            ORDER BY p.id ASC, dp.granted_at ASC, dp.id ASC
            "#,
        )
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn get_owned_product_by_sku(
        &self,
        owner_id: &str,
        sku: &str,
    ) -> anyhow::Result<Option<OwnedProductRow>> {
        let row = sqlx::query_as::<_, OwnedProductRow>(
            r#"
            SELECT
                p.id, p.name, p.sku, p.tags, p.software_type, p.requires_wp, p.tested_up_to,
                dp.order_key, dp.user_email
            FROM download_permissions dp
            JOIN products p ON p.id = dp.product_id
            WHERE dp.owner_id = $1 AND p.sku = $2
            ORDER BY dp.granted_at ASC, dp.id ASC
            LIMIT 1
            "#,
        )
        .bind(owner_id)
        .bind(sku)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Files in upload order. Empty for non-downloadable products.
    pub async fn list_product_files(&self, product_id: i64) -> anyhow::Result<Vec<ProductFileRow>> {
        let rows = sqlx::query_as::<_, ProductFileRow>(
            r#"
            SELECT f.file_id, f.name, f.file_path, f.enabled
            FROM product_files f
            JOIN products p ON p.id = f.product_id
            WHERE f.product_id = $1 AND p.downloadable = true
            ORDER BY f.position ASC, f.file_id ASC
            "#,
        )
        .bind(product_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

#[async_trait]
impl TokenStore for PgStore {
    async fn insert_within_quota(
        &self,
        token: &NewToken,
        max_active: i64,
    ) -> anyhow::Result<Option<i64>> {
        // Count and insert in one statement. Two racing requests can still
        // both see count = max - 1, so the cap may be overshot by one.
        let id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO composer_tokens (owner_id, token_hash, token_prefix, name)
            SELECT $1, $2, $3, $4
            WHERE (
                SELECT COUNT(*) FROM composer_tokens
                WHERE owner_id = $1 AND revoked_at IS NULL
            ) < $5
            RETURNING id
            "#,
        )
        .bind(&token.owner_id)
        .bind(&token.token_hash)
        .bind(&token.token_prefix)
        .bind(&token.name)
        .bind(max_active)
        .fetch_optional(&self.pool)
        .await?;
        Ok(id)
    }

    async fn find_active_by_hash(&self, token_hash: &str) -> anyhow::Result<Option<Token>> {
        let row = sqlx::query_as::<_, Token>(
            r#"
            SELECT id, owner_id, token_hash, token_prefix, name, last_used_at, created_at, revoked_at
            FROM composer_tokens
            WHERE token_hash = $1 AND revoked_at IS NULL
            "#,
        )
        .bind(token_hash)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn touch_last_used(&self, id: i64) -> anyhow::Result<()> {
        sqlx::query("UPDATE composer_tokens SET last_used_at = NOW() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn revoke(&self, id: i64, owner_id: &str) -> anyhow::Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE composer_tokens
            SET revoked_at = COALESCE(revoked_at, NOW())
            WHERE id = $1 AND owner_id = $2
            "#,
        )
        .bind(id)
        .bind(owner_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_for_owner(
        &self,
        owner_id: &str,
        include_revoked: bool,
    ) -> anyhow::Result<Vec<TokenSummary>> {
        let rows = sqlx::query_as::<_, TokenSummary>(
            r#"
            SELECT id, owner_id, token_prefix, name, last_used_at, created_at, revoked_at
            FROM composer_tokens
            WHERE owner_id = $1 AND ($2 OR revoked_at IS NULL)
            ORDER BY created_at DESC, id DESC
            "#,
        )
        .bind(owner_id)
        .bind(include_revoked)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

fn dimension_expr(dimension: Dimension) -> &'static str {
    match dimension {
        Dimension::PhpVersion => "payload->'environment'->>'php_version'",
        Dimension::WpVersion => "payload->'environment'->>'wp_version'",
        Dimension::PluginVersion => "plugin_version",
    }
}

#[async_trait]
impl TelemetryStore for PgStore {
    async fn insert_event(&self, event: &NewEvent) -> anyhow::Result<i64> {
        let id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO telemetry_events (site_hash, data_type, plugin_version, payload)
            VALUES ($1, $2, $3, $4)
            RETURNING id
            "#,
        )
        .bind(&event.site_hash)
        .bind(event.data_type.as_str())
        .bind(&event.plugin_version)
        .bind(&event.payload)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    async fn unique_sites(&self, days: Option<i32>) -> anyhow::Result<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(DISTINCT site_hash)
            FROM telemetry_events
            WHERE $1::INT IS NULL OR created_at >= NOW() - make_interval(days => $1)
            "#,
        )
        .bind(days)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn distribution(
        &self,
        dimension: Dimension,
        days: i32,
    ) -> anyhow::Result<Vec<ValueCount>> {
        // The expression is one of three static strings, never user input.
        let expr = dimension_expr(dimension);
        let sql = format!(
            r#"
            SELECT {expr} AS value, COUNT(DISTINCT site_hash) AS count
            FROM telemetry_events
            WHERE data_type = 'usage'
              AND {expr} IS NOT NULL
              AND created_at >= NOW() - make_interval(days => $1)
            GROUP BY 1
            ORDER BY count DESC, value ASC
            "#
        );
        let rows = sqlx::query_as::<_, ValueCount>(&sql)
            .bind(days)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    async fn network_types(&self, days: i32) -> anyhow::Result<Vec<ValueCount>> {
        let rows = sqlx::query_as::<_, ValueCount>(
            r#"
            SELECT
                CASE
                    WHEN payload->'network'->>'is_subdomain' = 'true' THEN 'Subdomain'
                    ELSE 'Subdirectory'
                END AS value,
                COUNT(DISTINCT site_hash) AS count
            FROM telemetry_events
            WHERE data_type = 'usage'
              AND created_at >= NOW() - make_interval(days => $1)
            GROUP BY 1
            ORDER BY count DESC, value ASC
            "#,
        )
        .bind(days)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn latest_lists(
        &self,
        field: ListField,
        days: i32,
    ) -> anyhow::Result<Vec<serde_json::Value>> {
        let path: Vec<String> = field.payload_path().iter().map(|s| s.to_string()).collect();
        let rows = sqlx::query_scalar::<_, Option<serde_json::Value>>(
            r#"
            SELECT DISTINCT ON (site_hash) payload #> $2
            FROM telemetry_events
            WHERE data_type = 'usage'
              AND created_at >= NOW() - make_interval(days => $1)
            ORDER BY site_hash, created_at DESC, id DESC
            "#,
        )
        .bind(days)
        .bind(path)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().flatten().collect())
    }

    async fn error_summary(&self, days: i32, limit: i64) -> anyhow::Result<Vec<ErrorSummaryRow>> {
        let rows = sqlx::query_as::<_, ErrorSummaryRow>(
            r#"
            SELECT
                payload->>'handle' AS handle,
                LEFT(payload->>'message', 100) AS message_preview,
                COUNT(*) AS count,
                MAX(created_at) AS last_seen
            FROM telemetry_events
            WHERE data_type = 'error'
              AND created_at >= NOW() - make_interval(days => $1)
            GROUP BY 1, 2
            ORDER BY count DESC, last_seen DESC
            LIMIT $2
            "#,
        )
        .bind(days)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn recent_errors(&self, limit: i64) -> anyhow::Result<Vec<RecentError>> {
        let rows = sqlx::query_as::<_, RecentError>(
            r#"
            SELECT
                id, site_hash, plugin_version,
                payload->>'handle' AS handle,
                payload->>'message' AS message,
                created_at
            FROM telemetry_events
            WHERE data_type = 'error'
            ORDER BY created_at DESC, id DESC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn purge_older_than(&self, days: i32) -> anyhow::Result<u64> {
        let result = sqlx::query(
            "DELETE FROM telemetry_events WHERE created_at < NOW() - make_interval(days => $1)",
        )
        .bind(days)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[derive(Debug, sqlx::FromRow, Serialize, Deserialize)]
pub struct OwnedProductRow {
    pub id: i64,
    pub name: String,
    pub sku: String,
    pub tags: Vec<String>,
    pub software_type: Option<String>,
    pub requires_wp: Option<String>,
    pub tested_up_to: Option<String>,
    pub order_key: String,
    pub user_email: String,
}

#[derive(Debug, sqlx::FromRow, Serialize, Deserialize)]
pub struct ProductFileRow {
    pub file_id: String,
    pub name: String,
    pub file_path: String,
    pub enabled: bool,
}

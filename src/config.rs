use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;

const PLACEHOLDER_ADMIN_KEY: &str = "CHANGE_ME_ADMIN_KEY";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub port: u16,
    pub database_url: String,
    /// Optional shared tier for rate-limit counters and the version cache.
    /// When unset every counter lives in-process (single-node deployment).
    pub redis_url: Option<String>,
    pub admin_key: String,
    /// Composer vendor prefix, e.g. `ultimate-multisite/<slug>`.
    pub vendor_prefix: String,
    /// Package name used for the platform requirement in `require`.
    pub core_package: String,
    pub feed_max_age_secs: u64,
    pub version_cache_ttl_secs: u64,
    pub token_max_active: i64,
    /// Validation attempts allowed per client IP per window.
    pub token_rate_limit: u64,
    pub token_rate_window_secs: u64,
    /// Telemetry events accepted per site per window.
    pub telemetry_rate_limit: u64,
    pub telemetry_rate_window_secs: u64,
    pub telemetry_retention_days: i64,
    /// Proxy headers consulted for the client IP, highest priority first.
    pub trusted_ip_headers: Vec<String>,
    pub download_base_url: String,
    pub download_signing_key: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            database_url: "postgres://localhost/update_server".into(),
            redis_url: None,
            admin_key: PLACEHOLDER_ADMIN_KEY.into(),
            vendor_prefix: "ultimate-multisite".into(),
            core_package: "wordpress/core".into(),
            feed_max_age_secs: 300,
            version_cache_ttl_secs: 3600,
            token_max_active: 10,
            token_rate_limit: 10,
            token_rate_window_secs: 60,
            telemetry_rate_limit: 10,
            telemetry_rate_window_secs: 3600,
            telemetry_retention_days: 90,
            trusted_ip_headers: default_ip_headers(),
            download_base_url: "http://localhost:8080/".into(),
            download_signing_key: "CHANGE_ME_SIGNING_KEY".into(),
        }
    }
}

fn default_ip_headers() -> Vec<String> {
    ["cf-connecting-ip", "x-forwarded-for", "x-real-ip"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

pub fn load() -> anyhow::Result<Config> {
    dotenvy::dotenv().ok();

    let defaults = Config::default();

    let production = std::env::var("UPDATE_SERVER_ENV")
        .or_else(|_| std::env::var("RUST_ENV"))
        .map(|mode| mode == "production")
        .unwrap_or(false);

    let admin_key = std::env::var("UPDATE_SERVER_ADMIN_KEY")
        .unwrap_or_else(|_| PLACEHOLDER_ADMIN_KEY.into());
    check_admin_key(&admin_key, production)?;

    let download_signing_key = std::env::var("DOWNLOAD_SIGNING_KEY").ok();
    let download_signing_key =
        signing_key_or_derived(download_signing_key.as_deref(), &admin_key, production)?;

    let trusted_ip_headers = match std::env::var("TRUSTED_IP_HEADERS") {
        Ok(list) => list
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_ascii_lowercase)
            .collect(),
        Err(_) => defaults.trusted_ip_headers,
    };

    Ok(Config {
        port: env_or("UPDATE_SERVER_PORT", defaults.port),
        database_url: std::env::var("DATABASE_URL").unwrap_or(defaults.database_url),
        redis_url: std::env::var("REDIS_URL").ok().filter(|s| !s.is_empty()),
        download_signing_key,
        admin_key,
        vendor_prefix: std::env::var("FEED_VENDOR_PREFIX").unwrap_or(defaults.vendor_prefix),
        core_package: std::env::var("FEED_CORE_PACKAGE").unwrap_or(defaults.core_package),
        feed_max_age_secs: env_or("FEED_MAX_AGE_SECS", defaults.feed_max_age_secs),
        version_cache_ttl_secs: env_or("VERSION_CACHE_TTL_SECS", defaults.version_cache_ttl_secs),
        token_max_active: env_or("TOKEN_MAX_ACTIVE", defaults.token_max_active),
        token_rate_limit: env_or("TOKEN_RATE_LIMIT", defaults.token_rate_limit),
        token_rate_window_secs: env_or("TOKEN_RATE_WINDOW_SECS", defaults.token_rate_window_secs),
        telemetry_rate_limit: env_or("TELEMETRY_RATE_LIMIT", defaults.telemetry_rate_limit),
        telemetry_rate_window_secs: env_or(
            "TELEMETRY_RATE_WINDOW_SECS",
            defaults.telemetry_rate_window_secs,
        ),
        telemetry_retention_days: env_or(
            "TELEMETRY_RETENTION_DAYS",
            defaults.telemetry_retention_days,
        ),
        trusted_ip_headers,
        download_base_url: std::env::var("DOWNLOAD_BASE_URL").unwrap_or(defaults.download_base_url),
    })
}

/// An empty admin key would let an empty `X-Admin-Key` header through, so
/// it is refused in every mode. The placeholder is refused in production.
fn check_admin_key(admin_key: &str, production: bool) -> anyhow::Result<()> {
    if admin_key.trim().is_empty() {
        anyhow::bail!("UPDATE_SERVER_ADMIN_KEY is empty. Set a non-empty key.");
    }
    if admin_key == PLACEHOLDER_ADMIN_KEY {
        if production {
            anyhow::bail!(
                "UPDATE_SERVER_ADMIN_KEY is still the insecure placeholder. \
                 Set a proper key before running in production."
            );
        }
        eprintln!("⚠️  UPDATE_SERVER_ADMIN_KEY is not set, using insecure placeholder.");
    }
    Ok(())
}

/// Download links leave the service, so they are never signed with the
/// admin key itself. Without `DOWNLOAD_SIGNING_KEY` a separate key is
/// derived from the admin key outside production; production requires
/// an explicit one.
fn signing_key_or_derived(
    configured: Option<&str>,
    admin_key: &str,
    production: bool,
) -> anyhow::Result<String> {
    match configured.map(str::trim).filter(|k| !k.is_empty()) {
        Some(key) if key == admin_key => {
            anyhow::bail!("DOWNLOAD_SIGNING_KEY must differ from UPDATE_SERVER_ADMIN_KEY.")
        }
        Some(key) => Ok(key.to_string()),
        None if production => {
            anyhow::bail!("DOWNLOAD_SIGNING_KEY must be set when running in production.")
        }
        None => {
            tracing::warn!("DOWNLOAD_SIGNING_KEY not set, deriving one from the admin key");
            Ok(derive_signing_key(admin_key))
        }
    }
}

fn derive_signing_key(admin_key: &str) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(admin_key.as_bytes())
        .expect("HMAC can take key of any size");
    mac.update(b"download-link-signing");
    hex::encode(mac.finalize().into_bytes())
}

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use update_server::cache::TieredCache;
use update_server::cli::{self, Commands, TelemetryCommands, TokenCommands};
use update_server::config::{self, Config};
use update_server::entitlements::{LinkSigner, PgEntitlements};
use update_server::store::postgres::PgStore;
use update_server::{api, jobs, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_sdk::{trace as sdktrace, Resource};

    // OTLP export only when a collector endpoint is configured.
    let telemetry_layer = if std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").is_ok() {
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(opentelemetry_otlp::new_exporter().tonic())
            .with_trace_config(sdktrace::config().with_resource(Resource::new(vec![
                KeyValue::new("service.name", "update-server"),
            ])))
            .install_batch(opentelemetry_sdk::runtime::Tokio)?;
        Some(tracing_opentelemetry::layer().with_tracer(tracer))
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "update_server=debug,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .with(telemetry_layer)
        .init();

    let cfg = config::load()?;
    let args = cli::Cli::parse();

    let result = match args.command {
        Some(Commands::Serve { port }) => {
            let port = port.unwrap_or(cfg.port);
            run_server(cfg, port).await
        }
        Some(Commands::Token { command }) => {
            let state = build_state(cfg).await?;
            handle_token_command(command, &state).await
        }
        Some(Commands::Telemetry { command }) => {
            let state = build_state(cfg).await?;
            handle_telemetry_command(command, &state).await
        }
        Some(Commands::Migrate) => {
            let db = PgStore::connect(&cfg.database_url).await?;
            db.migrate().await?;
            println!("Migrations applied.");
            Ok(())
        }
        None => {
            let port = cfg.port;
            run_server(cfg, port).await
        }
    };

    if let Err(ref e) = result {
        eprintln!("Error: {:?}", e);
    }
    result
}

/// Postgres-backed state with the optional Redis tier.
async fn build_state(cfg: Config) -> anyhow::Result<AppState> {
    tracing::info!("Connecting to database...");
    let db = PgStore::connect(&cfg.database_url).await?;

    let cache = match &cfg.redis_url {
        Some(url) => {
            tracing::info!("Connecting to Redis...");
            let client = redis::Client::open(url.as_str())?;
            let conn = redis::aio::ConnectionManager::new(client).await?;
            TieredCache::new(conn)
        }
        None => {
            tracing::warn!("REDIS_URL not set, rate limits and caches are per-process");
            TieredCache::local_only()
        }
    };

    let signer = LinkSigner::new(&cfg.download_base_url, &cfg.download_signing_key)?;
    let entitlements = Arc::new(PgEntitlements::new(db.clone(), signer));
    let store = Arc::new(db.clone());

    Ok(AppState::new(cfg, cache, store.clone(), store, entitlements).with_database(db))
}

async fn run_server(cfg: Config, port: u16) -> anyhow::Result<()> {
    let state = build_state(cfg).await?;

    if let Some(db) = &state.db {
        tracing::info!("Running migrations...");
        db.migrate().await?;
    }

    let state = Arc::new(state);
    let app = api::build_router(state.clone());

    jobs::cleanup::spawn(state.clone());
    tracing::info!(
        retention_days = state.config.telemetry_retention_days,
        "Background jobs started (daily purge, cache sweep every minute)"
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("update server listening on {}", addr);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}

async fn handle_token_command(cmd: TokenCommands, state: &AppState) -> anyhow::Result<()> {
    match cmd {
        TokenCommands::Create { owner, name } => {
            let t = state.tokens.generate(&owner, name.as_deref()).await?;
            println!(
                "Token created:\n  ID:     {}\n  Prefix: {}\n  Token:  {}\n\nStore it now; it cannot be shown again.",
                t.id,
                t.prefix,
                t.secret.as_str()
            );
        }
        TokenCommands::List { owner, all } => {
            let tokens = state.tokens.list(&owner, all).await?;
            if tokens.is_empty() {
                println!("No tokens found.");
            } else {
                println!(
                    "{:<8} {:<12} {:<24} {:<20} {:<8}",
                    "ID", "PREFIX", "NAME", "LAST USED", "ACTIVE"
                );
                for t in tokens {
                    let last_used = t
                        .last_used_at
                        .map(|d| d.format("%Y-%m-%d %H:%M").to_string())
                        .unwrap_or_else(|| "never".to_string());
                    println!(
                        "{:<8} {:<12} {:<24} {:<20} {:<8}",
                        t.id,
                        t.token_prefix,
                        t.name,
                        last_used,
                        t.revoked_at.is_none()
                    );
                }
            }
        }
        TokenCommands::Revoke { owner, id } => match state.tokens.revoke(id, &owner).await {
            Ok(()) => println!("Token revoked."),
            Err(update_server::services::tokens::TokenError::NotFound) => {
                println!("Token not found.")
            }
            Err(e) => return Err(e.into()),
        },
    }
    Ok(())
}

async fn handle_telemetry_command(cmd: TelemetryCommands, state: &AppState) -> anyhow::Result<()> {
    match cmd {
        TelemetryCommands::Stats { days } => {
            let stats = state.telemetry.aggregate(days).await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        TelemetryCommands::Purge { days } => {
            let days = days.unwrap_or(state.config.telemetry_retention_days);
            let removed = state.telemetry.purge(days).await?;
            println!("Deleted {} event(s) older than {} day(s).", removed, days);
        }
    }
    Ok(())
}

use clap::{Parser, Subcommand};

/// Update server: Composer feed and telemetry collector
#[derive(Parser)]
#[command(name = "update-server", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the HTTP server
    Serve {
        /// Port to bind (defaults to UPDATE_SERVER_PORT)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Manage Composer access tokens
    Token {
        #[command(subcommand)]
        command: TokenCommands,
    },

    /// Inspect or prune telemetry
    Telemetry {
        #[command(subcommand)]
        command: TelemetryCommands,
    },

    /// Apply pending database migrations and exit
    Migrate,
}

#[derive(Subcommand)]
pub enum TokenCommands {
    /// Create a token and print it once
    Create {
        #[arg(long)]
        owner: String,
        #[arg(long)]
        name: Option<String>,
    },
    /// List an owner's tokens
    List {
        #[arg(long)]
        owner: String,
        /// Include revoked tokens
        #[arg(long)]
        all: bool,
    },
    /// Revoke a token
    Revoke {
        #[arg(long)]
        owner: String,
        #[arg(long)]
        id: i64,
    },
}

#[derive(Subcommand)]
pub enum TelemetryCommands {
    /// Print the dashboard aggregate as JSON
    Stats {
        #[arg(long, default_value = "30")]
        days: i64,
    },
    /// Delete events older than the given number of days
    Purge {
        /// Defaults to TELEMETRY_RETENTION_DAYS
        #[arg(long)]
        days: Option<i64>,
    },
}

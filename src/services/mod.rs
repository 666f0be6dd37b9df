//! Domain services. Each holds its store behind a trait object and the
//! shared `TieredCache` for counters.

pub mod feed;
pub mod telemetry;
pub mod tokens;

pub use feed::PackageFeed;
pub use telemetry::TelemetryService;
pub use tokens::TokenService;

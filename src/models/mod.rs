pub mod package;
pub mod telemetry;
pub mod token;

//! # Media Telemetry
//!
//! Logging and metrics setup shared by the media gate crates.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use media_telemetry::{init_telemetry, TelemetryConfig};
//!
//! let config = TelemetryConfig::from_env();
//! init_telemetry(&config).expect("Failed to init telemetry");
//! ```
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `MEDIA_SERVICE_NAME` | `media-gate` | Service name in logs |
//! | `MEDIA_LOG_LEVEL` | `info` | Log level filter (falls back to `RUST_LOG`) |
//! | `MEDIA_JSON_LOGS` | `false` | JSON log lines |

mod config;
mod logging;
pub mod metrics;

pub use config::TelemetryConfig;
pub use logging::init_logging;
pub use metrics::{
    encode_metrics, register_metrics, COLLECTORS_ACTIVE, EXCHANGES_TOTAL, EXCHANGE_DURATION,
    UNSOLICITED_PACKETS,
};

use thiserror::Error;

/// Telemetry initialization errors
#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Failed to initialize logging: {0}")]
    LoggingInit(String),

    #[error("Failed to initialize Prometheus metrics: {0}")]
    MetricsInit(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Register metrics and install the global subscriber.
pub fn init_telemetry(config: &TelemetryConfig) -> Result<(), TelemetryError> {
    register_metrics()?;
    init_logging(config)
}

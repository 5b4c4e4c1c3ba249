//! Process-wide tracing subscriber.
//!
//! Initialised once from `main`. Child bindings are plain `tracing` spans, so
//! there is no logger object to pass around.

use tracing_subscriber::{fmt, EnvFilter};

use crate::config::{LogFormat, ServiceConfig};

/// `RUST_LOG` wins over the configured level when set.
pub fn env_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

pub fn init(service: &ServiceConfig) {
    let filter = env_filter(&service.log_level);
    match service.log_format {
        LogFormat::Json => fmt()
            .json()
            .with_current_span(true)
            .with_env_filter(filter)
            .init(),
        LogFormat::Pretty => fmt().with_env_filter(filter).init(),
    }
}

//! Logging setup.

use crate::config::LoggingConfig;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Output format for the global subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LogFormat {
    Pretty,
    Json,
    Compact,
}

impl LogFormat {
    /// Parse the `[logging] format` value; unknown strings get `None`.
    fn parse(s: &str) -> Option<Self> {
        match s {
            "pretty" => Some(LogFormat::Pretty),
            "json" => Some(LogFormat::Json),
            "compact" => Some(LogFormat::Compact),
            _ => None,
        }
    }
}

/// Install the global subscriber from the `[logging]` section.
///
/// The configured level seeds the filter; a set `RUST_LOG` environment
/// variable replaces it entirely. Per-event chatter (accepts, batch
/// promotions, reply routing) sits at trace, connection lifecycle at
/// debug, and upstream trouble at warn, so the default "info" level
/// keeps the reactor loop quiet.
pub fn init(config: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let registry = tracing_subscriber::registry().with(filter);
    match LogFormat::parse(&config.format).unwrap_or(LogFormat::Pretty) {
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
        LogFormat::Compact => registry.with(fmt::layer().compact()).init(),
        LogFormat::Pretty => registry.with(fmt::layer()).init(),
    }
}

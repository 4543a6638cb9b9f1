//! Process-level log setup for binaries embedding the pipeline.
//!
//! The library itself only emits `tracing` events under the
//! `span_pipeline` target; installing a subscriber is left to the host.

use std::io;
use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Level used when `RUST_LOG` is unset or invalid
    pub default_level: Level,
    pub ansi_colors: bool,
    pub include_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            default_level: Level::INFO,
            ansi_colors: true,
            include_target: true,
        }
    }
}

impl LoggingConfig {
    /// Debug-level output, used when the pipeline runs with `debug` set.
    pub fn verbose() -> Self {
        Self {
            default_level: Level::DEBUG,
            ..Self::default()
        }
    }

    pub fn with_level(mut self, level: Level) -> Self {
        self.default_level = level;
        self
    }

    pub fn with_ansi(mut self, ansi: bool) -> Self {
        self.ansi_colors = ansi;
        self
    }
}

/// Installs a global `fmt` subscriber. `RUST_LOG` takes precedence over
/// `default_level`.
///
/// Fails if a global subscriber is already set.
pub fn init_logging(config: &LoggingConfig) -> io::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.default_level.to_string()));

    let fmt_layer = fmt::layer()
        .with_ansi(config.ansi_colors)
        .with_target(config.include_target)
        .compact();

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))
}

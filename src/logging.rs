//! Tracing setup for fleetctl.
//!
//! Logs go to stderr so command output on stdout stays pipeable. `RUST_LOG`
//! takes precedence over the configured level.

use tracing::Level;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

use crate::config::AppConfig;

#[derive(Debug, Clone, Copy, Default)]
pub struct LogConfig {
    /// One JSON object per line instead of human-readable output
    pub json: bool,
    /// Default to DEBUG instead of INFO
    pub verbose: bool,
}

impl From<&AppConfig> for LogConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            json: config.json_logs,
            verbose: config.verbose,
        }
    }
}

impl LogConfig {
    fn default_directive(&self) -> String {
        let level = if self.verbose {
            Level::DEBUG
        } else {
            Level::INFO
        };
        format!("fleetctl={}", level.as_str().to_lowercase())
    }
}

/// Install the global subscriber. Call once, after configuration is loaded.
pub fn init(config: LogConfig) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.default_directive()));

    if config.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_span_events(FmtSpan::CLOSE)
                    .with_current_span(true)
                    .with_target(true),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            )
            .init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbose_selects_debug_directive() {
        let config = LogConfig {
            verbose: true,
            ..Default::default()
        };
        assert_eq!(config.default_directive(), "fleetctl=debug");
        assert_eq!(LogConfig::default().default_directive(), "fleetctl=info");
    }

    #[test]
    fn derived_from_app_config() {
        let app = AppConfig {
            json_logs: true,
            ..Default::default()
        };
        let config = LogConfig::from(&app);
        assert!(config.json);
        assert!(!config.verbose);
    }
}

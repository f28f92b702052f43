//! Structured logging.
//!
//! # Responsibilities
//! - Initialize the tracing subscriber
//! - Pick pretty or JSON output
//! - Configure log level from config, overridable by `RUST_LOG`

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{LogFormat, ObservabilityConfig};

/// Filter used when neither `RUST_LOG` nor the config yields a valid one.
const FALLBACK_FILTER: &str = "gem=info,tower_http=info";

/// Build the env filter: `RUST_LOG` first, then the configured level.
pub fn env_filter(config: &ObservabilityConfig) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(directive(&config.log_level)))
        .unwrap_or_else(|_| EnvFilter::new(FALLBACK_FILTER))
}

/// A bare level applies to this crate and tower-http; anything else is used verbatim.
fn directive(level: &str) -> String {
    match level {
        "trace" | "debug" | "info" | "warn" | "error" => {
            format!("gem={level},tower_http={level}")
        }
        other => other.to_string(),
    }
}

/// Install the global subscriber. Safe to call more than once.
pub fn init_logging(config: &ObservabilityConfig) {
    let registry = tracing_subscriber::registry().with(env_filter(config));
    let result = match config.log_format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).try_init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).try_init(),
    };
    if result.is_err() {
        tracing::debug!("Tracing subscriber already installed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_expands_to_crate_directives() {
        assert_eq!(directive("debug"), "gem=debug,tower_http=debug");
        assert_eq!(directive("gem=trace"), "gem=trace");
    }

    #[test]
    fn init_twice_is_harmless() {
        let config = ObservabilityConfig::default();
        init_logging(&config);
        init_logging(&config);
    }
}

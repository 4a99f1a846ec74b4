//! Structured logging initialization.

use serde::Deserialize;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::error::{TelemetryError, TelemetryResult};

const DEFAULT_FILTER: &str = "info,gridbot=debug";

/// Output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// `[logging]` configuration section.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset.
    #[serde(default)]
    pub filter: Option<String>,
    #[serde(default)]
    pub format: LogFormat,
}

impl LoggingConfig {
    /// JSON when configured, or when `RUST_ENV=production`.
    pub fn effective_format(&self) -> LogFormat {
        let is_production = std::env::var("RUST_ENV")
            .map(|v| v == "production")
            .unwrap_or(false);
        if is_production {
            LogFormat::Json
        } else {
            self.format
        }
    }

    fn env_filter(&self) -> TelemetryResult<EnvFilter> {
        if let Ok(filter) = EnvFilter::try_from_default_env() {
            return Ok(filter);
        }
        let directive = self.filter.as_deref().unwrap_or(DEFAULT_FILTER);
        EnvFilter::try_new(directive).map_err(|e| TelemetryError::InvalidFilter {
            filter: directive.to_string(),
            reason: e.to_string(),
        })
    }
}

/// Install the global tracing subscriber.
///
/// Fails if a subscriber is already installed.
pub fn init_logging(config: &LoggingConfig) -> TelemetryResult<()> {
    let env_filter = config.env_filter()?;

    let result = match config.effective_format() {
        LogFormat::Json => tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(true),
            )
            .try_init(),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().pretty().with_target(true).with_thread_names(true))
            .try_init(),
    };

    result.map_err(|e| TelemetryError::LoggingInit(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults_to_pretty() {
        let config: LoggingConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.format, LogFormat::Pretty);
        assert!(config.filter.is_none());

        let config: LoggingConfig =
            serde_json::from_str(r#"{"format":"json","filter":"warn"}"#).unwrap();
        assert_eq!(config.format, LogFormat::Json);
    }

    #[test]
    fn test_bad_filter_is_reported() {
        if std::env::var("RUST_LOG").is_ok() {
            return;
        }
        let config = LoggingConfig {
            filter: Some("gridbot=loud".to_string()),
            format: LogFormat::Pretty,
        };
        assert!(matches!(
            config.env_filter(),
            Err(TelemetryError::InvalidFilter { .. })
        ));
    }
}

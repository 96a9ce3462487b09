//! Tracing setup for Stagehand binaries.
//!
//! Filter directives resolve `STAGEHAND_LOG` first, then `RUST_LOG`, then
//! the caller's default, so an operator can scope Stagehand logging without
//! touching the log level of whatever tooling wraps it.

use std::str::FromStr;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// How log lines are rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable lines for terminals.
    #[default]
    Text,
    /// One JSON object per line, for ingestion by log collectors.
    Json,
}

/// Error parsing a [`LogFormat`] from a flag or config value.
#[derive(Debug, thiserror::Error)]
#[error("Unknown log format '{0}', expected 'text' or 'json'")]
pub struct ParseLogFormatError(String);

impl FromStr for LogFormat {
    type Err = ParseLogFormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            other => Err(ParseLogFormatError(other.to_string())),
        }
    }
}

/// Filter directives for this process: `STAGEHAND_LOG` beats `RUST_LOG`
/// beats `default_filter`.
fn resolve_filter(default_filter: &str) -> String {
    std::env::var("STAGEHAND_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| default_filter.to_string())
}

/// Initialise the global tracing subscriber.
pub fn init_tracing(default_filter: &str, format: LogFormat) {
    let env_filter = tracing_subscriber::EnvFilter::new(resolve_filter(default_filter));
    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn log_format_defaults_to_text() {
        assert_eq!(LogFormat::default(), LogFormat::Text);
    }

    #[test]
    fn log_format_parses_text_and_json() {
        assert_eq!("text".parse::<LogFormat>().unwrap(), LogFormat::Text);
        assert_eq!("json".parse::<LogFormat>().unwrap(), LogFormat::Json);
    }

    #[test]
    fn log_format_parsing_is_case_insensitive() {
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("Text".parse::<LogFormat>().unwrap(), LogFormat::Text);
    }

    #[test]
    fn unknown_log_format_is_rejected() {
        let err = "yaml".parse::<LogFormat>().unwrap_err();
        assert!(err.to_string().contains("yaml"));
    }
}

//! Structured logging setup using the tracing crate
//!
//! The client itself only emits `tracing` events; installing a subscriber is left
//! to the application. These helpers cover the common setup.
//!
//! ## Environment Variables
//!
//! - `LOG_LEVEL`: ERROR, WARN, INFO, DEBUG, TRACE - defaults to INFO
//! - `LOG_FORMAT`: json, pretty, compact - defaults to json
//! - `LOG_SPANS`: include span open/close events (true/false) - defaults to false
//! - `RUST_LOG`: overrides the filter entirely
//!
//! ```bash
//! LOG_FORMAT=compact LOG_LEVEL=DEBUG ./publisher
//! ```

use std::env;
use tracing::Level;
use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Log output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Structured JSON (machine-readable)
    Json,
    /// Multi-line, colored (development)
    Pretty,
    /// Single-line, colored (terminals)
    Compact,
}

impl LogFormat {
    /// Parse log format from string; unknown values fall back to JSON
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "pretty" => LogFormat::Pretty,
            "compact" => LogFormat::Compact,
            _ => LogFormat::Json,
        }
    }
}

/// Parse a `LOG_LEVEL` value; unknown values fall back to INFO
pub fn parse_level(s: &str) -> Level {
    match s.trim().to_uppercase().as_str() {
        "ERROR" => Level::ERROR,
        "WARN" => Level::WARN,
        "DEBUG" => Level::DEBUG,
        "TRACE" => Level::TRACE,
        _ => Level::INFO,
    }
}

/// Parse a `LOG_SPANS` value; only "true" enables span events
pub fn parse_spans_flag(s: &str) -> bool {
    s.trim().eq_ignore_ascii_case("true")
}

fn span_events(include_spans: bool) -> fmt::format::FmtSpan {
    if include_spans {
        fmt::format::FmtSpan::NEW | fmt::format::FmtSpan::CLOSE
    } else {
        fmt::format::FmtSpan::NONE
    }
}

fn build_filter(level: Level) -> EnvFilter {
    // Allow RUST_LOG to override
    if let Ok(rust_log) = env::var("RUST_LOG") {
        return EnvFilter::new(rust_log);
    }
    let mut filter = EnvFilter::new(level.to_string());
    if let Ok(directive) = "tokio=warn".parse() {
        filter = filter.add_directive(directive);
    }
    filter
}

/// Install a global subscriber. Fails if one is already installed.
pub fn init_logging(
    level: Level,
    format: LogFormat,
    include_spans: bool,
) -> Result<(), TryInitError> {
    let subscriber = tracing_subscriber::registry().with(build_filter(level));

    match format {
        LogFormat::Json => subscriber
            .with(
                fmt::layer()
                    .json()
                    .with_thread_names(true)
                    .with_span_events(span_events(include_spans)),
            )
            .try_init(),
        LogFormat::Pretty => subscriber
            .with(
                fmt::layer()
                    .pretty()
                    .with_ansi(true)
                    .with_thread_names(true)
                    .with_span_events(span_events(include_spans)),
            )
            .try_init(),
        LogFormat::Compact => subscriber
            .with(
                fmt::layer()
                    .compact()
                    .with_ansi(true)
                    .with_target(false)
                    .with_span_events(span_events(include_spans)),
            )
            .try_init(),
    }
}

/// Install a global subscriber configured from environment variables
pub fn init_default_logging() -> Result<(), TryInitError> {
    let level = parse_level(&env::var("LOG_LEVEL").unwrap_or_default());
    let format = LogFormat::parse(&env::var("LOG_FORMAT").unwrap_or_default());
    let include_spans = parse_spans_flag(&env::var("LOG_SPANS").unwrap_or_default());
    init_logging(level, format, include_spans)
}

/// Span wrapping the lifetime of an I/O engine thread
#[macro_export]
macro_rules! engine_span {
    ($($field:tt)*) => {
        tracing::info_span!("nats_engine", $($field)*)
    };
}

/// Span wrapping one connection attempt and the session it establishes
#[macro_export]
macro_rules! connection_span {
    ($($field:tt)*) => {
        tracing::info_span!("nats_connection", $($field)*)
    };
}

pub use crate::{connection_span, engine_span};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_parse() {
        assert_eq!(LogFormat::parse("json"), LogFormat::Json);
        assert_eq!(LogFormat::parse("PRETTY"), LogFormat::Pretty);
        assert_eq!(LogFormat::parse(" compact\n"), LogFormat::Compact);
        assert_eq!(LogFormat::parse("xml"), LogFormat::Json);
    }

    #[test]
    fn test_parse_level() {
        let cases = [
            ("ERROR", Level::ERROR),
            ("warn", Level::WARN),
            ("Info", Level::INFO),
            ("debug", Level::DEBUG),
            ("TRACE", Level::TRACE),
            ("", Level::INFO),
            ("verbose", Level::INFO),
        ];
        for (input, expected) in cases {
            assert_eq!(parse_level(input), expected, "Failed for input: {input}");
        }
    }

    #[test]
    fn test_parse_spans_flag() {
        assert!(parse_spans_flag("true"));
        assert!(parse_spans_flag("TRUE"));
        assert!(!parse_spans_flag("1"));
        assert!(!parse_spans_flag(""));
    }

    #[test]
    fn test_span_macros_build_spans() {
        let engine = engine_span!(server = "127.0.0.1:4222");
        let _entered = engine.enter();
        let connection = connection_span!(attempt = 1u32);
        connection.in_scope(|| tracing::debug!("inside connection span"));
    }
}

//! Structured logging utilities.
//!
//! Provides logging initialization with contextual fields and formatting
//! options, plus span helpers for the hot paths.

use tracing::Span;
use tracing_subscriber::{fmt::format::FmtSpan, EnvFilter};

/// Log output format options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable format with colors (for development).
    Pretty,
    /// Compact format without colors.
    Compact,
    /// JSON format (for production).
    Json,
}

impl Default for LogFormat {
    fn default() -> Self {
        #[cfg(debug_assertions)]
        {
            LogFormat::Pretty
        }
        #[cfg(not(debug_assertions))]
        {
            LogFormat::Json
        }
    }
}

/// Configuration for logging behavior.
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub format: LogFormat,
    /// Whether to include file/line numbers.
    pub include_location: bool,
    /// Whether to include the target module.
    pub include_target: bool,
    /// Whether to log span events (enter/exit/close).
    pub log_spans: bool,
    /// Environment filter (e.g., "info,lattice=debug").
    pub filter: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::default(),
            include_location: cfg!(debug_assertions),
            include_target: true,
            log_spans: false,
            filter: None,
        }
    }
}

/// Initialize structured logging with configuration.
pub fn init_logging(config: LogConfig) -> anyhow::Result<()> {
    let env_filter = if let Some(filter) = config.filter {
        EnvFilter::try_new(filter)?
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,lattice=debug"))
    };

    let fmt_span = if config.log_spans { FmtSpan::NEW | FmtSpan::CLOSE } else { FmtSpan::NONE };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(config.include_target)
        .with_file(config.include_location)
        .with_line_number(config.include_location)
        .with_span_events(fmt_span);

    match config.format {
        LogFormat::Pretty => subscriber
            .pretty()
            .try_init()
            .map_err(|e| anyhow::anyhow!("failed to initialize pretty logger: {e}"))?,
        LogFormat::Compact => subscriber
            .compact()
            .try_init()
            .map_err(|e| anyhow::anyhow!("failed to initialize compact logger: {e}"))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|e| anyhow::anyhow!("failed to initialize JSON logger: {e}"))?,
    }

    tracing::info!(format = ?config.format, "logging initialized");
    Ok(())
}

/// A span covering one dispatched resolution.
pub fn dispatch_span(kind: &str, depth_remaining: u32) -> Span {
    tracing::debug_span!(
        "dispatch",
        kind = kind,
        depth_remaining = depth_remaining,
        dispatch_count = tracing::field::Empty,
    )
}

/// A span covering one datastore operation.
pub fn storage_span(operation: &str) -> Span {
    tracing::debug_span!("storage", operation = operation, duration_ms = tracing::field::Empty)
}

pub fn record_dispatch_count(span: &Span, dispatch_count: u32) {
    span.record("dispatch_count", dispatch_count);
}

pub fn record_storage_duration(span: &Span, duration_ms: u128) {
    span.record("duration_ms", duration_ms);
}

#[cfg(test)]
mod tests {
    use std::sync::Once;

    use super::*;

    static INIT: Once = Once::new();

    fn init_test_logging() {
        INIT.call_once(|| {
            let _ = init_logging(LogConfig {
                format: LogFormat::Compact,
                include_location: false,
                include_target: false,
                log_spans: false,
                filter: Some("debug".to_string()),
            });
        });
    }

    #[test]
    fn default_config_has_a_target() {
        let config = LogConfig::default();
        assert!(config.include_target);
    }

    #[test]
    fn spans_are_creatable() {
        init_test_logging();
        let span = dispatch_span("check", 50);
        let _entered = span.enter();
        record_dispatch_count(&span, 3);

        let storage = storage_span("query_relationships");
        record_storage_duration(&storage, 12);
    }
}

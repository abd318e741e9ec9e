//! Logging infrastructure for Inventory Warden.
//!
//! This module provides structured logging using the tracing ecosystem.

use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::{SubscriberInitExt, TryInitError},
    EnvFilter,
};

/// Crates whose events are enabled by the default filter.
const INVENTORY_TARGETS: [&str; 4] = ["iw_core", "iw_connectors", "iw_policy", "iw_observability"];

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Log level.
    pub level: Level,
    /// Whether to use JSON format.
    pub json_format: bool,
    /// Whether to include span events.
    pub include_spans: bool,
    /// Whether to include file/line info.
    pub include_location: bool,
    /// Whether to include thread IDs.
    pub include_thread_ids: bool,
    /// Whether to include target (module path).
    pub include_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            json_format: false,
            include_spans: false,
            include_location: true,
            include_thread_ids: false,
            include_target: true,
        }
    }
}

impl LoggingConfig {
    /// Verbose output for local scans against a dev subscription.
    pub fn development() -> Self {
        Self {
            level: Level::DEBUG,
            json_format: false,
            include_spans: true,
            include_location: true,
            include_thread_ids: true,
            include_target: true,
        }
    }

    /// JSON output for log aggregation.
    pub fn production() -> Self {
        Self {
            level: Level::INFO,
            json_format: true,
            include_spans: false,
            include_location: false,
            include_thread_ids: false,
            include_target: true,
        }
    }

    /// Applies `INVENTORY_LOG_LEVEL` and `INVENTORY_LOG_FORMAT` (`json` or
    /// `text`) from `lookup`. Unknown values are ignored.
    pub fn with_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(level) = lookup("INVENTORY_LOG_LEVEL").and_then(|v| v.trim().parse().ok()) {
            self.level = level;
        }
        match lookup("INVENTORY_LOG_FORMAT").as_deref().map(str::trim) {
            Some(f) if f.eq_ignore_ascii_case("json") => self.json_format = true,
            Some(f) if f.eq_ignore_ascii_case("text") => self.json_format = false,
            _ => {}
        }
        self
    }

    /// Builds the default directive string, e.g. `iw_core=info,iw_connectors=info,...`.
    pub fn default_directives(&self) -> String {
        INVENTORY_TARGETS
            .iter()
            .map(|target| format!("{}={}", target, self.level))
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Initializes logging from the defaults and the process environment.
pub fn init_logging() -> Result<(), TryInitError> {
    init_logging_with_config(
        LoggingConfig::default().with_overrides(|name| std::env::var(name).ok()),
    )
}

/// Initializes the logging system with the given configuration.
///
/// `RUST_LOG` takes precedence over the configured level when set. Fails
/// if a global subscriber is already installed.
pub fn init_logging_with_config(config: LoggingConfig) -> Result<(), TryInitError> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.default_directives()));

    let span_events = if config.include_spans {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    if config.json_format {
        let fmt_layer = fmt::layer()
            .json()
            .with_span_events(span_events)
            .with_file(config.include_location)
            .with_line_number(config.include_location)
            .with_thread_ids(config.include_thread_ids)
            .with_target(config.include_target);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()
    } else {
        let fmt_layer = fmt::layer()
            .with_span_events(span_events)
            .with_file(config.include_location)
            .with_line_number(config.include_location)
            .with_thread_ids(config.include_thread_ids)
            .with_target(config.include_target);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()
    }
}

/// Creates a span for a discovery scan of one subscription.
#[macro_export]
macro_rules! scan_span {
    ($job:expr, $subscription_id:expr) => {
        tracing::info_span!("scan", job = %$job, subscription_id = %$subscription_id)
    };
    ($job:expr, $subscription_id:expr, $($field:tt)*) => {
        tracing::info_span!("scan", job = %$job, subscription_id = %$subscription_id, $($field)*)
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = LoggingConfig::default();
        assert_eq!(config.level, Level::INFO);
        assert!(!config.json_format);
    }

    #[test]
    fn test_production_config() {
        let config = LoggingConfig::production();
        assert!(config.json_format);
        assert!(!config.include_location);
    }

    #[test]
    fn test_development_config() {
        let config = LoggingConfig::development();
        assert_eq!(config.level, Level::DEBUG);
        assert!(config.include_spans);
    }

    #[test]
    fn test_default_directives_cover_all_crates() {
        let directives = LoggingConfig::development().default_directives();
        assert!(directives.contains("iw_core=DEBUG"));
        assert!(directives.contains("iw_connectors=DEBUG"));
        assert!(directives.contains("iw_policy=DEBUG"));
        assert_eq!(directives.matches(',').count(), 3);
    }

    #[test]
    fn test_overrides_from_lookup() {
        let config = LoggingConfig::default().with_overrides(|name| match name {
            "INVENTORY_LOG_LEVEL" => Some("warn".to_string()),
            "INVENTORY_LOG_FORMAT" => Some("JSON".to_string()),
            _ => None,
        });
        assert_eq!(config.level, Level::WARN);
        assert!(config.json_format);

        let config = LoggingConfig::production().with_overrides(|name| match name {
            "INVENTORY_LOG_LEVEL" => Some("loud".to_string()),
            "INVENTORY_LOG_FORMAT" => Some("text".to_string()),
            _ => None,
        });
        assert_eq!(config.level, Level::INFO);
        assert!(!config.json_format);
    }

    #[test]
    fn test_scan_span_macro_builds_span() {
        let span = crate::scan_span!("full_refresh", "sub-1", resources = 3);
        // No subscriber is installed in unit tests, so the span is disabled.
        assert!(span.is_disabled());
    }
}

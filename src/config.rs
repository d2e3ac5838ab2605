//! Configuration for hooked connections.

use std::time::Duration;

/// Configuration options for a [`HookedConnection`](crate::HookedConnection).
///
/// These settings govern the connection itself; hooks such as
/// [`TracingHook`](crate::TracingHook) take no options.
///
/// # Example
///
/// ```rust
/// use sea_orm_query_hooks::ConnectionConfig;
/// use std::time::Duration;
///
/// let config = ConnectionConfig::default()
///     .with_statement_logging(true)
///     .with_slow_query_threshold(Duration::from_millis(100))
///     .with_default_timeout(Duration::from_secs(10));
/// ```
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Whether to include the SQL statement in the connection's debug logs.
    /// Default: `false` (statements may embed sensitive literals)
    pub log_statements: bool,

    /// Queries running longer than this are logged at WARN level.
    /// Default: 500ms
    pub slow_query_threshold: Duration,

    /// Timeout applied to queries whose context has no deadline.
    /// Default: `None`
    pub default_timeout: Option<Duration>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            log_statements: false,
            slow_query_threshold: Duration::from_millis(500),
            default_timeout: None,
        }
    }
}

impl ConnectionConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable SQL statement logging.
    ///
    /// **Security Warning**: statements are logged with their text only, but
    /// inline literals in that text end up in your logs.
    pub fn with_statement_logging(mut self, enabled: bool) -> Self {
        self.log_statements = enabled;
        self
    }

    /// Set the threshold for slow query warnings.
    pub fn with_slow_query_threshold(mut self, threshold: Duration) -> Self {
        self.slow_query_threshold = threshold;
        self
    }

    /// Fail queries that run longer than `timeout` when their context does
    /// not already carry a deadline.
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    /// Create a development-friendly configuration with statement logging.
    ///
    /// **Warning**: Do not use in production as it logs all SQL.
    pub fn development() -> Self {
        Self {
            log_statements: true,
            slow_query_threshold: Duration::from_millis(100),
            default_timeout: None,
        }
    }

    /// Create a production-safe configuration.
    pub fn production() -> Self {
        Self {
            log_statements: false,
            slow_query_threshold: Duration::from_secs(1),
            default_timeout: Some(Duration::from_secs(30)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = ConnectionConfig::default()
            .with_statement_logging(true)
            .with_default_timeout(Duration::from_secs(3));

        assert!(config.log_statements);
        assert_eq!(config.default_timeout, Some(Duration::from_secs(3)));
        assert_eq!(config.slow_query_threshold, Duration::from_millis(500));
    }

    #[test]
    fn test_presets() {
        let config = ConnectionConfig::development();
        assert!(config.log_statements);
        assert_eq!(config.default_timeout, None);

        let config = ConnectionConfig::production();
        assert!(!config.log_statements);
        assert_eq!(config.default_timeout, Some(Duration::from_secs(30)));
    }
}

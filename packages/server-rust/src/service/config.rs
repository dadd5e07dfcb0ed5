use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

/// Server-level configuration for per-call timeouts.
///
/// A timeout of `0` means "no timeout": calls to that method run unguarded.
/// Per-method entries are keyed by full method name (`service/method`) and
/// take precedence over the default.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Timeout applied to every unary method without an override, in milliseconds.
    pub default_timeout_ms: u64,
    /// Per-method overrides in milliseconds.
    pub method_timeouts_ms: HashMap<String, u64>,
    /// Whether the handler thread is interrupted on expiry. When false the call
    /// is still closed at the deadline but the handler runs to completion.
    pub interrupt: bool,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 30_000,
            method_timeouts_ms: HashMap::new(),
            interrupt: true,
        }
    }
}

/// Errors from loading a [`TimeoutConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read timeout config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid timeout config: {0}")]
    Parse(#[from] serde_json::Error),
}

impl TimeoutConfig {
    /// Configuration applying `timeout` to every method.
    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            default_timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            ..Self::default()
        }
    }

    /// Adds or replaces the override for one method.
    #[must_use]
    pub fn with_method_timeout(mut self, method: impl Into<String>, timeout: Duration) -> Self {
        self.method_timeouts_ms.insert(
            method.into(),
            u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        );
        self
    }

    /// Parses a JSON document. Missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Parse` if the document is not valid JSON or has
    /// fields of the wrong type.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Reads and parses a JSON file.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Io` if the file cannot be read, or
    /// `ConfigError::Parse` if its contents are invalid.
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&json)
    }

    /// Effective timeout for `method`, or `None` if calls to it run unguarded.
    #[must_use]
    pub fn timeout_for(&self, method: &str) -> Option<Duration> {
        let millis = self
            .method_timeouts_ms
            .get(method)
            .copied()
            .unwrap_or(self.default_timeout_ms);
        (millis > 0).then(|| Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn defaults() {
        let config = TimeoutConfig::default();
        assert_eq!(config.default_timeout_ms, 30_000);
        assert!(config.method_timeouts_ms.is_empty());
        assert!(config.interrupt);
    }

    #[test]
    fn method_override_wins() {
        let config = TimeoutConfig::with_timeout(Duration::from_secs(2))
            .with_method_timeout("svc.Slow/Run", Duration::from_secs(10));
        assert_eq!(
            config.timeout_for("svc.Slow/Run"),
            Some(Duration::from_secs(10))
        );
        assert_eq!(
            config.timeout_for("svc.Fast/Run"),
            Some(Duration::from_secs(2))
        );
    }

    #[test]
    fn zero_disables() {
        let config = TimeoutConfig::with_timeout(Duration::ZERO)
            .with_method_timeout("svc.Guarded/Run", Duration::from_millis(500));
        assert_eq!(config.timeout_for("svc.Any/Run"), None);
        assert_eq!(
            config.timeout_for("svc.Guarded/Run"),
            Some(Duration::from_millis(500))
        );

        let config = TimeoutConfig::default().with_method_timeout("svc.Open/Run", Duration::ZERO);
        assert_eq!(config.timeout_for("svc.Open/Run"), None);
    }

    #[test]
    fn parses_partial_json() {
        let config = TimeoutConfig::from_json(
            r#"{ "default_timeout_ms": 2000, "method_timeouts_ms": { "svc.Slow/Run": 0 } }"#,
        )
        .unwrap();
        assert_eq!(config.default_timeout_ms, 2000);
        assert!(config.interrupt);
        assert_eq!(config.timeout_for("svc.Slow/Run"), None);
    }

    #[test]
    fn rejects_malformed_json() {
        let err = TimeoutConfig::from_json(r#"{ "default_timeout_ms": "soon" }"#).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = TimeoutConfig::from_path(Path::new("/nonexistent/rpcguard.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    proptest! {
        #[test]
        fn override_takes_precedence(default_ms in 0u64..100_000, override_ms in 0u64..100_000) {
            let config = TimeoutConfig::with_timeout(Duration::from_millis(default_ms))
                .with_method_timeout("svc.A/Run", Duration::from_millis(override_ms));

            let expected = (override_ms > 0).then(|| Duration::from_millis(override_ms));
            prop_assert_eq!(config.timeout_for("svc.A/Run"), expected);
            let fallback = (default_ms > 0).then(|| Duration::from_millis(default_ms));
            prop_assert_eq!(config.timeout_for("svc.B/Run"), fallback);
        }
    }
}

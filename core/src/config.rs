//! Guard configuration loaded from TOML
//!
//! ```toml
//! [budget]
//! max_per_minute = 60
//! max_per_hour = 1000
//!
//! [dead_letter]
//! path = "var/dead_letters.json"
//!
//! [targets.search.retry]
//! strategy = "exponential"
//! initial_delay_ms = 100
//! max_delay_ms = 2000
//!
//! [targets.search.breaker]
//! failure_threshold = 5
//! cooldown_secs = 30.0
//! ```

use crate::budget::BudgetConfig;
use crate::circuit::BreakerConfig;
use crate::health::HealthConfig;
use crate::policy::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("validation failed: {}", .0.join(", "))]
    Validation(Vec<String>),
}

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    pub budget: BudgetConfig,
    pub dead_letter: DeadLetterConfig,
    pub logging: LoggingConfig,
    pub events: EventsConfig,
    pub alerts: AlertsConfig,
    pub targets: BTreeMap<String, TargetConfig>,
}

/// Everything registered for one target
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetConfig {
    pub retry: RetryPolicy,
    pub breaker: BreakerConfig,
    pub health: HealthConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeadLetterConfig {
    /// JSON file backing the queue; in-memory when absent
    pub path: Option<PathBuf>,
    /// Set false to run without a dead letter queue
    pub enabled: Option<bool>,
}

impl DeadLetterConfig {
    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    /// Broadcast channel capacity; slow subscribers lag past this
    pub capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self { capacity: 1024 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertsConfig {
    /// Alerts kept for listing; oldest are dropped first
    pub retained: usize,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self { retained: 500 }
    }
}

impl GuardConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: GuardConfig = toml::from_str(content)?;
        config.validate().map_err(ConfigError::Validation)?;
        Ok(config)
    }

    /// Semantic validation; collects every problem instead of stopping at the first
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = self.budget.validate();

        if self.events.capacity == 0 {
            errors.push("events.capacity must be positive".to_string());
        }
        if self.alerts.retained == 0 {
            errors.push("alerts.retained must be positive".to_string());
        }
        if let Err(err) = EnvFilter::try_new(&self.logging.filter) {
            errors.push(format!("logging.filter is invalid: {err}"));
        }

        for (name, target) in &self.targets {
            if name.trim().is_empty() {
                errors.push("target names must not be empty".to_string());
            }
            let problems = target
                .retry
                .validate()
                .into_iter()
                .chain(target.breaker.validate())
                .chain(target.health.validate());
            errors.extend(problems.map(|p| format!("targets.{name}: {p}")));
        }

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }

    /// Install the global subscriber with `logging.filter` as the fallback directive
    pub fn init_logging(&self) -> bool {
        crate::logging::init(&self.logging.filter)
    }
}

/// Load and validate configuration from a TOML file
pub fn load_config(path: &Path) -> Result<GuardConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    GuardConfig::from_toml_str(&content)
}

/// Serde adapter for `Duration` as integer milliseconds
pub(crate) mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Serde adapter for `Option<Duration>` as integer milliseconds
pub(crate) mod opt_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => serializer.serialize_some(&(duration.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(deserializer).map(|ms| ms.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::WindowMode;
    use crate::policy::BackoffStrategy;
    use std::io::Write;
    use std::time::Duration;

    const SAMPLE: &str = r#"
        [budget]
        max_per_minute = 30
        max_per_hour = 500
        mode = "fixed"

        [dead_letter]
        path = "/tmp/upstream-guard/dead_letters.json"

        [logging]
        filter = "upstream_guard=debug"

        [targets.search.retry]
        strategy = "fibonacci"
        initial_delay_ms = 50
        max_delay_ms = 5000
        attempt_timeout_ms = 1500

        [targets.search.breaker]
        failure_threshold = 3
        cooldown_secs = 10.0

        [targets.search.health]
        degraded_threshold = 1

        [targets.billing]
    "#;

    #[test]
    fn test_parse_full_config() {
        let config = GuardConfig::from_toml_str(SAMPLE).expect("valid config");

        assert_eq!(config.budget.max_per_minute, 30);
        assert_eq!(config.budget.mode, WindowMode::Fixed);
        assert_eq!(config.logging.filter, "upstream_guard=debug");
        assert_eq!(config.events.capacity, 1024);
        assert!(config.dead_letter.is_enabled());

        let search = &config.targets["search"];
        assert_eq!(search.retry.strategy, BackoffStrategy::Fibonacci);
        assert_eq!(search.retry.attempt_timeout, Some(Duration::from_millis(1500)));
        assert_eq!(search.breaker.failure_threshold, Some(3));
        assert_eq!(search.health.degraded_threshold, 1);

        assert_eq!(config.targets["billing"], TargetConfig::default());
    }

    #[test]
    fn test_validation_collects_all_errors() {
        let err = GuardConfig::from_toml_str(
            r#"
            [budget]
            max_per_minute = 10
            max_per_hour = 5

            [targets.search.retry]
            max_attempts = 0

            [targets.search.breaker]
            success_threshold = 0
            "#,
        )
        .expect_err("invalid config");

        match err {
            ConfigError::Validation(errors) => {
                assert_eq!(errors.len(), 3, "{errors:?}");
                assert!(errors.iter().any(|e| e.starts_with("targets.search:")));
            }
            other => panic!("expected validation error, got {other}"),
        }
    }

    #[test]
    fn test_logging_filter_is_validated_and_installed() {
        let err = GuardConfig::from_toml_str("[logging]\nfilter = \"upstream_guard=loud\"")
            .expect_err("bad level");
        assert!(matches!(
            err,
            ConfigError::Validation(ref errors) if errors[0].starts_with("logging.filter")
        ));

        let config = GuardConfig::from_toml_str(SAMPLE).expect("valid config");
        let _ = config.init_logging();
        assert!(!config.init_logging(), "subscriber is already installed");
    }

    #[test]
    fn test_parse_error_is_reported() {
        let err = GuardConfig::from_toml_str("[budget\nmax = 1").expect_err("broken toml");
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_load_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        file.write_all(SAMPLE.as_bytes()).expect("write");

        let config = load_config(file.path()).expect("loads");
        assert_eq!(config.targets.len(), 2);

        let missing = load_config(Path::new("/nonexistent/upstream-guard.toml"));
        assert!(matches!(missing, Err(ConfigError::Io(_))));
    }
}

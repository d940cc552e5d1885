//! Top-level configuration.
//!
//! Loaded from YAML, then overridden from the environment, then validated.
//! Every field has a default, so an empty document is a valid configuration.
//!
//! ```yaml
//! throttle:
//!   cpu_percent: 70
//!   memory_percent: 80
//!   check_interval: 5
//! rate_limit:
//!   high: { capacity: 200, refill_rate: 20 }
//! circuit_breaker:
//!   failure_threshold: 5
//!   open_duration: 60
//! outbox:
//!   batch_size: 10
//! ```

use crate::application::alerts::AlertConfig;
use crate::application::metrics::MetricsConfig;
use crate::application::monitor::MonitorConfig;
use crate::application::outbox::ProcessorConfig;
use crate::application::rate_limiter::RateLimiterConfig;
use crate::application::throttler::ThrottlerConfig;
use crate::domain::bucket::{PriorityClass, SpecError};
use crate::domain::circuit::{CircuitConfig, Dependency};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_CPU_THRESHOLD: &str = "THROTTLE_CPU_THRESHOLD";
pub const ENV_MEMORY_THRESHOLD: &str = "THROTTLE_MEMORY_THRESHOLD";
pub const ENV_FAILURE_THRESHOLD: &str = "CIRCUIT_BREAKER_FAILURE_THRESHOLD";
pub const ENV_OPEN_DURATION: &str = "CIRCUIT_BREAKER_OPEN_DURATION";
pub const ENV_REDIS_URL: &str = "REDIS_URL";

/// Error returned when configuration cannot be loaded or is invalid.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid value {value:?} for environment variable {var}")]
    InvalidEnv { var: &'static str, value: String },
    #[error("invalid {class} bucket: {source}")]
    Bucket {
        class: PriorityClass,
        #[source]
        source: SpecError,
    },
    #[error("{field} must be within (0, 100], got {value}")]
    InvalidPercent { field: &'static str, value: f64 },
    #[error("{0} must be greater than 0")]
    Zero(&'static str),
}

/// Throttler settings plus an on/off switch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleSettings {
    pub enabled: bool,
    #[serde(flatten)]
    pub throttler: ThrottlerConfig,
}

impl Default for ThrottleSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            throttler: ThrottlerConfig::default(),
        }
    }
}

/// Rate limiter settings plus an on/off switch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    pub enabled: bool,
    #[serde(flatten)]
    pub limiter: RateLimiterConfig,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            limiter: RateLimiterConfig::default(),
        }
    }
}

/// Circuit breaker settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitSettings {
    pub enabled: bool,
    #[serde(flatten)]
    pub thresholds: CircuitConfig,
    /// Circuit the admission pipeline checks
    pub dependency: Dependency,
    /// Circuits reported by the status report and health monitor
    pub monitored: Vec<Dependency>,
}

impl Default for CircuitSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            thresholds: CircuitConfig::default(),
            dependency: Dependency::Api,
            monitored: vec![
                Dependency::Api,
                Dependency::Database,
                Dependency::Cache,
                Dependency::Broker,
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    pub throttle: ThrottleSettings,
    pub rate_limit: RateLimitSettings,
    pub circuit_breaker: CircuitSettings,
    pub outbox: ProcessorConfig,
    pub monitor: MonitorConfig,
    pub metrics: MetricsConfig,
    pub alerts: AlertConfig,
    /// Shared store; in-memory storage is used when unset
    pub redis_url: Option<String>,
}

impl GuardConfig {
    /// Parse a YAML document. Environment overrides are not applied.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Load a YAML file, apply environment overrides, and validate.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_yaml(&yaml)?;
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults with environment overrides, validated.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|var| std::env::var(var).ok())
    }

    /// Apply overrides from an arbitrary variable source.
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(value) = lookup(ENV_CPU_THRESHOLD) {
            self.throttle.throttler.thresholds.cpu_percent = parse_env(ENV_CPU_THRESHOLD, value)?;
        }
        if let Some(value) = lookup(ENV_MEMORY_THRESHOLD) {
            self.throttle.throttler.thresholds.memory_percent =
                parse_env(ENV_MEMORY_THRESHOLD, value)?;
        }
        if let Some(value) = lookup(ENV_FAILURE_THRESHOLD) {
            self.circuit_breaker.thresholds.failure_threshold =
                parse_env(ENV_FAILURE_THRESHOLD, value)?;
        }
        if let Some(value) = lookup(ENV_OPEN_DURATION) {
            let secs: f64 = parse_env(ENV_OPEN_DURATION, value.clone())?;
            self.circuit_breaker.thresholds.open_duration = Duration::try_from_secs_f64(secs)
                .map_err(|_| ConfigError::InvalidEnv {
                    var: ENV_OPEN_DURATION,
                    value,
                })?;
        }
        if let Some(value) = lookup(ENV_REDIS_URL) {
            if !value.is_empty() {
                self.redis_url = Some(value);
            }
        }
        Ok(())
    }

    /// Reject configurations that could never work.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let thresholds = &self.throttle.throttler.thresholds;
        check_percent("throttle.cpu_percent", thresholds.cpu_percent)?;
        check_percent("throttle.memory_percent", thresholds.memory_percent)?;
        check_nonzero("throttle.check_interval", self.throttle.throttler.check_interval)?;

        for class in PriorityClass::ALL {
            self.rate_limit
                .limiter
                .spec(class)
                .validate()
                .map_err(|source| ConfigError::Bucket { class, source })?;
        }

        let circuit = &self.circuit_breaker.thresholds;
        if circuit.failure_threshold == 0 {
            return Err(ConfigError::Zero("circuit_breaker.failure_threshold"));
        }
        if circuit.success_threshold == 0 {
            return Err(ConfigError::Zero("circuit_breaker.success_threshold"));
        }
        check_nonzero("circuit_breaker.open_duration", circuit.open_duration)?;

        if self.outbox.batch_size == 0 {
            return Err(ConfigError::Zero("outbox.batch_size"));
        }
        check_nonzero("outbox.poll_interval", self.outbox.poll_interval)?;
        check_nonzero("outbox.publish_timeout", self.outbox.publish_timeout)?;
        check_nonzero("outbox.visibility_timeout", self.outbox.visibility_timeout)?;
        check_nonzero("monitor.interval", self.monitor.interval)?;

        if self.metrics.retention_days == 0 {
            return Err(ConfigError::Zero("metrics.retention_days"));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(var: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidEnv { var, value })
}

fn check_percent(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 && value <= 100.0 {
        Ok(())
    } else {
        Err(ConfigError::InvalidPercent { field, value })
    }
}

fn check_nonzero(field: &'static str, value: Duration) -> Result<(), ConfigError> {
    if value.is_zero() {
        Err(ConfigError::Zero(field))
    } else {
        Ok(())
    }
}

/// Serde helpers for durations written as (fractional) seconds.
pub mod duration_secs {
    use serde::{de, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(duration.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(de::Error::custom)
    }
}

//! Config - executor と circuit breaker の設定
//!
//! # 学習ポイント
//! - serde で JSON から読み込み（Duration はミリ秒）
//! - 環境変数は不正値を warn して既定値にフォールバック
//! - `validate()` で起動時に Fail-fast
//!
//! Sources:
//! - JSON settings file (`Settings::from_path`), durations in milliseconds
//! - environment variables (`ExecutorConfig::from_env`, `BreakerConfig::from_env`)
//!
//! ```bash
//! export KEEL_EXECUTOR_QUEUE_CAPACITY=128          # 0 = unbounded (default)
//! export KEEL_EXECUTOR_OVERFLOW=reject             # block (default) | reject
//! export KEEL_EXECUTOR_OPERATION_TIMEOUT_MS=5000   # unset = no deadline
//! export KEEL_BREAKER_PAYMENTS_FAILURE_THRESHOLD=3 # default 5
//! export KEEL_BREAKER_PAYMENTS_SUCCESS_THRESHOLD=2 # default 1
//! export KEEL_BREAKER_PAYMENTS_RESET_TIMEOUT_MS=10000
//! export KEEL_BREAKER_PAYMENTS_OPERATION_TIMEOUT_MS=2000
//! ```

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::ConfigError;

/// What a bounded queue does with a submission when it is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// `submit` waits for space.
    #[default]
    Block,
    /// `submit` fails with `SubmitError::QueueFull`.
    Reject,
}

impl FromStr for OverflowPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "block" => Ok(OverflowPolicy::Block),
            "reject" => Ok(OverflowPolicy::Reject),
            other => Err(ConfigError::invalid(
                "overflow",
                format!("expected 'block' or 'reject', got '{other}'"),
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Used in logs and operation records.
    pub name: String,

    /// 0 = unbounded.
    pub queue_capacity: usize,

    pub overflow: OverflowPolicy,

    /// Deadline for a single operation on the worker.
    #[serde(
        rename = "operation_timeout_ms",
        with = "millis::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub operation_timeout: Option<Duration>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            queue_capacity: 0,
            overflow: OverflowPolicy::Block,
            operation_timeout: None,
        }
    }
}

impl ExecutorConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_capacity(mut self, capacity: usize, overflow: OverflowPolicy) -> Self {
        self.queue_capacity = capacity;
        self.overflow = overflow;
        self
    }

    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = Some(timeout);
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::invalid("name", "must not be empty"));
        }
        if self.operation_timeout == Some(Duration::ZERO) {
            return Err(ConfigError::invalid("operation_timeout", "must be > 0"));
        }
        Ok(())
    }

    /// Load from `KEEL_EXECUTOR_*` environment variables.
    pub fn from_env(name: impl Into<String>) -> Self {
        Self::from_lookup(name, |key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(name: impl Into<String>, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::named(name);
        let queue_capacity = read_or(
            &lookup,
            "KEEL_EXECUTOR_QUEUE_CAPACITY",
            defaults.queue_capacity,
            |_| true,
        );
        let overflow = read_or(&lookup, "KEEL_EXECUTOR_OVERFLOW", defaults.overflow, |_| {
            true
        });
        let operation_timeout = read_opt_millis(&lookup, "KEEL_EXECUTOR_OPERATION_TIMEOUT_MS");

        info!(
            executor = %defaults.name,
            queue_capacity,
            overflow = ?overflow,
            operation_timeout = ?operation_timeout,
            "Executor configuration loaded"
        );

        Self {
            queue_capacity,
            overflow,
            operation_timeout,
            ..defaults
        }
    }
}

/// Trip on failure ratio over the most recent calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRateRule {
    /// Failure ratio in (0, 1] that opens the circuit.
    pub rate: f64,
    /// Calls required in the window before the ratio is evaluated.
    pub minimum_calls: u32,
    /// Number of most recent calls considered.
    pub window: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures (while Closed) that open the circuit.
    pub failure_threshold: u32,

    /// Consecutive HalfOpen successes that close it again.
    pub success_threshold: u32,

    /// Time spent Open, measured from the Open transition, before a probe.
    #[serde(rename = "reset_timeout_ms", with = "millis")]
    pub reset_timeout: Duration,

    /// Per-call limit; exceeding it counts as a failure.
    #[serde(
        rename = "operation_timeout_ms",
        with = "millis::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub operation_timeout: Option<Duration>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_rate: Option<FailureRateRule>,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 1,
            reset_timeout: Duration::from_secs(30),
            operation_timeout: None,
            failure_rate: None,
        }
    }
}

impl BreakerConfig {
    pub fn new(failure_threshold: u32, success_threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            failure_threshold,
            success_threshold,
            reset_timeout,
            ..Self::default()
        }
    }

    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = Some(timeout);
        self
    }

    pub fn with_failure_rate(mut self, rate: f64, minimum_calls: u32, window: usize) -> Self {
        self.failure_rate = Some(FailureRateRule {
            rate,
            minimum_calls,
            window,
        });
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::invalid("failure_threshold", "must be > 0"));
        }
        if self.success_threshold == 0 {
            return Err(ConfigError::invalid("success_threshold", "must be > 0"));
        }
        if self.reset_timeout.is_zero() {
            return Err(ConfigError::invalid("reset_timeout", "must be > 0"));
        }
        if self.operation_timeout == Some(Duration::ZERO) {
            return Err(ConfigError::invalid("operation_timeout", "must be > 0"));
        }
        if let Some(rule) = &self.failure_rate {
            if !(rule.rate > 0.0 && rule.rate <= 1.0) {
                return Err(ConfigError::invalid(
                    "failure_rate.rate",
                    format!("must be in (0, 1], got {}", rule.rate),
                ));
            }
            if rule.window == 0 {
                return Err(ConfigError::invalid("failure_rate.window", "must be > 0"));
            }
            if rule.minimum_calls as usize > rule.window {
                return Err(ConfigError::invalid(
                    "failure_rate.minimum_calls",
                    "must not exceed window",
                ));
            }
        }
        Ok(())
    }

    /// Load from `KEEL_BREAKER_<NAME>_*` environment variables.
    ///
    /// Invalid values are logged and replaced by defaults.
    pub fn from_env(breaker: &str) -> Self {
        Self::from_lookup(breaker, |key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(breaker: &str, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let prefix = format!("KEEL_BREAKER_{}", env_segment(breaker));
        let defaults = Self::default();

        let failure_threshold = read_or(
            &lookup,
            &format!("{prefix}_FAILURE_THRESHOLD"),
            defaults.failure_threshold,
            |v| *v > 0,
        );
        let success_threshold = read_or(
            &lookup,
            &format!("{prefix}_SUCCESS_THRESHOLD"),
            defaults.success_threshold,
            |v| *v > 0,
        );
        let reset_timeout_ms = read_or(
            &lookup,
            &format!("{prefix}_RESET_TIMEOUT_MS"),
            defaults.reset_timeout.as_millis() as u64,
            |v| *v > 0,
        );
        let operation_timeout = read_opt_millis(&lookup, &format!("{prefix}_OPERATION_TIMEOUT_MS"));

        info!(
            breaker = %breaker,
            failure_threshold,
            success_threshold,
            reset_timeout_ms,
            operation_timeout = ?operation_timeout,
            "Circuit breaker configuration loaded"
        );

        Self {
            failure_threshold,
            success_threshold,
            reset_timeout: Duration::from_millis(reset_timeout_ms),
            operation_timeout,
            failure_rate: None,
        }
    }
}

/// Whole settings file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub executor: ExecutorConfig,
    pub breaker: BreakerConfig,
}

impl Settings {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let settings: Settings = serde_json::from_str(json)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.executor.validate()?;
        self.breaker.validate()
    }
}

fn env_segment(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

fn read_or<T, F, V>(lookup: &F, key: &str, default: T, valid: V) -> T
where
    T: FromStr + std::fmt::Debug,
    F: Fn(&str) -> Option<String>,
    V: Fn(&T) -> bool,
{
    let Some(raw) = lookup(key) else {
        return default;
    };
    match raw.trim().parse::<T>() {
        Ok(value) if valid(&value) => value,
        _ => {
            warn!(key = %key, value = %raw, default = ?default, "Invalid value, using default");
            default
        }
    }
}

fn read_opt_millis<F>(lookup: &F, key: &str) -> Option<Duration>
where
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    match raw.trim().parse::<u64>() {
        Ok(ms) if ms > 0 => Some(Duration::from_millis(ms)),
        _ => {
            warn!(key = %key, value = %raw, "Invalid timeout, leaving unset");
            None
        }
    }
}

/// Serialize `Duration` as integer milliseconds.
mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }

    pub mod option {
        use std::time::Duration;

        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(
            value: &Option<Duration>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Duration>, D::Error> {
            Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
        }
    }
}

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use stepcore::FlowError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid value for {name}: {value}")]
    InvalidEnv { name: String, value: String },

    #[error("Invalid config: {0}")]
    Invalid(String),
}

impl From<ConfigError> for FlowError {
    fn from(e: ConfigError) -> Self {
        FlowError::Config(e.to_string())
    }
}

/// Configuration for the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Executions allowed in `running` at once; the rest wait in FIFO order.
    pub max_concurrent_executions: usize,
    /// Step invocations in flight across all executions.
    pub max_concurrent_steps: usize,
    /// Terminal executions retained in history.
    pub max_history: usize,
    pub event_buffer_size: usize,
    /// First retry delay; doubles on each further attempt.
    pub retry_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub limits: ValidationLimits,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_executions: 4,
            max_concurrent_steps: 10,
            max_history: 1000,
            event_buffer_size: 1000,
            retry_backoff_ms: 500,
            max_backoff_ms: 30_000,
            limits: ValidationLimits::default(),
        }
    }
}

/// Bounds enforced on workflow definitions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationLimits {
    pub max_name_len: usize,
    pub max_steps: usize,
    pub max_serialized_chars: usize,
    pub min_timeout_seconds: u64,
    pub max_timeout_seconds: u64,
    pub max_retries: u32,
    /// Timeouts above this are accepted with a performance warning.
    pub soft_timeout_seconds: u64,
}

impl Default for ValidationLimits {
    fn default() -> Self {
        Self {
            max_name_len: 100,
            max_steps: 50,
            max_serialized_chars: 10_000,
            min_timeout_seconds: 1,
            max_timeout_seconds: 3600,
            max_retries: 5,
            soft_timeout_seconds: 600,
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `STEPWISE_*` environment overrides.
    pub fn apply_env(self) -> Result<Self, ConfigError> {
        self.apply_env_from(|name| std::env::var(name).ok())
    }

    pub fn apply_env_from<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        override_from(&lookup, "STEPWISE_MAX_CONCURRENT_EXECUTIONS", &mut self.max_concurrent_executions)?;
        override_from(&lookup, "STEPWISE_MAX_CONCURRENT_STEPS", &mut self.max_concurrent_steps)?;
        override_from(&lookup, "STEPWISE_MAX_HISTORY", &mut self.max_history)?;
        override_from(&lookup, "STEPWISE_EVENT_BUFFER_SIZE", &mut self.event_buffer_size)?;
        override_from(&lookup, "STEPWISE_RETRY_BACKOFF_MS", &mut self.retry_backoff_ms)?;
        override_from(&lookup, "STEPWISE_MAX_BACKOFF_MS", &mut self.max_backoff_ms)?;
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_executions == 0 {
            return Err(ConfigError::Invalid("max_concurrent_executions must be greater than 0".into()));
        }
        if self.max_concurrent_steps == 0 {
            return Err(ConfigError::Invalid("max_concurrent_steps must be greater than 0".into()));
        }
        if self.max_history == 0 {
            return Err(ConfigError::Invalid("max_history must be greater than 0".into()));
        }
        if self.limits.min_timeout_seconds == 0
            || self.limits.min_timeout_seconds > self.limits.max_timeout_seconds
        {
            return Err(ConfigError::Invalid(format!(
                "timeout bounds [{}, {}] are not a valid range",
                self.limits.min_timeout_seconds, self.limits.max_timeout_seconds
            )));
        }
        Ok(())
    }

    /// Delay before retry number `retry` (1-based): base * 2^(retry-1), capped.
    pub fn backoff_delay(&self, retry: u32) -> Duration {
        let factor = 1u64.checked_shl(retry.saturating_sub(1)).unwrap_or(u64::MAX);
        let ms = self.retry_backoff_ms.saturating_mul(factor).min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

fn override_from<T, F>(lookup: &F, name: &str, target: &mut T) -> Result<(), ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    if let Some(raw) = lookup(name) {
        *target = raw.trim().parse().map_err(|_| ConfigError::InvalidEnv {
            name: name.to_string(),
            value: raw.clone(),
        })?;
    }
    Ok(())
}

//! TOML-driven retry policy implementation.
//!
//! `TomlRetryPolicy` loads a `PolicyConfig` from a TOML string or file and
//! implements the `RetryPolicy` trait from kasse-core.
//!
//! Decision algorithm, for the n-th recorded failure of an operation:
//!
//! 1. A permanent failure escalates at once.
//! 2. If `n >= max_retries` the operation escalates.
//! 3. Otherwise retry after `min(base * multiplier^(n-1), max)` milliseconds.

use std::path::Path;
use std::time::Duration;

use tracing::{debug, warn};

use kasse_contracts::{
    device::DeviceFailure,
    error::{KasseError, KasseResult},
};
use kasse_core::{
    traits::{RetryDecision, RetryPolicy},
    CoordinatorSettings,
};

use crate::rule::PolicyConfig;

/// A `RetryPolicy` implementation that reads its limits from a TOML document.
///
/// ```rust,ignore
/// use kasse_policy::TomlRetryPolicy;
///
/// let policy = TomlRetryPolicy::from_file(Path::new("policies/default.toml"))?;
/// let settings = policy.coordinator_settings();
/// ```
#[derive(Debug, Clone, Default)]
pub struct TomlRetryPolicy {
    config: PolicyConfig,
}

impl TomlRetryPolicy {
    /// Validate `config` and wrap it.
    pub fn new(config: PolicyConfig) -> KasseResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Parse `s` as TOML and build a `TomlRetryPolicy`.
    ///
    /// Returns `KasseError::ConfigError` if the TOML is malformed, has
    /// unknown keys, or holds out-of-range values.
    pub fn from_toml_str(s: &str) -> KasseResult<Self> {
        let config: PolicyConfig = toml::from_str(s).map_err(|e| KasseError::ConfigError {
            reason: format!("failed to parse policy TOML: {}", e),
        })?;
        Self::new(config)
    }

    /// Read the file at `path` and parse it as TOML policy configuration.
    pub fn from_file(path: &Path) -> KasseResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| KasseError::ConfigError {
            reason: format!("failed to read policy file '{}': {}", path.display(), e),
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    /// Delay before the next attempt after the `failures`-th failure (1-based).
    pub fn backoff(&self, failures: u32) -> Duration {
        let retry = &self.config.retry;
        let exponent = failures.saturating_sub(1).min(i32::MAX as u32) as i32;
        let scaled = retry.backoff_base_ms as f64 * retry.multiplier.powi(exponent);
        let capped = scaled.min(retry.backoff_max_ms as f64);
        Duration::from_millis(capped as u64)
    }

    /// Coordinator timing derived from the `[device]` and `[recovery]` sections.
    pub fn coordinator_settings(&self) -> CoordinatorSettings {
        CoordinatorSettings {
            device_timeout: Duration::from_millis(self.config.device.timeout_ms),
            sweep_interval: Duration::from_millis(self.config.recovery.sweep_interval_ms),
            ..CoordinatorSettings::default()
        }
    }
}

impl RetryPolicy for TomlRetryPolicy {
    fn decide(&self, retry_count: u32, failure: &DeviceFailure) -> RetryDecision {
        if !failure.transient {
            warn!(retry_count, reason = %failure.reason, "permanent device failure; escalating");
            return RetryDecision::Escalate {
                reason: format!("permanent device failure: {}", failure.reason),
            };
        }

        let max_retries = self.config.retry.max_retries;
        if retry_count >= max_retries {
            warn!(retry_count, max_retries, reason = %failure.reason, "retries exhausted; escalating");
            return RetryDecision::Escalate {
                reason: format!(
                    "{} of {} attempts failed, last: {}",
                    retry_count, max_retries, failure.reason
                ),
            };
        }

        let delay = self.backoff(retry_count);
        debug!(retry_count, delay_ms = delay.as_millis() as u64, "scheduling retry");
        RetryDecision::RetryAfter(delay)
    }
}

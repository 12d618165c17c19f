//! Retry policy configuration schema.
//!
//! A `PolicyConfig` is deserialized from TOML.  Every section and every key
//! is optional; missing values fall back to the defaults below.
//!
//! ```toml
//! [retry]
//! max_retries = 3
//! backoff_base_ms = 500
//! backoff_max_ms = 30000
//! multiplier = 2
//!
//! [device]
//! timeout_ms = 5000
//!
//! [recovery]
//! sweep_interval_ms = 60000
//! ```

use serde::{Deserialize, Serialize};

use kasse_contracts::error::{KasseError, KasseResult};

/// `[retry]`: how often and how patiently failed signings are retried.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetrySection {
    /// Failures after which an operation is escalated instead of retried.
    pub max_retries: u32,
    /// Delay after the first failure.
    pub backoff_base_ms: u64,
    /// Upper bound for any single delay.
    pub backoff_max_ms: u64,
    /// Growth factor between consecutive delays.
    pub multiplier: f64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self { max_retries: 3, backoff_base_ms: 500, backoff_max_ms: 30_000, multiplier: 2.0 }
    }
}

/// `[device]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DeviceSection {
    /// Bound on one signing call; elapsed counts as a transient failure.
    pub timeout_ms: u64,
}

impl Default for DeviceSection {
    fn default() -> Self {
        Self { timeout_ms: 5_000 }
    }
}

/// `[recovery]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RecoverySection {
    /// Period of the background sweep over unfinished operations.
    pub sweep_interval_ms: u64,
}

impl Default for RecoverySection {
    fn default() -> Self {
        Self { sweep_interval_ms: 60_000 }
    }
}

/// The top-level structure deserialized from a TOML policy file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PolicyConfig {
    pub retry: RetrySection,
    pub device: DeviceSection,
    pub recovery: RecoverySection,
}

impl PolicyConfig {
    /// Reject values that would make the coordinator spin or never escalate.
    pub fn validate(&self) -> KasseResult<()> {
        let invalid = |reason: String| Err(KasseError::ConfigError { reason });

        if self.retry.max_retries == 0 {
            return invalid("retry.max_retries must be at least 1".to_string());
        }
        if !self.retry.multiplier.is_finite() || self.retry.multiplier < 1.0 {
            return invalid(format!(
                "retry.multiplier must be a finite number >= 1, got {}",
                self.retry.multiplier
            ));
        }
        if self.retry.backoff_base_ms > self.retry.backoff_max_ms {
            return invalid(format!(
                "retry.backoff_base_ms ({}) exceeds retry.backoff_max_ms ({})",
                self.retry.backoff_base_ms, self.retry.backoff_max_ms
            ));
        }
        if self.device.timeout_ms == 0 {
            return invalid("device.timeout_ms must be greater than zero".to_string());
        }
        if self.recovery.sweep_interval_ms == 0 {
            return invalid("recovery.sweep_interval_ms must be greater than zero".to_string());
        }
        Ok(())
    }
}

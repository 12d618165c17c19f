//! Coordinator runtime settings.

use std::time::Duration;

/// Timing knobs that are not part of the retry policy itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorSettings {
    /// Upper bound for one `SigningGateway::sign` call.  Elapsed means
    /// transient failure, never success.
    pub device_timeout: Duration,
    /// Period of the background recovery sweep.
    pub sweep_interval: Duration,
    /// Capacity of the operation update broadcast channel.
    pub update_channel_capacity: usize,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            device_timeout: Duration::from_secs(5),
            sweep_interval: Duration::from_secs(60),
            update_channel_capacity: 256,
        }
    }
}

//! Tuning for batching windows and conflict backoff.
//!
//! Values are read from the provider `configure` payload. Every key is
//! optional:
//!
//! ```json
//! {
//!   "iam_batch_delay_ms": 1000,
//!   "iam_initial_backoff_ms": 1000,
//!   "iam_max_backoff_ms": 30000
//! }
//! ```

use std::time::Duration;

use serde::Deserialize;

use crate::error::IamError;

/// How long a batcher waits for more callers before executing.
pub const DEFAULT_BATCH_DELAY: Duration = Duration::from_secs(1);

/// First sleep after a conflicting write.
pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_secs(1);

/// Once the next backoff would exceed this, the conflict is surfaced.
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Largest accepted `iam_max_backoff_ms`.
pub const MAX_BACKOFF_LIMIT: Duration = Duration::from_secs(60 * 60);

/// Batching and retry settings shared by every batcher in a registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IamConfig {
    /// Batching window measured from the first request of a batch.
    pub batch_delay: Duration,
    /// Initial conflict backoff, doubled after every conflict.
    pub initial_backoff: Duration,
    /// Backoff ceiling; exceeding it aborts the retry loop.
    pub max_backoff: Duration,
}

impl Default for IamConfig {
    fn default() -> Self {
        Self {
            batch_delay: DEFAULT_BATCH_DELAY,
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct RawIamConfig {
    iam_batch_delay_ms: Option<u64>,
    iam_initial_backoff_ms: Option<u64>,
    iam_max_backoff_ms: Option<u64>,
}

impl IamConfig {
    /// Read settings from a provider configuration object.
    ///
    /// Unknown keys are ignored so the same payload can carry the rest of the
    /// provider configuration. `null` is treated as an empty object.
    pub fn from_provider_config(config: &serde_json::Value) -> Result<Self, IamError> {
        let raw: RawIamConfig = if config.is_null() {
            RawIamConfig::default()
        } else {
            serde_json::from_value(config.clone())
                .map_err(|e| IamError::Configuration(e.to_string()))?
        };

        let defaults = Self::default();
        let config = Self {
            batch_delay: raw
                .iam_batch_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.batch_delay),
            initial_backoff: raw
                .iam_initial_backoff_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.initial_backoff),
            max_backoff: raw
                .iam_max_backoff_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.max_backoff),
        };
        config.validate()?;
        Ok(config)
    }

    /// Check the settings are usable.
    pub fn validate(&self) -> Result<(), IamError> {
        if self.initial_backoff.is_zero() {
            return Err(IamError::Configuration(
                "iam_initial_backoff_ms must be greater than zero".to_string(),
            ));
        }
        if self.max_backoff > MAX_BACKOFF_LIMIT {
            return Err(IamError::Configuration(format!(
                "iam_max_backoff_ms ({}) exceeds the limit of {}",
                self.max_backoff.as_millis(),
                MAX_BACKOFF_LIMIT.as_millis()
            )));
        }
        if self.initial_backoff > self.max_backoff {
            return Err(IamError::Configuration(format!(
                "iam_initial_backoff_ms ({}) exceeds iam_max_backoff_ms ({})",
                self.initial_backoff.as_millis(),
                self.max_backoff.as_millis()
            )));
        }
        if self.batch_delay > self.max_backoff {
            return Err(IamError::Configuration(format!(
                "iam_batch_delay_ms ({}) exceeds iam_max_backoff_ms ({})",
                self.batch_delay.as_millis(),
                self.max_backoff.as_millis()
            )));
        }
        Ok(())
    }
}

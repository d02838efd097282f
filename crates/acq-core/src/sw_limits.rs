//! Software acquisition limits.
//!
//! Drivers whose hardware cannot stop by itself after N samples or T
//! milliseconds keep a [`SwLimits`] in their private state and consult it
//! from their event-source callback.

use std::time::{Duration, Instant};

use crate::config::{ConfigKey, ConfigValue};
use crate::error::{AcqError, AcqResult};

#[derive(Debug, Clone, Default)]
pub struct SwLimits {
    /// Zero means unlimited.
    pub limit_samples: u64,
    /// Zero means unlimited.
    pub limit_msec: u64,
    samples_read: u64,
    start_time: Option<Instant>,
}

impl SwLimits {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handles `LimitSamples` and `LimitMsec`; anything else is not applicable.
    pub fn config_get(&self, key: ConfigKey) -> AcqResult<ConfigValue> {
        match key {
            ConfigKey::LimitSamples => Ok(ConfigValue::UInt64(self.limit_samples)),
            ConfigKey::LimitMsec => Ok(ConfigValue::UInt64(self.limit_msec)),
            _ => Err(AcqError::NotApplicable),
        }
    }

    pub fn config_set(&mut self, key: ConfigKey, value: &ConfigValue) -> AcqResult<()> {
        let limit = match key {
            ConfigKey::LimitSamples | ConfigKey::LimitMsec => value
                .as_u64()
                .ok_or_else(|| AcqError::arg(format!("'{}' expects an unsigned integer", key)))?,
            _ => return Err(AcqError::NotApplicable),
        };
        if key == ConfigKey::LimitSamples {
            self.limit_samples = limit;
        } else {
            self.limit_msec = limit;
        }
        Ok(())
    }

    /// Reset counters at the start of an acquisition.
    pub fn acquisition_start(&mut self) {
        self.samples_read = 0;
        self.start_time = Some(Instant::now());
    }

    pub fn update_samples_read(&mut self, samples: u64) {
        self.samples_read = self.samples_read.saturating_add(samples);
    }

    pub fn samples_read(&self) -> u64 {
        self.samples_read
    }

    /// Samples still allowed before the sample limit, if one is set.
    pub fn samples_remaining(&self) -> Option<u64> {
        (self.limit_samples > 0).then(|| self.limit_samples.saturating_sub(self.samples_read))
    }

    /// True once any configured limit has been reached.
    pub fn check(&self) -> bool {
        if self.limit_samples > 0 && self.samples_read >= self.limit_samples {
            tracing::debug!(samples = self.samples_read, "Sample limit reached");
            return true;
        }
        if self.limit_msec > 0 {
            if let Some(start) = self.start_time {
                if start.elapsed() >= Duration::from_millis(self.limit_msec) {
                    tracing::debug!(limit_msec = self.limit_msec, "Time limit reached");
                    return true;
                }
            }
        }
        false
    }
}

//! Tunables for detection, recovery, retry and scanning.
//!
//! [`HealthConfig`] gathers every timing and threshold the engine uses. The
//! defaults mirror a production deployment; tests shrink them freely.
//! Durations serialize in serde's native `{ secs, nanos }` form so the struct
//! can be embedded in a host application's own configuration file.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use static_assertions::const_assert;

use crate::error::ConfigError;

const DEFAULT_SETTLE_DELAY_MS: u64 = 3_000;
const DEFAULT_COOLDOWN_DELAY_MS: u64 = 30_000;
const DEFAULT_ERROR_THRESHOLD: u32 = 3;

// A cooldown no longer than the settle delay would hot-loop against a dead backend.
const_assert!(DEFAULT_COOLDOWN_DELAY_MS > DEFAULT_SETTLE_DELAY_MS);
const_assert!(DEFAULT_ERROR_THRESHOLD >= 1);

/// Configuration for the health monitor and its components.
///
/// # Default Values
/// - `window`: 5 minutes
/// - `error_threshold`: 3
/// - `max_attempts`: 3
/// - `settle_delay`: 3 seconds
/// - `verify_delay`: 5 seconds
/// - `cooldown_delay`: 30 seconds
/// - `step_timeout`: 10 seconds
/// - `base_scan_interval`: 30 seconds
/// - `liveness_timeout`: 3 seconds
/// - `retry_max_attempts`: 3
/// - `retry_max_age`: 30 minutes
/// - `drain_interval`: 500 milliseconds
/// - `sweep_interval`: 5 minutes
///
/// # Invariants
/// - counts are at least 1
/// - `cooldown_delay` exceeds `settle_delay`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Length of the error observation window.
    pub window: Duration,
    /// Classified errors within one window that open an incident.
    pub error_threshold: u32,
    /// Recovery attempts before an incident is marked exhausted.
    pub max_attempts: u32,
    /// Wait between tearing down state and reconnecting.
    pub settle_delay: Duration,
    /// Wait between a successful reconnect and the health probe.
    pub verify_delay: Duration,
    /// Wait before re-attempting a failed recovery.
    pub cooldown_delay: Duration,
    /// Upper bound on every collaborator call.
    pub step_timeout: Duration,
    /// Scan interval while every tracked connection is healthy.
    pub base_scan_interval: Duration,
    /// Upper bound on the scheduler's reachability check.
    pub liveness_timeout: Duration,
    /// Resend attempts allowed per pending message.
    pub retry_max_attempts: u32,
    /// Age after which a pending message is discarded.
    pub retry_max_age: Duration,
    /// Gap between consecutive resends during a drain.
    pub drain_interval: Duration,
    /// Interval of the maintenance sweep.
    pub sweep_interval: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(5 * 60),
            error_threshold: DEFAULT_ERROR_THRESHOLD,
            max_attempts: 3,
            settle_delay: Duration::from_millis(DEFAULT_SETTLE_DELAY_MS),
            verify_delay: Duration::from_secs(5),
            cooldown_delay: Duration::from_millis(DEFAULT_COOLDOWN_DELAY_MS),
            step_timeout: Duration::from_secs(10),
            base_scan_interval: Duration::from_secs(30),
            liveness_timeout: Duration::from_secs(3),
            retry_max_attempts: 3,
            retry_max_age: Duration::from_secs(30 * 60),
            drain_interval: Duration::from_millis(500),
            sweep_interval: Duration::from_secs(5 * 60),
        }
    }
}

impl HealthConfig {
    /// Check the configuration for values the engine cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ZeroCount`] for a zero threshold or attempt cap,
    /// [`ConfigError::ZeroDuration`] for a zero window, timeout or interval, and
    /// [`ConfigError::CooldownTooShort`] if the cooldown does not exceed the
    /// settle delay.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let counts = [
            ("error_threshold", self.error_threshold),
            ("max_attempts", self.max_attempts),
            ("retry_max_attempts", self.retry_max_attempts),
        ];
        if let Some((field, _)) = counts.iter().find(|(_, v)| *v == 0) {
            return Err(ConfigError::ZeroCount { field: *field });
        }
        let durations = [
            ("window", self.window),
            ("step_timeout", self.step_timeout),
            ("base_scan_interval", self.base_scan_interval),
            ("liveness_timeout", self.liveness_timeout),
            ("retry_max_age", self.retry_max_age),
            ("sweep_interval", self.sweep_interval),
        ];
        if let Some((field, _)) = durations.iter().find(|(_, v)| v.is_zero()) {
            return Err(ConfigError::ZeroDuration { field: *field });
        }
        if self.cooldown_delay <= self.settle_delay {
            return Err(ConfigError::CooldownTooShort {
                cooldown: self.cooldown_delay,
                settle: self.settle_delay,
            });
        }
        Ok(())
    }

    /// Clamp values to sane bounds.
    ///
    /// Zero counts become 1, zero windows and intervals become one millisecond,
    /// and a cooldown that does not exceed the settle delay is doubled past it.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::time::Duration;
    ///
    /// use relink::config::HealthConfig;
    ///
    /// let cfg = HealthConfig {
    ///     error_threshold: 0,
    ///     settle_delay: Duration::from_secs(4),
    ///     cooldown_delay: Duration::from_secs(1),
    ///     ..HealthConfig::default()
    /// };
    ///
    /// let normalized = cfg.normalized();
    /// assert_eq!(normalized.error_threshold, 1);
    /// assert_eq!(normalized.cooldown_delay, Duration::from_secs(8));
    /// assert!(normalized.validate().is_ok());
    /// ```
    #[must_use]
    pub fn normalized(mut self) -> Self {
        let floor = Duration::from_millis(1);
        self.error_threshold = self.error_threshold.max(1);
        self.max_attempts = self.max_attempts.max(1);
        self.retry_max_attempts = self.retry_max_attempts.max(1);
        for value in [
            &mut self.window,
            &mut self.step_timeout,
            &mut self.base_scan_interval,
            &mut self.liveness_timeout,
            &mut self.retry_max_age,
            &mut self.sweep_interval,
        ] {
            *value = (*value).max(floor);
        }
        if self.cooldown_delay <= self.settle_delay {
            self.cooldown_delay = (self.settle_delay * 2).max(floor);
        }
        self
    }

    /// Age after which a quiet, healthy incident is garbage collected.
    #[must_use]
    pub fn incident_idle_ttl(&self) -> Duration { self.window * 2 }
}

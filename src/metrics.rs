//! Metric helpers for `relink`.
//!
//! This module defines metric names and small helper functions wrapping the
//! [`metrics`](https://docs.rs/metrics) crate. With the `metrics` feature
//! disabled every helper compiles to a no-op.

#[cfg(feature = "metrics")]
use metrics::{counter, gauge};

/// Name of the counter tracking classified protocol errors.
pub const PROTOCOL_ERRORS: &str = "relink_protocol_errors_total";
/// Name of the counter tracking finished recovery attempts.
pub const RECOVERIES: &str = "relink_recoveries_total";
/// Name of the counter tracking retry queue events.
pub const RETRY_MESSAGES: &str = "relink_retry_messages_total";
/// Name of the gauge tracking incidents that are not healthy.
pub const INCIDENTS_UNHEALTHY: &str = "relink_incidents_unhealthy";
/// Name of the gauge tracking messages waiting for a resend.
pub const RETRY_PENDING: &str = "relink_retry_pending";

/// Result of one recovery attempt, as recorded in metrics.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecoveryResult {
    /// The session reconnected and verified healthy.
    Success,
    /// The attempt failed and another is scheduled.
    Failed,
    /// The attempt cap was reached.
    Exhausted,
}

impl RecoveryResult {
    #[cfg_attr(not(feature = "metrics"), allow(dead_code))]
    fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Exhausted => "exhausted",
        }
    }
}

/// Retry queue event, as recorded in metrics.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryEvent {
    /// A new message entered the queue.
    Queued,
    /// A message was resent successfully.
    Resent,
    /// A resend failed and the message stays queued.
    Failed,
    /// A message exceeded the attempt cap.
    Dropped,
    /// A message exceeded the maximum age.
    Expired,
}

impl RetryEvent {
    #[cfg_attr(not(feature = "metrics"), allow(dead_code))]
    fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Resent => "resent",
            Self::Failed => "failed",
            Self::Dropped => "dropped",
            Self::Expired => "expired",
        }
    }
}

/// Record a classified protocol error for the given category label.
pub fn inc_protocol_errors(category: &'static str) {
    #[cfg(feature = "metrics")]
    counter!(PROTOCOL_ERRORS, "category" => category).increment(1);
    #[cfg(not(feature = "metrics"))]
    let _ = category;
}

/// Record the result of a recovery attempt.
pub fn inc_recoveries(result: RecoveryResult) {
    #[cfg(feature = "metrics")]
    counter!(RECOVERIES, "outcome" => result.as_str()).increment(1);
    #[cfg(not(feature = "metrics"))]
    let _ = result;
}

/// Record a retry queue event.
pub fn inc_retry(event: RetryEvent) {
    #[cfg(feature = "metrics")]
    counter!(RETRY_MESSAGES, "result" => event.as_str()).increment(1);
    #[cfg(not(feature = "metrics"))]
    let _ = event;
}

/// Publish the number of non-healthy incidents.
#[cfg_attr(
    feature = "metrics",
    expect(clippy::cast_precision_loss, reason = "gauge values are approximate")
)]
pub fn set_unhealthy_incidents(count: usize) {
    #[cfg(feature = "metrics")]
    gauge!(INCIDENTS_UNHEALTHY).set(count as f64);
    #[cfg(not(feature = "metrics"))]
    let _ = count;
}

/// Publish the number of pending messages.
#[cfg_attr(
    feature = "metrics",
    expect(clippy::cast_precision_loss, reason = "gauge values are approximate")
)]
pub fn set_retry_pending(count: usize) {
    #[cfg(feature = "metrics")]
    gauge!(RETRY_PENDING).set(count as f64);
    #[cfg(not(feature = "metrics"))]
    let _ = count;
}

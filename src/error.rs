//! Canonical error types for the crate.
//!
//! Collaborators report failures as [`CollaboratorError`]. The recovery
//! procedure wraps each failed step in a [`StepError`] so that timeouts,
//! collaborator failures and failed health probes share one surface. None of
//! these reach callers of the reporting entry points; they end up as state
//! transitions or log records.

use std::time::Duration;

use thiserror::Error;

/// Failure returned by an external collaborator.
#[non_exhaustive]
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CollaboratorError {
    /// The collaborator could not be reached or is not ready.
    #[error("collaborator unavailable: {0}")]
    Unavailable(String),
    /// The resource the call targets does not exist.
    #[error("not found: {0}")]
    NotFound(String),
    /// The collaborator refused the request.
    #[error("rejected: {0}")]
    Rejected(String),
}

impl CollaboratorError {
    /// Returns true if the error reports an absent resource.
    #[must_use]
    pub fn is_not_found(&self) -> bool { matches!(self, Self::NotFound(_)) }
}

/// Steps of the recovery procedure, in execution order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RecoveryStep {
    /// Advertise the connection as disconnected.
    MarkDisconnected,
    /// Remove persisted cryptographic session material.
    PurgeSession,
    /// Clear the shared ephemeral client cache.
    ClearCache,
    /// Reconnect the messaging session.
    Reconnect,
    /// Probe the reconnected session.
    Verify,
    /// Advertise the final status after recovery settles.
    PublishStatus,
}

impl RecoveryStep {
    /// Stable label used in logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::MarkDisconnected => "mark_disconnected",
            Self::PurgeSession => "purge_session",
            Self::ClearCache => "clear_cache",
            Self::Reconnect => "reconnect",
            Self::Verify => "verify",
            Self::PublishStatus => "publish_status",
        }
    }

    /// Returns true if a failure of this step fails the whole attempt.
    #[must_use]
    pub const fn is_load_bearing(self) -> bool { matches!(self, Self::Reconnect | Self::Verify) }
}

impl std::fmt::Display for RecoveryStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.write_str(self.as_str()) }
}

/// Failure of a single recovery step.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StepError {
    /// The collaborator call did not complete within the step timeout.
    #[error("{step} timed out after {timeout:?}")]
    TimedOut {
        /// Step that timed out.
        step: RecoveryStep,
        /// Timeout that elapsed.
        timeout: Duration,
    },
    /// The collaborator returned an error.
    #[error("{step} failed: {source}")]
    Failed {
        /// Step that failed.
        step: RecoveryStep,
        /// Underlying collaborator error.
        #[source]
        source: CollaboratorError,
    },
    /// The health probe answered but reported the session as unhealthy.
    #[error("health probe reported the session unhealthy")]
    Unhealthy,
    /// The attempt panicked before reaching a verdict.
    #[error("recovery attempt panicked: {0}")]
    Panicked(String),
}

impl StepError {
    /// Step this error belongs to, if known.
    #[must_use]
    pub const fn step(&self) -> Option<RecoveryStep> {
        match self {
            Self::TimedOut { step, .. } | Self::Failed { step, .. } => Some(*step),
            Self::Unhealthy => Some(RecoveryStep::Verify),
            Self::Panicked(_) => None,
        }
    }

    /// Log label of [`Self::step`].
    #[must_use]
    pub const fn step_label(&self) -> &'static str {
        match self.step() {
            Some(step) => step.as_str(),
            None => "unknown",
        }
    }
}

/// Errors reported by [`crate::config::HealthConfig::validate`].
#[non_exhaustive]
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A count that must be at least one was zero.
    #[error("{field} must be at least 1")]
    ZeroCount {
        /// Offending field name.
        field: &'static str,
    },
    /// A duration that must be positive was zero.
    #[error("{field} must be greater than zero")]
    ZeroDuration {
        /// Offending field name.
        field: &'static str,
    },
    /// The cooldown was not longer than the settle delay.
    #[error("cooldown_delay ({cooldown:?}) must exceed settle_delay ({settle:?})")]
    CooldownTooShort {
        /// Configured cooldown.
        cooldown: Duration,
        /// Configured settle delay.
        settle: Duration,
    },
}

/// Errors returned when building a [`crate::monitor::HealthMonitor`].
#[non_exhaustive]
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BuildError {
    /// A required collaborator was not supplied.
    #[error("missing collaborator: {0}")]
    MissingCollaborator(&'static str),
    /// The supplied configuration is invalid.
    #[error("invalid configuration: {0}")]
    InvalidConfig(#[from] ConfigError),
}

//! Per-connection incident records and the tracker deciding when to recover.
//!
//! A [`ConnectionIncident`] accumulates classified errors inside a fixed
//! observation window. Crossing the threshold while healthy flips the record to
//! [`RecoveryState::Recovering`]; that transition doubles as the mutual
//! exclusion guard ensuring a single recovery per connection.

mod store;
mod tracker;

pub use store::{InMemoryIncidentStore, IncidentStore};
use tokio::time::Instant;
pub use tracker::{FailureTransition, IncidentDecision, IncidentTracker};

use crate::session::ConnectionId;

/// Recovery state of one connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RecoveryState {
    /// No recovery is running or pending.
    Healthy,
    /// A recovery procedure is in flight.
    Recovering,
    /// The last attempt failed; a re-attempt is scheduled.
    CooldownAfterFailure,
    /// The attempt cap was reached; only an operator reset clears this.
    Exhausted,
}

impl RecoveryState {
    /// Stable label used in logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Recovering => "recovering",
            Self::CooldownAfterFailure => "cooldown_after_failure",
            Self::Exhausted => "exhausted",
        }
    }
}

impl std::fmt::Display for RecoveryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.write_str(self.as_str()) }
}

/// Tracked state of suspected session corruption for one connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionIncident {
    /// Connection this incident belongs to.
    pub connection: ConnectionId,
    /// Start of the current observation window.
    pub window_start: Instant,
    /// Time of the most recent classified error.
    pub last_error_at: Instant,
    /// Classified errors inside the current window.
    pub error_count: u32,
    /// Current recovery state.
    pub recovery_state: RecoveryState,
    /// Recovery procedures run for the current incident.
    pub recovery_attempts: u32,
    /// Text of the error or trigger that last advanced the incident.
    pub last_reason: Option<String>,
    /// Bumped on every reset, so cooldowns scheduled before it go stale.
    pub generation: u64,
}

impl ConnectionIncident {
    /// Create a fresh, healthy record with an empty window starting at `now`.
    #[must_use]
    pub fn new(connection: ConnectionId, now: Instant) -> Self {
        Self {
            connection,
            window_start: now,
            last_error_at: now,
            error_count: 0,
            recovery_state: RecoveryState::Healthy,
            recovery_attempts: 0,
            last_reason: None,
            generation: 0,
        }
    }

    /// Returns true unless the state is [`RecoveryState::Healthy`].
    #[must_use]
    pub fn is_unhealthy(&self) -> bool { self.recovery_state != RecoveryState::Healthy }

    /// Condense the record for an operator notification.
    #[must_use]
    pub fn summary(&self) -> IncidentSummary {
        IncidentSummary {
            connection: self.connection,
            state: self.recovery_state,
            recovery_attempts: self.recovery_attempts,
            error_count: self.error_count,
            last_reason: self.last_reason.clone(),
        }
    }
}

/// Operator-facing digest of an incident.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IncidentSummary {
    /// Affected connection.
    pub connection: ConnectionId,
    /// State at the time of the summary.
    pub state: RecoveryState,
    /// Recovery attempts made.
    pub recovery_attempts: u32,
    /// Errors counted in the last window.
    pub error_count: u32,
    /// Most recent trigger or error text.
    pub last_reason: Option<String>,
}

impl std::fmt::Display for IncidentSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} is {} after {} recovery attempt(s); last reason: {}",
            self.connection,
            self.state,
            self.recovery_attempts,
            self.last_reason.as_deref().unwrap_or("unknown")
        )
    }
}

//! Windowed error accounting and the recovery guard.

use std::{sync::Arc, time::Duration};

use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{ConnectionIncident, InMemoryIncidentStore, IncidentStore, RecoveryState};
use crate::{
    classifier::{ProtocolError, classify},
    config::HealthConfig,
    metrics,
    session::ConnectionId,
};

/// Result of reporting a classified error.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IncidentDecision {
    /// True if the caller now owns the recovery guard and must run recovery.
    pub should_recover: bool,
    /// Incident record after accounting the error.
    pub incident: ConnectionIncident,
}

/// Outcome of recording a failed recovery attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FailureTransition {
    /// Attempts made so far, including the failed one.
    pub attempts: u32,
    /// True if the cap was reached and the incident is now exhausted.
    pub exhausted: bool,
    /// Incident generation the failure was recorded against.
    pub generation: u64,
}

/// Accumulates classified errors per connection and decides when to recover.
///
/// The window is fixed rather than sliding-log: once `window` has elapsed since
/// `window_start`, the next error opens a new window. This keeps memory per
/// connection constant.
pub struct IncidentTracker {
    store: Arc<dyn IncidentStore>,
    window: Duration,
    threshold: u32,
    idle_ttl: Duration,
}

impl IncidentTracker {
    /// Create a tracker backed by an [`InMemoryIncidentStore`].
    #[must_use]
    pub fn new(config: &HealthConfig) -> Self {
        Self::with_store(config, Arc::new(InMemoryIncidentStore::new()))
    }

    /// Create a tracker over a caller-supplied store.
    #[must_use]
    pub fn with_store(config: &HealthConfig, store: Arc<dyn IncidentStore>) -> Self {
        Self {
            store,
            window: config.window,
            threshold: config.error_threshold.max(1),
            idle_ttl: config.incident_idle_ttl(),
        }
    }

    /// Account `error` for `connection` at the current time.
    ///
    /// Returns `None` if the classifier does not consider `error` a sign of
    /// session corruption; such errors never touch the incident.
    pub fn report(&self, connection: ConnectionId, error: &ProtocolError) -> Option<IncidentDecision> {
        self.report_at(connection, error, Instant::now())
    }

    /// Account `error` for `connection` as if it arrived at `now`.
    ///
    /// The window reset, the count, and the `Healthy` → `Recovering`
    /// transition all happen inside one store update, so concurrent reports for
    /// the same connection can never both win the guard.
    pub fn report_at(
        &self,
        connection: ConnectionId,
        error: &ProtocolError,
        now: Instant,
    ) -> Option<IncidentDecision> {
        if !classify(error) {
            debug!(%connection, error = %error, "ignoring unrelated error");
            return None;
        }
        metrics::inc_protocol_errors(error.effective_category().as_str());

        let window = self.window;
        let threshold = self.threshold;
        let mut should_recover = false;
        let incident = self.store.upsert(connection, now, &mut |incident| {
            if now.saturating_duration_since(incident.window_start) > window {
                incident.window_start = now;
                incident.error_count = 0;
            }
            incident.error_count = incident.error_count.saturating_add(1);
            incident.last_error_at = now;
            incident.last_reason = Some(error.to_string());
            if incident.error_count >= threshold
                && incident.recovery_state == RecoveryState::Healthy
            {
                incident.recovery_state = RecoveryState::Recovering;
                should_recover = true;
            }
        });

        if should_recover {
            warn!(
                %connection,
                errors = incident.error_count,
                threshold,
                "error threshold crossed; recovery required"
            );
            self.publish_unhealthy();
        } else {
            debug!(
                %connection,
                errors = incident.error_count,
                state = %incident.recovery_state,
                "protocol error recorded"
            );
        }
        Some(IncidentDecision {
            should_recover,
            incident,
        })
    }

    /// Take the recovery guard for `connection` without an error threshold.
    ///
    /// Returns true if the connection was healthy and is now recovering.
    pub fn try_begin_recovery(&self, connection: ConnectionId, reason: &str) -> bool {
        let mut acquired = false;
        self.store.upsert(connection, Instant::now(), &mut |incident| {
            if incident.recovery_state == RecoveryState::Healthy {
                incident.recovery_state = RecoveryState::Recovering;
                incident.last_reason = Some(reason.to_owned());
                acquired = true;
            }
        });
        if acquired {
            info!(%connection, reason, "manual recovery requested");
            self.publish_unhealthy();
        }
        acquired
    }

    /// Move a cooled-down incident back to `Recovering` for a re-attempt.
    ///
    /// `generation` is the one reported by the failure that started the
    /// cooldown. Returns false if the incident was reset or removed since,
    /// even if a later incident is cooling down in its place.
    pub fn resume_recovery(&self, connection: ConnectionId, generation: u64) -> bool {
        let mut resumed = false;
        self.store.update(connection, &mut |incident| {
            if incident.recovery_state == RecoveryState::CooldownAfterFailure
                && incident.generation == generation
            {
                incident.recovery_state = RecoveryState::Recovering;
                resumed = true;
            }
        });
        resumed
    }

    /// Record a verified recovery: the incident becomes healthy with its
    /// attempt counter and error window reset.
    pub fn mark_recovered(&self, connection: ConnectionId) {
        let now = Instant::now();
        self.store.update(connection, &mut |incident| {
            incident.recovery_state = RecoveryState::Healthy;
            incident.recovery_attempts = 0;
            incident.error_count = 0;
            incident.window_start = now;
        });
        self.publish_unhealthy();
    }

    /// Record a failed recovery attempt against a cap of `max_attempts`.
    ///
    /// The incident moves to `CooldownAfterFailure` while attempts remain and
    /// to `Exhausted` once the cap is reached. Returns `None`, changing nothing,
    /// unless the incident exists and is `Recovering`.
    pub fn record_failure(
        &self,
        connection: ConnectionId,
        max_attempts: u32,
    ) -> Option<FailureTransition> {
        let mut transition = None;
        self.store.update(connection, &mut |incident| {
            if incident.recovery_state != RecoveryState::Recovering {
                return;
            }
            incident.recovery_attempts = incident.recovery_attempts.saturating_add(1).min(max_attempts);
            let exhausted = incident.recovery_attempts >= max_attempts;
            incident.recovery_state = if exhausted {
                RecoveryState::Exhausted
            } else {
                RecoveryState::CooldownAfterFailure
            };
            transition = Some(FailureTransition {
                attempts: incident.recovery_attempts,
                exhausted,
                generation: incident.generation,
            });
        });
        transition
    }

    /// Clear an incident after operator intervention.
    ///
    /// Returns false, changing nothing, while a recovery is in flight; the
    /// guard must not be released from outside the procedure holding it.
    pub fn reset(&self, connection: ConnectionId) -> bool {
        let mut cleared = false;
        let now = Instant::now();
        self.store.update(connection, &mut |incident| {
            if incident.recovery_state != RecoveryState::Recovering {
                incident.recovery_state = RecoveryState::Healthy;
                incident.recovery_attempts = 0;
                incident.error_count = 0;
                incident.window_start = now;
                incident.generation = incident.generation.wrapping_add(1);
                cleared = true;
            }
        });
        if cleared {
            info!(%connection, "incident reset");
            self.publish_unhealthy();
        }
        cleared
    }

    /// Remove healthy incidents whose last error is older than twice the
    /// window. Returns the number removed.
    pub fn sweep(&self, now: Instant) -> usize {
        let ttl = self.idle_ttl;
        let removed = self.store.remove_where(&|incident| {
            incident.recovery_state == RecoveryState::Healthy
                && now.saturating_duration_since(incident.last_error_at) > ttl
        });
        if removed > 0 {
            debug!(removed, "swept idle incidents");
        }
        removed
    }

    /// Copy of the incident for `connection`, if tracked.
    #[must_use]
    pub fn snapshot(&self, connection: ConnectionId) -> Option<ConnectionIncident> {
        self.store.get(connection)
    }

    /// Returns true if any tracked incident is not healthy.
    #[must_use]
    pub fn has_unhealthy(&self) -> bool { self.unhealthy_count() > 0 }

    /// Number of incidents that are not healthy.
    #[must_use]
    pub fn unhealthy_count(&self) -> usize {
        self.store.count_where(&ConnectionIncident::is_unhealthy)
    }

    /// Number of tracked incidents.
    #[must_use]
    pub fn len(&self) -> usize { self.store.len() }

    /// Returns true if no incidents are tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.store.is_empty() }

    fn publish_unhealthy(&self) { metrics::set_unhealthy_incidents(self.unhealthy_count()); }
}

//! The per-connection recovery procedure.
//!
//! [`RecoveryOrchestrator::recover`] runs one attempt of the sequence
//! disconnect, purge, clear cache, settle, reconnect, verify. The first three
//! steps are best effort; reconnect and verify are load-bearing and any
//! failure there takes the failure branch. Failed attempts cool down and try
//! again on the orchestrator's task tracker until the attempt cap is reached,
//! after which the incident is parked as exhausted and an operator is told.

mod step;

use std::{panic::AssertUnwindSafe, sync::Arc, time::Duration};

use futures::FutureExt;
use tokio::{select, time::sleep};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info, warn};

use self::step::{best_effort, run_step};
use crate::{
    config::HealthConfig,
    error::{RecoveryStep, StepError},
    incident::IncidentTracker,
    metrics::{self, RecoveryResult},
    panic::PanicMessage,
    ports::{OperatorNotifier, SessionControl},
    retry::PendingRetryQueue,
    session::{ConnectionId, ConnectionStatus},
};

/// Result of one recovery attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// The session reconnected and verified healthy.
    Success,
    /// The attempt failed; a re-attempt follows the cooldown.
    Failed,
    /// The attempt failed and the cap is reached.
    Exhausted,
}

/// Verdict of one attempt as seen by the loop driving it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Attempted {
    Finished(RecoveryOutcome),
    /// Failed with attempts left; the cooldown belongs to `generation`.
    CoolingDown { generation: u64 },
}

impl Attempted {
    fn outcome(self) -> RecoveryOutcome {
        match self {
            Self::Finished(outcome) => outcome,
            Self::CoolingDown { .. } => RecoveryOutcome::Failed,
        }
    }
}

/// Collaborators the recovery procedure drives.
#[derive(Clone)]
pub struct RecoveryPorts {
    /// Messaging client control surface.
    pub control: Arc<dyn SessionControl>,
    /// Escalation target for exhausted incidents.
    pub notifier: Arc<dyn OperatorNotifier>,
}

struct Timing {
    max_attempts: u32,
    settle_delay: Duration,
    verify_delay: Duration,
    cooldown_delay: Duration,
    step_timeout: Duration,
}

struct Inner {
    tracker: Arc<IncidentTracker>,
    queue: Arc<PendingRetryQueue>,
    ports: RecoveryPorts,
    timing: Timing,
    tasks: TaskTracker,
    shutdown: CancellationToken,
}

/// Drives recovery attempts and owns the tasks they spawn.
///
/// Cloning is cheap and every clone shares one task tracker.
#[derive(Clone)]
pub struct RecoveryOrchestrator {
    inner: Arc<Inner>,
}

impl RecoveryOrchestrator {
    /// Create an orchestrator updating `tracker` and draining `queue` after a
    /// successful recovery.
    #[must_use]
    pub fn new(
        config: &HealthConfig,
        tracker: Arc<IncidentTracker>,
        queue: Arc<PendingRetryQueue>,
        ports: RecoveryPorts,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                tracker,
                queue,
                ports,
                timing: Timing {
                    max_attempts: config.max_attempts.max(1),
                    settle_delay: config.settle_delay,
                    verify_delay: config.verify_delay,
                    cooldown_delay: config.cooldown_delay,
                    step_timeout: config.step_timeout,
                },
                tasks: TaskTracker::new(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Run one recovery attempt for `connection`.
    ///
    /// The caller must hold the recovery guard, i.e. the incident must be in
    /// `Recovering`. A failed attempt that has attempts left schedules its own
    /// re-attempt after the cooldown, unless the orchestrator shuts down first.
    /// A panicking attempt counts as a failed one.
    pub async fn recover(&self, connection: ConnectionId, reason: &str) -> RecoveryOutcome {
        let attempted = self.guarded_attempt(connection, reason).await;
        if let Attempted::CoolingDown { generation } = attempted {
            self.schedule_cooldown(connection, reason.to_owned(), generation);
        }
        attempted.outcome()
    }

    /// Run [`Self::recover`] in the background.
    pub fn spawn_recovery(&self, connection: ConnectionId, reason: impl Into<String>) {
        let this = self.clone();
        let reason = reason.into();
        self.inner.tasks.spawn(async move {
            this.recover(connection, &reason).await;
        });
    }

    /// Wait until no recovery, cooldown or drain task is running.
    pub async fn wait_idle(&self) {
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        self.inner.tasks.reopen();
    }

    /// Abandon pending cooldowns and wait for running tasks to finish.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
    }

    /// Number of tasks currently tracked.
    #[must_use]
    pub fn active_tasks(&self) -> usize { self.inner.tasks.len() }

    /// Run one attempt, turning a panic into a failed attempt so the recovery
    /// guard is never left held.
    async fn guarded_attempt(&self, connection: ConnectionId, reason: &str) -> Attempted {
        let attempt = AssertUnwindSafe(self.attempt(connection, reason)).catch_unwind();
        match attempt.await {
            Ok(attempted) => attempted,
            Err(payload) => {
                let error = StepError::Panicked(PanicMessage::new(payload).to_string());
                error!(%connection, %error, "recovery attempt panicked");
                self.on_failure(connection, &error).await
            }
        }
    }

    async fn attempt(&self, connection: ConnectionId, reason: &str) -> Attempted {
        let Inner { ports, timing, .. } = &*self.inner;
        let control = &ports.control;
        let limit = timing.step_timeout;
        info!(%connection, reason, "recovery attempt started");

        best_effort(
            connection,
            RecoveryStep::MarkDisconnected,
            limit,
            control.set_connection_status(connection, ConnectionStatus::Disconnected),
        )
        .await;
        best_effort(
            connection,
            RecoveryStep::PurgeSession,
            limit,
            control.purge_session_material(connection),
        )
        .await;
        best_effort(
            connection,
            RecoveryStep::ClearCache,
            limit,
            control.clear_shared_cache(),
        )
        .await;
        sleep(timing.settle_delay).await;

        match self.reconnect_and_verify(connection).await {
            Ok(()) => self.on_success(connection).await,
            Err(error) => self.on_failure(connection, &error).await,
        }
    }

    async fn reconnect_and_verify(&self, connection: ConnectionId) -> Result<(), StepError> {
        let Inner { ports, timing, .. } = &*self.inner;
        let limit = timing.step_timeout;
        run_step(RecoveryStep::Reconnect, limit, ports.control.reconnect(connection)).await?;
        sleep(timing.verify_delay).await;
        let healthy =
            run_step(RecoveryStep::Verify, limit, ports.control.probe_health(connection)).await?;
        if healthy { Ok(()) } else { Err(StepError::Unhealthy) }
    }

    async fn on_success(&self, connection: ConnectionId) -> Attempted {
        let inner = &*self.inner;
        inner.tracker.mark_recovered(connection);
        metrics::inc_recoveries(RecoveryResult::Success);
        info!(%connection, "connection recovered");
        best_effort(
            connection,
            RecoveryStep::PublishStatus,
            inner.timing.step_timeout,
            inner
                .ports
                .control
                .set_connection_status(connection, ConnectionStatus::Connected),
        )
        .await;

        let queue = Arc::clone(&inner.queue);
        inner.tasks.spawn(async move {
            queue.drain(connection).await;
        });
        Attempted::Finished(RecoveryOutcome::Success)
    }

    async fn on_failure(&self, connection: ConnectionId, error: &StepError) -> Attempted {
        let inner = &*self.inner;
        let step = error.step_label();
        let Some(transition) = inner
            .tracker
            .record_failure(connection, inner.timing.max_attempts)
        else {
            warn!(%connection, step, %error, "recovery failure ignored; incident no longer recovering");
            return Attempted::Finished(RecoveryOutcome::Failed);
        };

        if !transition.exhausted {
            warn!(
                %connection,
                step,
                %error,
                attempt = transition.attempts,
                max_attempts = inner.timing.max_attempts,
                cooldown_ms = duration_ms(inner.timing.cooldown_delay),
                "recovery attempt failed; cooling down"
            );
            metrics::inc_recoveries(RecoveryResult::Failed);
            return Attempted::CoolingDown {
                generation: transition.generation,
            };
        }

        error!(
            %connection,
            step,
            %error,
            attempt = transition.attempts,
            "recovery attempts exhausted; operator attention required"
        );
        metrics::inc_recoveries(RecoveryResult::Exhausted);
        if let Some(incident) = inner.tracker.snapshot(connection) {
            let summary = incident.summary();
            let notify = inner.ports.notifier.notify_operator(connection, &summary);
            if tokio::time::timeout(inner.timing.step_timeout, notify)
                .await
                .is_err()
            {
                warn!(%connection, "operator notification timed out");
            }
        }
        best_effort(
            connection,
            RecoveryStep::PublishStatus,
            inner.timing.step_timeout,
            inner
                .ports
                .control
                .set_connection_status(connection, ConnectionStatus::NeedsAttention),
        )
        .await;
        Attempted::Finished(RecoveryOutcome::Exhausted)
    }

    #[expect(
        clippy::integer_division_remainder_used,
        reason = "tokio::select! expands to modulus internally"
    )]
    fn schedule_cooldown(&self, connection: ConnectionId, reason: String, mut generation: u64) {
        let this = self.clone();
        self.inner.tasks.spawn(async move {
            loop {
                select! {
                    biased;

                    () = this.inner.shutdown.cancelled() => {
                        debug!(%connection, "shutdown during cooldown; re-attempt abandoned");
                        return;
                    }
                    () = sleep(this.inner.timing.cooldown_delay) => {}
                }
                if !this.inner.tracker.resume_recovery(connection, generation) {
                    debug!(%connection, "incident left cooldown; re-attempt skipped");
                    return;
                }
                match this.guarded_attempt(connection, &reason).await {
                    Attempted::CoolingDown { generation: next } => generation = next,
                    Attempted::Finished(_) => return,
                }
            }
        });
    }
}

impl std::fmt::Debug for RecoveryOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryOrchestrator")
            .field("max_attempts", &self.inner.timing.max_attempts)
            .field("active_tasks", &self.inner.tasks.len())
            .finish_non_exhaustive()
    }
}

fn duration_ms(duration: Duration) -> u64 { u64::try_from(duration.as_millis()).unwrap_or(u64::MAX) }

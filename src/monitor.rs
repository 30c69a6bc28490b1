//! Facade wiring the tracker, orchestrator, retry queue and scheduler.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use tokio::{
    select,
    time::{Instant, sleep},
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, info};

use crate::{
    classifier::ProtocolError,
    config::HealthConfig,
    error::BuildError,
    incident::{ConnectionIncident, IncidentDecision, IncidentStore, IncidentTracker},
    ports::{ConnectionDirectory, MessageSender, OperatorNotifier, SessionControl},
    recovery::{RecoveryOrchestrator, RecoveryPorts},
    retry::{EnqueueOutcome, OutboundMessage, PendingRetryQueue, RetryStats, RetryStore},
    scheduler::{HealthCheckScheduler, ScanReport, SchedulerState},
    session::{ConnectionId, TenantId},
};

/// Entries removed by one maintenance sweep.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Idle healthy incidents removed.
    pub incidents: usize,
    /// Pending messages past their maximum age removed.
    pub messages: usize,
}

/// Builder for [`HealthMonitor`].
///
/// The four collaborator ports are required. Stores default to the in-memory
/// implementations.
#[derive(Default)]
#[must_use]
pub struct HealthMonitorBuilder {
    config: HealthConfig,
    control: Option<Arc<dyn SessionControl>>,
    sender: Option<Arc<dyn MessageSender>>,
    notifier: Option<Arc<dyn OperatorNotifier>>,
    directory: Option<Arc<dyn ConnectionDirectory>>,
    incident_store: Option<Arc<dyn IncidentStore>>,
    retry_store: Option<Arc<dyn RetryStore>>,
}

impl HealthMonitorBuilder {
    /// Use `config` instead of [`HealthConfig::default`].
    pub fn config(mut self, config: HealthConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the messaging client control surface.
    pub fn session_control(mut self, control: Arc<dyn SessionControl>) -> Self {
        self.control = Some(control);
        self
    }

    /// Set the sender used to drain the retry queue.
    pub fn message_sender(mut self, sender: Arc<dyn MessageSender>) -> Self {
        self.sender = Some(sender);
        self
    }

    /// Set the operator escalation target.
    pub fn operator_notifier(mut self, notifier: Arc<dyn OperatorNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Set the connection directory polled by the scheduler.
    pub fn directory(mut self, directory: Arc<dyn ConnectionDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    /// Store incidents in `store`.
    pub fn incident_store(mut self, store: Arc<dyn IncidentStore>) -> Self {
        self.incident_store = Some(store);
        self
    }

    /// Store pending messages in `store`.
    pub fn retry_store(mut self, store: Arc<dyn RetryStore>) -> Self {
        self.retry_store = Some(store);
        self
    }

    /// Validate the configuration and assemble the monitor.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError::InvalidConfig`] if the configuration fails
    /// [`HealthConfig::validate`] and [`BuildError::MissingCollaborator`] if a
    /// required port was not set.
    pub fn build(self) -> Result<HealthMonitor, BuildError> {
        self.config.validate()?;
        let control = self
            .control
            .ok_or(BuildError::MissingCollaborator("session_control"))?;
        let sender = self
            .sender
            .ok_or(BuildError::MissingCollaborator("message_sender"))?;
        let notifier = self
            .notifier
            .ok_or(BuildError::MissingCollaborator("operator_notifier"))?;
        let directory = self
            .directory
            .ok_or(BuildError::MissingCollaborator("directory"))?;

        let config = self.config;
        let tracker = Arc::new(match self.incident_store {
            Some(store) => IncidentTracker::with_store(&config, store),
            None => IncidentTracker::new(&config),
        });
        let queue = Arc::new(match self.retry_store {
            Some(store) => PendingRetryQueue::with_store(&config, sender, store),
            None => PendingRetryQueue::new(&config, sender),
        });
        let orchestrator = RecoveryOrchestrator::new(
            &config,
            Arc::clone(&tracker),
            Arc::clone(&queue),
            RecoveryPorts { control, notifier },
        );
        let scheduler = Arc::new(HealthCheckScheduler::new(
            &config,
            directory,
            Arc::clone(&tracker),
            orchestrator.clone(),
        ));
        Ok(HealthMonitor {
            config,
            tracker,
            queue,
            orchestrator,
            scheduler,
            tasks: TaskTracker::new(),
            shutdown: CancellationToken::new(),
            started: AtomicBool::new(false),
        })
    }
}

/// Connection-health engine for one process.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
///
/// use relink::{
///     classifier::ProtocolError,
///     monitor::HealthMonitor,
///     ports::{ConnectionDirectory, MessageSender, OperatorNotifier, SessionControl},
///     session::ConnectionId,
/// };
///
/// # async fn demo(
/// #     control: Arc<dyn SessionControl>,
/// #     sender: Arc<dyn MessageSender>,
/// #     notifier: Arc<dyn OperatorNotifier>,
/// #     directory: Arc<dyn ConnectionDirectory>,
/// # ) -> Result<(), relink::error::BuildError> {
/// let monitor = Arc::new(
///     HealthMonitor::builder()
///         .session_control(control)
///         .message_sender(sender)
///         .operator_notifier(notifier)
///         .directory(directory)
///         .build()?,
/// );
/// monitor.start();
/// monitor.report_protocol_error(ConnectionId::new(1), &ProtocolError::unclassified("Bad MAC"));
/// monitor.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct HealthMonitor {
    config: HealthConfig,
    tracker: Arc<IncidentTracker>,
    queue: Arc<PendingRetryQueue>,
    orchestrator: RecoveryOrchestrator,
    scheduler: Arc<HealthCheckScheduler>,
    tasks: TaskTracker,
    shutdown: CancellationToken,
    started: AtomicBool,
}

impl HealthMonitor {
    /// Start configuring a monitor.
    pub fn builder() -> HealthMonitorBuilder { HealthMonitorBuilder::default() }

    /// Configuration the monitor was built with.
    #[must_use]
    pub fn config(&self) -> &HealthConfig { &self.config }

    /// Report a protocol error observed on `connection`.
    ///
    /// Errors the classifier does not recognise are ignored and return
    /// `None`. When the report crosses the threshold a recovery is spawned in
    /// the background.
    pub fn report_protocol_error(
        &self,
        connection: ConnectionId,
        error: &ProtocolError,
    ) -> Option<IncidentDecision> {
        let decision = self.tracker.report(connection, error)?;
        if decision.should_recover {
            self.orchestrator.spawn_recovery(connection, error.to_string());
        }
        Some(decision)
    }

    /// Park a message that failed to send so it is resent after recovery.
    pub fn report_send_failure(
        &self,
        connection: ConnectionId,
        tenant: TenantId,
        message: OutboundMessage,
        error: ProtocolError,
    ) -> EnqueueOutcome {
        self.queue.enqueue(message, connection, tenant, error)
    }

    /// Start a recovery for `connection` regardless of its error count.
    ///
    /// Returns false if the connection is not healthy, which includes a
    /// recovery already running.
    pub fn request_recovery(&self, connection: ConnectionId, reason: &str) -> bool {
        if !self.tracker.try_begin_recovery(connection, reason) {
            return false;
        }
        self.orchestrator.spawn_recovery(connection, reason);
        true
    }

    /// Run one health scan now.
    pub async fn scan_once(&self) -> ScanReport { self.scheduler.scan_once().await }

    /// Clear an incident after operator intervention.
    ///
    /// Returns false while a recovery is running.
    pub fn reset_incident(&self, connection: ConnectionId) -> bool { self.tracker.reset(connection) }

    /// Incident record for `connection`, if tracked.
    #[must_use]
    pub fn incident(&self, connection: ConnectionId) -> Option<ConnectionIncident> {
        self.tracker.snapshot(connection)
    }

    /// Aggregate retry queue statistics.
    #[must_use]
    pub fn retry_stats(&self) -> RetryStats { self.queue.stats() }

    /// Scheduler state.
    #[must_use]
    pub fn scheduler_state(&self) -> SchedulerState { self.scheduler.state() }

    /// Remove idle incidents and expired messages as of `now`.
    pub fn sweep(&self, now: Instant) -> SweepReport {
        let report = SweepReport {
            incidents: self.tracker.sweep(now),
            messages: self.queue.sweep(now),
        };
        if report.incidents > 0 || report.messages > 0 {
            debug!(
                incidents = report.incidents,
                messages = report.messages,
                "maintenance sweep"
            );
        }
        report
    }

    /// Spawn the scan loop and the maintenance loop.
    ///
    /// Calling `start` again has no effect.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(
            scan_interval_ms = millis(self.config.base_scan_interval),
            sweep_interval_ms = millis(self.config.sweep_interval),
            "health monitor started"
        );
        let scheduler = Arc::clone(&self.scheduler);
        let token = self.shutdown.clone();
        self.tasks.spawn(async move { scheduler.run(token).await });

        let this = Arc::clone(self);
        self.tasks.spawn(async move { this.maintenance_loop().await });
    }

    /// Wait for every background recovery and drain task to finish.
    pub async fn wait_idle(&self) { self.orchestrator.wait_idle().await; }

    /// Stop the loops, abandon pending cooldowns and wait for running tasks.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        self.orchestrator.shutdown().await;
        info!("health monitor stopped");
    }

    #[expect(
        clippy::integer_division_remainder_used,
        reason = "tokio::select! expands to modulus internally"
    )]
    async fn maintenance_loop(&self) {
        loop {
            select! {
                biased;

                () = self.shutdown.cancelled() => break,
                () = sleep(self.config.sweep_interval) => {}
            }
            self.sweep(Instant::now());
        }
    }
}

fn millis(duration: Duration) -> u64 { u64::try_from(duration.as_millis()).unwrap_or(u64::MAX) }

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("started", &self.started.load(Ordering::Relaxed))
            .field("scheduler", &self.scheduler.state())
            .field("orchestrator", &self.orchestrator)
            .finish_non_exhaustive()
    }
}

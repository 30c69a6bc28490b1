//! Periodic health scan over all active connections.
//!
//! Each scan pulls the error signals recorded since the previous scan and feeds
//! them through the same classify → report → recover path as pushed reports.
//! The scan interval halves while any incident is unhealthy.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, SystemTime},
};

use dashmap::DashMap;
use tokio::{select, time::timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    config::HealthConfig,
    incident::IncidentTracker,
    ports::ConnectionDirectory,
    recovery::RecoveryOrchestrator,
    session::ConnectionId,
};

/// Whether a scan is running.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedulerState {
    /// Waiting for the next tick.
    Idle,
    /// A scan is in progress.
    Scanning,
}

/// Result of [`HealthCheckScheduler::scan_once`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScanReport {
    /// The scan visited every active connection.
    Completed {
        /// Connections whose signals were fetched.
        scanned: usize,
        /// Recoveries launched by this scan.
        recoveries_started: usize,
    },
    /// The surrounding system was unreachable or the connection list failed.
    Skipped,
    /// Another scan was already running.
    AlreadyScanning,
}

struct ScanGuard<'a>(&'a AtomicBool);

impl<'a> ScanGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for ScanGuard<'_> {
    fn drop(&mut self) { self.0.store(false, Ordering::Release); }
}

/// Polls the connection directory and launches recoveries.
pub struct HealthCheckScheduler {
    directory: Arc<dyn ConnectionDirectory>,
    tracker: Arc<IncidentTracker>,
    orchestrator: RecoveryOrchestrator,
    base_interval: Duration,
    liveness_timeout: Duration,
    call_timeout: Duration,
    window: Duration,
    scanning: AtomicBool,
    cursors: DashMap<ConnectionId, SystemTime>,
}

impl HealthCheckScheduler {
    /// Create a scheduler feeding `tracker` and launching recoveries through
    /// `orchestrator`.
    #[must_use]
    pub fn new(
        config: &HealthConfig,
        directory: Arc<dyn ConnectionDirectory>,
        tracker: Arc<IncidentTracker>,
        orchestrator: RecoveryOrchestrator,
    ) -> Self {
        Self {
            directory,
            tracker,
            orchestrator,
            base_interval: config.base_scan_interval,
            liveness_timeout: config.liveness_timeout,
            call_timeout: config.step_timeout,
            window: config.window,
            scanning: AtomicBool::new(false),
            cursors: DashMap::new(),
        }
    }

    /// Current scheduler state.
    #[must_use]
    pub fn state(&self) -> SchedulerState {
        if self.scanning.load(Ordering::Acquire) {
            SchedulerState::Scanning
        } else {
            SchedulerState::Idle
        }
    }

    /// Interval until the next scan: the base interval, halved while any
    /// incident is unhealthy.
    #[must_use]
    pub fn effective_interval(&self) -> Duration {
        if self.tracker.has_unhealthy() {
            self.base_interval / 2
        } else {
            self.base_interval
        }
    }

    /// Run a single scan.
    ///
    /// Recoveries are spawned, not awaited, so one slow connection cannot
    /// delay the scan of the rest.
    pub async fn scan_once(&self) -> ScanReport {
        let Some(_guard) = ScanGuard::acquire(&self.scanning) else {
            debug!("scan already running");
            return ScanReport::AlreadyScanning;
        };

        match timeout(self.liveness_timeout, self.directory.system_reachable()).await {
            Ok(true) => {}
            Ok(false) => {
                warn!("system unreachable; scan skipped");
                return ScanReport::Skipped;
            }
            Err(_) => {
                warn!(
                    timeout_ms = millis(self.liveness_timeout),
                    "liveness check timed out; scan skipped"
                );
                return ScanReport::Skipped;
            }
        }

        let connections =
            match timeout(self.call_timeout, self.directory.list_active_connections()).await {
                Ok(Ok(connections)) => connections,
                Ok(Err(error)) => {
                    warn!(%error, "listing active connections failed; scan skipped");
                    return ScanReport::Skipped;
                }
                Err(_) => {
                    warn!("listing active connections timed out; scan skipped");
                    return ScanReport::Skipped;
                }
            };
        self.cursors.retain(|id, _| connections.contains(id));

        let mut scanned = 0;
        let mut recoveries_started = 0;
        for connection in connections {
            let Some(started) = self.scan_connection(connection).await else {
                continue;
            };
            scanned += 1;
            recoveries_started += started;
        }
        debug!(scanned, recoveries_started, "scan finished");
        ScanReport::Completed {
            scanned,
            recoveries_started,
        }
    }

    /// Fetch and report new signals for one connection. Returns the number of
    /// recoveries launched, or `None` if the fetch failed.
    async fn scan_connection(&self, connection: ConnectionId) -> Option<usize> {
        let now = SystemTime::now();
        let floor = now.checked_sub(self.window).unwrap_or(SystemTime::UNIX_EPOCH);
        let since = self
            .cursors
            .get(&connection)
            .map_or(floor, |cursor| (*cursor).max(floor));

        let signals = match timeout(
            self.call_timeout,
            self.directory.fetch_recent_error_signals(connection, since),
        )
        .await
        {
            Ok(Ok(signals)) => signals,
            Ok(Err(error)) => {
                warn!(%connection, %error, "fetching error signals failed");
                return None;
            }
            Err(_) => {
                warn!(%connection, "fetching error signals timed out");
                return None;
            }
        };
        self.cursors.insert(connection, now);

        let mut started = 0;
        for signal in &signals {
            if let Some(decision) = self.tracker.report(connection, signal)
                && decision.should_recover
            {
                self.orchestrator.spawn_recovery(connection, signal.to_string());
                started += 1;
            }
        }
        Some(started)
    }

    /// Scan on every interval tick until `shutdown` is cancelled.
    #[expect(
        clippy::integer_division_remainder_used,
        reason = "tokio::select! expands to modulus internally"
    )]
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut current = None;
        loop {
            let interval = self.effective_interval();
            if current != Some(interval) {
                info!(interval_ms = millis(interval), "scan interval set");
                current = Some(interval);
            }
            select! {
                biased;

                () = shutdown.cancelled() => break,
                () = tokio::time::sleep(interval) => {}
            }
            select! {
                biased;

                () = shutdown.cancelled() => break,
                _ = self.scan_once() => {}
            }
        }
        debug!("scan loop stopped");
    }
}

fn millis(duration: Duration) -> u64 { u64::try_from(duration.as_millis()).unwrap_or(u64::MAX) }

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use rstest::rstest;
    use tracing_test::traced_test;

    use super::*;
    use crate::{
        classifier::{ErrorCategory, ProtocolError},
        error::CollaboratorError,
        incident::{IncidentSummary, RecoveryState},
        ports::{MessageSender, OperatorNotifier, SessionControl},
        recovery::RecoveryPorts,
        retry::{OutboundMessage, PendingRetryQueue},
        session::ConnectionStatus,
    };

    #[derive(Default)]
    struct Directory {
        unreachable: bool,
        hang_liveness: bool,
        connections: Vec<ConnectionId>,
        signals: Mutex<Vec<ProtocolError>>,
        since: Mutex<Vec<SystemTime>>,
    }

    #[async_trait]
    impl ConnectionDirectory for Directory {
        async fn system_reachable(&self) -> bool {
            if self.hang_liveness {
                std::future::pending::<()>().await;
            }
            !self.unreachable
        }

        async fn list_active_connections(&self) -> Result<Vec<ConnectionId>, CollaboratorError> {
            Ok(self.connections.clone())
        }

        async fn fetch_recent_error_signals(
            &self,
            _connection: ConnectionId,
            since: SystemTime,
        ) -> Result<Vec<ProtocolError>, CollaboratorError> {
            self.since.lock().expect("since lock").push(since);
            // Signals are delivered once, like a log query past a cursor.
            Ok(std::mem::take(&mut *self.signals.lock().expect("signals lock")))
        }
    }

    struct Quiet;

    #[async_trait]
    impl SessionControl for Quiet {
        async fn set_connection_status(
            &self,
            _: ConnectionId,
            _: ConnectionStatus,
        ) -> Result<(), CollaboratorError> {
            Ok(())
        }

        async fn purge_session_material(&self, _: ConnectionId) -> Result<(), CollaboratorError> {
            Ok(())
        }

        async fn clear_shared_cache(&self) -> Result<(), CollaboratorError> { Ok(()) }

        async fn reconnect(&self, _: ConnectionId) -> Result<(), CollaboratorError> {
            Err(CollaboratorError::Unavailable("down".into()))
        }

        async fn probe_health(&self, _: ConnectionId) -> Result<bool, CollaboratorError> { Ok(false) }
    }

    /// Session control whose reconnects always verify healthy.
    struct Cooperative;

    #[async_trait]
    impl SessionControl for Cooperative {
        async fn set_connection_status(
            &self,
            _: ConnectionId,
            _: ConnectionStatus,
        ) -> Result<(), CollaboratorError> {
            Ok(())
        }

        async fn purge_session_material(&self, _: ConnectionId) -> Result<(), CollaboratorError> {
            Ok(())
        }

        async fn clear_shared_cache(&self) -> Result<(), CollaboratorError> { Ok(()) }

        async fn reconnect(&self, _: ConnectionId) -> Result<(), CollaboratorError> { Ok(()) }

        async fn probe_health(&self, _: ConnectionId) -> Result<bool, CollaboratorError> { Ok(true) }
    }

    #[async_trait]
    impl OperatorNotifier for Quiet {
        async fn notify_operator(&self, _: ConnectionId, _: &IncidentSummary) {}
    }

    #[async_trait]
    impl MessageSender for Quiet {
        async fn resend(&self, _: ConnectionId, _: &OutboundMessage) -> Result<(), ProtocolError> {
            Ok(())
        }
    }

    const CONN: ConnectionId = ConnectionId::new(5);

    fn scheduler(directory: Directory) -> (HealthCheckScheduler, Arc<IncidentTracker>) {
        scheduler_with(directory, Arc::new(Quiet))
    }

    fn scheduler_with(
        directory: Directory,
        control: Arc<dyn SessionControl>,
    ) -> (HealthCheckScheduler, Arc<IncidentTracker>) {
        let config = HealthConfig {
            error_threshold: 2,
            base_scan_interval: Duration::from_secs(30),
            ..HealthConfig::default()
        };
        let tracker = Arc::new(IncidentTracker::new(&config));
        let queue = Arc::new(PendingRetryQueue::new(&config, Arc::new(Quiet)));
        let orchestrator = RecoveryOrchestrator::new(
            &config,
            Arc::clone(&tracker),
            queue,
            RecoveryPorts {
                control,
                notifier: Arc::new(Quiet),
            },
        );
        let scheduler =
            HealthCheckScheduler::new(&config, Arc::new(directory), Arc::clone(&tracker), orchestrator);
        (scheduler, tracker)
    }

    fn corrupt() -> ProtocolError { ProtocolError::new(ErrorCategory::KeyMismatch, "Invalid PreKey ID") }

    #[rstest]
    #[tokio::test(start_paused = true)]
    async fn signals_trigger_recovery_and_halve_interval() {
        let directory = Directory {
            connections: vec![CONN, ConnectionId::new(6)],
            signals: Mutex::new(vec![corrupt(), corrupt()]),
            ..Directory::default()
        };
        let (scheduler, tracker) = scheduler(directory);
        assert_eq!(scheduler.effective_interval(), Duration::from_secs(30));

        let report = scheduler.scan_once().await;
        assert_eq!(
            report,
            ScanReport::Completed {
                scanned: 2,
                recoveries_started: 1,
            }
        );
        assert_eq!(
            tracker.snapshot(CONN).map(|i| i.recovery_state),
            Some(RecoveryState::Recovering)
        );
        assert_eq!(scheduler.effective_interval(), Duration::from_secs(15));
        assert_eq!(scheduler.state(), SchedulerState::Idle);
        scheduler.orchestrator.shutdown().await;
    }

    #[rstest]
    #[tokio::test(start_paused = true)]
    async fn interval_restored_once_incidents_heal() {
        let directory = Directory {
            connections: vec![CONN],
            signals: Mutex::new(vec![corrupt(), corrupt()]),
            ..Directory::default()
        };
        let (scheduler, tracker) = scheduler_with(directory, Arc::new(Cooperative));
        scheduler.scan_once().await;
        assert_eq!(scheduler.effective_interval(), Duration::from_secs(15));

        scheduler.orchestrator.wait_idle().await;
        assert_eq!(
            tracker.snapshot(CONN).map(|i| i.recovery_state),
            Some(RecoveryState::Healthy)
        );
        assert_eq!(scheduler.effective_interval(), Duration::from_secs(30));
    }

    #[rstest]
    #[tokio::test(start_paused = true)]
    async fn unreachable_system_skips_scan() {
        let (scheduler, tracker) = scheduler(Directory {
            unreachable: true,
            connections: vec![CONN],
            signals: Mutex::new(vec![corrupt(), corrupt()]),
            ..Directory::default()
        });
        assert_eq!(scheduler.scan_once().await, ScanReport::Skipped);
        assert!(tracker.is_empty());
    }

    #[rstest]
    #[traced_test]
    #[tokio::test(start_paused = true)]
    async fn hanging_liveness_check_is_bounded() {
        let (scheduler, _) = scheduler(Directory {
            hang_liveness: true,
            ..Directory::default()
        });
        assert_eq!(scheduler.scan_once().await, ScanReport::Skipped);
        assert!(logs_contain("liveness check timed out"));
    }

    #[rstest]
    #[tokio::test(start_paused = true)]
    async fn cursor_advances_between_scans() {
        let directory = Arc::new(Directory {
            connections: vec![CONN],
            ..Directory::default()
        });
        let config = HealthConfig::default();
        let tracker = Arc::new(IncidentTracker::new(&config));
        let orchestrator = RecoveryOrchestrator::new(
            &config,
            Arc::clone(&tracker),
            Arc::new(PendingRetryQueue::new(&config, Arc::new(Quiet))),
            RecoveryPorts {
                control: Arc::new(Quiet),
                notifier: Arc::new(Quiet),
            },
        );
        let scheduler =
            HealthCheckScheduler::new(&config, directory.clone(), tracker, orchestrator);

        scheduler.scan_once().await;
        scheduler.scan_once().await;
        let since = directory.since.lock().expect("since lock").clone();
        assert_eq!(since.len(), 2);
        assert!(
            since[1] > since[0],
            "second scan must start at the first scan's cursor, not the window floor"
        );
        assert!(scheduler.cursors.contains_key(&CONN));
    }

    #[rstest]
    #[tokio::test(start_paused = true)]
    async fn concurrent_scan_is_refused() {
        let (scheduler, _) = scheduler(Directory::default());
        let held = ScanGuard::acquire(&scheduler.scanning).expect("first guard");
        assert_eq!(scheduler.state(), SchedulerState::Scanning);
        assert_eq!(scheduler.scan_once().await, ScanReport::AlreadyScanning);
        drop(held);
        assert!(matches!(scheduler.scan_once().await, ScanReport::Completed { .. }));
    }

    #[rstest]
    #[traced_test]
    #[tokio::test(start_paused = true)]
    async fn run_logs_interval_and_stops_on_cancel() {
        let (scheduler, _) = scheduler(Directory::default());
        let token = CancellationToken::new();
        let cancel = token.clone();
        let stopper = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(65)).await;
            cancel.cancel();
        });
        scheduler.run(token).await;
        stopper.await.expect("stopper task");
        assert!(logs_contain("scan interval set"));
        assert!(logs_contain("interval_ms=30000"));
    }
}

//! End-to-end flows through [`HealthMonitor`] against scripted collaborators.

use std::{
    sync::Arc,
    time::{Duration, SystemTime},
};

use relink::{
    CollaboratorError,
    ConnectionId,
    ConnectionStatus,
    EnqueueOutcome,
    HealthConfig,
    HealthMonitor,
    RecoveryState,
    ScanReport,
    TenantId,
};
use relink_testing::{
    ControlCall,
    FakeDirectory,
    FakeSessionControl,
    RecordingNotifier,
    RecordingSender,
    corrupt_session_error,
    message,
    transient_error,
};
use rstest::{fixture, rstest};
use tokio::time::Instant;

const CONN: ConnectionId = ConnectionId::new(1);
const TENANT: TenantId = TenantId::new(100);

struct Harness {
    monitor: Arc<HealthMonitor>,
    control: Arc<FakeSessionControl>,
    sender: Arc<RecordingSender>,
    notifier: Arc<RecordingNotifier>,
    directory: Arc<FakeDirectory>,
}

fn config() -> HealthConfig {
    HealthConfig {
        window: Duration::from_secs(300),
        error_threshold: 3,
        max_attempts: 2,
        retry_max_attempts: 3,
        retry_max_age: Duration::from_secs(1800),
        ..HealthConfig::default()
    }
}

fn harness_with(config: HealthConfig) -> Harness {
    let control = Arc::new(FakeSessionControl::new());
    let sender = Arc::new(RecordingSender::new());
    let notifier = Arc::new(RecordingNotifier::new());
    let directory = Arc::new(FakeDirectory::new());
    let monitor = HealthMonitor::builder()
        .config(config)
        .session_control(control.clone())
        .message_sender(sender.clone())
        .operator_notifier(notifier.clone())
        .directory(directory.clone())
        .build()
        .expect("valid monitor");
    Harness {
        monitor: Arc::new(monitor),
        control,
        sender,
        notifier,
        directory,
    }
}

#[fixture]
fn harness() -> Harness { harness_with(config()) }

fn state(h: &Harness) -> Option<RecoveryState> { h.monitor.incident(CONN).map(|i| i.recovery_state) }

#[rstest]
#[tokio::test(start_paused = true)]
async fn third_error_in_window_triggers_single_recovery(harness: Harness) {
    for step in 0..2 {
        let decision = harness
            .monitor
            .report_protocol_error(CONN, &corrupt_session_error())
            .expect("classified");
        assert!(!decision.should_recover, "report {step} must not trigger");
        tokio::time::advance(Duration::from_secs(60)).await;
    }
    let third = harness
        .monitor
        .report_protocol_error(CONN, &corrupt_session_error())
        .expect("classified");
    assert!(third.should_recover);

    tokio::time::advance(Duration::from_secs(1)).await;
    let fourth = harness
        .monitor
        .report_protocol_error(CONN, &corrupt_session_error())
        .expect("classified");
    assert!(!fourth.should_recover);

    harness.monitor.wait_idle().await;
    assert_eq!(harness.control.reconnects(CONN), 1);
    assert_eq!(state(&harness), Some(RecoveryState::Healthy));
    assert_eq!(
        harness.control.statuses(CONN),
        [ConnectionStatus::Disconnected, ConnectionStatus::Connected]
    );
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn transient_errors_never_create_incidents(harness: Harness) {
    for _ in 0..10 {
        assert!(harness.monitor.report_protocol_error(CONN, &transient_error()).is_none());
    }
    assert!(harness.monitor.incident(CONN).is_none());
    assert!(harness.control.calls().is_empty());
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn failing_reconnects_exhaust_and_page_once(harness: Harness) {
    harness.control.script_reconnects([
        Err(CollaboratorError::Unavailable("handshake refused".into())),
        Err(CollaboratorError::Unavailable("handshake refused".into())),
    ]);
    for _ in 0..3 {
        harness.monitor.report_protocol_error(CONN, &corrupt_session_error());
    }
    harness.monitor.wait_idle().await;

    let incident = harness.monitor.incident(CONN).expect("tracked");
    assert_eq!(incident.recovery_state, RecoveryState::Exhausted);
    assert_eq!(incident.recovery_attempts, 2);
    assert_eq!(harness.notifier.count_for(CONN), 1);
    assert_eq!(harness.control.reconnects(CONN), 2);
    assert_eq!(
        harness.control.statuses(CONN).last(),
        Some(&ConnectionStatus::NeedsAttention)
    );

    for _ in 0..5 {
        harness.monitor.report_protocol_error(CONN, &corrupt_session_error());
    }
    harness.monitor.wait_idle().await;
    assert_eq!(harness.control.reconnects(CONN), 2, "exhausted incidents stay parked");
    assert_eq!(harness.notifier.count_for(CONN), 1);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn reset_after_exhaustion_allows_new_recovery(harness: Harness) {
    harness.control.script_reconnects([
        Err(CollaboratorError::Unavailable("down".into())),
        Err(CollaboratorError::Unavailable("down".into())),
    ]);
    assert!(harness.monitor.request_recovery(CONN, "operator"));
    harness.monitor.wait_idle().await;
    assert_eq!(state(&harness), Some(RecoveryState::Exhausted));

    assert!(harness.monitor.reset_incident(CONN));
    assert!(harness.monitor.request_recovery(CONN, "operator"));
    harness.monitor.wait_idle().await;
    assert_eq!(state(&harness), Some(RecoveryState::Healthy));
    assert_eq!(harness.control.reconnects(CONN), 3);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn recovery_drains_backlog_in_order(harness: Harness) {
    let ids = ["m1", "m2", "m3", "m4", "m5"];
    for id in ids {
        let outcome = harness.monitor.report_send_failure(
            CONN,
            TENANT,
            message(id, "5511999990000"),
            corrupt_session_error(),
        );
        assert_eq!(outcome, EnqueueOutcome::Queued);
    }
    harness.sender.fail("m2");
    harness.sender.fail("m4");

    assert!(harness.monitor.request_recovery(CONN, "operator"));
    harness.monitor.wait_idle().await;

    assert_eq!(harness.sender.attempted(), ids);
    let stats = harness.monitor.retry_stats();
    assert_eq!(stats.total, 2);
    assert_eq!(stats.by_connection.get(&CONN), Some(&2));
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn stale_messages_are_swept(harness: Harness) {
    harness
        .monitor
        .report_send_failure(CONN, TENANT, message("old", "peer"), corrupt_session_error());
    let report = harness
        .monitor
        .sweep(Instant::now() + Duration::from_secs(1801));
    assert_eq!(report.messages, 1);
    assert_eq!(harness.monitor.retry_stats().total, 0);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn scan_launches_recovery_from_signals(harness: Harness) {
    harness.directory.add_connection(CONN);
    let recorded_at = SystemTime::now() - Duration::from_secs(1);
    for _ in 0..3 {
        harness
            .directory
            .push_signal_at(CONN, recorded_at, corrupt_session_error());
    }

    let report = harness.monitor.scan_once().await;
    assert_eq!(
        report,
        ScanReport::Completed {
            scanned: 1,
            recoveries_started: 1,
        }
    );
    harness.monitor.wait_idle().await;
    assert_eq!(harness.control.reconnects(CONN), 1);

    let again = harness.monitor.scan_once().await;
    assert_eq!(
        again,
        ScanReport::Completed {
            scanned: 1,
            recoveries_started: 0,
        },
        "signals already seen must not be counted again"
    );
    assert_eq!(harness.monitor.incident(CONN).map(|i| i.error_count), Some(0));
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn unreachable_system_skips_scan(harness: Harness) {
    harness.directory.set_reachable(false);
    harness.directory.add_connection(CONN);
    assert_eq!(harness.monitor.scan_once().await, ScanReport::Skipped);
    assert!(harness.directory.queries().is_empty());
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn background_loops_scan_until_shutdown(harness: Harness) {
    harness.directory.add_connection(CONN);
    harness.monitor.start();
    harness.monitor.start();

    tokio::time::sleep(Duration::from_secs(95)).await;
    harness.monitor.shutdown().await;

    let scans = harness.directory.queries().len();
    assert_eq!(scans, 3, "one scan per 30 s tick");
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(harness.directory.queries().len(), scans, "no scans after shutdown");
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn best_effort_failures_still_reconnect(harness: Harness) {
    harness
        .control
        .fail_purges(CollaboratorError::Rejected("read-only".into()));
    assert!(harness.monitor.request_recovery(CONN, "operator"));
    harness.monitor.wait_idle().await;
    assert_eq!(state(&harness), Some(RecoveryState::Healthy));
    assert!(harness.control.calls().contains(&ControlCall::Reconnect(CONN)));
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn unhealthy_probe_takes_failure_branch(harness: Harness) {
    harness.control.script_probes([Ok(false)]);
    assert!(harness.monitor.request_recovery(CONN, "operator"));
    harness.monitor.wait_idle().await;

    let incident = harness.monitor.incident(CONN).expect("tracked");
    assert_eq!(incident.recovery_state, RecoveryState::Healthy);
    assert_eq!(harness.control.reconnects(CONN), 2, "one failed verify, one retry");
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn slow_reconnect_counts_as_failure(harness: Harness) {
    harness.control.set_reconnect_delay(Duration::from_secs(60));
    assert!(harness.monitor.request_recovery(CONN, "operator"));
    harness.monitor.wait_idle().await;
    assert_eq!(state(&harness), Some(RecoveryState::Exhausted));
    assert_eq!(harness.notifier.count_for(CONN), 1);
}

//! Log records emitted at the operator-facing edges of the engine.
//!
//! `tracing` forwards events to the `log` facade, which `logtest` captures
//! process-wide; every test here runs serially.

use std::sync::Arc;

use log::Level;
use relink::{
    CollaboratorError,
    ConnectionId,
    EnqueueOutcome,
    HealthConfig,
    HealthMonitor,
    TenantId,
};
use relink_testing::{
    FakeDirectory,
    FakeSessionControl,
    LoggerHandle,
    RecordingNotifier,
    RecordingSender,
    corrupt_session_error,
    logger,
    message,
};
use rstest::rstest;
use serial_test::serial;

fn monitor(control: Arc<FakeSessionControl>) -> HealthMonitor {
    HealthMonitor::builder()
        .config(HealthConfig {
            max_attempts: 1,
            retry_max_attempts: 2,
            ..HealthConfig::default()
        })
        .session_control(control)
        .message_sender(Arc::new(RecordingSender::new()))
        .operator_notifier(Arc::new(RecordingNotifier::new()))
        .directory(Arc::new(FakeDirectory::new()))
        .build()
        .expect("valid monitor")
}

#[rstest]
#[serial]
#[tokio::test(start_paused = true)]
async fn saturated_message_drop_is_logged(mut logger: LoggerHandle) {
    let monitor = monitor(Arc::new(FakeSessionControl::new()));
    let connection = ConnectionId::new(7);
    let mut last = EnqueueOutcome::Queued;
    for _ in 0..4 {
        last = monitor.report_send_failure(
            connection,
            TenantId::new(1),
            message("m1", "peer"),
            corrupt_session_error(),
        );
    }
    assert_eq!(last, EnqueueOutcome::Dropped { attempts: 3 });
    assert!(logger.contains(Level::Warn, "retry attempts exhausted; message dropped"));
}

#[rstest]
#[serial]
#[tokio::test(start_paused = true)]
async fn exhaustion_is_logged_as_error(mut logger: LoggerHandle) {
    let control = Arc::new(FakeSessionControl::new());
    control.script_reconnects([Err(CollaboratorError::Unavailable("down".into()))]);
    let monitor = monitor(control);

    assert!(monitor.request_recovery(ConnectionId::new(8), "operator"));
    monitor.wait_idle().await;

    let records = logger.drain();
    assert!(
        records
            .iter()
            .any(|(level, text)| *level == Level::Error && text.contains("recovery attempts exhausted")),
        "missing exhaustion record in {records:?}"
    );
}

#[rstest]
#[serial]
#[tokio::test(start_paused = true)]
async fn shutdown_is_logged(mut logger: LoggerHandle) {
    let monitor = monitor(Arc::new(FakeSessionControl::new()));
    monitor.shutdown().await;
    assert!(logger.contains(Level::Info, "health monitor stopped"));
}

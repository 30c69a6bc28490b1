//! Scripted in-process incident for `relink --simulate`.

use std::{
    fmt,
    sync::{
        Arc,
        Mutex,
        atomic::{AtomicU32, Ordering},
    },
    time::{Duration, SystemTime},
};

use async_trait::async_trait;
use relink::{
    CollaboratorError,
    ConnectionDirectory,
    ConnectionId,
    ConnectionStatus,
    ErrorCategory,
    HealthConfig,
    HealthMonitor,
    IncidentSummary,
    MessageSender,
    OperatorNotifier,
    OutboundMessage,
    ProtocolError,
    RecoveryState,
    SessionControl,
    TenantId,
};
use tracing::info;

const CONNECTION: ConnectionId = ConnectionId::new(1);
const TENANT: TenantId = TenantId::new(1);

/// Messaging client whose first reconnect fails.
#[derive(Default)]
struct FlakyClient {
    reconnects: AtomicU32,
}

#[async_trait]
impl SessionControl for FlakyClient {
    async fn set_connection_status(
        &self,
        connection: ConnectionId,
        status: ConnectionStatus,
    ) -> Result<(), CollaboratorError> {
        info!(%connection, status = status.as_str(), "status published");
        Ok(())
    }

    async fn purge_session_material(
        &self,
        connection: ConnectionId,
    ) -> Result<(), CollaboratorError> {
        info!(%connection, "session material purged");
        Ok(())
    }

    async fn clear_shared_cache(&self) -> Result<(), CollaboratorError> {
        Err(CollaboratorError::NotFound("shared cache".into()))
    }

    async fn reconnect(&self, connection: ConnectionId) -> Result<(), CollaboratorError> {
        if self.reconnects.fetch_add(1, Ordering::SeqCst) == 0 {
            return Err(CollaboratorError::Unavailable(format!(
                "{connection}: handshake refused"
            )));
        }
        Ok(())
    }

    async fn probe_health(&self, _connection: ConnectionId) -> Result<bool, CollaboratorError> {
        Ok(true)
    }
}

/// Sender that rejects each message id once.
#[derive(Default)]
struct OnceRejectingSender {
    rejected: Mutex<Vec<String>>,
}

#[async_trait]
impl MessageSender for OnceRejectingSender {
    async fn resend(
        &self,
        _connection: ConnectionId,
        message: &OutboundMessage,
    ) -> Result<(), ProtocolError> {
        let mut rejected = self
            .rejected
            .lock()
            .map_err(|_| ProtocolError::new(ErrorCategory::Application, "sender poisoned"))?;
        if message.protocol_message_id.ends_with('2')
            && !rejected.contains(&message.protocol_message_id)
        {
            rejected.push(message.protocol_message_id.clone());
            return Err(ProtocolError::new(ErrorCategory::Transport, "socket closed"));
        }
        Ok(())
    }
}

struct LogNotifier;

#[async_trait]
impl OperatorNotifier for LogNotifier {
    async fn notify_operator(&self, connection: ConnectionId, summary: &IncidentSummary) {
        tracing::error!(%connection, %summary, "operator paged");
    }
}

struct SingleConnection;

#[async_trait]
impl ConnectionDirectory for SingleConnection {
    async fn system_reachable(&self) -> bool { true }

    async fn list_active_connections(&self) -> Result<Vec<ConnectionId>, CollaboratorError> {
        Ok(vec![CONNECTION])
    }

    async fn fetch_recent_error_signals(
        &self,
        _connection: ConnectionId,
        _since: SystemTime,
    ) -> Result<Vec<ProtocolError>, CollaboratorError> {
        Ok(Vec::new())
    }
}

/// Final state of a simulated incident.
pub struct Summary {
    state: Option<RecoveryState>,
    pending: usize,
    manual_retry: bool,
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.map_or("untracked", RecoveryState::as_str);
        write!(
            f,
            "incident state: {state}; messages still pending: {}; manual retry: {}",
            self.pending,
            if self.manual_retry { "yes" } else { "no" }
        )
    }
}

/// Drive one incident: three corrupt-session errors, a failed reconnect, a
/// successful re-attempt and a drain with one transient resend failure.
pub async fn run(config: HealthConfig) -> Result<Summary, relink::BuildError> {
    let config = HealthConfig {
        settle_delay: Duration::from_millis(50),
        verify_delay: Duration::from_millis(50),
        cooldown_delay: Duration::from_millis(200),
        drain_interval: Duration::from_millis(20),
        ..config
    };
    let monitor = Arc::new(
        HealthMonitor::builder()
            .config(config)
            .session_control(Arc::new(FlakyClient::default()))
            .message_sender(Arc::new(OnceRejectingSender::default()))
            .operator_notifier(Arc::new(LogNotifier))
            .directory(Arc::new(SingleConnection))
            .build()?,
    );
    monitor.start();

    for id in ["msg-1", "msg-2", "msg-3"] {
        monitor.report_send_failure(
            CONNECTION,
            TENANT,
            OutboundMessage::new(id, "5511999999999", &b"hello"[..]),
            ProtocolError::new(ErrorCategory::MissingSession, "No sessions"),
        );
    }
    for _ in 0..config.error_threshold {
        monitor.report_protocol_error(CONNECTION, &ProtocolError::unclassified("Bad MAC"));
    }
    monitor.wait_idle().await;

    // The remaining message failed once during the automatic drain; a manual
    // recovery drains it again.
    let manual_retry =
        monitor.retry_stats().total > 0 && monitor.request_recovery(CONNECTION, "simulated retry");
    if manual_retry {
        monitor.wait_idle().await;
    }

    let summary = Summary {
        state: monitor.incident(CONNECTION).map(|incident| incident.recovery_state),
        pending: monitor.retry_stats().total,
        manual_retry,
    };
    monitor.shutdown().await;
    Ok(summary)
}

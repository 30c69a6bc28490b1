//! Scripted fakes for the collaborator ports.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        Mutex,
        MutexGuard,
        atomic::{AtomicBool, Ordering},
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
    IncidentSummary,
    MessageSender,
    OperatorNotifier,
    OutboundMessage,
    ProtocolError,
    SessionControl,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// A call received by [`FakeSessionControl`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ControlCall {
    /// `set_connection_status`.
    Status(ConnectionId, ConnectionStatus),
    /// `purge_session_material`.
    Purge(ConnectionId),
    /// `clear_shared_cache`.
    ClearCache,
    /// `reconnect`.
    Reconnect(ConnectionId),
    /// `probe_health`.
    Probe(ConnectionId),
}

/// [`SessionControl`] with scripted reconnect and probe results.
///
/// Unscripted reconnects succeed and unscripted probes report healthy.
#[derive(Debug, Default)]
pub struct FakeSessionControl {
    reconnects: Mutex<VecDeque<Result<(), CollaboratorError>>>,
    probes: Mutex<VecDeque<Result<bool, CollaboratorError>>>,
    reconnect_delay: Mutex<Option<Duration>>,
    purge_error: Mutex<Option<CollaboratorError>>,
    calls: Mutex<Vec<ControlCall>>,
}

impl FakeSessionControl {
    /// Create a fake where every step succeeds.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Queue results for the next reconnect calls.
    pub fn script_reconnects(&self, results: impl IntoIterator<Item = Result<(), CollaboratorError>>) {
        lock(&self.reconnects).extend(results);
    }

    /// Queue results for the next health probes.
    pub fn script_probes(&self, results: impl IntoIterator<Item = Result<bool, CollaboratorError>>) {
        lock(&self.probes).extend(results);
    }

    /// Make every reconnect take `delay` before answering.
    pub fn set_reconnect_delay(&self, delay: Duration) { *lock(&self.reconnect_delay) = Some(delay); }

    /// Fail every purge with `error`.
    pub fn fail_purges(&self, error: CollaboratorError) { *lock(&self.purge_error) = Some(error); }

    /// Every call received so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<ControlCall> { lock(&self.calls).clone() }

    /// Number of reconnects requested for `connection`.
    #[must_use]
    pub fn reconnects(&self, connection: ConnectionId) -> usize {
        lock(&self.calls)
            .iter()
            .filter(|call| **call == ControlCall::Reconnect(connection))
            .count()
    }

    /// Statuses published for `connection`, in order.
    #[must_use]
    pub fn statuses(&self, connection: ConnectionId) -> Vec<ConnectionStatus> {
        lock(&self.calls)
            .iter()
            .filter_map(|call| match call {
                ControlCall::Status(id, status) if *id == connection => Some(*status),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: ControlCall) { lock(&self.calls).push(call); }
}

#[async_trait]
impl SessionControl for FakeSessionControl {
    async fn set_connection_status(
        &self,
        connection: ConnectionId,
        status: ConnectionStatus,
    ) -> Result<(), CollaboratorError> {
        self.record(ControlCall::Status(connection, status));
        Ok(())
    }

    async fn purge_session_material(
        &self,
        connection: ConnectionId,
    ) -> Result<(), CollaboratorError> {
        self.record(ControlCall::Purge(connection));
        lock(&self.purge_error).clone().map_or(Ok(()), Err)
    }

    async fn clear_shared_cache(&self) -> Result<(), CollaboratorError> {
        self.record(ControlCall::ClearCache);
        Ok(())
    }

    async fn reconnect(&self, connection: ConnectionId) -> Result<(), CollaboratorError> {
        self.record(ControlCall::Reconnect(connection));
        let delay = *lock(&self.reconnect_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        lock(&self.reconnects).pop_front().unwrap_or(Ok(()))
    }

    async fn probe_health(&self, connection: ConnectionId) -> Result<bool, CollaboratorError> {
        self.record(ControlCall::Probe(connection));
        lock(&self.probes).pop_front().unwrap_or(Ok(true))
    }
}

/// [`MessageSender`] recording every resend.
///
/// Messages listed with [`RecordingSender::fail`] are rejected on every
/// attempt; those listed with [`RecordingSender::fail_once`] only on the first.
#[derive(Debug, Default)]
pub struct RecordingSender {
    always: Mutex<HashSet<String>>,
    once: Mutex<HashSet<String>>,
    sent: Mutex<Vec<(ConnectionId, String)>>,
}

impl RecordingSender {
    /// Create a sender accepting every message.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Reject every resend of `protocol_message_id`.
    pub fn fail(&self, protocol_message_id: &str) {
        lock(&self.always).insert(protocol_message_id.to_owned());
    }

    /// Reject the next resend of `protocol_message_id`.
    pub fn fail_once(&self, protocol_message_id: &str) {
        lock(&self.once).insert(protocol_message_id.to_owned());
    }

    /// Protocol message ids of every attempted resend, in order.
    #[must_use]
    pub fn attempted(&self) -> Vec<String> {
        lock(&self.sent).iter().map(|(_, id)| id.clone()).collect()
    }

    /// Number of resend attempts over `connection`.
    #[must_use]
    pub fn attempts_on(&self, connection: ConnectionId) -> usize {
        lock(&self.sent)
            .iter()
            .filter(|(id, _)| *id == connection)
            .count()
    }
}

#[async_trait]
impl MessageSender for RecordingSender {
    async fn resend(
        &self,
        connection: ConnectionId,
        message: &OutboundMessage,
    ) -> Result<(), ProtocolError> {
        let id = &message.protocol_message_id;
        lock(&self.sent).push((connection, id.clone()));
        if lock(&self.always).contains(id) || lock(&self.once).remove(id) {
            return Err(ProtocolError::new(
                ErrorCategory::Transport,
                format!("resend of {id} rejected"),
            ));
        }
        Ok(())
    }
}

/// [`OperatorNotifier`] recording every notification.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    notifications: Mutex<Vec<(ConnectionId, IncidentSummary)>>,
}

impl RecordingNotifier {
    /// Create an empty notifier.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Notifications received so far.
    #[must_use]
    pub fn notifications(&self) -> Vec<(ConnectionId, IncidentSummary)> {
        lock(&self.notifications).clone()
    }

    /// Number of notifications for `connection`.
    #[must_use]
    pub fn count_for(&self, connection: ConnectionId) -> usize {
        lock(&self.notifications)
            .iter()
            .filter(|(id, _)| *id == connection)
            .count()
    }
}

#[async_trait]
impl OperatorNotifier for RecordingNotifier {
    async fn notify_operator(&self, connection: ConnectionId, summary: &IncidentSummary) {
        lock(&self.notifications).push((connection, summary.clone()));
    }
}

/// [`ConnectionDirectory`] backed by timestamped in-memory signals.
#[derive(Debug)]
pub struct FakeDirectory {
    reachable: AtomicBool,
    connections: Mutex<Vec<ConnectionId>>,
    signals: Mutex<HashMap<ConnectionId, Vec<(SystemTime, ProtocolError)>>>,
    queries: Mutex<Vec<(ConnectionId, SystemTime)>>,
}

impl Default for FakeDirectory {
    fn default() -> Self {
        Self {
            reachable: AtomicBool::new(true),
            connections: Mutex::default(),
            signals: Mutex::default(),
            queries: Mutex::default(),
        }
    }
}

impl FakeDirectory {
    /// Create a reachable directory without connections.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Mark the surrounding system as reachable or not.
    pub fn set_reachable(&self, reachable: bool) { self.reachable.store(reachable, Ordering::SeqCst); }

    /// Add `connection` to the active list.
    pub fn add_connection(&self, connection: ConnectionId) {
        let mut connections = lock(&self.connections);
        if !connections.contains(&connection) {
            connections.push(connection);
        }
    }

    /// Record `error` for `connection` at the current wall-clock time.
    pub fn push_signal(&self, connection: ConnectionId, error: ProtocolError) {
        self.push_signal_at(connection, SystemTime::now(), error);
    }

    /// Record `error` for `connection` at `at`.
    pub fn push_signal_at(&self, connection: ConnectionId, at: SystemTime, error: ProtocolError) {
        lock(&self.signals)
            .entry(connection)
            .or_default()
            .push((at, error));
    }

    /// `since` values passed to every signal fetch, in order.
    #[must_use]
    pub fn queries(&self) -> Vec<(ConnectionId, SystemTime)> { lock(&self.queries).clone() }
}

#[async_trait]
impl ConnectionDirectory for FakeDirectory {
    async fn system_reachable(&self) -> bool { self.reachable.load(Ordering::SeqCst) }

    async fn list_active_connections(&self) -> Result<Vec<ConnectionId>, CollaboratorError> {
        Ok(lock(&self.connections).clone())
    }

    async fn fetch_recent_error_signals(
        &self,
        connection: ConnectionId,
        since: SystemTime,
    ) -> Result<Vec<ProtocolError>, CollaboratorError> {
        lock(&self.queries).push((connection, since));
        Ok(lock(&self.signals)
            .get(&connection)
            .map(|signals| {
                signals
                    .iter()
                    .filter(|(at, _)| *at >= since)
                    .map(|(_, error)| error.clone())
                    .collect()
            })
            .unwrap_or_default())
    }
}

//! Collaborator interfaces consumed by the engine.
//!
//! Applications implement these traits to connect `relink` to their
//! messaging client, connection registry, log backend and operator alerting.
//! Every method may be slow or hang; the engine bounds each call with a
//! timeout and treats an elapsed timeout exactly like a returned error.

use std::time::SystemTime;

use async_trait::async_trait;

use crate::{
    classifier::ProtocolError,
    error::CollaboratorError,
    incident::IncidentSummary,
    retry::OutboundMessage,
    session::{ConnectionId, ConnectionStatus},
};

/// Control surface of the messaging client for one process.
#[async_trait]
pub trait SessionControl: Send + Sync + 'static {
    /// Change the status advertised for `connection`.
    async fn set_connection_status(
        &self,
        connection: ConnectionId,
        status: ConnectionStatus,
    ) -> Result<(), CollaboratorError>;

    /// Delete the persisted cryptographic session material for `connection`.
    ///
    /// Material that is already absent should be reported as
    /// [`CollaboratorError::NotFound`] or as success.
    async fn purge_session_material(&self, connection: ConnectionId)
    -> Result<(), CollaboratorError>;

    /// Clear the ephemeral cache shared by all connections.
    ///
    /// A missing cache is not an error; return [`CollaboratorError::NotFound`]
    /// or success.
    async fn clear_shared_cache(&self) -> Result<(), CollaboratorError>;

    /// Re-establish the messaging session for `connection`.
    async fn reconnect(&self, connection: ConnectionId) -> Result<(), CollaboratorError>;

    /// Report whether `connection` is currently healthy.
    async fn probe_health(&self, connection: ConnectionId) -> Result<bool, CollaboratorError>;
}

/// Delivery surface used to resend pending messages.
#[async_trait]
pub trait MessageSender: Send + Sync + 'static {
    /// Resend `message` over `connection`.
    ///
    /// The returned [`ProtocolError`] is stored as the message's last error.
    async fn resend(
        &self,
        connection: ConnectionId,
        message: &OutboundMessage,
    ) -> Result<(), ProtocolError>;
}

/// Escalation surface for incidents automatic recovery could not resolve.
#[async_trait]
pub trait OperatorNotifier: Send + Sync + 'static {
    /// Alert an operator that `connection` exhausted its recovery attempts.
    async fn notify_operator(&self, connection: ConnectionId, summary: &IncidentSummary);
}

/// Registry and observability surface polled by the scheduler.
#[async_trait]
pub trait ConnectionDirectory: Send + Sync + 'static {
    /// Returns true if the surrounding system (API, worker process) is up.
    async fn system_reachable(&self) -> bool;

    /// List the connections currently expected to be online.
    async fn list_active_connections(&self) -> Result<Vec<ConnectionId>, CollaboratorError>;

    /// Fetch protocol errors recorded for `connection` at or after `since`.
    async fn fetch_recent_error_signals(
        &self,
        connection: ConnectionId,
        since: SystemTime,
    ) -> Result<Vec<ProtocolError>, CollaboratorError>;
}

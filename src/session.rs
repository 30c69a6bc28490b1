//! Identifiers and advertised status for messaging sessions.
//!
//! A [`ConnectionId`] names one long-lived, cryptographically-stateful session
//! to an external messaging identity. [`TenantId`] names the helpdesk tenant
//! owning outbound work routed through that session.

use serde::{Deserialize, Serialize};

/// Identifier assigned to a messaging connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(u64);

impl From<u64> for ConnectionId {
    fn from(value: u64) -> Self { Self(value) }
}

impl ConnectionId {
    /// Create a new [`ConnectionId`] with the provided value.
    #[must_use]
    pub const fn new(id: u64) -> Self { Self(id) }

    /// Return the inner `u64` representation.
    #[must_use]
    pub const fn as_u64(&self) -> u64 { self.0 }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ConnectionId({})", self.0)
    }
}

/// Identifier of the tenant owning a pending message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TenantId(u64);

impl From<u64> for TenantId {
    fn from(value: u64) -> Self { Self(value) }
}

impl TenantId {
    /// Create a new [`TenantId`].
    #[must_use]
    pub const fn new(id: u64) -> Self { Self(id) }

    /// Return the inner `u64` representation.
    #[must_use]
    pub const fn as_u64(&self) -> u64 { self.0 }
}

impl std::fmt::Display for TenantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TenantId({})", self.0)
    }
}

/// Status advertised for a connection to the rest of the helpdesk.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionStatus {
    /// The session is connected and verified.
    Connected,
    /// The session was torn down for recovery.
    Disconnected,
    /// Automatic recovery gave up; an operator must intervene.
    NeedsAttention,
}

impl ConnectionStatus {
    /// Stable lowercase label used in logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::NeedsAttention => "needs_attention",
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(ConnectionStatus::Connected, "connected")]
    #[case(ConnectionStatus::Disconnected, "disconnected")]
    #[case(ConnectionStatus::NeedsAttention, "needs_attention")]
    fn status_labels(#[case] status: ConnectionStatus, #[case] expected: &str) {
        assert_eq!(status.as_str(), expected);
    }

    #[test]
    fn identifiers_display_inner_value() {
        assert_eq!(ConnectionId::new(7).to_string(), "ConnectionId(7)");
        assert_eq!(TenantId::from(3).to_string(), "TenantId(3)");
    }
}

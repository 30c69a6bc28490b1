//! Outbound messages awaiting a resend after a connection recovers.
//!
//! Messages that failed to send while a session was unhealthy are parked in a
//! [`PendingRetryQueue`]. Once recovery succeeds the queue drains the
//! connection's backlog in insertion order. Each entry carries a bounded
//! attempt budget, and a periodic sweep evicts entries older than the
//! configured maximum age so a connection that never recovers cannot grow the
//! queue without bound.

mod queue;
mod store;

use std::collections::BTreeMap;

use bytes::Bytes;
pub use queue::PendingRetryQueue;
pub use store::{EntryAction, InMemoryRetryStore, RetryStore};
use tokio::time::Instant;

use crate::{
    classifier::{ErrorCategory, ProtocolError},
    session::{ConnectionId, TenantId},
};

/// Message content plus the addressing data needed to resend it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutboundMessage {
    /// Identifier assigned by the messaging protocol.
    pub protocol_message_id: String,
    /// Network address of the recipient.
    pub peer_address: String,
    /// Opaque encoded payload.
    pub body: Bytes,
}

impl OutboundMessage {
    /// Create a message for `peer_address`.
    #[must_use]
    pub fn new(
        protocol_message_id: impl Into<String>,
        peer_address: impl Into<String>,
        body: impl Into<Bytes>,
    ) -> Self {
        Self {
            protocol_message_id: protocol_message_id.into(),
            peer_address: peer_address.into(),
            body: body.into(),
        }
    }
}

/// Deterministic identity of a pending message.
///
/// Two failure reports for the same protocol message to the same peer over the
/// same connection map to one key and therefore one queue entry.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MessageKey {
    /// Connection the message was sent over.
    pub connection: ConnectionId,
    /// Identifier assigned by the messaging protocol.
    pub protocol_message_id: String,
    /// Network address of the recipient.
    pub peer_address: String,
}

impl MessageKey {
    /// Derive the key for `message` sent over `connection`.
    #[must_use]
    pub fn derive(connection: ConnectionId, message: &OutboundMessage) -> Self {
        Self {
            connection,
            protocol_message_id: message.protocol_message_id.clone(),
            peer_address: message.peer_address.clone(),
        }
    }
}

impl std::fmt::Display for MessageKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}@{}",
            self.connection.as_u64(),
            self.protocol_message_id,
            self.peer_address
        )
    }
}

/// A message waiting to be resent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingOutboundMessage {
    /// Coalescing key.
    pub key: MessageKey,
    /// Connection to resend over.
    pub connection: ConnectionId,
    /// Tenant owning the message.
    pub tenant: TenantId,
    /// Content and addressing.
    pub message: OutboundMessage,
    /// Failed attempts recorded so far; never above the configured cap.
    pub attempts: u32,
    /// Insertion order used for FIFO draining.
    pub sequence: u64,
    /// When the message was first queued.
    pub enqueued_at: Instant,
    /// When the message was queued or last retried.
    pub last_attempt_at: Instant,
    /// Most recent failure.
    pub last_error: ProtocolError,
}

/// Result of [`PendingRetryQueue::enqueue`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// A new entry was created.
    Queued,
    /// An existing entry absorbed the report.
    Coalesced {
        /// Attempts now recorded on the entry.
        attempts: u32,
    },
    /// The report pushed the entry past its cap; the entry was discarded.
    Dropped {
        /// Attempts the entry would have reached.
        attempts: u32,
    },
}

/// Tally of one [`PendingRetryQueue::drain`] pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Messages delivered and removed.
    pub resent: usize,
    /// Messages that failed and stay queued.
    pub failed: usize,
    /// Messages that failed past their cap and were removed.
    pub dropped: usize,
}

impl DrainReport {
    /// Total entries attempted.
    #[must_use]
    pub fn attempted(&self) -> usize { self.resent + self.failed + self.dropped }
}

/// Aggregate view of the queue for observability.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RetryStats {
    /// Entries in the queue.
    pub total: usize,
    /// Entries per connection.
    pub by_connection: BTreeMap<ConnectionId, usize>,
    /// Entries per category of their last error.
    pub by_category: BTreeMap<ErrorCategory, usize>,
}

impl RetryStats {
    /// Build statistics from a snapshot of entries.
    #[must_use]
    pub fn from_entries<'a>(entries: impl IntoIterator<Item = &'a PendingOutboundMessage>) -> Self {
        let mut stats = Self::default();
        for entry in entries {
            stats.total += 1;
            *stats.by_connection.entry(entry.connection).or_default() += 1;
            *stats
                .by_category
                .entry(entry.last_error.effective_category())
                .or_default() += 1;
        }
        stats
    }
}

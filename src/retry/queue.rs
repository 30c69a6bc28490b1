//! The retry queue: enqueue, drain, sweep and statistics.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use dashmap::DashSet;
use leaky_bucket::RateLimiter;
use tokio::time::{Instant, timeout};
use tracing::{debug, info, warn};

use super::{
    DrainReport,
    EnqueueOutcome,
    EntryAction,
    InMemoryRetryStore,
    MessageKey,
    OutboundMessage,
    PendingOutboundMessage,
    RetryStats,
    RetryStore,
};
use crate::{
    classifier::{ErrorCategory, ProtocolError},
    config::HealthConfig,
    metrics::{self, RetryEvent},
    ports::MessageSender,
    session::{ConnectionId, TenantId},
};

/// Marks a connection as draining for the guard's lifetime.
///
/// Dropping the guard, including when the drain future is cancelled, releases
/// the connection for the next drain.
struct DrainGuard<'a> {
    draining: &'a DashSet<ConnectionId>,
    connection: ConnectionId,
}

impl<'a> DrainGuard<'a> {
    fn acquire(draining: &'a DashSet<ConnectionId>, connection: ConnectionId) -> Option<Self> {
        draining.insert(connection).then_some(Self {
            draining,
            connection,
        })
    }
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) { self.draining.remove(&self.connection); }
}

/// Queue of outbound messages awaiting a resend.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
///
/// use relink::{
///     classifier::{ErrorCategory, ProtocolError},
///     config::HealthConfig,
///     ports::MessageSender,
///     retry::{EnqueueOutcome, OutboundMessage, PendingRetryQueue},
///     session::{ConnectionId, TenantId},
/// };
///
/// # async fn demo(sender: Arc<dyn MessageSender>) {
/// let queue = PendingRetryQueue::new(&HealthConfig::default(), sender);
/// let outcome = queue.enqueue(
///     OutboundMessage::new("3EB0C431", "5511999999999", &b"hello"[..]),
///     ConnectionId::new(1),
///     TenantId::new(1),
///     ProtocolError::new(ErrorCategory::MissingSession, "No session record"),
/// );
/// assert_eq!(outcome, EnqueueOutcome::Queued);
/// let report = queue.drain(ConnectionId::new(1)).await;
/// # drop(report);
/// # }
/// ```
pub struct PendingRetryQueue {
    store: Arc<dyn RetryStore>,
    sender: Arc<dyn MessageSender>,
    max_attempts: u32,
    max_age: Duration,
    drain_interval: Duration,
    send_timeout: Duration,
    next_sequence: AtomicU64,
    draining: DashSet<ConnectionId>,
}

impl PendingRetryQueue {
    /// Create a queue backed by an [`InMemoryRetryStore`].
    #[must_use]
    pub fn new(config: &HealthConfig, sender: Arc<dyn MessageSender>) -> Self {
        Self::with_store(config, sender, Arc::new(InMemoryRetryStore::new()))
    }

    /// Create a queue over a caller-supplied store.
    #[must_use]
    pub fn with_store(
        config: &HealthConfig,
        sender: Arc<dyn MessageSender>,
        store: Arc<dyn RetryStore>,
    ) -> Self {
        Self {
            store,
            sender,
            max_attempts: config.retry_max_attempts.max(1),
            max_age: config.retry_max_age,
            drain_interval: config.drain_interval.max(Duration::from_millis(1)),
            send_timeout: config.step_timeout,
            next_sequence: AtomicU64::new(0),
            draining: DashSet::new(),
        }
    }

    /// Insert a failed message, or fold a repeated failure into its entry.
    ///
    /// A repeated report counts as one more failed attempt. When that pushes
    /// the entry past the cap the entry is discarded and a warning is logged;
    /// saturation is expected under sustained outages and is never an error.
    pub fn enqueue(
        &self,
        message: OutboundMessage,
        connection: ConnectionId,
        tenant: TenantId,
        error: ProtocolError,
    ) -> EnqueueOutcome {
        let key = MessageKey::derive(connection, &message);
        let now = Instant::now();
        let max_attempts = self.max_attempts;
        let mut fresh = Some(message);
        let mut outcome = EnqueueOutcome::Queued;

        self.store.entry(&key, &mut |existing| match existing {
            Some(entry) => {
                let attempts = entry.attempts.saturating_add(1);
                if attempts > max_attempts {
                    outcome = EnqueueOutcome::Dropped { attempts };
                    return EntryAction::Remove;
                }
                entry.attempts = attempts;
                entry.last_attempt_at = now;
                entry.last_error = error.clone();
                outcome = EnqueueOutcome::Coalesced { attempts };
                EntryAction::Keep
            }
            None => {
                let Some(message) = fresh.take() else {
                    return EntryAction::Keep;
                };
                outcome = EnqueueOutcome::Queued;
                EntryAction::Insert(PendingOutboundMessage {
                    key: key.clone(),
                    connection,
                    tenant,
                    message,
                    attempts: 0,
                    sequence: self.next_sequence.fetch_add(1, Ordering::Relaxed),
                    enqueued_at: now,
                    last_attempt_at: now,
                    last_error: error.clone(),
                })
            }
        });

        match outcome {
            EnqueueOutcome::Queued => {
                debug!(%connection, %tenant, message_id = %key, "message queued for retry");
                metrics::inc_retry(RetryEvent::Queued);
            }
            EnqueueOutcome::Coalesced { attempts } => {
                debug!(%connection, message_id = %key, attempts, "retry report coalesced");
                metrics::inc_retry(RetryEvent::Failed);
            }
            EnqueueOutcome::Dropped { attempts } => {
                warn!(
                    %connection,
                    %tenant,
                    message_id = %key,
                    attempts,
                    category = %error.effective_category(),
                    error = %error,
                    "retry attempts exhausted; message dropped"
                );
                metrics::inc_retry(RetryEvent::Dropped);
            }
        }
        metrics::set_retry_pending(self.store.len());
        outcome
    }

    /// Resend every pending message for `connection` in insertion order.
    ///
    /// Attempts are spaced by the configured drain interval so a freshly
    /// reconnected session is not flooded. A concurrent drain of the same
    /// connection returns an empty report, as does a drain of an empty queue;
    /// the latter has no side effects at all.
    pub async fn drain(&self, connection: ConnectionId) -> DrainReport {
        let mut report = DrainReport::default();
        let Some(_guard) = DrainGuard::acquire(&self.draining, connection) else {
            debug!(%connection, "drain already running");
            return report;
        };
        let pending = self.store.for_connection(connection);
        if pending.is_empty() {
            return report;
        }
        info!(%connection, pending = pending.len(), "draining pending messages");

        let limiter = RateLimiter::builder()
            .initial(1)
            .refill(1)
            .max(1)
            .interval(self.drain_interval)
            .build();
        for entry in pending {
            limiter.acquire(1).await;
            // A sweep or a saturating report may have removed or replaced it.
            if self
                .store
                .get(&entry.key)
                .is_none_or(|current| current.sequence != entry.sequence)
            {
                continue;
            }
            let result = timeout(
                self.send_timeout,
                self.sender.resend(connection, &entry.message),
            )
            .await;
            match result {
                Ok(Ok(())) => {
                    self.store.entry(&entry.key, &mut |existing| match existing {
                        Some(current) if current.sequence == entry.sequence => EntryAction::Remove,
                        _ => EntryAction::Keep,
                    });
                    report.resent += 1;
                    metrics::inc_retry(RetryEvent::Resent);
                    debug!(%connection, message_id = %entry.key, "message resent");
                }
                Ok(Err(error)) => self.record_failed_resend(&entry, error, &mut report),
                Err(_) => {
                    let error = ProtocolError::new(
                        ErrorCategory::Timeout,
                        format!("resend timed out after {:?}", self.send_timeout),
                    );
                    self.record_failed_resend(&entry, error, &mut report);
                }
            }
        }

        info!(
            %connection,
            resent = report.resent,
            failed = report.failed,
            dropped = report.dropped,
            "drain finished"
        );
        metrics::set_retry_pending(self.store.len());
        report
    }

    fn record_failed_resend(
        &self,
        sent: &PendingOutboundMessage,
        error: ProtocolError,
        report: &mut DrainReport,
    ) {
        let key = &sent.key;
        let max_attempts = self.max_attempts;
        let now = Instant::now();
        let mut attempts = None;
        let mut dropped = false;
        self.store.entry(key, &mut |existing| {
            let Some(entry) = existing.filter(|entry| entry.sequence == sent.sequence) else {
                return EntryAction::Keep;
            };
            let next = entry.attempts.saturating_add(1);
            attempts = Some(next);
            if next > max_attempts {
                dropped = true;
                return EntryAction::Remove;
            }
            entry.attempts = next;
            entry.last_attempt_at = now;
            entry.last_error = error.clone();
            EntryAction::Keep
        });
        let Some(attempts) = attempts else {
            return;
        };
        if dropped {
            report.dropped += 1;
            metrics::inc_retry(RetryEvent::Dropped);
            warn!(
                message_id = %key,
                attempts,
                category = %error.effective_category(),
                error = %error,
                "message permanently failed"
            );
        } else {
            report.failed += 1;
            metrics::inc_retry(RetryEvent::Failed);
            debug!(message_id = %key, attempts, error = %error, "resend failed; message kept");
        }
    }

    /// Remove entries not attempted within the maximum age of `now`.
    ///
    /// Returns the number of removed entries.
    pub fn sweep(&self, now: Instant) -> usize {
        let max_age = self.max_age;
        let removed = self
            .store
            .remove_where(&|entry| now.saturating_duration_since(entry.last_attempt_at) > max_age);
        for entry in &removed {
            warn!(
                connection = %entry.connection,
                tenant = %entry.tenant,
                message_id = %entry.key,
                attempts = entry.attempts,
                category = %entry.last_error.effective_category(),
                "pending message expired"
            );
            metrics::inc_retry(RetryEvent::Expired);
        }
        if !removed.is_empty() {
            metrics::set_retry_pending(self.store.len());
        }
        removed.len()
    }

    /// Aggregate counts by connection and by last-error category.
    #[must_use]
    pub fn stats(&self) -> RetryStats { RetryStats::from_entries(&self.store.snapshot()) }

    /// Pending entries for `connection` in drain order.
    #[must_use]
    pub fn pending(&self, connection: ConnectionId) -> Vec<PendingOutboundMessage> {
        self.store.for_connection(connection)
    }

    /// Number of pending entries across all connections.
    #[must_use]
    pub fn len(&self) -> usize { self.store.len() }

    /// Returns true if nothing is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.store.is_empty() }
}

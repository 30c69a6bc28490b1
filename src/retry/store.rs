//! Storage of pending messages.

use dashmap::{DashMap, mapref::entry::Entry};

use super::{MessageKey, PendingOutboundMessage};
use crate::session::ConnectionId;

/// Decision returned from a [`RetryStore::entry`] callback.
#[derive(Debug)]
pub enum EntryAction {
    /// Leave the slot as the callback left it.
    Keep,
    /// Fill an empty slot with the given message.
    Insert(PendingOutboundMessage),
    /// Remove the existing message.
    Remove,
}

/// Keyed storage for [`PendingOutboundMessage`] entries.
///
/// As with [`crate::incident::IncidentStore`], mutating callbacks run under a
/// lock on their key only.
pub trait RetryStore: Send + Sync + 'static {
    /// Inspect the slot for `key` and apply the returned action atomically.
    ///
    /// `decide` runs exactly once, with `Some` if an entry exists. Returning
    /// [`EntryAction::Insert`] for an occupied slot or [`EntryAction::Remove`]
    /// for an empty one has no effect.
    fn entry(
        &self,
        key: &MessageKey,
        decide: &mut dyn FnMut(Option<&mut PendingOutboundMessage>) -> EntryAction,
    );

    /// Return a copy of the entry for `key`.
    fn get(&self, key: &MessageKey) -> Option<PendingOutboundMessage>;

    /// Remove and return the entry for `key`.
    fn remove(&self, key: &MessageKey) -> Option<PendingOutboundMessage>;

    /// Entries for `connection`, ordered by insertion sequence.
    fn for_connection(&self, connection: ConnectionId) -> Vec<PendingOutboundMessage>;

    /// Remove every entry matching `expired` and return the removed entries.
    fn remove_where(
        &self,
        expired: &dyn Fn(&PendingOutboundMessage) -> bool,
    ) -> Vec<PendingOutboundMessage>;

    /// Copy of every entry, in no particular order.
    fn snapshot(&self) -> Vec<PendingOutboundMessage>;

    /// Number of stored entries.
    fn len(&self) -> usize;

    /// Returns true if nothing is stored.
    fn is_empty(&self) -> bool { self.len() == 0 }
}

/// Default [`RetryStore`] backed by a [`DashMap`].
#[derive(Debug, Default)]
pub struct InMemoryRetryStore(DashMap<MessageKey, PendingOutboundMessage>);

impl InMemoryRetryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self { Self::default() }
}

impl RetryStore for InMemoryRetryStore {
    fn entry(
        &self,
        key: &MessageKey,
        decide: &mut dyn FnMut(Option<&mut PendingOutboundMessage>) -> EntryAction,
    ) {
        match self.0.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                if matches!(decide(Some(occupied.get_mut())), EntryAction::Remove) {
                    occupied.remove();
                }
            }
            Entry::Vacant(vacant) => {
                if let EntryAction::Insert(message) = decide(None) {
                    vacant.insert(message);
                }
            }
        }
    }

    fn get(&self, key: &MessageKey) -> Option<PendingOutboundMessage> {
        self.0.get(key).map(|entry| entry.value().clone())
    }

    fn remove(&self, key: &MessageKey) -> Option<PendingOutboundMessage> {
        self.0.remove(key).map(|(_, message)| message)
    }

    fn for_connection(&self, connection: ConnectionId) -> Vec<PendingOutboundMessage> {
        let mut entries: Vec<_> = self
            .0
            .iter()
            .filter(|entry| entry.connection == connection)
            .map(|entry| entry.value().clone())
            .collect();
        entries.sort_by_key(|entry| entry.sequence);
        entries
    }

    fn remove_where(
        &self,
        expired: &dyn Fn(&PendingOutboundMessage) -> bool,
    ) -> Vec<PendingOutboundMessage> {
        let mut removed = Vec::new();
        self.0.retain(|_, message| {
            if expired(message) {
                removed.push(message.clone());
                false
            } else {
                true
            }
        });
        removed.sort_by_key(|entry| entry.sequence);
        removed
    }

    fn snapshot(&self) -> Vec<PendingOutboundMessage> {
        self.0.iter().map(|entry| entry.value().clone()).collect()
    }

    fn len(&self) -> usize { self.0.len() }
}

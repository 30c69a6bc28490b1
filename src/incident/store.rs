//! Storage of incident records.
//!
//! [`IncidentStore`] lets tests and embedders substitute their own map. Every
//! mutating method must run its closure under an exclusive lock on that key
//! alone, so the tracker's check-and-set on the recovery state is atomic per
//! connection while different connections proceed in parallel.

use dashmap::DashMap;
use tokio::time::Instant;

use super::ConnectionIncident;
use crate::session::ConnectionId;

/// Keyed storage for [`ConnectionIncident`] records.
pub trait IncidentStore: Send + Sync + 'static {
    /// Apply `update` to the record for `connection`, creating a fresh record
    /// stamped `now` first if none exists. Returns the record after the update.
    ///
    /// `update` must run exactly once, while holding the key's lock.
    fn upsert(
        &self,
        connection: ConnectionId,
        now: Instant,
        update: &mut dyn FnMut(&mut ConnectionIncident),
    ) -> ConnectionIncident;

    /// Apply `update` to an existing record under the key's lock.
    ///
    /// Returns the updated record, or `None` without calling `update` if no
    /// record exists.
    fn update(
        &self,
        connection: ConnectionId,
        update: &mut dyn FnMut(&mut ConnectionIncident),
    ) -> Option<ConnectionIncident>;

    /// Return a copy of the record for `connection`.
    fn get(&self, connection: ConnectionId) -> Option<ConnectionIncident>;

    /// Remove every record for which `expired` returns true. Returns the
    /// number of removed records.
    fn remove_where(&self, expired: &dyn Fn(&ConnectionIncident) -> bool) -> usize;

    /// Count records matching `predicate`.
    fn count_where(&self, predicate: &dyn Fn(&ConnectionIncident) -> bool) -> usize;

    /// Number of stored records.
    fn len(&self) -> usize;

    /// Returns true if no records are stored.
    fn is_empty(&self) -> bool { self.len() == 0 }
}

/// Default [`IncidentStore`] backed by a sharded [`DashMap`].
///
/// `DashMap` entry guards hold a per-shard write lock, which gives the
/// required per-key exclusion without a global mutex.
#[derive(Debug, Default)]
pub struct InMemoryIncidentStore(DashMap<ConnectionId, ConnectionIncident>);

impl InMemoryIncidentStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self { Self::default() }
}

impl IncidentStore for InMemoryIncidentStore {
    fn upsert(
        &self,
        connection: ConnectionId,
        now: Instant,
        update: &mut dyn FnMut(&mut ConnectionIncident),
    ) -> ConnectionIncident {
        let mut entry = self
            .0
            .entry(connection)
            .or_insert_with(|| ConnectionIncident::new(connection, now));
        update(entry.value_mut());
        entry.value().clone()
    }

    fn update(
        &self,
        connection: ConnectionId,
        update: &mut dyn FnMut(&mut ConnectionIncident),
    ) -> Option<ConnectionIncident> {
        let mut entry = self.0.get_mut(&connection)?;
        update(entry.value_mut());
        Some(entry.value().clone())
    }

    fn get(&self, connection: ConnectionId) -> Option<ConnectionIncident> {
        self.0.get(&connection).map(|entry| entry.value().clone())
    }

    fn remove_where(&self, expired: &dyn Fn(&ConnectionIncident) -> bool) -> usize {
        let before = self.0.len();
        // `retain` takes per-shard write locks, so a concurrent `upsert` either
        // lands before the check or after the removal, never in between.
        self.0.retain(|_, incident| !expired(incident));
        before.saturating_sub(self.0.len())
    }

    fn count_where(&self, predicate: &dyn Fn(&ConnectionIncident) -> bool) -> usize {
        self.0.iter().filter(|entry| predicate(entry.value())).count()
    }

    fn len(&self) -> usize { self.0.len() }
}

//! # Correlation Registry
//!
//! The set of live collectors and the fan-out point between the connection
//! and the exchanges waiting on it.
//!
//! ## Layout
//!
//! ```text
//!                    deliver(packet)
//!                          │
//!          ┌───────────────┴────────────────┐
//!          ▼                                ▼
//!  indexed[packet.correlation_id]      fallback (all)
//!   (exact-id filters)                 (any other filter)
//!          │                                │
//!          └──────────► offer() ◄───────────┘
//! ```
//!
//! Filters that promise an exact correlation id are indexed by it, so an
//! inbound packet only visits the collectors waiting on its id plus the
//! fallback set. Observable behaviour is the same as offering every packet
//! to every collector: an indexed filter rejects all other ids anyway.
//!
//! Delivery clones the matching `Arc`s out of the maps and releases the
//! shard locks before calling any filter, so register/unregister never wait
//! behind an in-progress delivery. A collector removed after the snapshot is
//! closed first, and a closed collector ignores offers.

use crate::collector::{Collector, CollectorId, CollectorShared, Offer};
use crate::correlation::CorrelationId;
use crate::packet::Packet;
use crate::DEFAULT_MAX_COLLECTORS;
use dashmap::DashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, warn};

/// Errors from registry membership operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// Too many exchanges in flight.
    #[error("registry full: {max} collectors already registered")]
    CapacityExceeded { max: usize },

    /// The handle is not (or no longer) registered here.
    #[error("{collector_id} is not registered")]
    UnknownHandle { collector_id: CollectorId },
}

/// Proof of registration, consumed by [`CorrelationRegistry::unregister`].
pub struct RegistrationHandle {
    collector_id: CollectorId,
    key: Option<CorrelationId>,
    shared: Arc<CollectorShared>,
}

impl fmt::Debug for RegistrationHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistrationHandle")
            .field("collector_id", &self.collector_id)
            .field("key", &self.key)
            .finish()
    }
}

impl PartialEq for RegistrationHandle {
    fn eq(&self, other: &Self) -> bool {
        self.collector_id == other.collector_id
    }
}

impl Eq for RegistrationHandle {}

impl RegistrationHandle {
    pub fn collector_id(&self) -> CollectorId {
        self.collector_id
    }

    /// Correlation id the collector is indexed under, if any.
    pub fn correlation_key(&self) -> Option<&CorrelationId> {
        self.key.as_ref()
    }
}

/// Registry counters.
#[derive(Debug, Default)]
pub struct RegistryStats {
    /// Total collectors registered
    pub total_registered: AtomicU64,
    /// Total collectors removed
    pub total_unregistered: AtomicU64,
    /// Total packets delivered
    pub packets_delivered: AtomicU64,
    /// Packets accepted by at least one collector
    pub packets_matched: AtomicU64,
    /// Packets no collector accepted
    pub packets_unmatched: AtomicU64,
    /// Entries reclaimed after their collector was dropped unregistered
    pub collectors_pruned: AtomicU64,
}

/// Thread-safe set of live collectors.
pub struct CorrelationRegistry {
    /// Collectors with exact-id filters, keyed by that id.
    indexed: DashMap<CorrelationId, Vec<Arc<CollectorShared>>>,
    /// Collectors whose filters are not bound to a single id.
    fallback: DashMap<CollectorId, Arc<CollectorShared>>,
    /// Live collector count across both maps.
    live: AtomicUsize,
    max_collectors: usize,
    stats: RegistryStats,
}

impl CorrelationRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_COLLECTORS)
    }

    /// Registry refusing registrations beyond `max_collectors` live entries.
    #[must_use]
    pub fn with_capacity(max_collectors: usize) -> Self {
        Self {
            indexed: DashMap::new(),
            fallback: DashMap::new(),
            live: AtomicUsize::new(0),
            max_collectors,
            stats: RegistryStats::default(),
        }
    }

    /// Add a collector to the live set.
    ///
    /// At capacity, entries whose collectors were dropped without being
    /// unregistered are reclaimed before the registration is refused.
    pub fn register(&self, collector: &Collector) -> Result<RegistrationHandle, RegistryError> {
        let previous = match self.reserve() {
            Some(previous) => previous,
            None => {
                self.prune_abandoned();
                self.reserve().ok_or_else(|| {
                    warn!(
                        live = self.len(),
                        max = self.max_collectors,
                        "Too many pending exchanges; refusing registration"
                    );
                    RegistryError::CapacityExceeded {
                        max: self.max_collectors,
                    }
                })?
            }
        };

        let shared = collector.shared();
        let collector_id = shared.id();
        let key = shared.filter().correlation_key().cloned();

        match &key {
            Some(id) => self
                .indexed
                .entry(id.clone())
                .or_default()
                .push(Arc::clone(&shared)),
            None => {
                self.fallback.insert(collector_id, Arc::clone(&shared));
            }
        }
        self.stats.total_registered.fetch_add(1, Ordering::Relaxed);

        debug!(
            collector_id = %collector_id,
            correlation_id = key.as_ref().map(CorrelationId::as_str),
            live = previous + 1,
            "Registered collector"
        );

        Ok(RegistrationHandle {
            collector_id,
            key,
            shared,
        })
    }

    /// Claim one live slot. Returns the previous live count.
    fn reserve(&self) -> Option<usize> {
        let previous = self.live.fetch_add(1, Ordering::AcqRel);
        if previous >= self.max_collectors {
            self.live.fetch_sub(1, Ordering::AcqRel);
            return None;
        }
        Some(previous)
    }

    /// Remove a collector and close it.
    ///
    /// Safe while a delivery to the same collector is in progress: the
    /// collector is closed on the way out, and `close` waits for an in-flight
    /// offer to finish, so nothing is buffered after this returns.
    pub fn unregister(&self, handle: &RegistrationHandle) -> Result<(), RegistryError> {
        let removed = match &handle.key {
            Some(id) => self.remove_indexed(id, handle.collector_id),
            None => self
                .fallback
                .remove(&handle.collector_id)
                .map(|(_, shared)| shared),
        };

        let Some(shared) = removed else {
            if handle.shared.was_pruned() {
                debug!(
                    collector_id = %handle.collector_id,
                    "Collector already reclaimed by the registry"
                );
                return Ok(());
            }
            error!(
                collector_id = %handle.collector_id,
                "Unregister of unknown collector (double deregistration?)"
            );
            return Err(RegistryError::UnknownHandle {
                collector_id: handle.collector_id,
            });
        };

        shared.close();
        let live = self.live.fetch_sub(1, Ordering::AcqRel) - 1;
        self.stats.total_unregistered.fetch_add(1, Ordering::Relaxed);

        debug!(collector_id = %handle.collector_id, live, "Unregistered collector");
        Ok(())
    }

    fn remove_indexed(
        &self,
        id: &CorrelationId,
        collector_id: CollectorId,
    ) -> Option<Arc<CollectorShared>> {
        let mut entry = self.indexed.get_mut(id)?;
        let position = entry.iter().position(|c| c.id() == collector_id)?;
        let shared = entry.swap_remove(position);
        let now_empty = entry.is_empty();
        drop(entry);

        if now_empty {
            // A concurrent register may have refilled the entry meanwhile.
            self.indexed.remove_if(id, |_, waiting| waiting.is_empty());
        }
        Some(shared)
    }

    /// Offer `packet` to every registered collector that could match it.
    ///
    /// Returns the number of collectors whose filter accepted the packet.
    /// Zero is a normal outcome: the packet was unsolicited.
    pub fn deliver(&self, packet: &Packet) -> usize {
        let mut targets: Vec<Arc<CollectorShared>> = self
            .indexed
            .get(packet.correlation_id())
            .map(|entry| entry.value().clone())
            .unwrap_or_default();
        targets.extend(self.fallback.iter().map(|entry| Arc::clone(entry.value())));

        let mut matched = 0;
        for collector in &targets {
            match collector.offer(packet) {
                Offer::Buffered | Offer::Duplicate => matched += 1,
                Offer::Closed if collector.is_abandoned() => {
                    self.prune(collector);
                }
                Offer::Closed | Offer::Rejected => {}
            }
        }

        self.stats.packets_delivered.fetch_add(1, Ordering::Relaxed);
        if matched > 0 {
            self.stats.packets_matched.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats.packets_unmatched.fetch_add(1, Ordering::Relaxed);
        }

        debug!(
            correlation_id = %packet.correlation_id(),
            kind = %packet.kind(),
            candidates = targets.len(),
            matched,
            "Delivered packet"
        );

        matched
    }

    /// Reclaim every entry whose collector was dropped without being
    /// unregistered. Returns how many were removed.
    pub fn prune_abandoned(&self) -> usize {
        let mut abandoned: Vec<Arc<CollectorShared>> = self
            .fallback
            .iter()
            .filter(|entry| entry.value().is_abandoned())
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for entry in self.indexed.iter() {
            abandoned.extend(entry.value().iter().filter(|c| c.is_abandoned()).cloned());
        }

        abandoned.iter().filter(|shared| self.prune(shared)).count()
    }

    /// Remove an abandoned entry. False if it was already gone.
    fn prune(&self, shared: &Arc<CollectorShared>) -> bool {
        // Flag first so a racing unregister that finds nothing succeeds.
        shared.mark_pruned();
        let removed = match shared.filter().correlation_key() {
            Some(id) => self.remove_indexed(id, shared.id()).is_some(),
            None => self.fallback.remove(&shared.id()).is_some(),
        };
        if removed {
            let live = self.live.fetch_sub(1, Ordering::AcqRel) - 1;
            self.stats.collectors_pruned.fetch_add(1, Ordering::Relaxed);
            debug!(collector_id = %shared.id(), live, "Pruned abandoned collector");
        }
        removed
    }

    /// Number of live collectors.
    pub fn len(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_registered(&self, handle: &RegistrationHandle) -> bool {
        match &handle.key {
            Some(id) => self
                .indexed
                .get(id)
                .is_some_and(|entry| entry.iter().any(|c| c.id() == handle.collector_id)),
            None => self.fallback.contains_key(&handle.collector_id),
        }
    }

    pub fn max_collectors(&self) -> usize {
        self.max_collectors
    }

    pub fn stats(&self) -> &RegistryStats {
        &self.stats
    }
}

impl Default for CorrelationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::CorrelationFilter;
    use crate::packet::PacketKind;
    use std::time::Duration;

    #[tokio::test]
    async fn test_register_deliver_take() {
        let registry = CorrelationRegistry::new();
        let mut c1 = Collector::new(CorrelationFilter::id("abc"));
        let handle = registry.register(&c1).unwrap();
        assert_eq!(registry.len(), 1);

        let reply = Packet::result("abc");
        assert_eq!(registry.deliver(&reply), 1);

        // A second, unrelated packet while c1 is still registered.
        assert_eq!(registry.deliver(&Packet::result("xyz")), 0);
        assert_eq!(c1.matched_count(), 1);

        let taken = c1.take(Duration::from_millis(10)).await.unwrap();
        assert_eq!(taken, reply);

        registry.unregister(&handle).unwrap();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_unregistered_collector_receives_nothing() {
        let registry = CorrelationRegistry::new();
        let mut collector = Collector::new(CorrelationFilter::id("abc"));
        let handle = registry.register(&collector).unwrap();
        registry.unregister(&handle).unwrap();

        assert_eq!(registry.deliver(&Packet::result("abc")), 0);
        assert_eq!(collector.matched_count(), 0);
        assert_eq!(collector.offer(&Packet::result("abc")), Offer::Closed);
        assert!(collector.try_take().is_err());
    }

    #[test]
    fn test_double_unregister_is_reported() {
        let registry = CorrelationRegistry::new();
        let collector = Collector::new(CorrelationFilter::id("abc"));
        let handle = registry.register(&collector).unwrap();

        assert!(registry.unregister(&handle).is_ok());
        assert_eq!(
            registry.unregister(&handle),
            Err(RegistryError::UnknownHandle {
                collector_id: collector.id()
            })
        );
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn test_fallback_filters_see_every_packet() {
        let registry = CorrelationRegistry::new();
        let events = Collector::new(|p: &Packet| p.kind() == PacketKind::Event);
        let handle = registry.register(&events).unwrap();
        assert!(handle.correlation_key().is_none());

        assert_eq!(registry.deliver(&Packet::result("r1")), 0);
        assert_eq!(registry.deliver(&Packet::event("m1")), 1);
        assert!(registry.is_registered(&handle));

        registry.unregister(&handle).unwrap();
        assert!(!registry.is_registered(&handle));
    }

    #[test]
    fn test_shared_correlation_id() {
        let registry = CorrelationRegistry::new();
        let a = Collector::new(CorrelationFilter::id("same"));
        let b = Collector::new(CorrelationFilter::id("same"));
        let ha = registry.register(&a).unwrap();
        let hb = registry.register(&b).unwrap();

        assert_eq!(registry.deliver(&Packet::result("same")), 2);

        registry.unregister(&ha).unwrap();
        assert!(registry.is_registered(&hb));
        registry.unregister(&hb).unwrap();
        assert!(registry.indexed.is_empty());
    }

    #[test]
    fn test_capacity_limit() {
        let registry = CorrelationRegistry::with_capacity(1);
        let a = Collector::new(CorrelationFilter::id("a"));
        let b = Collector::new(CorrelationFilter::id("b"));

        let ha = registry.register(&a).unwrap();
        assert_eq!(
            registry.register(&b),
            Err(RegistryError::CapacityExceeded { max: 1 })
        );
        assert_eq!(registry.len(), 1);

        registry.unregister(&ha).unwrap();
        assert!(registry.register(&b).is_ok());
    }

    #[test]
    fn test_dropped_collector_is_reclaimed_on_delivery() {
        let registry = CorrelationRegistry::new();
        let indexed = Collector::new(CorrelationFilter::id("abc"));
        let fallback = Collector::new(|p: &Packet| p.kind() == PacketKind::Event);
        let indexed_handle = registry.register(&indexed).unwrap();
        registry.register(&fallback).unwrap();
        assert_eq!(registry.len(), 2);

        drop(indexed);
        drop(fallback);
        assert_eq!(registry.deliver(&Packet::result("abc")), 0);

        assert_eq!(registry.len(), 0);
        assert!(!registry.is_registered(&indexed_handle));
        assert_eq!(registry.stats().collectors_pruned.load(Ordering::Relaxed), 2);
        // Unregistering a reclaimed entry is not an error.
        assert!(registry.unregister(&indexed_handle).is_ok());
    }

    #[test]
    fn test_dropped_collector_frees_capacity() {
        let registry = CorrelationRegistry::with_capacity(2);
        for n in 0..10 {
            let collector = Collector::new(CorrelationFilter::id(format!("id-{}", n)));
            registry.register(&collector).unwrap();
        }
        assert!(registry.len() <= 2);

        let live = Collector::new(CorrelationFilter::id("live"));
        let handle = registry.register(&live).unwrap();
        assert_eq!(registry.prune_abandoned(), 0);
        assert_eq!(registry.len(), 1);

        registry.unregister(&handle).unwrap();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_closed_but_owned_collector_is_not_pruned() {
        let registry = CorrelationRegistry::new();
        let collector = Collector::new(CorrelationFilter::id("abc"));
        let handle = registry.register(&collector).unwrap();

        collector.close();
        registry.deliver(&Packet::result("abc"));
        assert_eq!(registry.prune_abandoned(), 0);
        assert_eq!(registry.len(), 1);

        registry.unregister(&handle).unwrap();
        assert_eq!(
            registry.unregister(&handle),
            Err(RegistryError::UnknownHandle {
                collector_id: collector.id()
            })
        );
    }

    #[test]
    fn test_stats() {
        let registry = CorrelationRegistry::new();
        let collector = Collector::new(CorrelationFilter::id("a"));
        let handle = registry.register(&collector).unwrap();

        registry.deliver(&Packet::result("a"));
        registry.deliver(&Packet::result("b"));
        registry.unregister(&handle).unwrap();

        let stats = registry.stats();
        assert_eq!(stats.total_registered.load(Ordering::Relaxed), 1);
        assert_eq!(stats.total_unregistered.load(Ordering::Relaxed), 1);
        assert_eq!(stats.packets_delivered.load(Ordering::Relaxed), 2);
        assert_eq!(stats.packets_matched.load(Ordering::Relaxed), 1);
        assert_eq!(stats.packets_unmatched.load(Ordering::Relaxed), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_membership_during_delivery() {
        let registry = Arc::new(CorrelationRegistry::new());

        let deliverer = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move {
                for i in 0..2_000 {
                    registry.deliver(&Packet::result(format!("id-{}", i % 50)));
                    if i % 100 == 0 {
                        tokio::task::yield_now().await;
                    }
                }
            })
        };

        let mut churners = Vec::new();
        for worker in 0..4 {
            let registry = Arc::clone(&registry);
            churners.push(tokio::spawn(async move {
                for i in 0..250 {
                    let id = format!("id-{}", (worker * 250 + i) % 50);
                    let collector = Collector::new(CorrelationFilter::id(id));
                    let handle = registry.register(&collector).unwrap();
                    tokio::task::yield_now().await;
                    registry.unregister(&handle).unwrap();
                }
            }));
        }

        deliverer.await.unwrap();
        for churner in churners {
            churner.await.unwrap();
        }
        assert!(registry.is_empty());
        assert!(registry.fallback.is_empty());
    }
}

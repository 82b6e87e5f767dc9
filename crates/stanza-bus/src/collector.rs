//! # Packet Collector
//!
//! Per-exchange waiter. The delivery path hands every inbound packet to
//! [`Collector::offer`]; the owning exchange waits in [`Collector::take`].
//!
//! ## Buffering Policy
//!
//! An exchange expects exactly one reply, so the collector keeps the first
//! packet its filter accepts and silently drops later matches. The slot is a
//! `tokio::sync::oneshot` channel: offering never blocks and the waiter is
//! woken without polling.

use crate::filter::PacketFilter;
use crate::packet::Packet;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::trace;

static NEXT_COLLECTOR_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique collector identifier (used as the registry key).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CollectorId(u64);

impl CollectorId {
    fn next() -> Self {
        Self(NEXT_COLLECTOR_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for CollectorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "collector-{}", self.0)
    }
}

/// Errors from waiting on a collector.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CollectError {
    /// Nothing matched before the deadline.
    #[error("no matching packet within {waited:?}")]
    Timeout { waited: Duration },

    /// The collector was closed before anything matched.
    #[error("collector closed")]
    Closed,

    /// `take` was already called on this collector.
    #[error("collector already consumed")]
    AlreadyTaken,
}

/// What happened to a packet handed to [`Collector::offer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offer {
    /// The filter rejected the packet.
    Rejected,
    /// First match; stored for the waiter.
    Buffered,
    /// Matched, but a packet was already buffered. Dropped.
    Duplicate,
    /// The collector is closed. Dropped without consulting the filter.
    Closed,
}

impl Offer {
    /// True when the packet belonged to this collector.
    #[must_use]
    pub fn is_match(self) -> bool {
        matches!(self, Self::Buffered | Self::Duplicate)
    }
}

/// The half of a collector that the registry shares with the delivery path.
pub(crate) struct CollectorShared {
    id: CollectorId,
    filter: Box<dyn PacketFilter>,
    slot: Mutex<Option<oneshot::Sender<Packet>>>,
    closed: AtomicBool,
    /// The owning `Collector` was dropped.
    abandoned: AtomicBool,
    /// The registry removed this entry on its own.
    pruned: AtomicBool,
    matched: AtomicU64,
}

impl CollectorShared {
    pub(crate) fn id(&self) -> CollectorId {
        self.id
    }

    pub(crate) fn filter(&self) -> &dyn PacketFilter {
        self.filter.as_ref()
    }

    pub(crate) fn offer(&self, packet: &Packet) -> Offer {
        if self.closed.load(Ordering::Acquire) {
            return Offer::Closed;
        }
        if !self.filter.matches(packet) {
            return Offer::Rejected;
        }
        self.matched.fetch_add(1, Ordering::Relaxed);

        let mut slot = self.slot.lock();
        // close() may have run while the filter was evaluated
        if self.closed.load(Ordering::Acquire) {
            return Offer::Closed;
        }
        let Some(sender) = slot.take() else {
            trace!(collector_id = %self.id, correlation_id = %packet.correlation_id(), "Dropping duplicate match");
            return Offer::Duplicate;
        };
        // A dropped receiver means the waiter is gone; the packet still
        // belonged here.
        let _ = sender.send(packet.clone());
        Offer::Buffered
    }

    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
        // Waits out an in-flight offer; after this no packet can be buffered.
        self.slot.lock().take();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn is_abandoned(&self) -> bool {
        self.abandoned.load(Ordering::Acquire)
    }

    pub(crate) fn mark_pruned(&self) {
        self.pruned.store(true, Ordering::Release);
    }

    pub(crate) fn was_pruned(&self) -> bool {
        self.pruned.load(Ordering::Acquire)
    }
}

/// Per-call waiter holding a filter and a single-slot buffer.
pub struct Collector {
    shared: Arc<CollectorShared>,
    receiver: Option<oneshot::Receiver<Packet>>,
}

impl Collector {
    /// Create an open collector around `filter`.
    pub fn new(filter: impl PacketFilter + 'static) -> Self {
        Self::from_boxed(Box::new(filter))
    }

    pub fn from_boxed(filter: Box<dyn PacketFilter>) -> Self {
        let (tx, rx) = oneshot::channel();
        Self {
            shared: Arc::new(CollectorShared {
                id: CollectorId::next(),
                filter,
                slot: Mutex::new(Some(tx)),
                closed: AtomicBool::new(false),
                abandoned: AtomicBool::new(false),
                pruned: AtomicBool::new(false),
                matched: AtomicU64::new(0),
            }),
            receiver: Some(rx),
        }
    }

    pub fn id(&self) -> CollectorId {
        self.shared.id
    }

    /// Evaluate the filter and buffer the packet on the first match.
    ///
    /// Never blocks beyond a short uncontended lock.
    pub fn offer(&self, packet: &Packet) -> Offer {
        self.shared.offer(packet)
    }

    /// Mark the collector dead. Later offers are no-ops. Idempotent.
    pub fn close(&self) {
        self.shared.close();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Number of offered packets the filter accepted, duplicates included.
    pub fn matched_count(&self) -> u64 {
        self.shared.matched.load(Ordering::Relaxed)
    }

    /// Wait up to `timeout` for the buffered packet.
    pub async fn take(&mut self, timeout: Duration) -> Result<Packet, CollectError> {
        self.take_until(Instant::now() + timeout).await
    }

    /// Wait until `deadline` for the buffered packet.
    ///
    /// Single use: the receiving half is consumed by the first call, whatever
    /// its outcome.
    pub async fn take_until(&mut self, deadline: Instant) -> Result<Packet, CollectError> {
        let started = Instant::now();
        let receiver = self.receiver.take().ok_or(CollectError::AlreadyTaken)?;

        match tokio::time::timeout_at(deadline, receiver).await {
            Ok(Ok(packet)) => Ok(packet),
            Ok(Err(_)) => Err(CollectError::Closed),
            Err(_) => Err(CollectError::Timeout {
                waited: started.elapsed(),
            }),
        }
    }

    /// Non-blocking check of the slot.
    ///
    /// `Ok(None)` leaves the collector waitable; a returned packet consumes it.
    pub fn try_take(&mut self) -> Result<Option<Packet>, CollectError> {
        let receiver = self.receiver.as_mut().ok_or(CollectError::AlreadyTaken)?;
        match receiver.try_recv() {
            Ok(packet) => {
                self.receiver = None;
                Ok(Some(packet))
            }
            Err(oneshot::error::TryRecvError::Empty) => Ok(None),
            Err(oneshot::error::TryRecvError::Closed) => {
                self.receiver = None;
                Err(CollectError::Closed)
            }
        }
    }

    pub(crate) fn shared(&self) -> Arc<CollectorShared> {
        Arc::clone(&self.shared)
    }
}

impl fmt::Debug for Collector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collector")
            .field("id", &self.shared.id)
            .field("closed", &self.is_closed())
            .field("matched", &self.matched_count())
            .finish()
    }
}

impl Drop for Collector {
    fn drop(&mut self) {
        // Lets the registry reclaim an entry nobody will unregister.
        self.shared.abandoned.store(true, Ordering::Release);
        self.shared.close();
    }
}

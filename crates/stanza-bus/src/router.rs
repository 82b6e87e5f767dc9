//! # Inbound Router
//!
//! The single delivery path. Drains inbound packets from the connection,
//! fans each one out through the [`CorrelationRegistry`], and hands packets
//! that no collector accepted to an [`UnsolicitedHandler`].
//!
//! Server-initiated queries (service discovery, pings) arrive this way: they
//! carry correlation ids nobody here is waiting on.

use crate::packet::Packet;
use crate::registry::CorrelationRegistry;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Receives packets that matched no collector.
///
/// Called inline on the delivery path; implementations must return quickly
/// and must not wait for outbound capacity (use [`crate::Connection::try_send`]).
#[async_trait]
pub trait UnsolicitedHandler: Send + Sync {
    async fn handle(&self, packet: Packet);
}

/// Default handler: log and drop.
#[derive(Debug, Default, Clone, Copy)]
pub struct DropUnsolicited;

#[async_trait]
impl UnsolicitedHandler for DropUnsolicited {
    async fn handle(&self, packet: Packet) {
        debug!(
            correlation_id = %packet.correlation_id(),
            kind = %packet.kind(),
            from = packet.sender(),
            "Dropping unsolicited packet"
        );
    }
}

/// Why [`InboundRouter::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouterExit {
    /// The connection closed its inbound channel.
    InboundClosed,
    /// Shutdown was requested.
    Cancelled,
}

/// Delivery loop between the connection and the registry.
pub struct InboundRouter {
    registry: Arc<CorrelationRegistry>,
    inbound: mpsc::Receiver<Packet>,
    unsolicited: Arc<dyn UnsolicitedHandler>,
}

impl InboundRouter {
    pub fn new(registry: Arc<CorrelationRegistry>, inbound: mpsc::Receiver<Packet>) -> Self {
        Self {
            registry,
            inbound,
            unsolicited: Arc::new(DropUnsolicited),
        }
    }

    #[must_use]
    pub fn with_unsolicited_handler(mut self, handler: Arc<dyn UnsolicitedHandler>) -> Self {
        self.unsolicited = handler;
        self
    }

    /// Deliver one packet. Returns the number of collectors that accepted it.
    pub async fn route(&self, packet: Packet) -> usize {
        let matched = self.registry.deliver(&packet);
        if matched == 0 {
            self.unsolicited.handle(packet).await;
        }
        matched
    }

    /// Run until the inbound channel closes or `cancel` fires.
    ///
    /// Should be spawned as a background task.
    pub async fn run(mut self, cancel: CancellationToken) -> RouterExit {
        info!("Inbound router started");

        let exit = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break RouterExit::Cancelled,
                next = self.inbound.recv() => match next {
                    Some(packet) => {
                        self.route(packet).await;
                    }
                    None => {
                        warn!("Inbound channel closed, stopping router");
                        break RouterExit::InboundClosed;
                    }
                },
            }
        };

        info!(exit = ?exit, pending = self.registry.len(), "Inbound router stopped");
        exit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::Collector;
    use crate::filter::CorrelationFilter;
    use parking_lot::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Recording(Mutex<Vec<Packet>>);

    #[async_trait]
    impl UnsolicitedHandler for Recording {
        async fn handle(&self, packet: Packet) {
            self.0.lock().push(packet);
        }
    }

    #[tokio::test]
    async fn test_matched_packets_skip_unsolicited_path() {
        let registry = Arc::new(CorrelationRegistry::new());
        let recording = Arc::new(Recording::default());
        let (_tx, rx) = mpsc::channel(8);
        let router = InboundRouter::new(Arc::clone(&registry), rx)
            .with_unsolicited_handler(recording.clone());

        let mut collector = Collector::new(CorrelationFilter::id("abc"));
        let handle = registry.register(&collector).unwrap();

        assert_eq!(router.route(Packet::result("abc")).await, 1);
        assert_eq!(router.route(Packet::result("zzz")).await, 0);

        assert!(collector.take(Duration::from_millis(10)).await.is_ok());
        let unsolicited = recording.0.lock();
        assert_eq!(unsolicited.len(), 1);
        assert_eq!(unsolicited[0].correlation_id().as_str(), "zzz");
        drop(unsolicited);

        registry.unregister(&handle).unwrap();
    }

    #[tokio::test]
    async fn test_run_stops_when_inbound_closes() {
        let registry = Arc::new(CorrelationRegistry::new());
        let (tx, rx) = mpsc::channel(8);
        let router = InboundRouter::new(registry, rx);

        tx.send(Packet::event("m1")).await.unwrap();
        drop(tx);

        let exit = router.run(CancellationToken::new()).await;
        assert_eq!(exit, RouterExit::InboundClosed);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let registry = Arc::new(CorrelationRegistry::new());
        let (_tx, rx) = mpsc::channel(8);
        let router = InboundRouter::new(registry, rx);

        let cancel = CancellationToken::new();
        let task = tokio::spawn(router.run(cancel.clone()));
        cancel.cancel();

        assert_eq!(task.await.unwrap(), RouterExit::Cancelled);
    }
}

//! # Packet Filters
//!
//! A filter decides whether an inbound packet belongs to one pending
//! exchange. Filters are pure: they hold no mutable state and may be
//! evaluated from the delivery path while the owning exchange is timing out.

use crate::correlation::CorrelationId;
use crate::packet::{Packet, PacketKind};

/// Predicate over inbound packets.
pub trait PacketFilter: Send + Sync {
    /// Check if a packet belongs to this filter's owner.
    fn matches(&self, packet: &Packet) -> bool;

    /// Exact correlation id this filter requires, if any.
    ///
    /// The registry indexes filters that return `Some` so delivery does not
    /// have to scan them for unrelated packets. Returning `Some(id)` is a
    /// promise that `matches` is false for every packet carrying another id.
    fn correlation_key(&self) -> Option<&CorrelationId> {
        None
    }
}

impl<F> PacketFilter for F
where
    F: Fn(&Packet) -> bool + Send + Sync,
{
    fn matches(&self, packet: &Packet) -> bool {
        self(packet)
    }
}

/// Standard filter: exact correlation id, optionally narrowed by sender
/// identity and packet kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelationFilter {
    /// Required correlation id.
    pub correlation_id: CorrelationId,
    /// Required sender. `None` accepts any sender.
    pub sender: Option<String>,
    /// Accepted kinds. Empty accepts every kind.
    pub kinds: Vec<PacketKind>,
}

impl CorrelationFilter {
    /// Match on correlation id only.
    #[must_use]
    pub fn id(correlation_id: impl Into<CorrelationId>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            sender: None,
            kinds: Vec::new(),
        }
    }

    /// Match the replies (`Result` or `Error`) to `request`, coming from
    /// the request's recipient.
    #[must_use]
    pub fn reply_to(request: &Packet) -> Self {
        let filter = Self::id(request.correlation_id().clone()).replies_only();
        if request.recipient().is_empty() {
            filter
        } else {
            filter.from_sender(request.recipient())
        }
    }

    #[must_use]
    pub fn from_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }

    #[must_use]
    pub fn kinds(mut self, kinds: Vec<PacketKind>) -> Self {
        self.kinds = kinds;
        self
    }

    #[must_use]
    pub fn replies_only(self) -> Self {
        self.kinds(vec![PacketKind::Result, PacketKind::Error])
    }
}

impl PacketFilter for CorrelationFilter {
    fn matches(&self, packet: &Packet) -> bool {
        let id_match = packet.correlation_id() == &self.correlation_id;

        let sender_match = self
            .sender
            .as_deref()
            .map_or(true, |sender| packet.sender() == sender);

        let kind_match = self.kinds.is_empty() || self.kinds.contains(&packet.kind());

        id_match && sender_match && kind_match
    }

    fn correlation_key(&self) -> Option<&CorrelationId> {
        Some(&self.correlation_id)
    }
}

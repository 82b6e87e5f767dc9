//! Answers server-initiated queries.
//!
//! Packets that matched no pending exchange land here. Requests addressed to
//! the component (service discovery, ping, last activity, entity time) get a
//! reply on the same connection; replies nobody waited for are dropped.
//! Answers are queued without waiting; if the outbound queue is full the
//! answer is dropped so delivery of other packets is never held up.

use crate::metrics::record_unsolicited;
use async_trait::async_trait;
use serde_json::{json, Value};
use stanza_bus::{Connection, Packet, PacketKind, StanzaError, UnsolicitedHandler};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

pub const NAMESPACE_DISCO_INFO: &str = "http://jabber.org/protocol/disco#info";
pub const NAMESPACE_PING: &str = "urn:xmpp:ping";
pub const NAMESPACE_LAST_ACTIVITY: &str = "jabber:iq:last";
pub const NAMESPACE_ENTITY_TIME: &str = "urn:xmpp:time";

/// Form type advertising the HTTP API endpoint.
pub const NAMESPACE_API: &str = "http://buddycloud.com/channel_api";
pub const API_ENDPOINT_FIELD: &str = "endpoint";

pub const COMPONENT_NAME: &str = "Media Server";

/// Condition for requests this component does not implement.
pub const FEATURE_NOT_IMPLEMENTED: &str = "feature-not-implemented";

/// [`UnsolicitedHandler`] replying to discovery and liveness queries.
pub struct DiscoveryResponder {
    connection: Arc<dyn Connection>,
    http_endpoint: Option<String>,
    started: Instant,
}

impl DiscoveryResponder {
    pub fn new(connection: Arc<dyn Connection>, http_endpoint: Option<String>) -> Self {
        Self {
            connection,
            http_endpoint,
            started: Instant::now(),
        }
    }

    /// Payload of a `disco#info` result.
    pub fn info_payload(&self) -> Value {
        let mut info = json!({
            "identity": {
                "category": "component",
                "type": "generic",
                "name": COMPONENT_NAME,
            },
            "features": [
                NAMESPACE_DISCO_INFO,
                NAMESPACE_PING,
                NAMESPACE_LAST_ACTIVITY,
                NAMESPACE_ENTITY_TIME,
            ],
        });

        if let Some(endpoint) = &self.http_endpoint {
            info["forms"] = json!([{
                "type": "result",
                "fields": [
                    { "var": "FORM_TYPE", "type": "hidden", "values": [NAMESPACE_API] },
                    { "var": API_ENDPOINT_FIELD, "type": "text-single", "values": [endpoint] },
                ],
            }]);
        }
        info
    }

    /// Reply for a request, or an error packet if the query is unknown.
    fn answer(&self, request: &Packet) -> Packet {
        let reply = Packet::reply_to(request).with_sender(self.connection.identity());
        match request.field("query") {
            Some("disco#info") => reply.with_payload(self.info_payload()),
            Some("ping") => reply,
            Some("last") => reply.with_payload(json!({
                "seconds": self.started.elapsed().as_secs(),
            })),
            Some("time") => {
                let utc_ms = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_millis() as u64)
                    .unwrap_or_default();
                reply.with_payload(json!({ "utc_ms": utc_ms }))
            }
            _ => reply
                .with_kind(PacketKind::Error)
                .with_payload(StanzaError::new(FEATURE_NOT_IMPLEMENTED).to_payload()),
        }
    }
}

#[async_trait]
impl UnsolicitedHandler for DiscoveryResponder {
    async fn handle(&self, packet: Packet) {
        record_unsolicited();

        if !packet.kind().is_request() {
            debug!(
                correlation_id = %packet.correlation_id(),
                kind = %packet.kind(),
                from = packet.sender(),
                "Dropping unmatched reply"
            );
            return;
        }

        let reply = self.answer(&packet);
        debug!(
            correlation_id = %packet.correlation_id(),
            query = packet.field("query").unwrap_or_default(),
            from = packet.sender(),
            reply_kind = %reply.kind(),
            "Answering server query"
        );
        // Runs on the delivery path: never wait for outbound capacity.
        if let Err(e) = self.connection.try_send(reply) {
            warn!(
                correlation_id = %packet.correlation_id(),
                error = %e,
                "Dropping answer to server query"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stanza_bus::{
        ChannelConnection, Collector, CorrelationFilter, CorrelationRegistry, InboundRouter,
    };
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    fn responder(endpoint: Option<&str>) -> (DiscoveryResponder, mpsc::Receiver<Packet>) {
        let (connection, outbound) = ChannelConnection::pair("media.example.com", 8);
        (
            DiscoveryResponder::new(Arc::new(connection), endpoint.map(str::to_string)),
            outbound,
        )
    }

    fn query(name: &str) -> Packet {
        Packet::new(PacketKind::Get, "q1")
            .with_sender("example.com")
            .with_recipient("media.example.com")
            .with_payload(json!({ "query": name }))
    }

    #[tokio::test]
    async fn test_disco_info_reply() {
        let (responder, mut outbound) = responder(None);
        responder.handle(query("disco#info")).await;

        let reply = outbound.recv().await.unwrap();
        assert_eq!(reply.kind(), PacketKind::Result);
        assert_eq!(reply.correlation_id().as_str(), "q1");
        assert_eq!(reply.recipient(), "example.com");
        assert_eq!(reply.sender(), "media.example.com");

        let payload = reply.payload();
        assert_eq!(payload["identity"]["category"], "component");
        assert_eq!(payload["identity"]["type"], "generic");
        assert_eq!(payload["identity"]["name"], COMPONENT_NAME);
        assert_eq!(payload["features"].as_array().unwrap().len(), 4);
        assert!(payload.get("forms").is_none());
    }

    #[tokio::test]
    async fn test_disco_info_advertises_endpoint() {
        let (responder, mut outbound) = responder(Some("https://api.example.com"));
        responder.handle(query("disco#info")).await;

        let reply = outbound.recv().await.unwrap();
        let fields = &reply.payload()["forms"][0]["fields"];
        assert_eq!(fields[0]["var"], "FORM_TYPE");
        assert_eq!(fields[0]["values"][0], NAMESPACE_API);
        assert_eq!(fields[1]["var"], API_ENDPOINT_FIELD);
        assert_eq!(fields[1]["values"][0], "https://api.example.com");
    }

    #[tokio::test]
    async fn test_ping_and_unknown_query() {
        let (responder, mut outbound) = responder(None);

        responder.handle(query("ping")).await;
        assert_eq!(outbound.recv().await.unwrap().kind(), PacketKind::Result);

        responder.handle(query("vcard")).await;
        let reply = outbound.recv().await.unwrap();
        assert_eq!(reply.kind(), PacketKind::Error);
        assert_eq!(
            reply.stanza_error().unwrap().condition,
            FEATURE_NOT_IMPLEMENTED
        );
    }

    #[tokio::test]
    async fn test_full_outbound_queue_does_not_stall_delivery() {
        let registry = Arc::new(CorrelationRegistry::new());
        let (connection, mut outbound) = ChannelConnection::pair("media.example.com", 1);
        let connection = Arc::new(connection);
        connection.send(Packet::result("backlog")).await.unwrap();

        let (inbound, inbound_rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let responder = Arc::new(DiscoveryResponder::new(connection, None));
        tokio::spawn(
            InboundRouter::new(Arc::clone(&registry), inbound_rx)
                .with_unsolicited_handler(responder)
                .run(cancel.clone()),
        );

        let mut waiting = Collector::new(CorrelationFilter::id("reply-1"));
        let handle = registry.register(&waiting).unwrap();

        inbound.send(query("ping")).await.unwrap();
        inbound.send(Packet::result("reply-1")).await.unwrap();

        let reply = waiting.take(Duration::from_millis(500)).await.unwrap();
        assert_eq!(reply.correlation_id().as_str(), "reply-1");
        registry.unregister(&handle).unwrap();

        // The ping answer was dropped, not queued behind the backlog.
        let backlog = outbound.recv().await.unwrap();
        assert_eq!(backlog.correlation_id().as_str(), "backlog");
        assert!(outbound.try_recv().is_err());
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_unmatched_reply_is_dropped() {
        let (responder, mut outbound) = responder(None);
        responder.handle(Packet::result("late")).await;
        assert!(outbound.try_recv().is_err());
    }
}

//! Channel visibility lookup on the pub-sub server.
//!
//! Public channels serve their media to anonymous readers; everything else
//! goes through [`crate::AuthenticationCheck`].

use crate::error::AccessError;
use crate::metrics::record_exchange;
use serde_json::{json, Value};
use stanza_bus::{ExchangeClient, Packet};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Access model the pub-sub server reports for world-readable channels.
pub const OPEN_ACCESS_MODEL: &str = "open";

/// Read `{"public": bool}`, or `{"access_model": "open"}`.
pub fn is_public_payload(payload: &Value) -> bool {
    payload
        .get("public")
        .and_then(Value::as_bool)
        .or_else(|| {
            payload
                .get("access_model")
                .and_then(Value::as_str)
                .map(|model| model == OPEN_ACCESS_MODEL)
        })
        .unwrap_or(false)
}

#[derive(Clone)]
pub struct ChannelVisibilityCheck {
    client: Arc<ExchangeClient>,
    server: String,
}

impl ChannelVisibilityCheck {
    pub fn new(client: Arc<ExchangeClient>, server: impl Into<String>) -> Self {
        Self {
            client,
            server: server.into(),
        }
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    /// Whether `channel` is readable by anyone.
    pub async fn is_public(&self, channel: &str) -> Result<bool, AccessError> {
        self.lookup(channel, None).await
    }

    pub async fn is_public_cancellable(
        &self,
        channel: &str,
        cancel: &CancellationToken,
    ) -> Result<bool, AccessError> {
        self.lookup(channel, Some(cancel)).await
    }

    async fn lookup(
        &self,
        channel: &str,
        cancel: Option<&CancellationToken>,
    ) -> Result<bool, AccessError> {
        let request = Packet::request(
            self.server.as_str(),
            json!({ "query": "channel-visibility", "channel": channel }),
        );

        let outcome = self.client.query(request, None, cancel).await;
        record_exchange("channel_visibility", &self.client, &outcome);

        let public = is_public_payload(outcome?.payload());
        debug!(channel, public, "Channel visibility");
        Ok(public)
    }
}

//! Media access service - wires the correlation layer to the connection.

use crate::auth::AuthenticationCheck;
use crate::config::MediaServerConfig;
use crate::discovery::DiscoveryResponder;
use crate::error::{AccessError, ConfigError};
use crate::metrics::refresh_collectors_active;
use crate::visibility::ChannelVisibilityCheck;
use media_telemetry::TelemetryError;
use stanza_bus::{
    Connection, CorrelationRegistry, ExchangeClient, InboundRouter, Packet, RouterExit,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Running access service: one registry, one router, both checks.
pub struct MediaAccessService {
    config: MediaServerConfig,
    client: Arc<ExchangeClient>,
    auth: AuthenticationCheck,
    visibility: ChannelVisibilityCheck,
    cancel: CancellationToken,
    router: JoinHandle<RouterExit>,
}

impl MediaAccessService {
    /// Validate `config` and spawn the inbound router.
    ///
    /// `inbound` carries every packet the connection receives. Must be
    /// called within a tokio runtime.
    pub fn start(
        config: MediaServerConfig,
        connection: Arc<dyn Connection>,
        inbound: mpsc::Receiver<Packet>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        if connection.identity() != config.component_jid {
            warn!(
                configured = %config.component_jid,
                connection = connection.identity(),
                "Connection identity differs from configured component address"
            );
        }

        let registry = Arc::new(CorrelationRegistry::with_capacity(config.max_pending));
        let client = Arc::new(ExchangeClient::new(
            Arc::clone(&registry),
            Arc::clone(&connection),
            config.exchange_timeout,
        ));

        let responder = Arc::new(DiscoveryResponder::new(
            connection,
            config.http_endpoint.clone(),
        ));
        let cancel = CancellationToken::new();
        let router = tokio::spawn(
            InboundRouter::new(registry, inbound)
                .with_unsolicited_handler(responder)
                .run(cancel.clone()),
        );

        let auth = AuthenticationCheck::new(Arc::clone(&client), config.auth_service.clone());
        let visibility =
            ChannelVisibilityCheck::new(Arc::clone(&client), config.pubsub_server.clone());

        info!(
            component = %config.component_jid,
            auth_service = %config.auth_service,
            pubsub_server = %config.pubsub_server,
            timeout_ms = config.exchange_timeout.as_millis() as u64,
            max_pending = config.max_pending,
            "Media access service started"
        );

        Ok(Self {
            config,
            client,
            auth,
            visibility,
            cancel,
            router,
        })
    }

    pub fn auth(&self) -> &AuthenticationCheck {
        &self.auth
    }

    pub fn visibility(&self) -> &ChannelVisibilityCheck {
        &self.visibility
    }

    pub fn client(&self) -> &Arc<ExchangeClient> {
        &self.client
    }

    pub fn config(&self) -> &MediaServerConfig {
        &self.config
    }

    /// Exchanges currently awaiting a reply.
    pub fn pending(&self) -> usize {
        self.client.pending_count()
    }

    /// Prometheus text exposition, with the collector gauge read from the
    /// registry at call time.
    pub fn encode_metrics(&self) -> Result<String, TelemetryError> {
        refresh_collectors_active(self.client.registry());
        media_telemetry::encode_metrics()
    }

    /// Stop the router and wait for it to exit.
    pub async fn shutdown(self) -> Result<RouterExit, AccessError> {
        self.cancel.cancel();
        let exit = self
            .router
            .await
            .map_err(|e| AccessError::Internal(format!("router task failed: {}", e)))?;
        info!(exit = ?exit, "Media access service stopped");
        Ok(exit)
    }
}

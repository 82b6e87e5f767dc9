//! # Request Exchange
//!
//! Request/response calls on top of the asynchronous fan-out.
//!
//! Flow per call:
//! 1. Build a [`Collector`] around the caller's filter and register it
//! 2. Stamp the packet with the local identity and send it
//! 3. Wait for the first matching packet, the deadline, or cancellation
//! 4. Deregister (on every exit path, including a dropped future)
//! 5. Classify the matched packet by kind
//!
//! ```text
//! Idle ──register+send──► AwaitingReply ──┬──► Completed
//!                                         ├──► TimedOut
//!                                         └──► Cancelled
//! ```

use crate::collector::{CollectError, Collector};
use crate::connection::{Connection, ConnectionError};
use crate::filter::{CorrelationFilter, PacketFilter};
use crate::packet::{Packet, PacketKind, StanzaError};
use crate::registry::{CorrelationRegistry, RegistrationHandle, RegistryError};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Lifecycle of one exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExchangeState {
    Idle,
    AwaitingReply,
    Completed,
    TimedOut,
    Cancelled,
}

impl ExchangeState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::AwaitingReply => "awaiting_reply",
            Self::Completed => "completed",
            Self::TimedOut => "timed_out",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::TimedOut | Self::Cancelled)
    }
}

impl fmt::Display for ExchangeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Successful reply to an exchange.
#[derive(Debug, Clone)]
pub struct Reply {
    /// The matched packet (`Result` or `Event` kind).
    pub packet: Packet,
    /// Time from send to match.
    pub response_time: Duration,
}

impl Reply {
    pub fn payload(&self) -> &serde_json::Value {
        self.packet.payload()
    }

    pub fn into_payload(self) -> serde_json::Value {
        self.packet.into_payload()
    }
}

/// Exchange failures.
#[derive(Debug, Error)]
pub enum ExchangeError {
    /// The remote side answered with an error packet.
    #[error("remote error: {error}")]
    Remote { error: StanzaError, packet: Packet },

    /// No matching packet before the deadline.
    #[error("no response within {timeout:?}")]
    Timeout { timeout: Duration },

    /// The caller abandoned the wait.
    #[error("exchange cancelled")]
    Cancelled,

    /// The request could not be sent.
    #[error("send failed: {0}")]
    Send(#[from] ConnectionError),

    /// Registration was refused or deregistration found the registry
    /// inconsistent.
    #[error("registry: {0}")]
    Registry(#[from] RegistryError),

    /// The collector was closed underneath a live exchange.
    #[error("collector closed while awaiting reply")]
    CollectorClosed,
}

impl ExchangeError {
    /// Terminal state this failure leaves the exchange in.
    pub fn state(&self) -> ExchangeState {
        match self {
            Self::Remote { .. } => ExchangeState::Completed,
            Self::Timeout { .. } => ExchangeState::TimedOut,
            Self::Cancelled => ExchangeState::Cancelled,
            Self::Send(_) | Self::Registry(_) | Self::CollectorClosed => ExchangeState::Idle,
        }
    }

    /// The remote service could not be reached or did not answer in time.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. }
                | Self::Send(_)
                | Self::Registry(RegistryError::CapacityExceeded { .. })
        )
    }
}

/// Deregisters its collector when dropped.
struct RegistrationGuard<'a> {
    registry: &'a CorrelationRegistry,
    handle: Option<RegistrationHandle>,
}

impl<'a> RegistrationGuard<'a> {
    fn new(registry: &'a CorrelationRegistry, handle: RegistrationHandle) -> Self {
        Self {
            registry,
            handle: Some(handle),
        }
    }

    fn release(mut self) -> Result<(), RegistryError> {
        match self.handle.take() {
            Some(handle) => self.registry.unregister(&handle),
            None => Ok(()),
        }
    }
}

impl Drop for RegistrationGuard<'_> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            if let Err(e) = self.registry.unregister(&handle) {
                error!(error = %e, "Failed to deregister collector on early exit");
            }
        }
    }
}

/// Issues request/response exchanges over a shared connection.
pub struct ExchangeClient {
    registry: Arc<CorrelationRegistry>,
    connection: Arc<dyn Connection>,
    default_timeout: Duration,
}

impl ExchangeClient {
    pub fn new(
        registry: Arc<CorrelationRegistry>,
        connection: Arc<dyn Connection>,
        default_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            connection,
            default_timeout,
        }
    }

    /// Send `packet` and wait for the first inbound packet `filter` accepts.
    pub async fn call(
        &self,
        packet: Packet,
        filter: impl PacketFilter + 'static,
        timeout: Option<Duration>,
    ) -> Result<Reply, ExchangeError> {
        self.exchange(packet, Box::new(filter), timeout, None).await
    }

    /// Like [`ExchangeClient::call`], abandoning the wait when `cancel` fires.
    pub async fn call_cancellable(
        &self,
        packet: Packet,
        filter: impl PacketFilter + 'static,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<Reply, ExchangeError> {
        self.exchange(packet, Box::new(filter), timeout, Some(cancel))
            .await
    }

    /// Send `packet` and wait for its reply: same correlation id, sent by
    /// the packet's recipient, `Result` or `Error` kind.
    pub async fn query(
        &self,
        packet: Packet,
        timeout: Option<Duration>,
        cancel: Option<&CancellationToken>,
    ) -> Result<Reply, ExchangeError> {
        let filter = CorrelationFilter::reply_to(&packet);
        self.exchange(packet, Box::new(filter), timeout, cancel)
            .await
    }

    async fn exchange(
        &self,
        packet: Packet,
        filter: Box<dyn PacketFilter>,
        timeout: Option<Duration>,
        cancel: Option<&CancellationToken>,
    ) -> Result<Reply, ExchangeError> {
        let timeout = timeout.unwrap_or(self.default_timeout);
        let packet = packet.with_sender(self.connection.identity());
        let correlation_id = packet.correlation_id().clone();
        let mut state = ExchangeState::Idle;

        let mut collector = Collector::from_boxed(filter);
        let guard = RegistrationGuard::new(&self.registry, self.registry.register(&collector)?);

        if cancel.is_some_and(CancellationToken::is_cancelled) {
            debug!(correlation_id = %correlation_id, "Exchange cancelled before send");
            guard.release()?;
            return Err(ExchangeError::Cancelled);
        }

        // The deadline covers the send too: a backed-up connection counts
        // against the caller's timeout.
        let started = Instant::now();
        let deadline = started + timeout;

        debug!(
            correlation_id = %correlation_id,
            to = packet.recipient(),
            timeout_ms = timeout.as_millis() as u64,
            "Sending request"
        );
        let send = tokio::time::timeout_at(deadline, self.connection.send(packet));
        let sent = match cancel {
            Some(token) => tokio::select! {
                biased;
                _ = token.cancelled() => None,
                sent = send => Some(sent),
            },
            None => Some(send.await),
        };

        let outcome = match sent {
            None => Err(ExchangeError::Cancelled),
            Some(Err(_elapsed)) => Err(ExchangeError::Timeout { timeout }),
            Some(Ok(Err(e))) => Err(ExchangeError::Send(e)),
            Some(Ok(Ok(()))) => {
                state = ExchangeState::AwaitingReply;
                let waited = match cancel {
                    Some(token) => tokio::select! {
                        biased;
                        _ = token.cancelled() => None,
                        taken = collector.take_until(deadline) => Some(taken),
                    },
                    None => Some(collector.take_until(deadline).await),
                };
                match waited {
                    None => Err(ExchangeError::Cancelled),
                    Some(Ok(reply)) => classify(reply, started.elapsed()),
                    Some(Err(CollectError::Timeout { .. })) => {
                        Err(ExchangeError::Timeout { timeout })
                    }
                    Some(Err(CollectError::Closed | CollectError::AlreadyTaken)) => {
                        Err(ExchangeError::CollectorClosed)
                    }
                }
            }
        };
        guard.release()?;

        let awaited_reply = state == ExchangeState::AwaitingReply;
        state = match &outcome {
            Ok(_) => ExchangeState::Completed,
            Err(e) => e.state(),
        };

        match &outcome {
            Ok(reply) => debug!(
                correlation_id = %correlation_id,
                state = %state,
                response_time_ms = reply.response_time.as_millis() as u64,
                "Exchange completed"
            ),
            Err(ExchangeError::Timeout { .. }) => warn!(
                correlation_id = %correlation_id,
                state = %state,
                sent = awaited_reply,
                timeout_ms = timeout.as_millis() as u64,
                "Exchange timed out"
            ),
            Err(e) => debug!(
                correlation_id = %correlation_id,
                state = %state,
                sent = awaited_reply,
                error = %e,
                "Exchange failed"
            ),
        }

        outcome
    }

    /// Number of exchanges currently awaiting a reply.
    pub fn pending_count(&self) -> usize {
        self.registry.len()
    }

    pub fn registry(&self) -> &Arc<CorrelationRegistry> {
        &self.registry
    }

    pub fn identity(&self) -> &str {
        self.connection.identity()
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }
}

fn classify(packet: Packet, response_time: Duration) -> Result<Reply, ExchangeError> {
    match packet.kind() {
        PacketKind::Error => Err(ExchangeError::Remote {
            error: StanzaError::from_payload(packet.payload()),
            packet,
        }),
        _ => Ok(Reply {
            packet,
            response_time,
        }),
    }
}

//! # Stanza Bus - Request Correlation over a Shared Stanza Stream
//!
//! Turns one asynchronous, bidirectional stanza stream into many concurrent,
//! timeout-bounded request/response calls.
//!
//! ## Flow
//!
//! ```text
//!  caller ──► ExchangeClient::call ──register──► CorrelationRegistry
//!                  │                                   ▲
//!                  │ send                              │ deliver
//!                  ▼                                   │
//!            Connection ═══════ stanza stream ═══► InboundRouter
//!                                                      │
//!                                     unmatched ──► UnsolicitedHandler
//! ```
//!
//! - Each call owns a [`Collector`] holding its [`PacketFilter`]
//! - Every inbound packet is offered to the registered collectors that could
//!   match it; each keeps only its first match
//! - Every call deregisters its collector on completion, timeout,
//!   cancellation, or when its future is dropped
//! - No ordering is guaranteed between unrelated exchanges

// Nursery lints that are too strict
#![allow(clippy::missing_const_for_fn)]
// Allow in tests
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::panic))]

pub mod collector;
pub mod connection;
pub mod correlation;
pub mod exchange;
pub mod filter;
pub mod packet;
pub mod registry;
pub mod router;

// Re-export main types
pub use collector::{CollectError, Collector, CollectorId, Offer};
pub use connection::{ChannelConnection, Connection, ConnectionError};
pub use correlation::CorrelationId;
pub use exchange::{ExchangeClient, ExchangeError, ExchangeState, Reply};
pub use filter::{CorrelationFilter, PacketFilter};
pub use packet::{Packet, PacketKind, StanzaError};
pub use registry::{CorrelationRegistry, RegistrationHandle, RegistryError, RegistryStats};
pub use router::{DropUnsolicited, InboundRouter, RouterExit, UnsolicitedHandler};

/// Default bound on concurrently registered collectors.
pub const DEFAULT_MAX_COLLECTORS: usize = 10_000;

/// Default wait for a reply when the caller gives no timeout.
pub const DEFAULT_EXCHANGE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

//! # Media Access
//!
//! Access checks the media server's HTTP resources run before serving,
//! storing or deleting media. Each check is one correlated exchange with a
//! remote service over the shared stanza stream.
//!
//! | Check | Remote | Outcome |
//! |-------|--------|---------|
//! | [`AuthenticationCheck`] | auth service | allow / deny |
//! | [`ChannelVisibilityCheck`] | pub-sub server | public / not public |
//!
//! Failures surface as [`AccessError`], which carries the HTTP status the
//! resource should answer with.
//!
//! Server-initiated queries are answered by [`DiscoveryResponder`].

#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::panic))]

pub mod auth;
pub mod config;
pub mod discovery;
pub mod error;
pub mod metrics;
pub mod service;
pub mod visibility;

pub use auth::{AuthDecision, AuthenticationCheck};
pub use config::MediaServerConfig;
pub use discovery::DiscoveryResponder;
pub use error::{AccessError, ConfigError};
pub use service::MediaAccessService;
pub use visibility::ChannelVisibilityCheck;

//! Access and configuration errors.
//!
//! [`AccessError`] is what the HTTP layer sees. Each variant maps to exactly
//! one response status.

use stanza_bus::{ExchangeError, RegistryError, StanzaError};
use thiserror::Error;

/// HTTP status codes the access outcomes map to.
pub mod status {
    pub const UNAUTHORIZED: u16 = 401;
    pub const FORBIDDEN: u16 = 403;
    /// Non-standard "client closed request".
    pub const CLIENT_CLOSED_REQUEST: u16 = 499;
    pub const INTERNAL_SERVER_ERROR: u16 = 500;
    pub const SERVICE_UNAVAILABLE: u16 = 503;
}

/// Why an access check did not grant access.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AccessError {
    /// No credentials were presented.
    #[error("missing credentials")]
    Unauthenticated,

    /// The auth service answered and did not allow the access.
    #[error("access to {resource} denied")]
    Forbidden { resource: String },

    /// The remote service answered with an error packet.
    #[error("denied by remote service: {0}")]
    Denied(StanzaError),

    /// The remote service could not be reached or did not answer in time.
    #[error("service unavailable: {reason}")]
    ServiceUnavailable { reason: String },

    /// The caller abandoned the check.
    #[error("check cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl AccessError {
    /// HTTP status the resource handlers respond with.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Unauthenticated => status::UNAUTHORIZED,
            Self::Forbidden { .. } | Self::Denied(_) => status::FORBIDDEN,
            Self::ServiceUnavailable { .. } => status::SERVICE_UNAVAILABLE,
            Self::Cancelled => status::CLIENT_CLOSED_REQUEST,
            Self::Internal(_) => status::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether retrying later could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ServiceUnavailable { .. })
    }
}

impl From<ExchangeError> for AccessError {
    fn from(err: ExchangeError) -> Self {
        if err.is_unavailable() {
            return Self::ServiceUnavailable {
                reason: err.to_string(),
            };
        }
        match err {
            ExchangeError::Remote { error, .. } => Self::Denied(error),
            ExchangeError::Cancelled => Self::Cancelled,
            ExchangeError::Registry(RegistryError::UnknownHandle { collector_id }) => {
                Self::Internal(format!("registry lost {}", collector_id))
            }
            other => Self::Internal(other.to_string()),
        }
    }
}

/// Configuration errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{field} must not be empty")]
    EmptyIdentity { field: &'static str },

    #[error("exchange timeout must be greater than zero")]
    InvalidTimeout,

    #[error("max pending exchanges must be greater than zero")]
    InvalidMaxPending,

    #[error("invalid value {value:?} for {var}")]
    Parse { var: &'static str, value: String },
}

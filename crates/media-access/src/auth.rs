//! Credential verification against the remote auth service.
//!
//! Every media read, write and delete asks the auth service whether `user`,
//! presenting `credential`, may touch `resource`. The question goes out as a
//! `Get` packet and the answer comes back as a correlated `Result`.

use crate::error::AccessError;
use crate::metrics::record_exchange;
use serde_json::{json, Value};
use stanza_bus::{ExchangeClient, Packet};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Answer of the auth service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthDecision {
    Allowed,
    Denied,
}

impl AuthDecision {
    pub fn is_allowed(self) -> bool {
        self == Self::Allowed
    }

    /// Read `{"allowed": bool}`. Anything else is a deny.
    pub fn from_payload(payload: &Value) -> Self {
        match payload.get("allowed").and_then(Value::as_bool) {
            Some(true) => Self::Allowed,
            _ => Self::Denied,
        }
    }
}

/// Thin exchange wrapper asking the auth service about one access.
#[derive(Clone)]
pub struct AuthenticationCheck {
    client: Arc<ExchangeClient>,
    service: String,
}

impl AuthenticationCheck {
    pub fn new(client: Arc<ExchangeClient>, service: impl Into<String>) -> Self {
        Self {
            client,
            service: service.into(),
        }
    }

    /// Address the verification requests go to.
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Ask whether `user` may access `resource`.
    pub async fn verify(
        &self,
        user: &str,
        credential: &str,
        resource: &str,
    ) -> Result<AuthDecision, AccessError> {
        self.check(user, credential, resource, None).await
    }

    /// Like [`AuthenticationCheck::verify`], giving up when `cancel` fires.
    pub async fn verify_cancellable(
        &self,
        user: &str,
        credential: &str,
        resource: &str,
        cancel: &CancellationToken,
    ) -> Result<AuthDecision, AccessError> {
        self.check(user, credential, resource, Some(cancel)).await
    }

    /// Verify and turn a deny into [`AccessError::Forbidden`].
    pub async fn require(
        &self,
        user: &str,
        credential: &str,
        resource: &str,
    ) -> Result<(), AccessError> {
        match self.verify(user, credential, resource).await? {
            AuthDecision::Allowed => Ok(()),
            AuthDecision::Denied => Err(AccessError::Forbidden {
                resource: resource.to_string(),
            }),
        }
    }

    async fn check(
        &self,
        user: &str,
        credential: &str,
        resource: &str,
        cancel: Option<&CancellationToken>,
    ) -> Result<AuthDecision, AccessError> {
        if user.is_empty() || credential.is_empty() {
            debug!(resource, "Rejecting request without credentials");
            return Err(AccessError::Unauthenticated);
        }

        let request = Packet::request(
            self.service.as_str(),
            json!({
                "query": "auth",
                "user": user,
                "credential": credential,
                "resource": resource,
            }),
        );

        let outcome = self.client.query(request, None, cancel).await;
        record_exchange("auth", &self.client, &outcome);

        let decision = AuthDecision::from_payload(outcome?.payload());
        info!(user, resource, allowed = decision.is_allowed(), "Auth check");
        Ok(decision)
    }
}

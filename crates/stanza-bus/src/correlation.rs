//! Correlation identifiers for matching replies to outstanding requests.
//!
//! Generated ids are UUID v7 (time-ordered). Ids arriving from the wire are
//! kept verbatim, whatever their shape.

use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;
use uuid::Uuid;

/// Caller-chosen identifier carried by every packet of an exchange.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Generate a fresh id for a new outbound request.
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    /// Wrap an id received from the wire.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Millisecond timestamp embedded in a generated (v7) id.
    ///
    /// Returns `None` for ids that were not produced by [`CorrelationId::generate`].
    pub fn timestamp_ms(&self) -> Option<u64> {
        let uuid = Uuid::parse_str(&self.0).ok()?;
        let bytes = uuid.as_bytes();
        if (bytes[6] >> 4) != 7 {
            return None;
        }
        let ts = bytes[..6]
            .iter()
            .fold(0u64, |acc, b| (acc << 8) | u64::from(*b));
        Some(ts)
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::generate()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CorrelationId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for CorrelationId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl AsRef<str> for CorrelationId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for CorrelationId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_are_unique() {
        let id1 = CorrelationId::generate();
        let id2 = CorrelationId::generate();
        assert_ne!(id1, id2);
        assert_eq!(id1.as_str().len(), 36);
    }

    #[test]
    fn test_wire_ids_kept_verbatim() {
        let id = CorrelationId::from("abc");
        assert_eq!(id.as_str(), "abc");
        assert_eq!(id.to_string(), "abc");
        assert!(id.timestamp_ms().is_none());
    }

    #[test]
    fn test_serializes_as_plain_string() {
        let id = CorrelationId::from("xyz-1");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"xyz-1\"");
        let parsed: CorrelationId = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_timestamp_extraction() {
        let id = CorrelationId::generate();
        let ts = id.timestamp_ms().expect("v7 id carries a timestamp");
        let now_ms = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_millis() as u64;
        assert!((ts as i64 - now_ms as i64).abs() < 1000);
    }
}

//! Opaque identity types: `public_id` and `owner` secret.
//!
//! Both are random 128-bit values rendered as hex-dashed strings on the
//! wire — exactly the textual form a UUID v4 already takes, so we use
//! [`uuid::Uuid`] as the underlying representation rather than rolling a
//! bespoke hex encoder.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// A session's public, attach-facing identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PublicId(Uuid);

/// A session's owner secret, required to attach to an existing
/// `PublicId`. Never logged or echoed except to the transport that
/// presents the matching value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Owner(Uuid);

impl PublicId {
    /// Mint a fresh, random public id.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse a public id from its hex-dashed wire representation.
    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Uuid::parse_str(s).map(Self)
    }
}

impl Owner {
    /// Mint a fresh, random owner secret.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse an owner secret from its hex-dashed wire representation.
    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Uuid::parse_str(s).map(Self)
    }
}

impl fmt::Display for PublicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_are_unique() {
        let a = PublicId::generate();
        let b = PublicId::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn test_roundtrip_through_wire_representation() {
        let id = PublicId::generate();
        let rendered = id.to_string();
        let parsed = PublicId::parse(&rendered).expect("valid uuid string");
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(PublicId::parse("not-a-uuid").is_err());
        assert!(Owner::parse("").is_err());
    }

    #[test]
    fn test_public_id_and_owner_are_independent_types() {
        // Same underlying random value space, but not interchangeable at
        // the type level — attach() cannot accidentally compare one
        // against the other.
        let id = PublicId::generate();
        let owner = Owner::generate();
        assert_ne!(id.to_string(), owner.to_string());
    }
}

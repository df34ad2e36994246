//! Opaque correlation identifiers.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque 128-bit identifier used as socket id, link id, and stream id.
///
/// Generated values are never reused within a process lifetime. The all-zero
/// value is reserved as [`Reference::NULL`] — "no target assigned yet".
#[derive(
    Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Reference(Uuid);

impl Reference {
    /// The reserved all-zero reference.
    pub const NULL: Reference = Reference(Uuid::nil());

    /// Generate a fresh unique reference.
    pub fn generate() -> Self {
        Reference(Uuid::new_v4())
    }

    pub fn is_null(&self) -> bool {
        self.0.is_nil()
    }

    /// Big-endian byte form for the binary codec.
    pub fn to_bytes(self) -> [u8; 16] {
        *self.0.as_bytes()
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Reference(Uuid::from_bytes(bytes))
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form: first group only, enough to correlate in logs.
        let s = self.0.to_string();
        write!(f, "ref:{}", &s[..8])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_references_are_unique() {
        let a = Reference::generate();
        let b = Reference::generate();
        assert_ne!(a, b);
        assert!(!a.is_null());
    }

    #[test]
    fn null_is_null() {
        assert!(Reference::NULL.is_null());
        assert_eq!(Reference::NULL.to_bytes(), [0u8; 16]);
    }

    #[test]
    fn byte_roundtrip() {
        let r = Reference::generate();
        assert_eq!(Reference::from_bytes(r.to_bytes()), r);
    }

    #[test]
    fn debug_is_short() {
        let r = Reference::generate();
        let dbg = format!("{r:?}");
        assert!(dbg.starts_with("ref:"));
        assert_eq!(dbg.len(), "ref:".len() + 8);
    }
}

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// File identifiers are opaque strings chosen by the uploading client.
pub type FileId = String;

/// Identifier of one connected participant, unique within the relay process.
///
/// Canonical ids are 8 lowercase hex characters. Every canonical id has the
/// same length and alphabet, so the derived byte-wise `Ord` is also a numeric
/// order. That order decides who sends the first offer between two peers.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub const LEN: usize = 8;

    /// Generate a fresh canonical id from a v4 UUID.
    pub fn generate() -> Self {
        let simple = Uuid::new_v4().simple().to_string();
        Self(simple[..Self::LEN].to_string())
    }

    /// Wrap an id received over the wire. No validation is applied.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn is_canonical(&self) -> bool {
        self.0.len() == Self::LEN
            && self
                .0
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
    }

    /// Whether this side sends the offer when it becomes visible to `other`.
    /// Exactly one of `a.initiates_with(b)` and `b.initiates_with(a)` holds
    /// for distinct ids.
    pub fn initiates_with(&self, other: &PeerId) -> bool {
        self < other
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_canonical() {
        for _ in 0..64 {
            let id = PeerId::generate();
            assert!(id.is_canonical(), "{} is not canonical", id);
        }
    }

    #[test]
    fn exactly_one_side_initiates() {
        let a = PeerId::new("a1");
        let b = PeerId::new("b2");
        assert!(a.initiates_with(&b));
        assert!(!b.initiates_with(&a));

        let x = PeerId::new("0000ffff");
        let y = PeerId::new("00010000");
        assert_ne!(x.initiates_with(&y), y.initiates_with(&x));
    }

    #[test]
    fn serializes_as_plain_string() {
        let id = PeerId::new("deadbeef");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"deadbeef\"");
    }
}

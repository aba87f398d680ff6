use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable identifier for a tree node.
///
/// The wire format is 32 lowercase hexadecimal characters with no hyphens.
/// Identifiers are minted by the editor agent; the daemon only generates its
/// own when synthesizing nodes for a push snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(String);

impl InstanceId {
    /// Generates a fresh identifier from a random 128-bit source.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the identifier matches the canonical 32-hex wire format.
    ///
    /// Malformed ids are still stored and round-tripped — the editor owns the
    /// id space — but callers can use this to log suspicious input.
    pub fn is_well_formed(&self) -> bool {
        self.0.len() == 32
            && self
                .0
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for InstanceId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for InstanceId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_canonical() {
        let id = InstanceId::generate();
        assert!(id.is_well_formed(), "not canonical: {id}");
        assert_eq!(id.as_str().len(), 32);
    }

    #[test]
    fn generated_ids_are_unique() {
        let a = InstanceId::generate();
        let b = InstanceId::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn uppercase_and_hyphenated_ids_are_not_canonical() {
        assert!(!InstanceId::from("ABCDEF00112233445566778899AABBCC").is_well_formed());
        assert!(!InstanceId::from("0c3ac4a0-9e1c-4f3a-8f52-4b2f7a1d9e00").is_well_formed());
        assert!(InstanceId::from("0c3ac4a09e1c4f3a8f524b2f7a1d9e00").is_well_formed());
    }

    #[test]
    fn serializes_as_a_bare_string() {
        let id = InstanceId::from("0c3ac4a09e1c4f3a8f524b2f7a1d9e00");
        let json = serde_json::to_string(&id).expect("serialize");
        assert_eq!(json, "\"0c3ac4a09e1c4f3a8f524b2f7a1d9e00\"");
    }
}

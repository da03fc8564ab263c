//! Peer identity: normalized key for the peer store.

use std::fmt;

/// Transport-level name of a peer whose identity could not be resolved.
pub const UNKNOWN_PEER: &str = "unknown";

/// Normalized peer identity. Trimmed and ASCII-lowercased so the same peer
/// reported with different casing maps to one record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(raw: &str) -> Self {
        PeerId(raw.trim().to_ascii_lowercase())
    }

    pub fn unknown() -> Self {
        PeerId(UNKNOWN_PEER.to_owned())
    }

    /// Empty names and the transport's "unknown" sentinel.
    pub fn is_unknown(&self) -> bool {
        self.0.is_empty() || self.0 == UNKNOWN_PEER
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(raw: &str) -> Self {
        PeerId::new(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_case_and_whitespace() {
        assert_eq!(PeerId::new("  Alice-Realm "), PeerId::new("alice-realm"));
        assert_eq!(PeerId::new("Bob").as_str(), "bob");
    }

    #[test]
    fn unknown_sentinel() {
        assert!(PeerId::unknown().is_unknown());
        assert!(PeerId::new("Unknown").is_unknown());
        assert!(PeerId::new("   ").is_unknown());
        assert!(!PeerId::new("carol").is_unknown());
    }
}

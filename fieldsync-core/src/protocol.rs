//! Field sync wire protocol: field codes, command types and version.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::hash::ContentHash;

/// Current protocol version. Advertised in the `VP` field.
pub const PROTOCOL_VERSION: u8 = 1;

/// Separates command tokens inside a payload.
pub const SEPARATOR: char = '\u{1}';
/// Escapes a separator (or another escape) inside field content.
pub const ESCAPE: char = '\u{1b}';
/// Separates hash from content in an answer token.
pub const CONTENT_DELIMITER: char = ':';
pub const REQUEST_PREFIX: char = '?';
pub const HASH_ACK_PREFIX: char = '!';

/// Two-letter field identifier (ASCII uppercase).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FieldCode([u8; 2]);

impl FieldCode {
    /// Summary bundle field.
    pub const BUNDLE: FieldCode = FieldCode(*b"TT");
    /// Protocol version field.
    pub const VERSION: FieldCode = FieldCode(*b"VP");

    pub fn parse(s: &str) -> Option<Self> {
        let bytes: [u8; 2] = s.as_bytes().try_into().ok()?;
        Self::from_bytes(bytes)
    }

    pub fn from_bytes(bytes: [u8; 2]) -> Option<Self> {
        if bytes.iter().all(|b| b.is_ascii_uppercase()) {
            Some(FieldCode(bytes))
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.0).unwrap_or_default()
    }
}

impl fmt::Display for FieldCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transport trust classification for a physical message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelClass {
    /// Content received here may be treated as authentic.
    Trusted,
    /// Cheap path; answers carrying content are not accepted from it.
    BestEffort,
}

/// One protocol command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Ask for a field. `hash` is the copy already held; `None` forces a full answer.
    Request {
        code: FieldCode,
        hash: Option<ContentHash>,
    },
    /// Full push. `hash: None` with empty content means the field is absent.
    Answer {
        code: FieldCode,
        hash: Option<ContentHash>,
        content: String,
    },
    /// "My copy's hash is this": no-change reply or weak pre-check.
    HashAck { code: FieldCode, hash: ContentHash },
}

impl Command {
    pub fn code(&self) -> FieldCode {
        match self {
            Command::Request { code, .. }
            | Command::Answer { code, .. }
            | Command::HashAck { code, .. } => *code,
        }
    }

    /// Whether delivering this command requires the trusted channel.
    pub fn carries_content(&self) -> bool {
        matches!(self, Command::Answer { content, .. } if !content.is_empty())
    }
}

/// Token grammar revision used to decode a peer's commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WireVersion {
    #[default]
    V1,
}

impl WireVersion {
    /// Pick the grammar for a peer from its declared `VP` content.
    /// V1 is the only grammar, so newer and unparsable declarations alike are read with it.
    pub fn negotiate(_declared: &str) -> Self {
        WireVersion::V1
    }

    pub fn number(&self) -> u8 {
        match self {
            WireVersion::V1 => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_code_parse() {
        assert_eq!(FieldCode::parse("NA").map(|c| c.to_string()), Some("NA".into()));
        assert!(FieldCode::parse("na").is_none());
        assert!(FieldCode::parse("N").is_none());
        assert!(FieldCode::parse("NAM").is_none());
        assert!(FieldCode::parse("N1").is_none());
        assert_eq!(FieldCode::BUNDLE.as_str(), "TT");
    }

    #[test]
    fn carries_content() {
        let code = FieldCode::parse("NA").unwrap();
        assert!(Command::Answer {
            code,
            hash: None,
            content: "Alice".into()
        }
        .carries_content());
        assert!(!Command::Answer {
            code,
            hash: None,
            content: String::new()
        }
        .carries_content());
        assert!(!Command::Request { code, hash: None }.carries_content());
    }

    #[test]
    fn version_negotiation() {
        assert_eq!(WireVersion::negotiate("1"), WireVersion::V1);
        assert_eq!(WireVersion::negotiate("7"), WireVersion::V1);
        assert_eq!(WireVersion::negotiate("junk"), WireVersion::V1);
        assert_eq!(WireVersion::V1.number(), PROTOCOL_VERSION);
    }
}

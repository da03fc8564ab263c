//! Command codec: single commands to and from compact text tokens,
//! plus separator-aware payload splitting.

use crate::hash::ContentHash;
use crate::protocol::{
    Command, FieldCode, WireVersion, CONTENT_DELIMITER, ESCAPE, HASH_ACK_PREFIX, REQUEST_PREFIX,
    SEPARATOR,
};

const MAX_HASH_DIGITS: usize = 8;

/// Encode one command into its token. Hash zero/absent is omitted.
pub fn encode_command(cmd: &Command) -> String {
    let mut out = String::new();
    match cmd {
        Command::Request { code, hash } => {
            out.push(REQUEST_PREFIX);
            out.push_str(code.as_str());
            push_hash(&mut out, *hash);
        }
        Command::HashAck { code, hash } => {
            out.push(HASH_ACK_PREFIX);
            out.push_str(code.as_str());
            push_hash(&mut out, Some(*hash));
        }
        Command::Answer {
            code,
            hash,
            content,
        } => {
            out.push_str(code.as_str());
            push_hash(&mut out, *hash);
            if !content.is_empty() {
                out.push(CONTENT_DELIMITER);
                out.push_str(content);
            }
        }
    }
    out
}

fn push_hash(out: &mut String, hash: Option<ContentHash>) {
    if let Some(h) = hash {
        out.push_str(&h.to_string());
    }
}

/// Decode one token with the grammar of the given wire version.
pub fn decode_command(token: &str, version: WireVersion) -> Result<Command, DecodeError> {
    match version {
        WireVersion::V1 => decode_v1(token),
    }
}

enum Action {
    Request,
    HashAck,
    Answer,
}

fn decode_v1(token: &str) -> Result<Command, DecodeError> {
    let (action, rest) = if let Some(rest) = token.strip_prefix(REQUEST_PREFIX) {
        (Action::Request, rest)
    } else if let Some(rest) = token.strip_prefix(HASH_ACK_PREFIX) {
        (Action::HashAck, rest)
    } else {
        (Action::Answer, token)
    };
    let code_str = rest.get(..2).ok_or(DecodeError::TooShort)?;
    let code = FieldCode::parse(code_str).ok_or(DecodeError::BadCode)?;
    let tail = &rest[2..];
    let (digits, content) = match tail.find(CONTENT_DELIMITER) {
        Some(i) => (&tail[..i], Some(&tail[i + CONTENT_DELIMITER.len_utf8()..])),
        None => (tail, None),
    };
    let hash = parse_hash(digits)?;
    match action {
        Action::Request => {
            if content.is_some() {
                return Err(DecodeError::UnexpectedContent);
            }
            Ok(Command::Request { code, hash })
        }
        Action::HashAck => {
            if content.is_some() {
                return Err(DecodeError::UnexpectedContent);
            }
            let hash = hash.ok_or(DecodeError::MissingHash)?;
            Ok(Command::HashAck { code, hash })
        }
        Action::Answer => Ok(Command::Answer {
            code,
            hash,
            content: content.unwrap_or_default().to_owned(),
        }),
    }
}

fn parse_hash(digits: &str) -> Result<Option<ContentHash>, DecodeError> {
    if digits.is_empty() {
        return Ok(None);
    }
    if digits.len() > MAX_HASH_DIGITS || !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(DecodeError::BadHash);
    }
    let value = u32::from_str_radix(digits, 16).map_err(|_| DecodeError::BadHash)?;
    Ok(ContentHash::new(value))
}

/// Error decoding a token. Callers drop the token; siblings are still processed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("token too short")]
    TooShort,
    #[error("invalid field code")]
    BadCode,
    #[error("invalid hash")]
    BadHash,
    #[error("hash ack without hash")]
    MissingHash,
    #[error("unexpected content")]
    UnexpectedContent,
}

/// Join tokens into one payload.
pub fn join_tokens<S: AsRef<str>>(tokens: &[S]) -> String {
    let mut out = String::new();
    for (i, t) in tokens.iter().enumerate() {
        if i > 0 {
            out.push(SEPARATOR);
        }
        out.push_str(t.as_ref());
    }
    out
}

/// Split a payload into tokens on unescaped separators. Empty tokens are skipped.
pub fn split_tokens(payload: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0;
    let mut escaped = false;
    for (i, c) in payload.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        if c == ESCAPE {
            escaped = true;
        } else if c == SEPARATOR {
            if i > start {
                out.push(&payload[start..i]);
            }
            start = i + c.len_utf8();
        }
    }
    if start < payload.len() {
        out.push(&payload[start..]);
    }
    out
}

/// Length of the prefix of `buf` that ends with its last unescaped separator (0 if none).
/// Everything in that prefix is a sequence of complete tokens.
pub fn terminated_prefix_len(buf: &[u8]) -> usize {
    let sep = SEPARATOR as u8;
    let esc = ESCAPE as u8;
    let mut end = 0;
    let mut escaped = false;
    for (i, &b) in buf.iter().enumerate() {
        if escaped {
            escaped = false;
            continue;
        }
        if b == esc {
            escaped = true;
        } else if b == sep {
            end = i + 1;
        }
    }
    end
}

/// Check that field content can be carried inside one token.
pub fn validate_content(code: FieldCode, content: &str) -> Result<(), FieldContentError> {
    let mut escaped = false;
    for c in content.chars() {
        if escaped {
            escaped = false;
            continue;
        }
        if c == ESCAPE {
            escaped = true;
        } else if c == SEPARATOR {
            return Err(FieldContentError::RawSeparator { code });
        }
    }
    if escaped {
        return Err(FieldContentError::TrailingEscape { code });
    }
    Ok(())
}

/// Escape separators (and escapes) so arbitrary text can be stored in a field.
pub fn escape_content(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if c == SEPARATOR || c == ESCAPE {
            out.push(ESCAPE);
        }
        out.push(c);
    }
    out
}

/// Inverse of [`escape_content`].
pub fn unescape_content(escaped: &str) -> String {
    let mut out = String::with_capacity(escaped.len());
    let mut chars = escaped.chars();
    while let Some(c) = chars.next() {
        if c == ESCAPE {
            if let Some(next) = chars.next() {
                out.push(next);
                continue;
            }
        }
        out.push(c);
    }
    out
}

/// Local field content that would corrupt the token stream.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FieldContentError {
    #[error("field {code}: content contains a raw separator")]
    RawSeparator { code: FieldCode },
    #[error("field {code}: content ends with an unpaired escape")]
    TrailingEscape { code: FieldCode },
}

//! Content hasher: compact change-detection value derived from field content.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Default number of memoized contents before the cache is reset.
pub const DEFAULT_HASH_CACHE_CAPACITY: usize = 256;

/// Non-zero 32-bit content hash. Zero is reserved for "absent" on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContentHash(u32);

impl ContentHash {
    /// Hash of explicitly empty content. Never produced for non-empty content.
    pub const EMPTY: ContentHash = ContentHash(u32::MAX);

    /// Wrap a raw value. Zero maps to `None` (absent).
    pub fn new(value: u32) -> Option<Self> {
        if value == 0 {
            None
        } else {
            Some(ContentHash(value))
        }
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }

    pub fn is_empty_sentinel(&self) -> bool {
        *self == Self::EMPTY
    }
}

/// Uppercase hex, no leading zeros.
impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}", self.0)
    }
}

/// Hash field content. Empty content yields [`ContentHash::EMPTY`].
pub fn hash_content(content: &str) -> ContentHash {
    if content.is_empty() {
        return ContentHash::EMPTY;
    }
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    let digest = hasher.finalize();
    let value = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    match value {
        // Zero and the empty sentinel are reserved.
        0 | u32::MAX => ContentHash(1),
        v => ContentHash(v),
    }
}

/// Memoizing hasher. The same strings are hashed on every commit and answer.
pub struct ContentHasher {
    cache: HashMap<String, ContentHash>,
    capacity: usize,
}

impl ContentHasher {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_HASH_CACHE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            cache: HashMap::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn hash(&mut self, content: &str) -> ContentHash {
        if let Some(h) = self.cache.get(content) {
            return *h;
        }
        let h = hash_content(content);
        if self.cache.len() >= self.capacity {
            self.cache.clear();
        }
        self.cache.insert(content.to_owned(), h);
        h
    }

    pub fn cached_len(&self) -> usize {
        self.cache.len()
    }
}

impl Default for ContentHasher {
    fn default() -> Self {
        Self::new()
    }
}

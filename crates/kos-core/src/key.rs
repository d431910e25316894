use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;

/// Default prefix length kept in a cache key.
pub const DEFAULT_KEY_MAX_CHARS: usize = 500;

/// Normalized lookup key for embedding caches.
///
/// Built by trimming, lower-casing and truncating to `max_chars` characters.
/// Two texts that only differ after the truncation point share a key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey(String);

impl CacheKey {
    /// Returns `None` for text that is empty after trimming.
    pub fn normalize(text: &str, max_chars: usize) -> Option<Self> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return None;
        }

        let lowered = trimmed.to_lowercase();
        let mut key: String = lowered.chars().take(max_chars.max(1)).collect();
        // Truncation can expose trailing whitespace; trim again so the
        // result is a fixed point of normalization.
        let end = key.trim_end().len();
        key.truncate(end);

        if key.is_empty() {
            None
        } else {
            Some(Self(key))
        }
    }

    pub fn with_default_len(text: &str) -> Option<Self> {
        Self::normalize(text, DEFAULT_KEY_MAX_CHARS)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for CacheKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

//! Keyset pagination over `(timestamp, id)` ordered feeds.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Utc};

/// Represents a cursor with primary and secondary parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cursor {
    pub primary: DateTime<Utc>,
    pub secondary: String,
}

impl Cursor {
    pub fn new(primary: DateTime<Utc>, secondary: impl Into<String>) -> Self {
        Self {
            primary,
            secondary: secondary.into(),
        }
    }

    /// Encode `<rfc3339>::<id>` as unpadded URL-safe base64.
    pub fn pack(&self) -> String {
        URL_SAFE_NO_PAD.encode(format!("{}::{}", self.primary.to_rfc3339(), self.secondary))
    }

    /// Decode a packed cursor. Malformed input yields `None`.
    pub fn unpack(cursor: &str) -> Option<Self> {
        let raw = URL_SAFE_NO_PAD.decode(cursor.trim()).ok()?;
        let raw = String::from_utf8(raw).ok()?;
        let (primary, secondary) = raw.split_once("::")?;
        let primary = DateTime::parse_from_rfc3339(primary).ok()?.with_timezone(&Utc);
        if secondary.is_empty() {
            return None;
        }

        Some(Self::new(primary, secondary))
    }
}

/// Clamp a caller-provided page size.
pub fn limit(requested: Option<i64>) -> i64 {
    requested.unwrap_or(20).clamp(1, 100)
}

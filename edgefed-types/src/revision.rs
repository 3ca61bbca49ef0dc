//! Weak revision tags (ETags) for conditional reads.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque revision marker returned by upstream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RevisionTag(String);

impl RevisionTag {
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    /// Parses an `ETag` header value, accepting both strong and weak forms.
    ///
    /// Returns `None` for an empty tag.
    pub fn from_header(value: &str) -> Option<Self> {
        let value = value.trim();
        let value = value.strip_prefix("W/").unwrap_or(value);
        let value = value.trim_matches('"');
        if value.is_empty() {
            None
        } else {
            Some(Self(value.to_string()))
        }
    }

    /// Formats the tag for an `If-None-Match` header.
    #[must_use]
    pub fn to_header(&self) -> String {
        format!("W/\"{}\"", self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RevisionTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

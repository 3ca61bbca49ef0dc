//! Realm settings and interface versions.

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Interface version this node speaks.
pub const LOCAL_INTERFACE_VERSION: &str = "3.0";

/// Settings established by joining a realm.
///
/// Written once by the join protocol and read-only afterwards.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RealmSettings {
    /// Realm base address (e.g. `https://hub.example.org`).
    pub realm: String,
    /// Local device name registered upstream.
    pub device_name: String,
    /// Local device secret.
    pub device_secret: String,
    /// Application (client) name.
    pub application_name: String,
    /// Application (client) secret.
    pub application_secret: String,
    /// When the join completed.
    pub joined_at: DateTime<Utc>,
}

impl fmt::Debug for RealmSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RealmSettings")
            .field("realm", &self.realm)
            .field("device_name", &self.device_name)
            .field("application_name", &self.application_name)
            .field("joined_at", &self.joined_at)
            .finish_non_exhaustive()
    }
}

/// A `major.minor` interface version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InterfaceVersion {
    pub major: u32,
    pub minor: u32,
}

impl InterfaceVersion {
    /// The version this node speaks.
    pub fn local() -> Self {
        // LOCAL_INTERFACE_VERSION is a well-formed constant.
        Self::from_str(LOCAL_INTERFACE_VERSION).unwrap_or(Self { major: 3, minor: 0 })
    }

    /// Whether a remote at this version can serve a node at `local`.
    ///
    /// Only the major component is compared.
    pub fn is_compatible_with(&self, local: &InterfaceVersion) -> bool {
        self.major >= local.major
    }
}

impl FromStr for InterfaceVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.trim().split('.');
        let major = parts
            .next()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| Error::InvalidVersion(s.to_string()))?
            .parse()
            .map_err(|_| Error::InvalidVersion(s.to_string()))?;
        let minor = match parts.next() {
            Some(p) => p.parse().map_err(|_| Error::InvalidVersion(s.to_string()))?,
            None => 0,
        };
        Ok(Self { major, minor })
    }
}

impl fmt::Display for InterfaceVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

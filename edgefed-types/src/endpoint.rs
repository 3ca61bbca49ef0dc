//! Endpoint descriptors for upstream services.
//!
//! A descriptor is immutable once built. Updating one (for example to bind a
//! freshly issued client certificate) produces a new descriptor; the endpoint
//! table is always replaced as a whole.

use crate::principal::CertificateRef;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Default accepted content type.
pub const DEFAULT_CONTENT_TYPE: &str = "application/json";

/// Default per-call timeout for data requests.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Logical upstream service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ServiceEndpointType {
    /// Administrative interface (devices, certificates, security).
    Administration,
    /// Clinical and business data.
    HealthData,
    /// Token issuance.
    Authentication,
    /// Asynchronous messaging.
    Messaging,
}

impl ServiceEndpointType {
    /// All known service types.
    pub const ALL: [ServiceEndpointType; 4] = [
        Self::Administration,
        Self::HealthData,
        Self::Authentication,
        Self::Messaging,
    ];

    /// Path segment used under a realm's base address.
    #[must_use]
    pub fn default_path(&self) -> &'static str {
        match self {
            Self::Administration => "ami",
            Self::HealthData => "hdsi",
            Self::Authentication => "auth",
            Self::Messaging => "msg",
        }
    }
}

impl fmt::Display for ServiceEndpointType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Administration => "administration",
            Self::HealthData => "health-data",
            Self::Authentication => "authentication",
            Self::Messaging => "messaging",
        };
        f.write_str(s)
    }
}

/// How a transport authenticates against an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SecurityScheme {
    #[default]
    None,
    Basic,
    Bearer,
    ClientCertificate,
}

/// Describes how to reach one upstream service.
///
/// Deserialization applies the same checks as [`EndpointDescriptor::new`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "RawEndpointDescriptor")]
pub struct EndpointDescriptor {
    service: ServiceEndpointType,
    base_urls: Vec<String>,
    #[serde(default)]
    security: SecurityScheme,
    #[serde(default)]
    compression: bool,
    accept: String,
    timeout_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    client_certificate: Option<CertificateRef>,
}

/// Wire form of [`EndpointDescriptor`], validated on conversion.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEndpointDescriptor {
    service: ServiceEndpointType,
    base_urls: Vec<String>,
    #[serde(default)]
    security: SecurityScheme,
    #[serde(default)]
    compression: bool,
    #[serde(default = "default_accept")]
    accept: String,
    #[serde(default = "default_timeout_ms")]
    timeout_ms: u64,
    #[serde(default)]
    client_certificate: Option<CertificateRef>,
}

fn default_accept() -> String {
    DEFAULT_CONTENT_TYPE.to_string()
}

fn default_timeout_ms() -> u64 {
    DEFAULT_REQUEST_TIMEOUT.as_millis() as u64
}

impl TryFrom<RawEndpointDescriptor> for EndpointDescriptor {
    type Error = Error;

    fn try_from(raw: RawEndpointDescriptor) -> Result<Self> {
        let descriptor = Self::new(raw.service, raw.base_urls, raw.security)?;
        Ok(Self {
            compression: raw.compression,
            accept: raw.accept,
            timeout_ms: raw.timeout_ms,
            client_certificate: raw.client_certificate,
            ..descriptor
        })
    }
}

impl EndpointDescriptor {
    /// Creates a descriptor with default content type and timeout.
    ///
    /// Fails when no base address is given or an address is not http(s).
    pub fn new(
        service: ServiceEndpointType,
        base_urls: Vec<String>,
        security: SecurityScheme,
    ) -> Result<Self> {
        if base_urls.is_empty() {
            return Err(Error::InvalidEndpoint(format!(
                "{service} endpoint has no base address"
            )));
        }
        if let Some(bad) = base_urls.iter().find(|u| !is_http_url(u)) {
            return Err(Error::InvalidEndpoint(format!(
                "{service} endpoint address is not http(s): {bad}"
            )));
        }

        Ok(Self {
            service,
            base_urls: base_urls
                .into_iter()
                .map(|u| u.trim_end_matches('/').to_string())
                .collect(),
            security,
            compression: false,
            accept: default_accept(),
            timeout_ms: default_timeout_ms(),
            client_certificate: None,
        })
    }

    /// Returns a copy with compression toggled.
    #[must_use]
    pub fn with_compression(&self, compression: bool) -> Self {
        Self {
            compression,
            ..self.clone()
        }
    }

    /// Returns a copy with a different per-call timeout.
    #[must_use]
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        Self {
            timeout_ms: timeout.as_millis() as u64,
            ..self.clone()
        }
    }

    /// Returns a copy with a different accepted content type.
    #[must_use]
    pub fn with_accept(&self, accept: impl Into<String>) -> Self {
        Self {
            accept: accept.into(),
            ..self.clone()
        }
    }

    /// Returns a copy bound to the given client certificate.
    #[must_use]
    pub fn with_client_certificate(&self, certificate: CertificateRef) -> Self {
        Self {
            client_certificate: Some(certificate),
            ..self.clone()
        }
    }

    pub fn service(&self) -> ServiceEndpointType {
        self.service
    }

    pub fn base_urls(&self) -> &[String] {
        &self.base_urls
    }

    /// The address used for requests.
    pub fn primary_url(&self) -> &str {
        &self.base_urls[0]
    }

    pub fn security(&self) -> SecurityScheme {
        self.security
    }

    pub fn compression(&self) -> bool {
        self.compression
    }

    pub fn accept(&self) -> &str {
        &self.accept
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn client_certificate(&self) -> Option<&CertificateRef> {
        self.client_certificate.as_ref()
    }

    /// Whether the endpoint requires mutual TLS.
    pub fn requires_client_certificate(&self) -> bool {
        self.security == SecurityScheme::ClientCertificate
    }
}

fn is_http_url(url: &str) -> bool {
    let lower = url.to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

/// The full set of endpoint descriptors known to a node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EndpointTable(BTreeMap<ServiceEndpointType, EndpointDescriptor>);

impl EndpointTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a table from descriptors; a later descriptor for the same
    /// service wins.
    pub fn from_descriptors(descriptors: impl IntoIterator<Item = EndpointDescriptor>) -> Self {
        Self(descriptors.into_iter().map(|d| (d.service(), d)).collect())
    }

    pub fn get(&self, service: ServiceEndpointType) -> Option<&EndpointDescriptor> {
        self.0.get(&service)
    }

    pub fn iter(&self) -> impl Iterator<Item = &EndpointDescriptor> {
        self.0.values()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns a new table where every descriptor that requires a client
    /// certificate is bound to `certificate`.
    #[must_use]
    pub fn bind_client_certificate(&self, certificate: &CertificateRef) -> Self {
        Self::from_descriptors(self.iter().map(|d| {
            if d.requires_client_certificate() {
                d.with_client_certificate(certificate.clone())
            } else {
                d.clone()
            }
        }))
    }
}

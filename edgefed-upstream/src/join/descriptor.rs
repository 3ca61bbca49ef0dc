//! The realm's self-description and the endpoint table derived from it.

use crate::error::ClientResult;
use edgefed_types::{EndpointDescriptor, EndpointTable, SecurityScheme, ServiceEndpointType};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// Response to `OPTIONS {realm}/ami/`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceOptions {
    pub interface_version: String,
    /// Activity id of the upstream server instance.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<Uuid>,
    #[serde(default)]
    pub endpoints: Vec<ServiceCapability>,
}

/// One advertised service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceCapability {
    pub service_type: ServiceEndpointType,
    #[serde(default)]
    pub base_url: Vec<String>,
    #[serde(default)]
    pub capabilities: Vec<Capability>,
    #[serde(default)]
    pub compression: bool,
}

/// Security capability flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Capability {
    CertificateAuth,
    BearerAuth,
    BasicAuth,
    #[serde(other)]
    Other,
}

impl ServiceCapability {
    /// Strongest advertised scheme.
    pub fn security(&self) -> SecurityScheme {
        let has = |c: Capability| self.capabilities.contains(&c);
        if has(Capability::CertificateAuth) {
            SecurityScheme::ClientCertificate
        } else if has(Capability::BearerAuth) {
            SecurityScheme::Bearer
        } else if has(Capability::BasicAuth) {
            SecurityScheme::Basic
        } else {
            SecurityScheme::None
        }
    }
}

/// Builds one descriptor per capability that has an http(s) address.
///
/// Non-http addresses are dropped; a capability left with none is skipped.
pub fn derive_endpoints(options: &ServiceOptions, timeout: Duration) -> ClientResult<EndpointTable> {
    let mut descriptors = Vec::new();
    for capability in &options.endpoints {
        let urls: Vec<String> = capability
            .base_url
            .iter()
            .filter(|u| {
                let lower = u.to_ascii_lowercase();
                lower.starts_with("http://") || lower.starts_with("https://")
            })
            .cloned()
            .collect();
        if urls.is_empty() {
            warn!(
                "Skipping {} endpoint without an http(s) address",
                capability.service_type
            );
            continue;
        }

        let descriptor = EndpointDescriptor::new(capability.service_type, urls, capability.security())?
            .with_compression(capability.compression)
            .with_timeout(timeout);
        debug!(
            "Derived {} endpoint {} ({:?})",
            descriptor.service(),
            descriptor.primary_url(),
            descriptor.security()
        );
        descriptors.push(descriptor);
    }
    Ok(EndpointTable::from_descriptors(descriptors))
}

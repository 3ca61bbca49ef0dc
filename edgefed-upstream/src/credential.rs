//! Client certificates and the store they are installed into.

use crate::config::write_json_atomic;
use crate::error::{ClientError, ClientResult};
use chrono::{DateTime, Utc};
use edgefed_types::CertificateRef;
use parking_lot::RwLock;
use pem::{EncodeConfig, LineEnding, Pem};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::info;

/// An X.509 client certificate, optionally merged with its private key.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientCertificate {
    pub subject: String,
    pub certificate_pem: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key_pem: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_after: Option<DateTime<Utc>>,
}

impl fmt::Debug for ClientCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientCertificate")
            .field("subject", &self.subject)
            .field("has_private_key", &self.private_key_pem.is_some())
            .field("not_after", &self.not_after)
            .finish()
    }
}

impl ClientCertificate {
    /// Thumbprint: hex SHA-256 of the DER certificate.
    pub fn thumbprint(&self) -> ClientResult<CertificateRef> {
        let der = pem_to_der(&self.certificate_pem)?;
        Ok(CertificateRef::new(hex::encode(Sha256::digest(&der))))
    }

    pub fn has_private_key(&self) -> bool {
        self.private_key_pem.is_some()
    }

    /// Usable for mutual TLS right now: key present and not expired.
    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        self.has_private_key() && self.not_after.is_none_or(|exp| exp > now)
    }

    /// Key and certificate concatenated, as accepted by a TLS identity loader.
    pub fn identity_pem(&self) -> ClientResult<Vec<u8>> {
        let key = self.private_key_pem.as_ref().ok_or_else(|| {
            ClientError::Configuration(format!("certificate {} has no private key", self.subject))
        })?;
        let mut pem = Vec::with_capacity(key.len() + self.certificate_pem.len() + 1);
        pem.extend_from_slice(key.as_bytes());
        if !key.ends_with('\n') {
            pem.push(b'\n');
        }
        pem.extend_from_slice(self.certificate_pem.as_bytes());
        Ok(pem)
    }
}

const CERTIFICATE_TAG: &str = "CERTIFICATE";

/// Decodes a PEM certificate to DER.
pub(crate) fn pem_to_der(encoded: &str) -> ClientResult<Vec<u8>> {
    let block = pem::parse(encoded)
        .map_err(|e| ClientError::Enrollment(format!("certificate is not PEM encoded: {e}")))?;
    if block.tag() != CERTIFICATE_TAG {
        return Err(ClientError::Enrollment(format!(
            "expected a {CERTIFICATE_TAG} PEM block, found {}",
            block.tag()
        )));
    }
    Ok(block.into_contents())
}

/// Wraps DER bytes as a PEM certificate.
pub(crate) fn der_to_pem(der: &[u8]) -> String {
    let config = EncodeConfig::new().set_line_ending(LineEnding::LF);
    pem::encode_config(&Pem::new(CERTIFICATE_TAG, der), config)
}

/// Where client certificates are installed.
pub trait CredentialStore: Send + Sync {
    /// Finds the newest certificate for a subject.
    fn find_by_subject(&self, subject: &str) -> Option<ClientCertificate>;

    /// Looks a certificate up by thumbprint.
    fn get(&self, reference: &CertificateRef) -> Option<ClientCertificate>;

    /// Installs a certificate, returning its reference.
    fn install(&self, certificate: ClientCertificate) -> ClientResult<CertificateRef>;
}

/// Credential store held in memory.
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    certificates: RwLock<HashMap<CertificateRef, ClientCertificate>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.certificates.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.certificates.read().is_empty()
    }
}

fn newest_for_subject<'a>(
    certs: impl Iterator<Item = &'a ClientCertificate>,
    subject: &str,
) -> Option<ClientCertificate> {
    certs
        .filter(|c| c.subject == subject)
        .max_by_key(|c| c.not_after)
        .cloned()
}

impl CredentialStore for MemoryCredentialStore {
    fn find_by_subject(&self, subject: &str) -> Option<ClientCertificate> {
        newest_for_subject(self.certificates.read().values(), subject)
    }

    fn get(&self, reference: &CertificateRef) -> Option<ClientCertificate> {
        self.certificates.read().get(reference).cloned()
    }

    fn install(&self, certificate: ClientCertificate) -> ClientResult<CertificateRef> {
        let reference = certificate.thumbprint()?;
        self.certificates.write().insert(reference.clone(), certificate);
        Ok(reference)
    }
}

/// Credential store persisted as a JSON file.
#[derive(Debug)]
pub struct JsonCredentialStore {
    path: PathBuf,
    certificates: RwLock<HashMap<CertificateRef, ClientCertificate>>,
}

impl JsonCredentialStore {
    /// Opens the store at `path`, starting empty when the file is missing.
    pub fn open(path: impl AsRef<Path>) -> ClientResult<Self> {
        let path = path.as_ref().to_path_buf();
        let certificates = if path.exists() {
            serde_json::from_str(&std::fs::read_to_string(&path)?)?
        } else {
            HashMap::new()
        };
        Ok(Self {
            path,
            certificates: RwLock::new(certificates),
        })
    }
}

impl CredentialStore for JsonCredentialStore {
    fn find_by_subject(&self, subject: &str) -> Option<ClientCertificate> {
        newest_for_subject(self.certificates.read().values(), subject)
    }

    fn get(&self, reference: &CertificateRef) -> Option<ClientCertificate> {
        self.certificates.read().get(reference).cloned()
    }

    fn install(&self, certificate: ClientCertificate) -> ClientResult<CertificateRef> {
        let reference = certificate.thumbprint()?;
        let mut guard = self.certificates.write();
        let mut next = guard.clone();
        next.insert(reference.clone(), certificate);
        write_json_atomic(&self.path, &next)?;
        *guard = next;
        info!("Installed client certificate {}", reference);
        Ok(reference)
    }
}

//! Client certificate enrollment for mutual-TLS realms.

use crate::credential::{der_to_pem, pem_to_der, ClientCertificate};
use crate::error::{ClientError, ClientResult};
use crate::transport::Transport;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, Utc};
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info};

/// Path the signing request is posted to, under the administration endpoint.
pub const CSR_PATH: &str = "Certificate/Csr";

/// Upstream's verdict on a signing request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SubmissionStatus {
    Issued,
    Pending,
    Rejected,
}

/// Response to a signing request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionResult {
    pub status: SubmissionStatus,
    /// Issued certificate, PEM or base64 DER.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CsrSubmission<'a> {
    subject: &'a str,
    csr: &'a str,
}

/// A fresh key pair and the signing request made from it.
pub struct EnrollmentRequest {
    subject: String,
    private_key_pem: String,
    public_key: Vec<u8>,
    csr_pem: String,
}

impl fmt::Debug for EnrollmentRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnrollmentRequest")
            .field("subject", &self.subject)
            .finish_non_exhaustive()
    }
}

impl EnrollmentRequest {
    /// Generates a key pair and a CSR with `subject` as common name.
    pub fn generate(subject: &str) -> ClientResult<Self> {
        let key_pair = KeyPair::generate()?;
        let mut params = CertificateParams::new(vec![subject.to_string()])?;
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, subject);
        params.distinguished_name = dn;
        let csr = params.serialize_request(&key_pair)?;

        Ok(Self {
            subject: subject.to_string(),
            private_key_pem: key_pair.serialize_pem(),
            public_key: key_pair.public_key_raw().to_vec(),
            csr_pem: csr.pem()?,
        })
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn csr_pem(&self) -> &str {
        &self.csr_pem
    }

    /// Submits the CSR and merges the issued certificate with the key.
    ///
    /// Anything other than an immediate `Issued` is an enrollment failure.
    pub async fn submit(self, admin: &Transport) -> ClientResult<ClientCertificate> {
        debug!("Submitting certificate request for {}", self.subject);
        let body = CsrSubmission {
            subject: &self.subject,
            csr: &self.csr_pem,
        };
        let result: SubmissionResult = admin.post(CSR_PATH, &body).await?.value;

        let detail = result.message.clone().unwrap_or_default();
        let encoded = match result.status {
            SubmissionStatus::Issued => result.certificate.ok_or_else(|| {
                ClientError::Enrollment("certificate issued without certificate bytes".into())
            })?,
            SubmissionStatus::Pending => {
                return Err(ClientError::Enrollment(format!(
                    "request for {} is pending approval {}",
                    self.subject, detail
                )));
            }
            SubmissionStatus::Rejected => {
                return Err(ClientError::Enrollment(format!(
                    "request for {} was rejected {}",
                    self.subject, detail
                )));
            }
        };

        let der = if encoded.trim_start().starts_with("-----BEGIN") {
            pem_to_der(&encoded)?
        } else {
            BASE64
                .decode(encoded.trim())
                .map_err(|e| ClientError::Enrollment(format!("issued certificate is not base64: {e}")))?
        };
        let not_after = self.check_issued(&der, Utc::now())?;

        info!("Certificate issued for {} until {}", self.subject, not_after);
        Ok(ClientCertificate {
            subject: self.subject,
            certificate_pem: der_to_pem(&der),
            private_key_pem: Some(self.private_key_pem),
            not_after: Some(not_after),
        })
    }

    /// Verifies an issued certificate belongs to this key and is still valid,
    /// returning its expiry.
    fn check_issued(&self, der: &[u8], now: DateTime<Utc>) -> ClientResult<DateTime<Utc>> {
        let (_, issued) = x509_parser::parse_x509_certificate(der)
            .map_err(|e| ClientError::Enrollment(format!("issued certificate is not X.509: {e}")))?;

        if *issued.public_key().subject_public_key.data != *self.public_key {
            return Err(ClientError::Enrollment(format!(
                "certificate issued for {} does not match the submitted key",
                self.subject
            )));
        }

        let expiry = issued.validity().not_after.timestamp();
        let not_after = DateTime::from_timestamp(expiry, 0).ok_or_else(|| {
            ClientError::Enrollment(format!("certificate expiry {expiry} is out of range"))
        })?;
        if not_after <= now {
            return Err(ClientError::Enrollment(format!(
                "certificate issued for {} expired at {}",
                self.subject, not_after
            )));
        }
        Ok(not_after)
    }
}

//! Authenticated HTTP channels to upstream services.
//!
//! A [`Transport`] is bound to one endpoint and one principal. It is built per
//! call by the [`TransportFactory`] and dropped when the call returns. It is not `Clone`.

mod auth;
mod factory;

pub use auth::{DeviceAuthenticator, DeviceSession, OAuthDeviceAuthenticator, DEVICE_AUTH_HEADER};
pub use factory::TransportFactory;

use crate::error::{ClientError, ClientResult};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use edgefed_types::{
    CertificateRef, EndpointDescriptor, Principal, RevisionTag, ServiceEndpointType,
};
use reqwest::header::{ACCEPT, ETAG, IF_NONE_MATCH};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::debug;

/// Timeout for availability probes. Data calls use the descriptor timeout.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Credential presented on each request.
#[derive(Clone, PartialEq, Eq)]
pub(crate) enum Credential {
    None,
    Basic { username: String, password: String },
    Device { username: String, password: String },
    Bearer(String),
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Basic { username, .. } => write!(f, "Basic({username})"),
            Self::Device { username, .. } => write!(f, "Device({username})"),
            Self::Bearer(_) => f.write_str("Bearer(***)"),
        }
    }
}

pub(crate) fn basic_value(username: &str, password: &str) -> String {
    format!("basic {}", BASE64.encode(format!("{username}:{password}")))
}

/// A value fetched from upstream with its revision tag.
#[derive(Debug, Clone)]
pub struct Fetched<T> {
    pub value: T,
    pub revision: Option<RevisionTag>,
}

/// Outcome of a conditional read.
#[derive(Debug, Clone)]
pub enum Conditional<T> {
    /// Upstream sent a fresher representation.
    Modified(Fetched<T>),
    /// The cached revision is still current.
    NotModified,
}

/// An authenticated channel to one upstream service.
#[derive(Debug)]
pub struct Transport {
    client: Client,
    service: ServiceEndpointType,
    descriptor: Option<EndpointDescriptor>,
    principal: Principal,
    credential: Credential,
    client_certificate: Option<CertificateRef>,
}

impl Transport {
    pub(crate) fn new(
        client: Client,
        service: ServiceEndpointType,
        descriptor: Option<EndpointDescriptor>,
        principal: Principal,
        credential: Credential,
        client_certificate: Option<CertificateRef>,
    ) -> Self {
        Self {
            client,
            service,
            descriptor,
            principal,
            credential,
            client_certificate,
        }
    }

    /// Thumbprint of the certificate presented for mutual TLS, if any.
    pub fn client_certificate(&self) -> Option<&CertificateRef> {
        self.client_certificate.as_ref()
    }

    /// Whether an endpoint is configured for this transport's service.
    pub fn is_configured(&self) -> bool {
        self.descriptor.is_some()
    }

    pub fn service(&self) -> ServiceEndpointType {
        self.service
    }

    /// The principal this transport acts as.
    pub fn principal(&self) -> &Principal {
        &self.principal
    }

    pub fn descriptor(&self) -> Option<&EndpointDescriptor> {
        self.descriptor.as_ref()
    }

    fn endpoint(&self) -> ClientResult<&EndpointDescriptor> {
        self.descriptor.as_ref().ok_or_else(|| {
            ClientError::Configuration(format!("no {} endpoint configured", self.service))
        })
    }

    /// Absolute URL for a resource path.
    pub fn url(&self, path: &str) -> ClientResult<String> {
        let base = self.endpoint()?.primary_url();
        let path = path.trim_start_matches('/');
        Ok(if path.is_empty() {
            format!("{base}/")
        } else {
            format!("{base}/{path}")
        })
    }

    /// Starts a request with credentials, accept header and timeout applied.
    pub(crate) fn request(&self, method: Method, path: &str) -> ClientResult<RequestBuilder> {
        let endpoint = self.endpoint()?;
        let url = self.url(path)?;
        debug!("{} {} as {}", method, url, self.principal);

        let builder = self
            .client
            .request(method, url)
            .header(ACCEPT, endpoint.accept())
            .timeout(endpoint.timeout());

        Ok(match &self.credential {
            Credential::None => builder,
            Credential::Basic { username, password } => {
                builder.basic_auth(username, Some(password))
            }
            Credential::Device { username, password } => {
                builder.header(DEVICE_AUTH_HEADER, basic_value(username, password))
            }
            Credential::Bearer(token) => builder.bearer_auth(token),
        })
    }

    /// Sends a request, mapping 404 to `NotFound` and other failures to `Status`.
    pub(crate) async fn send(&self, builder: RequestBuilder, path: &str) -> ClientResult<Response> {
        let response = builder.send().await?;
        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_MODIFIED {
            return Ok(response);
        }
        if status == StatusCode::NOT_FOUND {
            return Err(ClientError::NotFound(path.to_string()));
        }
        let body = response.text().await.unwrap_or_default();
        Err(ClientError::Status {
            status: status.as_u16(),
            body,
        })
    }

    async fn read<T: DeserializeOwned>(response: Response) -> ClientResult<Fetched<T>> {
        let revision = revision_of(&response);
        let bytes = response.bytes().await?;
        let value = serde_json::from_slice(&bytes)?;
        Ok(Fetched { value, revision })
    }

    /// GET a resource.
    pub async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(String, String)],
    ) -> ClientResult<Fetched<T>> {
        let builder = self.request(Method::GET, path)?.query(query);
        let response = self.send(builder, path).await?;
        Self::read(response).await
    }

    /// GET a resource unless it still matches `revision`.
    pub async fn get_conditional<T: DeserializeOwned>(
        &self,
        path: &str,
        revision: &RevisionTag,
    ) -> ClientResult<Conditional<T>> {
        let builder = self
            .request(Method::GET, path)?
            .header(IF_NONE_MATCH, revision.to_header());
        let response = self.send(builder, path).await?;
        if response.status() == StatusCode::NOT_MODIFIED {
            return Ok(Conditional::NotModified);
        }
        Ok(Conditional::Modified(Self::read(response).await?))
    }

    /// POST a body and read the created representation.
    pub async fn post<B, T>(&self, path: &str, body: &B) -> ClientResult<Fetched<T>>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let builder = self.request(Method::POST, path)?.json(body);
        let response = self.send(builder, path).await?;
        Self::read(response).await
    }

    /// PUT a body and read the stored representation.
    pub async fn put<B, T>(&self, path: &str, body: &B) -> ClientResult<Fetched<T>>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let builder = self.request(Method::PUT, path)?.json(body);
        let response = self.send(builder, path).await?;
        Self::read(response).await
    }

    /// DELETE a resource, returning the deleted representation if upstream sent one.
    pub async fn delete<T: DeserializeOwned>(&self, path: &str) -> ClientResult<Option<T>> {
        let builder = self.request(Method::DELETE, path)?;
        let response = self.send(builder, path).await?;
        let bytes = response.bytes().await?;
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    /// OPTIONS against the service root.
    pub async fn options<T: DeserializeOwned>(&self, path: &str) -> ClientResult<T> {
        let builder = self.request(Method::OPTIONS, path)?;
        let response = self.send(builder, path).await?;
        Ok(Self::read(response).await?.value)
    }

    /// HEAD a resource, returning only the status.
    pub async fn head(&self, path: &str) -> ClientResult<u16> {
        let builder = self.request(Method::HEAD, path)?;
        let response = builder.send().await?;
        Ok(response.status().as_u16())
    }

    /// Takes an edit lock on a resource.
    pub async fn checkout(&self, path: &str) -> ClientResult<()> {
        self.lock_verb("CHECKOUT", path).await
    }

    /// Releases an edit lock on a resource.
    pub async fn checkin(&self, path: &str) -> ClientResult<()> {
        self.lock_verb("CHECKIN", path).await
    }

    async fn lock_verb(&self, verb: &str, path: &str) -> ClientResult<()> {
        let method = custom_method(verb)?;
        let builder = self.request(method, path)?;
        match self.send(builder, path).await {
            Ok(_) => Ok(()),
            Err(ClientError::Status { status, body }) if status == 409 || status == 423 => {
                Err(ClientError::ObjectLocked {
                    key: path.to_string(),
                    owner: Some(body).filter(|b| !b.trim().is_empty()),
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Sends a PING with the probe timeout and returns the round-trip time.
    pub async fn ping(&self) -> ClientResult<Duration> {
        let method = custom_method("PING")?;
        let builder = self.request(method, "")?.timeout(PROBE_TIMEOUT);
        let started = Instant::now();
        self.send(builder, "").await?;
        Ok(started.elapsed())
    }
}

fn custom_method(verb: &str) -> ClientResult<Method> {
    Method::from_bytes(verb.as_bytes())
        .map_err(|e| ClientError::InvalidState(format!("invalid HTTP verb {verb}: {e}")))
}

fn revision_of(response: &Response) -> Option<RevisionTag> {
    response
        .headers()
        .get(ETAG)
        .and_then(|v| v.to_str().ok())
        .and_then(RevisionTag::from_header)
}

//! Builds transports bound to the right identity for each call.

use super::{Credential, DeviceAuthenticator, DeviceSession, Transport};
use crate::config::ConfigurationStore;
use crate::context::AuthContext;
use crate::credential::{ClientCertificate, CredentialStore};
use crate::error::ClientResult;
use edgefed_types::{
    CertificateRef, EndpointDescriptor, Identity, Principal, PrincipalSecret, ServiceEndpointType,
};
use parking_lot::Mutex;
use reqwest::{Client, Identity as TlsIdentity};
use std::sync::Arc;
use tracing::{debug, warn};

/// Creates per-call [`Transport`]s.
///
/// Principal resolution, in order:
/// 1. an explicit, non-anonymous acting principal;
/// 2. when the ambient principal is the system principal and a device
///    authenticator is available, a device session for the joined realm;
/// 3. the ambient principal.
///
/// An unconfigured realm never makes this fail; the returned transport
/// reports `is_configured() == false` and errors on use.
pub struct TransportFactory {
    config: Arc<dyn ConfigurationStore>,
    credentials: Arc<dyn CredentialStore>,
    authenticator: Option<Arc<dyn DeviceAuthenticator>>,
    device_session: Mutex<Option<DeviceSession>>,
}

impl TransportFactory {
    pub fn new(config: Arc<dyn ConfigurationStore>, credentials: Arc<dyn CredentialStore>) -> Self {
        Self {
            config,
            credentials,
            authenticator: None,
            device_session: Mutex::new(None),
        }
    }

    /// Enables authenticating as the device for system-context calls.
    #[must_use]
    pub fn with_authenticator(mut self, authenticator: Arc<dyn DeviceAuthenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    pub fn config(&self) -> &Arc<dyn ConfigurationStore> {
        &self.config
    }

    pub fn credentials(&self) -> &Arc<dyn CredentialStore> {
        &self.credentials
    }

    /// Whether the realm is joined and an endpoint exists for `service`.
    pub fn is_configured(&self, service: ServiceEndpointType) -> bool {
        self.config.is_configured() && self.config.endpoint(service).is_some()
    }

    /// Returns a transport for `service` acting as the resolved principal.
    pub async fn transport(
        &self,
        service: ServiceEndpointType,
        acting: Option<&Principal>,
    ) -> ClientResult<Transport> {
        let principal = self.resolve_principal(acting).await?;
        let descriptor = self.config.endpoint(service);
        let identity = self.tls_identity(descriptor.as_ref(), &principal);
        self.build(service, descriptor, principal, identity)
    }

    /// Returns a transport for an explicit descriptor, bypassing the
    /// configured endpoint table. Used while joining, before anything is
    /// committed.
    pub fn for_descriptor(
        &self,
        descriptor: &EndpointDescriptor,
        principal: Principal,
    ) -> ClientResult<Transport> {
        let identity = self.tls_identity(Some(descriptor), &principal);
        self.build(descriptor.service(), Some(descriptor.clone()), principal, identity)
    }

    /// Like [`for_descriptor`](Self::for_descriptor), presenting `certificate`
    /// for mutual TLS even though it is not installed yet.
    pub fn for_descriptor_with_certificate(
        &self,
        descriptor: &EndpointDescriptor,
        principal: Principal,
        certificate: &ClientCertificate,
    ) -> ClientResult<Transport> {
        let identity = (
            certificate.thumbprint()?,
            TlsIdentity::from_pem(&certificate.identity_pem()?)?,
        );
        self.build(descriptor.service(), Some(descriptor.clone()), principal, Some(identity))
    }

    /// Drops any cached device session.
    pub fn reset_session(&self) {
        *self.device_session.lock() = None;
    }

    async fn resolve_principal(&self, acting: Option<&Principal>) -> ClientResult<Principal> {
        if let Some(principal) = acting.filter(|p| !p.is_anonymous()) {
            return Ok(principal.clone());
        }

        let ambient = AuthContext::current();
        if ambient.is_system() {
            if let Some(device) = self.device_principal().await? {
                return Ok(device);
            }
        }
        Ok(ambient)
    }

    /// Authenticates as the device, reusing an unexpired session.
    async fn device_principal(&self) -> ClientResult<Option<Principal>> {
        let Some(authenticator) = self.authenticator.as_ref() else {
            return Ok(None);
        };
        let Some(settings) = self.config.realm() else {
            return Ok(None);
        };
        let Some(auth_endpoint) = self.config.endpoint(ServiceEndpointType::Authentication) else {
            return Ok(None);
        };

        let cached = self
            .device_session
            .lock()
            .as_ref()
            .filter(|s| !s.is_expired() && s.principal.name() == settings.device_name)
            .map(|s| s.principal.clone());
        if cached.is_some() {
            return Ok(cached);
        }

        let application = Principal::Application(Identity::with_secret(
            settings.application_name.clone(),
            settings.application_secret.clone(),
        ));
        let auth = self.for_descriptor(&auth_endpoint, application)?;
        let session = authenticator.authenticate(&settings, &auth).await?;
        debug!("Device session established for {}", settings.device_name);

        let principal = session.principal.clone();
        *self.device_session.lock() = Some(session);
        Ok(Some(principal))
    }

    fn build(
        &self,
        service: ServiceEndpointType,
        descriptor: Option<EndpointDescriptor>,
        principal: Principal,
        identity: Option<(CertificateRef, TlsIdentity)>,
    ) -> ClientResult<Transport> {
        let mut builder = Client::builder()
            .gzip(descriptor.as_ref().is_some_and(EndpointDescriptor::compression));

        let client_certificate = match identity {
            Some((reference, identity)) => {
                builder = builder.identity(identity);
                Some(reference)
            }
            None => None,
        };

        let credential = bind_credential(&principal);
        Ok(Transport::new(
            builder.build()?,
            service,
            descriptor,
            principal,
            credential,
            client_certificate,
        ))
    }

    /// Installed client certificate for mutual TLS, from the principal or
    /// the endpoint.
    fn tls_identity(
        &self,
        descriptor: Option<&EndpointDescriptor>,
        principal: &Principal,
    ) -> Option<(CertificateRef, TlsIdentity)> {
        let reference = match principal.secret() {
            PrincipalSecret::Certificate(reference) => Some(reference),
            _ => descriptor
                .filter(|d| d.requires_client_certificate())
                .and_then(EndpointDescriptor::client_certificate),
        }?;

        let Some(certificate) = self.credentials.get(reference) else {
            warn!("Client certificate {} is not installed", reference);
            return None;
        };
        let pem = match certificate.identity_pem() {
            Ok(pem) => pem,
            Err(e) => {
                warn!("Client certificate {} unusable: {}", reference, e);
                return None;
            }
        };
        match TlsIdentity::from_pem(&pem) {
            Ok(identity) => Some((reference.clone(), identity)),
            Err(e) => {
                warn!("Failed to load client certificate {}: {}", reference, e);
                None
            }
        }
    }
}

/// Maps a principal to the credential presented on each request.
fn bind_credential(principal: &Principal) -> Credential {
    match principal {
        Principal::Device(id) => match &id.secret {
            PrincipalSecret::SharedSecret(secret) => Credential::Device {
                username: id.name.clone(),
                password: secret.clone(),
            },
            PrincipalSecret::Session(token) => Credential::Bearer(token.clone()),
            PrincipalSecret::Certificate(_) | PrincipalSecret::None => Credential::None,
        },
        Principal::Application(id) | Principal::User(id) => match &id.secret {
            PrincipalSecret::SharedSecret(secret) => Credential::Basic {
                username: id.name.clone(),
                password: secret.clone(),
            },
            PrincipalSecret::Session(token) => Credential::Bearer(token.clone()),
            PrincipalSecret::Certificate(_) | PrincipalSecret::None => Credential::None,
        },
        Principal::System(id) => match &id.secret {
            PrincipalSecret::Session(token) => Credential::Bearer(token.clone()),
            _ => Credential::None,
        },
    }
}

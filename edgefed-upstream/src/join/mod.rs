//! Joining this node to an upstream realm.
//!
//! # Protocol
//!
//! ```text
//! Node                                      Realm
//!   |-- OPTIONS {realm}/ami/ ------------------>|
//!   |<-- interface version, server id, endpoints|
//!   |   (version gate, self-join check)         |
//!   |-- GET SecurityDevice?name= -------------->|
//!   |-- POST/PUT SecurityDevice --------------->|
//!   |-- POST Certificate/Csr (mTLS realms) ---->|
//!   |-- GET/POST/PUT DeviceEntity ------------->|
//!   |   (commit realm settings + endpoints)     |
//! ```
//!
//! Every result is collected into a draft first. Configuration is written
//! in one step, and only after every remote call has succeeded; a failed
//! join leaves the node exactly as it was.

mod descriptor;
mod enrollment;

pub use descriptor::{derive_endpoints, Capability, ServiceCapability, ServiceOptions};
pub use enrollment::{EnrollmentRequest, SubmissionResult, SubmissionStatus, CSR_PATH};

use crate::config::FederationConfig;
use crate::credential::ClientCertificate;
use crate::error::{ClientError, ClientResult};
use crate::model::{Bundle, DeviceEntity, Resource, SecurityDevice};
use crate::transport::{Transport, TransportFactory};
use chrono::Utc;
use edgefed_types::{
    DeviceInfo, EndpointDescriptor, EndpointTable, InterfaceVersion, Principal, RealmSettings,
    SecurityScheme, ServiceEndpointType,
};
use parking_lot::RwLock;
use rand::RngCore;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};
use uuid::Uuid;

/// Where this node stands with respect to a realm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinState {
    Unjoined,
    Joined,
    Failed,
}

/// Realm lifecycle notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RealmEvent {
    /// The realm descriptor was accepted; registration is starting.
    Changing { realm: String },
    /// Settings and endpoints were committed.
    Changed { realm: String },
    /// The join failed; nothing was committed.
    JoinFailed { realm: String, reason: String },
    /// Realm settings were cleared.
    Left { realm: String },
}

/// Parameters of a join.
#[derive(Debug, Clone)]
pub struct JoinRequest {
    /// Realm base address, e.g. `https://hub.example.org`.
    pub realm: String,
    /// Realm administrator the node registers itself as.
    pub principal: Principal,
    /// Replace an existing registration and skip the version gate.
    pub replace: bool,
}

impl JoinRequest {
    pub fn new(realm: impl Into<String>, principal: Principal) -> Self {
        Self {
            realm: realm.into(),
            principal,
            replace: false,
        }
    }

    #[must_use]
    pub fn replacing(mut self) -> Self {
        self.replace = true;
        self
    }
}

/// Everything a successful join writes.
struct JoinDraft {
    settings: RealmSettings,
    endpoints: EndpointTable,
    certificate: Option<ClientCertificate>,
}

/// Runs the join handshake and owns the realm lifecycle.
pub struct RealmJoin {
    factory: Arc<TransportFactory>,
    config: FederationConfig,
    events: broadcast::Sender<RealmEvent>,
    state: RwLock<JoinState>,
}

impl RealmJoin {
    pub fn new(factory: Arc<TransportFactory>, config: FederationConfig) -> Self {
        let (events, _) = broadcast::channel(16);
        let state = if factory.config().is_configured() {
            JoinState::Joined
        } else {
            JoinState::Unjoined
        };
        Self {
            factory,
            config,
            events,
            state: RwLock::new(state),
        }
    }

    pub fn state(&self) -> JoinState {
        *self.state.read()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RealmEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: RealmEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Joins the realm described by `request`.
    ///
    /// Fails with `InvalidState` if a realm is already joined. Failures of
    /// the remote steps are returned as `Integration` errors whose
    /// [`cause`](ClientError::cause) is the specific error.
    pub async fn join(&self, request: JoinRequest) -> ClientResult<RealmSettings> {
        if let Some(current) = self.factory.config().realm() {
            return Err(ClientError::InvalidState(format!(
                "already joined to {}",
                current.realm
            )));
        }

        let realm = request.realm.trim_end_matches('/').to_string();
        info!("Joining realm {}", realm);

        let draft = match self.negotiate(&realm, &request).await {
            Ok(draft) => draft,
            Err(e) => {
                let error = ClientError::integration(format!("joining {realm} failed"), e);
                return Err(self.fail(&realm, error));
            }
        };

        match self.commit(draft) {
            Ok(settings) => {
                *self.state.write() = JoinState::Joined;
                self.emit(RealmEvent::Changed {
                    realm: realm.clone(),
                });
                info!("Joined realm {} as {}", realm, settings.device_name);
                Ok(settings)
            }
            Err(e) => Err(self.fail(&realm, e)),
        }
    }

    fn fail(&self, realm: &str, error: ClientError) -> ClientError {
        warn!("Join of {} failed: {}", realm, error);
        *self.state.write() = JoinState::Failed;
        self.emit(RealmEvent::JoinFailed {
            realm: realm.to_string(),
            reason: error.to_string(),
        });
        error
    }

    /// Clears realm settings and endpoints.
    pub fn leave(&self) -> ClientResult<()> {
        let Some(current) = self.factory.config().realm() else {
            return Err(ClientError::InvalidState("not joined to a realm".into()));
        };
        self.factory.config().clear_realm()?;
        self.factory.reset_session();
        *self.state.write() = JoinState::Unjoined;
        info!("Left realm {}", current.realm);
        self.emit(RealmEvent::Left {
            realm: current.realm,
        });
        Ok(())
    }

    async fn negotiate(&self, realm: &str, request: &JoinRequest) -> ClientResult<JoinDraft> {
        let timeout = self.config.request_timeout();

        let bootstrap = EndpointDescriptor::new(
            ServiceEndpointType::Administration,
            vec![format!(
                "{realm}/{}",
                ServiceEndpointType::Administration.default_path()
            )],
            SecurityScheme::None,
        )?
        .with_timeout(timeout);
        let options: ServiceOptions = self
            .factory
            .for_descriptor(&bootstrap, request.principal.clone())?
            .options("")
            .await?;

        let remote: InterfaceVersion = options.interface_version.parse()?;
        let local = InterfaceVersion::local();
        if !request.replace && !remote.is_compatible_with(&local) {
            return Err(ClientError::VersionIncompatibility {
                remote: remote.to_string(),
                local: local.to_string(),
            });
        }

        let own_id = self.config.activity_id.as_uuid();
        if options.server_id == Some(own_id) {
            return Err(ClientError::SelfJoinRejected(own_id));
        }

        let mut endpoints = derive_endpoints(&options, timeout)?;
        let admin_descriptor = endpoints
            .get(ServiceEndpointType::Administration)
            .cloned()
            .ok_or_else(|| {
                ClientError::Configuration("realm advertises no administration endpoint".into())
            })?;

        self.emit(RealmEvent::Changing {
            realm: realm.to_string(),
        });

        let admin = self
            .factory
            .for_descriptor(&admin_descriptor, request.principal.clone())?;
        let device_secret = self
            .config
            .device_secret
            .clone()
            .unwrap_or_else(generate_device_secret);
        let device_id = self
            .register_device(&admin, &device_secret, request.replace)
            .await?;

        let mut certificate = None;
        let mtls = endpoints
            .get(ServiceEndpointType::Authentication)
            .is_some_and(EndpointDescriptor::requires_client_certificate);
        if mtls {
            let existing = self
                .factory
                .credentials()
                .find_by_subject(&self.config.device_name)
                .filter(|c| c.is_usable(Utc::now()));
            let cert = match existing {
                Some(cert) => {
                    info!("Reusing client certificate for {}", self.config.device_name);
                    cert
                }
                None => {
                    let issued = EnrollmentRequest::generate(&self.config.device_name)?
                        .submit(&admin)
                        .await?;
                    certificate = Some(issued.clone());
                    issued
                }
            };
            endpoints = endpoints.bind_client_certificate(&cert.thumbprint()?);
        }

        let data_descriptor = endpoints
            .get(ServiceEndpointType::HealthData)
            .cloned()
            .unwrap_or(admin_descriptor);
        let data = match certificate.as_ref() {
            Some(draft) if data_descriptor.requires_client_certificate() => self
                .factory
                .for_descriptor_with_certificate(&data_descriptor, request.principal.clone(), draft)?,
            _ => self
                .factory
                .for_descriptor(&data_descriptor, request.principal.clone())?,
        };
        self.upsert_device_entity(&data, device_id).await?;

        Ok(JoinDraft {
            settings: RealmSettings {
                realm: realm.to_string(),
                device_name: self.config.device_name.clone(),
                device_secret,
                application_name: self.config.application_name.clone(),
                application_secret: self.config.application_secret.clone(),
                joined_at: Utc::now(),
            },
            endpoints,
            certificate,
        })
    }

    /// Creates or, when replacing, updates the device credential upstream.
    async fn register_device(
        &self,
        admin: &Transport,
        secret: &str,
        replace: bool,
    ) -> ClientResult<Uuid> {
        let name = &self.config.device_name;
        let query = [("name".to_string(), name.clone())];
        let existing = admin
            .get::<Bundle<SecurityDevice>>(SecurityDevice::COLLECTION, &query)
            .await?
            .value
            .resource
            .into_iter()
            .next();

        let device = SecurityDevice {
            id: existing.as_ref().and_then(|d| d.id),
            name: name.clone(),
            device_secret: Some(secret.to_string()),
        };

        let stored: SecurityDevice = match (existing, device.id) {
            (Some(_), _) if !replace => {
                return Err(ClientError::DuplicateRegistration(name.clone()));
            }
            (Some(_), Some(id)) => {
                info!("Replacing registration of device {}", name);
                admin
                    .put(&format!("{}/{}", SecurityDevice::COLLECTION, id), &device)
                    .await?
                    .value
            }
            _ => {
                info!("Registering device {}", name);
                admin.post(SecurityDevice::COLLECTION, &device).await?.value
            }
        };

        stored.id.ok_or_else(|| {
            ClientError::InvalidState(format!("upstream returned device {name} without id"))
        })
    }

    /// Creates or updates the device entity attached to `device_id`.
    async fn upsert_device_entity(&self, data: &Transport, device_id: Uuid) -> ClientResult<()> {
        let info = DeviceInfo::collect();
        let query = [("securityDevice".to_string(), device_id.to_string())];
        let existing = data
            .get::<Bundle<DeviceEntity>>(DeviceEntity::COLLECTION, &query)
            .await?
            .value
            .resource
            .into_iter()
            .next();

        let entity = DeviceEntity {
            id: existing.and_then(|e| e.id),
            security_device: device_id,
            name: self.config.device_name.clone(),
            operating_system: format!("{} {}", info.os_name, info.os_version),
            machine_name: info.machine_name,
            geo: self.config.geo,
        };

        match entity.id {
            Some(id) => {
                data.put::<_, DeviceEntity>(&format!("{}/{}", DeviceEntity::COLLECTION, id), &entity)
                    .await?;
            }
            None => {
                data.post::<_, DeviceEntity>(DeviceEntity::COLLECTION, &entity)
                    .await?;
            }
        }
        Ok(())
    }

    fn commit(&self, draft: JoinDraft) -> ClientResult<RealmSettings> {
        if let Some(certificate) = draft.certificate {
            self.factory.credentials().install(certificate)?;
        }
        self.factory
            .config()
            .commit_realm(draft.settings.clone(), draft.endpoints)?;
        self.factory.reset_session();
        Ok(draft.settings)
    }
}

/// 32 random bytes, hex encoded.
fn generate_device_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_secret_is_64_hex_chars() {
        let secret = generate_device_secret();
        assert_eq!(secret.len(), 64);
        assert!(secret.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(secret, generate_device_secret());
    }
}

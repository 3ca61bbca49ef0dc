//! Shared test helpers for upstream tests.

#![allow(dead_code)]

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::Utc;
use edgefed_types::{
    EndpointDescriptor, EndpointTable, RealmSettings, SecurityScheme, ServiceEndpointType,
};
use edgefed_upstream::{
    AvailabilityProbe, MemoryConfigStore, MemoryCredentialStore, Resource, TemplateRef,
    TransportFactory,
};
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, CertificateSigningRequestParams, DnType,
    IsCa, KeyPair,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;
use wiremock::{Request, Respond, ResponseTemplate};

/// Realm settings for a node joined to `realm`.
pub fn settings(realm: &str) -> RealmSettings {
    RealmSettings {
        realm: realm.to_string(),
        device_name: "edge-01".to_string(),
        device_secret: "device-secret".to_string(),
        application_name: "edgefed".to_string(),
        application_secret: "app-secret".to_string(),
        joined_at: Utc::now(),
    }
}

/// Administration, health-data and authentication endpoints under `base`.
pub fn endpoints(base: &str) -> EndpointTable {
    EndpointTable::from_descriptors([
        EndpointDescriptor::new(
            ServiceEndpointType::Administration,
            vec![format!("{base}/ami")],
            SecurityScheme::Basic,
        )
        .unwrap(),
        EndpointDescriptor::new(
            ServiceEndpointType::HealthData,
            vec![format!("{base}/hdsi")],
            SecurityScheme::Bearer,
        )
        .unwrap(),
        EndpointDescriptor::new(
            ServiceEndpointType::Authentication,
            vec![format!("{base}/auth")],
            SecurityScheme::Basic,
        )
        .unwrap(),
    ])
}

/// A factory for a node already joined to the realm at `base`.
pub fn joined_factory(base: &str) -> (Arc<TransportFactory>, Arc<MemoryConfigStore>) {
    let config = Arc::new(MemoryConfigStore::joined(settings(base), endpoints(base)));
    let factory = TransportFactory::new(config.clone(), Arc::new(MemoryCredentialStore::new()));
    (Arc::new(factory), config)
}

/// A factory for a node that has not joined any realm.
pub fn unjoined_factory() -> (Arc<TransportFactory>, Arc<MemoryConfigStore>, Arc<MemoryCredentialStore>) {
    let config = Arc::new(MemoryConfigStore::new());
    let credentials = Arc::new(MemoryCredentialStore::new());
    let factory = TransportFactory::new(config.clone(), credentials.clone());
    (Arc::new(factory), config, credentials)
}

/// Probe with a switchable answer.
#[derive(Debug)]
pub struct StaticProbe(AtomicBool);

impl StaticProbe {
    pub fn new(available: bool) -> Arc<Self> {
        Arc::new(Self(AtomicBool::new(available)))
    }

    pub fn set(&self, available: bool) {
        self.0.store(available, Ordering::SeqCst);
    }
}

#[async_trait]
impl AvailabilityProbe for StaticProbe {
    async fn is_available(&self, _service: ServiceEndpointType) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Signs posted certificate requests the way an upstream CA would.
pub struct TestAuthority {
    ca: Certificate,
    key: KeyPair,
    expired: bool,
    foreign_key: bool,
}

impl TestAuthority {
    pub fn new() -> Self {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params
            .distinguished_name
            .push(DnType::CommonName, "edgefed test authority");
        let ca = params.self_signed(&key).unwrap();
        Self {
            ca,
            key,
            expired: false,
            foreign_key: false,
        }
    }

    /// Issues certificates whose validity ended in 2021.
    pub fn expired(mut self) -> Self {
        self.expired = true;
        self
    }

    /// Issues certificates for a key other than the requester's.
    pub fn foreign_key(mut self) -> Self {
        self.foreign_key = true;
        self
    }

    /// Base64 DER certificate for `csr_pem`.
    pub fn issue(&self, csr_pem: &str) -> String {
        let mut csr = CertificateSigningRequestParams::from_pem(csr_pem).unwrap();
        if self.expired {
            csr.params.not_before = rcgen::date_time_ymd(2020, 1, 1);
            csr.params.not_after = rcgen::date_time_ymd(2021, 1, 1);
        }
        let issued = if self.foreign_key {
            let other = KeyPair::generate().unwrap();
            csr.params.signed_by(&other, &self.ca, &self.key).unwrap()
        } else {
            csr.signed_by(&self.ca, &self.key).unwrap()
        };
        BASE64.encode(issued.der())
    }
}

impl Respond for TestAuthority {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let body: Value = serde_json::from_slice(&request.body).unwrap();
        let csr = body["csr"].as_str().unwrap();
        ResponseTemplate::new(200).set_body_json(json!({
            "status": "issued",
            "certificate": self.issue(csr)
        }))
    }
}

/// A business record with a template reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Patient {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<TemplateRef>,
}

impl Patient {
    pub fn named(name: &str) -> Self {
        Self {
            id: None,
            name: name.to_string(),
            template: None,
        }
    }

    pub fn with_template(mut self, mnemonic: &str) -> Self {
        self.template = Some(TemplateRef::named(mnemonic));
        self
    }
}

impl Resource for Patient {
    const COLLECTION: &'static str = "Patient";

    fn key(&self) -> Option<Uuid> {
        self.id
    }

    fn set_key(&mut self, key: Uuid) {
        self.id = Some(key);
    }

    fn template_mut(&mut self) -> Option<&mut TemplateRef> {
        self.template.as_mut()
    }
}

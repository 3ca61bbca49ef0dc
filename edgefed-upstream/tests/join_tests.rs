mod common;

use chrono::Utc;
use common::TestAuthority;
use edgefed_types::{ActivityId, Identity, Principal, SecurityScheme, ServiceEndpointType};
use edgefed_upstream::{
    ClientError, ConfigurationStore, CredentialStore, FederationConfig, JoinRequest, JoinState,
    RealmEvent, RealmJoin,
};
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn node_config() -> FederationConfig {
    FederationConfig {
        device_name: "edge-01".to_string(),
        application_name: "edgefed".to_string(),
        application_secret: "app-secret".to_string(),
        ..Default::default()
    }
}

fn admin() -> Principal {
    Principal::User(Identity::with_secret("administrator", "Secret123"))
}

fn service_options(base: &str, version: &str, server_id: Option<Uuid>, auth_caps: &[&str]) -> Value {
    json!({
        "interfaceVersion": version,
        "serverId": server_id,
        "endpoints": [
            { "serviceType": "administration", "baseUrl": [format!("{base}/ami")], "capabilities": ["basicAuth"] },
            { "serviceType": "healthData", "baseUrl": [format!("{base}/hdsi")], "capabilities": ["bearerAuth"], "compression": true },
            { "serviceType": "authentication", "baseUrl": [format!("{base}/auth")], "capabilities": auth_caps },
            { "serviceType": "messaging", "baseUrl": ["amqp://broker/msg"], "capabilities": [] }
        ]
    })
}

async fn mount_options(server: &MockServer, body: Value) {
    Mock::given(method("OPTIONS"))
        .and(path("/ami/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(server)
        .await;
}

async fn mount_registration(server: &MockServer, device_id: Uuid) {
    Mock::given(method("GET"))
        .and(path("/ami/SecurityDevice"))
        .and(query_param("name", "edge-01"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "resource": [] })))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/ami/SecurityDevice"))
        .respond_with(
            ResponseTemplate::new(201).set_body_json(json!({ "id": device_id, "name": "edge-01" })),
        )
        .expect(1)
        .mount(server)
        .await;
}

async fn mount_device_entity(server: &MockServer, device_id: Uuid) {
    Mock::given(method("GET"))
        .and(path("/hdsi/DeviceEntity"))
        .and(query_param("securityDevice", device_id.to_string()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "resource": [] })))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/hdsi/DeviceEntity"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "id": Uuid::now_v7(),
            "securityDevice": device_id,
            "name": "edge-01",
            "operatingSystem": "linux",
            "machineName": "edge-01"
        })))
        .expect(1)
        .mount(server)
        .await;
}

fn drain(rx: &mut tokio::sync::broadcast::Receiver<RealmEvent>) -> Vec<RealmEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

// ── Successful join ─────────────────────────────────────────────

#[tokio::test]
async fn join_commits_settings_and_endpoints() {
    let server = MockServer::start().await;
    let base = server.uri();
    let device_id = Uuid::now_v7();
    mount_options(&server, service_options(&base, "3.2", Some(Uuid::now_v7()), &["basicAuth"])).await;
    mount_registration(&server, device_id).await;
    mount_device_entity(&server, device_id).await;

    let (factory, config, _) = common::unjoined_factory();
    let join = RealmJoin::new(factory, node_config());
    let mut events = join.subscribe();
    assert_eq!(join.state(), JoinState::Unjoined);

    let settings = join.join(JoinRequest::new(format!("{base}/"), admin())).await.unwrap();

    assert_eq!(settings.realm, base);
    assert_eq!(settings.device_name, "edge-01");
    assert_eq!(settings.device_secret.len(), 64);
    assert_eq!(join.state(), JoinState::Joined);
    assert_eq!(config.realm(), Some(settings));

    let endpoints = config.endpoints();
    assert_eq!(endpoints.len(), 3, "non-http capability is skipped");
    let hdsi = endpoints.get(ServiceEndpointType::HealthData).unwrap();
    assert_eq!(hdsi.security(), SecurityScheme::Bearer);
    assert!(hdsi.compression());

    assert_eq!(
        drain(&mut events),
        vec![
            RealmEvent::Changing { realm: base.clone() },
            RealmEvent::Changed { realm: base.clone() },
        ]
    );
}

#[tokio::test]
async fn join_uses_preprovisioned_device_secret() {
    let server = MockServer::start().await;
    let base = server.uri();
    let device_id = Uuid::now_v7();
    mount_options(&server, service_options(&base, "3.0", None, &["basicAuth"])).await;
    mount_registration(&server, device_id).await;
    mount_device_entity(&server, device_id).await;

    let (factory, _, _) = common::unjoined_factory();
    let config = FederationConfig {
        device_secret: Some("provisioned".to_string()),
        ..node_config()
    };
    let join = RealmJoin::new(factory, config);

    let settings = join.join(JoinRequest::new(base, admin())).await.unwrap();
    assert_eq!(settings.device_secret, "provisioned");
}

// ── Rejections before any registration ──────────────────────────

#[tokio::test]
async fn join_rejects_older_interface_version() {
    let server = MockServer::start().await;
    let base = server.uri();
    mount_options(&server, service_options(&base, "1.0", None, &["basicAuth"])).await;
    Mock::given(method("GET"))
        .and(path("/ami/SecurityDevice"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "resource": [] })))
        .expect(0)
        .mount(&server)
        .await;

    let (factory, config, _) = common::unjoined_factory();
    let join = RealmJoin::new(factory, node_config());
    let mut events = join.subscribe();

    let err = join.join(JoinRequest::new(base.clone(), admin())).await.unwrap_err();

    assert!(matches!(err, ClientError::Integration { .. }));
    assert!(matches!(
        err.cause(),
        ClientError::VersionIncompatibility { remote, local } if remote == "1.0" && local == "3.0"
    ));
    assert!(config.endpoints().is_empty());
    assert!(config.realm().is_none());
    assert_eq!(join.state(), JoinState::Failed);

    let events = drain(&mut events);
    assert_eq!(events.len(), 1);
    assert!(matches!(&events[0], RealmEvent::JoinFailed { realm, .. } if *realm == base));
}

#[tokio::test]
async fn join_rejects_own_server_activity() {
    let server = MockServer::start().await;
    let base = server.uri();
    let own = ActivityId::new();
    mount_options(&server, service_options(&base, "3.0", Some(own.as_uuid()), &["basicAuth"])).await;
    Mock::given(method("GET"))
        .and(path("/ami/SecurityDevice"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "resource": [] })))
        .expect(0)
        .mount(&server)
        .await;

    let (factory, config, _) = common::unjoined_factory();
    let join = RealmJoin::new(
        factory,
        FederationConfig {
            activity_id: own,
            ..node_config()
        },
    );

    let err = join.join(JoinRequest::new(base, admin())).await.unwrap_err();
    assert!(matches!(err.cause(), ClientError::SelfJoinRejected(id) if *id == own.as_uuid()));
    assert!(config.realm().is_none());
}

#[tokio::test]
async fn join_when_already_joined_sends_nothing() {
    let server = MockServer::start().await;
    let base = server.uri();
    let (factory, config) = common::joined_factory(&base);
    let before = config.endpoints();
    let join = RealmJoin::new(factory, node_config());
    assert_eq!(join.state(), JoinState::Joined);

    let err = join.join(JoinRequest::new(base, admin())).await.unwrap_err();

    assert!(matches!(err, ClientError::InvalidState(_)));
    assert_eq!(config.endpoints(), before);
    assert!(server.received_requests().await.unwrap().is_empty());
}

// ── Device registration ─────────────────────────────────────────

#[tokio::test]
async fn join_refuses_duplicate_registration() {
    let server = MockServer::start().await;
    let base = server.uri();
    mount_options(&server, service_options(&base, "3.0", None, &["basicAuth"])).await;
    Mock::given(method("GET"))
        .and(path("/ami/SecurityDevice"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "resource": [{ "id": Uuid::now_v7(), "name": "edge-01" }]
        })))
        .mount(&server)
        .await;

    let (factory, config, _) = common::unjoined_factory();
    let join = RealmJoin::new(factory, node_config());

    let err = join.join(JoinRequest::new(base, admin())).await.unwrap_err();
    assert!(matches!(err.cause(), ClientError::DuplicateRegistration(name) if name == "edge-01"));
    assert!(config.realm().is_none());
}

#[tokio::test]
async fn join_replacing_updates_existing_device() {
    let server = MockServer::start().await;
    let base = server.uri();
    let device_id = Uuid::now_v7();
    // Replace also skips the version gate.
    mount_options(&server, service_options(&base, "2.4", None, &["basicAuth"])).await;
    Mock::given(method("GET"))
        .and(path("/ami/SecurityDevice"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "resource": [{ "id": device_id, "name": "edge-01" }]
        })))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path(format!("/ami/SecurityDevice/{device_id}")))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "id": device_id, "name": "edge-01" })),
        )
        .expect(1)
        .mount(&server)
        .await;
    mount_device_entity(&server, device_id).await;

    let (factory, config, _) = common::unjoined_factory();
    let join = RealmJoin::new(factory, node_config());

    join.join(JoinRequest::new(base, admin()).replacing())
        .await
        .unwrap();
    assert!(config.realm().is_some());
}

#[tokio::test]
async fn join_failure_in_device_entity_leaves_node_unjoined() {
    let server = MockServer::start().await;
    let base = server.uri();
    let device_id = Uuid::now_v7();
    mount_options(&server, service_options(&base, "3.0", None, &["basicAuth"])).await;
    mount_registration(&server, device_id).await;
    Mock::given(method("GET"))
        .and(path("/hdsi/DeviceEntity"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&server)
        .await;

    let (factory, config, _) = common::unjoined_factory();
    let join = RealmJoin::new(factory, node_config());

    let err = join.join(JoinRequest::new(base, admin())).await.unwrap_err();
    assert!(matches!(err.cause(), ClientError::Status { status: 500, .. }));
    assert!(config.realm().is_none());
    assert!(config.endpoints().is_empty());
}

// ── Certificate enrollment ──────────────────────────────────────

async fn mount_authority(server: &MockServer, authority: TestAuthority) {
    Mock::given(method("POST"))
        .and(path("/ami/Certificate/Csr"))
        .respond_with(authority)
        .expect(1)
        .mount(server)
        .await;
}

#[tokio::test]
async fn join_enrolls_client_certificate_for_mtls_realm() {
    let server = MockServer::start().await;
    let base = server.uri();
    let device_id = Uuid::now_v7();
    mount_options(&server, service_options(&base, "3.0", None, &["certificateAuth"])).await;
    mount_registration(&server, device_id).await;
    mount_device_entity(&server, device_id).await;
    mount_authority(&server, TestAuthority::new()).await;

    let (factory, config, credentials) = common::unjoined_factory();
    let join = RealmJoin::new(factory, node_config());

    join.join(JoinRequest::new(base, admin())).await.unwrap();

    let certificate = credentials.find_by_subject("edge-01").unwrap();
    assert!(certificate.has_private_key());
    let not_after = certificate.not_after.expect("expiry read from the issued certificate");
    assert!(not_after > Utc::now());
    assert!(certificate.is_usable(Utc::now()));
    assert!(!certificate.is_usable(not_after));
    let reference = certificate.thumbprint().unwrap();

    let auth = config.endpoint(ServiceEndpointType::Authentication).unwrap();
    assert_eq!(auth.client_certificate(), Some(&reference));
    let admin_endpoint = config.endpoint(ServiceEndpointType::Administration).unwrap();
    assert_eq!(admin_endpoint.client_certificate(), None);
}

#[tokio::test]
async fn join_presents_new_certificate_to_mtls_data_endpoint() {
    let server = MockServer::start().await;
    let base = server.uri();
    let device_id = Uuid::now_v7();
    let mut options = service_options(&base, "3.0", None, &["certificateAuth"]);
    options["endpoints"][1]["capabilities"] = json!(["certificateAuth"]);
    mount_options(&server, options).await;
    mount_registration(&server, device_id).await;
    mount_device_entity(&server, device_id).await;
    mount_authority(&server, TestAuthority::new()).await;

    let (factory, config, credentials) = common::unjoined_factory();
    let join = RealmJoin::new(factory, node_config());

    join.join(JoinRequest::new(base, admin())).await.unwrap();

    let reference = credentials.find_by_subject("edge-01").unwrap().thumbprint().unwrap();
    let data = config.endpoint(ServiceEndpointType::HealthData).unwrap();
    assert_eq!(data.security(), SecurityScheme::ClientCertificate);
    assert_eq!(data.client_certificate(), Some(&reference));
}

#[tokio::test]
async fn join_rejects_expired_certificate() {
    let server = MockServer::start().await;
    let base = server.uri();
    let device_id = Uuid::now_v7();
    mount_options(&server, service_options(&base, "3.0", None, &["certificateAuth"])).await;
    mount_registration(&server, device_id).await;
    mount_authority(&server, TestAuthority::new().expired()).await;

    let (factory, config, credentials) = common::unjoined_factory();
    let join = RealmJoin::new(factory, node_config());

    let err = join.join(JoinRequest::new(base, admin())).await.unwrap_err();
    assert!(matches!(err.cause(), ClientError::Enrollment(msg) if msg.contains("expired")));
    assert!(credentials.is_empty());
    assert!(config.realm().is_none());
}

#[tokio::test]
async fn join_rejects_certificate_for_another_key() {
    let server = MockServer::start().await;
    let base = server.uri();
    let device_id = Uuid::now_v7();
    mount_options(&server, service_options(&base, "3.0", None, &["certificateAuth"])).await;
    mount_registration(&server, device_id).await;
    mount_authority(&server, TestAuthority::new().foreign_key()).await;

    let (factory, config, credentials) = common::unjoined_factory();
    let join = RealmJoin::new(factory, node_config());

    let err = join.join(JoinRequest::new(base, admin())).await.unwrap_err();
    assert!(matches!(err.cause(), ClientError::Enrollment(msg) if msg.contains("does not match")));
    assert!(credentials.is_empty());
    assert!(config.realm().is_none());
}

#[tokio::test]
async fn join_fails_when_certificate_is_pending() {
    let server = MockServer::start().await;
    let base = server.uri();
    let device_id = Uuid::now_v7();
    mount_options(&server, service_options(&base, "3.0", None, &["certificateAuth"])).await;
    mount_registration(&server, device_id).await;
    Mock::given(method("POST"))
        .and(path("/ami/Certificate/Csr"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "status": "pending", "message": "awaiting approval" })),
        )
        .mount(&server)
        .await;

    let (factory, config, credentials) = common::unjoined_factory();
    let join = RealmJoin::new(factory, node_config());

    let err = join.join(JoinRequest::new(base, admin())).await.unwrap_err();
    assert!(matches!(err.cause(), ClientError::Enrollment(_)));
    assert!(credentials.is_empty());
    assert!(config.realm().is_none());
    assert_eq!(join.state(), JoinState::Failed);
}

// ── Leave ───────────────────────────────────────────────────────

#[tokio::test]
async fn leave_clears_realm() {
    let (factory, config) = common::joined_factory("https://hub.example.org");
    let join = RealmJoin::new(Arc::clone(&factory), node_config());
    let mut events = join.subscribe();

    join.leave().unwrap();

    assert!(config.realm().is_none());
    assert!(config.endpoints().is_empty());
    assert_eq!(join.state(), JoinState::Unjoined);
    assert_eq!(
        drain(&mut events),
        vec![RealmEvent::Left {
            realm: "https://hub.example.org".to_string()
        }]
    );
    assert!(matches!(join.leave(), Err(ClientError::InvalidState(_))));
}

use edgefed_types::{
    CertificateRef, EndpointDescriptor, EndpointTable, SecurityScheme, ServiceEndpointType,
    DEFAULT_CONTENT_TYPE, DEFAULT_REQUEST_TIMEOUT,
};
use pretty_assertions::assert_eq;
use std::time::Duration;

fn descriptor(service: ServiceEndpointType, security: SecurityScheme) -> EndpointDescriptor {
    EndpointDescriptor::new(service, vec!["https://hub.example.org/x/".into()], security).unwrap()
}

#[test]
fn new_descriptor_defaults() {
    let d = descriptor(ServiceEndpointType::HealthData, SecurityScheme::Bearer);
    assert_eq!(d.primary_url(), "https://hub.example.org/x");
    assert_eq!(d.accept(), DEFAULT_CONTENT_TYPE);
    assert_eq!(d.timeout(), DEFAULT_REQUEST_TIMEOUT);
    assert!(!d.compression());
    assert!(d.client_certificate().is_none());
}

#[test]
fn descriptor_requires_address() {
    let err = EndpointDescriptor::new(ServiceEndpointType::HealthData, vec![], SecurityScheme::None);
    assert!(err.is_err());
}

#[test]
fn descriptor_rejects_non_http_address() {
    let err = EndpointDescriptor::new(
        ServiceEndpointType::Messaging,
        vec!["amqp://broker".into()],
        SecurityScheme::None,
    );
    assert!(err.is_err());
}

#[test]
fn with_methods_do_not_mutate_original() {
    let d = descriptor(ServiceEndpointType::HealthData, SecurityScheme::Bearer);
    let compressed = d.with_compression(true).with_timeout(Duration::from_secs(5));
    assert!(!d.compression());
    assert!(compressed.compression());
    assert_eq!(compressed.timeout(), Duration::from_secs(5));
    assert_eq!(d.timeout(), DEFAULT_REQUEST_TIMEOUT);
}

#[test]
fn table_binds_certificate_only_where_required() {
    let table = EndpointTable::from_descriptors(vec![
        descriptor(ServiceEndpointType::Authentication, SecurityScheme::ClientCertificate),
        descriptor(ServiceEndpointType::HealthData, SecurityScheme::Bearer),
    ]);
    let cert = CertificateRef::new("feed");
    let bound = table.bind_client_certificate(&cert);

    assert_eq!(
        bound.get(ServiceEndpointType::Authentication).unwrap().client_certificate(),
        Some(&cert)
    );
    assert!(bound.get(ServiceEndpointType::HealthData).unwrap().client_certificate().is_none());
    // the source table is untouched
    assert!(table.get(ServiceEndpointType::Authentication).unwrap().client_certificate().is_none());
}

#[test]
fn table_serde_roundtrip() {
    let table = EndpointTable::from_descriptors(vec![
        descriptor(ServiceEndpointType::Administration, SecurityScheme::Basic).with_compression(true),
        descriptor(ServiceEndpointType::HealthData, SecurityScheme::Bearer),
    ]);
    let json = serde_json::to_string(&table).unwrap();
    let back: EndpointTable = serde_json::from_str(&json).unwrap();
    assert_eq!(table, back);
}

#[test]
fn deserialized_descriptor_requires_address() {
    let json = r#"{"service":"healthData","baseUrls":[],"security":"bearer","accept":"application/json","timeoutMs":30000}"#;
    let err = serde_json::from_str::<EndpointDescriptor>(json).unwrap_err();
    assert!(err.to_string().contains("no base address"));

    let table = r#"{"healthData":{"service":"healthData","baseUrls":[]}}"#;
    assert!(serde_json::from_str::<EndpointTable>(table).is_err());
}

#[test]
fn deserialized_descriptor_is_normalized() {
    let json = r#"{"service":"administration","baseUrls":["https://hub.example.org/ami/"]}"#;
    let d: EndpointDescriptor = serde_json::from_str(json).unwrap();
    assert_eq!(d.primary_url(), "https://hub.example.org/ami");
    assert_eq!(d.security(), SecurityScheme::None);
    assert_eq!(d.accept(), DEFAULT_CONTENT_TYPE);
    assert_eq!(d.timeout(), DEFAULT_REQUEST_TIMEOUT);

    let amqp = r#"{"service":"messaging","baseUrls":["amqp://broker"]}"#;
    assert!(serde_json::from_str::<EndpointDescriptor>(amqp).is_err());
}

#[test]
fn default_paths() {
    assert_eq!(ServiceEndpointType::Administration.default_path(), "ami");
    assert_eq!(ServiceEndpointType::HealthData.default_path(), "hdsi");
    assert_eq!(ServiceEndpointType::Authentication.default_path(), "auth");
}

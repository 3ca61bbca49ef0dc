//! Core type definitions for EdgeFed.
//!
//! This crate defines the plain data shared by the federation layer and the
//! binaries that host it:
//! - Activity identifiers for nodes and upstream servers
//! - The acting [`Principal`] (device, application, user or system)
//! - Endpoint descriptors and the endpoint table produced by a realm join
//! - Realm settings and interface-version helpers
//! - Weak revision tags used for conditional reads
//! - Local device information reported to upstream
//!
//! Nothing here performs network I/O.

mod device;
mod endpoint;
mod ids;
mod principal;
mod realm;
mod revision;

pub use device::{DeviceInfo, GeoTag};
pub use endpoint::{
    EndpointDescriptor, EndpointTable, SecurityScheme, ServiceEndpointType, DEFAULT_CONTENT_TYPE,
    DEFAULT_REQUEST_TIMEOUT,
};
pub use ids::ActivityId;
pub use principal::{
    CertificateRef, Identity, Principal, PrincipalSecret, ANONYMOUS_NAME, SYSTEM_NAME,
};
pub use realm::{InterfaceVersion, RealmSettings, LOCAL_INTERFACE_VERSION};
pub use revision::RevisionTag;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in type operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid UUID: {0}")]
    InvalidUuid(#[from] uuid::Error),

    #[error("invalid interface version: {0}")]
    InvalidVersion(String),

    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),
}

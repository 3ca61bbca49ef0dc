//! Error types for the upstream federation layer.

use thiserror::Error;
use uuid::Uuid;

/// Result type for upstream operations.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors that can occur talking to upstream.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Realm unset or a required credential/endpoint is missing.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Network failure or timeout.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Upstream answered with an unexpected status.
    #[error("upstream returned {status}: {body}")]
    Status { status: u16, body: String },

    /// Upstream reported the resource does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Upstream speaks an older interface than this node.
    #[error("upstream interface version {remote} is not compatible with local version {local}")]
    VersionIncompatibility { remote: String, local: String },

    /// The realm descriptor belongs to this very node.
    #[error("refusing to join own server activity {0}")]
    SelfJoinRejected(Uuid),

    /// A device registration with this name already exists upstream.
    #[error("device {0} is already registered upstream")]
    DuplicateRegistration(String),

    /// Certificate enrollment did not yield an issued certificate.
    #[error("certificate enrollment failed: {0}")]
    Enrollment(String),

    /// The object is checked out by someone else.
    #[error("object {key} is locked{}", owner.as_ref().map(|o| format!(" by {o}")).unwrap_or_default())]
    ObjectLocked { key: String, owner: Option<String> },

    /// The operation is not valid in the current state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// A single result was expected but several were returned.
    #[error("expected a single {0} but upstream returned more than one")]
    Multiplicity(String),

    /// Durable queue failure.
    #[error("queue error: {0}")]
    Queue(String),

    /// Key pair or signing request generation failed.
    #[error("certificate error: {0}")]
    Certificate(#[from] rcgen::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid data: {0}")]
    Types(#[from] edgefed_types::Error),

    /// Wraps a failure from a multi-step upstream integration.
    #[error("{message}: {source}")]
    Integration {
        message: String,
        #[source]
        source: Box<ClientError>,
    },
}

impl ClientError {
    /// Wraps this error as an integration failure.
    pub fn integration(message: impl Into<String>, source: ClientError) -> Self {
        Self::Integration {
            message: message.into(),
            source: Box::new(source),
        }
    }

    /// Returns the innermost error below any integration wrappers.
    pub fn cause(&self) -> &ClientError {
        match self {
            Self::Integration { source, .. } => source.cause(),
            other => other,
        }
    }

    /// Returns true when upstream reported the resource as missing.
    pub fn is_not_found(&self) -> bool {
        match self.cause() {
            Self::NotFound(_) => true,
            Self::Status { status, .. } => *status == 404,
            Self::Http(e) => e.status().is_some_and(|s| s.as_u16() == 404),
            _ => false,
        }
    }

    /// Returns true for network-level and non-2xx failures.
    pub fn is_transport(&self) -> bool {
        matches!(
            self.cause(),
            Self::Http(_) | Self::Status { .. } | Self::NotFound(_)
        )
    }
}

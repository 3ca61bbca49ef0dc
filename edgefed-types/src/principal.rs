//! The acting identity on whose behalf an upstream call is made.
//!
//! A principal is exactly one of four kinds; routing and transport binding
//! match on the variant.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Name of the distinguished system principal.
pub const SYSTEM_NAME: &str = "SYSTEM";

/// Name of the anonymous principal.
pub const ANONYMOUS_NAME: &str = "ANONYMOUS";

/// Reference to a client certificate held in a credential store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CertificateRef(String);

impl CertificateRef {
    /// Creates a reference from a certificate thumbprint (hex SHA-256).
    pub fn new(thumbprint: impl Into<String>) -> Self {
        Self(thumbprint.into())
    }

    /// Returns the thumbprint.
    #[must_use]
    pub fn thumbprint(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CertificateRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Secret material a principal can present.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum PrincipalSecret {
    /// No secret; the principal cannot authenticate by itself.
    #[default]
    None,
    /// A shared secret (password or client secret).
    SharedSecret(String),
    /// A client certificate installed in the credential store.
    Certificate(CertificateRef),
    /// A session token issued by upstream.
    Session(String),
}

impl fmt::Debug for PrincipalSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::SharedSecret(_) => f.write_str("SharedSecret(***)"),
            Self::Certificate(cert) => write!(f, "Certificate({cert})"),
            Self::Session(_) => f.write_str("Session(***)"),
        }
    }
}

/// A named identity with its secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub name: String,
    #[serde(default)]
    pub secret: PrincipalSecret,
}

impl Identity {
    /// Creates an identity with no secret.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            secret: PrincipalSecret::None,
        }
    }

    /// Creates an identity authenticated by a shared secret.
    pub fn with_secret(name: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            secret: PrincipalSecret::SharedSecret(secret.into()),
        }
    }

    /// Creates an identity carrying an upstream session token.
    pub fn with_session(name: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            secret: PrincipalSecret::Session(token.into()),
        }
    }
}

/// The acting identity of a call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Principal {
    /// The node's machine identity.
    Device(Identity),
    /// The hosting application's client identity.
    Application(Identity),
    /// A human user.
    User(Identity),
    /// The node itself acting without a human.
    System(Identity),
}

impl Principal {
    /// The distinguished system principal.
    #[must_use]
    pub fn system() -> Self {
        Self::System(Identity::named(SYSTEM_NAME))
    }

    /// The anonymous user.
    #[must_use]
    pub fn anonymous() -> Self {
        Self::User(Identity::named(ANONYMOUS_NAME))
    }

    /// Returns the identity regardless of kind.
    #[must_use]
    pub fn identity(&self) -> &Identity {
        match self {
            Self::Device(id) | Self::Application(id) | Self::User(id) | Self::System(id) => id,
        }
    }

    /// Returns the principal's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.identity().name
    }

    /// Returns the principal's secret.
    #[must_use]
    pub fn secret(&self) -> &PrincipalSecret {
        &self.identity().secret
    }

    /// Whether this is the anonymous user.
    #[must_use]
    pub fn is_anonymous(&self) -> bool {
        matches!(self, Self::User(id) if id.name == ANONYMOUS_NAME && id.secret == PrincipalSecret::None)
    }

    /// Whether this is the system principal.
    #[must_use]
    pub fn is_system(&self) -> bool {
        matches!(self, Self::System(_))
    }

    /// Short label for the principal kind, used in logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Device(_) => "device",
            Self::Application(_) => "application",
            Self::User(_) => "user",
            Self::System(_) => "system",
        }
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind(), self.name())
    }
}

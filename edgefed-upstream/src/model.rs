//! Resources exchanged with upstream.
//!
//! Business models belong to the hosting application. The records here are
//! the few the federation layer itself reads and writes: device registration,
//! security users and provenance for routing, and template definitions for
//! harmonization.

use chrono::{DateTime, Utc};
use edgefed_types::GeoTag;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A resource type stored in an upstream collection.
pub trait Resource: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Collection name in resource paths.
    const COLLECTION: &'static str;

    /// Identifier, if assigned.
    fn key(&self) -> Option<Uuid>;

    /// Assigns the identifier.
    fn set_key(&mut self, key: Uuid);

    /// Template reference to harmonize before submission, if this type has one.
    fn template_mut(&mut self) -> Option<&mut TemplateRef> {
        None
    }
}

/// Reference to a template by mnemonic, resolved to an id before submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateRef {
    pub mnemonic: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
}

impl TemplateRef {
    /// An unresolved reference.
    pub fn named(mnemonic: impl Into<String>) -> Self {
        Self {
            mnemonic: mnemonic.into(),
            id: None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.id.is_some()
    }
}

/// A page of results, or a batch submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bundle<T> {
    #[serde(default = "Vec::new")]
    pub resource: Vec<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_results: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,
}

impl<T> Bundle<T> {
    pub fn new(resource: Vec<T>) -> Self {
        Self {
            resource,
            total_results: None,
            offset: None,
        }
    }
}

/// Collection batches are posted to.
pub const BUNDLE_COLLECTION: &str = "Bundle";

/// A device credential registered upstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityDevice {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_secret: Option<String>,
}

impl Resource for SecurityDevice {
    const COLLECTION: &'static str = "SecurityDevice";

    fn key(&self) -> Option<Uuid> {
        self.id
    }

    fn set_key(&mut self, key: Uuid) {
        self.id = Some(key);
    }
}

/// The physical device record attached to a device credential.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceEntity {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
    pub security_device: Uuid,
    pub name: String,
    pub operating_system: String,
    pub machine_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geo: Option<GeoTag>,
}

impl Resource for DeviceEntity {
    const COLLECTION: &'static str = "DeviceEntity";

    fn key(&self) -> Option<Uuid> {
        self.id
    }

    fn set_key(&mut self, key: Uuid) {
        self.id = Some(key);
    }
}

/// A claim attached to a security user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserClaim {
    #[serde(rename = "type")]
    pub claim_type: String,
    pub value: String,
}

/// A user account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityUser {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
    pub user_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub claims: Vec<UserClaim>,
    /// New password; only sent when changing it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl SecurityUser {
    pub fn new(user_name: impl Into<String>) -> Self {
        Self {
            id: None,
            user_name: user_name.into(),
            email: None,
            roles: Vec::new(),
            claims: Vec::new(),
            password: None,
        }
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r.eq_ignore_ascii_case(role))
    }

    pub fn has_claim(&self, claim_type: &str) -> bool {
        self.claims.iter().any(|c| c.claim_type == claim_type)
    }
}

impl Resource for SecurityUser {
    const COLLECTION: &'static str = "SecurityUser";

    fn key(&self) -> Option<Uuid> {
        self.id
    }

    fn set_key(&mut self, key: Uuid) {
        self.id = Some(key);
    }
}

/// Who did something, from where, and when.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Provenance {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub application: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Resource for Provenance {
    const COLLECTION: &'static str = "SecurityProvenance";

    fn key(&self) -> Option<Uuid> {
        self.id
    }

    fn set_key(&mut self, key: Uuid) {
        self.id = Some(key);
    }
}

/// A named template for business records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateDefinition {
    pub id: Uuid,
    pub mnemonic: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Resource for TemplateDefinition {
    const COLLECTION: &'static str = "TemplateDefinition";

    fn key(&self) -> Option<Uuid> {
        Some(self.id)
    }

    fn set_key(&mut self, key: Uuid) {
        self.id = key;
    }
}

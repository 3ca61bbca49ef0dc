//! Node configuration and the store realm state is committed to.
//!
//! The store itself is an external collaborator; this module defines the
//! contract plus an in-memory and a JSON-file implementation.

use crate::error::{ClientError, ClientResult};
use edgefed_types::{
    ActivityId, DeviceInfo, EndpointDescriptor, EndpointTable, GeoTag, RealmSettings,
    ServiceEndpointType,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Default number of items requested per page.
pub const DEFAULT_PAGE_SIZE: usize = 100;

/// Local configuration of this node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FederationConfig {
    /// This node's own server activity id.
    pub activity_id: ActivityId,
    /// Device name to register upstream.
    pub device_name: String,
    /// Pre-provisioned device secret; generated during join when absent.
    pub device_secret: Option<String>,
    /// Application (client) name.
    pub application_name: String,
    /// Application (client) secret.
    pub application_secret: String,
    /// Items requested per page when enumerating remote queries.
    pub page_size: usize,
    /// Per-call timeout for data requests (seconds).
    pub request_timeout_secs: u64,
    /// Position reported with the device entity, if known.
    pub geo: Option<GeoTag>,
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            activity_id: ActivityId::new(),
            device_name: DeviceInfo::collect().machine_name,
            device_secret: None,
            application_name: "edgefed".to_string(),
            application_secret: String::new(),
            page_size: DEFAULT_PAGE_SIZE,
            request_timeout_secs: 30,
            geo: None,
        }
    }
}

/// Config key holding the node's activity id.
const ACTIVITY_ID_KEY: &str = "activityId";

impl FederationConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Reads the config file at `path`, creating it when missing.
    ///
    /// A file without an activity id gets a generated one written back, so
    /// the node keeps the same id across restarts. Other fields are left as
    /// the operator wrote them.
    pub fn load_or_init(path: impl AsRef<Path>) -> ClientResult<Self> {
        let path = path.as_ref();
        let mut raw = if path.exists() {
            serde_json::from_str(&std::fs::read_to_string(path)?)?
        } else {
            serde_json::Value::Object(serde_json::Map::new())
        };
        let Some(fields) = raw.as_object_mut() else {
            return Err(ClientError::Configuration(format!(
                "{} is not a JSON object",
                path.display()
            )));
        };

        if !fields.contains_key(ACTIVITY_ID_KEY) {
            let id = ActivityId::new();
            fields.insert(ACTIVITY_ID_KEY.to_string(), serde_json::to_value(id)?);
            write_json_atomic(path, &raw)?;
            info!("Assigned activity id {} in {}", id, path.display());
        }
        Ok(serde_json::from_value(raw)?)
    }
}

/// Where realm settings and the endpoint table live.
///
/// Only the realm join writes through this trait.
pub trait ConfigurationStore: Send + Sync {
    /// Current realm settings, if joined.
    fn realm(&self) -> Option<RealmSettings>;

    /// Current endpoint table.
    fn endpoints(&self) -> EndpointTable;

    /// Atomically replaces realm settings and the whole endpoint table.
    fn commit_realm(&self, settings: RealmSettings, endpoints: EndpointTable) -> ClientResult<()>;

    /// Removes realm settings and endpoints.
    fn clear_realm(&self) -> ClientResult<()>;

    /// Descriptor for one service.
    fn endpoint(&self, service: ServiceEndpointType) -> Option<EndpointDescriptor> {
        self.endpoints().get(service).cloned()
    }

    /// Whether a realm has been joined.
    fn is_configured(&self) -> bool {
        self.realm().is_some()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoredRealm {
    #[serde(default)]
    realm: Option<RealmSettings>,
    #[serde(default)]
    endpoints: EndpointTable,
}

/// Configuration store held in memory.
#[derive(Debug, Default)]
pub struct MemoryConfigStore {
    state: RwLock<StoredRealm>,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that already holds a joined realm.
    pub fn joined(settings: RealmSettings, endpoints: EndpointTable) -> Self {
        Self {
            state: RwLock::new(StoredRealm {
                realm: Some(settings),
                endpoints,
            }),
        }
    }
}

impl ConfigurationStore for MemoryConfigStore {
    fn realm(&self) -> Option<RealmSettings> {
        self.state.read().realm.clone()
    }

    fn endpoints(&self) -> EndpointTable {
        self.state.read().endpoints.clone()
    }

    fn commit_realm(&self, settings: RealmSettings, endpoints: EndpointTable) -> ClientResult<()> {
        *self.state.write() = StoredRealm {
            realm: Some(settings),
            endpoints,
        };
        Ok(())
    }

    fn clear_realm(&self) -> ClientResult<()> {
        *self.state.write() = StoredRealm::default();
        Ok(())
    }
}

/// Configuration store persisted as a JSON file.
///
/// Writes go to a sibling temp file which is then renamed over the target.
#[derive(Debug)]
pub struct JsonConfigStore {
    path: PathBuf,
    state: RwLock<StoredRealm>,
}

impl JsonConfigStore {
    /// Opens the store at `path`, starting empty when the file is missing.
    pub fn open(path: impl AsRef<Path>) -> ClientResult<Self> {
        let path = path.as_ref().to_path_buf();
        let state = if path.exists() {
            let json = std::fs::read_to_string(&path)?;
            debug!("Loaded realm configuration from {}", path.display());
            serde_json::from_str(&json)?
        } else {
            StoredRealm::default()
        };

        Ok(Self {
            path,
            state: RwLock::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, state: &StoredRealm) -> ClientResult<()> {
        write_json_atomic(&self.path, state)
    }
}

impl ConfigurationStore for JsonConfigStore {
    fn realm(&self) -> Option<RealmSettings> {
        self.state.read().realm.clone()
    }

    fn endpoints(&self) -> EndpointTable {
        self.state.read().endpoints.clone()
    }

    fn commit_realm(&self, settings: RealmSettings, endpoints: EndpointTable) -> ClientResult<()> {
        let next = StoredRealm {
            realm: Some(settings),
            endpoints,
        };
        let mut guard = self.state.write();
        self.persist(&next)?;
        *guard = next;
        info!("Realm configuration written to {}", self.path.display());
        Ok(())
    }

    fn clear_realm(&self) -> ClientResult<()> {
        let mut guard = self.state.write();
        self.persist(&StoredRealm::default())?;
        *guard = StoredRealm::default();
        Ok(())
    }
}

/// Serializes `value` as pretty JSON next to `path` and renames it into place.
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> ClientResult<()> {
    let json = serde_json::to_string_pretty(value)?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let file_name = path
        .file_name()
        .ok_or_else(|| ClientError::Configuration(format!("not a file path: {}", path.display())))?;
    let tmp = path.with_file_name(format!("{}.tmp", file_name.to_string_lossy()));
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

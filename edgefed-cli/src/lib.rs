//! Node wiring shared by the `edgefed` binary and its tests.
//!
//! Everything a node persists lives in one directory, next to the config
//! file the operator points at.

use anyhow::{Context, Result};
use edgefed_types::ServiceEndpointType;
use edgefed_upstream::{
    ConfigurationStore, FederationConfig, HttpAvailabilityProbe, JsonConfigStore,
    JsonCredentialStore, JsonQueue, OAuthDeviceAuthenticator, RealmJoin, TransportFactory,
};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Files a node keeps beside its config file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodePaths {
    pub config: PathBuf,
    pub realm: PathBuf,
    pub credentials: PathBuf,
    pub queues: PathBuf,
}

impl NodePaths {
    pub fn beside(config: impl AsRef<Path>) -> Self {
        let config = config.as_ref().to_path_buf();
        let dir = config
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        Self {
            realm: dir.join("realm.json"),
            credentials: dir.join("credentials.json"),
            queues: dir.join("queues.json"),
            config,
        }
    }
}

/// Reads the node config, creating it with defaults when missing.
///
/// The node's activity id is assigned on first use and persisted.
pub fn load_config(path: &Path) -> Result<FederationConfig> {
    debug!("Loading config from {:?}", path);
    FederationConfig::load_or_init(path)
        .with_context(|| format!("Invalid config {}", path.display()))
}

/// An opened node: config plus the stores and factory built over it.
pub struct Node {
    pub config: FederationConfig,
    pub paths: NodePaths,
    pub factory: Arc<TransportFactory>,
}

impl Node {
    pub fn open(config_path: impl AsRef<Path>) -> Result<Self> {
        let paths = NodePaths::beside(config_path);
        let config = load_config(&paths.config)?;
        let store = JsonConfigStore::open(&paths.realm).context("Failed to open realm store")?;
        let credentials =
            JsonCredentialStore::open(&paths.credentials).context("Failed to open credential store")?;
        let factory = TransportFactory::new(Arc::new(store), Arc::new(credentials))
            .with_authenticator(Arc::new(OAuthDeviceAuthenticator::new()));
        info!("Opened node {} from {:?}", config.device_name, paths.config);
        Ok(Self {
            config,
            paths,
            factory: Arc::new(factory),
        })
    }

    pub fn is_joined(&self) -> bool {
        self.factory.config().is_configured()
    }

    pub fn realm_join(&self) -> RealmJoin {
        RealmJoin::new(Arc::clone(&self.factory), self.config.clone())
    }

    pub fn open_queue(&self) -> Result<JsonQueue> {
        JsonQueue::open(&self.paths.queues).context("Failed to open queue file")
    }

    /// Pings every configured endpoint.
    pub async fn status(&self) -> Vec<EndpointStatus> {
        let probe = HttpAvailabilityProbe::new(Arc::clone(&self.factory));
        let endpoints = self.factory.config().endpoints();
        let mut statuses = Vec::with_capacity(endpoints.len());
        for descriptor in endpoints.iter() {
            let service = descriptor.service();
            statuses.push(EndpointStatus {
                service,
                url: descriptor.primary_url().to_string(),
                latency: probe.latency(service).await,
            });
        }
        statuses
    }
}

/// Reachability of one upstream endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointStatus {
    pub service: ServiceEndpointType,
    pub url: String,
    pub latency: Option<Duration>,
}

impl EndpointStatus {
    pub fn is_reachable(&self) -> bool {
        self.latency.is_some()
    }
}

impl fmt::Display for EndpointStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let service = self.service.to_string();
        match self.latency {
            Some(latency) => write!(f, "{:<15} {}  {} ms", service, self.url, latency.as_millis()),
            None => write!(f, "{:<15} {}  unreachable", service, self.url),
        }
    }
}

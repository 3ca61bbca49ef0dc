//! Upstream federation client for EdgeFed.
//!
//! An edge node keeps working on its own data and talks to an upstream
//! realm when it can. This crate is the client side of that relationship:
//!
//! - joining a realm (device registration, optional mTLS enrollment)
//! - building authenticated transports for the acting principal
//! - lazy, paginated remote queries
//! - typed repositories with conditional reads and template harmonization
//! - routing security calls between the local store and upstream
//! - a durable outbound queue drained to upstream in batches
//!
//! # Architecture
//!
//! ## Components
//!
//! - **Transport**: per-call HTTP channel bound to one endpoint and principal
//! - **Join**: one-shot handshake that produces realm settings and endpoints
//! - **Query**: immutable cursors enumerated page by page
//! - **Repository**: CRUD bridge over upstream collections
//! - **Router**: local vs upstream decision per call
//! - **Queue**: store-and-forward dispatch with dead-lettering
//!
//! ## Principals
//!
//! Calls act as an explicit principal when one is given, otherwise as the
//! ambient principal installed with [`AuthContext::scope`]. Work done as
//! the system principal is sent upstream as this node's device once a realm
//! is joined.
//!
//! # Example
//!
//! ```no_run
//! use edgefed_types::{Identity, Principal};
//! use edgefed_upstream::{
//!     FederationConfig, JoinRequest, MemoryConfigStore, MemoryCredentialStore, RealmJoin,
//!     TransportFactory,
//! };
//! use std::sync::Arc;
//!
//! # async fn run() -> edgefed_upstream::ClientResult<()> {
//! let factory = Arc::new(TransportFactory::new(
//!     Arc::new(MemoryConfigStore::new()),
//!     Arc::new(MemoryCredentialStore::new()),
//! ));
//! let join = RealmJoin::new(Arc::clone(&factory), FederationConfig::default());
//!
//! let admin = Principal::User(Identity::with_secret("administrator", "secret"));
//! join.join(JoinRequest::new("https://hub.example.org", admin)).await?;
//! # Ok(())
//! # }
//! ```

pub mod availability;
pub mod config;
mod context;
pub mod credential;
mod error;
pub mod join;
pub mod model;
pub mod query;
pub mod queue;
pub mod repository;
pub mod router;
pub mod transport;

pub use availability::{AvailabilityProbe, HttpAvailabilityProbe};
pub use config::{
    ConfigurationStore, FederationConfig, JsonConfigStore, MemoryConfigStore, DEFAULT_PAGE_SIZE,
};
pub use context::AuthContext;
pub use credential::{ClientCertificate, CredentialStore, JsonCredentialStore, MemoryCredentialStore};
pub use error::{ClientError, ClientResult};
pub use join::{JoinRequest, JoinState, RealmEvent, RealmJoin};
pub use model::{Bundle, Resource, TemplateRef};
pub use query::{Filter, QueryCursor, QueryPager, RemoteQuery, SortDirection};
pub use queue::{DispatchQueue, DispatchReport, DurableQueue, JsonQueue, MemoryQueue, QueueEntry};
pub use repository::{
    MemoryRepository, MemoryResourceCache, Repository, ResourceCache, TemplateKeyCache,
    UpstreamRepository,
};
pub use router::{SecurityRouter, LOCAL_ONLY_CLAIM, LOCAL_USERS};
pub use transport::{
    Conditional, DeviceAuthenticator, Fetched, OAuthDeviceAuthenticator, Transport,
    TransportFactory, PROBE_TIMEOUT,
};

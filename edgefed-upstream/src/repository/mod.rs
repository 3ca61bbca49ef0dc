//! Repository bridge: typed CRUD over upstream collections.
//!
//! [`UpstreamRepository`] reads through a [`ResourceCache`] using conditional
//! GETs, harmonizes template references before writes and hands out lazy
//! [`RemoteQuery`]s. [`MemoryRepository`] offers the same [`Repository`]
//! surface for local data.

mod cache;
mod local;
mod template;

pub use cache::{CachedEntry, MemoryResourceCache, ResourceCache};
pub use local::MemoryRepository;
pub use template::TemplateKeyCache;

use crate::config::DEFAULT_PAGE_SIZE;
use crate::error::{ClientError, ClientResult};
use crate::model::{Bundle, Resource, BUNDLE_COLLECTION};
use crate::query::{Filter, RemoteQuery};
use crate::transport::{Conditional, Fetched, Transport, TransportFactory};
use async_trait::async_trait;
use edgefed_types::{Principal, ServiceEndpointType};
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// CRUD over one resource type.
#[async_trait]
pub trait Repository<T: Resource>: Send + Sync {
    /// Fetches by key; `None` when it does not exist.
    async fn get(&self, key: Uuid) -> ClientResult<Option<T>>;

    /// Creates a record.
    async fn insert(&self, item: T) -> ClientResult<T>;

    /// Creates or replaces a record, assigning a key if it has none.
    async fn save(&self, item: T) -> ClientResult<T>;

    /// Removes a record, returning it if it existed.
    async fn delete(&self, key: Uuid) -> ClientResult<Option<T>>;

    /// All records matching `filter`.
    async fn find(&self, filter: Filter) -> ClientResult<Vec<T>>;
}

/// Repository backed by an upstream collection.
pub struct UpstreamRepository<T> {
    factory: Arc<TransportFactory>,
    cache: Arc<dyn ResourceCache>,
    templates: Arc<TemplateKeyCache>,
    service: ServiceEndpointType,
    acting: Option<Principal>,
    page_size: usize,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for UpstreamRepository<T> {
    fn clone(&self) -> Self {
        Self {
            factory: Arc::clone(&self.factory),
            cache: Arc::clone(&self.cache),
            templates: Arc::clone(&self.templates),
            service: self.service,
            acting: self.acting.clone(),
            page_size: self.page_size,
            _marker: PhantomData,
        }
    }
}

impl<T: Resource> UpstreamRepository<T> {
    /// A repository on the health-data service acting as the ambient principal.
    pub fn new(
        factory: Arc<TransportFactory>,
        cache: Arc<dyn ResourceCache>,
        templates: Arc<TemplateKeyCache>,
    ) -> Self {
        Self {
            factory,
            cache,
            templates,
            service: ServiceEndpointType::HealthData,
            acting: None,
            page_size: DEFAULT_PAGE_SIZE,
            _marker: PhantomData,
        }
    }

    /// Targets another upstream service.
    #[must_use]
    pub fn with_service(mut self, service: ServiceEndpointType) -> Self {
        self.service = service;
        self
    }

    /// Acts as `principal` instead of the ambient principal.
    #[must_use]
    pub fn acting_as(mut self, principal: Principal) -> Self {
        self.acting = Some(principal);
        self
    }

    #[must_use]
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn service(&self) -> ServiceEndpointType {
        self.service
    }

    pub fn factory(&self) -> &Arc<TransportFactory> {
        &self.factory
    }

    /// Whether the realm is joined with an endpoint for this repository's service.
    pub fn is_configured(&self) -> bool {
        self.factory.is_configured(self.service)
    }

    async fn transport(&self) -> ClientResult<Transport> {
        self.factory.transport(self.service, self.acting.as_ref()).await
    }

    fn path(key: Uuid) -> String {
        format!("{}/{}", T::COLLECTION, key)
    }

    fn remember(&self, fetched: &Fetched<T>) -> ClientResult<()> {
        if let Some(key) = fetched.value.key() {
            self.cache.put(
                T::COLLECTION,
                key,
                CachedEntry {
                    value: serde_json::to_value(&fetched.value)?,
                    revision: fetched.revision.clone(),
                },
            );
        }
        Ok(())
    }

    /// Fetches by key, revalidating any cached copy.
    pub async fn get(&self, key: Uuid) -> ClientResult<Option<T>> {
        let path = Self::path(key);
        let transport = self.transport().await?;

        let cached = self
            .cache
            .get(T::COLLECTION, key)
            .and_then(|entry| entry.revision.clone().map(|rev| (entry.value, rev)));

        let outcome = match cached {
            Some((value, revision)) => match transport.get_conditional::<T>(&path, &revision).await {
                Ok(Conditional::NotModified) => {
                    debug!("{} not modified since {}", path, revision);
                    return Ok(Some(serde_json::from_value(value)?));
                }
                Ok(Conditional::Modified(fetched)) => Ok(fetched),
                Err(e) => Err(e),
            },
            None => transport.get::<T>(&path, &[]).await,
        };

        match outcome {
            Ok(fetched) => {
                self.remember(&fetched)?;
                Ok(Some(fetched.value))
            }
            Err(ClientError::NotFound(_)) => {
                self.cache.remove(T::COLLECTION, key);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Fetches one historical version of a record.
    pub async fn get_version(&self, key: Uuid, version: &str) -> ClientResult<Option<T>> {
        let path = format!("{}/_history/{}", Self::path(key), version);
        match self.transport().await?.get::<T>(&path, &[]).await {
            Ok(fetched) => Ok(Some(fetched.value)),
            Err(ClientError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// POSTs a new record to the collection.
    pub async fn insert(&self, mut item: T) -> ClientResult<T> {
        self.templates.harmonize(&self.factory, &mut item).await?;
        let fetched = self
            .transport()
            .await?
            .post::<T, T>(T::COLLECTION, &item)
            .await?;
        self.remember(&fetched)?;
        Ok(fetched.value)
    }

    /// PUTs a record at its key, assigning one first if needed.
    pub async fn save(&self, mut item: T) -> ClientResult<T> {
        self.templates.harmonize(&self.factory, &mut item).await?;
        let key = match item.key() {
            Some(key) => key,
            None => {
                let key = Uuid::now_v7();
                item.set_key(key);
                key
            }
        };
        let fetched = self
            .transport()
            .await?
            .put::<T, T>(&Self::path(key), &item)
            .await?;
        self.remember(&fetched)?;
        Ok(fetched.value)
    }

    /// Removes a record upstream. The cached copy is dropped either way.
    pub async fn delete(&self, key: Uuid) -> ClientResult<Option<T>> {
        let path = Self::path(key);
        let outcome = async { self.transport().await?.delete::<T>(&path).await }.await;
        self.cache.remove(T::COLLECTION, key);
        match outcome {
            Ok(deleted) => Ok(deleted),
            Err(ClientError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Submits several records as one bundle.
    pub async fn insert_all(&self, mut items: Vec<T>) -> ClientResult<Vec<T>> {
        for item in &mut items {
            self.templates.harmonize(&self.factory, item).await?;
        }
        debug!("Submitting bundle of {} {}", items.len(), T::COLLECTION);
        let fetched = self
            .transport()
            .await?
            .post::<Bundle<T>, Bundle<T>>(BUNDLE_COLLECTION, &Bundle::new(items))
            .await?;
        Ok(fetched.value.resource)
    }

    /// Takes the edit lock on a record.
    pub async fn checkout(&self, key: Uuid) -> ClientResult<()> {
        self.transport().await?.checkout(&Self::path(key)).await
    }

    /// Releases the edit lock on a record.
    pub async fn checkin(&self, key: Uuid) -> ClientResult<()> {
        self.transport().await?.checkin(&Self::path(key)).await
    }

    /// A lazy query over the collection.
    pub fn query(&self) -> RemoteQuery<T> {
        RemoteQuery::new(
            Arc::clone(&self.factory),
            self.service,
            self.acting.clone(),
            self.page_size,
        )
    }
}

#[async_trait]
impl<T: Resource> Repository<T> for UpstreamRepository<T> {
    async fn get(&self, key: Uuid) -> ClientResult<Option<T>> {
        UpstreamRepository::get(self, key).await
    }

    async fn insert(&self, item: T) -> ClientResult<T> {
        UpstreamRepository::insert(self, item).await
    }

    async fn save(&self, item: T) -> ClientResult<T> {
        UpstreamRepository::save(self, item).await
    }

    async fn delete(&self, key: Uuid) -> ClientResult<Option<T>> {
        UpstreamRepository::delete(self, key).await
    }

    async fn find(&self, filter: Filter) -> ClientResult<Vec<T>> {
        self.query().filter(filter).to_vec().await
    }
}

//! Template harmonization: mnemonic to upstream template id.
//!
//! Business records refer to templates by mnemonic. Upstream wants the id.
//! Ids are resolved once per mnemonic for the lifetime of the cache; callers
//! racing on the same mnemonic share a single lookup.

use crate::context::AuthContext;
use crate::error::{ClientError, ClientResult};
use crate::model::{Bundle, Resource, TemplateDefinition};
use crate::transport::TransportFactory;
use dashmap::DashMap;
use edgefed_types::ServiceEndpointType;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::debug;
use uuid::Uuid;

/// Process-wide mnemonic → template id map. Entries are never evicted.
#[derive(Debug, Default)]
pub struct TemplateKeyCache {
    entries: DashMap<String, Arc<OnceCell<Uuid>>>,
}

impl TemplateKeyCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolved id for `mnemonic`, without any lookup.
    pub fn get(&self, mnemonic: &str) -> Option<Uuid> {
        self.entries
            .get(mnemonic)
            .and_then(|cell| cell.get().copied())
    }

    /// Number of resolved mnemonics.
    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| e.value().initialized()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Records a known id. No effect if the mnemonic is already resolved.
    pub fn prime(&self, mnemonic: &str, id: Uuid) {
        let _ = self.cell(mnemonic).set(id);
    }

    fn cell(&self, mnemonic: &str) -> Arc<OnceCell<Uuid>> {
        Arc::clone(&self.entries.entry(mnemonic.to_string()).or_default())
    }

    /// Resolves `mnemonic`, querying upstream as the system principal on a miss.
    pub async fn resolve(&self, factory: &TransportFactory, mnemonic: &str) -> ClientResult<Uuid> {
        let cell = self.cell(mnemonic);
        let id = cell
            .get_or_try_init(|| async {
                let definitions = AuthContext::as_system(Self::lookup(factory, mnemonic)).await?;
                for definition in &definitions {
                    if definition.mnemonic != mnemonic {
                        self.prime(&definition.mnemonic, definition.id);
                    }
                }
                definitions
                    .iter()
                    .find(|d| d.mnemonic == mnemonic)
                    .map(|d| d.id)
                    .ok_or_else(|| ClientError::NotFound(format!("template {mnemonic}")))
            })
            .await?;
        Ok(*id)
    }

    async fn lookup(
        factory: &TransportFactory,
        mnemonic: &str,
    ) -> ClientResult<Vec<TemplateDefinition>> {
        debug!("Resolving template {}", mnemonic);
        let transport = factory
            .transport(ServiceEndpointType::HealthData, None)
            .await?;
        let query = [("mnemonic".to_string(), mnemonic.to_string())];
        let bundle = transport
            .get::<Bundle<TemplateDefinition>>(TemplateDefinition::COLLECTION, &query)
            .await?;
        Ok(bundle.value.resource)
    }

    /// Fills in the template id of `item` if it carries an unresolved reference.
    pub async fn harmonize<T: Resource>(
        &self,
        factory: &TransportFactory,
        item: &mut T,
    ) -> ClientResult<()> {
        let Some(template) = item.template_mut() else {
            return Ok(());
        };
        if template.is_resolved() {
            return Ok(());
        }
        let id = self.resolve(factory, &template.mnemonic).await?;
        template.id = Some(id);
        Ok(())
    }
}

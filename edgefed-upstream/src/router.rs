//! Per-call routing between the local store and upstream.
//!
//! Security data lives in two places: this node's local store and the
//! upstream realm. Users provisioned only on this node are flagged as such
//! and never leave it. Everything else goes upstream whenever upstream is
//! reachable, and falls back to local otherwise.

use crate::availability::AvailabilityProbe;
use crate::error::{ClientError, ClientResult};
use crate::model::{Provenance, SecurityUser};
use crate::query::Filter;
use crate::repository::Repository;
use edgefed_types::ServiceEndpointType;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Claim marking a user as existing on this node only.
pub const LOCAL_ONLY_CLAIM: &str = "urn:edgefed:claim:local-only";

/// Role whose members exist on this node only.
pub const LOCAL_USERS: &str = "LOCAL_USERS";

/// Where a call was served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Local,
    Upstream,
}

/// Whether `user` must stay on this node.
pub fn is_local_only(user: &SecurityUser) -> bool {
    user.has_claim(LOCAL_ONLY_CLAIM) || user.has_role(LOCAL_USERS)
}

/// Routes security user and provenance calls.
pub struct SecurityRouter {
    local_users: Arc<dyn Repository<SecurityUser>>,
    remote_users: Arc<dyn Repository<SecurityUser>>,
    local_provenance: Arc<dyn Repository<Provenance>>,
    remote_provenance: Arc<dyn Repository<Provenance>>,
    probe: Arc<dyn AvailabilityProbe>,
    service: ServiceEndpointType,
}

impl SecurityRouter {
    pub fn new(
        local_users: Arc<dyn Repository<SecurityUser>>,
        remote_users: Arc<dyn Repository<SecurityUser>>,
        local_provenance: Arc<dyn Repository<Provenance>>,
        remote_provenance: Arc<dyn Repository<Provenance>>,
        probe: Arc<dyn AvailabilityProbe>,
    ) -> Self {
        Self {
            local_users,
            remote_users,
            local_provenance,
            remote_provenance,
            probe,
            service: ServiceEndpointType::Administration,
        }
    }

    async fn upstream_available(&self) -> bool {
        self.probe.is_available(self.service).await
    }

    async fn route_for(&self, local_record: Option<&SecurityUser>) -> Route {
        if local_record.is_some_and(is_local_only) {
            return Route::Local;
        }
        if self.upstream_available().await {
            Route::Upstream
        } else {
            Route::Local
        }
    }

    /// Local record for a user name.
    pub async fn find_local_user(&self, user_name: &str) -> ClientResult<Option<SecurityUser>> {
        Ok(self
            .local_users
            .find(Filter::eq("userName", user_name))
            .await?
            .into_iter()
            .next())
    }

    /// Where a call about `key` would be served right now.
    pub async fn route_user(&self, key: Uuid) -> ClientResult<Route> {
        let local = self.local_users.get(key).await?;
        Ok(self.route_for(local.as_ref()).await)
    }

    pub async fn get_user(&self, key: Uuid) -> ClientResult<Option<SecurityUser>> {
        let local = self.local_users.get(key).await?;
        match self.route_for(local.as_ref()).await {
            Route::Local => Ok(local),
            Route::Upstream => self.remote_users.get(key).await,
        }
    }

    pub async fn save_user(&self, user: SecurityUser) -> ClientResult<SecurityUser> {
        let existing = match user.id {
            Some(key) => self.local_users.get(key).await?,
            None => None,
        };
        let local_only = is_local_only(&user) || existing.as_ref().is_some_and(is_local_only);
        if local_only || !self.upstream_available().await {
            debug!("Saving user {} locally", user.user_name);
            return self.local_users.save(user).await;
        }
        self.remote_users.save(user).await
    }

    pub async fn delete_user(&self, key: Uuid) -> ClientResult<Option<SecurityUser>> {
        let local = self.local_users.get(key).await?;
        match self.route_for(local.as_ref()).await {
            Route::Local => self.local_users.delete(key).await,
            Route::Upstream => self.remote_users.delete(key).await,
        }
    }

    /// Provenance matching `filter`; local and upstream results are merged
    /// by key when upstream is reachable.
    ///
    /// An upstream failure after a successful probe is returned as an error.
    pub async fn find_provenance(&self, filter: Filter) -> ClientResult<Vec<Provenance>> {
        let mut results = self.local_provenance.find(filter.clone()).await?;
        if !self.upstream_available().await {
            return Ok(results);
        }

        let remote = self.remote_provenance.find(filter).await.inspect_err(|e| {
            warn!("Upstream provenance lookup failed: {}", e);
        })?;

        let mut seen: HashSet<Uuid> = results.iter().filter_map(|p| p.id).collect();
        for record in remote {
            match record.id {
                Some(id) if !seen.insert(id) => {}
                _ => results.push(record),
            }
        }
        Ok(results)
    }

    /// Changes a password locally, then upstream unless the user is local-only
    /// or upstream is unreachable.
    pub async fn change_password(&self, user_name: &str, password: &str) -> ClientResult<Route> {
        let mut local = self
            .find_local_user(user_name)
            .await?
            .ok_or_else(|| ClientError::NotFound(format!("user {user_name}")))?;
        let local_only = is_local_only(&local);
        local.password = Some(password.to_string());
        self.local_users.save(local).await?;

        if local_only || !self.upstream_available().await {
            info!("Password for {} changed locally", user_name);
            return Ok(Route::Local);
        }

        let mut remote = self
            .remote_users
            .find(Filter::eq("userName", user_name))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| ClientError::NotFound(format!("upstream user {user_name}")))?;
        remote.password = Some(password.to_string());
        self.remote_users.save(remote).await?;
        info!("Password for {} changed locally and upstream", user_name);
        Ok(Route::Upstream)
    }
}

//! Config-backed tenant repository.
//!
//! Seeded from the `[tenants]` tables at startup. Mutations live for the
//! lifetime of the process only.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::{
    db::{
        error::{DbError, DbResult},
        repos::{TenantRepo, prepare_idp},
    },
    models::{IdpConfig, Tenant, normalize_host},
};

#[derive(Default)]
pub struct StaticTenantRepo {
    tenants: RwLock<BTreeMap<String, Tenant>>,
}

impl StaticTenantRepo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from already-validated descriptors.
    pub fn from_configs(idps: impl IntoIterator<Item = IdpConfig>) -> DbResult<Self> {
        let mut tenants = BTreeMap::new();
        for idp in idps {
            let idp = prepare_idp(idp)?;
            tenants.insert(idp.key.clone(), Tenant::new(idp));
        }
        Ok(Self {
            tenants: RwLock::new(tenants),
        })
    }
}

#[async_trait]
impl TenantRepo for StaticTenantRepo {
    async fn create(&self, idp: IdpConfig) -> DbResult<Tenant> {
        let idp = prepare_idp(idp)?;
        let mut tenants = self.tenants.write().await;
        if tenants.contains_key(&idp.key) {
            return Err(DbError::Conflict(format!(
                "Tenant with key '{}' already exists",
                idp.key
            )));
        }
        let tenant = Tenant::new(idp);
        tenants.insert(tenant.key().to_string(), tenant.clone());
        Ok(tenant)
    }

    async fn find_by_key(&self, key: &str) -> DbResult<Option<Tenant>> {
        let tenants = self.tenants.read().await;
        Ok(tenants.get(key).filter(|t| !t.is_deleted()).cloned())
    }

    async fn find_by_host(&self, host: &str) -> DbResult<Option<Tenant>> {
        let host = normalize_host(host);
        let tenants = self.tenants.read().await;
        Ok(tenants
            .values()
            .find(|t| !t.is_deleted() && t.idp.hosts.iter().any(|h| *h == host))
            .cloned())
    }

    async fn list(&self, include_deleted: bool) -> DbResult<Vec<Tenant>> {
        let tenants = self.tenants.read().await;
        Ok(tenants
            .values()
            .filter(|t| include_deleted || !t.is_deleted())
            .cloned()
            .collect())
    }

    async fn delete(&self, key: &str) -> DbResult<()> {
        let mut tenants = self.tenants.write().await;
        match tenants.get_mut(key) {
            Some(tenant) if !tenant.is_deleted() => {
                let now = Utc::now();
                tenant.deleted_at = Some(now);
                tenant.updated_at = now;
                Ok(())
            }
            _ => Err(DbError::NotFound),
        }
    }

    async fn restore(&self, key: &str) -> DbResult<Tenant> {
        let mut tenants = self.tenants.write().await;
        match tenants.get_mut(key) {
            Some(tenant) if tenant.is_deleted() => {
                tenant.deleted_at = None;
                tenant.updated_at = Utc::now();
                Ok(tenant.clone())
            }
            _ => Err(DbError::NotFound),
        }
    }
}

use async_trait::async_trait;

use crate::{
    db::error::{DbError, DbResult},
    models::{IdpConfig, Tenant, normalize_host},
};

/// Tenant (IdP descriptor) storage.
///
/// Lookups by key or host only see tenants that are not soft-deleted;
/// disabled tenants are returned and filtered by the caller.
#[async_trait]
pub trait TenantRepo: Send + Sync {
    /// Fails with `Conflict` if the key is taken, including by a deleted tenant.
    async fn create(&self, idp: IdpConfig) -> DbResult<Tenant>;
    async fn find_by_key(&self, key: &str) -> DbResult<Option<Tenant>>;
    async fn find_by_host(&self, host: &str) -> DbResult<Option<Tenant>>;
    async fn list(&self, include_deleted: bool) -> DbResult<Vec<Tenant>>;
    /// Soft delete. `NotFound` if no live tenant has this key.
    async fn delete(&self, key: &str) -> DbResult<()>;
    /// `NotFound` if no deleted tenant has this key.
    async fn restore(&self, key: &str) -> DbResult<Tenant>;
}

/// Validate a descriptor and normalize its hosts for storage.
pub(crate) fn prepare_idp(mut idp: IdpConfig) -> DbResult<IdpConfig> {
    idp.validate().map_err(DbError::Validation)?;
    idp.hosts = idp.hosts.iter().map(|h| normalize_host(h)).collect();
    idp.hosts.dedup();
    Ok(idp)
}

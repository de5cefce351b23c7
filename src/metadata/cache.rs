//! IdP metadata cache.
//!
//! Tenants that publish a `metadata_url` get their signing certificates and
//! endpoints from it. Fetching happens only in [`IdpMetadataCache::refresh`]
//! and the background refresher; request handling reads the cache and never
//! waits on the network.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use dashmap::DashMap;

use super::{IdpMetadata, MetadataError, parse_idp_metadata};
use crate::{config::MetadataCacheConfig, db::TenantRepo, models::IdpConfig};

pub struct IdpMetadataCache {
    http_client: reqwest::Client,
    entries: DashMap<String, Arc<IdpMetadata>>,
    ttl: chrono::Duration,
    fetch_timeout: Duration,
    allow_http: bool,
}

impl IdpMetadataCache {
    pub fn new(config: &MetadataCacheConfig) -> Self {
        Self::with_client(config, reqwest::Client::new())
    }

    pub fn with_client(config: &MetadataCacheConfig, http_client: reqwest::Client) -> Self {
        Self {
            http_client,
            entries: DashMap::new(),
            ttl: chrono::Duration::seconds(config.ttl_secs as i64),
            fetch_timeout: Duration::from_secs(config.fetch_timeout_secs),
            allow_http: config.allow_http,
        }
    }

    /// Cached metadata for a tenant, if present and younger than the TTL.
    pub fn get(&self, idp_key: &str) -> Option<Arc<IdpMetadata>> {
        let entry = self.entries.get(idp_key)?;
        if Utc::now() - entry.fetched_at < self.ttl {
            Some(entry.clone())
        } else {
            None
        }
    }

    pub fn insert(&self, idp_key: impl Into<String>, metadata: IdpMetadata) {
        self.entries.insert(idp_key.into(), Arc::new(metadata));
    }

    pub fn remove(&self, idp_key: &str) {
        self.entries.remove(idp_key);
    }

    /// Fetch and cache a tenant's metadata.
    ///
    /// On failure the previous entry, if any, is kept and simply ages out.
    pub async fn refresh(&self, idp: &IdpConfig) -> Result<Arc<IdpMetadata>, MetadataError> {
        let Some(metadata_url) = &idp.metadata_url else {
            return Err(MetadataError::Invalid(format!(
                "tenant '{}' has no metadata URL",
                idp.key
            )));
        };
        self.check_url(metadata_url)?;

        tracing::debug!(idp_key = %idp.key, url = %metadata_url, "Fetching SAML IdP metadata");

        let response = self
            .http_client
            .get(metadata_url)
            .timeout(self.fetch_timeout)
            .send()
            .await
            .map_err(|e| {
                tracing::warn!(idp_key = %idp.key, error = %e, "Failed to fetch SAML metadata");
                MetadataError::Fetch(e.to_string())
            })?;

        let status = response.status();
        if !status.is_success() {
            tracing::warn!(idp_key = %idp.key, status = %status, "SAML metadata endpoint returned error");
            return Err(MetadataError::Fetch(format!("metadata returned {status}")));
        }

        let xml = response
            .text()
            .await
            .map_err(|e| MetadataError::Fetch(e.to_string()))?;

        let expected = Some(idp.entity_id.as_str()).filter(|e| !e.is_empty());
        let metadata = Arc::new(parse_idp_metadata(&xml, expected)?);

        tracing::info!(
            idp_key = %idp.key,
            certificates = metadata.signing_certificates.len(),
            "Cached SAML IdP metadata"
        );
        self.entries.insert(idp.key.clone(), metadata.clone());
        Ok(metadata)
    }

    /// Refresh every active tenant that has a metadata URL. Returns how many
    /// refreshed successfully.
    pub async fn refresh_all(&self, repo: &dyn TenantRepo) -> usize {
        let tenants = match repo.list(false).await {
            Ok(tenants) => tenants,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to list tenants for metadata refresh");
                return 0;
            }
        };

        let mut refreshed = 0;
        for tenant in tenants.iter().filter(|t| t.is_active()) {
            if tenant.idp.metadata_url.is_none() {
                continue;
            }
            match self.refresh(&tenant.idp).await {
                Ok(_) => refreshed += 1,
                Err(e) => {
                    tracing::warn!(
                        idp_key = %tenant.key(),
                        error = %e,
                        "SAML metadata refresh failed, keeping existing data"
                    );
                }
            }
        }
        refreshed
    }

    fn check_url(&self, metadata_url: &str) -> Result<(), MetadataError> {
        let url = url::Url::parse(metadata_url)
            .map_err(|e| MetadataError::InsecureUrl(format!("{metadata_url}: {e}")))?;
        match url.scheme() {
            "https" => Ok(()),
            "http" if self.allow_http => Ok(()),
            scheme => Err(MetadataError::InsecureUrl(format!(
                "scheme '{scheme}' is not allowed"
            ))),
        }
    }
}

/// Starts the metadata refresh worker as a background task.
///
/// Runs an initial refresh immediately, then one per `interval`, until the
/// returned handle is aborted.
pub fn spawn_metadata_refresher(
    cache: Arc<IdpMetadataCache>,
    repo: Arc<dyn TenantRepo>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tracing::info!(
        refresh_interval_secs = interval.as_secs(),
        "Starting SAML metadata refresh worker"
    );
    tokio::spawn(async move {
        loop {
            let refreshed = cache.refresh_all(repo.as_ref()).await;
            tracing::debug!(refreshed, "SAML metadata refresh pass complete");
            tokio::time::sleep(interval).await;
        }
    })
}

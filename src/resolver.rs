//! Tenant (IdP) resolution.
//!
//! Each inbound request is mapped to exactly one tenant from request-side
//! hints only: an explicit key, the route path, or the host. Content of the
//! SAML message itself never selects the tenant. The result is a
//! [`ResolvedContext`] owned by the request; nothing is remembered between
//! requests.

use std::sync::Arc;

use crate::{
    config::{SamlConfig, SpConfig},
    db::TenantRepo,
    error::SamlError,
    metadata::{IdpMetadata, IdpMetadataCache},
    models::IdpConfig,
    xml::TrustAnchors,
};

/// Request attributes used to pick a tenant.
#[derive(Debug, Clone, Default)]
pub struct RequestHints {
    /// A tenant key passed explicitly, e.g. a query parameter.
    pub explicit_key: Option<String>,
    pub path: Option<String>,
    pub host: Option<String>,
    /// `X-Forwarded-Host`, honored only when `proxy_vars` is set.
    pub forwarded_host: Option<String>,
}

impl RequestHints {
    pub fn key(key: impl Into<String>) -> Self {
        Self {
            explicit_key: Some(key.into()),
            ..Default::default()
        }
    }

    pub fn path(path: impl Into<String>) -> Self {
        Self {
            path: Some(path.into()),
            ..Default::default()
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn with_forwarded_host(mut self, host: impl Into<String>) -> Self {
        self.forwarded_host = Some(host.into());
        self
    }
}

/// SP endpoints as seen by one tenant's IdP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpEndpoints {
    pub entity_id: String,
    pub acs_url: String,
    pub sls_url: Option<String>,
    pub metadata_url: String,
}

/// The outcome of resolving one request.
///
/// Lives for the duration of that request and is passed explicitly to the
/// request builder, the validator and the session binding.
#[derive(Debug, Clone)]
pub struct ResolvedContext {
    pub idp_key: String,
    pub idp: Arc<IdpConfig>,
    pub sp: Arc<SpEndpoints>,
}

impl ResolvedContext {
    /// Trust material for this tenant. Fails closed when none is available.
    pub fn trust_anchors(&self) -> Result<TrustAnchors, SamlError> {
        self.idp.trust_anchors()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HintSource {
    Explicit,
    Path,
    Host,
    Default,
}

impl HintSource {
    fn as_str(&self) -> &'static str {
        match self {
            HintSource::Explicit => "explicit",
            HintSource::Path => "path",
            HintSource::Host => "host",
            HintSource::Default => "default",
        }
    }
}

pub struct IdpResolver {
    repo: Arc<dyn TenantRepo>,
    metadata: Option<Arc<IdpMetadataCache>>,
    routes_prefix: String,
    base_url: Option<String>,
    default_tenant: Option<String>,
    proxy_vars: bool,
    sp: SpConfig,
}

impl IdpResolver {
    pub fn new(
        config: &SamlConfig,
        repo: Arc<dyn TenantRepo>,
        metadata: Option<Arc<IdpMetadataCache>>,
    ) -> Self {
        Self {
            repo,
            metadata,
            routes_prefix: config.routes_prefix.trim_matches('/').to_string(),
            base_url: config
                .base_url
                .as_deref()
                .map(|b| b.trim_end_matches('/').to_string()),
            default_tenant: config.default_tenant.clone(),
            proxy_vars: config.proxy_vars,
            sp: config.sp.clone(),
        }
    }

    pub fn repo(&self) -> &Arc<dyn TenantRepo> {
        &self.repo
    }

    /// Whether a request path is under the SAML routes prefix.
    pub fn applies_to(&self, path: &str) -> bool {
        self.route_remainder(path).is_some()
    }

    /// Tenant key from `/{prefix}/{key}/...`.
    pub fn key_from_path(&self, path: &str) -> Option<String> {
        let rest = self.route_remainder(path)?;
        rest.split('/')
            .find(|s| !s.is_empty())
            .map(|s| s.to_string())
    }

    fn route_remainder<'a>(&self, path: &'a str) -> Option<&'a str> {
        let path = path.split(['?', '#']).next().unwrap_or_default();
        let path = path.trim_start_matches('/');
        if self.routes_prefix.is_empty() {
            return Some(path);
        }
        let rest = path.strip_prefix(self.routes_prefix.as_str())?;
        if rest.is_empty() || rest.starts_with('/') {
            Some(rest)
        } else {
            None
        }
    }

    /// Resolve the tenant for a request.
    ///
    /// Hints are tried in order: explicit key, route path, host, then the
    /// configured default tenant. The first hint present decides; a hint that
    /// names an unknown, disabled or deleted tenant yields
    /// `ResolutionNotFound` rather than falling through to the next one.
    pub async fn resolve(&self, hints: &RequestHints) -> Result<ResolvedContext, SamlError> {
        let (source, tenant) = if let Some(key) = &hints.explicit_key {
            (HintSource::Explicit, self.repo.find_by_key(key).await?)
        } else if let Some(key) = hints.path.as_deref().and_then(|p| self.key_from_path(p)) {
            (HintSource::Path, self.repo.find_by_key(&key).await?)
        } else if let Some(host) = self.effective_host(hints) {
            match self.repo.find_by_host(host).await? {
                Some(tenant) => (HintSource::Host, Some(tenant)),
                None => self.default_tenant().await?,
            }
        } else {
            self.default_tenant().await?
        };

        let Some(tenant) = tenant.filter(|t| t.is_active()) else {
            let described = describe_hints(hints);
            tracing::debug!(source = source.as_str(), hints = %described, "No SAML tenant resolved");
            return Err(SamlError::ResolutionNotFound(described));
        };

        let idp = self.with_metadata(tenant.idp)?;
        let sp = self.sp_endpoints(&idp.key);

        tracing::debug!(idp_key = %idp.key, source = source.as_str(), "Resolved SAML tenant");

        Ok(ResolvedContext {
            idp_key: idp.key.clone(),
            idp: Arc::new(idp),
            sp: Arc::new(sp),
        })
    }

    fn effective_host<'a>(&self, hints: &'a RequestHints) -> Option<&'a str> {
        if self.proxy_vars
            && let Some(forwarded) = hints.forwarded_host.as_deref()
        {
            // First entry when a proxy chain appended several
            return forwarded.split(',').next().map(str::trim);
        }
        hints.host.as_deref()
    }

    async fn default_tenant(
        &self,
    ) -> Result<(HintSource, Option<crate::models::Tenant>), SamlError> {
        match &self.default_tenant {
            Some(key) => Ok((HintSource::Default, self.repo.find_by_key(key).await?)),
            None => Ok((HintSource::Default, None)),
        }
    }

    /// Overlay cached IdP metadata on a tenant that names a metadata URL.
    ///
    /// Only the cache is consulted; a tenant with neither cached metadata nor
    /// static trust material cannot be used until the next refresh succeeds.
    fn with_metadata(&self, mut idp: IdpConfig) -> Result<IdpConfig, SamlError> {
        if idp.metadata_url.is_none() {
            return Ok(idp);
        }

        let cached = self.metadata.as_ref().and_then(|cache| cache.get(&idp.key));
        match cached {
            Some(metadata) => {
                apply_metadata(&mut idp, &metadata);
                Ok(idp)
            }
            None if !idp.sso_url.is_empty()
                && (!idp.certificates.is_empty() || idp.cert_fingerprint.is_some()) =>
            {
                Ok(idp)
            }
            None => {
                tracing::warn!(idp_key = %idp.key, "IdP metadata not cached; refusing to use tenant");
                Err(SamlError::Configuration(format!(
                    "metadata for tenant '{}' is not available",
                    idp.key
                )))
            }
        }
    }

    /// SP endpoints for a tenant. Explicit `[sp]` URLs win; otherwise they
    /// are derived from `base_url` under the routes prefix.
    pub fn sp_endpoints(&self, idp_key: &str) -> SpEndpoints {
        let route = |suffix: &str| {
            let base = self.base_url.as_deref().unwrap_or_default();
            if self.routes_prefix.is_empty() {
                format!("{base}/{idp_key}/{suffix}")
            } else {
                format!("{base}/{}/{idp_key}/{suffix}", self.routes_prefix)
            }
        };

        let metadata_url = if self.base_url.is_some() {
            route("metadata")
        } else {
            self.sp.entity_id.clone().unwrap_or_default()
        };

        SpEndpoints {
            entity_id: self
                .sp
                .entity_id
                .clone()
                .unwrap_or_else(|| route("metadata")),
            acs_url: self.sp.acs_url.clone().unwrap_or_else(|| route("acs")),
            sls_url: self
                .sp
                .sls_url
                .clone()
                .or_else(|| self.base_url.as_ref().map(|_| route("sls"))),
            metadata_url,
        }
    }
}

/// Fill in or replace IdP fields from its published metadata.
fn apply_metadata(idp: &mut IdpConfig, metadata: &IdpMetadata) {
    if idp.entity_id.is_empty() {
        idp.entity_id = metadata.entity_id.clone();
    }
    if let Some((url, binding)) = &metadata.sso {
        idp.sso_url = url.clone();
        idp.sso_binding = *binding;
    }
    if let Some((url, binding)) = &metadata.slo {
        idp.slo_url = Some(url.clone());
        idp.slo_binding = *binding;
    }
    for cert in &metadata.signing_certificates {
        if !idp.certificates.contains(cert) {
            idp.certificates.push(cert.clone());
        }
    }
}

fn describe_hints(hints: &RequestHints) -> String {
    hints
        .explicit_key
        .clone()
        .or_else(|| hints.path.clone())
        .or_else(|| hints.host.clone())
        .unwrap_or_else(|| "request".to_string())
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::db::{StaticTenantRepo, tests::harness::tenant_idp};

    async fn resolver(config: SamlConfig) -> IdpResolver {
        let repo = StaticTenantRepo::new();
        repo.create(tenant_idp("acme")).await.unwrap();
        repo.create(tenant_idp("globex")).await.unwrap();
        let mut disabled = tenant_idp("initech");
        disabled.enabled = false;
        repo.create(disabled).await.unwrap();
        IdpResolver::new(&config, Arc::new(repo), None)
    }

    fn base_config() -> SamlConfig {
        SamlConfig {
            base_url: Some("https://sp.example.com".into()),
            ..Default::default()
        }
    }

    #[rstest]
    #[case("/saml2/acme/acs", true)]
    #[case("saml2", true)]
    #[case("/saml2", true)]
    #[case("/saml2x/acme", false)]
    #[case("/login", false)]
    #[case("/", false)]
    #[tokio::test]
    async fn test_applies_to(#[case] path: &str, #[case] expected: bool) {
        let resolver = resolver(base_config()).await;
        assert_eq!(resolver.applies_to(path), expected);
    }

    #[tokio::test]
    async fn test_key_from_path() {
        let resolver = resolver(base_config()).await;
        assert_eq!(resolver.key_from_path("/saml2/acme/acs?x=1").as_deref(), Some("acme"));
        assert_eq!(resolver.key_from_path("/saml2/"), None);
        assert_eq!(resolver.key_from_path("/other/acme"), None);
    }

    #[tokio::test]
    async fn test_resolve_explicit_and_path() {
        let resolver = resolver(base_config()).await;

        let ctx = resolver.resolve(&RequestHints::key("acme")).await.unwrap();
        assert_eq!(ctx.idp_key, "acme");
        assert_eq!(ctx.idp.entity_id, "https://idp.acme.com/saml");

        let ctx = resolver
            .resolve(&RequestHints::path("/saml2/globex/acs"))
            .await
            .unwrap();
        assert_eq!(ctx.idp_key, "globex");
        assert_eq!(ctx.sp.acs_url, "https://sp.example.com/saml2/globex/acs");
        assert_eq!(
            ctx.sp.entity_id,
            "https://sp.example.com/saml2/globex/metadata"
        );
        assert_eq!(
            ctx.sp.sls_url.as_deref(),
            Some("https://sp.example.com/saml2/globex/sls")
        );
    }

    #[tokio::test]
    async fn test_explicit_key_does_not_fall_through() {
        let mut config = base_config();
        config.default_tenant = Some("acme".into());
        let resolver = resolver(config).await;

        let err = resolver
            .resolve(&RequestHints::key("nobody").with_host("acme.example.com"))
            .await
            .unwrap_err();
        assert!(err.is_soft());
    }

    #[tokio::test]
    async fn test_disabled_tenant_not_resolved() {
        let resolver = resolver(base_config()).await;
        assert!(matches!(
            resolver.resolve(&RequestHints::key("initech")).await,
            Err(SamlError::ResolutionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_resolve_by_host_and_forwarded_host() {
        let resolver = resolver(base_config()).await;
        let hints = RequestHints::default()
            .with_host("acme.example.com")
            .with_forwarded_host("globex.example.com");
        assert_eq!(resolver.resolve(&hints).await.unwrap().idp_key, "acme");

        let mut config = base_config();
        config.proxy_vars = true;
        let resolver = self::resolver(config).await;
        assert_eq!(resolver.resolve(&hints).await.unwrap().idp_key, "globex");
    }

    #[tokio::test]
    async fn test_default_tenant_fallback() {
        let resolver = resolver(base_config()).await;
        assert!(resolver.resolve(&RequestHints::default()).await.is_err());

        let mut config = base_config();
        config.default_tenant = Some("globex".into());
        let resolver = self::resolver(config).await;
        let hints = RequestHints::default().with_host("unknown.example.com");
        assert_eq!(resolver.resolve(&hints).await.unwrap().idp_key, "globex");
    }

    #[tokio::test]
    async fn test_explicit_sp_urls_win() {
        let mut config = base_config();
        config.sp.entity_id = Some("https://sp.example.com".into());
        config.sp.acs_url = Some("https://sp.example.com/acs".into());
        let resolver = resolver(config).await;
        let endpoints = resolver.sp_endpoints("acme");
        assert_eq!(endpoints.entity_id, "https://sp.example.com");
        assert_eq!(endpoints.acs_url, "https://sp.example.com/acs");
        assert_eq!(
            endpoints.metadata_url,
            "https://sp.example.com/saml2/acme/metadata"
        );
    }

    #[tokio::test]
    async fn test_metadata_tenant_without_cache_fails_closed() {
        let repo = StaticTenantRepo::new();
        let mut idp = tenant_idp("dynamic");
        idp.certificates.clear();
        idp.metadata_url = Some("https://idp.dynamic.com/metadata".into());
        repo.create(idp).await.unwrap();
        let resolver = IdpResolver::new(&base_config(), Arc::new(repo), None);

        assert!(matches!(
            resolver.resolve(&RequestHints::key("dynamic")).await,
            Err(SamlError::Configuration(_))
        ));
    }
}

//! The SAML engine facade.
//!
//! Wires the resolver, request builder, response validator, correlation
//! store and session binding together behind the operations a host's HTTP
//! layer calls: `login`, `acs`, `logout`, `sls` and `metadata`. The engine
//! owns no HTTP server; hosts map their routes onto these calls.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::task::JoinHandle;

use crate::{
    binding::{InboundMessage, MessageField},
    config::SamlConfig,
    correlation::{CorrelationStore, MemoryCorrelationStore, PendingRequest, RequestKind},
    db::{TenantRepo, tenant_repo_from_config},
    error::SamlResult,
    metadata::{IdpMetadataCache, publish_metadata, spawn_metadata_refresher},
    models::{AuthenticatedIdentity, Tenant, message::STATUS_SUCCESS},
    request::{BuiltRequest, RequestBuilder},
    resolver::{IdpResolver, RequestHints, ResolvedContext},
    response::ResponseValidator,
    session::{MemorySessionStore, SamlSession, SessionBinding, SessionHandle, SessionStore},
    sp::ServiceProvider,
    xml::{OpenSslXmlSecurity, XmlSecurity},
};

/// A completed SSO exchange.
#[derive(Debug, Clone)]
pub struct LoginOutcome {
    pub session: SessionHandle,
    pub identity: AuthenticatedIdentity,
    pub relay_state: Option<String>,
}

/// What the SLS endpoint should do next.
#[derive(Debug, Clone)]
pub enum SlsOutcome {
    /// An IdP-initiated logout was processed; deliver this LogoutResponse.
    Respond {
        response: BuiltRequest,
        sessions_ended: usize,
    },
    /// An IdP-initiated logout was processed for a tenant with no SLO URL,
    /// so there is nowhere to send a LogoutResponse.
    SessionsEnded {
        sessions_ended: usize,
        relay_state: Option<String>,
    },
    /// The IdP confirmed an SP-initiated logout.
    LoggedOut { relay_state: Option<String> },
}

pub struct SamlEngine {
    resolver: IdpResolver,
    sp: Arc<ServiceProvider>,
    builder: Arc<RequestBuilder>,
    validator: ResponseValidator,
    sessions: SessionBinding,
    correlation: Arc<dyn CorrelationStore>,
    metadata_cache: Arc<IdpMetadataCache>,
    request_ttl: Duration,
}

impl SamlEngine {
    /// Build an engine from configuration, with in-memory correlation and
    /// session stores.
    pub async fn from_config(config: &SamlConfig) -> SamlResult<Self> {
        let repo = tenant_repo_from_config(config).await?;
        Self::new(
            config,
            repo,
            Arc::new(MemoryCorrelationStore::new()),
            Arc::new(MemorySessionStore::new()),
        )
    }

    /// Build an engine over caller-supplied stores. Clustered deployments
    /// pass shared implementations here.
    pub fn new(
        config: &SamlConfig,
        repo: Arc<dyn TenantRepo>,
        correlation: Arc<dyn CorrelationStore>,
        session_store: Arc<dyn SessionStore>,
    ) -> SamlResult<Self> {
        let sp = Arc::new(ServiceProvider::from_config(config)?);
        let xml: Arc<dyn XmlSecurity> = Arc::new(OpenSslXmlSecurity::new());
        let metadata_cache = Arc::new(IdpMetadataCache::new(&config.metadata_cache));
        let request_ttl = Duration::seconds(config.security.request_ttl_secs as i64);

        let builder = Arc::new(RequestBuilder::new(sp.clone(), xml.clone()));
        let validator = ResponseValidator::new(sp.clone(), xml, correlation.clone());
        let sessions = SessionBinding::new(
            session_store,
            config.session.clone(),
            builder.clone(),
            correlation.clone(),
            request_ttl,
        );
        let resolver = IdpResolver::new(config, repo, Some(metadata_cache.clone()));

        Ok(Self {
            resolver,
            sp,
            builder,
            validator,
            sessions,
            correlation,
            metadata_cache,
            request_ttl,
        })
    }

    pub fn resolver(&self) -> &IdpResolver {
        &self.resolver
    }

    pub fn sessions(&self) -> &SessionBinding {
        &self.sessions
    }

    /// Resolve the tenant for a request.
    pub async fn resolve(&self, hints: &RequestHints) -> SamlResult<ResolvedContext> {
        self.resolver.resolve(hints).await
    }

    /// Resolve, treating "no such tenant" as "not a SAML request".
    ///
    /// Requests outside the routes prefix never get a context. Every other
    /// failure is still an error.
    pub async fn resolve_optional(&self, hints: &RequestHints) -> SamlResult<Option<ResolvedContext>> {
        if let Some(path) = &hints.path
            && !self.resolver.applies_to(path)
        {
            return Ok(None);
        }
        match self.resolver.resolve(hints).await {
            Ok(ctx) => Ok(Some(ctx)),
            Err(e) if e.is_soft() => {
                tracing::debug!(error = %e, "No SAML tenant for request");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Start SP-initiated SSO: build an AuthnRequest and remember its ID.
    pub async fn login(
        &self,
        ctx: &ResolvedContext,
        relay_state: Option<&str>,
    ) -> SamlResult<BuiltRequest> {
        let request = self.builder.build_authn_request(ctx, relay_state)?;
        self.correlation
            .register(PendingRequest::new(
                request.id.clone(),
                ctx.idp_key.clone(),
                RequestKind::Authn,
                relay_state.map(str::to_string),
                self.request_ttl,
            ))
            .await?;
        tracing::info!(
            idp_key = %ctx.idp_key,
            request_id = %request.id,
            binding = %request.message.binding(),
            "Issued AuthnRequest"
        );
        Ok(request)
    }

    /// Consume a `SAMLResponse` at the ACS endpoint and open a session.
    pub async fn acs(
        &self,
        ctx: &ResolvedContext,
        message: &InboundMessage,
        now: DateTime<Utc>,
    ) -> SamlResult<LoginOutcome> {
        let validated = self.validator.validate_response(ctx, message, now).await?;
        let session = self
            .sessions
            .bind(validated.identity.clone(), ctx, now)
            .await?;
        Ok(LoginOutcome {
            session,
            identity: validated.identity,
            relay_state: validated.relay_state,
        })
    }

    /// The live session behind a handle.
    pub async fn session(&self, handle: SessionHandle, now: DateTime<Utc>) -> SamlResult<SamlSession> {
        self.sessions.get(handle, now).await
    }

    /// End a session, returning the LogoutRequest to send when the tenant
    /// supports Single Logout.
    pub async fn logout(
        &self,
        ctx: &ResolvedContext,
        handle: SessionHandle,
        relay_state: Option<&str>,
        now: DateTime<Utc>,
    ) -> SamlResult<Option<BuiltRequest>> {
        self.sessions.unbind(handle, ctx, relay_state, now).await
    }

    /// Handle a message at the SLS endpoint.
    pub async fn sls(
        &self,
        ctx: &ResolvedContext,
        message: &InboundMessage,
        now: DateTime<Utc>,
    ) -> SamlResult<SlsOutcome> {
        match message.field() {
            MessageField::Request => {
                let validated = self
                    .validator
                    .validate_logout_request(ctx, message, now)
                    .await?;
                let request = &validated.request;
                let sessions_ended = self
                    .sessions
                    .unbind_by_subject(&ctx.idp_key, &request.name_id.value, &request.session_indexes)
                    .await?;
                if ctx.idp.slo_url.is_none() {
                    tracing::info!(
                        idp_key = %ctx.idp_key,
                        sessions_ended,
                        "IdP-initiated logout processed; tenant has no SLO URL to answer"
                    );
                    return Ok(SlsOutcome::SessionsEnded {
                        sessions_ended,
                        relay_state: validated.relay_state,
                    });
                }
                let response = self.builder.build_logout_response(
                    ctx,
                    &request.id,
                    STATUS_SUCCESS,
                    validated.relay_state.as_deref(),
                )?;
                Ok(SlsOutcome::Respond {
                    response,
                    sessions_ended,
                })
            }
            MessageField::Response => {
                let validated = self
                    .validator
                    .validate_logout_response(ctx, message, now)
                    .await?;
                tracing::info!(
                    idp_key = %ctx.idp_key,
                    request_id = %validated.request.id,
                    "Single Logout confirmed by IdP"
                );
                Ok(SlsOutcome::LoggedOut {
                    relay_state: validated.relay_state,
                })
            }
        }
    }

    /// SP metadata as seen by the resolved tenant's IdP.
    pub fn metadata(&self, ctx: &ResolvedContext) -> String {
        publish_metadata(&self.sp, &ctx.sp)
    }

    /// Fetch metadata for every tenant that publishes a URL. Returns how many
    /// refreshed.
    pub async fn refresh_metadata(&self) -> usize {
        self.metadata_cache
            .refresh_all(self.resolver.repo().as_ref())
            .await
    }

    /// Keep tenant metadata fresh in the background.
    pub fn spawn_metadata_refresher(&self, interval: std::time::Duration) -> JoinHandle<()> {
        spawn_metadata_refresher(
            self.metadata_cache.clone(),
            self.resolver.repo().clone(),
            interval,
        )
    }

    /// Drop expired pending requests, replay records and sessions.
    pub async fn cleanup(&self, now: DateTime<Utc>) -> SamlResult<usize> {
        let correlation = self.correlation.cleanup(now).await?;
        let sessions = self.sessions.store().cleanup(now).await?;
        if correlation + sessions > 0 {
            tracing::debug!(correlation, sessions, "Removed expired SAML state");
        }
        Ok(correlation + sessions)
    }

    /// Every tenant, including disabled ones.
    pub async fn tenants(&self) -> SamlResult<Vec<Tenant>> {
        Ok(self.resolver.repo().list(false).await?)
    }
}

//! Binding validated identities to application sessions.
//!
//! A session never outlives the assertion it was created from unless the
//! host extends it explicitly. Ending a session for a tenant with Single
//! Logout configured produces the LogoutRequest to send to the IdP.

mod store;

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
pub use store::{
    MemorySessionStore, SamlSession, SessionError, SessionHandle, SessionResult, SessionStore,
};

use crate::{
    config::SessionConfig,
    correlation::{CorrelationStore, PendingRequest, RequestKind},
    error::SamlResult,
    models::AuthenticatedIdentity,
    request::{BuiltRequest, RequestBuilder},
    resolver::ResolvedContext,
};

pub struct SessionBinding {
    store: Arc<dyn SessionStore>,
    config: SessionConfig,
    builder: Arc<RequestBuilder>,
    correlation: Arc<dyn CorrelationStore>,
    request_ttl: Duration,
}

impl SessionBinding {
    pub fn new(
        store: Arc<dyn SessionStore>,
        config: SessionConfig,
        builder: Arc<RequestBuilder>,
        correlation: Arc<dyn CorrelationStore>,
        request_ttl: Duration,
    ) -> Self {
        Self {
            store,
            config,
            builder,
            correlation,
            request_ttl,
        }
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    /// Expiry for a session created at `now`.
    fn expiry_for(&self, identity: &AuthenticatedIdentity, now: DateTime<Utc>) -> DateTime<Utc> {
        let configured = now + Duration::seconds(self.config.duration_secs as i64);
        match identity.valid_until {
            Some(valid_until) if self.config.cap_to_assertion => configured.min(valid_until),
            _ => configured,
        }
    }

    /// Create a session for an identity produced under `ctx`.
    pub async fn bind(
        &self,
        identity: AuthenticatedIdentity,
        ctx: &ResolvedContext,
        now: DateTime<Utc>,
    ) -> SamlResult<SessionHandle> {
        if identity.idp_key != ctx.idp_key {
            return Err(SessionError::TenantMismatch {
                identity: identity.idp_key,
                context: ctx.idp_key.clone(),
            }
            .into());
        }

        let expires_at = self.expiry_for(&identity, now);
        if expires_at <= now {
            return Err(SessionError::Expired.into());
        }

        let session = SamlSession {
            handle: SessionHandle::new(),
            idp_key: ctx.idp_key.clone(),
            identity,
            created_at: now,
            expires_at,
        };
        let handle = self.store.create_session(session).await?;

        tracing::info!(
            idp_key = %ctx.idp_key,
            session = %handle,
            expires_at = %expires_at,
            "SAML session created"
        );
        Ok(handle)
    }

    /// Look up a live session. Expired sessions are removed and reported as
    /// `Expired`.
    pub async fn get(&self, handle: SessionHandle, now: DateTime<Utc>) -> SamlResult<SamlSession> {
        let session = self
            .store
            .get_session(handle)
            .await?
            .ok_or(SessionError::NotFound)?;
        if session.is_expired(now) {
            self.store.delete_session(handle).await?;
            return Err(SessionError::Expired.into());
        }
        Ok(session)
    }

    /// Push a session's expiry out to `until`, past any assertion cap.
    pub async fn extend(
        &self,
        handle: SessionHandle,
        until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> SamlResult<SamlSession> {
        let mut session = self.get(handle, now).await?;
        if until > session.expires_at {
            session.expires_at = until;
            self.store.update_session(session.clone()).await?;
            tracing::debug!(session = %handle, expires_at = %until, "SAML session extended");
        }
        Ok(session)
    }

    /// End a session.
    ///
    /// When the tenant has an SLO endpoint and the session is still live, a
    /// LogoutRequest is built and registered for correlation with the IdP's
    /// LogoutResponse. The local session is gone either way.
    pub async fn unbind(
        &self,
        handle: SessionHandle,
        ctx: &ResolvedContext,
        relay_state: Option<&str>,
        now: DateTime<Utc>,
    ) -> SamlResult<Option<BuiltRequest>> {
        let session = self
            .store
            .get_session(handle)
            .await?
            .ok_or(SessionError::NotFound)?;
        if session.idp_key != ctx.idp_key {
            return Err(SessionError::TenantMismatch {
                identity: session.idp_key,
                context: ctx.idp_key.clone(),
            }
            .into());
        }
        self.store.delete_session(handle).await?;
        tracing::info!(idp_key = %ctx.idp_key, session = %handle, "SAML session ended");

        if ctx.idp.slo_url.is_none() || session.is_expired(now) {
            return Ok(None);
        }

        let identity = &session.identity;
        let request = self.builder.build_logout_request(
            ctx,
            &identity.name_id,
            identity.name_id_format.as_deref(),
            identity.session_index.as_deref(),
            relay_state,
        )?;
        self.correlation
            .register(PendingRequest::new(
                request.id.clone(),
                ctx.idp_key.clone(),
                RequestKind::Logout,
                relay_state.map(str::to_string),
                self.request_ttl,
            ))
            .await?;
        Ok(Some(request))
    }

    /// End every session an IdP-initiated logout names.
    pub async fn unbind_by_subject(
        &self,
        idp_key: &str,
        name_id: &str,
        session_indexes: &[String],
    ) -> SamlResult<usize> {
        let removed = self
            .store
            .delete_by_subject(idp_key, name_id, session_indexes)
            .await?;
        tracing::info!(idp_key, removed, "Ended SAML sessions for IdP logout");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::SecurityConfig,
        correlation::MemoryCorrelationStore,
        crypto::test_support::generate_rsa_certificate,
        error::SamlError,
        models::test_support::idp_config,
        resolver::SpEndpoints,
        sp::ServiceProvider,
        xml::OpenSslXmlSecurity,
    };

    struct Fixture {
        binding: SessionBinding,
        correlation: Arc<MemoryCorrelationStore>,
        ctx: ResolvedContext,
    }

    fn context(key: &str, with_slo: bool) -> ResolvedContext {
        let (cert, _) = generate_rsa_certificate("idp.test");
        let mut idp = idp_config(key, &cert);
        if !with_slo {
            idp.slo_url = None;
        }
        ResolvedContext {
            idp_key: key.to_string(),
            idp: Arc::new(idp),
            sp: Arc::new(SpEndpoints {
                entity_id: "https://sp.example.com".into(),
                acs_url: format!("https://sp.example.com/saml2/{key}/acs"),
                sls_url: Some(format!("https://sp.example.com/saml2/{key}/sls")),
                metadata_url: format!("https://sp.example.com/saml2/{key}/metadata"),
            }),
        }
    }

    fn fixture(config: SessionConfig, with_slo: bool) -> Fixture {
        let sp = Arc::new(ServiceProvider::for_tests(SecurityConfig::default(), None));
        let builder = Arc::new(RequestBuilder::new(sp, Arc::new(OpenSslXmlSecurity::new())));
        let correlation = Arc::new(MemoryCorrelationStore::new());
        Fixture {
            binding: SessionBinding::new(
                Arc::new(MemorySessionStore::new()),
                config,
                builder,
                correlation.clone(),
                Duration::minutes(10),
            ),
            correlation,
            ctx: context("acme", with_slo),
        }
    }

    fn identity(valid_until: Option<DateTime<Utc>>) -> AuthenticatedIdentity {
        AuthenticatedIdentity {
            name_id: "alice@acme.com".into(),
            name_id_format: None,
            attributes: Default::default(),
            friendly_names: Default::default(),
            session_index: Some("_idx1".into()),
            idp_key: "acme".into(),
            issuer: "https://idp.acme.com/saml".into(),
            authn_instant: None,
            valid_until,
        }
    }

    #[tokio::test]
    async fn test_session_capped_to_assertion() {
        let f = fixture(SessionConfig::default(), true);
        let now = Utc::now();
        let valid_until = now + Duration::minutes(5);

        let handle = f.binding.bind(identity(Some(valid_until)), &f.ctx, now).await.unwrap();
        let session = f.binding.get(handle, now).await.unwrap();
        assert_eq!(session.expires_at, valid_until);

        let later = valid_until + Duration::seconds(1);
        assert!(matches!(
            f.binding.get(handle, later).await,
            Err(SamlError::Session(SessionError::Expired))
        ));
        // Expired sessions are dropped on access
        assert!(matches!(
            f.binding.get(handle, now).await,
            Err(SamlError::Session(SessionError::NotFound))
        ));
    }

    #[tokio::test]
    async fn test_uncapped_session_uses_configured_duration() {
        let config = SessionConfig {
            duration_secs: 3600,
            cap_to_assertion: false,
        };
        let f = fixture(config, true);
        let now = Utc::now();
        let handle = f
            .binding
            .bind(identity(Some(now + Duration::minutes(5))), &f.ctx, now)
            .await
            .unwrap();
        assert_eq!(
            f.binding.get(handle, now).await.unwrap().expires_at,
            now + Duration::hours(1)
        );
    }

    #[tokio::test]
    async fn test_extend_past_assertion() {
        let f = fixture(SessionConfig::default(), true);
        let now = Utc::now();
        let handle = f
            .binding
            .bind(identity(Some(now + Duration::minutes(5))), &f.ctx, now)
            .await
            .unwrap();
        let until = now + Duration::hours(2);
        f.binding.extend(handle, until, now).await.unwrap();
        assert!(f.binding.get(handle, now + Duration::hours(1)).await.is_ok());
    }

    #[tokio::test]
    async fn test_bind_rejects_other_tenant_and_expired_identity() {
        let f = fixture(SessionConfig::default(), true);
        let now = Utc::now();
        let globex = context("globex", true);
        assert!(matches!(
            f.binding.bind(identity(None), &globex, now).await,
            Err(SamlError::Session(SessionError::TenantMismatch { .. }))
        ));
        assert!(matches!(
            f.binding.bind(identity(Some(now)), &f.ctx, now).await,
            Err(SamlError::Session(SessionError::Expired))
        ));
    }

    #[tokio::test]
    async fn test_unbind_builds_and_registers_logout_request() {
        let f = fixture(SessionConfig::default(), true);
        let now = Utc::now();
        let handle = f.binding.bind(identity(None), &f.ctx, now).await.unwrap();

        let request = f
            .binding
            .unbind(handle, &f.ctx, Some("/bye"), now)
            .await
            .unwrap()
            .expect("SLO is configured");
        assert_eq!(request.destination, "https://idp.acme.com/slo");
        assert_eq!(f.correlation.pending_count(), 1);
        f.correlation
            .consume(&request.id, "acme", RequestKind::Logout, now)
            .await
            .unwrap();

        assert!(matches!(
            f.binding.get(handle, now).await,
            Err(SamlError::Session(SessionError::NotFound))
        ));
    }

    #[tokio::test]
    async fn test_unbind_without_slo_is_local_only() {
        let f = fixture(SessionConfig::default(), false);
        let now = Utc::now();
        let handle = f.binding.bind(identity(None), &f.ctx, now).await.unwrap();
        assert!(f.binding.unbind(handle, &f.ctx, None, now).await.unwrap().is_none());
        assert_eq!(f.correlation.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_unbind_by_subject() {
        let f = fixture(SessionConfig::default(), true);
        let now = Utc::now();
        let handle = f.binding.bind(identity(None), &f.ctx, now).await.unwrap();
        let removed = f
            .binding
            .unbind_by_subject("acme", "alice@acme.com", &["_idx1".to_string()])
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(f.binding.get(handle, now).await.is_err());
    }
}

//! Session storage backends.
//!
//! This module provides a `SessionStore` trait and an in-memory
//! implementation. Sessions are keyed by an opaque handle and indexed by
//! `(idp_key, name_id)` so IdP-initiated logout can find them.

use std::{collections::HashMap, fmt};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::models::AuthenticatedIdentity;

/// Result type for session store operations.
pub type SessionResult<T> = Result<T, SessionError>;

/// Errors that can occur during session operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Session not found")]
    NotFound,

    #[error("Session expired")]
    Expired,

    #[error("Identity was issued for tenant '{identity}', not '{context}'")]
    TenantMismatch { identity: String, context: String },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Opaque reference to an application session, handed to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionHandle(pub Uuid);

impl SessionHandle {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for SessionHandle {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(SessionHandle)
            .map_err(|_| SessionError::NotFound)
    }
}

/// An authenticated application session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamlSession {
    pub handle: SessionHandle,

    /// Tenant the identity was authenticated through.
    pub idp_key: String,

    pub identity: AuthenticatedIdentity,

    /// When the session was created
    pub created_at: DateTime<Utc>,

    /// When the session expires
    pub expires_at: DateTime<Utc>,
}

impl SamlSession {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Whether this session matches an IdP-initiated logout for `name_id`,
    /// optionally narrowed to specific session indexes.
    pub fn matches_subject(&self, idp_key: &str, name_id: &str, session_indexes: &[String]) -> bool {
        self.idp_key == idp_key
            && self.identity.name_id == name_id
            && (session_indexes.is_empty()
                || self
                    .identity
                    .session_index
                    .as_ref()
                    .is_some_and(|si| session_indexes.contains(si)))
    }
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Store a new session.
    async fn create_session(&self, session: SamlSession) -> SessionResult<SessionHandle>;

    /// Get a session by handle.
    async fn get_session(&self, handle: SessionHandle) -> SessionResult<Option<SamlSession>>;

    /// Replace an existing session.
    async fn update_session(&self, session: SamlSession) -> SessionResult<()>;

    /// Delete a session, returning it if it existed.
    async fn delete_session(&self, handle: SessionHandle) -> SessionResult<Option<SamlSession>>;

    /// Delete every session matching an IdP-initiated logout. Returns how
    /// many were removed.
    async fn delete_by_subject(
        &self,
        idp_key: &str,
        name_id: &str,
        session_indexes: &[String],
    ) -> SessionResult<usize>;

    /// Clean up expired sessions. Returns how many were removed.
    async fn cleanup(&self, now: DateTime<Utc>) -> SessionResult<usize>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Memory Session Store
// ─────────────────────────────────────────────────────────────────────────────

/// In-memory session store.
///
/// Suitable for development and single-node deployments.
/// Sessions are lost on restart and not shared across nodes.
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<SessionHandle, SamlSession>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn create_session(&self, session: SamlSession) -> SessionResult<SessionHandle> {
        let handle = session.handle;
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&handle) {
            return Err(SessionError::Storage(format!("session {handle} already exists")));
        }
        sessions.insert(handle, session);
        Ok(handle)
    }

    async fn get_session(&self, handle: SessionHandle) -> SessionResult<Option<SamlSession>> {
        let sessions = self.sessions.read().await;
        Ok(sessions.get(&handle).cloned())
    }

    async fn update_session(&self, session: SamlSession) -> SessionResult<()> {
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(&session.handle) {
            Some(existing) => {
                *existing = session;
                Ok(())
            }
            None => Err(SessionError::NotFound),
        }
    }

    async fn delete_session(&self, handle: SessionHandle) -> SessionResult<Option<SamlSession>> {
        let mut sessions = self.sessions.write().await;
        Ok(sessions.remove(&handle))
    }

    async fn delete_by_subject(
        &self,
        idp_key: &str,
        name_id: &str,
        session_indexes: &[String],
    ) -> SessionResult<usize> {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, s| !s.matches_subject(idp_key, name_id, session_indexes));
        Ok(before - sessions.len())
    }

    async fn cleanup(&self, now: DateTime<Utc>) -> SessionResult<usize> {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, s| !s.is_expired(now));
        Ok(before - sessions.len())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    fn identity(idp_key: &str, name_id: &str, session_index: Option<&str>) -> AuthenticatedIdentity {
        AuthenticatedIdentity {
            name_id: name_id.to_string(),
            name_id_format: None,
            attributes: Default::default(),
            friendly_names: Default::default(),
            session_index: session_index.map(str::to_string),
            idp_key: idp_key.to_string(),
            issuer: format!("https://idp.{idp_key}.com/saml"),
            authn_instant: None,
            valid_until: None,
        }
    }

    fn session(idp_key: &str, name_id: &str, session_index: Option<&str>) -> SamlSession {
        let now = Utc::now();
        SamlSession {
            handle: SessionHandle::new(),
            idp_key: idp_key.to_string(),
            identity: identity(idp_key, name_id, session_index),
            created_at: now,
            expires_at: now + Duration::hours(1),
        }
    }

    #[tokio::test]
    async fn test_create_get_delete() {
        let store = MemorySessionStore::new();
        let s = session("acme", "alice", None);
        let handle = store.create_session(s.clone()).await.unwrap();

        let fetched = store.get_session(handle).await.unwrap().unwrap();
        assert_eq!(fetched.identity.name_id, "alice");

        assert!(store.create_session(s).await.is_err());
        assert!(store.delete_session(handle).await.unwrap().is_some());
        assert!(store.delete_session(handle).await.unwrap().is_none());
        assert!(store.get_session(handle).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_requires_existing() {
        let store = MemorySessionStore::new();
        let mut s = session("acme", "alice", None);
        assert!(matches!(
            store.update_session(s.clone()).await,
            Err(SessionError::NotFound)
        ));
        store.create_session(s.clone()).await.unwrap();
        s.expires_at += Duration::hours(1);
        store.update_session(s.clone()).await.unwrap();
        assert_eq!(
            store.get_session(s.handle).await.unwrap().unwrap().expires_at,
            s.expires_at
        );
    }

    #[tokio::test]
    async fn test_delete_by_subject() {
        let store = MemorySessionStore::new();
        store.create_session(session("acme", "alice", Some("_s1"))).await.unwrap();
        store.create_session(session("acme", "alice", Some("_s2"))).await.unwrap();
        store.create_session(session("globex", "alice", Some("_s1"))).await.unwrap();
        store.create_session(session("acme", "bob", Some("_s1"))).await.unwrap();

        let removed = store
            .delete_by_subject("acme", "alice", &["_s1".to_string()])
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.delete_by_subject("acme", "alice", &[]).await.unwrap(), 1);
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn test_cleanup() {
        let store = MemorySessionStore::new();
        store.create_session(session("acme", "alice", None)).await.unwrap();
        assert_eq!(store.cleanup(Utc::now()).await.unwrap(), 0);
        assert_eq!(store.cleanup(Utc::now() + Duration::hours(2)).await.unwrap(), 1);
    }

    #[test]
    fn test_handle_parse() {
        let handle = SessionHandle::new();
        assert_eq!(handle.to_string().parse::<SessionHandle>().unwrap(), handle);
        assert!("not-a-uuid".parse::<SessionHandle>().is_err());
    }
}

//! Pending-request store for `InResponseTo` correlation and replay defense.
//!
//! Every AuthnRequest and LogoutRequest the SP issues is registered here.
//! A response may redeem a pending request exactly once: [`CorrelationStore::consume`]
//! is an atomic check-and-remove, so two concurrent validations of the same
//! response cannot both succeed.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::{DashMap, mapref::entry::Entry};
use serde::{Deserialize, Serialize};

use crate::error::SamlError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    Authn,
    Logout,
}

impl RequestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::Authn => "authn",
            RequestKind::Logout => "logout",
        }
    }
}

/// An issued request awaiting its response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingRequest {
    pub id: String,
    /// Tenant the request was sent for; the response must arrive for the same one.
    pub idp_key: String,
    pub kind: RequestKind,
    pub relay_state: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl PendingRequest {
    pub fn new(
        id: impl Into<String>,
        idp_key: impl Into<String>,
        kind: RequestKind,
        relay_state: Option<String>,
        ttl: Duration,
    ) -> Self {
        let created_at = Utc::now();
        Self {
            id: id.into(),
            idp_key: idp_key.into(),
            kind,
            relay_state,
            created_at,
            expires_at: created_at + ttl,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Shared store of pending request IDs and seen assertion IDs.
///
/// Implementations must make `consume` and `mark_seen` atomic with respect to
/// concurrent callers.
#[async_trait]
pub trait CorrelationStore: Send + Sync {
    async fn register(&self, request: PendingRequest) -> Result<(), SamlError>;

    /// Redeem a pending request. Fails with `Correlation` when the ID is
    /// unknown, already redeemed, issued for another tenant or message kind,
    /// or expired. A request for another tenant or kind is left in place.
    async fn consume(
        &self,
        id: &str,
        idp_key: &str,
        kind: RequestKind,
        now: DateTime<Utc>,
    ) -> Result<PendingRequest, SamlError>;

    /// Whether a message ID was recorded by `mark_seen` and has not yet
    /// expired. Never changes the store.
    async fn is_seen(&self, id: &str, idp_key: &str, now: DateTime<Utc>) -> Result<bool, SamlError>;

    /// Record a message ID as seen until `expires_at`.
    ///
    /// Returns `false` if the ID was already seen and has not yet expired.
    async fn mark_seen(
        &self,
        id: &str,
        idp_key: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, SamlError>;

    /// Drop expired entries. Returns how many were removed.
    async fn cleanup(&self, now: DateTime<Utc>) -> Result<usize, SamlError>;
}

/// In-memory store for single-node deployments.
#[derive(Default)]
pub struct MemoryCorrelationStore {
    pending: DashMap<String, PendingRequest>,
    seen: DashMap<(String, String), DateTime<Utc>>,
}

impl MemoryCorrelationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[async_trait]
impl CorrelationStore for MemoryCorrelationStore {
    async fn register(&self, request: PendingRequest) -> Result<(), SamlError> {
        match self.pending.entry(request.id.clone()) {
            Entry::Occupied(_) => Err(SamlError::Internal(format!(
                "request ID {} already registered",
                request.id
            ))),
            Entry::Vacant(e) => {
                e.insert(request);
                Ok(())
            }
        }
    }

    async fn consume(
        &self,
        id: &str,
        idp_key: &str,
        kind: RequestKind,
        now: DateTime<Utc>,
    ) -> Result<PendingRequest, SamlError> {
        let removed = self
            .pending
            .remove_if(id, |_, pending| pending.idp_key == idp_key && pending.kind == kind);

        match removed {
            Some((_, pending)) if pending.is_expired(now) => Err(SamlError::Correlation(format!(
                "request {id} has expired"
            ))),
            Some((_, pending)) => Ok(pending),
            None if self.pending.contains_key(id) => Err(SamlError::Correlation(format!(
                "request {id} was not issued for this {} exchange with tenant '{idp_key}'",
                kind.as_str()
            ))),
            None => Err(SamlError::Correlation(format!(
                "request {id} is unknown or already used"
            ))),
        }
    }

    async fn is_seen(&self, id: &str, idp_key: &str, now: DateTime<Utc>) -> Result<bool, SamlError> {
        Ok(self
            .seen
            .get(&(idp_key.to_string(), id.to_string()))
            .is_some_and(|expires_at| *expires_at > now))
    }

    async fn mark_seen(
        &self,
        id: &str,
        idp_key: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, SamlError> {
        match self.seen.entry((idp_key.to_string(), id.to_string())) {
            Entry::Occupied(mut e) => {
                if *e.get() > now {
                    Ok(false)
                } else {
                    e.insert(expires_at);
                    Ok(true)
                }
            }
            Entry::Vacant(e) => {
                e.insert(expires_at);
                Ok(true)
            }
        }
    }

    async fn cleanup(&self, now: DateTime<Utc>) -> Result<usize, SamlError> {
        let before = self.pending.len() + self.seen.len();
        self.pending.retain(|_, pending| !pending.is_expired(now));
        self.seen.retain(|_, expires_at| *expires_at > now);
        Ok(before - (self.pending.len() + self.seen.len()))
    }
}

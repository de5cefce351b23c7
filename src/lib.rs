//! Multi-tenant SAML 2.0 Service Provider engine.
//!
//! Resolves the identity provider for each request, builds signed
//! AuthnRequests and LogoutRequests, validates SAML Responses down to an
//! [`AuthenticatedIdentity`](models::AuthenticatedIdentity), binds identities
//! to sessions and publishes SP metadata per tenant. HTTP routing is left to
//! the host; [`engine::SamlEngine`] is the entry point.

pub mod binding;
pub mod config;
pub mod correlation;
pub mod crypto;
pub mod db;
pub mod engine;
pub mod error;
pub mod metadata;
pub mod models;
#[cfg(feature = "telemetry")]
pub mod observability;
pub mod request;
pub mod resolver;
pub mod response;
pub mod session;
pub mod sp;
pub mod xml;

#[cfg(test)]
mod tests;

pub use engine::{LoginOutcome, SamlEngine, SlsOutcome};
pub use error::{SamlError, SamlResult};

mod identity;
mod idp;
pub mod message;

pub use identity::AuthenticatedIdentity;
#[cfg(test)]
pub(crate) use idp::test_support;
pub use idp::{IdpConfig, Tenant, normalize_host};

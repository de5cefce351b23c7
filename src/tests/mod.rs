//! End-to-end tests.
//!
//! `idp` is a scripted identity provider shared with the unit tests; the
//! flow modules drive [`crate::SamlEngine`] through complete exchanges.

pub(crate) mod idp;

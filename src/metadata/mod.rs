//! SAML metadata: publishing the SP descriptor and consuming IdP descriptors.

mod cache;
mod idp_metadata;
mod publisher;

pub use cache::{IdpMetadataCache, spawn_metadata_refresher};
#[cfg(test)]
pub(crate) use idp_metadata::test_support;
pub use idp_metadata::{IdpMetadata, parse_idp_metadata};
pub use publisher::{PublishedSp, parse_sp_metadata, publish_metadata};

#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    #[error("Invalid metadata: {0}")]
    Invalid(String),

    #[error("Metadata URL rejected: {0}")]
    InsecureUrl(String),

    #[error("Metadata fetch failed: {0}")]
    Fetch(String),

    #[error(transparent)]
    Xml(#[from] crate::xml::XmlError),
}

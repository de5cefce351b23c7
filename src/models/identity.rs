use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The subject of a validated assertion.
///
/// Produced only by a fully successful validation; there is no partially
/// populated form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthenticatedIdentity {
    pub name_id: String,
    pub name_id_format: Option<String>,
    /// Attribute name to values, in document order.
    pub attributes: BTreeMap<String, Vec<String>>,
    /// FriendlyName to Name, for lookups by the friendlier alias.
    #[serde(default)]
    pub friendly_names: BTreeMap<String, String>,
    pub session_index: Option<String>,
    pub idp_key: String,
    pub issuer: String,
    pub authn_instant: Option<DateTime<Utc>>,
    /// Latest instant at which a session may rely on this assertion.
    pub valid_until: Option<DateTime<Utc>>,
}

impl AuthenticatedIdentity {
    /// All values of an attribute, by Name or FriendlyName.
    pub fn attribute_values(&self, name: &str) -> &[String] {
        self.attributes
            .get(name)
            .or_else(|| {
                self.friendly_names
                    .get(name)
                    .and_then(|full| self.attributes.get(full))
            })
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// First value of an attribute.
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attribute_values(name).first().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attribute_lookup_by_name_and_friendly_name() {
        let identity = AuthenticatedIdentity {
            name_id: "alice@example.com".into(),
            name_id_format: None,
            attributes: BTreeMap::from([
                (
                    "urn:oid:0.9.2342.19200300.100.1.3".to_string(),
                    vec!["alice@example.com".to_string()],
                ),
                (
                    "groups".to_string(),
                    vec!["admins".to_string(), "staff".to_string()],
                ),
            ]),
            friendly_names: BTreeMap::from([(
                "mail".to_string(),
                "urn:oid:0.9.2342.19200300.100.1.3".to_string(),
            )]),
            session_index: None,
            idp_key: "acme".into(),
            issuer: "https://idp.acme.com/saml".into(),
            authn_instant: None,
            valid_until: None,
        };

        assert_eq!(identity.attribute("mail"), Some("alice@example.com"));
        assert_eq!(identity.attribute_values("groups"), ["admins", "staff"]);
        assert!(identity.attribute("missing").is_none());
    }
}

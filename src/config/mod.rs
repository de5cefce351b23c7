//! Configuration for the SAML Service Provider.
//!
//! The engine is configured via a TOML file, with support for environment
//! variable interpolation using `${VAR_NAME}` syntax.
//!
//! # Example
//!
//! ```toml
//! base_url = "https://app.example.com"
//! routes_prefix = "saml2"
//!
//! [sp]
//! certificate = "${SAML_SP_CERT}"
//! private_key = "${SAML_SP_KEY}"
//!
//! [security]
//! authn_requests_signed = true
//!
//! [tenants.acme]
//! entity_id = "https://idp.acme.com/saml"
//! sso_url = "https://idp.acme.com/sso"
//! certs.fingerprint = "AB:CD:..."
//! ```

mod database;
mod observability;
mod security;
mod session;
mod tenants;

use std::{collections::BTreeMap, path::Path};

pub use database::*;
pub use observability::*;
pub use security::*;
use serde::{Deserialize, Serialize};
pub use session::*;
pub use tenants::*;

use crate::{crypto::SigningKey, models::IdpConfig};

/// Root configuration.
///
/// All sections are optional with defaults; a working deployment needs at
/// least `base_url` (or explicit SP URLs) and one tenant.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SamlConfig {
    /// Path prefix under which SAML routes live, e.g. `saml2` for
    /// `/saml2/{tenant}/acs`.
    #[serde(default = "default_routes_prefix")]
    pub routes_prefix: String,

    /// External base URL of the application, used to derive SP endpoints.
    #[serde(default)]
    pub base_url: Option<String>,

    /// Tenant used when a request carries no other hint.
    #[serde(default)]
    pub default_tenant: Option<String>,

    /// Prefer `X-Forwarded-Host` over `Host` when resolving by hostname.
    #[serde(default)]
    pub proxy_vars: bool,

    /// Service Provider identity and keys.
    #[serde(default)]
    pub sp: SpConfig,

    /// Validation and signing policy.
    #[serde(default)]
    pub security: SecurityConfig,

    /// Application session settings.
    #[serde(default)]
    pub session: SessionConfig,

    /// Dynamic IdP metadata caching.
    #[serde(default)]
    pub metadata_cache: MetadataCacheConfig,

    /// Tenant store.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Logging configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,

    /// Statically configured tenants, keyed by tenant key.
    #[serde(default)]
    pub tenants: BTreeMap<String, TenantConfig>,
}

impl Default for SamlConfig {
    fn default() -> Self {
        Self {
            routes_prefix: default_routes_prefix(),
            base_url: None,
            default_tenant: None,
            proxy_vars: false,
            sp: SpConfig::default(),
            security: SecurityConfig::default(),
            session: SessionConfig::default(),
            metadata_cache: MetadataCacheConfig::default(),
            database: DatabaseConfig::default(),
            observability: ObservabilityConfig::default(),
            tenants: BTreeMap::new(),
        }
    }
}

fn default_routes_prefix() -> String {
    "saml2".to_string()
}

impl SamlConfig {
    /// Load configuration from a TOML file.
    ///
    /// Environment variables in the format `${VAR_NAME}` are expanded.
    /// Missing required variables will cause an error.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(e, path.as_ref().to_path_buf()))?;

        Self::from_str(&contents)
    }

    /// Parse configuration from a TOML string.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(contents: &str) -> Result<Self, ConfigError> {
        let expanded = expand_env_vars(contents)?;
        let mut config: SamlConfig = toml::from_str(&expanded)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration for consistency and completeness.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        self.routes_prefix = self.routes_prefix.trim_matches('/').to_string();
        if let Some(base) = &mut self.base_url {
            *base = base.trim_end_matches('/').to_string();
            url::Url::parse(base)
                .map_err(|e| ConfigError::Validation(format!("base_url: {e}")))?;
        }

        for (name, value) in [
            ("sp.entity_id", &self.sp.entity_id),
            ("sp.acs_url", &self.sp.acs_url),
            ("sp.sls_url", &self.sp.sls_url),
        ] {
            if let Some(value) = value {
                url::Url::parse(value)
                    .map_err(|e| ConfigError::Validation(format!("{name}: {e}")))?;
            }
        }

        if self.base_url.is_none() && (self.sp.entity_id.is_none() || self.sp.acs_url.is_none())
        {
            return Err(ConfigError::Validation(
                "Either base_url or both sp.entity_id and sp.acs_url must be set".into(),
            ));
        }

        self.validate_keys()?;

        for (key, tenant) in &self.tenants {
            tenant
                .to_idp_config(key)
                .validate()
                .map_err(ConfigError::Validation)?;
        }

        if let Some(default) = &self.default_tenant
            && !self.tenants.contains_key(default)
            && self.database.is_none()
        {
            return Err(ConfigError::Validation(format!(
                "default_tenant '{default}' is not a configured tenant"
            )));
        }

        if self.security.clock_skew_secs > 600 {
            tracing::warn!(
                clock_skew_secs = self.security.clock_skew_secs,
                "Clock skew allowance above 10 minutes weakens replay protection"
            );
        }
        if self.security.allow_unsolicited {
            tracing::warn!("Unsolicited (IdP-initiated) responses are accepted");
        }

        self.database.validate()?;
        Ok(())
    }

    fn validate_keys(&self) -> Result<(), ConfigError> {
        let certificate = self
            .sp
            .certificate
            .as_deref()
            .map(crate::crypto::Certificate::parse)
            .transpose()
            .map_err(|e| ConfigError::Validation(format!("sp.certificate: {e}")))?;

        match &self.sp.private_key {
            Some(pem) => {
                let key = SigningKey::from_pem(pem, certificate)
                    .map_err(|e| ConfigError::Validation(format!("sp.private_key: {e}")))?;
                if let Some(alg) = self.security.signature_algorithm
                    && alg.is_ecdsa() != key.is_ec()
                {
                    return Err(ConfigError::Validation(format!(
                        "security.signature_algorithm {} does not match the SP key type",
                        alg.uri()
                    )));
                }
                Ok(())
            }
            None if self.security.signs_anything() => Err(ConfigError::Validation(
                "Request signing is enabled but sp.private_key is not set".into(),
            )),
            None => Ok(()),
        }
    }

    /// Static tenants as IdP descriptors.
    pub fn idp_configs(&self) -> Vec<IdpConfig> {
        self.tenants
            .iter()
            .map(|(key, tenant)| tenant.to_idp_config(key))
            .collect()
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {1}: {0}")]
    Io(std::io::Error, std::path::PathBuf),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),

    #[error("Configuration validation error: {0}")]
    Validation(String),
}

/// Expand `${VAR}` references, leaving anything after a `#` untouched.
fn expand_env_vars(input: &str) -> Result<String, ConfigError> {
    let re = regex::Regex::new(r"\$\{([^}]+)\}")
        .map_err(|e| ConfigError::Validation(e.to_string()))?;
    let mut result = String::with_capacity(input.len());

    for line in input.lines() {
        let comment_pos = line.find('#');
        let mut last_end = 0;

        for cap in re.captures_iter(line) {
            let Some(whole) = cap.get(0) else {
                continue;
            };
            if let Some(pos) = comment_pos
                && whole.start() >= pos
            {
                continue;
            }

            result.push_str(&line[last_end..whole.start()]);
            let var_name = &cap[1];
            let value = std::env::var(var_name)
                .map_err(|_| ConfigError::EnvVarNotFound(var_name.to_string()))?;
            result.push_str(&value);
            last_end = whole.end();
        }

        result.push_str(&line[last_end..]);
        result.push('\n');
    }

    if !input.ends_with('\n') && result.ends_with('\n') {
        result.pop();
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::crypto::test_support::generate_rsa_certificate;

    fn minimal() -> String {
        let (cert, _) = generate_rsa_certificate("idp.acme.com");
        format!(
            r#"
            base_url = "https://app.example.com/"

            [tenants.acme]
            entity_id = "https://idp.acme.com/saml"
            sso_url = "https://idp.acme.com/sso"
            certificate = """{cert}"""
            hosts = ["acme.example.com"]
            "#
        )
    }

    #[test]
    fn test_minimal_config() {
        let config = SamlConfig::from_str(&minimal()).unwrap();
        assert_eq!(config.routes_prefix, "saml2");
        assert_eq!(config.base_url.as_deref(), Some("https://app.example.com"));
        assert!(config.security.strict);
        assert!(!config.security.allow_unsolicited);

        let idps = config.idp_configs();
        assert_eq!(idps.len(), 1);
        assert_eq!(idps[0].key, "acme");
        assert_eq!(idps[0].certificates.len(), 1);
    }

    #[test]
    fn test_certs_table_is_normalized() {
        let config = SamlConfig::from_str(
            r#"
            base_url = "https://app.example.com"

            [tenants.acme]
            entity_id = "https://idp.acme.com/saml"
            sso_url = "https://idp.acme.com/sso"

            [tenants.acme.certs]
            fingerprint = "AB:CD:EF"
            fingerprint_algorithm = "sha1"
            "#,
        )
        .unwrap();
        let idp = &config.idp_configs()[0];
        assert_eq!(idp.cert_fingerprint.as_deref(), Some("AB:CD:EF"));
        assert_eq!(
            idp.fingerprint_algorithm,
            crate::crypto::FingerprintAlgorithm::Sha1
        );
    }

    #[test]
    fn test_tenant_without_trust_material_is_rejected() {
        let err = SamlConfig::from_str(
            r#"
            base_url = "https://app.example.com"

            [tenants.acme]
            entity_id = "https://idp.acme.com/saml"
            sso_url = "https://idp.acme.com/sso"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn test_signing_requires_private_key() {
        let err = SamlConfig::from_str(
            r#"
            base_url = "https://app.example.com"

            [security]
            authn_requests_signed = true
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("sp.private_key"));
    }

    #[test]
    fn test_sp_urls_or_base_url_required() {
        assert!(SamlConfig::from_str("").is_err());
        assert!(
            SamlConfig::from_str(
                r#"
                [sp]
                entity_id = "https://sp.example.com"
                acs_url = "https://sp.example.com/acs"
                "#
            )
            .is_ok()
        );
    }

    #[test]
    fn test_unknown_default_tenant_rejected() {
        let err = SamlConfig::from_str(
            r#"
            base_url = "https://app.example.com"
            default_tenant = "nobody"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("nobody"));
    }

    #[test]
    fn test_unknown_fields_rejected() {
        assert!(matches!(
            SamlConfig::from_str("base_url = \"https://a.example.com\"\nbogus = 1"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_env_var_expansion() {
        temp_env::with_var("TEST_SAML_BASE_URL", Some("https://env.example.com"), || {
            let config = SamlConfig::from_str("base_url = \"${TEST_SAML_BASE_URL}\"").unwrap();
            assert_eq!(config.base_url.as_deref(), Some("https://env.example.com"));
        });
    }

    #[test]
    fn test_env_var_missing() {
        temp_env::with_var_unset("TEST_SAML_MISSING", || {
            let err = expand_env_vars("key = \"${TEST_SAML_MISSING}\"").unwrap_err();
            assert!(matches!(err, ConfigError::EnvVarNotFound(name) if name == "TEST_SAML_MISSING"));
        });
    }

    #[test]
    fn test_env_var_in_comment_ignored() {
        let result = expand_env_vars("# key = \"${NONEXISTENT_VAR}\"").unwrap();
        assert_eq!(result, "# key = \"${NONEXISTENT_VAR}\"");
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(minimal().as_bytes()).unwrap();
        let config = SamlConfig::from_file(file.path()).unwrap();
        assert!(config.tenants.contains_key("acme"));

        let missing = SamlConfig::from_file("/nonexistent/saml-sp.toml");
        assert!(matches!(missing, Err(ConfigError::Io(..))));
    }
}

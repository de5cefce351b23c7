use serde::{Deserialize, Serialize};

/// Application session settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionConfig {
    /// Upper bound on a session's lifetime.
    #[serde(default = "default_duration")]
    pub duration_secs: u64,

    /// Never outlive the assertion (`SessionNotOnOrAfter`, or the assertion's
    /// own `NotOnOrAfter`) unless the host extends the session explicitly.
    #[serde(default = "default_true")]
    pub cap_to_assertion: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            duration_secs: default_duration(),
            cap_to_assertion: true,
        }
    }
}

/// IdP metadata cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetadataCacheConfig {
    /// Entries older than this are treated as missing.
    #[serde(default = "default_metadata_ttl")]
    pub ttl_secs: u64,

    /// Background refresh period.
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_secs: u64,

    /// HTTP request timeout for metadata fetches.
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_secs: u64,

    /// Permit plain-HTTP metadata URLs (development only).
    #[serde(default)]
    pub allow_http: bool,
}

impl Default for MetadataCacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_metadata_ttl(),
            refresh_interval_secs: default_refresh_interval(),
            fetch_timeout_secs: default_fetch_timeout(),
            allow_http: false,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_duration() -> u64 {
    8 * 60 * 60
}

fn default_metadata_ttl() -> u64 {
    3600 // IdP metadata rotates rarely
}

fn default_refresh_interval() -> u64 {
    900
}

fn default_fetch_timeout() -> u64 {
    10
}

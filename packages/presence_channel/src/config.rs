use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

// =============================================================================
// File config (figment-deserialized from defaults / presence.toml / env vars)
// =============================================================================
//
// Three equivalent ways to configure:
//
//   presence.toml:   [channel]
//                    base_url = "https://console.example.com/api"
//
//   env var:         PRESENCE_CHANNEL__BASE_URL=https://...   (double underscore = nesting)
//
//   (single underscore stays within field names: PRESENCE_CHANNEL__RECONNECT_DELAY_MS)

/// Default ceiling for a stored credential, in UTF-16 code units. Anything
/// longer is corrupt.
pub const DEFAULT_MAX_CREDENTIAL_LEN: usize = 15_000;

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub channel: ChannelFileConfig,
}

/// Channel tunables (lives under `[channel]` in presence.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChannelFileConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_events_path")]
    pub events_path: String,
    #[serde(default = "default_online_users_path")]
    pub online_users_path: String,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    #[serde(default = "default_credential_check_interval_ms")]
    pub credential_check_interval_ms: u64,
    #[serde(default = "default_max_credential_len")]
    pub max_credential_len: usize,
}

impl Default for ChannelFileConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            events_path: default_events_path(),
            online_users_path: default_online_users_path(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            credential_check_interval_ms: default_credential_check_interval_ms(),
            max_credential_len: default_max_credential_len(),
        }
    }
}

fn default_base_url() -> String {
    "http://127.0.0.1:3000/api".to_string()
}
fn default_events_path() -> String {
    "/events".to_string()
}
fn default_online_users_path() -> String {
    "/users/online".to_string()
}
fn default_reconnect_delay_ms() -> u64 {
    5_000
}
fn default_credential_check_interval_ms() -> u64 {
    5_000
}
fn default_max_credential_len() -> usize {
    DEFAULT_MAX_CREDENTIAL_LEN
}

/// Build a figment that layers: defaults → presence.toml → PRESENCE_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `PRESENCE_CHANNEL__BASE_URL=...`  →  `channel.base_url = ...`
pub fn load_config(config_file: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(config_file))
        .merge(Env::prefixed("PRESENCE_").split("__"))
}

// =============================================================================
// Runtime config (derived from FileConfig, used by the channel and monitor)
// =============================================================================

/// Resolved channel configuration (runtime view).
#[derive(Clone, Debug)]
pub struct ChannelConfig {
    /// Push endpoint; the credential is appended as `?token=`.
    pub events_url: String,
    /// Presence snapshot endpoint polled once per successful open.
    pub online_users_url: String,
    /// Fixed delay before the single retry after a transport error.
    pub reconnect_delay: Duration,
    /// Interval of the periodic credential check.
    pub credential_check_interval: Duration,
    /// Credentials longer than this (UTF-16 code units) are treated as corrupt.
    pub max_credential_len: usize,
}

impl ChannelConfig {
    pub fn from_file(fc: &ChannelFileConfig) -> Self {
        let base = fc.base_url.trim_end_matches('/');
        Self {
            events_url: format!("{}{}", base, fc.events_path),
            online_users_url: format!("{}{}", base, fc.online_users_path),
            reconnect_delay: Duration::from_millis(fc.reconnect_delay_ms),
            credential_check_interval: Duration::from_millis(fc.credential_check_interval_ms),
            max_credential_len: fc.max_credential_len,
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self::from_file(&ChannelFileConfig::default())
    }
}

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use spyglass_relay::{RelaySettings, SessionDefaults};

// =============================================================================
// Unified config (figment-deserialized from defaults / spyglass.toml / env)
// =============================================================================
//
// Two equivalent ways to configure:
//
//   spyglass.toml:   [relay]
//                    default_width = 2560
//
//   env var:         SPYGLASS_RELAY__DEFAULT_WIDTH=2560   (double underscore = nesting)
//
// (single underscore stays within field names: SPYGLASS_AUTH__TOKEN_TTL_SECS)

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub relay: RelayFileConfig,
    #[serde(default)]
    pub standalone: StandaloneFileConfig,
    #[serde(default)]
    pub auth: AuthFileConfig,
}

/// Gateway listener settings (lives under `[server]` in spyglass.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Engine-link tunables (lives under `[relay]` in spyglass.toml). The
/// screen and keyboard defaults apply when a viewer omits the matching
/// query parameters.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RelayFileConfig {
    #[serde(default = "default_screen_width")]
    pub default_width: u32,
    #[serde(default = "default_screen_height")]
    pub default_height: u32,
    #[serde(default = "default_keyboard_layout")]
    pub default_keyboard: String,
    #[serde(default = "default_socket_timeout_ms")]
    pub socket_timeout_ms: u64,
}

impl Default for RelayFileConfig {
    fn default() -> Self {
        Self {
            default_width: default_screen_width(),
            default_height: default_screen_height(),
            default_keyboard: default_keyboard_layout(),
            socket_timeout_ms: default_socket_timeout_ms(),
        }
    }
}

/// Fixed engine for standalone deployments (lives under `[standalone]`).
/// When both fields are set, every viewer is relayed to this engine and
/// per-viewer host/session/token parameters are ignored.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StandaloneFileConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

/// Token issuing tunables (lives under `[auth]` in spyglass.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuthFileConfig {
    #[serde(default = "default_token_ttl")]
    pub token_ttl_secs: u64,
}

impl Default for AuthFileConfig {
    fn default() -> Self {
        Self {
            token_ttl_secs: default_token_ttl(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_screen_width() -> u32 {
    1920
}
fn default_screen_height() -> u32 {
    1080
}
fn default_keyboard_layout() -> String {
    "gb".to_string()
}
fn default_socket_timeout_ms() -> u64 {
    15000
}
fn default_token_ttl() -> u64 {
    60
}

/// The fixed engine behind a standalone gateway (runtime view).
#[derive(Clone, Debug)]
pub struct StandaloneEngine {
    pub hostname: String,
    pub port: u16,
}

impl FileConfig {
    /// Standalone engine address, present only when both `[standalone]`
    /// fields are configured.
    pub fn standalone_engine(&self) -> Option<StandaloneEngine> {
        match (&self.standalone.host, self.standalone.port) {
            (Some(host), Some(port)) => Some(StandaloneEngine {
                hostname: host.clone(),
                port,
            }),
            _ => None,
        }
    }

    /// Settings handed to every host connection the gateway opens.
    pub fn relay_settings(&self) -> RelaySettings {
        RelaySettings {
            defaults: SessionDefaults {
                width: self.relay.default_width,
                height: self.relay.default_height,
                keyboard: self.relay.default_keyboard.clone(),
            },
            socket_timeout: Duration::from_millis(self.relay.socket_timeout_ms),
            standalone: self.standalone_engine().is_some(),
        }
    }
}

/// Build a figment that layers: defaults → spyglass.toml → SPYGLASS_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `SPYGLASS_SERVER__PORT=9000`  →  `server.port = 9000`
///   `SPYGLASS_STANDALONE__HOST=render-host`  →  `standalone.host = "render-host"`
pub fn load_config(config_file: Option<&Path>) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    let toml_path = config_file
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("spyglass.toml"));

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(toml_path))
        .merge(Env::prefixed("SPYGLASS_").split("__"))
}

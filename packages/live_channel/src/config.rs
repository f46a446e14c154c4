use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

// =============================================================================
// Unified config (figment-deserialized from defaults / live.toml / env vars)
// =============================================================================
//
//   live.toml:       [transport]
//                    url = "ws://localhost:3000/api/live/ws"
//
//   env var:         LIVE_TRANSPORT__URL=ws://...   (double underscore = nesting)
//
//   (single underscore stays within field names: LIVE_CHANNELS__REQUEST_TIMEOUT_SECS)

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub transport: TransportFileConfig,
    #[serde(default)]
    pub channels: ChannelsFileConfig,
}

/// Connection tunables (lives under `[transport]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransportFileConfig {
    /// WebSocket endpoint of the live server.
    #[serde(default)]
    pub url: Option<String>,
    /// First reconnect delay; doubles per attempt.
    #[serde(default = "default_reconnect_base_ms")]
    pub reconnect_base_ms: u64,
    #[serde(default = "default_reconnect_max_secs")]
    pub reconnect_max_secs: u64,
    /// Consecutive failed connects before giving up. 0 = retry forever.
    #[serde(default)]
    pub max_reconnect_attempts: u32,
}

impl Default for TransportFileConfig {
    fn default() -> Self {
        Self {
            url: None,
            reconnect_base_ms: default_reconnect_base_ms(),
            reconnect_max_secs: default_reconnect_max_secs(),
            max_reconnect_attempts: 0,
        }
    }
}

/// Channel layer tunables (lives under `[channels]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChannelsFileConfig {
    /// How long subscribe, publish and presence requests wait for a reply.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for ChannelsFileConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl ChannelsFileConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

fn default_reconnect_base_ms() -> u64 {
    1000
}

fn default_reconnect_max_secs() -> u64 {
    60
}

fn default_request_timeout_secs() -> u64 {
    10
}

/// Build a figment that layers: defaults → TOML file → LIVE_* env vars.
///
/// A missing file is not an error; its layer is simply empty.
///
/// Env vars use double-underscore for nesting into sections:
///   `LIVE_TRANSPORT__URL=ws://host/ws`  →  `transport.url = "ws://host/ws"`
///   `LIVE_CHANNELS__REQUEST_TIMEOUT_SECS=5`  →  `channels.request_timeout_secs = 5`
pub fn load_config(path: Option<&Path>) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    let mut figment = Figment::from(Serialized::defaults(FileConfig::default()));
    if let Some(path) = path {
        figment = figment.merge(Toml::file(path));
    }
    figment.merge(Env::prefixed("LIVE_").split("__"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_defaults() {
        let tc = TransportFileConfig::default();
        assert_eq!(tc.url, None);
        assert_eq!(tc.reconnect_base_ms, 1000);
        assert_eq!(tc.reconnect_max_secs, 60);
        assert_eq!(tc.max_reconnect_attempts, 0);
    }

    #[test]
    fn test_channels_defaults() {
        let cc = ChannelsFileConfig::default();
        assert_eq!(cc.request_timeout(), Duration::from_secs(10));
    }

    // ── load_config ─────────────────────────────────────────────────────

    #[test]
    fn test_load_config_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let fc: FileConfig = load_config(Some(&tmp.path().join("missing.toml")))
            .extract()
            .unwrap();
        assert_eq!(fc.transport.reconnect_base_ms, 1000);
        assert_eq!(fc.channels.request_timeout_secs, 10);
    }

    #[test]
    fn test_load_config_toml_sets_values() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("live.toml");
        std::fs::write(
            &path,
            "[transport]\nurl = \"ws://127.0.0.1:3000/ws\"\nmax_reconnect_attempts = 3\n\n[channels]\nrequest_timeout_secs = 2\n",
        )
        .unwrap();

        let fc: FileConfig = load_config(Some(&path)).extract().unwrap();
        assert_eq!(fc.transport.url.as_deref(), Some("ws://127.0.0.1:3000/ws"));
        assert_eq!(fc.transport.max_reconnect_attempts, 3);
        // Unset fields keep their defaults.
        assert_eq!(fc.transport.reconnect_max_secs, 60);
        assert_eq!(fc.channels.request_timeout_secs, 2);
    }

    #[test]
    fn test_load_config_partial_section() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("live.toml");
        std::fs::write(&path, "[channels]\nrequest_timeout_secs = 30\n").unwrap();

        let fc: FileConfig = load_config(Some(&path)).extract().unwrap();
        assert_eq!(fc.transport.url, None);
        assert_eq!(fc.channels.request_timeout_secs, 30);
    }

    #[test]
    fn test_load_config_rejects_bad_type() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("live.toml");
        std::fs::write(&path, "[channels]\nrequest_timeout_secs = \"soon\"\n").unwrap();

        assert!(load_config(Some(&path)).extract::<FileConfig>().is_err());
    }
}

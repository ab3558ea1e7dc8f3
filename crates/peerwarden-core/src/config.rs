use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::address::DEFAULT_SUBNET;

/// Client-side MTU written into mirror files.
pub const DEFAULT_CLIENT_MTU: u32 = 1420;

/// MTU written into the shared interface config.
pub const DEFAULT_SERVER_MTU: u32 = 1380;

pub const DEFAULT_DNS: &str = "1.1.1.1";

pub const DEFAULT_LISTEN_PORT: u16 = 51820;

pub const KEY_SECRET_VAR: &str = "PEERWARDEN_KEY_SECRET";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GatewayConfig {
    pub interface: String,
    pub subnet: String,
    pub listen_port: u16,
    pub mtu: u32,
    pub server_mtu: u32,
    pub dns: String,
    pub endpoint: Option<String>,
    pub persistent_keepalive: u16,
    pub database_url: String,
    pub mirror_dir: PathBuf,
    pub shared_config_path: PathBuf,
    pub trigger_path: PathBuf,
    pub reconcile_cooldown_secs: u64,
    pub expiry_interval_secs: u64,
    pub quota_interval_secs: u64,
    pub schedule_interval_secs: u64,
    pub live_timeout_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            interface: "wg0".into(),
            subnet: DEFAULT_SUBNET.into(),
            listen_port: DEFAULT_LISTEN_PORT,
            mtu: DEFAULT_CLIENT_MTU,
            server_mtu: DEFAULT_SERVER_MTU,
            dns: DEFAULT_DNS.into(),
            endpoint: None,
            persistent_keepalive: 25,
            database_url: "sqlite:///var/lib/peerwarden/peerwarden.db".into(),
            mirror_dir: PathBuf::from("/etc/wireguard/clients"),
            shared_config_path: PathBuf::from("/etc/wireguard/wg0.conf"),
            trigger_path: PathBuf::from("/var/lib/peerwarden/reconcile.trigger"),
            reconcile_cooldown_secs: 30,
            expiry_interval_secs: 60,
            quota_interval_secs: 60,
            schedule_interval_secs: 60,
            live_timeout_secs: 5,
        }
    }
}

impl GatewayConfig {
    pub fn reconcile_cooldown(&self) -> Duration {
        Duration::from_secs(self.reconcile_cooldown_secs)
    }

    pub fn live_timeout(&self) -> Duration {
        Duration::from_secs(self.live_timeout_secs)
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Read(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("missing required environment variable: {var}")]
    MissingEnvVar { var: &'static str },

    #[error("{KEY_SECRET_VAR} must be exactly 64 hex characters (32 bytes)")]
    InvalidKeySecret,
}

/// Load the gateway config; a missing file yields defaults.
pub async fn load(path: &Path) -> Result<GatewayConfig, ConfigError> {
    debug!(path = %path.display(), "loading config");

    match tokio::fs::read_to_string(path).await {
        Ok(contents) => {
            let config: GatewayConfig = toml::from_str(&contents)?;
            info!(
                path = %path.display(),
                interface = %config.interface,
                subnet = %config.subnet,
                "loaded config"
            );
            Ok(config)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!(path = %path.display(), "config file not found, using defaults");
            Ok(GatewayConfig::default())
        }
        Err(e) => Err(ConfigError::Read(e)),
    }
}

// ---------------------------------------------------------------------------
// Environment secrets
// ---------------------------------------------------------------------------

pub struct Secrets {
    pub key_secret: [u8; 32],
    pub database_url: Option<String>,
}

impl std::fmt::Debug for Secrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Secrets")
            .field("database_url", &self.database_url)
            .finish_non_exhaustive()
    }
}

fn parse_hex_32(value: &str) -> Result<[u8; 32], ConfigError> {
    let bytes = hex::decode(value.trim()).map_err(|_| ConfigError::InvalidKeySecret)?;
    bytes.try_into().map_err(|_| ConfigError::InvalidKeySecret)
}

impl Secrets {
    pub fn from_env() -> Result<Self, ConfigError> {
        let key_hex = env::var(KEY_SECRET_VAR).map_err(|_| ConfigError::MissingEnvVar {
            var: KEY_SECRET_VAR,
        })?;
        Ok(Self {
            key_secret: parse_hex_32(&key_hex)?,
            database_url: env::var("DATABASE_URL").ok(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn empty_file_is_defaults() {
        let parsed: GatewayConfig = toml::from_str("").unwrap();
        assert_eq!(parsed, GatewayConfig::default());
        assert_eq!(parsed.subnet, "10.100.0.0/24");
        assert_eq!(parsed.listen_port, 51820);
        assert_eq!((parsed.mtu, parsed.server_mtu), (1420, 1380));
        assert_eq!(parsed.dns, "1.1.1.1");
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let parsed: GatewayConfig = toml::from_str(
            "interface = \"wg1\"\nendpoint = \"vpn.example.com\"\nquota_interval_secs = 5\n",
        )
        .unwrap();
        assert_eq!(parsed.interface, "wg1");
        assert_eq!(parsed.endpoint.as_deref(), Some("vpn.example.com"));
        assert_eq!(parsed.quota_interval_secs, 5);
        assert_eq!(parsed.expiry_interval_secs, 60);
    }

    #[tokio::test]
    async fn missing_file_loads_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load(&dir.path().join("absent.toml")).await.unwrap();
        assert_eq!(config, GatewayConfig::default());
    }

    #[test_case(&"ab".repeat(32), true ; "valid")]
    #[test_case(&"ab".repeat(31), false ; "too short")]
    #[test_case(&"zz".repeat(32), false ; "not hex")]
    fn key_secret_parsing(value: &str, ok: bool) {
        assert_eq!(parse_hex_32(value).is_ok(), ok);
    }
}

use anyhow::{Context, Result};
use serde::Deserialize;
use std::{collections::HashMap, fs, io::ErrorKind, path::Path};
use tracing::info;

use crate::authenticator::TrustAnchor;

pub const DEFAULT_CONFIG_FILE: &str = "config.toml";

const DEFAULT_CONFIG: &str = r#"# Verify relay-signed handshakes. When false, connections are routed
# without authentication and keep their socket address.
enabled = true

# Base64 SubjectPublicKeyInfo of the relay signing key. Defaults to the
# production relay network key.
# trust_anchor = "MFkw..."

# Clients refused after their real address is restored.
# banned_ips = ["198.51.100.0/24"]

[listen]
ip = "0.0.0.0"
port = 25577
# allowed_relay_ips = ["10.0.0.0/8"]
# fallback = "lobby"

[targets.lobby]
host = "127.0.0.1"
port = 25565
"#;

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    pub trust_anchor: Option<String>,
    pub banned_ips: Option<Vec<String>>,
    pub listen: ListenConfig,
    #[serde(default)]
    pub targets: HashMap<String, TargetConfig>,
}

#[derive(Debug, Deserialize)]
pub struct ListenConfig {
    pub ip: String,
    pub port: u16,
    pub allowed_relay_ips: Option<Vec<String>>,
    /// Target used for legacy pings and hostnames with no entry in `targets`.
    pub fallback: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TargetConfig {
    pub host: String,
    pub port: u16,
}

const fn enabled_by_default() -> bool {
    true
}

impl Config {
    pub fn trust_anchor(&self) -> Result<TrustAnchor> {
        match &self.trust_anchor {
            Some(encoded) => TrustAnchor::from_spki_base64(encoded),
            None => TrustAnchor::production(),
        }
    }
}

/// Reads the config file at `path`, writing the default one first if it
/// does not exist yet.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
                fs::create_dir_all(dir)
                    .with_context(|| format!("Failed to create {}", dir.display()))?;
            }
            fs::write(path, DEFAULT_CONFIG)
                .with_context(|| format!("Failed to create {}", path.display()))?;
            info!(config_file = %path.display(), "Wrote default configuration");
            DEFAULT_CONFIG.to_string()
        }
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to read {}", path.display()));
        }
    };
    toml::from_str(&content)
        .with_context(|| format!("Failed to parse {} as valid TOML", path.display()))
}

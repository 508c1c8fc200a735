//! Configuration system for gridmesh.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $GRIDMESH_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/gridmesh/config.toml
//!   3. ~/.config/gridmesh/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GridmeshConfig {
    pub identity: IdentityConfig,
    pub network: NetworkConfig,
    pub directory: DirectoryConfig,
    pub session: SessionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Path to the P-256 keypair, PKCS8 PEM. Auto-generated on first run.
    pub keypair_path: PathBuf,
    /// The name this node registers and announces itself under.
    pub name: String,
    /// File or directory exported as this node's Merkle tree, built once at
    /// startup (§5: "mutations MUST happen before any session is started").
    /// `None` means this node exports nothing and advertises the all-zero root.
    pub export_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Local address to bind the single UDP socket to.
    pub bind_addr: String,
    /// UDP port. 0 = OS-assigned.
    pub bind_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectoryConfig {
    /// Base URL of the HTTPS directory service, e.g. `https://directory.example`.
    /// Used for the four read-only lookups (§4.5): peers, addresses, key, root.
    pub base_url: String,
    /// `host:port` of the directory's datagram endpoint, used for the
    /// registration handshake (§4.6) and as the NAT-traversal mediator —
    /// a distinct channel from `base_url`, since registration pushes our
    /// Hello/PublicKey/Root over the same datagram protocol peers speak,
    /// rather than pulling over HTTPS.
    pub udp_addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Seconds to wait for a reply before retrying a request.
    pub fetch_timeout_secs: u64,
    /// Seconds between keep-alive Hello messages to an established peer.
    pub keepalive_interval_secs: u64,
    /// Seconds without a reply before a peer is declared dead.
    pub dead_peer_timeout_secs: u64,
    /// Consecutive Hello timeouts before falling back to NAT traversal.
    pub nat_fallback_after_misses: u32,
    /// Whether outgoing requests are signed by default.
    pub signature_enabled: bool,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for GridmeshConfig {
    fn default() -> Self {
        Self {
            identity: IdentityConfig::default(),
            network: NetworkConfig::default(),
            directory: DirectoryConfig::default(),
            session: SessionConfig::default(),
        }
    }
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            keypair_path: config_dir().join("keypair.pem"),
            name: String::new(),
            export_path: None,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self { bind_addr: "0.0.0.0".to_string(), bind_port: 0 }
    }
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            base_url: "https://localhost:8443".to_string(),
            udp_addr: "127.0.0.1:9000".to_string(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            fetch_timeout_secs: 5,
            keepalive_interval_secs: 60,
            dead_peer_timeout_secs: 10,
            nat_fallback_after_misses: 5,
            signature_enabled: true,
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("gridmesh")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME").map(PathBuf::from).unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl GridmeshConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            GridmeshConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("GRIDMESH_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&GridmeshConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply GRIDMESH_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("GRIDMESH_IDENTITY__NAME") {
            self.identity.name = v;
        }
        if let Ok(v) = std::env::var("GRIDMESH_NETWORK__BIND_ADDR") {
            self.network.bind_addr = v;
        }
        if let Ok(v) = std::env::var("GRIDMESH_NETWORK__BIND_PORT") {
            if let Ok(p) = v.parse() {
                self.network.bind_port = p;
            }
        }
        if let Ok(v) = std::env::var("GRIDMESH_DIRECTORY__BASE_URL") {
            self.directory.base_url = v;
        }
        if let Ok(v) = std::env::var("GRIDMESH_DIRECTORY__UDP_ADDR") {
            self.directory.udp_addr = v;
        }
        if let Ok(v) = std::env::var("GRIDMESH_SESSION__SIGNATURE_ENABLED") {
            self.session.signature_enabled = v == "true" || v == "1";
        }
    }
}

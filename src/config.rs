use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::session::{generate_id, Position, SessionConfig};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub identity: IdentityConfig,
    #[serde(default)]
    pub session: SessionSettings,
    #[serde(default)]
    pub ice: IceConfig,
    /// Peers we have completed a handshake with before, for display only.
    /// Absence is normal; this is a convenience cache, not state.
    #[serde(default)]
    pub known_peers: BTreeMap<String, KnownPeer>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    #[serde(default = "default_nickname")]
    pub nickname: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    #[serde(default = "default_link_base")]
    pub link_base: String,
    #[serde(default = "default_max_link_len")]
    pub max_link_len: usize,
    /// How long an un-answered offer stays pending, in milliseconds
    #[serde(default = "default_pending_timeout_ms")]
    pub pending_timeout_ms: u64,
    #[serde(default = "default_gather_timeout_ms")]
    pub gather_timeout_ms: u64,
    #[serde(default = "default_connecting_timeout_ms")]
    pub connecting_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceConfig {
    #[serde(default = "default_stun_servers")]
    pub stun_servers: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnownPeer {
    pub nickname: String,
    #[serde(default)]
    pub position: Option<Position>,
    pub last_seen: u64,
}

fn default_nickname() -> String {
    format!("guest-{}", generate_id(4))
}

fn default_link_base() -> String {
    "https://earshot.chat".to_string()
}

fn default_max_link_len() -> usize {
    2000
}

fn default_pending_timeout_ms() -> u64 {
    60_000
}

fn default_gather_timeout_ms() -> u64 {
    3_000
}

fn default_connecting_timeout_ms() -> u64 {
    60_000
}

fn default_stun_servers() -> Vec<String> {
    vec![
        "stun:stun.l.google.com:19302".to_string(),
        "stun:stun.cloudflare.com:3478".to_string(),
    ]
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            nickname: default_nickname(),
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            link_base: default_link_base(),
            max_link_len: default_max_link_len(),
            pending_timeout_ms: default_pending_timeout_ms(),
            gather_timeout_ms: default_gather_timeout_ms(),
            connecting_timeout_ms: default_connecting_timeout_ms(),
        }
    }
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            stun_servers: default_stun_servers(),
        }
    }
}

impl Config {
    /// Load config from file, or create default if doesn't exist
    pub fn load() -> Result<Self> {
        let config_path = get_config_path();

        if config_path.exists() {
            let content =
                fs::read_to_string(&config_path).context("Failed to read config file")?;
            toml::from_str(&content).context("Failed to parse config file")
        } else {
            let config = Config::default();
            config.save()?;
            Ok(config)
        }
    }

    /// Save config to file
    pub fn save(&self) -> Result<()> {
        let config_path = get_config_path();

        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(&config_path, content)?;

        Ok(())
    }

    /// Record display metadata for a peer we completed a handshake with
    pub fn remember_peer(&mut self, peer_id: &str, nickname: &str, position: Option<Position>) {
        let last_seen = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        self.known_peers.insert(
            peer_id.to_string(),
            KnownPeer {
                nickname: nickname.to_string(),
                position,
                last_seen,
            },
        );
    }

    /// The negotiation tunables in the form the session core consumes
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            link_base: self.session.link_base.clone(),
            max_link_len: self.session.max_link_len,
            pending_timeout_ms: self.session.pending_timeout_ms,
            gather_timeout_ms: self.session.gather_timeout_ms,
            connecting_timeout_ms: self.session.connecting_timeout_ms,
            stun_servers: self.ice.stun_servers.clone(),
        }
    }
}

/// Get the earshot directory (~/.earshot)
pub fn get_earshot_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".earshot")
}

/// Get the config file path (~/.earshot/config.toml)
pub fn get_config_path() -> PathBuf {
    get_earshot_dir().join("config.toml")
}

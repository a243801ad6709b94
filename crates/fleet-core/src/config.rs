//! Configuration system for fleet.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $FLEET_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/fleet/config.toml
//!   3. ~/.config/fleet/config.toml
//!
//! One file serves both roles; the orchestrator reads `server` and
//! `liveness`, agents read `agent`, and both read `node` and `bus`.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    pub node: NodeConfig,
    pub bus: BusConfig,
    pub server: ServerConfig,
    pub agent: AgentConfig,
    pub liveness: LivenessConfig,
    pub kubeadm: KubeadmConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// This agent's node id. Empty = hostname.
    pub node_id: String,
    /// Queue group for requests addressed to "any agent".
    pub group: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Address the orchestrator's bus hub listens on.
    pub listen_addr: String,
    /// Address agents connect to.
    pub server_addr: String,
    /// Seconds between agent reconnect attempts.
    pub reconnect_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Engine instance name recorded as `Operation.host`. Empty = hostname.
    pub host: String,
    /// Default per-NodeStep reply budget.
    pub node_step_timeout_secs: u64,
    /// NodeSteps in flight per Step. 0 = unbounded.
    pub max_parallel_node_steps: u32,
    /// Artifact server handed to agents in every envelope.
    pub resource_server_url: String,
    /// Operation/cluster snapshot file. Empty = in-memory only.
    pub state_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub work_dir: PathBuf,
    pub os_release_path: PathBuf,
    /// Upper bound for a single shell command. 0 = none.
    pub command_timeout_secs: u64,
    /// Time in-flight handlers get to finish on shutdown.
    pub shutdown_grace_secs: u64,
    /// Port the liveness signal listener binds.
    pub signal_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LivenessConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    pub probe_timeout_ms: u64,
    /// Well-known port probed on every node.
    pub signal_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KubeadmConfig {
    /// Attempts for init/join before giving up.
    pub retry_attempts: u32,
    pub retry_backoff_secs: u64,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            group: "default".to_string(),
        }
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:7420".to_string(),
            server_addr: "127.0.0.1:7420".to_string(),
            reconnect_secs: 3,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            node_step_timeout_secs: 600,
            max_parallel_node_steps: 0,
            resource_server_url: String::new(),
            state_path: data_dir().join("state.json"),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from("/tmp/fleet-agent"),
            os_release_path: PathBuf::from("/etc/os-release"),
            command_timeout_secs: 0,
            shutdown_grace_secs: 30,
            signal_port: DEFAULT_SIGNAL_PORT,
        }
    }
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 30,
            probe_timeout_ms: 2000,
            signal_port: DEFAULT_SIGNAL_PORT,
        }
    }
}

impl Default for KubeadmConfig {
    fn default() -> Self {
        Self {
            retry_attempts: 5,
            retry_backoff_secs: 3,
        }
    }
}

pub const DEFAULT_SIGNAL_PORT: u16 = 7421;

impl ServerConfig {
    pub fn node_step_timeout(&self) -> Duration {
        Duration::from_secs(self.node_step_timeout_secs)
    }
}

impl AgentConfig {
    pub fn command_timeout(&self) -> Option<Duration> {
        match self.command_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

impl LivenessConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

impl KubeadmConfig {
    pub fn backoff(&self) -> Duration {
        Duration::from_secs(self.retry_backoff_secs)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("fleet")
}

pub fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".local").join("share"))
        .join("fleet")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
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

impl FleetConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            Self::from_file(&path)?
        } else {
            FleetConfig::default()
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("FLEET_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&FleetConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply FLEET_* overrides. `lookup` is the environment in production.
    fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("FLEET_NODE__NODE_ID") {
            self.node.node_id = v;
        }
        if let Some(v) = lookup("FLEET_NODE__GROUP") {
            self.node.group = v;
        }
        if let Some(v) = lookup("FLEET_BUS__LISTEN_ADDR") {
            self.bus.listen_addr = v;
        }
        if let Some(v) = lookup("FLEET_BUS__SERVER_ADDR") {
            self.bus.server_addr = v;
        }
        if let Some(v) = lookup("FLEET_SERVER__HOST") {
            self.server.host = v;
        }
        if let Some(v) = lookup("FLEET_SERVER__NODE_STEP_TIMEOUT_SECS") {
            if let Ok(n) = v.parse() {
                self.server.node_step_timeout_secs = n;
            }
        }
        if let Some(v) = lookup("FLEET_SERVER__RESOURCE_SERVER_URL") {
            self.server.resource_server_url = v;
        }
        if let Some(v) = lookup("FLEET_AGENT__SIGNAL_PORT") {
            if let Ok(p) = v.parse() {
                self.agent.signal_port = p;
            }
        }
        if let Some(v) = lookup("FLEET_LIVENESS__ENABLED") {
            self.liveness.enabled = v == "true" || v == "1";
        }
        if let Some(v) = lookup("FLEET_LIVENESS__INTERVAL_SECS") {
            if let Ok(n) = v.parse() {
                self.liveness.interval_secs = n;
            }
        }
        if let Some(v) = lookup("FLEET_LIVENESS__SIGNAL_PORT") {
            if let Ok(p) = v.parse() {
                self.liveness.signal_port = p;
            }
        }
    }
}

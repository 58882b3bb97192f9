use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

use crate::agent::{AgentCapability, AuthorizationPolicy};

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub socket_path: String,
    /// Where adapter power state is kept between runs.
    pub state_path: PathBuf,
    pub bluetooth: BluetoothConfig,
    pub obex: ObexConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BluetoothConfig {
    pub agent_capability: AgentCapability,
    pub authorization: AuthorizationPolicy,
    pub request_default_agent: bool,
    /// Ask the bus to activate bluetoothd/obexd when they are not running.
    pub start_service_when_offline: bool,
    /// Power adapters on or off the way they were when the daemon last stopped.
    pub restore_state: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObexConfig {
    pub enabled: bool,
    /// Directory incoming pushes are written to.
    pub save_path: PathBuf,
}

/// `$XDG_RUNTIME_DIR/bluewire.sock`, or the per-user runtime directory.
pub fn default_socket_path() -> String {
    match std::env::var("XDG_RUNTIME_DIR") {
        Ok(dir) if !dir.is_empty() => format!("{}/bluewire.sock", dir),
        _ => format!("/run/user/{}/bluewire.sock", nix::unistd::getuid()),
    }
}

/// `$XDG_STATE_HOME/bluewire/state.toml`, falling back to `~/.local/state`.
pub fn default_state_path() -> PathBuf {
    let base = match std::env::var("XDG_STATE_HOME") {
        Ok(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => match std::env::var("HOME") {
            Ok(home) if !home.is_empty() => PathBuf::from(home).join(".local/state"),
            _ => PathBuf::from("/var/lib"),
        },
    };
    base.join("bluewire").join("state.toml")
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            state_path: default_state_path(),
            bluetooth: BluetoothConfig::default(),
            obex: ObexConfig::default(),
        }
    }
}

impl Default for BluetoothConfig {
    fn default() -> Self {
        Self {
            agent_capability: AgentCapability::DisplayYesNo,
            authorization: AuthorizationPolicy::Ask,
            request_default_agent: true,
            start_service_when_offline: true,
            restore_state: true,
        }
    }
}

impl Default for ObexConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            save_path: PathBuf::from("/tmp"),
        }
    }
}

impl DaemonConfig {
    pub fn load(path: &str) -> Result<Self> {
        match fs::read_to_string(path) {
            Ok(content) => Ok(toml::from_str(&content)?),
            Err(_) => {
                // Create default config if not found
                let config = Self::default();
                if fs::write(path, toml::to_string_pretty(&config)?).is_err() {
                    tracing::debug!("Could not write default config to {}", path);
                }
                Ok(config)
            }
        }
    }
}

/*!
 * Bluewire Daemon Client
 * JSON IPC communication with bluewired
 */

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::io;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Cannot reach bluewired at {path}: {source}")]
    Connect { path: String, source: io::Error },
    #[error("Connection error: {0}")]
    Io(#[from] io::Error),
    #[error("Malformed message: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Daemon closed the connection without replying")]
    Closed,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Request {
    IsOnline,
    AllDevices,
    Device { address: String },
    StartDiscovering { timeout_ms: u32 },
    StopDiscovering,
    Adapters,
    SetAdapter { ubi: String, update: AdapterUpdate },
    Sessions,
    PendingRequests,
    Resolve { id: Uuid, decision: Decision },
    Actions { address: String },
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Deny,
    Accept,
    AcceptAndTrust,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Visibility {
    Hidden,
    AlwaysVisible,
    Temporary { minutes: u32 },
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct AdapterUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub powered: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub visibility: Option<Visibility>,
    pub defaults: bool,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Response {
    Online { online: bool, obex_online: bool, discovering: bool },
    Devices { devices: BTreeMap<String, DeviceInfo> },
    Device { device: DeviceInfo },
    Adapters { adapters: Vec<AdapterEntry> },
    Sessions { sessions: Vec<Session> },
    PendingRequests { requests: Vec<PendingRequest> },
    Actions { address: String, actions: Vec<ActionEntry> },
    Success { message: String },
    Error { message: String },
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub name: String,
    pub icon: String,
    pub address: String,
    #[serde(rename = "UBI")]
    pub ubi: String,
    #[serde(rename = "UUIDs")]
    pub uuids: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AdapterEntry {
    pub title: String,
    pub ubi: String,
    pub name: String,
    pub address: String,
    pub powered: bool,
    pub discoverable: bool,
    pub discoverable_timeout: u32,
    pub discovering: bool,
    pub usable: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub device_address: String,
    pub kind: Value,
    pub transfer: Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PendingRequest {
    pub id: Uuid,
    pub source: String,
    pub address: String,
    pub kind: Value,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ActionEntry {
    pub action: String,
    pub plan: Value,
}

pub struct BluewireClient {
    socket_path: String,
}

impl BluewireClient {
    pub fn new(socket_path: String) -> Self {
        Self { socket_path }
    }

    pub async fn send_request(&self, request: &Request) -> Result<Response, ClientError> {
        let stream = UnixStream::connect(&self.socket_path)
            .await
            .map_err(|source| ClientError::Connect {
                path: self.socket_path.clone(),
                source,
            })?;
        let (reader, mut writer) = stream.into_split();

        let request_json = serde_json::to_string(request)?;
        writer.write_all(request_json.as_bytes()).await?;
        writer.write_all(b"\n").await?;

        let line = BufReader::new(reader)
            .lines()
            .next_line()
            .await?
            .ok_or(ClientError::Closed)?;
        Ok(serde_json::from_str(&line)?)
    }
}

/// Same location the daemon binds by default.
pub fn default_socket_path() -> String {
    match std::env::var("XDG_RUNTIME_DIR") {
        Ok(dir) if !dir.is_empty() => format!("{}/bluewire.sock", dir),
        _ => format!("/run/user/{}/bluewire.sock", nix::unistd::getuid()),
    }
}

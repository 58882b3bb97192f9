/*!
 * Bluetooth Object Model
 * Local projections of adapters, devices and OBEX sessions
 */

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::BluetoothError;

/// Unique bus identifier of a remote object (its D-Bus object path).
pub type Ubi = String;

/// A bus-agnostic property value as delivered by the external service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropValue {
    Bool(bool),
    U32(u32),
    Str(String),
    List(Vec<String>),
}

pub type Properties = HashMap<String, PropValue>;

fn prop_bool(props: &Properties, key: &str) -> Option<bool> {
    match props.get(key) {
        Some(PropValue::Bool(value)) => Some(*value),
        _ => None,
    }
}

fn prop_u32(props: &Properties, key: &str) -> Option<u32> {
    match props.get(key) {
        Some(PropValue::U32(value)) => Some(*value),
        _ => None,
    }
}

fn prop_str(props: &Properties, key: &str) -> Option<String> {
    match props.get(key) {
        Some(PropValue::Str(value)) => Some(value.clone()),
        _ => None,
    }
}

fn prop_list(props: &Properties, key: &str) -> Option<Vec<String>> {
    match props.get(key) {
        Some(PropValue::List(values)) => Some(values.clone()),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Adapter {
    pub ubi: Ubi,
    /// User visible name (the adapter alias).
    pub name: String,
    /// Name assigned by the system, used when restoring defaults.
    pub system_name: String,
    pub address: String,
    pub powered: bool,
    pub discoverable: bool,
    /// Seconds; zero keeps the adapter discoverable indefinitely.
    pub discoverable_timeout: u32,
    pub discovering: bool,
}

impl Adapter {
    /// Builds an adapter from its announced properties. An adapter without an
    /// address is not a usable handle.
    pub fn from_properties(ubi: &str, props: &Properties) -> Result<Self, BluetoothError> {
        let address = prop_str(props, "Address")
            .filter(|address| !address.is_empty())
            .ok_or_else(|| BluetoothError::InvalidRemoteHandle(ubi.to_string()))?;

        let mut adapter = Self {
            ubi: ubi.to_string(),
            address,
            ..Default::default()
        };
        adapter.apply(props);
        Ok(adapter)
    }

    pub fn apply(&mut self, props: &Properties) {
        if let Some(system_name) = prop_str(props, "Name") {
            self.system_name = system_name;
        }
        if let Some(alias) = prop_str(props, "Alias") {
            self.name = alias;
        }
        if self.name.is_empty() {
            self.name = self.system_name.clone();
        }
        if let Some(powered) = prop_bool(props, "Powered") {
            self.powered = powered;
        }
        if let Some(discoverable) = prop_bool(props, "Discoverable") {
            self.discoverable = discoverable;
        }
        if let Some(timeout) = prop_u32(props, "DiscoverableTimeout") {
            self.discoverable_timeout = timeout;
        }
        if let Some(discovering) = prop_bool(props, "Discovering") {
            self.discovering = discovering;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Device {
    pub ubi: Ubi,
    /// Owning adapter, lookup only.
    pub adapter: Ubi,
    pub address: String,
    pub name: String,
    pub icon: String,
    pub paired: bool,
    pub trusted: bool,
    pub connected: bool,
    pub uuids: Vec<String>,
}

impl Device {
    pub fn from_properties(ubi: &str, props: &Properties) -> Result<Self, BluetoothError> {
        let address = prop_str(props, "Address")
            .filter(|address| !address.is_empty())
            .ok_or_else(|| BluetoothError::InvalidRemoteHandle(ubi.to_string()))?;

        let mut device = Self {
            ubi: ubi.to_string(),
            adapter: prop_str(props, "Adapter").unwrap_or_else(|| parent_ubi(ubi).to_string()),
            address,
            ..Default::default()
        };
        device.apply(props);
        Ok(device)
    }

    pub fn apply(&mut self, props: &Properties) {
        if let Some(name) = prop_str(props, "Alias").or_else(|| prop_str(props, "Name")) {
            self.name = name;
        }
        if let Some(icon) = prop_str(props, "Icon") {
            self.icon = icon;
        }
        if let Some(paired) = prop_bool(props, "Paired") {
            self.paired = paired;
        }
        if let Some(trusted) = prop_bool(props, "Trusted") {
            self.trusted = trusted;
        }
        if let Some(connected) = prop_bool(props, "Connected") {
            self.connected = connected;
        }
        if let Some(uuids) = prop_list(props, "UUIDs") {
            self.uuids = uuids;
        }
    }
}

fn parent_ubi(ubi: &str) -> &str {
    match ubi.rfind('/') {
        Some(0) | None => "",
        Some(index) => &ubi[..index],
    }
}

/// Recovers `AA:BB:CC:DD:EE:FF` from a device path ending in
/// `dev_AA_BB_CC_DD_EE_FF`.
pub fn address_from_ubi(ubi: &str) -> Option<String> {
    let node = ubi.rsplit('/').next()?;
    let hex = node.strip_prefix("dev_")?;
    let octets: Vec<&str> = hex.split('_').collect();
    let valid = octets.len() == 6
        && octets
            .iter()
            .all(|octet| octet.len() == 2 && octet.chars().all(|c| c.is_ascii_hexdigit()));
    valid.then(|| octets.join(":").to_ascii_uppercase())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    FileTransfer,
    ObjectPush,
    Other(String),
    #[default]
    Unknown,
}

impl SessionKind {
    /// Classifies a session by the OBEX target it was opened against.
    pub fn from_target(target: &str) -> Self {
        let target = target.trim().to_ascii_lowercase();
        if target.is_empty() {
            return Self::Unknown;
        }
        match target.as_str() {
            "ftp" | "00001106-0000-1000-8000-00805f9b34fb" => Self::FileTransfer,
            "opp" | "00001105-0000-1000-8000-00805f9b34fb" => Self::ObjectPush,
            _ => Self::Other(target),
        }
    }
}

/// Per-session details fetched with a separate remote call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SessionMetadata {
    pub device_address: String,
    pub kind: SessionKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TransferState {
    #[default]
    Idle,
    Receiving { name: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub device_address: String,
    pub kind: SessionKind,
    pub transfer: TransferState,
    pub created_at: DateTime<Utc>,
}

/*!
 * IPC Protocol
 * One JSON object per line in each direction
 */

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::actions::{ActionPlan, TransferAction};
use crate::adapter_settings::AdapterUpdate;
use crate::agent::{Decision, PendingRequest};
use crate::model::{Adapter, Session};
use crate::projector::DeviceInfo;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
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

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterEntry {
    pub title: String,
    #[serde(flatten)]
    pub adapter: Adapter,
    pub usable: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionEntry {
    pub action: TransferAction,
    pub plan: ActionPlan,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
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

impl Response {
    pub fn success(message: impl Into<String>) -> Self {
        Self::Success {
            message: message.into(),
        }
    }

    pub fn error(message: impl ToString) -> Self {
        Self::Error {
            message: message.to_string(),
        }
    }
}

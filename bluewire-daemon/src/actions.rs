/*!
 * Device Actions
 * Transfer and network actions selected by advertised service UUIDs
 */

use serde::{Deserialize, Serialize};

use crate::model::Device;

const OBEX_OBJECT_PUSH: &str = "00001105-0000-1000-8000-00805f9b34fb";
const OBEX_FILE_TRANSFER: &str = "00001106-0000-1000-8000-00805f9b34fb";
const DIALUP_NETWORKING: &str = "00001103-0000-1000-8000-00805f9b34fb";
const PAN_USER: &str = "00001115-0000-1000-8000-00805f9b34fb";
const PAN_ACCESS_POINT: &str = "00001116-0000-1000-8000-00805f9b34fb";
const HEADSET: &str = "00001108-0000-1000-8000-00805f9b34fb";
const AUDIO_SINK: &str = "0000110b-0000-1000-8000-00805f9b34fb";
const HANDSFREE: &str = "0000111e-0000-1000-8000-00805f9b34fb";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferAction {
    SendFiles,
    BrowseFiles,
    DialUpNetworking,
    NetworkAccess,
    AudioDevice,
}

impl TransferAction {
    pub const ALL: [TransferAction; 5] = [
        Self::SendFiles,
        Self::BrowseFiles,
        Self::DialUpNetworking,
        Self::NetworkAccess,
        Self::AudioDevice,
    ];

    /// Service UUIDs any of which enables this action.
    pub fn uuids(&self) -> &'static [&'static str] {
        match self {
            Self::SendFiles => &[OBEX_OBJECT_PUSH],
            Self::BrowseFiles => &[OBEX_FILE_TRANSFER],
            Self::DialUpNetworking => &[DIALUP_NETWORKING],
            Self::NetworkAccess => &[PAN_ACCESS_POINT, PAN_USER],
            Self::AudioDevice => &[AUDIO_SINK, HEADSET, HANDSFREE],
        }
    }

    pub fn supported_by(&self, device: &Device) -> bool {
        self.uuids()
            .iter()
            .any(|wanted| device.uuids.iter().any(|uuid| uuid.eq_ignore_ascii_case(wanted)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "action", rename_all = "snake_case")]
pub enum ActionPlan {
    Ready(TransferAction),
    NeedsPairing,
    Unsupported,
}

/// Actions the device advertises, in declaration order.
pub fn actions_for(device: &Device) -> Vec<TransferAction> {
    TransferAction::ALL
        .into_iter()
        .filter(|action| action.supported_by(device))
        .collect()
}

pub fn plan(device: &Device, action: TransferAction) -> ActionPlan {
    if !device.paired {
        ActionPlan::NeedsPairing
    } else if action.supported_by(device) {
        ActionPlan::Ready(action)
    } else {
        ActionPlan::Unsupported
    }
}

/*!
 * Device Info Projection
 * Flat device records for the local query interface
 */

use serde::{Deserialize, Serialize};

use crate::model::Device;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DeviceInfo {
    pub name: String,
    pub icon: String,
    pub address: String,
    #[serde(rename = "UBI")]
    pub ubi: String,
    #[serde(rename = "UUIDs")]
    pub uuids: String,
}

impl DeviceInfo {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Total over absent devices: `None` yields an empty record.
pub fn project(device: Option<&Device>) -> DeviceInfo {
    let Some(device) = device else {
        return DeviceInfo::default();
    };

    DeviceInfo {
        name: device.name.clone(),
        icon: device.icon.clone(),
        address: device.address.clone(),
        ubi: device.ubi.clone(),
        uuids: device.uuids.join(","),
    }
}

/*!
 * Service Connection
 * Supervision of the Bluetooth service and its adapter/device tables
 */

use std::sync::Arc;
use tokio::sync::mpsc;

use crate::bluetooth::{BluetoothService, Ready, ServiceSink};
use crate::daemon::Event;
use crate::error::{BluetoothError, Result};
use crate::model::{Adapter, Device, Properties};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum InitState {
    #[default]
    Idle,
    Initializing,
    Ready,
    Failed,
}

/// Adapters and devices are kept in the order the service announced them.
#[derive(Debug, Default)]
pub struct ServiceConnection {
    state: InitState,
    operational: bool,
    adapters: Vec<Adapter>,
    devices: Vec<Device>,
}

impl ServiceConnection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts an initialization attempt. The result comes back as
    /// [`Event::Initialized`]. Does nothing while an attempt is in flight or
    /// after a successful one.
    pub fn initialize<S: BluetoothService>(
        &mut self,
        service: &Arc<S>,
        events: &mpsc::UnboundedSender<Event>,
    ) {
        if matches!(self.state, InitState::Initializing | InitState::Ready) {
            return;
        }
        self.state = InitState::Initializing;

        let service = service.clone();
        let events = events.clone();
        tokio::spawn(async move {
            let result = service.initialize(ServiceSink::new(events.clone())).await;
            let _ = events.send(Event::Initialized(result));
        });
    }

    /// Applies the result of [`ServiceConnection::initialize`]. Returns the
    /// operational state on success.
    pub fn finish_initialize(&mut self, result: Result<Ready>) -> Result<bool> {
        match result {
            Ok(ready) => {
                self.state = InitState::Ready;
                self.adapters.clear();
                self.devices.clear();
                for adapter in ready.adapters {
                    self.add_adapter(adapter);
                }
                for device in ready.devices {
                    self.add_device(device);
                }
                self.operational = ready.operational;
                Ok(self.operational)
            }
            Err(err) => {
                self.state = InitState::Failed;
                self.operational = false;
                Err(match err {
                    BluetoothError::Init(_) => err,
                    other => BluetoothError::Init(other.to_string()),
                })
            }
        }
    }

    pub fn is_initializing(&self) -> bool {
        self.state == InitState::Initializing
    }

    pub fn is_initialized(&self) -> bool {
        self.state == InitState::Ready
    }

    pub fn is_operational(&self) -> bool {
        self.is_initialized() && self.operational
    }

    /// Records an operational transition. Returns true if the state changed.
    /// Losing the service drops every adapter and device.
    pub fn set_operational(&mut self, operational: bool) -> bool {
        if self.operational == operational {
            return false;
        }
        self.operational = operational;
        if !operational {
            self.adapters.clear();
            self.devices.clear();
        }
        true
    }

    pub fn adapters(&self) -> &[Adapter] {
        &self.adapters
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    /// First powered adapter, in discovery order.
    pub fn usable_adapter(&self) -> Option<&Adapter> {
        if !self.is_operational() {
            return None;
        }
        self.adapters.iter().find(|adapter| adapter.powered)
    }

    pub fn adapter(&self, ubi: &str) -> Option<&Adapter> {
        self.adapters.iter().find(|adapter| adapter.ubi == ubi)
    }

    pub fn device(&self, ubi: &str) -> Option<&Device> {
        self.devices.iter().find(|device| device.ubi == ubi)
    }

    /// Prefers the device known to the usable adapter when several adapters
    /// see the same address.
    pub fn device_for_address(&self, address: &str) -> Option<&Device> {
        let matches = |device: &&Device| device.address.eq_ignore_ascii_case(address);
        let usable = self.usable_adapter().map(|adapter| adapter.ubi.as_str());

        self.devices
            .iter()
            .filter(matches)
            .find(|device| Some(device.adapter.as_str()) == usable)
            .or_else(|| self.devices.iter().find(matches))
    }

    pub fn add_adapter(&mut self, adapter: Adapter) {
        match self.adapters.iter_mut().find(|known| known.ubi == adapter.ubi) {
            Some(known) => *known = adapter,
            None => {
                tracing::debug!("Adapter added: {} ({})", adapter.ubi, adapter.address);
                self.adapters.push(adapter);
            }
        }
    }

    /// Removes the adapter together with the devices it owned.
    pub fn remove_adapter(&mut self, ubi: &str) -> Option<Adapter> {
        let index = self.adapters.iter().position(|adapter| adapter.ubi == ubi)?;
        self.devices.retain(|device| device.adapter != ubi);
        tracing::debug!("Adapter removed: {}", ubi);
        Some(self.adapters.remove(index))
    }

    pub fn add_device(&mut self, device: Device) {
        match self.devices.iter_mut().find(|known| known.ubi == device.ubi) {
            Some(known) => *known = device,
            None => self.devices.push(device),
        }
    }

    pub fn remove_device(&mut self, ubi: &str) -> Option<Device> {
        let index = self.devices.iter().position(|device| device.ubi == ubi)?;
        Some(self.devices.remove(index))
    }

    /// Applies a property change to whichever object owns `ubi`. Unknown
    /// objects are ignored.
    pub fn apply_properties(&mut self, ubi: &str, properties: &Properties) -> bool {
        if let Some(adapter) = self.adapters.iter_mut().find(|adapter| adapter.ubi == ubi) {
            adapter.apply(properties);
            return true;
        }
        if let Some(device) = self.devices.iter_mut().find(|device| device.ubi == ubi) {
            device.apply(properties);
            return true;
        }
        false
    }
}

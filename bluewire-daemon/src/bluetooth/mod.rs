/*!
 * Bluetooth Service Boundary
 * The external management service as seen by the daemon
 */

pub mod bluez;
mod convert;
pub mod obex;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::adapter_settings::AdapterChange;
use crate::agent::{AgentCapability, AgentSource, RequestKind, Responder};
use crate::daemon::Event;
use crate::error::Result;
use crate::model::{Adapter, Device, Properties, SessionMetadata, Ubi};

pub use bluez::BluezService;

/// Notifications from the external service, delivered in emission order.
#[derive(Debug)]
pub enum ServiceEvent {
    Operational(bool),
    AdapterAdded(Adapter),
    AdapterRemoved(Ubi),
    DeviceAdded(Device),
    DeviceRemoved(Ubi),
    PropertiesChanged { ubi: Ubi, properties: Properties },
    ObexOperational(bool),
    SessionCreated(String),
    SessionRemoved(String),
    AgentCall {
        source: AgentSource,
        device: Ubi,
        kind: RequestKind,
        responder: Responder,
    },
    AgentCancelled(AgentSource),
    AgentReleased(AgentSource),
}

impl ServiceEvent {
    /// Notifications that touch the adapter and device tables.
    pub fn is_object_event(&self) -> bool {
        matches!(
            self,
            Self::Operational(_)
                | Self::AdapterAdded(_)
                | Self::AdapterRemoved(_)
                | Self::DeviceAdded(_)
                | Self::DeviceRemoved(_)
                | Self::PropertiesChanged { .. }
        )
    }
}

/// Snapshot returned by a successful initialization.
#[derive(Debug, Clone, Default)]
pub struct Ready {
    pub operational: bool,
    pub adapters: Vec<Adapter>,
    pub devices: Vec<Device>,
}

/// Which bus-activated service to start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceKind {
    Bluez,
    Obex,
}

/// Forwards service notifications into the daemon's event queue.
#[derive(Debug, Clone)]
pub struct ServiceSink {
    tx: mpsc::UnboundedSender<Event>,
}

impl ServiceSink {
    pub fn new(tx: mpsc::UnboundedSender<Event>) -> Self {
        Self { tx }
    }

    /// Returns false once the daemon has stopped listening.
    pub fn emit(&self, event: ServiceEvent) -> bool {
        self.tx.send(Event::Service(event)).is_ok()
    }
}

#[async_trait]
pub trait BluetoothService: Send + Sync + 'static {
    async fn initialize(&self, sink: ServiceSink) -> Result<Ready>;
    async fn initialize_obex(&self, sink: ServiceSink) -> Result<bool>;
    async fn start_service(&self, kind: ServiceKind) -> Result<()>;

    async fn start_discovery(&self, adapter: &str) -> Result<()>;
    async fn stop_discovery(&self, adapter: &str) -> Result<()>;
    async fn set_adapter_property(&self, adapter: &str, change: &AdapterChange) -> Result<()>;
    async fn set_trusted(&self, device: &str, trusted: bool) -> Result<()>;

    async fn register_agent(&self, capability: AgentCapability) -> Result<()>;
    async fn request_default_agent(&self) -> Result<()>;
    async fn unregister_agent(&self) -> Result<()>;
    async fn register_obex_agent(&self) -> Result<()>;
    async fn unregister_obex_agent(&self) -> Result<()>;

    async fn session_metadata(&self, session: &str) -> Result<SessionMetadata>;
}

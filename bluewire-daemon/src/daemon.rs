/*!
 * Daemon Context
 * Owns every table and serializes all mutations through one event loop
 */

use std::future::Future;
use std::ops::ControlFlow;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::actions::{actions_for, plan};
use crate::adapter_settings::{title, AdapterSettings, AdapterUpdate};
use crate::agent::{AgentRegistry, AgentRequest, AgentSource, Decision, RequestKind, Resolution};
use crate::bluetooth::{BluetoothService, Ready, ServiceEvent, ServiceKind, ServiceSink};
use crate::config::DaemonConfig;
use crate::connection::ServiceConnection;
use crate::discovery::{DiscoveryCommand, DiscoveryTimer};
use crate::error::{BluetoothError, Result};
use crate::model::{address_from_ubi, Adapter, PropValue, SessionMetadata, TransferState};
use crate::projector::project;
use crate::protocol::{ActionEntry, AdapterEntry, Request, Response};
use crate::session::SessionTracker;
use crate::state::SavedState;

/// Everything the daemon loop reacts to, in arrival order.
#[derive(Debug)]
pub enum Event {
    Service(ServiceEvent),
    Initialized(Result<Ready>),
    ObexInitialized(Result<bool>),
    AgentRegistered { source: AgentSource, result: Result<()> },
    DefaultAgentRequested(Result<()>),
    SessionMetadata {
        id: String,
        generation: u64,
        result: Result<SessionMetadata>,
    },
    DiscoveryExpired { generation: u64 },
    CallFinished { operation: String, result: Result<()> },
    Request {
        request: Request,
        reply: oneshot::Sender<Response>,
    },
    Shutdown,
}

/// Cloneable entry point for the local query interface.
#[derive(Debug, Clone)]
pub struct DaemonHandle {
    tx: mpsc::UnboundedSender<Event>,
}

impl DaemonHandle {
    pub async fn request(&self, request: Request) -> Result<Response> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Event::Request { request, reply })
            .map_err(|_| BluetoothError::DaemonGone)?;
        rx.await.map_err(|_| BluetoothError::DaemonGone)
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(Event::Shutdown);
    }

    /// Resolves once the daemon loop has exited.
    pub async fn closed(&self) {
        self.tx.closed().await
    }

    /// A handle whose events land in the returned receiver instead of a loop.
    #[cfg(test)]
    pub(crate) fn detached() -> (mpsc::UnboundedReceiver<Event>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (rx, Self { tx })
    }
}

pub struct Daemon<S: BluetoothService> {
    service: Arc<S>,
    config: DaemonConfig,
    events: mpsc::UnboundedSender<Event>,
    rx: mpsc::UnboundedReceiver<Event>,
    connection: ServiceConnection,
    /// Table notifications that raced the initial snapshot.
    backlog: Vec<ServiceEvent>,
    saved: SavedState,
    obex_operational: bool,
    agents: AgentRegistry,
    sessions: SessionTracker,
    discovery: DiscoveryTimer,
}

impl<S: BluetoothService> Daemon<S> {
    pub fn new(service: Arc<S>, config: DaemonConfig) -> (Self, DaemonHandle) {
        let (events, rx) = mpsc::unbounded_channel();
        let agents = AgentRegistry::new(
            config.bluetooth.agent_capability,
            config.bluetooth.authorization,
        );
        let handle = DaemonHandle { tx: events.clone() };

        let daemon = Self {
            service,
            config,
            events,
            rx,
            connection: ServiceConnection::new(),
            backlog: Vec::new(),
            saved: SavedState::default(),
            obex_operational: false,
            agents,
            sessions: SessionTracker::new(),
            discovery: DiscoveryTimer::new(),
        };
        (daemon, handle)
    }

    pub async fn run(mut self) {
        if self.config.bluetooth.restore_state {
            match SavedState::load(&self.config.state_path) {
                Ok(saved) => self.saved = saved,
                Err(e) => warn!("Ignoring saved state {}: {}", self.config.state_path.display(), e),
            }
        }

        info!("Connecting to Bluetooth service...");
        self.connection.initialize(&self.service, &self.events);

        if self.config.obex.enabled {
            let service = self.service.clone();
            let events = self.events.clone();
            tokio::spawn(async move {
                let result = service.initialize_obex(ServiceSink::new(events.clone())).await;
                let _ = events.send(Event::ObexInitialized(result));
            });
        }

        while let Some(event) = self.rx.recv().await {
            if self.handle(event).is_break() {
                break;
            }
        }

        self.teardown().await;
    }

    fn handle(&mut self, event: Event) -> ControlFlow<()> {
        match event {
            Event::Service(event) => self.handle_service(event),
            Event::Initialized(result) => {
                let backlog = std::mem::take(&mut self.backlog);
                match self.connection.finish_initialize(result) {
                    Ok(operational) => {
                        info!("Bluetooth service connection ready");
                        self.operational_changed(operational);
                        self.restore_adapters(self.connection.adapters());
                        debug!(
                            "Replaying {} notifications received during initialization",
                            backlog.len()
                        );
                        for event in backlog {
                            self.handle_service(event);
                        }
                    }
                    Err(e) => warn!("Error initializing Bluetooth service: {}", e),
                }
            }
            Event::ObexInitialized(result) => match result {
                Ok(operational) => self.obex_operational_changed(operational),
                Err(e) => warn!("Error initializing OBEX service: {}", e),
            },
            Event::AgentRegistered { source, result } => {
                self.agents.registration_finished(source, &result);
                match result {
                    Ok(()) => {
                        info!("{:?} agent registered", source);
                        if source == AgentSource::Bluez
                            && self.config.bluetooth.request_default_agent
                        {
                            let service = self.service.clone();
                            let events = self.events.clone();
                            tokio::spawn(async move {
                                let result = service.request_default_agent().await;
                                let _ = events.send(Event::DefaultAgentRequested(result));
                            });
                        }
                    }
                    Err(e) => warn!("Error registering {:?} agent: {}", source, e),
                }
            }
            Event::DefaultAgentRequested(result) => match result {
                Ok(()) => debug!("Requested default agent"),
                Err(e) => warn!("Error requesting default agent: {}", e),
            },
            Event::SessionMetadata { id, generation, result } => match result {
                Ok(metadata) => {
                    if !self.sessions.fill_metadata(&id, generation, metadata) {
                        debug!("Session {} is gone, dropping its metadata", id);
                    }
                }
                Err(e) => debug!("No metadata for session {}, keeping it without: {}", id, e),
            },
            Event::DiscoveryExpired { generation } => {
                if self.discovery.expire(generation) {
                    debug!("Discovery window elapsed");
                    self.stop_discovering();
                }
            }
            Event::CallFinished { operation, result } => match result {
                Ok(()) => debug!("{} finished", operation),
                Err(e) => warn!("{} failed: {}", operation, e),
            },
            Event::Request { request, reply } => {
                if request == Request::Shutdown {
                    let _ = reply.send(Response::success("Shutting down"));
                    return ControlFlow::Break(());
                }
                let response = self.handle_request(request);
                let _ = reply.send(response);
            }
            Event::Shutdown => return ControlFlow::Break(()),
        }
        ControlFlow::Continue(())
    }

    fn handle_service(&mut self, event: ServiceEvent) {
        if self.connection.is_initializing() && event.is_object_event() {
            self.backlog.push(event);
            return;
        }

        match event {
            ServiceEvent::Operational(operational) => {
                if !operational {
                    self.saved.remember(self.connection.adapters());
                }
                if self.connection.set_operational(operational)
                    && self.connection.is_initialized()
                {
                    self.operational_changed(operational);
                }
            }
            ServiceEvent::AdapterAdded(adapter) => {
                if self.connection.is_operational()
                    && self.connection.adapter(&adapter.ubi).is_none()
                {
                    self.restore_adapters(std::slice::from_ref(&adapter));
                }
                self.connection.add_adapter(adapter);
            }
            ServiceEvent::AdapterRemoved(ubi) => {
                self.discovery.forget(&ubi);
                if let Some(adapter) = self.connection.remove_adapter(&ubi) {
                    self.saved.remember(std::slice::from_ref(&adapter));
                }
            }
            ServiceEvent::DeviceAdded(device) => self.connection.add_device(device),
            ServiceEvent::DeviceRemoved(ubi) => {
                self.connection.remove_device(&ubi);
            }
            ServiceEvent::PropertiesChanged { ubi, properties } => {
                self.connection.apply_properties(&ubi, &properties);

                let ended = ["Powered", "Discovering"]
                    .iter()
                    .any(|key| properties.get(*key) == Some(&PropValue::Bool(false)));
                if ended && self.discovery.adapter() == Some(ubi.as_str()) {
                    debug!("Discovery on {} ended outside the daemon", ubi);
                    self.discovery.forget(&ubi);
                }
            }
            ServiceEvent::ObexOperational(operational) => {
                if self.obex_operational != operational {
                    self.obex_operational_changed(operational);
                }
            }
            ServiceEvent::SessionCreated(id) => {
                let generation = self.sessions.on_session_created(&id, SessionMetadata::default());
                let service = self.service.clone();
                let events = self.events.clone();
                tokio::spawn(async move {
                    let result = service.session_metadata(&id).await;
                    let _ = events.send(Event::SessionMetadata { id, generation, result });
                });
            }
            ServiceEvent::SessionRemoved(id) => {
                self.sessions.on_session_removed(&id);
            }
            ServiceEvent::AgentCall {
                source,
                device,
                kind,
                responder,
            } => {
                let address = match &kind {
                    RequestKind::AuthorizePush { session, .. } => self
                        .sessions
                        .lookup(session)
                        .map(|session| session.device_address.clone())
                        .unwrap_or_default(),
                    _ => self
                        .connection
                        .device(&device)
                        .map(|device| device.address.clone())
                        .or_else(|| address_from_ubi(&device))
                        .unwrap_or_default(),
                };

                let request = AgentRequest::new(source, device, address, kind, responder);
                if let Some(resolution) = self.agents.submit(request) {
                    self.apply_resolution(resolution);
                }
            }
            ServiceEvent::AgentCancelled(source) => {
                let cancelled = self.agents.cancel(source);
                debug!("{:?} agent cancelled {} pending requests", source, cancelled);
            }
            ServiceEvent::AgentReleased(source) => {
                info!("{:?} agent released by the service", source);
                self.agents.released(source);
            }
        }
    }

    fn operational_changed(&mut self, operational: bool) {
        info!("Bluetooth operational changed: {}", operational);

        if operational {
            self.register_agent(AgentSource::Bluez);
        } else {
            self.agents.released(AgentSource::Bluez);
            self.discovery.reset();
            if self.config.bluetooth.start_service_when_offline {
                let service = self.service.clone();
                self.spawn_call("Starting bluetoothd", async move {
                    service.start_service(ServiceKind::Bluez).await
                });
            }
        }
    }

    fn obex_operational_changed(&mut self, operational: bool) {
        info!("OBEX operational changed: {}", operational);
        self.obex_operational = operational;

        if operational {
            self.register_agent(AgentSource::Obex);
        } else {
            self.agents.released(AgentSource::Obex);
            if self.config.bluetooth.start_service_when_offline {
                let service = self.service.clone();
                self.spawn_call("Starting obexd", async move {
                    service.start_service(ServiceKind::Obex).await
                });
            }
        }
    }

    fn register_agent(&mut self, source: AgentSource) {
        let operational = match source {
            AgentSource::Bluez => self.connection.is_operational(),
            AgentSource::Obex => self.obex_operational,
        };

        let capability = match self.agents.register_agent(source, operational) {
            Ok(Some(capability)) => capability,
            Ok(None) => return,
            Err(e) => {
                warn!("Not registering {:?} agent: {}", source, e);
                return;
            }
        };

        let service = self.service.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let result = match source {
                AgentSource::Bluez => service.register_agent(capability).await,
                AgentSource::Obex => service.register_obex_agent().await,
            };
            let _ = events.send(Event::AgentRegistered { source, result });
        });
    }

    fn apply_resolution(&mut self, resolution: Resolution) {
        if !resolution.decision.is_accepted() {
            return;
        }

        if resolution.decision == Decision::AcceptAndTrust
            && resolution.source == AgentSource::Bluez
            && !resolution.device.is_empty()
        {
            let service = self.service.clone();
            let device = resolution.device.clone();
            self.spawn_call("Trusting device", async move {
                service.set_trusted(&device, true).await
            });
        }

        if let RequestKind::AuthorizePush { session, name, .. } = resolution.kind {
            self.sessions.set_transfer(&session, TransferState::Receiving { name });
        }
    }

    fn handle_request(&mut self, request: Request) -> Response {
        match request {
            Request::IsOnline => Response::Online {
                online: self.connection.is_operational(),
                obex_online: self.obex_operational,
                discovering: self.discovery.is_active(),
            },
            Request::AllDevices => Response::Devices {
                devices: self
                    .connection
                    .devices()
                    .iter()
                    .map(|device| (device.address.clone(), project(Some(device))))
                    .collect(),
            },
            Request::Device { address } => Response::Device {
                device: project(self.connection.device_for_address(&address)),
            },
            Request::StartDiscovering { timeout_ms } => {
                self.start_discovering(timeout_ms);
                Response::success("Discovery requested")
            }
            Request::StopDiscovering => {
                self.stop_discovering();
                Response::success("Discovery stop requested")
            }
            Request::Adapters => {
                let usable = self.connection.usable_adapter().map(|adapter| adapter.ubi.clone());
                Response::Adapters {
                    adapters: self
                        .connection
                        .adapters()
                        .iter()
                        .map(|adapter| AdapterEntry {
                            title: title(adapter),
                            usable: usable.as_deref() == Some(adapter.ubi.as_str()),
                            adapter: adapter.clone(),
                        })
                        .collect(),
                }
            }
            Request::SetAdapter { ubi, update } => match self.set_adapter(&ubi, &update) {
                Ok(0) => Response::success("Adapter already up to date"),
                Ok(count) => Response::success(format!("Queued {} adapter changes", count)),
                Err(e) => Response::error(e),
            },
            Request::Sessions => Response::Sessions {
                sessions: self.sessions.sessions(),
            },
            Request::PendingRequests => Response::PendingRequests {
                requests: self.agents.pending(),
            },
            Request::Resolve { id, decision } => match self.agents.resolve(id, decision) {
                Ok(resolution) => {
                    self.apply_resolution(resolution);
                    Response::success(format!("Request {} resolved", id))
                }
                Err(e) => Response::error(e),
            },
            Request::Actions { address } => {
                let actions = self
                    .connection
                    .device_for_address(&address)
                    .map(|device| {
                        actions_for(device)
                            .into_iter()
                            .map(|action| ActionEntry {
                                action,
                                plan: plan(device, action),
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                Response::Actions { address, actions }
            }
            Request::Shutdown => Response::success("Shutting down"),
        }
    }

    fn set_adapter(&mut self, ubi: &str, update: &AdapterUpdate) -> Result<usize> {
        if !self.connection.is_operational() {
            return Err(BluetoothError::NotOperational);
        }
        let adapter = self
            .connection
            .adapter(ubi)
            .ok_or_else(|| BluetoothError::UnknownAdapter(ubi.to_string()))?;

        let changes = AdapterSettings::resolve(adapter, update).changes_against(adapter);
        let count = changes.len();
        if count > 0 {
            let service = self.service.clone();
            let ubi = ubi.to_string();
            self.spawn_call(format!("Updating adapter {}", ubi.as_str()), async move {
                for change in &changes {
                    service.set_adapter_property(&ubi, change).await?;
                }
                Ok(())
            });
        }
        Ok(count)
    }

    /// Powers adapters the way they were saved. Adapters without a saved
    /// entry are left alone.
    fn restore_adapters(&self, adapters: &[Adapter]) {
        if !self.config.bluetooth.restore_state || !self.connection.is_operational() {
            return;
        }
        for (ubi, change) in self.saved.changes(adapters) {
            info!("Restoring {:?} on adapter {}", change, ubi);
            let service = self.service.clone();
            self.spawn_call(format!("Restoring adapter {}", ubi), async move {
                service.set_adapter_property(&ubi, &change).await
            });
        }
    }

    fn start_discovering(&mut self, timeout_ms: u32) {
        let usable = self.connection.usable_adapter().cloned();
        match &usable {
            Some(_) => debug!("Start discovering for {} ms", timeout_ms),
            None => debug!("No usable adapter, ignoring discovery request"),
        }
        let commands = self.discovery.start(usable.as_ref(), timeout_ms, &self.events);
        self.run_discovery_commands(commands);
    }

    fn stop_discovering(&mut self) {
        let usable = self.connection.usable_adapter().cloned();
        if let Some(command) = self.discovery.stop(usable.as_ref()) {
            debug!("Stop discovering");
            self.run_discovery_commands(vec![command]);
        }
    }

    fn run_discovery_commands(&self, commands: Vec<DiscoveryCommand>) {
        if commands.is_empty() {
            return;
        }
        let service = self.service.clone();
        self.spawn_call("Discovery control", async move {
            for command in &commands {
                match command {
                    DiscoveryCommand::Start(ubi) => service.start_discovery(ubi).await?,
                    DiscoveryCommand::Stop(ubi) => service.stop_discovery(ubi).await?,
                }
            }
            Ok(())
        });
    }

    fn spawn_call<F>(&self, operation: impl Into<String>, call: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let operation = operation.into();
        let events = self.events.clone();
        tokio::spawn(async move {
            let result = call.await;
            let _ = events.send(Event::CallFinished { operation, result });
        });
    }

    async fn teardown(&mut self) {
        if let Some(ubi) = self.discovery.adapter().map(str::to_string) {
            self.discovery.reset();
            if let Err(e) = self.service.stop_discovery(&ubi).await {
                debug!("Stopping discovery on shutdown failed: {}", e);
            }
        }
        if self.agents.is_registered(AgentSource::Bluez) {
            if let Err(e) = self.service.unregister_agent().await {
                warn!("Error unregistering agent: {}", e);
            }
        }
        if self.agents.is_registered(AgentSource::Obex) {
            if let Err(e) = self.service.unregister_obex_agent().await {
                warn!("Error unregistering OBEX agent: {}", e);
            }
        }
        if self.config.bluetooth.restore_state {
            self.saved.remember(self.connection.adapters());
            match self.saved.save(&self.config.state_path) {
                Ok(()) => debug!("Saved adapter state to {}", self.config.state_path.display()),
                Err(e) => warn!("Error saving adapter state: {}", e),
            }
        }
        info!("Daemon stopped");
    }
}

/*!
 * BlueZ D-Bus Binding
 * Adapter/device enumeration, discovery and the pairing agent on the system bus
 */

use async_trait::async_trait;
use dbus::arg::{AppendAll, PropMap};
use dbus::channel::{MatchingReceiver, Sender};
use dbus::message::MatchRule;
use dbus::nonblock::stdintf::org_freedesktop_dbus::{ObjectManager as _, Properties as _};
use dbus::nonblock::{MsgMatch, Proxy, SyncConnection};
use dbus::strings::ErrorName;
use dbus::{Message, Path};
use dbus_tokio::connection;
use std::collections::{HashMap, HashSet};
use std::ffi::CString;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, error, warn};

use super::convert;
use super::{BluetoothService, Ready, ServiceEvent, ServiceKind, ServiceSink};
use crate::adapter_settings::AdapterChange;
use crate::agent::{AgentCapability, AgentSource, RequestKind, Responder};
use crate::error::{BluetoothError, Result};
use crate::model::{Adapter, Device, SessionMetadata};

pub(super) const BLUEZ_SERVICE: &str = "org.bluez";
const BLUEZ_ROOT: &str = "/org/bluez";
const ADAPTER_IFACE: &str = "org.bluez.Adapter1";
const DEVICE_IFACE: &str = "org.bluez.Device1";
const AGENT_MANAGER_IFACE: &str = "org.bluez.AgentManager1";
const AGENT_PATH: &str = "/org/bluewire/agent";

const DBUS_SERVICE: &str = "org.freedesktop.DBus";
const DBUS_PATH: &str = "/org/freedesktop/DBus";
pub(super) const OBJECT_MANAGER_IFACE: &str = "org.freedesktop.DBus.ObjectManager";
const PROPERTIES_IFACE: &str = "org.freedesktop.DBus.Properties";

pub(super) const CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// The external Bluetooth service reached over D-Bus: bluetoothd on the
/// system bus, obexd on the session bus.
pub struct BluezService {
    pub(super) system: Mutex<Option<Arc<SyncConnection>>>,
    pub(super) session: Mutex<Option<Arc<SyncConnection>>>,
    pub(super) save_path: PathBuf,
    pub(super) known_sessions: Arc<Mutex<HashSet<String>>>,
    pub(super) matches: Mutex<Vec<MsgMatch>>,
}

impl BluezService {
    /// `save_path` is where accepted OBEX pushes are stored.
    pub fn new(save_path: PathBuf) -> Self {
        Self {
            system: Mutex::new(None),
            session: Mutex::new(None),
            save_path,
            known_sessions: Arc::new(Mutex::new(HashSet::new())),
            matches: Mutex::new(Vec::new()),
        }
    }

    fn system(&self) -> Result<Arc<SyncConnection>> {
        self.system
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(BluetoothError::NotOperational)
    }

    pub(super) fn session(&self) -> Result<Arc<SyncConnection>> {
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(BluetoothError::NotOperational)
    }

    pub(super) fn keep_matches(&self, matches: Vec<MsgMatch>) {
        self.matches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(matches);
    }
}

pub(super) async fn call<A>(
    conn: Arc<SyncConnection>,
    dest: &str,
    path: &str,
    iface: &str,
    method: &str,
    args: A,
) -> Result<()>
where
    A: AppendAll + Send,
{
    let proxy = Proxy::new(dest, path, CALL_TIMEOUT, conn);
    let () = proxy.method_call(iface, method, args).await?;
    Ok(())
}

pub(super) async fn name_has_owner(conn: &Arc<SyncConnection>, name: &str) -> Result<bool> {
    let proxy = Proxy::new(DBUS_SERVICE, DBUS_PATH, CALL_TIMEOUT, conn.clone());
    let (owned,): (bool,) = proxy.method_call(DBUS_SERVICE, "NameHasOwner", (name,)).await?;
    Ok(owned)
}

async fn start_service_by_name(conn: Arc<SyncConnection>, name: &str) -> Result<()> {
    let proxy = Proxy::new(DBUS_SERVICE, DBUS_PATH, CALL_TIMEOUT, conn);
    let (reply,): (u32,) = proxy
        .method_call(DBUS_SERVICE, "StartServiceByName", (name, 0u32))
        .await?;
    debug!("StartServiceByName({}) replied {}", name, reply);
    Ok(())
}

/// Calls `on_change` whenever `name` gains or loses its owner.
pub(super) async fn watch_owner<F>(
    conn: &Arc<SyncConnection>,
    name: &'static str,
    mut on_change: F,
) -> Result<MsgMatch>
where
    F: FnMut(bool) + Send + 'static,
{
    let rule = MatchRule::new_signal(DBUS_SERVICE, "NameOwnerChanged").with_sender(DBUS_SERVICE);
    let matched = conn.add_match(rule).await?.cb(move |msg: Message, (): ()| {
        if let Ok((changed, _old, new)) = msg.read3::<String, String, String>() {
            if changed == name {
                on_change(!new.is_empty());
            }
        }
        true
    });
    Ok(matched)
}

/// Builds an `error` reply with a printable message.
pub(super) fn error_reply(msg: &Message, name: &'static str, text: &str) -> Message {
    let text = CString::new(text).unwrap_or_default();
    msg.error(&ErrorName::from(name), &text)
}

fn objects_added(path: &str, interfaces: &HashMap<String, PropMap>) -> Vec<ServiceEvent> {
    let mut events = Vec::new();
    if let Some(props) = interfaces.get(ADAPTER_IFACE) {
        match Adapter::from_properties(path, &convert::properties(props)) {
            Ok(adapter) => events.push(ServiceEvent::AdapterAdded(adapter)),
            Err(e) => warn!("Ignoring adapter: {}", e),
        }
    }
    if let Some(props) = interfaces.get(DEVICE_IFACE) {
        match Device::from_properties(path, &convert::properties(props)) {
            Ok(device) => events.push(ServiceEvent::DeviceAdded(device)),
            Err(e) => warn!("Ignoring device: {}", e),
        }
    }
    events
}

async fn managed_objects(conn: &Arc<SyncConnection>) -> Result<(Vec<Adapter>, Vec<Device>)> {
    let proxy = Proxy::new(BLUEZ_SERVICE, "/", CALL_TIMEOUT, conn.clone());
    let objects = proxy.get_managed_objects().await?;

    let mut objects: Vec<_> = objects.into_iter().collect();
    objects.sort_by(|(a, _), (b, _)| str::cmp(a, b));

    let mut adapters = Vec::new();
    let mut devices = Vec::new();
    for (path, interfaces) in &objects {
        for event in objects_added(path, interfaces) {
            match event {
                ServiceEvent::AdapterAdded(adapter) => adapters.push(adapter),
                ServiceEvent::DeviceAdded(device) => devices.push(device),
                _ => {}
            }
        }
    }
    Ok((adapters, devices))
}

async fn watch_objects(conn: &Arc<SyncConnection>, sink: &ServiceSink) -> Result<Vec<MsgMatch>> {
    let mut matches = Vec::new();

    let added = sink.clone();
    let rule =
        MatchRule::new_signal(OBJECT_MANAGER_IFACE, "InterfacesAdded").with_sender(BLUEZ_SERVICE);
    matches.push(conn.add_match(rule).await?.cb(move |msg: Message, (): ()| {
        if let Ok((path, interfaces)) = msg.read2::<Path, HashMap<String, PropMap>>() {
            for event in objects_added(&path, &interfaces) {
                added.emit(event);
            }
        }
        true
    }));

    let removed = sink.clone();
    let rule =
        MatchRule::new_signal(OBJECT_MANAGER_IFACE, "InterfacesRemoved").with_sender(BLUEZ_SERVICE);
    matches.push(conn.add_match(rule).await?.cb(move |msg: Message, (): ()| {
        if let Ok((path, interfaces)) = msg.read2::<Path, Vec<String>>() {
            if interfaces.iter().any(|iface| iface == ADAPTER_IFACE) {
                removed.emit(ServiceEvent::AdapterRemoved(path.to_string()));
            }
            if interfaces.iter().any(|iface| iface == DEVICE_IFACE) {
                removed.emit(ServiceEvent::DeviceRemoved(path.to_string()));
            }
        }
        true
    }));

    let changed = sink.clone();
    let rule =
        MatchRule::new_signal(PROPERTIES_IFACE, "PropertiesChanged").with_sender(BLUEZ_SERVICE);
    matches.push(conn.add_match(rule).await?.cb(move |msg: Message, (): ()| {
        let Some(path) = msg.path().map(|path| path.to_string()) else {
            return true;
        };
        if let Ok((iface, props)) = msg.read2::<String, PropMap>() {
            if iface == ADAPTER_IFACE || iface == DEVICE_IFACE {
                changed.emit(ServiceEvent::PropertiesChanged {
                    ubi: path,
                    properties: convert::properties(&props),
                });
            }
        }
        true
    }));

    let owner = sink.clone();
    let owner_conn = conn.clone();
    matches.push(
        watch_owner(conn, BLUEZ_SERVICE, move |owned| {
            if !owned {
                owner.emit(ServiceEvent::Operational(false));
                return;
            }
            // Repopulate before announcing, so the daemon sees a full table.
            let sink = owner.clone();
            let conn = owner_conn.clone();
            tokio::spawn(async move {
                match managed_objects(&conn).await {
                    Ok((adapters, devices)) => {
                        for adapter in adapters {
                            sink.emit(ServiceEvent::AdapterAdded(adapter));
                        }
                        for device in devices {
                            sink.emit(ServiceEvent::DeviceAdded(device));
                        }
                    }
                    Err(e) => warn!("Error reading BlueZ objects: {}", e),
                }
                sink.emit(ServiceEvent::Operational(true));
            });
        })
        .await?,
    );

    Ok(matches)
}

/// Answers one agent call once the daemon has decided on it.
pub(super) fn ask<F>(
    conn: Arc<SyncConnection>,
    msg: Message,
    sink: &ServiceSink,
    source: AgentSource,
    device: String,
    kind: RequestKind,
    accepted: F,
) where
    F: FnOnce(&Message) -> Message + Send + 'static,
{
    let (rejected, canceled) = match source {
        AgentSource::Bluez => ("org.bluez.Error.Rejected", "org.bluez.Error.Canceled"),
        AgentSource::Obex => ("org.bluez.obex.Error.Rejected", "org.bluez.obex.Error.Canceled"),
    };

    let (responder, decision) = Responder::channel();
    if !sink.emit(ServiceEvent::AgentCall {
        source,
        device,
        kind,
        responder,
    }) {
        let _ = conn.send(error_reply(&msg, rejected, "Daemon is shutting down"));
        return;
    }

    tokio::spawn(async move {
        let reply = match decision.await {
            Ok(decision) if decision.is_accepted() => accepted(&msg),
            Ok(_) => error_reply(&msg, rejected, "Rejected"),
            Err(_) => error_reply(&msg, canceled, "Canceled"),
        };
        if conn.send(reply).is_err() {
            warn!("Failed to send agent reply");
        }
    });
}

fn handle_agent_call(msg: Message, conn: &Arc<SyncConnection>, sink: &ServiceSink) {
    let member = msg.member().map(|member| member.to_string()).unwrap_or_default();
    let reply_empty = |msg: &Message| msg.method_return();

    let request = match member.as_str() {
        "RequestConfirmation" => msg
            .read2::<Path, u32>()
            .ok()
            .map(|(device, passkey)| (device.to_string(), RequestKind::Confirmation { passkey })),
        "RequestAuthorization" => msg
            .read1::<Path>()
            .ok()
            .map(|device| (device.to_string(), RequestKind::Authorization)),
        "AuthorizeService" => msg
            .read2::<Path, String>()
            .ok()
            .map(|(device, uuid)| (device.to_string(), RequestKind::AuthorizeService { uuid })),
        "DisplayPasskey" | "DisplayPinCode" => {
            debug!("Agent {} for {:?}", member, msg.read1::<Path>().ok());
            let _ = conn.send(msg.method_return());
            return;
        }
        "Cancel" => {
            sink.emit(ServiceEvent::AgentCancelled(AgentSource::Bluez));
            let _ = conn.send(msg.method_return());
            return;
        }
        "Release" => {
            sink.emit(ServiceEvent::AgentReleased(AgentSource::Bluez));
            let _ = conn.send(msg.method_return());
            return;
        }
        _ => {
            debug!("Rejecting unsupported agent call {}", member);
            let _ = conn.send(error_reply(&msg, "org.bluez.Error.Rejected", "Not supported"));
            return;
        }
    };

    match request {
        Some((device, kind)) => {
            ask(conn.clone(), msg, sink, AgentSource::Bluez, device, kind, reply_empty)
        }
        None => {
            let _ = conn.send(error_reply(
                &msg,
                "org.freedesktop.DBus.Error.InvalidArgs",
                "Invalid arguments",
            ));
        }
    }
}

#[async_trait]
impl BluetoothService for BluezService {
    async fn initialize(&self, sink: ServiceSink) -> Result<Ready> {
        let (resource, conn) =
            connection::new_system_sync().map_err(|e| BluetoothError::Init(e.to_string()))?;
        tokio::spawn(async move {
            let err = resource.await;
            error!("Lost connection to the system bus: {}", err);
        });

        let matches = watch_objects(&conn, &sink).await?;
        self.keep_matches(matches);

        let agent_conn = conn.clone();
        let agent_sink = sink.clone();
        conn.start_receive(
            MatchRule::new_method_call().with_path(AGENT_PATH),
            Box::new(move |msg, _| {
                handle_agent_call(msg, &agent_conn, &agent_sink);
                true
            }),
        );

        let operational = name_has_owner(&conn, BLUEZ_SERVICE).await?;
        let (adapters, devices) = if operational {
            managed_objects(&conn).await?
        } else {
            (Vec::new(), Vec::new())
        };

        *self.system.lock().unwrap_or_else(PoisonError::into_inner) = Some(conn);
        Ok(Ready {
            operational,
            adapters,
            devices,
        })
    }

    async fn initialize_obex(&self, sink: ServiceSink) -> Result<bool> {
        self.connect_obex(sink).await
    }

    async fn start_service(&self, kind: ServiceKind) -> Result<()> {
        match kind {
            ServiceKind::Bluez => start_service_by_name(self.system()?, BLUEZ_SERVICE).await,
            ServiceKind::Obex => {
                start_service_by_name(self.session()?, super::obex::OBEX_SERVICE).await
            }
        }
    }

    async fn start_discovery(&self, adapter: &str) -> Result<()> {
        call(self.system()?, BLUEZ_SERVICE, adapter, ADAPTER_IFACE, "StartDiscovery", ()).await
    }

    async fn stop_discovery(&self, adapter: &str) -> Result<()> {
        call(self.system()?, BLUEZ_SERVICE, adapter, ADAPTER_IFACE, "StopDiscovery", ()).await
    }

    async fn set_adapter_property(&self, adapter: &str, change: &AdapterChange) -> Result<()> {
        let proxy = Proxy::new(BLUEZ_SERVICE, adapter, CALL_TIMEOUT, self.system()?);
        let property = change.property();
        match change {
            AdapterChange::Name(name) => proxy.set(ADAPTER_IFACE, property, name.clone()).await?,
            AdapterChange::Powered(powered) => proxy.set(ADAPTER_IFACE, property, *powered).await?,
            AdapterChange::Discoverable(discoverable) => {
                proxy.set(ADAPTER_IFACE, property, *discoverable).await?
            }
            AdapterChange::DiscoverableTimeout(timeout) => {
                proxy.set(ADAPTER_IFACE, property, *timeout).await?
            }
        }
        Ok(())
    }

    async fn set_trusted(&self, device: &str, trusted: bool) -> Result<()> {
        let proxy = Proxy::new(BLUEZ_SERVICE, device, CALL_TIMEOUT, self.system()?);
        proxy.set(DEVICE_IFACE, "Trusted", trusted).await?;
        Ok(())
    }

    async fn register_agent(&self, capability: AgentCapability) -> Result<()> {
        let args = (Path::from(AGENT_PATH), capability.as_str());
        let conn = self.system()?;
        call(conn, BLUEZ_SERVICE, BLUEZ_ROOT, AGENT_MANAGER_IFACE, "RegisterAgent", args).await
    }

    async fn request_default_agent(&self) -> Result<()> {
        let args = (Path::from(AGENT_PATH),);
        let conn = self.system()?;
        call(
            conn,
            BLUEZ_SERVICE,
            BLUEZ_ROOT,
            AGENT_MANAGER_IFACE,
            "RequestDefaultAgent",
            args,
        )
        .await
    }

    async fn unregister_agent(&self) -> Result<()> {
        let args = (Path::from(AGENT_PATH),);
        let conn = self.system()?;
        call(conn, BLUEZ_SERVICE, BLUEZ_ROOT, AGENT_MANAGER_IFACE, "UnregisterAgent", args).await
    }

    async fn register_obex_agent(&self) -> Result<()> {
        self.obex_agent_call("RegisterAgent").await
    }

    async fn unregister_obex_agent(&self) -> Result<()> {
        self.obex_agent_call("UnregisterAgent").await
    }

    async fn session_metadata(&self, session: &str) -> Result<SessionMetadata> {
        self.obex_session_metadata(session).await
    }
}

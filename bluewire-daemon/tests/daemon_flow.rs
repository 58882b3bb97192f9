use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

use bluewire_daemon::adapter_settings::{AdapterChange, AdapterUpdate};
use bluewire_daemon::agent::{
    AgentCapability, AgentSource, Decision, PendingRequest, RequestKind, Responder,
};
use bluewire_daemon::bluetooth::{BluetoothService, Ready, ServiceEvent, ServiceKind, ServiceSink};
use bluewire_daemon::config::DaemonConfig;
use bluewire_daemon::ipc::{send_request, IpcServer};
use bluewire_daemon::model::{
    Adapter, Device, PropValue, Properties, Session, SessionKind, SessionMetadata, TransferState,
};
use bluewire_daemon::protocol::{Request, Response};
use bluewire_daemon::state::{AdapterState, SavedState};
use bluewire_daemon::{BluetoothError, Daemon, DaemonHandle, Result};

const ADAPTER: &str = "/org/bluez/hci0";
const DEVICE: &str = "/org/bluez/hci0/dev_AA_BB_CC_DD_EE_FF";
const ADDRESS: &str = "AA:BB:CC:DD:EE:FF";

/// Records every remote call and hands out the event sink it was given.
#[derive(Default)]
struct FakeService {
    ready: Ready,
    calls: Mutex<Vec<String>>,
    sink: Mutex<Option<ServiceSink>>,
    metadata: Mutex<HashMap<String, SessionMetadata>>,
    /// Emitted from inside `initialize`, before the snapshot is returned.
    during_init: Mutex<Vec<ServiceEvent>>,
}

impl FakeService {
    fn online() -> Self {
        Self {
            ready: Ready {
                operational: true,
                adapters: vec![Adapter {
                    ubi: ADAPTER.into(),
                    name: "laptop".into(),
                    system_name: "laptop".into(),
                    address: "00:11:22:33:44:55".into(),
                    powered: true,
                    ..Default::default()
                }],
                devices: vec![Device {
                    ubi: DEVICE.into(),
                    adapter: ADAPTER.into(),
                    address: ADDRESS.into(),
                    name: "Headphones".into(),
                    icon: "audio-headset".into(),
                    paired: true,
                    uuids: vec!["0000110b-0000-1000-8000-00805f9b34fb".into()],
                    ..Default::default()
                }],
            },
            ..Default::default()
        }
    }

    fn offline() -> Self {
        Self::default()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn count(&self, call: &str) -> usize {
        self.calls().iter().filter(|recorded| *recorded == call).count()
    }

    fn emit(&self, event: ServiceEvent) {
        let sink = self.sink.lock().unwrap().clone().expect("service not initialized");
        assert!(sink.emit(event));
    }
}

#[async_trait]
impl BluetoothService for FakeService {
    async fn initialize(&self, sink: ServiceSink) -> Result<Ready> {
        for event in self.during_init.lock().unwrap().drain(..) {
            assert!(sink.emit(event));
        }
        *self.sink.lock().unwrap() = Some(sink);
        Ok(self.ready.clone())
    }

    async fn initialize_obex(&self, sink: ServiceSink) -> Result<bool> {
        *self.sink.lock().unwrap() = Some(sink);
        Ok(true)
    }

    async fn start_service(&self, kind: ServiceKind) -> Result<()> {
        self.record(format!("start_service {:?}", kind));
        Ok(())
    }

    async fn start_discovery(&self, adapter: &str) -> Result<()> {
        self.record(format!("start_discovery {}", adapter));
        Ok(())
    }

    async fn stop_discovery(&self, adapter: &str) -> Result<()> {
        self.record(format!("stop_discovery {}", adapter));
        Ok(())
    }

    async fn set_adapter_property(&self, adapter: &str, change: &AdapterChange) -> Result<()> {
        self.record(format!("set_adapter_property {} {:?}", adapter, change));
        Ok(())
    }

    async fn set_trusted(&self, device: &str, trusted: bool) -> Result<()> {
        self.record(format!("set_trusted {} {}", device, trusted));
        Ok(())
    }

    async fn register_agent(&self, capability: AgentCapability) -> Result<()> {
        self.record(format!("register_agent {}", capability.as_str()));
        Ok(())
    }

    async fn request_default_agent(&self) -> Result<()> {
        self.record("request_default_agent".into());
        Ok(())
    }

    async fn unregister_agent(&self) -> Result<()> {
        self.record("unregister_agent".into());
        Ok(())
    }

    async fn register_obex_agent(&self) -> Result<()> {
        self.record("register_obex_agent".into());
        Ok(())
    }

    async fn unregister_obex_agent(&self) -> Result<()> {
        self.record("unregister_obex_agent".into());
        Ok(())
    }

    async fn session_metadata(&self, session: &str) -> Result<SessionMetadata> {
        self.metadata
            .lock()
            .unwrap()
            .get(session)
            .cloned()
            .ok_or_else(|| BluetoothError::InvalidRemoteHandle(session.to_string()))
    }
}

fn start(service: FakeService) -> (Arc<FakeService>, DaemonHandle, JoinHandle<()>) {
    let mut config = DaemonConfig::default();
    config.bluetooth.restore_state = false;
    start_with(service, config)
}

fn start_with(
    service: FakeService,
    config: DaemonConfig,
) -> (Arc<FakeService>, DaemonHandle, JoinHandle<()>) {
    let service = Arc::new(service);
    let (daemon, handle) = Daemon::new(service.clone(), config);
    let task = tokio::spawn(daemon.run());
    (service, handle, task)
}

fn powered(powered: bool) -> Properties {
    Properties::from([("Powered".to_string(), PropValue::Bool(powered))])
}

fn second_adapter(powered: bool) -> Adapter {
    Adapter {
        ubi: "/org/bluez/hci1".into(),
        name: "dongle".into(),
        system_name: "dongle".into(),
        address: "66:77:88:99:AA:BB".into(),
        powered,
        ..Default::default()
    }
}

async fn pending(handle: &DaemonHandle) -> Vec<PendingRequest> {
    match handle.request(Request::PendingRequests).await.unwrap() {
        Response::PendingRequests { requests } => requests,
        other => panic!("unexpected response {:?}", other),
    }
}

async fn session_list(handle: &DaemonHandle) -> Vec<Session> {
    match handle.request(Request::Sessions).await.unwrap() {
        Response::Sessions { sessions } => sessions,
        other => panic!("unexpected response {:?}", other),
    }
}

async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

/// Polls until `done` holds, letting spawned calls and events run in between.
async fn wait_until<F>(mut done: F)
where
    F: FnMut() -> bool,
{
    for _ in 0..200 {
        if done() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition not reached");
}

async fn online(handle: &DaemonHandle) -> (bool, bool, bool) {
    match handle.request(Request::IsOnline).await.unwrap() {
        Response::Online {
            online,
            obex_online,
            discovering,
        } => (online, obex_online, discovering),
        other => panic!("unexpected response {:?}", other),
    }
}

async fn wait_online(handle: &DaemonHandle) {
    for _ in 0..200 {
        let (online, obex_online, _) = online(handle).await;
        if online && obex_online {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("daemon never came online");
}

#[tokio::test(start_paused = true)]
async fn discovery_stops_itself_after_timeout() {
    let (service, handle, _task) = start(FakeService::online());
    wait_online(&handle).await;

    let response = handle.request(Request::StartDiscovering { timeout_ms: 5000 }).await.unwrap();
    assert!(matches!(response, Response::Success { .. }));
    let start = format!("start_discovery {}", ADAPTER);
    let stop = format!("stop_discovery {}", ADAPTER);
    wait_until(|| service.count(&start) == 1).await;
    assert!(online(&handle).await.2);

    tokio::time::sleep(Duration::from_millis(4800)).await;
    settle().await;
    assert_eq!(service.count(&stop), 0);
    assert!(online(&handle).await.2);

    tokio::time::sleep(Duration::from_millis(300)).await;
    wait_until(|| service.count(&stop) == 1).await;
    assert!(!online(&handle).await.2);
}

#[tokio::test(start_paused = true)]
async fn restarting_discovery_extends_the_window() {
    let (service, handle, _task) = start(FakeService::online());
    wait_online(&handle).await;
    let start = format!("start_discovery {}", ADAPTER);
    let stop = format!("stop_discovery {}", ADAPTER);

    handle.request(Request::StartDiscovering { timeout_ms: 1000 }).await.unwrap();
    tokio::time::sleep(Duration::from_millis(800)).await;
    handle.request(Request::StartDiscovering { timeout_ms: 1000 }).await.unwrap();
    tokio::time::sleep(Duration::from_millis(800)).await;
    settle().await;

    assert_eq!(service.count(&start), 1);
    assert_eq!(service.count(&stop), 0);

    tokio::time::sleep(Duration::from_millis(300)).await;
    wait_until(|| service.count(&stop) == 1).await;
}

#[tokio::test(start_paused = true)]
async fn stop_without_discovery_is_a_no_op() {
    let (service, handle, _task) = start(FakeService::online());
    wait_online(&handle).await;

    let response = handle.request(Request::StopDiscovering).await.unwrap();
    assert!(matches!(response, Response::Success { .. }));
    settle().await;
    assert!(!service.calls().iter().any(|call| call.starts_with("stop_discovery")));
}

#[tokio::test(start_paused = true)]
async fn offline_service_ignores_discovery_and_gets_started() {
    let (service, handle, _task) = start(FakeService::offline());
    wait_until(|| service.count("start_service Bluez") == 1).await;

    handle.request(Request::StartDiscovering { timeout_ms: 1000 }).await.unwrap();
    tokio::time::sleep(Duration::from_millis(2000)).await;
    settle().await;

    let (online, _, discovering) = online(&handle).await;
    assert!(!online);
    assert!(!discovering);
    assert!(!service.calls().iter().any(|call| call.contains("discovery")));
}

#[tokio::test(start_paused = true)]
async fn device_queries_project_known_devices() {
    let (service, handle, _task) = start(FakeService::online());
    wait_online(&handle).await;

    let Response::Devices { devices } = handle.request(Request::AllDevices).await.unwrap() else {
        panic!("expected device list");
    };
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[ADDRESS].name, "Headphones");
    assert_eq!(devices[ADDRESS].ubi, DEVICE);

    let request = Request::Device {
        address: ADDRESS.to_ascii_lowercase(),
    };
    let Response::Device { device } = handle.request(request.clone()).await.unwrap() else {
        panic!("expected device");
    };
    assert_eq!(device.icon, "audio-headset");
    assert_eq!(device.uuids, "0000110b-0000-1000-8000-00805f9b34fb");

    service.emit(ServiceEvent::DeviceRemoved(DEVICE.into()));
    settle().await;
    let Response::Device { device } = handle.request(request).await.unwrap() else {
        panic!("expected device");
    };
    assert!(device.is_empty());
}

#[tokio::test(start_paused = true)]
async fn agent_request_resolves_exactly_once() {
    let (service, handle, _task) = start(FakeService::online());
    wait_online(&handle).await;

    let (responder, decision) = Responder::channel();
    service.emit(ServiceEvent::AgentCall {
        source: AgentSource::Bluez,
        device: DEVICE.into(),
        kind: RequestKind::Confirmation { passkey: 123456 },
        responder,
    });
    settle().await;

    let requests = pending(&handle).await;
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].address, ADDRESS);
    let id = requests[0].id;

    let resolve = Request::Resolve {
        id,
        decision: Decision::AcceptAndTrust,
    };
    let first = handle.request(resolve.clone()).await.unwrap();
    assert!(matches!(first, Response::Success { .. }));
    assert_eq!(decision.await.unwrap(), Decision::AcceptAndTrust);

    let second = handle.request(resolve).await.unwrap();
    assert!(matches!(second, Response::Error { .. }));

    let trusted = format!("set_trusted {} true", DEVICE);
    wait_until(|| service.count(&trusted) == 1).await;
}

#[tokio::test(start_paused = true)]
async fn cancelled_agent_drops_pending_requests() {
    let (service, handle, _task) = start(FakeService::online());
    wait_online(&handle).await;

    let (responder, decision) = Responder::channel();
    service.emit(ServiceEvent::AgentCall {
        source: AgentSource::Bluez,
        device: DEVICE.into(),
        kind: RequestKind::Authorization,
        responder,
    });
    service.emit(ServiceEvent::AgentCancelled(AgentSource::Bluez));
    settle().await;

    assert!(decision.await.is_err());
    let requests = pending(&handle).await;
    assert!(requests.is_empty());
}

#[tokio::test(start_paused = true)]
async fn sessions_follow_notifications_only() {
    let service = FakeService::online();
    service.metadata.lock().unwrap().insert(
        "/org/bluez/obex/server/session0".into(),
        SessionMetadata {
            device_address: ADDRESS.into(),
            kind: SessionKind::ObjectPush,
        },
    );
    let (service, handle, _task) = start(service);
    wait_online(&handle).await;

    service.emit(ServiceEvent::SessionCreated("/org/bluez/obex/server/session0".into()));
    service.emit(ServiceEvent::SessionCreated("/org/bluez/obex/server/session1".into()));
    settle().await;

    let mut sessions = Vec::new();
    for _ in 0..200 {
        sessions = session_list(&handle).await;
        if sessions.iter().any(|session| session.device_address == ADDRESS) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    assert_eq!(sessions.len(), 2);
    let with_metadata = sessions
        .iter()
        .find(|session| session.id.ends_with("session0"))
        .unwrap();
    assert_eq!(with_metadata.kind, SessionKind::ObjectPush);
    // Failed metadata lookup keeps the session.
    let without = sessions.iter().find(|session| session.id.ends_with("session1")).unwrap();
    assert!(without.device_address.is_empty());

    service.emit(ServiceEvent::SessionRemoved("/org/bluez/obex/server/session0".into()));
    service.emit(ServiceEvent::SessionRemoved("/org/bluez/obex/server/unknown".into()));
    settle().await;

    let sessions = session_list(&handle).await;
    assert_eq!(sessions.len(), 1);
    assert!(sessions[0].id.ends_with("session1"));
}

#[tokio::test(start_paused = true)]
async fn adapter_update_writes_only_changed_properties() {
    let (service, handle, _task) = start(FakeService::online());
    wait_online(&handle).await;

    let unchanged = handle
        .request(Request::SetAdapter {
            ubi: ADAPTER.into(),
            update: AdapterUpdate {
                name: Some("laptop".into()),
                ..Default::default()
            },
        })
        .await
        .unwrap();
    assert_eq!(unchanged, Response::success("Adapter already up to date"));

    let renamed = handle
        .request(Request::SetAdapter {
            ubi: ADAPTER.into(),
            update: AdapterUpdate {
                name: Some("desk".into()),
                ..Default::default()
            },
        })
        .await
        .unwrap();
    assert!(matches!(renamed, Response::Success { .. }));
    wait_until(|| {
        service.calls().iter().any(|call| call.starts_with("set_adapter_property"))
    })
    .await;
    let writes: Vec<String> = service
        .calls()
        .into_iter()
        .filter(|call| call.starts_with("set_adapter_property"))
        .collect();
    assert_eq!(writes, vec![format!("set_adapter_property {} Name(\"desk\")", ADAPTER)]);

    let unknown = handle
        .request(Request::SetAdapter {
            ubi: "/org/bluez/hci9".into(),
            update: AdapterUpdate::default(),
        })
        .await
        .unwrap();
    assert!(matches!(unknown, Response::Error { .. }));
}

#[tokio::test]
async fn ipc_round_trip_and_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("bluewire.sock");

    let (service, handle, task) = start(FakeService::online());
    let server = IpcServer::bind(&socket, handle.clone()).unwrap();
    tokio::spawn(server.run());
    wait_online(&handle).await;
    wait_until(|| service.count("register_agent DisplayYesNo") == 1).await;

    let response = send_request(&socket, &Request::IsOnline).await.unwrap();
    assert_eq!(
        response,
        Response::Online {
            online: true,
            obex_online: true,
            discovering: false,
        }
    );

    let response = send_request(&socket, &Request::Shutdown).await.unwrap();
    assert!(matches!(response, Response::Success { .. }));
    task.await.unwrap();
    assert_eq!(service.count("unregister_agent"), 1);
}

#[tokio::test(start_paused = true)]
async fn notifications_during_initialization_are_kept() {
    let service = FakeService::online();
    *service.during_init.lock().unwrap() = vec![
        ServiceEvent::AdapterAdded(second_adapter(true)),
        ServiceEvent::PropertiesChanged {
            ubi: ADAPTER.into(),
            properties: powered(false),
        },
    ];
    let (_service, handle, _task) = start(service);
    wait_online(&handle).await;

    let Response::Adapters { adapters } = handle.request(Request::Adapters).await.unwrap() else {
        panic!("expected adapters");
    };
    assert_eq!(adapters.len(), 2);
    let first = adapters.iter().find(|entry| entry.adapter.ubi == ADAPTER).unwrap();
    assert!(!first.adapter.powered);
    assert!(!first.usable);
    let second = adapters.iter().find(|entry| entry.adapter.ubi == "/org/bluez/hci1").unwrap();
    assert!(second.adapter.powered);
    assert!(second.usable);
}

#[tokio::test(start_paused = true)]
async fn powering_off_ends_discovery() {
    let (service, handle, _task) = start(FakeService::online());
    wait_online(&handle).await;
    let start = format!("start_discovery {}", ADAPTER);
    let stop = format!("stop_discovery {}", ADAPTER);

    handle.request(Request::StartDiscovering { timeout_ms: 5000 }).await.unwrap();
    wait_until(|| service.count(&start) == 1).await;

    service.emit(ServiceEvent::PropertiesChanged {
        ubi: ADAPTER.into(),
        properties: powered(false),
    });
    settle().await;
    assert!(!online(&handle).await.2);

    service.emit(ServiceEvent::PropertiesChanged {
        ubi: ADAPTER.into(),
        properties: powered(true),
    });
    settle().await;
    handle.request(Request::StartDiscovering { timeout_ms: 5000 }).await.unwrap();
    wait_until(|| service.count(&start) == 2).await;
    assert!(online(&handle).await.2);

    // Only the new window stops discovery.
    tokio::time::sleep(Duration::from_millis(5100)).await;
    wait_until(|| service.count(&stop) == 1).await;
    assert!(!online(&handle).await.2);
}

#[tokio::test(start_paused = true)]
async fn adapter_power_is_restored_and_saved() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bluewire").join("state.toml");
    let mut saved = SavedState::default();
    saved
        .adapters
        .insert("00:11:22:33:44:55".into(), AdapterState { powered: false });
    saved.save(&path).unwrap();

    let mut config = DaemonConfig::default();
    config.state_path = path.clone();
    config.bluetooth.restore_state = true;
    let (service, handle, task) = start_with(FakeService::online(), config);
    wait_online(&handle).await;

    let restore = format!("set_adapter_property {} Powered(false)", ADAPTER);
    wait_until(|| service.count(&restore) == 1).await;
    service.emit(ServiceEvent::PropertiesChanged {
        ubi: ADAPTER.into(),
        properties: powered(false),
    });
    // No saved entry for this one, so it is left as it is.
    service.emit(ServiceEvent::AdapterAdded(second_adapter(true)));
    settle().await;
    let writes = service
        .calls()
        .iter()
        .filter(|call| call.starts_with("set_adapter_property"))
        .count();
    assert_eq!(writes, 1);

    handle.shutdown();
    task.await.unwrap();

    let saved = SavedState::load(&path).unwrap();
    assert_eq!(saved.adapters.len(), 2);
    assert_eq!(saved.adapters["00:11:22:33:44:55"], AdapterState { powered: false });
    assert_eq!(saved.adapters["66:77:88:99:AA:BB"], AdapterState { powered: true });
}

#[tokio::test(start_paused = true)]
async fn pushed_file_is_authorized_for_the_sending_device() {
    let session = "/org/bluez/obex/server/session0";
    let service = FakeService::online();
    service.metadata.lock().unwrap().insert(
        session.into(),
        SessionMetadata {
            device_address: ADDRESS.into(),
            kind: SessionKind::ObjectPush,
        },
    );
    let (service, handle, _task) = start(service);
    wait_online(&handle).await;

    service.emit(ServiceEvent::SessionCreated(session.into()));
    for _ in 0..200 {
        if session_list(&handle).await.iter().any(|known| known.device_address == ADDRESS) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    let (responder, decision) = Responder::channel();
    service.emit(ServiceEvent::AgentCall {
        source: AgentSource::Obex,
        device: String::new(),
        kind: RequestKind::AuthorizePush {
            transfer: format!("{}/transfer0", session),
            name: "photo.jpg".into(),
            session: session.into(),
            size: Some(2048),
        },
        responder,
    });
    settle().await;

    let requests = pending(&handle).await;
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].source, AgentSource::Obex);
    assert_eq!(requests[0].address, ADDRESS);

    let response = handle
        .request(Request::Resolve {
            id: requests[0].id,
            decision: Decision::AcceptAndTrust,
        })
        .await
        .unwrap();
    assert!(matches!(response, Response::Success { .. }));
    assert_eq!(decision.await.unwrap(), Decision::AcceptAndTrust);

    let current = session_list(&handle).await;
    assert_eq!(
        current[0].transfer,
        TransferState::Receiving {
            name: "photo.jpg".into()
        }
    );
    // Trust is a BlueZ device property, OBEX pushes never set it.
    settle().await;
    assert!(!service.calls().iter().any(|call| call.starts_with("set_trusted")));
}

#[tokio::test(start_paused = true)]
async fn released_agent_is_registered_again() {
    let (service, handle, task) = start(FakeService::online());
    wait_online(&handle).await;
    wait_until(|| service.count("register_agent DisplayYesNo") == 1).await;

    let (responder, decision) = Responder::channel();
    service.emit(ServiceEvent::AgentCall {
        source: AgentSource::Bluez,
        device: DEVICE.into(),
        kind: RequestKind::Authorization,
        responder,
    });
    service.emit(ServiceEvent::AgentReleased(AgentSource::Bluez));
    settle().await;

    assert!(decision.await.is_err());
    let requests = pending(&handle).await;
    assert!(requests.is_empty());

    service.emit(ServiceEvent::Operational(false));
    service.emit(ServiceEvent::Operational(true));
    wait_until(|| service.count("register_agent DisplayYesNo") == 2).await;
    settle().await;

    handle.shutdown();
    task.await.unwrap();
    assert_eq!(service.count("unregister_agent"), 1);
}

/*!
 * OBEX D-Bus Binding
 * Transfer sessions and the push agent on the session bus
 */

use dbus::arg::PropMap;
use dbus::channel::{MatchingReceiver, Sender};
use dbus::message::MatchRule;
use dbus::nonblock::stdintf::org_freedesktop_dbus::{ObjectManager as _, Properties as _};
use dbus::nonblock::{MsgMatch, Proxy, SyncConnection};
use dbus::{Message, Path};
use dbus_tokio::connection;
use std::collections::{HashMap, HashSet};
use std::path::{Path as FsPath, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, error, warn};

use super::bluez::{
    ask, call, error_reply, name_has_owner, watch_owner, BluezService, CALL_TIMEOUT,
    OBJECT_MANAGER_IFACE,
};
use super::convert;
use super::{ServiceEvent, ServiceSink};
use crate::agent::{AgentSource, RequestKind};
use crate::error::{BluetoothError, Result};
use crate::model::{SessionKind, SessionMetadata};

pub(super) const OBEX_SERVICE: &str = "org.bluez.obex";
const OBEX_ROOT: &str = "/org/bluez/obex";
const OBEX_AGENT_MANAGER_IFACE: &str = "org.bluez.obex.AgentManager1";
const OBEX_SESSION_IFACE: &str = "org.bluez.obex.Session1";
const OBEX_TRANSFER_IFACE: &str = "org.bluez.obex.Transfer1";
const OBEX_AGENT_PATH: &str = "/org/bluewire/obex_agent";

const FALLBACK_FILE_NAME: &str = "incoming";

/// Where an accepted push named `name` is written. Only the final path
/// component of `name` is used.
pub fn target_path(save_path: &FsPath, name: &str) -> PathBuf {
    let file_name = FsPath::new(name)
        .file_name()
        .filter(|file_name| !file_name.is_empty())
        .map(|file_name| file_name.to_os_string())
        .unwrap_or_else(|| FALLBACK_FILE_NAME.into());
    save_path.join(file_name)
}

type KnownSessions = Arc<Mutex<HashSet<String>>>;

fn track(sessions: &KnownSessions, sink: &ServiceSink, path: String) {
    sessions
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(path.clone());
    sink.emit(ServiceEvent::SessionCreated(path));
}

fn untrack(sessions: &KnownSessions, sink: &ServiceSink, path: &str) {
    // Removal is forwarded even for sessions never seen here.
    sessions.lock().unwrap_or_else(PoisonError::into_inner).remove(path);
    sink.emit(ServiceEvent::SessionRemoved(path.to_string()));
}

/// obexd vanished: every session it owned is gone with it.
fn drop_all(sessions: &KnownSessions, sink: &ServiceSink) {
    let paths: Vec<String> = sessions
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .drain()
        .collect();
    for path in paths {
        sink.emit(ServiceEvent::SessionRemoved(path));
    }
}

async fn existing_sessions(conn: &Arc<SyncConnection>) -> Result<Vec<String>> {
    let proxy = Proxy::new(OBEX_SERVICE, "/", CALL_TIMEOUT, conn.clone());
    let objects = proxy.get_managed_objects().await?;

    let mut sessions: Vec<String> = objects
        .into_iter()
        .filter(|(_, interfaces)| interfaces.contains_key(OBEX_SESSION_IFACE))
        .map(|(path, _)| path.to_string())
        .collect();
    sessions.sort();
    Ok(sessions)
}

async fn watch_sessions(
    conn: &Arc<SyncConnection>,
    sink: &ServiceSink,
    sessions: &KnownSessions,
) -> Result<Vec<MsgMatch>> {
    let mut matches = Vec::new();

    let (added, added_sessions) = (sink.clone(), sessions.clone());
    let rule =
        MatchRule::new_signal(OBJECT_MANAGER_IFACE, "InterfacesAdded").with_sender(OBEX_SERVICE);
    matches.push(conn.add_match(rule).await?.cb(move |msg: Message, (): ()| {
        if let Ok((path, interfaces)) = msg.read2::<Path, HashMap<String, PropMap>>() {
            if interfaces.contains_key(OBEX_SESSION_IFACE) {
                track(&added_sessions, &added, path.to_string());
            }
        }
        true
    }));

    let (removed, removed_sessions) = (sink.clone(), sessions.clone());
    let rule =
        MatchRule::new_signal(OBJECT_MANAGER_IFACE, "InterfacesRemoved").with_sender(OBEX_SERVICE);
    matches.push(conn.add_match(rule).await?.cb(move |msg: Message, (): ()| {
        if let Ok((path, interfaces)) = msg.read2::<Path, Vec<String>>() {
            if interfaces.iter().any(|iface| iface == OBEX_SESSION_IFACE) {
                untrack(&removed_sessions, &removed, &path);
            }
        }
        true
    }));

    let (owner, owner_sessions, owner_conn) = (sink.clone(), sessions.clone(), conn.clone());
    matches.push(
        watch_owner(conn, OBEX_SERVICE, move |owned| {
            if !owned {
                drop_all(&owner_sessions, &owner);
                owner.emit(ServiceEvent::ObexOperational(false));
                return;
            }
            let (sink, sessions, conn) =
                (owner.clone(), owner_sessions.clone(), owner_conn.clone());
            tokio::spawn(async move {
                match existing_sessions(&conn).await {
                    Ok(paths) => paths.into_iter().for_each(|path| track(&sessions, &sink, path)),
                    Err(e) => warn!("Error reading OBEX sessions: {}", e),
                }
                sink.emit(ServiceEvent::ObexOperational(true));
            });
        })
        .await?,
    );

    Ok(matches)
}

fn handle_obex_agent_call(
    msg: Message,
    conn: &Arc<SyncConnection>,
    sink: &ServiceSink,
    save_path: &FsPath,
) {
    let member = msg.member().map(|member| member.to_string()).unwrap_or_default();

    match member.as_str() {
        "AuthorizePush" => {
            let Ok(transfer) = msg.read1::<Path>().map(|path| path.to_string()) else {
                let _ = conn.send(error_reply(
                    &msg,
                    "org.freedesktop.DBus.Error.InvalidArgs",
                    "Invalid arguments",
                ));
                return;
            };
            let (conn, sink, save_path) = (conn.clone(), sink.clone(), save_path.to_path_buf());
            tokio::spawn(async move {
                let proxy = Proxy::new(OBEX_SERVICE, transfer.as_str(), CALL_TIMEOUT, conn.clone());
                let props = match proxy.get_all(OBEX_TRANSFER_IFACE).await {
                    Ok(props) => props,
                    Err(e) => {
                        warn!("Error reading transfer {}: {}", transfer, e);
                        let _ = conn.send(error_reply(
                            &msg,
                            "org.bluez.obex.Error.Rejected",
                            "Unknown transfer",
                        ));
                        return;
                    }
                };

                let name = convert::prop_string(&props, "Name").unwrap_or_default();
                let session = convert::prop_string(&props, "Session").unwrap_or_default();
                let size = convert::prop_u64(&props, "Size");
                let target = target_path(&save_path, &name).to_string_lossy().into_owned();

                let kind = RequestKind::AuthorizePush {
                    transfer,
                    name,
                    session,
                    size,
                };
                ask(conn, msg, &sink, AgentSource::Obex, String::new(), kind, move |msg| {
                    msg.method_return().append1(target)
                });
            });
        }
        "Cancel" => {
            sink.emit(ServiceEvent::AgentCancelled(AgentSource::Obex));
            let _ = conn.send(msg.method_return());
        }
        "Release" => {
            sink.emit(ServiceEvent::AgentReleased(AgentSource::Obex));
            let _ = conn.send(msg.method_return());
        }
        _ => {
            debug!("Rejecting unsupported OBEX agent call {}", member);
            let _ = conn.send(error_reply(&msg, "org.bluez.obex.Error.Rejected", "Not supported"));
        }
    }
}

impl BluezService {
    pub(super) async fn connect_obex(&self, sink: ServiceSink) -> Result<bool> {
        let (resource, conn) =
            connection::new_session_sync().map_err(|e| BluetoothError::Init(e.to_string()))?;
        tokio::spawn(async move {
            let err = resource.await;
            error!("Lost connection to the session bus: {}", err);
        });

        let matches = watch_sessions(&conn, &sink, &self.known_sessions).await?;
        self.keep_matches(matches);

        let agent_conn = conn.clone();
        let agent_sink = sink.clone();
        let save_path = self.save_path.clone();
        conn.start_receive(
            MatchRule::new_method_call().with_path(OBEX_AGENT_PATH),
            Box::new(move |msg, _| {
                handle_obex_agent_call(msg, &agent_conn, &agent_sink, &save_path);
                true
            }),
        );

        let operational = name_has_owner(&conn, OBEX_SERVICE).await?;
        if operational {
            for path in existing_sessions(&conn).await? {
                track(&self.known_sessions, &sink, path);
            }
        }

        *self.session.lock().unwrap_or_else(PoisonError::into_inner) = Some(conn);
        Ok(operational)
    }

    pub(super) async fn obex_agent_call(&self, method: &str) -> Result<()> {
        let args = (Path::from(OBEX_AGENT_PATH),);
        call(self.session()?, OBEX_SERVICE, OBEX_ROOT, OBEX_AGENT_MANAGER_IFACE, method, args).await
    }

    pub(super) async fn obex_session_metadata(&self, session: &str) -> Result<SessionMetadata> {
        let proxy = Proxy::new(OBEX_SERVICE, session, CALL_TIMEOUT, self.session()?);
        let props = proxy.get_all(OBEX_SESSION_IFACE).await?;

        let device_address = convert::prop_string(&props, "Destination")
            .ok_or_else(|| BluetoothError::InvalidRemoteHandle(session.to_string()))?;
        let kind = convert::prop_string(&props, "Target")
            .map(|target| SessionKind::from_target(&target))
            .unwrap_or_default();

        Ok(SessionMetadata { device_address, kind })
    }
}

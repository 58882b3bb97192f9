/*!
 * Agent Registry
 * Pairing and authorization requests routed back from the Bluetooth service
 */

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::error::{BluetoothError, Result};
use crate::model::Ubi;

/// How many resolved request ids are remembered to tell a duplicate
/// resolution apart from an unknown one.
const RESOLVED_HISTORY: usize = 64;

/// Which external service an agent is registered with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentSource {
    Bluez,
    Obex,
}

/// IO capability announced when registering the pairing agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum AgentCapability {
    DisplayOnly,
    #[default]
    DisplayYesNo,
    KeyboardDisplay,
    NoInputNoOutput,
}

impl AgentCapability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DisplayOnly => "DisplayOnly",
            Self::DisplayYesNo => "DisplayYesNo",
            Self::KeyboardDisplay => "KeyboardDisplay",
            Self::NoInputNoOutput => "NoInputNoOutput",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Deny,
    Accept,
    AcceptAndTrust,
}

impl Decision {
    pub fn is_accepted(&self) -> bool {
        !matches!(self, Self::Deny)
    }
}

/// Answer applied to requests that are not parked for a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AuthorizationPolicy {
    #[default]
    Ask,
    Accept,
    Deny,
}

/// What the external service is asking for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RequestKind {
    Confirmation { passkey: u32 },
    Authorization,
    AuthorizeService { uuid: String },
    AuthorizePush {
        transfer: Ubi,
        name: String,
        session: Ubi,
        size: Option<u64>,
    },
}

/// One-shot reply path back to the external caller.
#[derive(Debug)]
pub struct Responder {
    tx: Option<oneshot::Sender<Decision>>,
}

impl Responder {
    pub fn channel() -> (Self, oneshot::Receiver<Decision>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// Sends the decision. Only the first call is forwarded.
    pub fn send(&mut self, id: Uuid, decision: Decision) -> Result<()> {
        let tx = self.tx.take().ok_or(BluetoothError::AlreadyResolved(id))?;
        if tx.send(decision).is_err() {
            tracing::debug!("Caller for agent request {} went away before the reply", id);
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct AgentRequest {
    pub id: Uuid,
    pub source: AgentSource,
    pub device: Ubi,
    pub address: String,
    pub kind: RequestKind,
    pub received_at: DateTime<Utc>,
    responder: Responder,
}

impl AgentRequest {
    pub fn new(
        source: AgentSource,
        device: Ubi,
        address: String,
        kind: RequestKind,
        responder: Responder,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            source,
            device,
            address,
            kind,
            received_at: Utc::now(),
            responder,
        }
    }

    pub fn summary(&self) -> PendingRequest {
        PendingRequest {
            id: self.id,
            source: self.source,
            address: self.address.clone(),
            kind: self.kind.clone(),
            received_at: self.received_at,
        }
    }
}

/// Serializable view of a parked request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingRequest {
    pub id: Uuid,
    pub source: AgentSource,
    pub address: String,
    pub kind: RequestKind,
    pub received_at: DateTime<Utc>,
}

/// Outcome of a request that has been answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub id: Uuid,
    pub source: AgentSource,
    pub device: Ubi,
    pub address: String,
    pub kind: RequestKind,
    pub decision: Decision,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum Registration {
    #[default]
    Unregistered,
    Pending,
    Registered,
}

#[derive(Debug, Default)]
pub struct AgentRegistry {
    capability: AgentCapability,
    policy: AuthorizationPolicy,
    bluez: Registration,
    obex: Registration,
    pending: HashMap<Uuid, AgentRequest>,
    resolved: VecDeque<Uuid>,
}

impl AgentRegistry {
    pub fn new(capability: AgentCapability, policy: AuthorizationPolicy) -> Self {
        Self {
            capability,
            policy,
            ..Default::default()
        }
    }

    fn registration_mut(&mut self, source: AgentSource) -> &mut Registration {
        match source {
            AgentSource::Bluez => &mut self.bluez,
            AgentSource::Obex => &mut self.obex,
        }
    }

    pub fn is_registered(&self, source: AgentSource) -> bool {
        let registration = match source {
            AgentSource::Bluez => self.bluez,
            AgentSource::Obex => self.obex,
        };
        registration == Registration::Registered
    }

    /// Claims the right to send a registration call. Returns the capability
    /// to register with, or `None` when a registration is already in flight
    /// or done.
    pub fn register_agent(
        &mut self,
        source: AgentSource,
        operational: bool,
    ) -> Result<Option<AgentCapability>> {
        if !operational {
            return Err(BluetoothError::NotOperational);
        }

        let capability = self.capability;
        let registration = self.registration_mut(source);
        match registration {
            Registration::Unregistered => {
                *registration = Registration::Pending;
                Ok(Some(capability))
            }
            Registration::Pending | Registration::Registered => Ok(None),
        }
    }

    pub fn registration_finished(&mut self, source: AgentSource, result: &Result<()>) {
        let registration = self.registration_mut(source);
        *registration = match result {
            Ok(()) => Registration::Registered,
            Err(_) => Registration::Unregistered,
        };
    }

    /// The service dropped the agent (released it or went away).
    pub fn released(&mut self, source: AgentSource) {
        *self.registration_mut(source) = Registration::Unregistered;
        let cancelled = self.cancel(source);
        if cancelled > 0 {
            tracing::debug!("Dropped {} pending {:?} agent requests", cancelled, source);
        }
    }

    /// Applies the configured policy. Requests the policy cannot answer are
    /// parked until [`AgentRegistry::resolve`] is called for them.
    pub fn submit(&mut self, mut request: AgentRequest) -> Option<Resolution> {
        let decision = match self.policy {
            AuthorizationPolicy::Ask => {
                tracing::info!(
                    "Agent request {} from {} waiting for a decision: {:?}",
                    request.id,
                    request.address,
                    request.kind
                );
                self.pending.insert(request.id, request);
                return None;
            }
            AuthorizationPolicy::Accept => Decision::Accept,
            AuthorizationPolicy::Deny => Decision::Deny,
        };

        // A fresh request always carries an unused responder.
        let _ = request.responder.send(request.id, decision);
        Some(self.finish(request, decision))
    }

    pub fn resolve(&mut self, id: Uuid, decision: Decision) -> Result<Resolution> {
        let Some(mut request) = self.pending.remove(&id) else {
            if self.resolved.contains(&id) {
                tracing::warn!(
                    "Dropping duplicate resolution {:?} for agent request {}",
                    decision,
                    id
                );
                return Err(BluetoothError::AlreadyResolved(id));
            }
            return Err(BluetoothError::UnknownRequest(id));
        };

        request.responder.send(id, decision)?;
        Ok(self.finish(request, decision))
    }

    fn finish(&mut self, request: AgentRequest, decision: Decision) -> Resolution {
        if self.resolved.len() == RESOLVED_HISTORY {
            self.resolved.pop_front();
        }
        self.resolved.push_back(request.id);

        tracing::info!(
            "Agent request {} from {} resolved: {:?}",
            request.id,
            request.address,
            decision
        );
        Resolution {
            id: request.id,
            source: request.source,
            device: request.device,
            address: request.address,
            kind: request.kind,
            decision,
        }
    }

    /// Drops every parked request of one agent. The callers see their reply
    /// channel close.
    pub fn cancel(&mut self, source: AgentSource) -> usize {
        let before = self.pending.len();
        self.pending.retain(|_, request| request.source != source);
        before - self.pending.len()
    }

    pub fn pending(&self) -> Vec<PendingRequest> {
        let mut requests: Vec<PendingRequest> =
            self.pending.values().map(AgentRequest::summary).collect();
        requests.sort_by_key(|request| request.received_at);
        requests
    }
}

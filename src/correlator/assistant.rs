//! Correlator for the enrollment assistant side channel.
//!
//! Unlike devices, the assistant is a single shared socket. Requests from
//! every session go out over it, and replies are routed back by `nodeId`
//! through one process-wide pending table.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::{CorrelationSlot, CorrelatorError};
use crate::config::AssistantConfig;
use crate::device::DeviceTransport;

/// Request sent to the assistant on behalf of one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssistantRequest {
    pub action: String,
    #[serde(default)]
    pub sub_action: String,
    #[serde(default)]
    pub node_id: String,
    #[serde(default)]
    pub payload: Value,
}

impl AssistantRequest {
    pub fn new(action: impl Into<String>, sub_action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            sub_action: sub_action.into(),
            node_id: String::new(),
            payload: Value::Null,
        }
    }

    #[must_use]
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }
}

/// Reply from the assistant, routed by `node_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssistantResponse {
    pub node_id: String,
    #[serde(default)]
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub payload: Value,
}

/// Only the routing key, for replies that fail full decoding.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct NodeIdOnly {
    node_id: String,
}

/// Shared assistant socket plus the pending table keyed by session id.
///
/// Every slot gets its own id from `next_id`, so a caller cleaning up after
/// a timeout can only remove the slot it opened.
pub struct AssistantChannel {
    transport: RwLock<Option<Arc<dyn DeviceTransport>>>,
    pending: Mutex<HashMap<String, CorrelationSlot<AssistantResponse>>>,
    next_id: AtomicU64,
    timeout: Duration,
}

impl AssistantChannel {
    pub fn new(timeout: Duration) -> Self {
        Self {
            transport: RwLock::new(None),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            timeout,
        }
    }

    pub fn from_config(config: &AssistantConfig) -> Self {
        Self::new(Duration::from_secs(config.timeout_secs))
    }

    /// Install the assistant socket. Requests sent over a previous socket are
    /// rejected, since their replies can no longer arrive.
    pub fn attach(&self, transport: Arc<dyn DeviceTransport>) {
        let replaced = self.transport.write().replace(transport).is_some();
        if replaced {
            let rejected = self.reject_all(&CorrelatorError::Disconnected);
            warn!("assistant socket replaced, {rejected} pending request(s) rejected");
        } else {
            info!("assistant connected");
        }
    }

    pub fn detach(&self) {
        self.transport.write().take();
        let rejected = self.reject_all(&CorrelatorError::Disconnected);
        info!("assistant disconnected, {rejected} pending request(s) rejected");
    }

    /// Detach only if `transport` is still the installed socket.
    pub fn release(&self, transport: &Arc<dyn DeviceTransport>) -> bool {
        {
            let mut installed = self.transport.write();
            if !installed
                .as_ref()
                .is_some_and(|current| Arc::ptr_eq(current, transport))
            {
                return false;
            }
            installed.take();
        }
        let rejected = self.reject_all(&CorrelatorError::Disconnected);
        info!("assistant disconnected, {rejected} pending request(s) rejected");
        true
    }

    pub fn is_attached(&self) -> bool {
        self.transport.read().is_some()
    }

    pub fn pending_sessions(&self) -> Vec<String> {
        let mut sessions: Vec<String> = self
            .pending
            .lock()
            .iter()
            .filter(|(_, slot)| slot.is_live())
            .map(|(session, _)| session.clone())
            .collect();
        sessions.sort();
        sessions
    }

    fn reject_all(&self, error: &CorrelatorError) -> usize {
        let drained: Vec<_> = self.pending.lock().drain().collect();
        drained
            .into_iter()
            .filter(|(_, slot)| slot.is_live())
            .map(|(_, slot)| slot.fulfil(Err(error.clone())))
            .filter(|delivered| *delivered)
            .count()
    }

    /// Send `request` for `session_id` and await the routed reply, retrying
    /// unparseable replies up to `max_retries` times.
    pub async fn invoke(
        &self,
        session_id: &str,
        request: &AssistantRequest,
        max_retries: u32,
    ) -> Result<AssistantResponse, CorrelatorError> {
        let mut retries = 0;
        loop {
            match self.exchange(session_id, request).await {
                Err(err) if err.is_retryable() && retries < max_retries => {
                    retries += 1;
                    warn!(
                        "session {session_id}: assistant reply could not be parsed, retry {retries}/{max_retries}"
                    );
                }
                result => return result,
            }
        }
    }

    async fn exchange(
        &self,
        session_id: &str,
        request: &AssistantRequest,
    ) -> Result<AssistantResponse, CorrelatorError> {
        let transport = self
            .transport
            .read()
            .clone()
            .ok_or_else(|| CorrelatorError::Transport("assistant is not connected".into()))?;

        let mut request = request.clone();
        request.node_id = session_id.to_string();
        let frame =
            serde_json::to_vec(&request).map_err(|e| CorrelatorError::Encode(e.to_string()))?;

        let (slot_id, receiver) = {
            let mut pending = self.pending.lock();
            if pending.get(session_id).is_some_and(CorrelationSlot::is_live) {
                return Err(CorrelatorError::Busy(session_id.to_string()));
            }
            let slot_id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
            let (slot, receiver) = CorrelationSlot::open(slot_id);
            pending.insert(session_id.to_string(), slot);
            (slot_id, receiver)
        };

        debug!(
            "session {session_id}: assistant {} / {}",
            request.action, request.sub_action
        );
        if let Err(e) = transport.send(frame).await {
            self.clear(session_id, slot_id);
            return Err(CorrelatorError::Transport(e.to_string()));
        }

        match tokio::time::timeout(self.timeout, receiver).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(CorrelatorError::Disconnected),
            Err(_) => {
                self.clear(session_id, slot_id);
                warn!("session {session_id}: assistant timed out after {:?}", self.timeout);
                Err(CorrelatorError::Timeout(self.timeout))
            }
        }
    }

    /// Drop the pending slot for `session_id` only if it is still `slot_id`.
    fn clear(&self, session_id: &str, slot_id: u64) {
        let mut pending = self.pending.lock();
        if pending
            .get(session_id)
            .is_some_and(|slot| slot.message_id() == slot_id)
        {
            pending.remove(session_id);
        }
    }

    /// Route one inbound assistant message. Returns whether a waiting
    /// request was resolved.
    pub fn handle_message(&self, raw: &[u8]) -> bool {
        let (node_id, result) = match serde_json::from_slice::<AssistantResponse>(raw) {
            Ok(response) if response.status.eq_ignore_ascii_case("error") => (
                response.node_id,
                Err(CorrelatorError::ProtocolFault {
                    status_code: response.status_code.unwrap_or(500),
                    message: response.message,
                }),
            ),
            Ok(response) => (response.node_id.clone(), Ok(response)),
            Err(_) => match serde_json::from_slice::<NodeIdOnly>(raw) {
                Ok(routing) => (routing.node_id, Err(CorrelatorError::UnexpectedParse)),
                Err(_) => {
                    warn!("assistant message without a routable nodeId dropped");
                    return false;
                }
            },
        };

        let slot = self.pending.lock().remove(&node_id);
        match slot {
            Some(slot) => slot.fulfil(result),
            None => {
                debug!("session {node_id}: assistant reply with nothing pending");
                false
            }
        }
    }
}

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::types::{
    DeviceSnapshot, DeviceStatus, DeviceTransport, DigestChallenge, NetworkInfo,
};
use crate::correlator::{CorrelationSlot, CorrelatorError, SlotResult};
use crate::envelope::DeviceResponse;

/// Mutable per-device state, guarded by the entry's own mutex.
#[derive(Default)]
struct ConnectionState {
    slot: Option<CorrelationSlot<DeviceResponse>>,
    message_id: u64,
    status: DeviceStatus,
    network: NetworkInfo,
    unauth_count: u32,
    digest_challenge: Option<DigestChallenge>,
}

/// One live device session.
pub struct DeviceConnection {
    session_id: String,
    guid: Option<String>,
    connected_at: String,
    transport: Arc<dyn DeviceTransport>,
    state: Mutex<ConnectionState>,
}

impl DeviceConnection {
    fn new(session_id: String, transport: Arc<dyn DeviceTransport>, guid: Option<String>) -> Self {
        Self {
            session_id,
            guid,
            connected_at: Utc::now().to_rfc3339(),
            transport,
            state: Mutex::new(ConnectionState::default()),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Hardware GUID reported by the device when it connected.
    pub fn guid(&self) -> Option<&str> {
        self.guid.as_deref()
    }

    pub fn transport(&self) -> Arc<dyn DeviceTransport> {
        Arc::clone(&self.transport)
    }

    /// Install a correlation slot for the next transmission.
    ///
    /// `encode` receives the message id the frame will carry. The id is only
    /// committed, and the slot only installed, when encoding succeeds.
    pub(crate) fn begin_exchange<F>(
        &self,
        encode: F,
    ) -> Result<(Vec<u8>, u64, oneshot::Receiver<SlotResult<DeviceResponse>>), CorrelatorError>
    where
        F: FnOnce(u64, Option<&DigestChallenge>) -> Result<Vec<u8>, CorrelatorError>,
    {
        let mut state = self.state.lock();
        if state.slot.as_ref().is_some_and(CorrelationSlot::is_live) {
            return Err(CorrelatorError::Busy(self.session_id.clone()));
        }

        let message_id = state.message_id + 1;
        let frame = encode(message_id, state.digest_challenge.as_ref())?;
        state.message_id = message_id;

        let (slot, receiver) = CorrelationSlot::open(message_id);
        state.slot = Some(slot);
        Ok((frame, message_id, receiver))
    }

    /// Complete the in-flight request. Returns `false` when nothing was waiting.
    pub fn fulfil(&self, result: SlotResult<DeviceResponse>) -> bool {
        let slot = self.state.lock().slot.take();
        match slot {
            Some(slot) => {
                let message_id = slot.message_id();
                let delivered = slot.fulfil(result);
                if !delivered {
                    debug!(
                        "session {}: awaiter for message {message_id} already gone",
                        self.session_id
                    );
                }
                delivered
            }
            None => {
                debug!(
                    "session {}: response arrived with no request in flight",
                    self.session_id
                );
                false
            }
        }
    }

    /// Drop the slot for `message_id` if it is still installed.
    pub(crate) fn clear_slot(&self, message_id: u64) {
        let mut state = self.state.lock();
        if state
            .slot
            .as_ref()
            .is_some_and(|slot| slot.message_id() == message_id)
        {
            state.slot = None;
        }
    }

    /// Reject whatever is in flight.
    pub(crate) fn reject_pending(&self, error: CorrelatorError) -> bool {
        let slot = self.state.lock().slot.take();
        slot.is_some_and(|slot| slot.fulfil(Err(error)))
    }

    pub fn has_request_in_flight(&self) -> bool {
        self.state
            .lock()
            .slot
            .as_ref()
            .is_some_and(CorrelationSlot::is_live)
    }

    /// Message id of the most recent transmission.
    pub fn message_id(&self) -> u64 {
        self.state.lock().message_id
    }

    pub(crate) fn record_unauthorized(&self, challenge: Option<DigestChallenge>) -> u32 {
        let mut state = self.state.lock();
        state.unauth_count += 1;
        if challenge.is_some() {
            state.digest_challenge = challenge;
        }
        state.unauth_count
    }

    pub fn unauth_count(&self) -> u32 {
        self.state.lock().unauth_count
    }

    pub fn digest_challenge(&self) -> Option<DigestChallenge> {
        self.state.lock().digest_challenge.clone()
    }

    pub fn status(&self) -> DeviceStatus {
        self.state.lock().status.clone()
    }

    /// Overwrite the status projection.
    pub fn set_status(&self, workflow: &str, message: impl Into<String>) {
        let mut state = self.state.lock();
        state.status = DeviceStatus {
            status: Some(message.into()),
            workflow: Some(workflow.to_string()),
            updated_at: Some(Utc::now().to_rfc3339()),
        };
    }

    pub fn network(&self) -> NetworkInfo {
        self.state.lock().network.clone()
    }

    pub fn update_network(&self, update: impl FnOnce(&mut NetworkInfo)) {
        update(&mut self.state.lock().network);
    }

    pub fn snapshot(&self) -> DeviceSnapshot {
        let state = self.state.lock();
        DeviceSnapshot {
            session_id: self.session_id.clone(),
            guid: self.guid.clone(),
            connected_at: self.connected_at.clone(),
            message_id: state.message_id,
            request_in_flight: state.slot.as_ref().is_some_and(CorrelationSlot::is_live),
            unauth_count: state.unauth_count,
            status: state.status.clone(),
            network: state.network.clone(),
        }
    }
}

/// Process-wide table of live device sessions.
///
/// The table lock only covers membership changes; everything about a single
/// device sits behind that entry's mutex.
#[derive(Default)]
pub struct DeviceRegistry {
    entries: RwLock<HashMap<String, Arc<DeviceConnection>>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install or replace the entry for `session_id`.
    ///
    /// A replaced entry has its in-flight request rejected with
    /// `Disconnected`; the new transport never completes it.
    pub fn register(
        &self,
        session_id: impl Into<String>,
        transport: Arc<dyn DeviceTransport>,
        guid: Option<String>,
    ) -> Arc<DeviceConnection> {
        let session_id = session_id.into();
        let connection = Arc::new(DeviceConnection::new(session_id.clone(), transport, guid));
        let previous = self
            .entries
            .write()
            .insert(session_id.clone(), Arc::clone(&connection));

        if let Some(previous) = previous {
            if previous.reject_pending(CorrelatorError::Disconnected) {
                warn!("session {session_id}: replaced while a request was in flight");
            }
            info!("session {session_id}: connection replaced");
        } else {
            info!(
                "session {session_id}: device connected (guid: {})",
                connection.guid().unwrap_or("unknown")
            );
        }
        connection
    }

    pub fn lookup(&self, session_id: &str) -> Option<Arc<DeviceConnection>> {
        self.entries.read().get(session_id).cloned()
    }

    /// Remove an entry and reject its in-flight request.
    pub fn remove(&self, session_id: &str) -> Option<Arc<DeviceConnection>> {
        let removed = self.entries.write().remove(session_id);
        if let Some(connection) = &removed {
            connection.reject_pending(CorrelatorError::Disconnected);
            info!("session {session_id}: device disconnected");
        }
        removed
    }

    /// Remove `connection` only if it is still the registered entry for its
    /// session. Socket tasks use this so a closing socket never evicts the
    /// connection that replaced it.
    pub fn remove_connection(&self, connection: &Arc<DeviceConnection>) -> bool {
        let removed = {
            let mut entries = self.entries.write();
            match entries.get(connection.session_id()) {
                Some(current) if Arc::ptr_eq(current, connection) => {
                    entries.remove(connection.session_id())
                }
                _ => None,
            }
        };
        connection.reject_pending(CorrelatorError::Disconnected);
        if removed.is_some() {
            info!("session {}: device disconnected", connection.session_id());
        }
        removed.is_some()
    }

    /// Status projection for one session.
    pub fn status(&self, session_id: &str) -> Option<DeviceStatus> {
        self.lookup(session_id).map(|c| c.status())
    }

    pub fn find_by_guid(&self, guid: &str) -> Option<Arc<DeviceConnection>> {
        self.entries
            .read()
            .values()
            .find(|c| c.guid() == Some(guid))
            .cloned()
    }

    pub fn sessions(&self) -> Vec<String> {
        let mut sessions: Vec<String> = self.entries.read().keys().cloned().collect();
        sessions.sort();
        sessions
    }

    pub fn snapshots(&self) -> Vec<DeviceSnapshot> {
        let connections: Vec<Arc<DeviceConnection>> =
            self.entries.read().values().cloned().collect();
        let mut snapshots: Vec<DeviceSnapshot> =
            connections.iter().map(|c| c.snapshot()).collect();
        snapshots.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        snapshots
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

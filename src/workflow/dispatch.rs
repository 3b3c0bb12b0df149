//! Trigger dispatch: map an inbound event to its workflow and run it.
//!
//! Validation (event known, session connected, data well-formed, no other
//! workflow active for the session) happens synchronously so callers can
//! answer the trigger with a precise status. The run itself can then be
//! awaited or detached.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use super::credential::{self, CredentialContext, CredentialRotation};
use super::engine::{Outcome, WorkflowRun};
use super::maintenance::{self, Maintenance, MaintenanceContext};
use super::{StatusReport, WorkflowError};
use crate::device::DeviceRegistry;

// ── Trigger ─────────────────────────────────────────────────────

/// `{ "type": "<EVENT>", "sessionId": "...", "data": {...} }`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowTrigger {
    #[serde(rename = "type")]
    pub event: String,
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowKind {
    CredentialRotation,
    Maintenance,
}

impl WorkflowKind {
    pub fn for_event(event: &str) -> Option<Self> {
        match event {
            credential::CHANGE_CREDENTIAL | credential::CHANGE_PASSWORD => {
                Some(Self::CredentialRotation)
            }
            maintenance::SYNCTIME | maintenance::SYNCIP | maintenance::SYNCHOSTNAME => {
                Some(Self::Maintenance)
            }
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::CredentialRotation => credential::WORKFLOW_NAME,
            Self::Maintenance => maintenance::WORKFLOW_NAME,
        }
    }
}

impl fmt::Display for WorkflowKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WorkflowDispatchError {
    #[error("unknown workflow event `{0}`")]
    UnknownEvent(String),
    #[error("no connected device for session {0}")]
    UnknownSession(String),
    #[error("a workflow is already running for session {0}")]
    AlreadyRunning(String),
    #[error("invalid trigger data: {0}")]
    InvalidData(String),
    #[error(transparent)]
    Workflow(#[from] WorkflowError),
}

/// What a finished run reports back.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowSummary {
    pub workflow: WorkflowKind,
    pub session_id: String,
    pub event: String,
    pub outcome: Outcome,
    pub states: Vec<String>,
    pub status: StatusReport,
}

impl WorkflowSummary {
    fn from_run<C: super::WorkflowContext>(
        workflow: WorkflowKind,
        event: &str,
        run: &WorkflowRun<C>,
    ) -> Self {
        Self {
            workflow,
            session_id: run.context.session_id().to_string(),
            event: event.to_string(),
            outcome: run.outcome,
            states: run.history.iter().map(|s| (*s).to_string()).collect(),
            status: run.context.report().clone(),
        }
    }
}

// ── Dispatcher ──────────────────────────────────────────────────

/// Releases the session's active marker when dropped.
struct ActiveClaim {
    active: Arc<Mutex<HashSet<String>>>,
    session_id: String,
}

impl Drop for ActiveClaim {
    fn drop(&mut self) {
        self.active.lock().remove(&self.session_id);
    }
}

enum PreparedContext {
    Credential(CredentialContext),
    Maintenance(MaintenanceContext),
}

/// A validated trigger holding its session claim.
pub struct PreparedRun {
    kind: WorkflowKind,
    event: String,
    context: PreparedContext,
    claim: ActiveClaim,
}

impl PreparedRun {
    pub fn kind(&self) -> WorkflowKind {
        self.kind
    }
}

pub struct WorkflowDispatcher {
    registry: Arc<DeviceRegistry>,
    credential: Arc<CredentialRotation>,
    maintenance: Arc<Maintenance>,
    active: Arc<Mutex<HashSet<String>>>,
}

impl WorkflowDispatcher {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        credential: Arc<CredentialRotation>,
        maintenance: Arc<Maintenance>,
    ) -> Self {
        Self {
            registry,
            credential,
            maintenance,
            active: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn is_active(&self, session_id: &str) -> bool {
        self.active.lock().contains(session_id)
    }

    pub fn active_sessions(&self) -> Vec<String> {
        let mut sessions: Vec<String> = self.active.lock().iter().cloned().collect();
        sessions.sort();
        sessions
    }

    fn claim(&self, session_id: &str) -> Result<ActiveClaim, WorkflowDispatchError> {
        if !self.active.lock().insert(session_id.to_string()) {
            return Err(WorkflowDispatchError::AlreadyRunning(session_id.to_string()));
        }
        Ok(ActiveClaim {
            active: Arc::clone(&self.active),
            session_id: session_id.to_string(),
        })
    }

    /// Validate `trigger` and claim its session.
    pub fn prepare(&self, trigger: &WorkflowTrigger) -> Result<PreparedRun, WorkflowDispatchError> {
        let kind = WorkflowKind::for_event(&trigger.event)
            .ok_or_else(|| WorkflowDispatchError::UnknownEvent(trigger.event.clone()))?;
        if self.registry.lookup(&trigger.session_id).is_none() {
            return Err(WorkflowDispatchError::UnknownSession(
                trigger.session_id.clone(),
            ));
        }

        let data = trigger.data.as_ref();
        let invalid = |e: WorkflowError| WorkflowDispatchError::InvalidData(e.to_string());
        let context = match kind {
            WorkflowKind::CredentialRotation => PreparedContext::Credential(
                self.credential
                    .prepare(&trigger.session_id, data)
                    .map_err(invalid)?,
            ),
            WorkflowKind::Maintenance => PreparedContext::Maintenance(
                MaintenanceContext::from_trigger(&trigger.session_id, &trigger.event, data)
                    .map_err(invalid)?,
            ),
        };

        let claim = self.claim(&trigger.session_id)?;
        Ok(PreparedRun {
            kind,
            event: trigger.event.clone(),
            context,
            claim,
        })
    }

    /// Drive a prepared run to its terminal state.
    pub async fn run_prepared(
        &self,
        prepared: PreparedRun,
    ) -> Result<WorkflowSummary, WorkflowDispatchError> {
        let PreparedRun {
            kind,
            event,
            context,
            claim,
        } = prepared;

        let summary = match context {
            PreparedContext::Credential(ctx) => {
                let run = self.credential.run(ctx, &event).await?;
                WorkflowSummary::from_run(kind, &event, &run)
            }
            PreparedContext::Maintenance(ctx) => {
                let run = self.maintenance.run(ctx, &event).await?;
                WorkflowSummary::from_run(kind, &event, &run)
            }
        };
        drop(claim);
        Ok(summary)
    }

    /// Validate and run `trigger` to completion.
    pub async fn execute(
        &self,
        trigger: WorkflowTrigger,
    ) -> Result<WorkflowSummary, WorkflowDispatchError> {
        let prepared = self.prepare(&trigger)?;
        self.run_prepared(prepared).await
    }

    /// Validate `trigger` now and run it in the background.
    pub fn spawn(
        self: &Arc<Self>,
        trigger: WorkflowTrigger,
    ) -> Result<WorkflowKind, WorkflowDispatchError> {
        let prepared = self.prepare(&trigger)?;
        let kind = prepared.kind();
        info!(
            "session {}: {kind} accepted ({})",
            trigger.session_id, trigger.event
        );

        let dispatcher = Arc::clone(self);
        tokio::spawn(async move {
            match dispatcher.run_prepared(prepared).await {
                Ok(summary) => info!(
                    "session {}: {} ended {}",
                    summary.session_id, summary.workflow, summary.outcome
                ),
                Err(e) => warn!("session {}: workflow aborted: {e}", trigger.session_id),
            }
        });
        Ok(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_map_to_workflows() {
        assert_eq!(
            WorkflowKind::for_event("CHANGE_CREDENTIAL"),
            Some(WorkflowKind::CredentialRotation)
        );
        assert_eq!(
            WorkflowKind::for_event("CHANGEPASSWORD"),
            Some(WorkflowKind::CredentialRotation)
        );
        assert_eq!(
            WorkflowKind::for_event("SYNCHOSTNAME"),
            Some(WorkflowKind::Maintenance)
        );
        assert_eq!(WorkflowKind::for_event("ACTIVATE"), None);
    }

    #[test]
    fn trigger_uses_type_and_camel_case() {
        let trigger: WorkflowTrigger = serde_json::from_value(serde_json::json!({
            "type": "SYNCTIME",
            "sessionId": "abc"
        }))
        .unwrap();
        assert_eq!(trigger.event, "SYNCTIME");
        assert_eq!(trigger.session_id, "abc");
        assert!(trigger.data.is_none());
    }

    #[test]
    fn claim_is_exclusive_and_released_on_drop() {
        let active = Arc::new(Mutex::new(HashSet::new()));
        active.lock().insert("s1".to_string());
        let claim = ActiveClaim {
            active: Arc::clone(&active),
            session_id: "s1".into(),
        };
        drop(claim);
        assert!(active.lock().is_empty());
    }
}

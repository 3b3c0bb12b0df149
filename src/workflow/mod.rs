//! Device workflows: table-driven state machines run by one engine.
//!
//! Each workflow is a [`engine::WorkflowDefinition`] plus a services type that
//! implements [`engine::WorkflowServices`] for its context. The engine walks
//! the table; services do the device and secret-store work; terminal states
//! funnel through [`terminal::TerminalActions`].

pub mod credential;
pub mod dispatch;
pub mod engine;
pub mod maintenance;
pub mod terminal;

pub use credential::{CredentialContext, CredentialRequest, CredentialRotation};
pub use dispatch::{
    WorkflowDispatchError, WorkflowDispatcher, WorkflowKind, WorkflowSummary, WorkflowTrigger,
};
pub use engine::{
    Outcome, StateNode, WorkflowDefinition, WorkflowEngine, WorkflowRun, WorkflowServices, FAILED,
    SUCCESS,
};
pub use maintenance::{HostnameInfo, IpConfiguration, Maintenance, MaintenanceContext};
pub use terminal::{send_message_to_device, update_configuration_status, TerminalActions};

use serde::{Deserialize, Serialize};

use crate::correlator::CorrelatorError;
use crate::envelope::DeviceResponse;
use crate::security::SecretStoreError;

/// `GetGeneralSettings` replies are large enough to arrive fragmented.
pub(crate) const GENERAL_SETTINGS_RETRIES: u32 = 2;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportStatus {
    #[default]
    Success,
    Error,
}

/// A method reply counts as accepted only when it reports `ReturnValue` 0.
pub(crate) fn check_return_value(response: &DeviceResponse) -> Result<(), WorkflowError> {
    match response.return_value() {
        Some(0) => Ok(()),
        Some(rv) => Err(WorkflowError::UnexpectedResponse(format!(
            "device returned ReturnValue {rv}"
        ))),
        None => Err(WorkflowError::UnexpectedResponse("missing ReturnValue".into())),
    }
}

/// Outcome fields every workflow context carries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    pub status: ReportStatus,
    pub status_message: String,
    pub error_message: String,
}

impl StatusReport {
    pub fn succeed(&mut self, message: impl Into<String>) {
        self.status = ReportStatus::Success;
        self.status_message = message.into();
    }

    pub fn fail(&mut self, message: impl Into<String>) {
        self.status = ReportStatus::Error;
        self.error_message = message.into();
    }

    pub fn is_error(&self) -> bool {
        self.status == ReportStatus::Error
    }

    /// The message a terminal projection should show for this status.
    pub fn terminal_message(&self) -> &str {
        match self.status {
            ReportStatus::Success => &self.status_message,
            ReportStatus::Error => &self.error_message,
        }
    }
}

/// Per-run state handed to services.
pub trait WorkflowContext: Send + Sync {
    fn session_id(&self) -> &str;

    fn report(&self) -> &StatusReport;

    fn report_mut(&mut self) -> &mut StatusReport;
}

#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error(transparent)]
    Correlator(#[from] CorrelatorError),

    #[error(transparent)]
    Store(#[from] SecretStoreError),

    #[error("{0}")]
    Validation(String),

    #[error("unexpected device response: {0}")]
    UnexpectedResponse(String),

    #[error("unknown workflow service `{0}`")]
    UnknownService(String),

    #[error("event `{event}` is not accepted in state {state}")]
    InvalidEvent { event: String, state: String },

    #[error("invalid workflow definition: {0}")]
    Definition(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_message_follows_status() {
        let mut report = StatusReport::default();
        report.succeed("Time Synchronized");
        assert_eq!(report.terminal_message(), "Time Synchronized");

        report.fail("Failed to sync time");
        assert!(report.is_error());
        assert_eq!(report.terminal_message(), "Failed to sync time");
        assert_eq!(report.status_message, "Time Synchronized");
    }

    #[test]
    fn only_a_zero_return_value_is_accepted() {
        use serde_json::json;

        assert!(check_return_value(&DeviceResponse::ok(json!({"ReturnValue": 0}))).is_ok());
        assert!(check_return_value(&DeviceResponse::ok(json!({"ReturnValue": 2}))).is_err());
        let err = check_return_value(&DeviceResponse::ok(json!({}))).unwrap_err();
        assert!(err.to_string().contains("missing ReturnValue"));
        assert!(check_return_value(&DeviceResponse::ok(json!({"ReturnValue": "0"}))).is_err());
    }

    #[test]
    fn report_status_serializes_lowercase() {
        let json = serde_json::to_value(ReportStatus::Error).unwrap();
        assert_eq!(json, "error");
    }
}

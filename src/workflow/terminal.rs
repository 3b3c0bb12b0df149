//! Entry actions shared by every workflow's SUCCESS and FAILED states.

use std::sync::Arc;

use tracing::{debug, warn};

use super::engine::Outcome;
use super::{StatusReport, WorkflowContext};
use crate::device::DeviceRegistry;
use crate::envelope::{ClientMethod, ClientResponse, EnvelopeCodec};
use crate::observability::{EventLevel, EventPublisher, TelemetryEvent};

/// Project the report onto the device status: the status message on
/// success, the error message on failure.
///
/// Returns `false` when the device is no longer registered.
pub fn update_configuration_status(
    registry: &DeviceRegistry,
    workflow: &str,
    session_id: &str,
    report: &StatusReport,
) -> bool {
    match registry.lookup(session_id) {
        Some(connection) => {
            connection.set_status(workflow, report.terminal_message());
            true
        }
        None => {
            debug!("session {session_id}: gone before status update");
            false
        }
    }
}

/// Push the terminal notification to the device. Failures are logged only.
pub async fn send_message_to_device(
    registry: &DeviceRegistry,
    codec: &dyn EnvelopeCodec,
    session_id: &str,
    report: &StatusReport,
) -> bool {
    let Some(connection) = registry.lookup(session_id) else {
        warn!("session {session_id}: device gone, terminal message not sent");
        return false;
    };

    let response = ClientResponse {
        method: if report.is_error() {
            ClientMethod::Error
        } else {
            ClientMethod::Success
        },
        message: report.terminal_message().to_string(),
    };
    let frame = match codec.encode_client_response(&response) {
        Ok(frame) => frame,
        Err(e) => {
            warn!("session {session_id}: failed to encode terminal message: {e}");
            return false;
        }
    };

    match connection.transport().send(frame).await {
        Ok(()) => true,
        Err(e) => {
            warn!("session {session_id}: failed to send terminal message: {e}");
            false
        }
    }
}

/// Bundles the collaborators the terminal actions need.
pub struct TerminalActions {
    registry: Arc<DeviceRegistry>,
    codec: Arc<dyn EnvelopeCodec>,
    events: Arc<dyn EventPublisher>,
}

impl TerminalActions {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        codec: Arc<dyn EnvelopeCodec>,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            registry,
            codec,
            events,
        }
    }

    /// Status projection, device notification and telemetry, in that order.
    pub async fn finish<C: WorkflowContext>(
        &self,
        workflow: &str,
        state: &str,
        outcome: Outcome,
        ctx: &C,
    ) {
        let session_id = ctx.session_id().to_string();
        let report = ctx.report().clone();

        update_configuration_status(&self.registry, workflow, &session_id, &report);
        send_message_to_device(&self.registry, self.codec.as_ref(), &session_id, &report).await;

        let level = match outcome {
            Outcome::Success => EventLevel::Info,
            Outcome::Failed => EventLevel::Error,
        };
        self.events.publish(
            TelemetryEvent::new(
                level,
                vec![workflow.to_string(), state.to_string()],
                report.terminal_message(),
            )
            .with_session(session_id),
        );
    }
}

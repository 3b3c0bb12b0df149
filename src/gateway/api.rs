//! REST handlers for workflow triggers and device status.

use super::AppState;
use crate::envelope::PROTOCOL_VERSION;
use crate::workflow::{WorkflowDispatchError, WorkflowTrigger};
use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};

fn error_response(status: StatusCode, message: impl Into<String>) -> axum::response::Response {
    (
        status,
        Json(serde_json::json!({ "error": message.into() })),
    )
        .into_response()
}

fn dispatch_status(err: &WorkflowDispatchError) -> StatusCode {
    match err {
        WorkflowDispatchError::UnknownSession(_) => StatusCode::NOT_FOUND,
        WorkflowDispatchError::AlreadyRunning(_) => StatusCode::CONFLICT,
        WorkflowDispatchError::UnknownEvent(_) | WorkflowDispatchError::InvalidData(_) => {
            StatusCode::BAD_REQUEST
        }
        WorkflowDispatchError::Workflow(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

// ── Handlers ────────────────────────────────────────────────────

/// POST /api/v1/workflows: start a workflow in the background
pub async fn handle_api_workflow_trigger(
    State(state): State<AppState>,
    body: Result<Json<WorkflowTrigger>, JsonRejection>,
) -> impl IntoResponse {
    let Json(trigger) = match body {
        Ok(body) => body,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e.body_text()),
    };
    let session_id = trigger.session_id.clone();
    let event = trigger.event.clone();

    match state.dispatcher.spawn(trigger) {
        Ok(kind) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({
                "workflow": kind,
                "sessionId": session_id,
                "event": event,
            })),
        )
            .into_response(),
        Err(e) => {
            tracing::debug!("trigger {event} for session {session_id} refused: {e}");
            error_response(dispatch_status(&e), e.to_string())
        }
    }
}

/// GET /api/v1/devices: every connected device
pub async fn handle_api_devices(State(state): State<AppState>) -> impl IntoResponse {
    let devices = state.registry.snapshots();
    Json(serde_json::json!({
        "devices": devices,
        "activeWorkflows": state.dispatcher.active_sessions(),
    }))
}

/// GET /api/v1/devices/{session_id}: one device's status projection
pub async fn handle_api_device(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> impl IntoResponse {
    match state.registry.lookup(&session_id) {
        Some(connection) => Json(serde_json::json!({
            "device": connection.snapshot(),
            "workflowActive": state.dispatcher.is_active(&session_id),
        }))
        .into_response(),
        None => error_response(
            StatusCode::NOT_FOUND,
            format!("no connected device for session {session_id}"),
        ),
    }
}

/// GET /api/v1/version
pub async fn handle_api_version() -> impl IntoResponse {
    Json(serde_json::json!({
        "serviceVersion": env!("CARGO_PKG_VERSION"),
        "protocolVersion": PROTOCOL_VERSION,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::ChannelTransport;
    use crate::gateway::tests::test_state;
    use http_body_util::BodyExt;
    use std::sync::Arc;

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let body = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    fn trigger(event: &str, session_id: &str) -> Result<Json<WorkflowTrigger>, JsonRejection> {
        Ok(Json(WorkflowTrigger {
            event: event.into(),
            session_id: session_id.into(),
            data: None,
        }))
    }

    #[tokio::test]
    async fn version_reports_service_and_protocol() {
        let json = body_json(handle_api_version().await.into_response()).await;
        assert_eq!(json["serviceVersion"], env!("CARGO_PKG_VERSION"));
        assert_eq!(json["protocolVersion"], "4.0.0");
    }

    #[tokio::test]
    async fn trigger_for_unknown_session_is_404() {
        let state = test_state();
        let response = handle_api_workflow_trigger(State(state), trigger("SYNCTIME", "nobody"))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unknown_event_is_400() {
        let state = test_state();
        let response = handle_api_workflow_trigger(State(state), trigger("ACTIVATE", "s1"))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = body_json(response).await;
        assert!(json["error"].as_str().unwrap().contains("ACTIVATE"));
    }

    #[tokio::test]
    async fn second_trigger_while_running_is_409() {
        let state = test_state();
        let (transport, _rx) = ChannelTransport::new();
        state.registry.register("s1", Arc::new(transport), None);

        let first = handle_api_workflow_trigger(State(state.clone()), trigger("SYNCTIME", "s1"))
            .await
            .into_response();
        assert_eq!(first.status(), StatusCode::ACCEPTED);
        let json = body_json(first).await;
        assert_eq!(json["workflow"], "maintenance");
        assert!(state.dispatcher.is_active("s1"));

        // The device never answers, so the first run is still waiting.
        let second = handle_api_workflow_trigger(State(state), trigger("SYNCIP", "s1"))
            .await
            .into_response();
        assert_eq!(second.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn sync_ip_without_data_is_accepted() {
        let state = test_state();
        let (transport, _rx) = ChannelTransport::new();
        state.registry.register("s1", Arc::new(transport), None);

        let response = handle_api_workflow_trigger(State(state), trigger("SYNCIP", "s1"))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn blank_host_name_is_400() {
        let state = test_state();
        let (transport, _rx) = ChannelTransport::new();
        state.registry.register("s1", Arc::new(transport), None);

        let body = Ok(Json(WorkflowTrigger {
            event: "SYNCHOSTNAME".into(),
            session_id: "s1".into(),
            data: Some(serde_json::json!({"hostName": " "})),
        }));
        let response = handle_api_workflow_trigger(State(state.clone()), body)
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(!state.dispatcher.is_active("s1"));
    }

    #[tokio::test]
    async fn device_endpoints_project_registry() {
        let state = test_state();
        let (transport, _rx) = ChannelTransport::new();
        let connection =
            state
                .registry
                .register("s1", Arc::new(transport), Some("guid-1".into()));
        connection.set_status("maintenance", "Time Synchronized");

        let json = body_json(
            handle_api_devices(State(state.clone()))
                .await
                .into_response(),
        )
        .await;
        assert_eq!(json["devices"].as_array().unwrap().len(), 1);

        let one = handle_api_device(State(state.clone()), Path("s1".to_string()))
            .await
            .into_response();
        assert_eq!(one.status(), StatusCode::OK);
        let json = body_json(one).await;
        assert_eq!(json["workflowActive"], false);
        let rendered = json["device"].to_string();
        assert!(rendered.contains("Time Synchronized"));
        assert!(rendered.contains("guid-1"));

        let missing = handle_api_device(State(state), Path("nope".to_string()))
            .await
            .into_response();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }
}

//! Axum-based gateway: device and assistant WebSockets plus the
//! administrative trigger/status API.
//!
//! - Request body size limits (`[gateway] max_body_bytes`, 64KB default)
//! - Request timeouts (`[gateway] request_timeout_secs`, 30s default)
//! - Device frames go straight into the correlator; nothing else reads them

pub mod api;
pub mod ws;

use crate::config::Config;
use crate::correlator::{AssistantChannel, DeviceInvoker};
use crate::device::DeviceRegistry;
use crate::envelope::{EnvelopeCodec, RpcFrameCodec};
use crate::observability::{self, EventPublisher};
use crate::security::SecretProviderFactory;
use crate::workflow::{CredentialRotation, Maintenance, TerminalActions, WorkflowDispatcher};
use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;

/// Shared state for all axum handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<DeviceRegistry>,
    pub invoker: Arc<DeviceInvoker>,
    pub assistant: Arc<AssistantChannel>,
    pub dispatcher: Arc<WorkflowDispatcher>,
    pub events: Arc<dyn EventPublisher>,
}

impl AppState {
    /// Wire every component from `config`.
    ///
    /// Must run inside a Tokio runtime when the mqtt telemetry backend is
    /// selected.
    pub fn from_config(config: &Config) -> Result<Self> {
        let events = observability::create_event_publisher(&config.observability)
            .context("failed to initialize telemetry publisher")?;
        let secrets = SecretProviderFactory::new(config)
            .provider()
            .context("failed to initialize secret provider")?;

        let registry = Arc::new(DeviceRegistry::new());
        let codec: Arc<dyn EnvelopeCodec> = Arc::new(RpcFrameCodec::new());
        let invoker = Arc::new(DeviceInvoker::from_config(
            Arc::clone(&registry),
            Arc::clone(&codec),
            &config.correlator,
        ));
        let terminal = Arc::new(TerminalActions::new(
            Arc::clone(&registry),
            codec,
            Arc::clone(&events),
        ));
        let credential = Arc::new(CredentialRotation::new(
            Arc::clone(&invoker),
            secrets,
            Arc::clone(&terminal),
            config.credentials.clone(),
        ));
        let maintenance = Arc::new(Maintenance::new(Arc::clone(&invoker), terminal));
        let dispatcher = Arc::new(WorkflowDispatcher::new(
            Arc::clone(&registry),
            credential,
            maintenance,
        ));

        Ok(Self {
            config: Arc::new(config.clone()),
            registry,
            invoker,
            assistant: Arc::new(AssistantChannel::from_config(&config.assistant)),
            dispatcher,
            events,
        })
    }
}

/// Build the router with body-limit and timeout middleware.
pub fn build_router(state: AppState) -> Router {
    let max_body = state.config.gateway.max_body_bytes;
    let request_timeout = Duration::from_secs(state.config.gateway.request_timeout_secs);

    // Upgraded sockets outlive the request timeout, so they sit outside it.
    let sockets = Router::new()
        .route("/ws/device", get(ws::handle_ws_device))
        .route("/ws/assistant", get(ws::handle_ws_assistant));

    let admin = Router::new()
        .route("/health", get(handle_health))
        .route("/api/v1/version", get(api::handle_api_version))
        .route("/api/v1/devices", get(api::handle_api_devices))
        .route("/api/v1/devices/{session_id}", get(api::handle_api_device))
        .route("/api/v1/workflows", post(api::handle_api_workflow_trigger))
        .layer(RequestBodyLimitLayer::new(max_body))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            request_timeout,
        ));

    admin.merge(sockets).with_state(state)
}

/// Run the gateway until the listener fails or Ctrl-C is received.
pub async fn run_gateway(host: &str, port: u16, config: Config) -> Result<()> {
    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .with_context(|| format!("invalid gateway address {host}:{port}"))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    let actual_port = listener.local_addr()?.port();

    let state = AppState::from_config(&config)?;
    let app = build_router(state);

    tracing::info!("oobprov gateway listening on http://{host}:{actual_port}");
    tracing::info!("  GET  /ws/device?guid=<guid>  device socket");
    tracing::info!("  GET  /ws/assistant           assistant socket");
    tracing::info!("  POST /api/v1/workflows       trigger a workflow");

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown requested");
        })
        .await?;

    Ok(())
}

/// GET /health, always public
async fn handle_health(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "devices": state.registry.len(),
        "assistantConnected": state.assistant.is_attached(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    pub(crate) fn test_state() -> AppState {
        let mut config = Config::default();
        config.secrets.provider = "memory".into();
        config.observability.backend = "none".into();
        AppState::from_config(&config).unwrap()
    }

    #[test]
    fn app_state_is_clone() {
        fn assert_clone<T: Clone>() {}
        assert_clone::<AppState>();
    }

    #[test]
    fn default_limits_match_config() {
        let state = test_state();
        assert_eq!(state.config.gateway.max_body_bytes, 65_536);
        assert_eq!(state.config.gateway.request_timeout_secs, 30);
    }

    #[test]
    fn unknown_secret_provider_fails_startup() {
        let mut config = Config::default();
        config.secrets.provider = "keyring".into();
        let err = AppState::from_config(&config).err().unwrap();
        assert!(err.to_string().contains("secret provider"));
    }

    #[tokio::test]
    async fn health_reports_device_count() {
        let state = test_state();
        let (transport, _rx) = crate::device::ChannelTransport::new();
        state.registry.register("s1", Arc::new(transport), None);

        let response = handle_health(State(state)).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["devices"], 1);
        assert_eq!(json["assistantConnected"], false);
    }

    #[test]
    fn router_builds() {
        let _router: Router = build_router(test_state());
    }
}

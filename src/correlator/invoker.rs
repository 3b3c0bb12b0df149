use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use super::CorrelatorError;
use crate::config::CorrelatorConfig;
use crate::device::{DeviceConnection, DeviceRegistry};
use crate::envelope::{DeviceRequest, DeviceResponse, EncodeContext, EnvelopeCodec, Inbound};

/// Turns the device socket into awaitable request/response calls.
pub struct DeviceInvoker {
    registry: Arc<DeviceRegistry>,
    codec: Arc<dyn EnvelopeCodec>,
    timeout: Duration,
}

impl DeviceInvoker {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        codec: Arc<dyn EnvelopeCodec>,
        timeout: Duration,
    ) -> Self {
        Self {
            registry,
            codec,
            timeout,
        }
    }

    pub fn from_config(
        registry: Arc<DeviceRegistry>,
        codec: Arc<dyn EnvelopeCodec>,
        config: &CorrelatorConfig,
    ) -> Self {
        Self::new(registry, codec, Duration::from_secs(config.timeout_secs))
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    pub fn codec(&self) -> &Arc<dyn EnvelopeCodec> {
        &self.codec
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Send `request` and wait for its reply, with no retry.
    pub async fn invoke_once(
        &self,
        session_id: &str,
        request: &DeviceRequest,
    ) -> Result<DeviceResponse, CorrelatorError> {
        self.invoke(session_id, request, 0).await
    }

    /// Send `request` and wait for its reply.
    ///
    /// A reply that fails to parse is retried with a fresh transmission while
    /// fewer than `max_retries` retries have been made. Every other failure is
    /// returned as-is on the first occurrence.
    pub async fn invoke(
        &self,
        session_id: &str,
        request: &DeviceRequest,
        max_retries: u32,
    ) -> Result<DeviceResponse, CorrelatorError> {
        let mut retries = 0;
        loop {
            match self.exchange(session_id, request).await {
                Err(err) if err.is_retryable() && retries < max_retries => {
                    retries += 1;
                    warn!(
                        "session {session_id}: {request} reply could not be parsed, retry {retries}/{max_retries}"
                    );
                }
                result => return result,
            }
        }
    }

    /// One transmission and one wait.
    async fn exchange(
        &self,
        session_id: &str,
        request: &DeviceRequest,
    ) -> Result<DeviceResponse, CorrelatorError> {
        let connection = self
            .registry
            .lookup(session_id)
            .ok_or_else(|| CorrelatorError::UnknownSession(session_id.to_string()))?;

        let codec = &self.codec;
        let (frame, message_id, receiver) = connection.begin_exchange(|message_id, challenge| {
            codec.encode(
                request,
                &EncodeContext {
                    message_id,
                    digest_challenge: challenge,
                },
            )
        })?;

        debug!("session {session_id}: sending {request} (message {message_id})");
        if let Err(e) = connection.transport().send(frame).await {
            connection.clear_slot(message_id);
            return Err(CorrelatorError::Transport(e.to_string()));
        }

        match tokio::time::timeout(self.timeout, receiver).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(CorrelatorError::Disconnected),
            Err(_) => {
                connection.clear_slot(message_id);
                warn!(
                    "session {session_id}: {request} (message {message_id}) timed out after {:?}",
                    self.timeout
                );
                Err(CorrelatorError::Timeout(self.timeout))
            }
        }
    }

    /// Feed one inbound device frame into the correlation layer.
    ///
    /// Returns whether a waiting request was resolved.
    pub fn handle_frame(&self, connection: &DeviceConnection, raw: &[u8]) -> bool {
        let result = match self.codec.decode(raw) {
            Ok(Inbound::Response(response)) => Ok(response),
            Ok(Inbound::Fault {
                status_code,
                message,
                challenge,
            }) => {
                if status_code == 401 {
                    let attempts = connection.record_unauthorized(challenge);
                    warn!(
                        "session {}: unauthorized reply ({attempts} so far)",
                        connection.session_id()
                    );
                }
                Err(CorrelatorError::ProtocolFault {
                    status_code,
                    message,
                })
            }
            Ok(Inbound::Failure(reason)) => Err(CorrelatorError::Transport(reason)),
            Ok(Inbound::Heartbeat) => {
                debug!("session {}: heartbeat", connection.session_id());
                return false;
            }
            Err(err) => Err(err),
        };
        connection.fulfil(result)
    }

    /// Same as [`Self::handle_frame`], resolving the connection by session id.
    pub fn handle_session_frame(&self, session_id: &str, raw: &[u8]) -> bool {
        match self.registry.lookup(session_id) {
            Some(connection) => self.handle_frame(&connection, raw),
            None => {
                debug!("session {session_id}: frame for unknown session dropped");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::ChannelTransport;
    use crate::envelope::{reply_frame, RpcFrame, RpcFrameCodec};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc::UnboundedReceiver;

    const TRUNCATED: &[u8] = br#"{"method":"response","status":"ok","mess"#;

    fn setup(timeout: Duration) -> (Arc<DeviceInvoker>, UnboundedReceiver<Vec<u8>>) {
        let registry = Arc::new(DeviceRegistry::new());
        let (transport, rx) = ChannelTransport::new();
        registry.register("s1", Arc::new(transport), Some("guid-1".into()));
        let invoker = Arc::new(DeviceInvoker::new(
            registry,
            Arc::new(RpcFrameCodec::new()),
            timeout,
        ));
        (invoker, rx)
    }

    /// Answer each transmission with the next scripted reply.
    fn scripted_device(
        invoker: &Arc<DeviceInvoker>,
        mut rx: UnboundedReceiver<Vec<u8>>,
        replies: Vec<Vec<u8>>,
    ) -> (Arc<AtomicUsize>, Arc<parking_lot::Mutex<Vec<u64>>>) {
        let sends = Arc::new(AtomicUsize::new(0));
        let ids = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let invoker = Arc::clone(invoker);
        let counter = Arc::clone(&sends);
        let seen = Arc::clone(&ids);
        tokio::spawn(async move {
            let mut replies = replies.into_iter();
            while let Some(frame) = rx.recv().await {
                let frame: RpcFrame = serde_json::from_slice(&frame).unwrap();
                seen.lock().push(frame.message_id.unwrap_or_default());
                counter.fetch_add(1, Ordering::SeqCst);
                if let Some(reply) = replies.next() {
                    invoker.handle_session_frame("s1", &reply);
                }
            }
        });
        (sends, ids)
    }

    fn ok_reply() -> Vec<u8> {
        reply_frame(200, "OK", serde_json::json!({"DigestRealm": "Digest:1234"}))
    }

    #[tokio::test]
    async fn resolves_without_retry() {
        let (invoker, rx) = setup(Duration::from_secs(5));
        let (sends, _) = scripted_device(&invoker, rx, vec![ok_reply()]);

        let response = invoker
            .invoke_once("s1", &DeviceRequest::GetGeneralSettings)
            .await
            .unwrap();
        assert_eq!(response.body["DigestRealm"], "Digest:1234");
        assert_eq!(sends.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn default_invoke_does_not_retry_parse_errors() {
        let (invoker, rx) = setup(Duration::from_secs(5));
        let (sends, _) = scripted_device(&invoker, rx, vec![TRUNCATED.to_vec(), ok_reply()]);

        let result = invoker
            .invoke_once("s1", &DeviceRequest::GetGeneralSettings)
            .await;
        assert_eq!(result, Err(CorrelatorError::UnexpectedParse));
        assert_eq!(sends.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn parse_error_then_success_resolves_after_two_sends() {
        let (invoker, rx) = setup(Duration::from_secs(5));
        let (sends, ids) = scripted_device(&invoker, rx, vec![TRUNCATED.to_vec(), ok_reply()]);

        let response = invoker
            .invoke("s1", &DeviceRequest::GetGeneralSettings, 2)
            .await
            .unwrap();
        assert_eq!(response.status_code, 200);
        assert_eq!(sends.load(Ordering::SeqCst), 2);
        assert_eq!(*ids.lock(), vec![1, 2]);
    }

    #[tokio::test]
    async fn retries_exhausted_after_three_sends() {
        let (invoker, rx) = setup(Duration::from_secs(5));
        let (sends, ids) = scripted_device(
            &invoker,
            rx,
            vec![TRUNCATED.to_vec(), TRUNCATED.to_vec(), TRUNCATED.to_vec()],
        );

        let result = invoker
            .invoke("s1", &DeviceRequest::GetGeneralSettings, 2)
            .await;
        assert_eq!(result, Err(CorrelatorError::UnexpectedParse));
        assert_eq!(sends.load(Ordering::SeqCst), 3);
        assert_eq!(*ids.lock(), vec![1, 2, 3]);
        assert_eq!(invoker.registry().lookup("s1").unwrap().message_id(), 3);
    }

    #[tokio::test]
    async fn unauthorized_fault_is_not_retried() {
        let (invoker, rx) = setup(Duration::from_secs(5));
        let (sends, _) = scripted_device(
            &invoker,
            rx,
            vec![reply_frame(401, "Unauthorized", serde_json::Value::Null), ok_reply()],
        );

        let result = invoker
            .invoke("s1", &DeviceRequest::GetGeneralSettings, 2)
            .await;
        assert_eq!(
            result,
            Err(CorrelatorError::ProtocolFault {
                status_code: 401,
                message: "Unauthorized".into(),
            })
        );
        assert_eq!(sends.load(Ordering::SeqCst), 1);
        assert_eq!(invoker.registry().lookup("s1").unwrap().unauth_count(), 1);
    }

    #[tokio::test]
    async fn fault_after_parse_error_ends_the_retry_loop() {
        let (invoker, rx) = setup(Duration::from_secs(5));
        let (sends, ids) = scripted_device(
            &invoker,
            rx,
            vec![
                TRUNCATED.to_vec(),
                reply_frame(401, "Unauthorized", serde_json::Value::Null),
                ok_reply(),
            ],
        );

        let result = invoker
            .invoke("s1", &DeviceRequest::GetGeneralSettings, 2)
            .await;
        assert_eq!(
            result,
            Err(CorrelatorError::ProtocolFault {
                status_code: 401,
                message: "Unauthorized".into(),
            })
        );
        assert_eq!(sends.load(Ordering::SeqCst), 2);
        assert_eq!(*ids.lock(), vec![1, 2]);
    }

    #[tokio::test]
    async fn unknown_session_fails_without_sending() {
        let (invoker, _rx) = setup(Duration::from_secs(5));
        let result = invoker
            .invoke_once("missing", &DeviceRequest::GetGeneralSettings)
            .await;
        assert_eq!(
            result,
            Err(CorrelatorError::UnknownSession("missing".into()))
        );
    }

    #[tokio::test]
    async fn second_invoke_is_busy_and_first_keeps_its_response() {
        let (invoker, mut rx) = setup(Duration::from_secs(5));

        let first = {
            let invoker = Arc::clone(&invoker);
            tokio::spawn(async move {
                let request = DeviceRequest::GetGeneralSettings;
                invoker.invoke_once("s1", &request).await
            })
        };
        rx.recv().await.unwrap();

        let second = invoker
            .invoke_once("s1", &DeviceRequest::GetEthernetPortSettings)
            .await;
        assert_eq!(second, Err(CorrelatorError::Busy("s1".into())));
        assert!(rx.try_recv().is_err());

        assert!(invoker.handle_session_frame("s1", &ok_reply()));
        let response = first.await.unwrap().unwrap();
        assert_eq!(response.body["DigestRealm"], "Digest:1234");
    }

    #[tokio::test]
    async fn timeout_clears_the_slot() {
        let (invoker, mut rx) = setup(Duration::from_millis(50));

        let result = invoker
            .invoke("s1", &DeviceRequest::GetGeneralSettings, 2)
            .await;
        assert_eq!(
            result,
            Err(CorrelatorError::Timeout(Duration::from_millis(50)))
        );
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());

        let connection = invoker.registry().lookup("s1").unwrap();
        assert!(!connection.has_request_in_flight());
        assert!(!invoker.handle_frame(&connection, &ok_reply()));
    }

    #[tokio::test]
    async fn disconnect_rejects_pending_request() {
        let (invoker, mut rx) = setup(Duration::from_secs(5));

        let pending = {
            let invoker = Arc::clone(&invoker);
            tokio::spawn(async move {
                let request = DeviceRequest::GetGeneralSettings;
                invoker.invoke("s1", &request, 2).await
            })
        };
        rx.recv().await.unwrap();

        invoker.registry().remove("s1");
        assert_eq!(
            pending.await.unwrap(),
            Err(CorrelatorError::Disconnected)
        );
    }

    #[tokio::test]
    async fn agent_failure_maps_to_transport_error() {
        use base64::Engine as _;

        let (invoker, rx) = setup(Duration::from_secs(5));
        let failure = serde_json::json!({
            "method": "response",
            "status": "failed",
            "message": base64::engine::general_purpose::STANDARD.encode("engine unreachable"),
        })
        .to_string()
        .into_bytes();
        let (sends, _) = scripted_device(&invoker, rx, vec![failure]);

        let result = invoker
            .invoke("s1", &DeviceRequest::GetGeneralSettings, 2)
            .await;
        assert_eq!(
            result,
            Err(CorrelatorError::Transport("engine unreachable".into()))
        );
        assert_eq!(sends.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn heartbeat_does_not_resolve_slot() {
        let (invoker, mut rx) = setup(Duration::from_secs(5));
        let pending = {
            let invoker = Arc::clone(&invoker);
            tokio::spawn(async move {
                let request = DeviceRequest::GetGeneralSettings;
                invoker.invoke_once("s1", &request).await
            })
        };
        rx.recv().await.unwrap();

        let heartbeat = br#"{"method":"heartbeat_response","status":"ok","message":""}"#;
        assert!(!invoker.handle_session_frame("s1", heartbeat));
        assert!(invoker.handle_session_frame("s1", &ok_reply()));
        assert!(pending.await.unwrap().is_ok());
    }
}

//! JSON frame codec used by the device gateway.
//!
//! Wire format (one WebSocket text frame per message):
//! ```text
//! Server -> Device: {"method":"wsman","status":"ok","messageId":7,"message":"<base64 request>"}
//! Device -> Server: {"method":"response","status":"ok","message":"<base64 reply>"}
//! Device -> Server: {"method":"heartbeat_response","status":"ok","message":""}
//! Server -> Device: {"method":"success","status":"ok","message":"<base64 {\"Status\":\"...\"}>"}
//! ```
//! The decoded reply is `{"status_code":200,"status_text":"OK","body":{...}}`.
//! Anything that fails to decode at any layer is reported as
//! `UnexpectedParse`, since partial frames are the common cause.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::types::{ClientResponse, DeviceRequest, DeviceResponse, Inbound};
use super::{EncodeContext, EnvelopeCodec};
use crate::correlator::CorrelatorError;
use crate::device::DigestChallenge;

/// Version of the device-facing frame protocol.
pub const PROTOCOL_VERSION: &str = "4.0.0";

const METHOD_REQUEST: &str = "wsman";
const METHOD_RESPONSE: &str = "response";
const METHOD_HEARTBEAT: &str = "heartbeat_response";
const STATUS_OK: &str = "ok";
const STATUS_FAILED: &str = "failed";

/// Outer frame exchanged with the device agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcFrame {
    pub method: String,
    #[serde(default)]
    pub protocol_version: String,
    #[serde(default)]
    pub app_version: String,
    pub status: String,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_realm: Option<String>,
}

/// Reply carried base64-encoded inside a `response` frame.
#[derive(Debug, Clone, Deserialize, Serialize)]
struct DeviceReply {
    status_code: u16,
    #[serde(default)]
    status_text: String,
    #[serde(default)]
    body: Value,
    #[serde(default)]
    www_authenticate: Option<DigestChallenge>,
}

/// Default [`EnvelopeCodec`]: JSON outer frame, base64 JSON body.
#[derive(Debug, Clone)]
pub struct RpcFrameCodec {
    app_version: String,
}

impl Default for RpcFrameCodec {
    fn default() -> Self {
        Self {
            app_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl RpcFrameCodec {
    pub fn new() -> Self {
        Self::default()
    }

    fn frame(&self, method: &str, status: &str, body: &[u8]) -> RpcFrame {
        RpcFrame {
            method: method.to_string(),
            protocol_version: PROTOCOL_VERSION.to_string(),
            app_version: self.app_version.clone(),
            status: status.to_string(),
            message: STANDARD.encode(body),
            message_id: None,
            auth_realm: None,
        }
    }
}

fn to_bytes(frame: &RpcFrame) -> Result<Vec<u8>, CorrelatorError> {
    serde_json::to_vec(frame).map_err(|e| CorrelatorError::Encode(e.to_string()))
}

impl EnvelopeCodec for RpcFrameCodec {
    fn encode(
        &self,
        request: &DeviceRequest,
        ctx: &EncodeContext<'_>,
    ) -> Result<Vec<u8>, CorrelatorError> {
        let body = serde_json::to_vec(request).map_err(|e| CorrelatorError::Encode(e.to_string()))?;
        let mut frame = self.frame(METHOD_REQUEST, STATUS_OK, &body);
        frame.message_id = Some(ctx.message_id);
        frame.auth_realm = ctx.digest_challenge.map(|c| c.realm.clone());
        to_bytes(&frame)
    }

    fn decode(&self, raw: &[u8]) -> Result<Inbound, CorrelatorError> {
        let frame: RpcFrame =
            serde_json::from_slice(raw).map_err(|_| CorrelatorError::UnexpectedParse)?;

        if frame.method == METHOD_HEARTBEAT {
            return Ok(Inbound::Heartbeat);
        }
        if frame.method != METHOD_RESPONSE {
            return Err(CorrelatorError::UnexpectedParse);
        }

        let payload = STANDARD
            .decode(frame.message.as_bytes())
            .map_err(|_| CorrelatorError::UnexpectedParse)?;

        if frame.status != STATUS_OK {
            let reason = String::from_utf8_lossy(&payload).trim().to_string();
            let reason = if reason.is_empty() {
                format!("device agent reported status `{}`", frame.status)
            } else {
                reason
            };
            return Ok(Inbound::Failure(reason));
        }

        let reply: DeviceReply =
            serde_json::from_slice(&payload).map_err(|_| CorrelatorError::UnexpectedParse)?;

        if reply.status_code == 200 {
            Ok(Inbound::Response(DeviceResponse {
                status_code: reply.status_code,
                body: reply.body,
            }))
        } else {
            Ok(Inbound::Fault {
                status_code: reply.status_code,
                message: reply.status_text,
                challenge: reply.www_authenticate,
            })
        }
    }

    fn encode_client_response(&self, response: &ClientResponse) -> Result<Vec<u8>, CorrelatorError> {
        let body = serde_json::json!({ "Status": response.message });
        let status = match response.method {
            super::ClientMethod::Success => STATUS_OK,
            super::ClientMethod::Error => STATUS_FAILED,
        };
        let body = serde_json::to_vec(&body).map_err(|e| CorrelatorError::Encode(e.to_string()))?;
        to_bytes(&self.frame(&response.method.to_string(), status, &body))
    }
}

/// Build the frame a device agent sends back for a reply. Used by the
/// gateway tests and by device simulators.
pub fn reply_frame(status_code: u16, status_text: &str, body: Value) -> Vec<u8> {
    let reply = serde_json::json!({
        "status_code": status_code,
        "status_text": status_text,
        "body": body,
    });
    let frame = serde_json::json!({
        "method": METHOD_RESPONSE,
        "status": STATUS_OK,
        "message": STANDARD.encode(reply.to_string()),
    });
    frame.to_string().into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::ClientMethod;

    fn ctx(message_id: u64) -> EncodeContext<'static> {
        EncodeContext {
            message_id,
            digest_challenge: None,
        }
    }

    fn decode_request(raw: &[u8]) -> (RpcFrame, DeviceRequest) {
        let frame: RpcFrame = serde_json::from_slice(raw).unwrap();
        let body = STANDARD.decode(frame.message.as_bytes()).unwrap();
        (frame, serde_json::from_slice(&body).unwrap())
    }

    #[test]
    fn encode_carries_message_id_and_operation() {
        let codec = RpcFrameCodec::new();
        let raw = codec
            .encode(&DeviceRequest::GetGeneralSettings, &ctx(7))
            .unwrap();
        let (frame, request) = decode_request(&raw);
        assert_eq!(frame.method, "wsman");
        assert_eq!(frame.message_id, Some(7));
        assert_eq!(frame.protocol_version, PROTOCOL_VERSION);
        assert_eq!(request, DeviceRequest::GetGeneralSettings);
    }

    #[test]
    fn encode_forwards_digest_realm() {
        let codec = RpcFrameCodec::new();
        let challenge = DigestChallenge {
            realm: "Digest:ABC".into(),
            nonce: "n1".into(),
            qop: "auth".into(),
        };
        let raw = codec
            .encode(
                &DeviceRequest::GetEthernetPortSettings,
                &EncodeContext {
                    message_id: 1,
                    digest_challenge: Some(&challenge),
                },
            )
            .unwrap();
        let (frame, _) = decode_request(&raw);
        assert_eq!(frame.auth_realm.as_deref(), Some("Digest:ABC"));
    }

    #[test]
    fn decode_success_reply() {
        let codec = RpcFrameCodec::new();
        let raw = reply_frame(200, "OK", serde_json::json!({"DigestRealm": "Digest:1"}));
        match codec.decode(&raw).unwrap() {
            Inbound::Response(resp) => {
                assert_eq!(resp.status_code, 200);
                assert_eq!(resp.body["DigestRealm"], "Digest:1");
            }
            other => panic!("unexpected inbound: {other:?}"),
        }
    }

    #[test]
    fn decode_unauthorized_reply_is_fault_with_challenge() {
        let codec = RpcFrameCodec::new();
        let reply = serde_json::json!({
            "status_code": 401,
            "status_text": "Unauthorized",
            "www_authenticate": {"realm": "Digest:R", "nonce": "abc", "qop": "auth"}
        });
        let frame = serde_json::json!({
            "method": "response",
            "status": "ok",
            "message": STANDARD.encode(reply.to_string()),
        });
        match codec.decode(frame.to_string().as_bytes()).unwrap() {
            Inbound::Fault {
                status_code,
                message,
                challenge,
            } => {
                assert_eq!(status_code, 401);
                assert_eq!(message, "Unauthorized");
                assert_eq!(challenge.unwrap().nonce, "abc");
            }
            other => panic!("unexpected inbound: {other:?}"),
        }
    }

    #[test]
    fn decode_truncated_frame_is_parse_error() {
        let codec = RpcFrameCodec::new();
        let raw = reply_frame(200, "OK", serde_json::json!({}));
        let truncated = &raw[..raw.len() / 2];
        assert_eq!(
            codec.decode(truncated),
            Err(CorrelatorError::UnexpectedParse)
        );
    }

    #[test]
    fn decode_truncated_inner_reply_is_parse_error() {
        let codec = RpcFrameCodec::new();
        let frame = serde_json::json!({
            "method": "response",
            "status": "ok",
            "message": STANDARD.encode("{\"status_code\":20"),
        });
        assert_eq!(
            codec.decode(frame.to_string().as_bytes()),
            Err(CorrelatorError::UnexpectedParse)
        );
    }

    #[test]
    fn decode_heartbeat_and_agent_failure() {
        let codec = RpcFrameCodec::new();
        let heartbeat = br#"{"method":"heartbeat_response","status":"ok","message":""}"#;
        assert_eq!(codec.decode(heartbeat).unwrap(), Inbound::Heartbeat);

        let failed = serde_json::json!({
            "method": "response",
            "status": "failed",
            "message": STANDARD.encode("connection to engine refused"),
        });
        assert_eq!(
            codec.decode(failed.to_string().as_bytes()).unwrap(),
            Inbound::Failure("connection to engine refused".into())
        );
    }

    #[test]
    fn client_response_uses_outcome_method() {
        let codec = RpcFrameCodec::new();
        let raw = codec
            .encode_client_response(&ClientResponse {
                method: ClientMethod::Error,
                message: "Failed to sync time".into(),
            })
            .unwrap();
        let frame: RpcFrame = serde_json::from_slice(&raw).unwrap();
        assert_eq!(frame.method, "error");
        assert_eq!(frame.status, "failed");
        let body: Value =
            serde_json::from_slice(&STANDARD.decode(frame.message.as_bytes()).unwrap()).unwrap();
        assert_eq!(body["Status"], "Failed to sync time");
    }
}

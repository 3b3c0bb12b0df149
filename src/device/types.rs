use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Outbound half of a device (or assistant) connection.
#[async_trait]
pub trait DeviceTransport: Send + Sync {
    /// Push one frame to the peer.
    async fn send(&self, frame: Vec<u8>) -> anyhow::Result<()>;
}

/// Transport backed by an unbounded channel drained by a socket writer task.
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl ChannelTransport {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl DeviceTransport for ChannelTransport {
    async fn send(&self, frame: Vec<u8>) -> anyhow::Result<()> {
        self.tx
            .send(frame)
            .map_err(|_| anyhow::anyhow!("connection writer has shut down"))
    }
}

/// Digest authentication challenge last reported by a device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigestChallenge {
    pub realm: String,
    #[serde(default)]
    pub nonce: String,
    #[serde(default)]
    pub qop: String,
}

/// Status projection read by the administrative API.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStatus {
    /// Last terminal message written by a workflow.
    pub status: Option<String>,
    /// Workflow that wrote `status`.
    pub workflow: Option<String>,
    pub updated_at: Option<String>,
}

/// Network facts the device reported on connect, refreshed by maintenance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subnet_mask: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_gateway: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub primary_dns: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secondary_dns: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dhcp_enabled: Option<bool>,
}

/// Point-in-time view of one registry entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    pub session_id: String,
    pub guid: Option<String>,
    pub connected_at: String,
    pub message_id: u64,
    pub request_in_flight: bool,
    pub unauth_count: u32,
    pub status: DeviceStatus,
    pub network: NetworkInfo,
}

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::device::DigestChallenge;

// ── Requests ────────────────────────────────────────────────────

/// A logical management operation sent to a device.
///
/// The codec decides how the operation is rendered on the wire; the
/// correlator and workflows only deal with this enum.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation", content = "params", rename_all = "snake_case")]
pub enum DeviceRequest {
    GetGeneralSettings,
    PutGeneralSettings(GeneralSettings),
    SetAdminAclEntryEx {
        username: String,
        digest_password: String,
    },
    GetLowAccuracyTimeSynch,
    SetHighAccuracyTimeSynch {
        ta0: i64,
        tm1: i64,
        tm2: i64,
    },
    GetEthernetPortSettings,
    PutEthernetPortSettings(EthernetPortSettings),
}

impl DeviceRequest {
    /// Short operation name used in logs and telemetry.
    pub fn name(&self) -> &'static str {
        match self {
            Self::GetGeneralSettings => "get_general_settings",
            Self::PutGeneralSettings(_) => "put_general_settings",
            Self::SetAdminAclEntryEx { .. } => "set_admin_acl_entry_ex",
            Self::GetLowAccuracyTimeSynch => "get_low_accuracy_time_synch",
            Self::SetHighAccuracyTimeSynch { .. } => "set_high_accuracy_time_synch",
            Self::GetEthernetPortSettings => "get_ethernet_port_settings",
            Self::PutEthernetPortSettings(_) => "put_ethernet_port_settings",
        }
    }
}

impl fmt::Display for DeviceRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// `AMT_GeneralSettings` fields the workflows care about.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GeneralSettings {
    #[serde(default)]
    pub digest_realm: String,
    #[serde(default)]
    pub host_name: String,
    #[serde(default)]
    pub domain_name: String,
}

/// `AMT_EthernetPortSettings` for the wired interface.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EthernetPortSettings {
    #[serde(rename = "InstanceID", default)]
    pub instance_id: String,
    #[serde(rename = "DHCPEnabled", default)]
    pub dhcp_enabled: bool,
    #[serde(rename = "IPAddress", default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(rename = "SubnetMask", default, skip_serializing_if = "Option::is_none")]
    pub subnet_mask: Option<String>,
    #[serde(rename = "DefaultGateway", default, skip_serializing_if = "Option::is_none")]
    pub default_gateway: Option<String>,
    #[serde(rename = "PrimaryDNS", default, skip_serializing_if = "Option::is_none")]
    pub primary_dns: Option<String>,
    #[serde(rename = "SecondaryDNS", default, skip_serializing_if = "Option::is_none")]
    pub secondary_dns: Option<String>,
    #[serde(rename = "MACAddress", default, skip_serializing_if = "Option::is_none")]
    pub mac_address: Option<String>,
}

// ── Responses ───────────────────────────────────────────────────

/// A successfully parsed device reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceResponse {
    pub status_code: u16,
    #[serde(default)]
    pub body: Value,
}

impl DeviceResponse {
    pub fn ok(body: Value) -> Self {
        Self {
            status_code: 200,
            body,
        }
    }

    /// Deserialize the body into a typed structure.
    pub fn decode_body<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        T::deserialize(&self.body)
    }

    /// `ReturnValue` reported by method invocations, if the body carries one.
    pub fn return_value(&self) -> Option<i64> {
        self.body.get("ReturnValue").and_then(Value::as_i64)
    }
}

/// Result of decoding one inbound device frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Reply to the in-flight request.
    Response(DeviceResponse),
    /// The device answered, but with a non-success HTTP status.
    Fault {
        status_code: u16,
        message: String,
        challenge: Option<DigestChallenge>,
    },
    /// The device-side agent could not complete the exchange.
    Failure(String),
    /// Keep-alive traffic; never completes a request.
    Heartbeat,
}

// ── Terminal notification ───────────────────────────────────────

/// Outcome method of a terminal notification pushed to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientMethod {
    Success,
    Error,
}

impl fmt::Display for ClientMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Message the device (and operator console behind it) receives when a
/// workflow reaches a terminal state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientResponse {
    pub method: ClientMethod,
    pub message: String,
}

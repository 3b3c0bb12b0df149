//! Maintenance of an already provisioned device: time, IP and hostname sync.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::engine::{
    Outcome, StateNode, WorkflowDefinition, WorkflowEngine, WorkflowRun, WorkflowServices, FAILED,
    SUCCESS,
};
use super::terminal::TerminalActions;
use super::{
    check_return_value, StatusReport, WorkflowContext, WorkflowError, GENERAL_SETTINGS_RETRIES,
};
use crate::correlator::DeviceInvoker;
use crate::device::NetworkInfo;
use crate::envelope::{DeviceRequest, DeviceResponse, EthernetPortSettings, GeneralSettings};

pub const WORKFLOW_NAME: &str = "maintenance";

pub const PROVISIONED: &str = "PROVISIONED";
pub const SYNC_TIME: &str = "SYNC_TIME";
pub const SYNC_IP_ADDRESS: &str = "SYNC_IP_ADDRESS";
pub const SYNC_HOST_NAME: &str = "SYNC_HOST_NAME";

pub const SYNCTIME: &str = "SYNCTIME";
pub const SYNCIP: &str = "SYNCIP";
pub const SYNCHOSTNAME: &str = "SYNCHOSTNAME";

const SVC_TIME: &str = "time-machine";
const SVC_IP: &str = "sync-ip-address";
const SVC_HOSTNAME: &str = "sync-hostname";

pub fn definition() -> WorkflowDefinition {
    WorkflowDefinition::new(
        WORKFLOW_NAME,
        PROVISIONED,
        vec![
            StateNode::idle(PROVISIONED)
                .on(SYNCTIME, SYNC_TIME)
                .on(SYNCIP, SYNC_IP_ADDRESS)
                .on(SYNCHOSTNAME, SYNC_HOST_NAME),
            StateNode::invoke(SYNC_TIME, SVC_TIME)
                .done(SUCCESS)
                .error(FAILED)
                .failure("Failed to sync time"),
            StateNode::invoke(SYNC_IP_ADDRESS, SVC_IP)
                .done(SUCCESS)
                .error(FAILED)
                .failure("Failed to sync IP address"),
            StateNode::invoke(SYNC_HOST_NAME, SVC_HOSTNAME)
                .done(SUCCESS)
                .error(FAILED)
                .failure("Failed to sync host name"),
            StateNode::success(),
            StateNode::failed(),
        ],
    )
}

/// Static addressing requested by `SYNCIP`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpConfiguration {
    #[serde(alias = "ipAddress")]
    pub ip_address: String,
    #[serde(alias = "subnetMask")]
    pub subnet_mask: String,
    #[serde(alias = "defaultGateway")]
    pub default_gateway: String,
    #[serde(default, alias = "primaryDns")]
    pub primary_dns: Option<String>,
    #[serde(default, alias = "secondaryDns")]
    pub secondary_dns: Option<String>,
}

/// Names requested by `SYNCHOSTNAME`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostnameInfo {
    #[serde(alias = "hostName")]
    pub host_name: String,
    #[serde(default, alias = "domainName")]
    pub domain_name: Option<String>,
}

impl IpConfiguration {
    /// Static addressing the device reported, when it reported all of it.
    pub fn from_network(network: &NetworkInfo) -> Option<Self> {
        Some(Self {
            ip_address: network.ip_address.clone()?,
            subnet_mask: network.subnet_mask.clone()?,
            default_gateway: network.default_gateway.clone()?,
            primary_dns: network.primary_dns.clone(),
            secondary_dns: network.secondary_dns.clone(),
        })
    }
}

impl HostnameInfo {
    pub fn from_network(network: &NetworkInfo) -> Option<Self> {
        let host_name = network.host_name.clone().filter(|h| !h.trim().is_empty())?;
        Some(Self {
            host_name,
            domain_name: network.domain_name.clone(),
        })
    }
}

#[derive(Debug)]
pub struct MaintenanceContext {
    pub session_id: String,
    pub ip_configuration: Option<IpConfiguration>,
    pub hostname: Option<HostnameInfo>,
    pub responses: Vec<DeviceResponse>,
    pub report: StatusReport,
}

impl MaintenanceContext {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            ip_configuration: None,
            hostname: None,
            responses: Vec::new(),
            report: StatusReport::default(),
        }
    }

    /// Build the context from trigger `data`.
    ///
    /// `SYNCIP` and `SYNCHOSTNAME` may arrive without data; the run then
    /// falls back to what the device reported about itself. Data that is
    /// present must be well formed.
    pub fn from_trigger(
        session_id: &str,
        event: &str,
        data: Option<&Value>,
    ) -> Result<Self, WorkflowError> {
        fn parse<T: serde::de::DeserializeOwned>(
            event: &str,
            data: Option<&Value>,
        ) -> Result<Option<T>, WorkflowError> {
            match data.filter(|v| !v.is_null()) {
                None => Ok(None),
                Some(data) => serde_json::from_value(data.clone())
                    .map(Some)
                    .map_err(|e| WorkflowError::Validation(format!("invalid {event} data: {e}"))),
            }
        }

        let mut ctx = Self::new(session_id);
        match event {
            SYNCIP => ctx.ip_configuration = parse(event, data)?,
            SYNCHOSTNAME => {
                let info: Option<HostnameInfo> = parse(event, data)?;
                if info.as_ref().is_some_and(|i| i.host_name.trim().is_empty()) {
                    return Err(WorkflowError::Validation("host_name must not be empty".into()));
                }
                ctx.hostname = info;
            }
            _ => {}
        }
        Ok(ctx)
    }
}

impl WorkflowContext for MaintenanceContext {
    fn session_id(&self) -> &str {
        &self.session_id
    }

    fn report(&self) -> &StatusReport {
        &self.report
    }

    fn report_mut(&mut self) -> &mut StatusReport {
        &mut self.report
    }
}

/// Services and table for maintenance.
pub struct Maintenance {
    invoker: Arc<DeviceInvoker>,
    terminal: Arc<TerminalActions>,
    definition: WorkflowDefinition,
}

impl Maintenance {
    pub fn new(invoker: Arc<DeviceInvoker>, terminal: Arc<TerminalActions>) -> Self {
        Self {
            invoker,
            terminal,
            definition: definition(),
        }
    }

    pub fn definition(&self) -> &WorkflowDefinition {
        &self.definition
    }

    pub async fn run(
        &self,
        ctx: MaintenanceContext,
        event: &str,
    ) -> Result<WorkflowRun<MaintenanceContext>, WorkflowError> {
        WorkflowEngine::new(&self.definition).run(self, ctx, event).await
    }

    async fn sync_time(&self, ctx: &mut MaintenanceContext) -> Result<(), WorkflowError> {
        let response = self
            .invoker
            .invoke_once(&ctx.session_id, &DeviceRequest::GetLowAccuracyTimeSynch)
            .await?;
        check_return_value(&response)?;
        let ta0 = response
            .body
            .get("Ta0")
            .and_then(Value::as_i64)
            .ok_or_else(|| WorkflowError::UnexpectedResponse("missing Ta0".into()))?;
        ctx.responses.push(response);

        let now = Utc::now().timestamp();
        let response = self
            .invoker
            .invoke_once(
                &ctx.session_id,
                &DeviceRequest::SetHighAccuracyTimeSynch {
                    ta0,
                    tm1: now,
                    tm2: now,
                },
            )
            .await?;
        check_return_value(&response)?;
        ctx.responses.push(response);

        ctx.report.succeed("Time Synchronized");
        Ok(())
    }

    /// Network details the device reported when it connected.
    fn reported_network(&self, session_id: &str) -> NetworkInfo {
        self.invoker
            .registry()
            .lookup(session_id)
            .map(|connection| connection.network())
            .unwrap_or_default()
    }

    async fn sync_ip(&self, ctx: &mut MaintenanceContext) -> Result<(), WorkflowError> {
        let wanted = match ctx.ip_configuration.clone() {
            Some(wanted) => wanted,
            None => IpConfiguration::from_network(&self.reported_network(&ctx.session_id))
                .ok_or_else(|| {
                    WorkflowError::Validation(
                        "no IP configuration supplied or reported by the device".into(),
                    )
                })?,
        };

        let response = self
            .invoker
            .invoke_once(&ctx.session_id, &DeviceRequest::GetEthernetPortSettings)
            .await?;
        let current: EthernetPortSettings = response
            .decode_body()
            .map_err(|e| WorkflowError::UnexpectedResponse(e.to_string()))?;
        ctx.responses.push(response);

        if current.dhcp_enabled {
            return Err(WorkflowError::Validation(
                "DHCP is enabled; only static addressing can be synchronized".into(),
            ));
        }

        let updated = EthernetPortSettings {
            ip_address: Some(wanted.ip_address.clone()),
            subnet_mask: Some(wanted.subnet_mask.clone()),
            default_gateway: Some(wanted.default_gateway.clone()),
            primary_dns: wanted.primary_dns.clone(),
            secondary_dns: wanted.secondary_dns.clone(),
            ..current
        };
        let response = self
            .invoker
            .invoke_once(
                &ctx.session_id,
                &DeviceRequest::PutEthernetPortSettings(updated),
            )
            .await?;
        check_return_value(&response)?;
        ctx.responses.push(response);

        if let Some(connection) = self.invoker.registry().lookup(&ctx.session_id) {
            connection.update_network(|network| {
                network.ip_address = Some(wanted.ip_address);
                network.subnet_mask = Some(wanted.subnet_mask);
                network.default_gateway = Some(wanted.default_gateway);
                network.primary_dns = wanted.primary_dns;
                network.secondary_dns = wanted.secondary_dns;
                network.dhcp_enabled = Some(false);
            });
        }
        ctx.report.succeed("IP Address Synchronized");
        Ok(())
    }

    async fn sync_hostname(&self, ctx: &mut MaintenanceContext) -> Result<(), WorkflowError> {
        let wanted = match ctx.hostname.clone() {
            Some(wanted) => wanted,
            None => HostnameInfo::from_network(&self.reported_network(&ctx.session_id))
                .ok_or_else(|| {
                    WorkflowError::Validation("no host name supplied or reported by the device".into())
                })?,
        };

        let response = self
            .invoker
            .invoke(
                &ctx.session_id,
                &DeviceRequest::GetGeneralSettings,
                GENERAL_SETTINGS_RETRIES,
            )
            .await?;
        let current: GeneralSettings = response
            .decode_body()
            .map_err(|e| WorkflowError::UnexpectedResponse(e.to_string()))?;
        ctx.responses.push(response);

        let domain_name = wanted
            .domain_name
            .clone()
            .unwrap_or_else(|| current.domain_name.clone());
        let updated = GeneralSettings {
            host_name: wanted.host_name.clone(),
            domain_name: domain_name.clone(),
            ..current
        };
        let response = self
            .invoker
            .invoke_once(&ctx.session_id, &DeviceRequest::PutGeneralSettings(updated))
            .await?;
        check_return_value(&response)?;
        ctx.responses.push(response);

        if let Some(connection) = self.invoker.registry().lookup(&ctx.session_id) {
            connection.update_network(|network| {
                network.host_name = Some(wanted.host_name);
                network.domain_name = Some(domain_name).filter(|d| !d.is_empty());
            });
        }
        ctx.report.succeed("Host Name Synchronized");
        Ok(())
    }
}

#[async_trait]
impl WorkflowServices<MaintenanceContext> for Maintenance {
    async fn invoke(&self, service: &str, ctx: &mut MaintenanceContext) -> Result<(), WorkflowError> {
        match service {
            SVC_TIME => self.sync_time(ctx).await,
            SVC_IP => self.sync_ip(ctx).await,
            SVC_HOSTNAME => self.sync_hostname(ctx).await,
            other => Err(WorkflowError::UnknownService(other.to_string())),
        }
    }

    async fn on_terminal(
        &self,
        state: &'static str,
        outcome: Outcome,
        ctx: &mut MaintenanceContext,
    ) {
        self.terminal.finish(WORKFLOW_NAME, state, outcome, &*ctx).await;
    }
}

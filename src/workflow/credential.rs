//! Admin credential rotation.
//!
//! `ACTIVATED → GET_GENERAL_SETTINGS → SEND_UPDATED_CREDENTIAL →
//! SAVE_CREDENTIAL_TO_SECRET_STORE → SUCCESS`, any failure → `FAILED`.
//! The secret store is only written after the device has accepted the new
//! value, so a stored credential is always one the device knows.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::info;

use super::engine::{
    Outcome, StateNode, WorkflowDefinition, WorkflowEngine, WorkflowRun, WorkflowServices, FAILED,
    SUCCESS,
};
use super::terminal::TerminalActions;
use super::{
    check_return_value, StatusReport, WorkflowContext, WorkflowError, GENERAL_SETTINGS_RETRIES,
};
use crate::config::CredentialsConfig;
use crate::correlator::DeviceInvoker;
use crate::envelope::{DeviceRequest, DeviceResponse, GeneralSettings};
use crate::security::{
    admin_digest, device_secret_path, generate_password, validate_password, SecretProvider,
    SecretStoreError,
};

pub const WORKFLOW_NAME: &str = "credential_rotation";

pub const ACTIVATED: &str = "ACTIVATED";
pub const GET_GENERAL_SETTINGS: &str = "GET_GENERAL_SETTINGS";
pub const SEND_UPDATED_CREDENTIAL: &str = "SEND_UPDATED_CREDENTIAL";
pub const SAVE_CREDENTIAL_TO_SECRET_STORE: &str = "SAVE_CREDENTIAL_TO_SECRET_STORE";

pub const CHANGE_CREDENTIAL: &str = "CHANGE_CREDENTIAL";
/// Older consoles send this name for the same trigger.
pub const CHANGE_PASSWORD: &str = "CHANGEPASSWORD";

const SVC_GET_GENERAL_SETTINGS: &str = "get-general-settings";
const SVC_SEND_UPDATED_CREDENTIAL: &str = "send-updated-credential";
const SVC_SAVE_CREDENTIAL: &str = "save-credential-to-secret-store";

pub fn definition() -> WorkflowDefinition {
    WorkflowDefinition::new(
        WORKFLOW_NAME,
        ACTIVATED,
        vec![
            StateNode::idle(ACTIVATED)
                .on(CHANGE_CREDENTIAL, GET_GENERAL_SETTINGS)
                .on(CHANGE_PASSWORD, GET_GENERAL_SETTINGS),
            StateNode::invoke(GET_GENERAL_SETTINGS, SVC_GET_GENERAL_SETTINGS)
                .done(SEND_UPDATED_CREDENTIAL)
                .error(FAILED)
                .failure("Failed to get general settings"),
            StateNode::invoke(SEND_UPDATED_CREDENTIAL, SVC_SEND_UPDATED_CREDENTIAL)
                .done(SAVE_CREDENTIAL_TO_SECRET_STORE)
                .error(FAILED)
                .failure("Failed to update admin credential"),
            StateNode::invoke(SAVE_CREDENTIAL_TO_SECRET_STORE, SVC_SAVE_CREDENTIAL)
                .done(SUCCESS)
                .error(FAILED)
                .failure("Failed to save credential to secret store"),
            StateNode::success(),
            StateNode::failed(),
        ],
    )
}

/// Trigger payload. Without a password one is generated.
#[derive(Clone, Default, Deserialize)]
pub struct CredentialRequest {
    #[serde(default)]
    pub password: Option<String>,
}

impl fmt::Debug for CredentialRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialRequest")
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

impl CredentialRequest {
    pub fn from_data(data: Option<&Value>) -> Result<Self, WorkflowError> {
        match data {
            None | Some(Value::Null) => Ok(Self::default()),
            Some(value) => serde_json::from_value(value.clone())
                .map_err(|e| WorkflowError::Validation(format!("invalid credential request: {e}"))),
        }
    }
}

pub struct CredentialContext {
    pub session_id: String,
    /// Key for the secret path: the device GUID, or the session id when the
    /// device never reported one.
    pub device_id: String,
    pub request: CredentialRequest,
    pub digest_realm: Option<String>,
    pub applied_password: Option<String>,
    pub responses: Vec<DeviceResponse>,
    pub report: StatusReport,
}

impl CredentialContext {
    pub fn new(session_id: impl Into<String>, device_id: impl Into<String>, request: CredentialRequest) -> Self {
        Self {
            session_id: session_id.into(),
            device_id: device_id.into(),
            request,
            digest_realm: None,
            applied_password: None,
            responses: Vec::new(),
            report: StatusReport::default(),
        }
    }
}

impl fmt::Debug for CredentialContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialContext")
            .field("session_id", &self.session_id)
            .field("device_id", &self.device_id)
            .field("request", &self.request)
            .field("digest_realm", &self.digest_realm)
            .field(
                "applied_password",
                &self.applied_password.as_ref().map(|_| "[REDACTED]"),
            )
            .field("responses", &self.responses.len())
            .field("report", &self.report)
            .finish()
    }
}

impl WorkflowContext for CredentialContext {
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

/// Services and table for credential rotation.
pub struct CredentialRotation {
    invoker: Arc<DeviceInvoker>,
    secrets: Arc<dyn SecretProvider>,
    terminal: Arc<TerminalActions>,
    config: CredentialsConfig,
    definition: WorkflowDefinition,
}

impl CredentialRotation {
    pub fn new(
        invoker: Arc<DeviceInvoker>,
        secrets: Arc<dyn SecretProvider>,
        terminal: Arc<TerminalActions>,
        config: CredentialsConfig,
    ) -> Self {
        Self {
            invoker,
            secrets,
            terminal,
            config,
            definition: definition(),
        }
    }

    pub fn definition(&self) -> &WorkflowDefinition {
        &self.definition
    }

    /// Build the context for `session_id` from trigger data.
    pub fn prepare(
        &self,
        session_id: &str,
        data: Option<&Value>,
    ) -> Result<CredentialContext, WorkflowError> {
        let request = CredentialRequest::from_data(data)?;
        if let Some(password) = &request.password {
            validate_password(password).map_err(|e| WorkflowError::Validation(e.to_string()))?;
        }
        let device_id = self
            .invoker
            .registry()
            .lookup(session_id)
            .and_then(|c| c.guid().map(str::to_string))
            .unwrap_or_else(|| session_id.to_string());
        Ok(CredentialContext::new(session_id, device_id, request))
    }

    pub async fn run(
        &self,
        ctx: CredentialContext,
        event: &str,
    ) -> Result<WorkflowRun<CredentialContext>, WorkflowError> {
        WorkflowEngine::new(&self.definition).run(self, ctx, event).await
    }

    async fn get_general_settings(&self, ctx: &mut CredentialContext) -> Result<(), WorkflowError> {
        let response = self
            .invoker
            .invoke(
                &ctx.session_id,
                &DeviceRequest::GetGeneralSettings,
                GENERAL_SETTINGS_RETRIES,
            )
            .await?;
        let settings: GeneralSettings = response
            .decode_body()
            .map_err(|e| WorkflowError::UnexpectedResponse(e.to_string()))?;
        ctx.responses.push(response);

        if settings.digest_realm.is_empty() {
            return Err(WorkflowError::UnexpectedResponse(
                "general settings carry no DigestRealm".into(),
            ));
        }
        ctx.digest_realm = Some(settings.digest_realm);
        Ok(())
    }

    async fn send_updated_credential(
        &self,
        ctx: &mut CredentialContext,
    ) -> Result<(), WorkflowError> {
        let realm = ctx
            .digest_realm
            .clone()
            .ok_or_else(|| WorkflowError::UnexpectedResponse("digest realm unknown".into()))?;

        let password = match &ctx.request.password {
            Some(password) => {
                validate_password(password)
                    .map_err(|e| WorkflowError::Validation(e.to_string()))?;
                password.clone()
            }
            None => generate_password(self.config.generated_length),
        };

        let request = DeviceRequest::SetAdminAclEntryEx {
            username: self.config.admin_username.clone(),
            digest_password: admin_digest(&self.config.admin_username, &realm, &password),
        };
        let response = self.invoker.invoke_once(&ctx.session_id, &request).await?;
        let accepted = check_return_value(&response);
        ctx.responses.push(response);
        accepted?;

        ctx.applied_password = Some(password);
        Ok(())
    }

    async fn save_credential(&self, ctx: &mut CredentialContext) -> Result<(), WorkflowError> {
        let password = ctx
            .applied_password
            .clone()
            .ok_or_else(|| WorkflowError::Validation("no credential was applied".into()))?;
        let path = device_secret_path(&ctx.device_id);

        let mut secret = match self.secrets.get_secret_at_path(&path).await? {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        };
        secret.insert(self.config.secret_key.clone(), Value::String(password));

        if !self
            .secrets
            .write_secret_at_path(&path, &Value::Object(secret))
            .await?
        {
            return Err(SecretStoreError::Rejected(format!("write to {path} declined")).into());
        }

        info!(
            "session {}: admin credential stored via {}",
            ctx.session_id,
            self.secrets.name()
        );
        ctx.report.succeed("Admin credential updated");
        Ok(())
    }
}

#[async_trait]
impl WorkflowServices<CredentialContext> for CredentialRotation {
    async fn invoke(&self, service: &str, ctx: &mut CredentialContext) -> Result<(), WorkflowError> {
        match service {
            SVC_GET_GENERAL_SETTINGS => self.get_general_settings(ctx).await,
            SVC_SEND_UPDATED_CREDENTIAL => self.send_updated_credential(ctx).await,
            SVC_SAVE_CREDENTIAL => self.save_credential(ctx).await,
            other => Err(WorkflowError::UnknownService(other.to_string())),
        }
    }

    async fn on_terminal(
        &self,
        state: &'static str,
        outcome: Outcome,
        ctx: &mut CredentialContext,
    ) {
        self.terminal.finish(WORKFLOW_NAME, state, outcome, &*ctx).await;
    }
}

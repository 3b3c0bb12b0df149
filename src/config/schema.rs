use anyhow::{Context, Result};
use directories::UserDirs;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;

use crate::security::password::{MAX_PASSWORD_LEN, MIN_PASSWORD_LEN};

// ── Top-level config ──────────────────────────────────────────────

/// Top-level service configuration, loaded from `config.toml`.
///
/// Resolution order: `--config` flag → `~/.oobprov/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
pub struct Config {
    /// Path the config was loaded from (computed, not serialized).
    #[serde(skip)]
    pub config_path: PathBuf,

    #[serde(default)]
    pub gateway: GatewayConfig,

    #[serde(default)]
    pub correlator: CorrelatorConfig,

    #[serde(default)]
    pub assistant: AssistantConfig,

    #[serde(default)]
    pub credentials: CredentialsConfig,

    #[serde(default)]
    pub secrets: SecretsConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,
}

// ── Gateway ───────────────────────────────────────────────────────

/// Device and administrative listener (`[gateway]` section).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct GatewayConfig {
    /// Gateway port (default: 8081)
    #[serde(default = "default_gateway_port")]
    pub port: u16,
    /// Gateway host (default: 127.0.0.1)
    #[serde(default = "default_gateway_host")]
    pub host: String,
    /// Upper bound on administrative request handling.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Maximum accepted body size for administrative requests.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

fn default_gateway_port() -> u16 {
    8081
}

fn default_gateway_host() -> String {
    "127.0.0.1".into()
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_max_body_bytes() -> usize {
    65_536
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_gateway_port(),
            host: default_gateway_host(),
            request_timeout_secs: default_request_timeout_secs(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

// ── Correlation ───────────────────────────────────────────────────

/// Device request/response correlation (`[correlator]` section).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CorrelatorConfig {
    /// Seconds to wait for a device reply before failing the attempt.
    #[serde(default = "default_correlator_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_correlator_timeout_secs() -> u64 {
    30
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_correlator_timeout_secs(),
        }
    }
}

/// Enrollment assistant side channel (`[assistant]` section).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct AssistantConfig {
    /// Seconds to wait for an assistant reply.
    #[serde(default = "default_assistant_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_assistant_timeout_secs() -> u64 {
    60
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_assistant_timeout_secs(),
        }
    }
}

// ── Credentials ───────────────────────────────────────────────────

/// Admin credential rotation (`[credentials]` section).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CredentialsConfig {
    /// Account whose digest entry is rewritten on rotation.
    #[serde(default = "default_admin_username")]
    pub admin_username: String,
    /// Length of generated passwords when the caller supplies none.
    #[serde(default = "default_generated_length")]
    pub generated_length: usize,
    /// Key under which the credential is stored in the device secret.
    #[serde(default = "default_secret_key")]
    pub secret_key: String,
}

fn default_admin_username() -> String {
    "admin".into()
}

fn default_generated_length() -> usize {
    16
}

fn default_secret_key() -> String {
    "AMT_PASSWORD".into()
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            admin_username: default_admin_username(),
            generated_length: default_generated_length(),
            secret_key: default_secret_key(),
        }
    }
}

// ── Secrets ───────────────────────────────────────────────────────

/// Device secret storage (`[secrets]` section).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SecretsConfig {
    /// "memory" | "file" | "vault"
    #[serde(default = "default_secrets_provider")]
    pub provider: String,
    /// Encrypt secret files at rest (file provider only).
    #[serde(default = "default_true")]
    pub encrypt: bool,
    /// Directory for the file provider. Defaults to `secrets/` next to the config file.
    #[serde(default)]
    pub file_dir: Option<String>,
    /// Vault server address, e.g. `http://127.0.0.1:8200`.
    #[serde(default = "default_vault_address")]
    pub vault_address: String,
    /// Vault token. Prefer `OOBPROV_VAULT_TOKEN` over storing it here.
    #[serde(default)]
    pub vault_token: Option<String>,
    /// KV v2 mount path.
    #[serde(default = "default_vault_mount")]
    pub vault_mount: String,
    #[serde(default = "default_vault_timeout_secs")]
    pub vault_timeout_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_secrets_provider() -> String {
    "file".into()
}

fn default_vault_address() -> String {
    "http://127.0.0.1:8200".into()
}

fn default_vault_mount() -> String {
    "secret".into()
}

fn default_vault_timeout_secs() -> u64 {
    10
}

impl Default for SecretsConfig {
    fn default() -> Self {
        Self {
            provider: default_secrets_provider(),
            encrypt: true,
            file_dir: None,
            vault_address: default_vault_address(),
            vault_token: None,
            vault_mount: default_vault_mount(),
            vault_timeout_secs: default_vault_timeout_secs(),
        }
    }
}

// ── Observability ─────────────────────────────────────────────────

/// Telemetry event sink (`[observability]` section).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ObservabilityConfig {
    /// "none" | "log" | "mqtt"
    #[serde(default = "default_observability_backend")]
    pub backend: String,
    /// Broker URL, e.g. `mqtt://localhost:1883`. Only used when backend = "mqtt".
    #[serde(default)]
    pub mqtt_broker_url: Option<String>,
    #[serde(default = "default_mqtt_topic")]
    pub mqtt_topic: String,
    #[serde(default = "default_mqtt_client_id")]
    pub mqtt_client_id: String,
}

fn default_observability_backend() -> String {
    "log".into()
}

fn default_mqtt_topic() -> String {
    "oobprov/events".into()
}

fn default_mqtt_client_id() -> String {
    "oobprov".into()
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            backend: default_observability_backend(),
            mqtt_broker_url: None,
            mqtt_topic: default_mqtt_topic(),
            mqtt_client_id: default_mqtt_client_id(),
        }
    }
}

// ── Loading ───────────────────────────────────────────────────────

fn default_config_dir() -> Result<PathBuf> {
    let home = UserDirs::new()
        .map(|u| u.home_dir().to_path_buf())
        .context("Could not find home directory")?;
    Ok(home.join(".oobprov"))
}

impl Config {
    /// Load `path` (or the default location), writing a default file when
    /// none exists, then apply env overrides and validate.
    pub async fn load_or_init(path: Option<&Path>) -> Result<Self> {
        let config_path = match path {
            Some(path) => path.to_path_buf(),
            None => default_config_dir()?.join("config.toml"),
        };

        let mut config = if config_path.exists() {
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                if let Ok(meta) = fs::metadata(&config_path).await {
                    if meta.permissions().mode() & 0o004 != 0 {
                        tracing::warn!(
                            "Config file {:?} is world-readable (mode {:o}). \
                             Consider restricting with: chmod 600 {:?}",
                            config_path,
                            meta.permissions().mode() & 0o777,
                            config_path,
                        );
                    }
                }
            }

            let contents = fs::read_to_string(&config_path)
                .await
                .context("Failed to read config file")?;
            let mut config: Config =
                toml::from_str(&contents).context("Failed to parse config file")?;
            config.config_path = config_path.clone();
            config
        } else {
            let mut config = Config::default();
            config.config_path = config_path.clone();
            config.save().await?;

            #[cfg(unix)]
            {
                use std::{fs::Permissions, os::unix::fs::PermissionsExt};
                let _ = fs::set_permissions(&config_path, Permissions::from_mode(0o600)).await;
            }
            config
        };

        config.apply_env_overrides();
        config.validate()?;
        tracing::info!(
            path = %config.config_path.display(),
            secrets = %config.secrets.provider,
            observability = %config.observability.backend,
            "Config loaded"
        );
        Ok(config)
    }

    /// Directory holding the config file; relative paths resolve against it.
    pub fn config_dir(&self) -> PathBuf {
        self.config_path
            .parent()
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf)
    }

    /// Directory used by the file secret provider.
    pub fn secrets_dir(&self) -> PathBuf {
        match self.secrets.file_dir.as_deref() {
            Some(dir) if Path::new(dir).is_absolute() => PathBuf::from(dir),
            Some(dir) => self.config_dir().join(dir),
            None => self.config_dir().join("secrets"),
        }
    }

    /// Validate configuration values that would cause runtime failures.
    pub fn validate(&self) -> Result<()> {
        if self.gateway.host.trim().is_empty() {
            anyhow::bail!("gateway.host must not be empty");
        }
        if self.gateway.max_body_bytes == 0 {
            anyhow::bail!("gateway.max_body_bytes must be greater than 0");
        }
        if self.correlator.timeout_secs == 0 {
            anyhow::bail!("correlator.timeout_secs must be greater than 0");
        }
        if self.assistant.timeout_secs == 0 {
            anyhow::bail!("assistant.timeout_secs must be greater than 0");
        }

        let length = self.credentials.generated_length;
        if !(MIN_PASSWORD_LEN..=MAX_PASSWORD_LEN).contains(&length) {
            anyhow::bail!(
                "credentials.generated_length must be between {MIN_PASSWORD_LEN} and {MAX_PASSWORD_LEN}"
            );
        }
        if self.credentials.admin_username.trim().is_empty() {
            anyhow::bail!("credentials.admin_username must not be empty");
        }

        match self.secrets.provider.trim() {
            "memory" | "file" => {}
            "vault" => {
                if self.secrets.vault_address.trim().is_empty() {
                    anyhow::bail!("secrets.vault_address must be set for the vault provider");
                }
            }
            other => anyhow::bail!("unknown secrets.provider: {other}"),
        }

        match self.observability.backend.trim() {
            "none" | "noop" | "log" => {}
            "mqtt" => {
                if self.observability.mqtt_broker_url.is_none() {
                    anyhow::bail!("observability.mqtt_broker_url must be set for the mqtt backend");
                }
            }
            other => anyhow::bail!("unknown observability.backend: {other}"),
        }
        Ok(())
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("OOBPROV_HOST") {
            if !host.is_empty() {
                self.gateway.host = host;
            }
        }

        if let Ok(port_str) = std::env::var("OOBPROV_PORT") {
            if let Ok(port) = port_str.parse::<u16>() {
                self.gateway.port = port;
            }
        }

        if let Ok(provider) = std::env::var("OOBPROV_SECRETS_PROVIDER") {
            if !provider.is_empty() {
                self.secrets.provider = provider;
            }
        }

        if let Ok(address) = std::env::var("OOBPROV_VAULT_ADDRESS") {
            if !address.is_empty() {
                self.secrets.vault_address = address;
            }
        }

        if let Ok(token) = std::env::var("OOBPROV_VAULT_TOKEN") {
            if !token.is_empty() {
                self.secrets.vault_token = Some(token);
            }
        }

        if let Ok(backend) = std::env::var("OOBPROV_OBSERVABILITY_BACKEND") {
            if !backend.is_empty() {
                self.observability.backend = backend;
            }
        }

        if let Ok(url) = std::env::var("OOBPROV_MQTT_BROKER_URL") {
            if !url.is_empty() {
                self.observability.mqtt_broker_url = Some(url);
            }
        }
    }

    /// Write the config atomically: temp file, fsync, rename.
    pub async fn save(&self) -> Result<()> {
        let toml_str = toml::to_string_pretty(self).context("Failed to serialize config")?;

        let parent_dir = self
            .config_path
            .parent()
            .context("Config path must have a parent directory")?;

        fs::create_dir_all(parent_dir).await.with_context(|| {
            format!(
                "Failed to create config directory: {}",
                parent_dir.display()
            )
        })?;

        let file_name = self
            .config_path
            .file_name()
            .and_then(|v| v.to_str())
            .unwrap_or("config.toml");
        let temp_path = parent_dir.join(format!(".{file_name}.tmp-{}", uuid::Uuid::new_v4()));

        let mut temp_file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| {
                format!(
                    "Failed to create temporary config file: {}",
                    temp_path.display()
                )
            })?;
        temp_file
            .write_all(toml_str.as_bytes())
            .await
            .context("Failed to write temporary config contents")?;
        temp_file
            .sync_all()
            .await
            .context("Failed to fsync temporary config file")?;
        drop(temp_file);

        if let Err(e) = fs::rename(&temp_path, &self.config_path).await {
            let _ = fs::remove_file(&temp_path).await;
            anyhow::bail!("Failed to atomically replace config file: {e}");
        }
        Ok(())
    }
}

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;

use super::secrets::FileSecretProvider;
use super::vault::VaultSecretProvider;
use crate::config::Config;

/// Failures reported by secret providers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SecretStoreError {
    #[error("secret store unreachable: {0}")]
    Unreachable(String),
    #[error("secret store rejected the request: {0}")]
    Rejected(String),
    #[error("secret store I/O error: {0}")]
    Io(String),
    #[error("secret payload is not valid JSON: {0}")]
    Serialization(String),
    #[error("secret decryption failed: {0}")]
    Crypto(String),
    #[error("invalid secret store configuration: {0}")]
    Configuration(String),
}

/// Storage for per-device secret objects, addressed by path.
#[async_trait]
pub trait SecretProvider: Send + Sync {
    /// Provider name used in logs.
    fn name(&self) -> &str;

    /// Read the object at `path`; `None` when nothing is stored there.
    async fn get_secret_at_path(&self, path: &str) -> Result<Option<Value>, SecretStoreError>;

    /// Replace the object at `path`. `false` means the store declined the write.
    async fn write_secret_at_path(&self, path: &str, data: &Value)
        -> Result<bool, SecretStoreError>;

    async fn delete_secret_at_path(&self, path: &str) -> Result<bool, SecretStoreError>;

    /// Cheap reachability probe.
    async fn health_check(&self) -> Result<(), SecretStoreError> {
        Ok(())
    }
}

// ── In-memory provider ───────────────────────────────────────────

/// Process-local provider. Used for tests and throwaway deployments.
#[derive(Default)]
pub struct MemorySecretProvider {
    entries: RwLock<HashMap<String, Value>>,
}

impl MemorySecretProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[async_trait]
impl SecretProvider for MemorySecretProvider {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get_secret_at_path(&self, path: &str) -> Result<Option<Value>, SecretStoreError> {
        Ok(self.entries.read().get(path).cloned())
    }

    async fn write_secret_at_path(
        &self,
        path: &str,
        data: &Value,
    ) -> Result<bool, SecretStoreError> {
        if !data.is_object() {
            return Ok(false);
        }
        self.entries.write().insert(path.to_string(), data.clone());
        Ok(true)
    }

    async fn delete_secret_at_path(&self, path: &str) -> Result<bool, SecretStoreError> {
        Ok(self.entries.write().remove(path).is_some())
    }
}

// ── Selection ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SecretProviderKind {
    Memory,
    File,
    Vault,
    Unknown,
}

pub fn classify_secret_provider(name: &str) -> SecretProviderKind {
    match name.trim().to_ascii_lowercase().as_str() {
        "memory" => SecretProviderKind::Memory,
        "file" => SecretProviderKind::File,
        "vault" => SecretProviderKind::Vault,
        _ => SecretProviderKind::Unknown,
    }
}

/// Build the provider named by `config.secrets.provider`.
pub fn create_secret_provider(
    config: &Config,
) -> Result<Arc<dyn SecretProvider>, SecretStoreError> {
    let secrets = &config.secrets;
    match classify_secret_provider(&secrets.provider) {
        SecretProviderKind::Memory => Ok(Arc::new(MemorySecretProvider::new())),
        SecretProviderKind::File => Ok(Arc::new(FileSecretProvider::new(
            config.secrets_dir(),
            secrets.encrypt,
        ))),
        SecretProviderKind::Vault => Ok(Arc::new(VaultSecretProvider::from_config(secrets)?)),
        SecretProviderKind::Unknown => Err(SecretStoreError::Configuration(format!(
            "unknown secrets provider `{}`",
            secrets.provider
        ))),
    }
}

/// Builds the configured provider on first use and hands out the same
/// instance afterwards.
pub struct SecretProviderFactory {
    config: Config,
    instance: OnceLock<Arc<dyn SecretProvider>>,
}

impl SecretProviderFactory {
    pub fn new(config: &Config) -> Self {
        Self {
            config: config.clone(),
            instance: OnceLock::new(),
        }
    }

    pub fn provider(&self) -> Result<Arc<dyn SecretProvider>, SecretStoreError> {
        if let Some(existing) = self.instance.get() {
            return Ok(Arc::clone(existing));
        }
        let created = create_secret_provider(&self.config)?;
        tracing::info!("secret provider initialized: {}", created.name());
        // A concurrent caller may have won; everyone gets the stored one.
        Ok(Arc::clone(self.instance.get_or_init(|| created)))
    }

    pub fn secrets_dir(&self) -> PathBuf {
        self.config.secrets_dir()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config_with(provider: &str) -> Config {
        let mut config = Config::default();
        config.config_path = std::env::temp_dir().join("oobprov-provider-test/config.toml");
        config.secrets.provider = provider.into();
        config
    }

    #[tokio::test]
    async fn memory_provider_round_trip() {
        let provider = MemorySecretProvider::new();
        assert_eq!(provider.get_secret_at_path("devices/a").await, Ok(None));

        let secret = json!({"AMT_PASSWORD": "P@ssw0rd"});
        assert_eq!(provider.write_secret_at_path("devices/a", &secret).await, Ok(true));
        assert_eq!(
            provider.get_secret_at_path("devices/a").await,
            Ok(Some(secret))
        );
        assert_eq!(provider.delete_secret_at_path("devices/a").await, Ok(true));
        assert_eq!(provider.delete_secret_at_path("devices/a").await, Ok(false));
        assert!(provider.is_empty());
    }

    #[tokio::test]
    async fn memory_provider_declines_non_objects() {
        let provider = MemorySecretProvider::new();
        assert_eq!(
            provider.write_secret_at_path("devices/a", &json!("flat")).await,
            Ok(false)
        );
    }

    #[test]
    fn classify_names() {
        assert_eq!(classify_secret_provider("Vault"), SecretProviderKind::Vault);
        assert_eq!(classify_secret_provider(" file "), SecretProviderKind::File);
        assert_eq!(classify_secret_provider("memory"), SecretProviderKind::Memory);
        assert_eq!(classify_secret_provider("consul"), SecretProviderKind::Unknown);
    }

    #[test]
    fn factory_caches_one_instance() {
        let factory = SecretProviderFactory::new(&config_with("memory"));
        let first = factory.provider().unwrap();
        let second = factory.provider().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.name(), "memory");
    }

    #[test]
    fn factory_builds_each_kind() {
        let file = create_secret_provider(&config_with("file")).unwrap();
        assert_eq!(file.name(), "file");

        let vault = create_secret_provider(&config_with("vault")).unwrap();
        assert_eq!(vault.name(), "vault");
    }

    #[test]
    fn factory_rejects_unknown_provider() {
        let factory = SecretProviderFactory::new(&config_with("consul"));
        assert!(matches!(
            factory.provider(),
            Err(SecretStoreError::Configuration(_))
        ));
    }
}

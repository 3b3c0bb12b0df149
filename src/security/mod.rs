//! Credential handling and device secret storage.
//!
//! [`password`] holds the admin credential policy and the ACL digest used by
//! credential rotation. Secret objects are persisted through the
//! [`SecretProvider`] trait with three backends: in-memory, an encrypted file
//! store ([`FileSecretProvider`]) and HashiCorp Vault KV v2
//! ([`VaultSecretProvider`]). [`SecretProviderFactory`] picks one from config
//! and keeps it for the process lifetime.

pub mod password;
pub mod provider;
pub mod secrets;
pub mod vault;

pub use password::{admin_digest, generate_password, validate_password, PasswordPolicyError};
pub use provider::{
    create_secret_provider, MemorySecretProvider, SecretProvider, SecretProviderFactory,
    SecretStoreError,
};
pub use secrets::{FileSecretProvider, SecretCipher};
pub use vault::VaultSecretProvider;

/// Secret path for a device: `devices/{guid}`.
pub fn device_secret_path(device_id: &str) -> String {
    format!("devices/{device_id}")
}

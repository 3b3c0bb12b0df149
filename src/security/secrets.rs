// Encrypted on-disk secret provider.
//
// Each device secret object is stored as one file under the provider
// directory. The file name is the SHA-256 of the logical path, so arbitrary
// paths never escape the directory. With encryption enabled the file body is
// `enc2:<hex(nonce ‖ ciphertext ‖ tag)>` using ChaCha20-Poly1305 and a random
// key kept in `<dir>/.secret_key` (mode 0600). Without encryption the body is
// the plain JSON object.

use async_trait::async_trait;
use chacha20poly1305::aead::{Aead, KeyInit, OsRng};
use chacha20poly1305::{AeadCore, ChaCha20Poly1305, Key, Nonce};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::fs;

use super::provider::{SecretProvider, SecretStoreError};

/// ChaCha20-Poly1305 nonce length in bytes.
const NONCE_LEN: usize = 12;

const ENCRYPTED_PREFIX: &str = "enc2:";

/// Symmetric cipher over a key file that is created on first use.
#[derive(Debug, Clone)]
pub struct SecretCipher {
    key_path: PathBuf,
}

impl SecretCipher {
    pub fn new(dir: &Path) -> Self {
        Self {
            key_path: dir.join(".secret_key"),
        }
    }

    /// Encrypt `plaintext` into the `enc2:` text format.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<String, SecretStoreError> {
        let key_bytes = self.load_or_create_key()?;
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key_bytes));

        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, plaintext)
            .map_err(|e| SecretStoreError::Crypto(format!("encryption failed: {e}")))?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);
        Ok(format!("{ENCRYPTED_PREFIX}{}", hex::encode(blob)))
    }

    /// Decrypt an `enc2:` value. Values without the prefix are returned as-is.
    pub fn decrypt(&self, value: &str) -> Result<Vec<u8>, SecretStoreError> {
        let Some(hex_str) = value.strip_prefix(ENCRYPTED_PREFIX) else {
            return Ok(value.as_bytes().to_vec());
        };

        let blob = hex::decode(hex_str.trim())
            .map_err(|_| SecretStoreError::Crypto("corrupt hex in encrypted secret".into()))?;
        if blob.len() <= NONCE_LEN {
            return Err(SecretStoreError::Crypto(
                "encrypted value too short (missing nonce)".into(),
            ));
        }

        let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);
        let key_bytes = self.load_or_create_key()?;
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key_bytes));
        cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| SecretStoreError::Crypto("wrong key or tampered data".into()))
    }

    pub fn is_encrypted(value: &str) -> bool {
        value.starts_with(ENCRYPTED_PREFIX)
    }

    /// Load the key from disk, or create one with restrictive permissions.
    fn load_or_create_key(&self) -> Result<Vec<u8>, SecretStoreError> {
        let io = |e: std::io::Error| SecretStoreError::Io(e.to_string());
        let corrupt = |_| SecretStoreError::Crypto("secret key file is corrupt".into());

        if self.key_path.exists() {
            let hex_key = std::fs::read_to_string(&self.key_path).map_err(io)?;
            return hex::decode(hex_key.trim()).map_err(corrupt);
        }

        if let Some(parent) = self.key_path.parent() {
            std::fs::create_dir_all(parent).map_err(io)?;
        }

        let key = ChaCha20Poly1305::generate_key(&mut OsRng).to_vec();
        match std::fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&self.key_path)
        {
            Ok(mut key_file) => {
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    key_file
                        .set_permissions(std::fs::Permissions::from_mode(0o600))
                        .map_err(io)?;
                }
                key_file.write_all(hex::encode(&key).as_bytes()).map_err(io)?;
                key_file.sync_all().map_err(io)?;
                Ok(key)
            }
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                // Concurrent creator won the race; read the existing key.
                let hex_key = std::fs::read_to_string(&self.key_path).map_err(io)?;
                hex::decode(hex_key.trim()).map_err(corrupt)
            }
            Err(err) => Err(io(err)),
        }
    }
}

/// Secret provider backed by one file per secret path.
#[derive(Debug, Clone)]
pub struct FileSecretProvider {
    dir: PathBuf,
    cipher: Option<SecretCipher>,
}

impl FileSecretProvider {
    pub fn new(dir: impl Into<PathBuf>, encrypt: bool) -> Self {
        let dir = dir.into();
        let cipher = encrypt.then(|| SecretCipher::new(&dir));
        Self { dir, cipher }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Location of the file holding `path`.
    pub fn file_for(&self, path: &str) -> PathBuf {
        let digest = Sha256::digest(path.trim_matches('/').as_bytes());
        self.dir.join(format!("{}.secret", hex::encode(digest)))
    }
}

#[async_trait]
impl SecretProvider for FileSecretProvider {
    fn name(&self) -> &str {
        "file"
    }

    async fn get_secret_at_path(&self, path: &str) -> Result<Option<Value>, SecretStoreError> {
        let file = self.file_for(path);
        let contents = match fs::read_to_string(&file).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(SecretStoreError::Io(e.to_string())),
        };

        let plain = match &self.cipher {
            Some(cipher) => cipher.decrypt(&contents)?,
            None => contents.into_bytes(),
        };
        serde_json::from_slice(&plain)
            .map(Some)
            .map_err(|e| SecretStoreError::Serialization(e.to_string()))
    }

    async fn write_secret_at_path(
        &self,
        path: &str,
        data: &Value,
    ) -> Result<bool, SecretStoreError> {
        if !data.is_object() {
            return Ok(false);
        }
        let json =
            serde_json::to_vec(data).map_err(|e| SecretStoreError::Serialization(e.to_string()))?;
        let body = match &self.cipher {
            Some(cipher) => cipher.encrypt(&json)?,
            None => String::from_utf8(json)
                .map_err(|e| SecretStoreError::Serialization(e.to_string()))?,
        };

        fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| SecretStoreError::Io(e.to_string()))?;

        let file = self.file_for(path);
        let temp = file.with_extension(format!("tmp-{}", uuid::Uuid::new_v4()));
        fs::write(&temp, body)
            .await
            .map_err(|e| SecretStoreError::Io(e.to_string()))?;
        if let Err(e) = fs::rename(&temp, &file).await {
            let _ = fs::remove_file(&temp).await;
            return Err(SecretStoreError::Io(e.to_string()));
        }
        Ok(true)
    }

    async fn delete_secret_at_path(&self, path: &str) -> Result<bool, SecretStoreError> {
        match fs::remove_file(self.file_for(path)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(SecretStoreError::Io(e.to_string())),
        }
    }

    async fn health_check(&self) -> Result<(), SecretStoreError> {
        fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| SecretStoreError::Unreachable(e.to_string()))
    }
}

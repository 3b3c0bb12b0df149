//! HashiCorp Vault KV v2 secret provider.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};

use super::provider::{SecretProvider, SecretStoreError};
use crate::config::SecretsConfig;

const TOKEN_HEADER: &str = "X-Vault-Token";

pub struct VaultSecretProvider {
    client: Client,
    address: String,
    mount: String,
    token: Option<String>,
}

impl VaultSecretProvider {
    pub fn new(
        address: &str,
        mount: &str,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, SecretStoreError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SecretStoreError::Configuration(e.to_string()))?;
        Ok(Self {
            client,
            address: address.trim_end_matches('/').to_string(),
            mount: mount.trim_matches('/').to_string(),
            token,
        })
    }

    pub fn from_config(config: &SecretsConfig) -> Result<Self, SecretStoreError> {
        Self::new(
            &config.vault_address,
            &config.vault_mount,
            config.vault_token.clone(),
            Duration::from_secs(config.vault_timeout_secs),
        )
    }

    fn url(&self, kind: &str, path: &str) -> String {
        format!(
            "{}/v1/{}/{kind}/{}",
            self.address,
            self.mount,
            path.trim_matches('/')
        )
    }

    fn request(&self, method: reqwest::Method, url: String) -> reqwest::RequestBuilder {
        let builder = self.client.request(method, url);
        match &self.token {
            Some(token) => builder.header(TOKEN_HEADER, token),
            None => builder,
        }
    }
}

fn unreachable(e: reqwest::Error) -> SecretStoreError {
    SecretStoreError::Unreachable(e.to_string())
}

#[async_trait]
impl SecretProvider for VaultSecretProvider {
    fn name(&self) -> &str {
        "vault"
    }

    async fn get_secret_at_path(&self, path: &str) -> Result<Option<Value>, SecretStoreError> {
        let response = self
            .request(reqwest::Method::GET, self.url("data", path))
            .send()
            .await
            .map_err(unreachable)?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let body: Value = response
                    .json()
                    .await
                    .map_err(|e| SecretStoreError::Serialization(e.to_string()))?;
                Ok(body.pointer("/data/data").cloned())
            }
            status => Err(SecretStoreError::Rejected(format!(
                "GET {path} returned {status}"
            ))),
        }
    }

    async fn write_secret_at_path(
        &self,
        path: &str,
        data: &Value,
    ) -> Result<bool, SecretStoreError> {
        let response = self
            .request(reqwest::Method::POST, self.url("data", path))
            .json(&json!({ "data": data }))
            .send()
            .await
            .map_err(unreachable)?;

        let status = response.status();
        if status.is_server_error() {
            return Err(SecretStoreError::Unreachable(format!(
                "POST {path} returned {status}"
            )));
        }
        if !status.is_success() {
            tracing::warn!("vault declined write to {path}: {status}");
        }
        Ok(status.is_success())
    }

    async fn delete_secret_at_path(&self, path: &str) -> Result<bool, SecretStoreError> {
        let response = self
            .request(reqwest::Method::DELETE, self.url("metadata", path))
            .send()
            .await
            .map_err(unreachable)?;
        Ok(response.status().is_success())
    }

    async fn health_check(&self) -> Result<(), SecretStoreError> {
        let url = format!("{}/v1/sys/health", self.address);
        let response = self.client.get(url).send().await.map_err(unreachable)?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(SecretStoreError::Unreachable(format!(
                "health check returned {}",
                response.status()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider(server: &MockServer) -> VaultSecretProvider {
        VaultSecretProvider::new(
            &server.uri(),
            "secret",
            Some("root-token".into()),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn reads_kv2_data() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/secret/data/devices/guid-1"))
            .and(header(TOKEN_HEADER, "root-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {
                    "data": {"AMT_PASSWORD": "P@ssw0rd"},
                    "metadata": {"version": 3}
                }
            })))
            .mount(&server)
            .await;

        let secret = provider(&server)
            .get_secret_at_path("devices/guid-1")
            .await
            .unwrap();
        assert_eq!(secret, Some(json!({"AMT_PASSWORD": "P@ssw0rd"})));
    }

    #[tokio::test]
    async fn missing_secret_is_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        assert_eq!(
            provider(&server).get_secret_at_path("devices/none").await,
            Ok(None)
        );
    }

    #[tokio::test]
    async fn forbidden_read_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        assert!(matches!(
            provider(&server).get_secret_at_path("devices/g").await,
            Err(SecretStoreError::Rejected(_))
        ));
    }

    #[tokio::test]
    async fn writes_wrap_object_in_data() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/secret/data/devices/guid-1"))
            .and(body_json(json!({"data": {"AMT_PASSWORD": "n3w!Pass"}})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": {"version": 4}})))
            .expect(1)
            .mount(&server)
            .await;

        let written = provider(&server)
            .write_secret_at_path("devices/guid-1", &json!({"AMT_PASSWORD": "n3w!Pass"}))
            .await
            .unwrap();
        assert!(written);
    }

    #[tokio::test]
    async fn declined_write_returns_false() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        assert_eq!(
            provider(&server)
                .write_secret_at_path("devices/g", &json!({}))
                .await,
            Ok(false)
        );
    }

    #[tokio::test]
    async fn server_error_on_write_is_unreachable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        assert!(matches!(
            provider(&server)
                .write_secret_at_path("devices/g", &json!({}))
                .await,
            Err(SecretStoreError::Unreachable(_))
        ));
    }

    #[tokio::test]
    async fn delete_targets_metadata() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/v1/secret/metadata/devices/g"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        assert_eq!(
            provider(&server).delete_secret_at_path("devices/g").await,
            Ok(true)
        );
    }

    #[tokio::test]
    async fn unreachable_server_is_reported() {
        let provider = VaultSecretProvider::new(
            "http://127.0.0.1:1",
            "secret",
            None,
            Duration::from_millis(500),
        )
        .unwrap();
        assert!(matches!(
            provider.get_secret_at_path("devices/g").await,
            Err(SecretStoreError::Unreachable(_))
        ));
        assert!(provider.health_check().await.is_err());
    }

    #[tokio::test]
    async fn health_check_hits_sys_health() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/sys/health"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"initialized": true})))
            .mount(&server)
            .await;

        provider(&server).health_check().await.unwrap();
    }
}

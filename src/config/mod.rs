pub mod schema;

pub use schema::{
    AssistantConfig, Config, CorrelatorConfig, CredentialsConfig, GatewayConfig,
    ObservabilityConfig, SecretsConfig,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reexported_config_default_is_constructible() {
        let config = Config::default();

        assert!(!config.gateway.host.is_empty());
        assert!(config.correlator.timeout_secs > 0);
        assert!(config.assistant.timeout_secs > 0);
    }
}

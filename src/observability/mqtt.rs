//! MQTT telemetry publisher.

use std::time::Duration;

use anyhow::{Context, Result};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS, Transport};
use tracing::{info, warn};

use super::{EventPublisher, TelemetryEvent};
use crate::config::ObservabilityConfig;

pub struct MqttPublisher {
    client: AsyncClient,
    topic: String,
}

impl MqttPublisher {
    /// Create the client and spawn its event loop.
    pub fn connect(config: &ObservabilityConfig) -> Result<Self> {
        let url = config
            .mqtt_broker_url
            .as_deref()
            .context("observability.mqtt_broker_url is required for the mqtt backend")?;

        let mut options = MqttOptions::new(&config.mqtt_client_id, broker_host(url), broker_port(url));
        options.set_keep_alive(Duration::from_secs(30));
        if url.starts_with("mqtts://") {
            options.set_transport(Transport::tls_with_default_config());
        }

        let (client, mut eventloop) = AsyncClient::new(options, 64);
        tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("MQTT telemetry: connected to broker");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        // rumqttc reconnects on the next poll
                        warn!("MQTT telemetry: connection error: {e}");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        Ok(Self {
            client,
            topic: config.mqtt_topic.clone(),
        })
    }
}

impl EventPublisher for MqttPublisher {
    fn name(&self) -> &str {
        "mqtt"
    }

    fn publish(&self, event: TelemetryEvent) {
        let payload = match serde_json::to_vec(&event) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("MQTT telemetry: failed to serialize event: {e}");
                return;
            }
        };
        if let Err(e) = self
            .client
            .try_publish(&self.topic, QoS::AtLeastOnce, false, payload)
        {
            warn!("MQTT telemetry: dropped event {}: {e}", event.id);
        }
    }
}

/// Extract host from broker URL like "mqtt://host:port"
fn broker_host(url: &str) -> String {
    let without_scheme = url
        .strip_prefix("mqtt://")
        .or_else(|| url.strip_prefix("mqtts://"))
        .unwrap_or(url);
    without_scheme
        .split(':')
        .next()
        .unwrap_or("localhost")
        .to_string()
}

/// Extract port from broker URL, defaulting to 1883 for mqtt:// and 8883 for mqtts://.
fn broker_port(url: &str) -> u16 {
    let default_port: u16 = if url.starts_with("mqtts://") { 8883 } else { 1883 };
    let without_scheme = url
        .strip_prefix("mqtt://")
        .or_else(|| url.strip_prefix("mqtts://"))
        .unwrap_or(url);
    without_scheme
        .split_once(':')
        .and_then(|(_, port)| port.trim_end_matches('/').parse().ok())
        .unwrap_or(default_port)
}

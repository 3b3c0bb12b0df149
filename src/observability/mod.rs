//! Telemetry sink for workflow outcomes.
//!
//! Publishing is fire-and-forget: a sink that cannot deliver logs and drops
//! the event rather than failing the workflow that produced it.

pub mod mqtt;

use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::ObservabilityConfig;

pub use mqtt::MqttPublisher;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    Info,
    Warning,
    Error,
}

impl fmt::Display for EventLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Info => write!(f, "info"),
            Self::Warning => write!(f, "warning"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// One telemetry record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryEvent {
    pub id: String,
    pub timestamp: String,
    pub level: EventLevel,
    /// Free-form tags, e.g. `[workflow, state]`.
    pub tags: Vec<String>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl TelemetryEvent {
    pub fn new(level: EventLevel, tags: Vec<String>, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now().to_rfc3339(),
            level,
            tags,
            message: message.into(),
            session_id: None,
        }
    }

    #[must_use]
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}

pub trait EventPublisher: Send + Sync {
    fn name(&self) -> &str;

    fn publish(&self, event: TelemetryEvent);
}

/// Discards everything.
pub struct NoopPublisher;

impl EventPublisher for NoopPublisher {
    fn name(&self) -> &str {
        "none"
    }

    fn publish(&self, _event: TelemetryEvent) {}
}

/// Emits each event as a structured `tracing` record.
pub struct LogPublisher;

impl EventPublisher for LogPublisher {
    fn name(&self) -> &str {
        "log"
    }

    fn publish(&self, event: TelemetryEvent) {
        let tags = event.tags.join(",");
        let session = event.session_id.as_deref().unwrap_or("-");
        match event.level {
            EventLevel::Info => {
                tracing::info!(target: "telemetry", tags = %tags, session = %session, "{}", event.message);
            }
            EventLevel::Warning => {
                tracing::warn!(target: "telemetry", tags = %tags, session = %session, "{}", event.message);
            }
            EventLevel::Error => {
                tracing::error!(target: "telemetry", tags = %tags, session = %session, "{}", event.message);
            }
        }
    }
}

/// Keeps events in memory for inspection.
#[derive(Default)]
pub struct MemoryPublisher {
    events: Mutex<Vec<TelemetryEvent>>,
}

impl MemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TelemetryEvent> {
        self.events.lock().clone()
    }
}

impl EventPublisher for MemoryPublisher {
    fn name(&self) -> &str {
        "memory"
    }

    fn publish(&self, event: TelemetryEvent) {
        self.events.lock().push(event);
    }
}

/// Build the publisher named by `config.backend`.
///
/// The mqtt backend spawns its connection task, so call this from inside a
/// Tokio runtime.
pub fn create_event_publisher(config: &ObservabilityConfig) -> Result<Arc<dyn EventPublisher>> {
    match config.backend.trim().to_ascii_lowercase().as_str() {
        "none" | "noop" => Ok(Arc::new(NoopPublisher)),
        "log" => Ok(Arc::new(LogPublisher)),
        "mqtt" => Ok(Arc::new(MqttPublisher::connect(config)?)),
        other => {
            tracing::warn!("Unknown observability backend '{other}', falling back to none");
            Ok(Arc::new(NoopPublisher))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_serializes_with_lowercase_level() {
        let event = TelemetryEvent::new(
            EventLevel::Error,
            vec!["maintenance".into(), "FAILED".into()],
            "Failed to sync time",
        )
        .with_session("s1");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["level"], "error");
        assert_eq!(json["tags"][1], "FAILED");
        assert_eq!(json["session_id"], "s1");
        assert!(Uuid::parse_str(&event.id).is_ok());
    }

    #[test]
    fn memory_publisher_records() {
        let publisher = MemoryPublisher::new();
        publisher.publish(TelemetryEvent::new(EventLevel::Info, vec![], "a"));
        publisher.publish(TelemetryEvent::new(EventLevel::Warning, vec![], "b"));
        let messages: Vec<String> = publisher.events().into_iter().map(|e| e.message).collect();
        assert_eq!(messages, vec!["a", "b"]);
    }

    #[test]
    fn factory_selects_backend() {
        let mut config = ObservabilityConfig::default();
        assert_eq!(create_event_publisher(&config).unwrap().name(), "log");

        config.backend = "none".into();
        assert_eq!(create_event_publisher(&config).unwrap().name(), "none");

        config.backend = "statsd".into();
        assert_eq!(create_event_publisher(&config).unwrap().name(), "none");
    }

    #[test]
    fn log_publisher_accepts_every_level() {
        for level in [EventLevel::Info, EventLevel::Warning, EventLevel::Error] {
            LogPublisher.publish(TelemetryEvent::new(level, vec!["t".into()], "m"));
        }
    }
}

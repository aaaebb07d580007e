// CloudEvents-style envelopes broadcast for observability

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Event type constants emitted by the core subsystems.
pub mod event_types {
    pub const THERMAL_STATUS: &str = "orchard.thermal.status";
    pub const THERMAL_WARNING: &str = "orchard.thermal.warning";
    pub const THERMAL_CRITICAL: &str = "orchard.thermal.critical";

    pub const MODEL_LOADED: &str = "orchard.model.loaded";
    pub const MODEL_UNLOADED: &str = "orchard.model.unloaded";
    pub const MODEL_ERROR: &str = "orchard.model.error";

    pub const BATCH_COMPLETED: &str = "orchard.batch.completed";
}

/// Outbound event envelope.
#[derive(Debug, Clone, Serialize)]
pub struct EventEnvelope {
    pub specversion: String,
    pub id: String,
    pub source: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub time: String,
    pub data: serde_json::Value,
    #[serde(rename = "correlationId", skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

/// Type alias for the event broadcaster.
pub type EventSender = Arc<broadcast::Sender<EventEnvelope>>;

/// Broadcast bus for orchestrator events.
///
/// Purely observational: emitting with no subscribers is a no-op, and every
/// subsystem accepts running without a bus at all.
#[derive(Clone)]
pub struct EventBus {
    tx: EventSender,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx: Arc::new(tx) }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.tx.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Build and broadcast an envelope. Send failures (no receivers) are
    /// ignored.
    pub fn emit(&self, event_type: &str, source: &str, data: serde_json::Value) {
        let envelope = EventEnvelope {
            specversion: "1.0".to_string(),
            id: Uuid::new_v4().to_string(),
            source: source.to_string(),
            event_type: event_type.to_string(),
            time: Utc::now().to_rfc3339(),
            data,
            correlation_id: None,
        };
        let _ = self.tx.send(envelope);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

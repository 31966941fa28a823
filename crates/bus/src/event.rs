use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Dotted event-kind namespace. Kept as constants so subscribers and tests
/// never drift on spelling.
pub mod kinds {
    pub const MOOD_CHANGED: &str = "mood.changed";
    pub const MOOD_CLAMPED: &str = "mood.clamped";
    pub const MESSAGE_RECEIVED: &str = "message.received";
    pub const IMPULSE_TICK: &str = "impulse.tick";
    pub const IMPULSE_FIRED: &str = "impulse.fired";
    pub const PULSE_WRITTEN: &str = "pulse.written";
    pub const HEARTBEAT_COMPLETED: &str = "heartbeat.completed";
    pub const REFLECTION_COMPLETED: &str = "reflection.completed";
    pub const INTEREST_DETECTED: &str = "interest.detected";
    pub const INTEREST_ROUTED: &str = "interest.routed";
    pub const PERFORMANCE_DETECTED: &str = "performance.detected";
    pub const RLUF_FEEDBACK: &str = "rluf.feedback";
    pub const WHATSAPP_SENT: &str = "whatsapp.sent";
    pub const STATE_COMMITTED: &str = "state.committed";
    pub const STATE_ROLLED_BACK: &str = "state.rolled-back";
    pub const MCP_TOOL_CALLED: &str = "mcp.toolCalled";
    pub const MEMORY_INDEXED: &str = "memory.indexed";
    pub const MEMORY_WRITTEN: &str = "memory.written";
    pub const CORRECTION_APPLIED: &str = "correction.applied";
    pub const MEDIA_STORED: &str = "media.stored";
    pub const SEED_VALIDATION_FAILED: &str = "seed.validation-failed";
    pub const SEED_RECOVERED: &str = "seed.recovered";
    pub const SEED_RECOVERY_FAILED: &str = "seed.recovery-failed";
    pub const SEED_RECOVERY_MODE_ENTERED: &str = "seed.recovery-mode-entered";
    pub const SEED_MIGRATED: &str = "seed.migrated";
    pub const SEED_DRIFT_DETECTED: &str = "seed.drift-detected";
    pub const SESSION_GUARD_WARNING: &str = "session.guard_warning";
    pub const COST_BUDGET_EXCEEDED: &str = "cost.budget-exceeded";
}

/// An immutable event record. `id` is strictly increasing within a process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: u64,
    pub kind: String,
    pub ts_ms: i64,
    pub source: String,
    pub payload: Value,
}

impl Event {
    pub fn new(id: u64, kind: &str, source: &str, payload: Value) -> Self {
        Self {
            id,
            kind: kind.to_string(),
            ts_ms: Utc::now().timestamp_millis(),
            source: source.to_string(),
            payload,
        }
    }

    /// String field from the payload, when present.
    pub fn field(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }

    pub fn field_f64(&self, key: &str) -> Option<f64> {
        self.payload.get(key).and_then(Value::as_f64)
    }
}

/// Compact projection kept in the rolling ring and the file journal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventProjection {
    pub id: u64,
    #[serde(rename = "type")]
    pub kind: String,
    pub ts: i64,
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mood: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger: Option<String>,
}

impl From<&Event> for EventProjection {
    fn from(event: &Event) -> Self {
        Self {
            id: event.id,
            kind: event.kind.clone(),
            ts: event.ts_ms,
            source: event.source.clone(),
            channel: event.field("channel").map(str::to_string),
            user: event.field("user").map(str::to_string),
            mood: event.field("label").map(str::to_string),
            trigger: event.field("trigger").map(str::to_string),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn projection_picks_known_fields() {
        let event = Event::new(
            7,
            kinds::MOOD_CHANGED,
            "affect",
            json!({"label": "curious", "trigger": "message", "valence": 0.4}),
        );
        let proj = EventProjection::from(&event);
        assert_eq!(proj.id, 7);
        assert_eq!(proj.kind, "mood.changed");
        assert_eq!(proj.mood.as_deref(), Some("curious"));
        assert_eq!(proj.trigger.as_deref(), Some("message"));
        assert!(proj.channel.is_none());
    }

    #[test]
    fn projection_omits_absent_fields_in_json() {
        let event = Event::new(1, kinds::IMPULSE_FIRED, "impulse", json!({}));
        let line = serde_json::to_string(&EventProjection::from(&event)).unwrap();
        assert!(!line.contains("channel"));
        assert!(!line.contains("mood"));
    }
}

//! Typed events sent from the daemon to the presentation layer.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    StatusUpdate,
    MessageReceived,
    Error,
    ConfigUpdate,
    EdgeUpdate,
    PaneStatusUpdate,
}

/// One event. `details` is free-form; the keys used by each kind are set by
/// the daemon.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DaemonEvent {
    pub kind: EventKind,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub details: Map<String, Value>,
}

impl DaemonEvent {
    pub fn new(kind: EventKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            timestamp: Utc::now(),
            details: Map::new(),
        }
    }

    /// Attach a detail. Values that fail to serialise are stored as `null`.
    pub fn with(mut self, key: &str, value: impl Serialize) -> Self {
        self.details
            .insert(key.to_string(), serde_json::to_value(value).unwrap_or(Value::Null));
        self
    }

    pub fn status(message: impl Into<String>, nodes: usize, sessions: usize) -> Self {
        Self::new(EventKind::StatusUpdate, message)
            .with("nodes", nodes)
            .with("sessions", sessions)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(EventKind::Error, message)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.details.get(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_event_details() {
        let event = DaemonEvent::status("running", 3, 2);
        assert_eq!(event.kind, EventKind::StatusUpdate);
        assert_eq!(event.get("nodes"), Some(&Value::from(3)));
        assert_eq!(event.get("sessions"), Some(&Value::from(2)));
    }

    #[test]
    fn test_event_serialises_kind_in_snake_case() {
        let event = DaemonEvent::new(EventKind::PaneStatusUpdate, "panes").with("main:worker", "idle");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "pane_status_update");
        assert_eq!(json["details"]["main:worker"], "idle");
    }
}

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::detect::DetectionResult;
use crate::registry::SourceState;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Detection,
    Status,
}

impl EventKind {
    fn topic_leaf(self) -> &'static str {
        match self {
            EventKind::Detection => "detections",
            EventKind::Status => "status",
        }
    }
}

/// One outbound event, serialized as-is onto the bus.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub source_id: String,
    pub timestamp_ms: u64,
    pub kind: EventKind,
    pub payload: Value,
}

impl EventRecord {
    pub fn detection(result: &DetectionResult) -> Self {
        Self {
            source_id: result.source_id.clone(),
            timestamp_ms: millis(result.computed_at),
            kind: EventKind::Detection,
            payload: json!({
                "for_sequence": result.for_sequence,
                "detections": result.detections,
            }),
        }
    }

    pub fn status(source_id: &str, status: &StatusChange) -> Self {
        Self {
            source_id: source_id.to_string(),
            timestamp_ms: millis(SystemTime::now()),
            kind: EventKind::Status,
            payload: json!({
                "state": status.state,
                "reconnect_attempt": status.reconnect_attempt,
                "error": status.error,
                "error_secs": status.error_secs,
            }),
        }
    }

    pub fn topic(&self, prefix: &str) -> String {
        format!(
            "{}/sources/{}/{}",
            prefix.trim_end_matches('/'),
            self.source_id,
            self.kind.topic_leaf()
        )
    }

    /// Status topics hold the last known state for late subscribers.
    pub fn retain(&self) -> bool {
        self.kind == EventKind::Status
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        // A Value-backed record always serializes.
        serde_json::to_vec(self).unwrap_or_default()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct StatusChange {
    pub state: SourceState,
    pub reconnect_attempt: u32,
    pub error: Option<String>,
    pub error_secs: Option<u64>,
}

impl StatusChange {
    pub fn new(state: SourceState) -> Self {
        Self {
            state,
            reconnect_attempt: 0,
            error: None,
            error_secs: None,
        }
    }
}

pub(crate) fn millis(at: SystemTime) -> u64 {
    at.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{BoundingBox, Detection};

    #[test]
    fn detection_event_carries_sequence_and_boxes() {
        let result = DetectionResult::new(
            "cam1",
            42,
            vec![Detection::new("car", 0.8, BoundingBox::new(1.0, 2.0, 3.0, 4.0))],
        );
        let event = EventRecord::detection(&result);
        assert_eq!(event.topic("va"), "va/sources/cam1/detections");
        assert!(!event.retain());

        let json: Value = serde_json::from_slice(&event.to_bytes()).unwrap();
        assert_eq!(json["kind"], "detection");
        assert_eq!(json["payload"]["for_sequence"], 42);
        assert_eq!(json["payload"]["detections"][0]["class_label"], "car");
    }

    #[test]
    fn status_event_is_retained() {
        let mut change = StatusChange::new(SourceState::Error);
        change.reconnect_attempt = 3;
        change.error = Some("connection refused".into());
        let event = EventRecord::status("cam2", &change);
        assert_eq!(event.topic("va/"), "va/sources/cam2/status");
        assert!(event.retain());
        assert_eq!(event.payload["state"], "error");
        assert_eq!(event.payload["reconnect_attempt"], 3);
    }
}

// ABOUTME: Wire frames written to stream clients
// ABOUTME: {type, data, timestamp} envelopes rendered as text/event-stream events

use std::time::Duration;

use axum::response::sse::Event;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use table_watcher::{ChangeEvent, TableSet};
use uuid::Uuid;

pub const CONNECTION_ESTABLISHED: &str = "connection_established";
pub const HEARTBEAT: &str = "heartbeat";

/// One client-visible message
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Frame {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: Option<Value>,
    pub timestamp: DateTime<Utc>,
}

impl Frame {
    pub fn connection_established(
        session_id: Uuid,
        tables: TableSet,
        heartbeat_interval: Duration,
    ) -> Self {
        Self {
            kind: CONNECTION_ESTABLISHED.to_string(),
            data: Some(json!({
                "session_id": session_id,
                "tables": tables,
                "heartbeat_interval_secs": heartbeat_interval.as_secs(),
            })),
            timestamp: Utc::now(),
        }
    }

    pub fn heartbeat() -> Self {
        Self {
            kind: HEARTBEAT.to_string(),
            data: None,
            timestamp: Utc::now(),
        }
    }

    pub fn change(event: &ChangeEvent) -> Result<Self, serde_json::Error> {
        Ok(Self {
            kind: event.event_name(),
            data: Some(serde_json::to_value(event)?),
            timestamp: Utc::now(),
        })
    }

    pub fn encode(&self) -> Result<EncodedFrame, serde_json::Error> {
        Ok(EncodedFrame {
            event: self.kind.clone(),
            json: serde_json::to_string(self)?,
        })
    }
}

/// A serialized frame ready for the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedFrame {
    pub event: String,
    pub json: String,
}

impl EncodedFrame {
    pub fn to_sse(&self) -> Event {
        Event::default().event(&self.event).data(&self.json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use table_watcher::{ChangeOperation, TableName};

    #[test]
    fn heartbeat_has_null_data() {
        let encoded = Frame::heartbeat().encode().unwrap();
        assert_eq!(encoded.event, "heartbeat");
        let value: Value = serde_json::from_str(&encoded.json).unwrap();
        assert_eq!(value["type"], "heartbeat");
        assert!(value["data"].is_null());
        assert!(value["timestamp"].as_str().unwrap().contains('T'));
    }

    #[test]
    fn change_frame_carries_both_images() {
        let event = ChangeEvent::new(
            TableName::Students,
            ChangeOperation::Update,
            json!({"id": 1, "status": "graduated"}).as_object().cloned(),
            json!({"id": 1, "status": "active"}).as_object().cloned(),
            Utc::now(),
        )
        .unwrap();
        let frame = Frame::change(&event).unwrap();
        assert_eq!(frame.kind, "students_updated");

        let data = frame.data.unwrap();
        assert_eq!(data["table"], "students");
        assert_eq!(data["operation"], "UPDATE");
        assert_eq!(data["new_record"]["status"], "graduated");
        assert_eq!(data["old_record"]["status"], "active");
    }

    #[test]
    fn connection_frame_lists_tables() {
        let tables: TableSet = "courses,students".parse().unwrap();
        let frame =
            Frame::connection_established(Uuid::new_v4(), tables, Duration::from_secs(25));
        let data = frame.data.unwrap();
        assert_eq!(data["tables"], json!(["students", "courses"]));
        assert_eq!(data["heartbeat_interval_secs"], 25);
    }
}

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::Document;

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum NexusRequest {
    Ping,
    Health,
    Ingest {
        documents: Vec<Document>,
        note: Option<String>,
    },
    Ask {
        question: String,
        #[serde(default)]
        attachments: Vec<Document>,
    },
    Report,
    Timeline,
    Insights,
    RefreshInsights,
    Conversation,
    RemoveRecords {
        ids: Vec<Uuid>,
    },
    Reset {
        subject: Option<String>,
    },
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct NexusResponse {
    pub status: String,
    pub data: Option<serde_json::Value>,
    pub error: Option<String>,
    pub version: String,
}

impl NexusResponse {
    pub fn ok(data: serde_json::Value) -> Self {
        Self {
            status: "ok".to_string(),
            data: Some(data),
            error: None,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    pub fn err(msg: impl Into<String>) -> Self {
        Self {
            status: "error".to_string(),
            data: None,
            error: Some(msg.into()),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    pub fn pong() -> Self {
        Self::ok(serde_json::json!({"pong": true}))
    }

    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_is_tagged_by_action() {
        let json = serde_json::json!({
            "action": "ingest",
            "documents": [{"type": "text", "text": "2023-5-1 入院"}],
            "note": null
        });
        let request: NexusRequest = serde_json::from_value(json).unwrap();
        match request {
            NexusRequest::Ingest { documents, note } => {
                assert_eq!(documents, vec![Document::text("2023-5-1 入院")]);
                assert!(note.is_none());
            }
            other => panic!("Expected Ingest, got {:?}", other),
        }

        let ask: NexusRequest =
            serde_json::from_value(serde_json::json!({"action": "ask", "question": "q"})).unwrap();
        assert!(matches!(ask, NexusRequest::Ask { ref attachments, .. } if attachments.is_empty()));
    }

    #[test]
    fn test_msgpack_frame_round_trip() {
        let request = NexusRequest::RemoveRecords { ids: vec![Uuid::new_v4()] };
        let bytes = rmp_serde::to_vec_named(&request).unwrap();
        let back: NexusRequest = rmp_serde::from_slice(&bytes).unwrap();
        assert!(matches!(back, NexusRequest::RemoveRecords { ids } if ids.len() == 1));
    }

    #[test]
    fn test_error_response_shape() {
        let response = NexusResponse::err("boom");
        assert!(!response.is_ok());
        assert_eq!(response.error.as_deref(), Some("boom"));
        assert!(response.data.is_none());
        assert!(NexusResponse::pong().is_ok());
    }
}

use nexus_core::ipc::{NexusRequest, NexusResponse};
use nexus_core::Session;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

/// Dispatch one IPC request against the session.
pub async fn handle_request(request: NexusRequest, session: &Session) -> NexusResponse {
    match request {
        NexusRequest::Ping => NexusResponse::pong(),
        NexusRequest::Health => NexusResponse::ok(serde_json::json!({
            "status": "healthy",
            "records": session.records().len(),
            "generation": session.generation(),
        })),
        NexusRequest::Ingest { documents, note } => {
            match session
                .ingest(&documents, note.as_deref(), &CancellationToken::new())
                .await
            {
                Ok(outcome) => to_data(&outcome),
                Err(e) => NexusResponse::err(e.to_string()),
            }
        }
        NexusRequest::Ask {
            question,
            attachments,
        } => match session
            .ask(&question, &attachments, &CancellationToken::new())
            .await
        {
            Ok(turn) => to_data(&turn),
            Err(e) => NexusResponse::err(e.to_string()),
        },
        NexusRequest::Report => NexusResponse::ok(serde_json::json!({ "report": session.report() })),
        NexusRequest::Timeline => to_data(&session.timeline()),
        NexusRequest::Insights => to_data(&session.insights()),
        NexusRequest::RefreshInsights => {
            let outcome = session.refresh_insights().await;
            NexusResponse::ok(serde_json::json!({
                "refresh": outcome,
                "insights": session.insights(),
            }))
        }
        NexusRequest::Conversation => to_data(&session.conversation()),
        NexusRequest::RemoveRecords { ids } => {
            let removed = session.remove_records(&ids);
            NexusResponse::ok(serde_json::json!({ "removed": removed }))
        }
        NexusRequest::Reset { subject } => {
            session.reset(subject.as_deref());
            to_data(&session.snapshot())
        }
    }
}

fn to_data<T: Serialize>(value: &T) -> NexusResponse {
    match serde_json::to_value(value) {
        Ok(data) => NexusResponse::ok(data),
        Err(e) => NexusResponse::err(format!("Serialization error: {}", e)),
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    /// Assistant turn still receiving content.
    Streaming,
    Complete,
    /// The stream broke off; content holds what arrived plus a notice.
    Partial,
    /// The call failed; content is a failure notice.
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationTurn {
    pub id: Uuid,
    pub role: TurnRole,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub status: TurnStatus,
}

impl ConversationTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            role: TurnRole::User,
            content: content.into(),
            created_at: Utc::now(),
            status: TurnStatus::Complete,
        }
    }

    /// Empty assistant turn, filled in place as the reply arrives.
    pub fn pending_assistant() -> Self {
        Self {
            id: Uuid::new_v4(),
            role: TurnRole::Assistant,
            content: String::new(),
            created_at: Utc::now(),
            status: TurnStatus::Streaming,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            status: TurnStatus::Complete,
            content: content.into(),
            ..Self::pending_assistant()
        }
    }
}

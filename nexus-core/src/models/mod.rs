pub mod conversation;
pub mod document;
pub mod insight;
pub mod record;

pub use conversation::{ConversationTurn, TurnRole, TurnStatus};
pub use document::Document;
pub use insight::{rank_insights, Insight, InsightKind, InsightSet, InsightStatus};
pub use record::{sort_newest_first, ClinicalRecord, RecordKind};

pub mod chat;
pub mod config;
pub mod engine;
pub mod error;
pub mod extraction;
pub mod insight;
pub mod ipc;
pub mod models;
pub mod prompts;
pub mod session;
pub mod stream;
pub mod timeline;

#[cfg(test)]
pub(crate) mod testing;

pub use chat::ContextAssembler;
pub use config::NexusConfig;
pub use engine::{
    ArkClient, ArkConfig, ContentPart, EngineError, EngineRequest, Message, ModelTier,
    ReasoningEngine, Role, TextStream,
};
pub use error::{FailureKind, NexusError};
pub use extraction::ExtractionOrchestrator;
pub use insight::{parse_insights, InsightGenerator};
pub use ipc::{NexusRequest, NexusResponse};
pub use session::{
    IngestOutcome, InsightRefresh, Session, SessionSettings, SessionSnapshot, REPORT_SEPARATOR,
};
pub use stream::{collect_stream, DeltaSink, StreamOutcome};
pub use timeline::{HeuristicExtractor, RecordExtractor};

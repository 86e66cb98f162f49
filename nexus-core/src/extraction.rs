//! Extraction orchestration: normalized documents → report text
//!
//! One outbound call per extraction, buffered or streamed. Nothing here
//! touches session state; a failed or truncated extraction only produces an
//! error (carrying any streamed text for display).

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::IngestConfig;
use crate::engine::{ContentPart, EngineError, EngineRequest, Message, ModelTier, ReasoningEngine};
use crate::error::NexusError;
use crate::models::Document;
use crate::prompts;
use crate::stream::{collect_stream, DeltaSink, StreamOutcome};

pub struct ExtractionOrchestrator {
    engine: Arc<dyn ReasoningEngine>,
    instruction: String,
    limits: IngestConfig,
}

impl ExtractionOrchestrator {
    pub fn new(engine: Arc<dyn ReasoningEngine>, limits: IngestConfig) -> Self {
        Self {
            engine,
            instruction: prompts::PARSER_INSTRUCTION.to_string(),
            limits,
        }
    }

    /// Replace the parser instruction profile.
    pub fn with_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.instruction = instruction.into();
        self
    }

    /// Validate the documents and lay out the request: instruction, caller
    /// note, each text document under a content header, then each image.
    pub fn build_request(
        &self,
        documents: &[Document],
        note: Option<&str>,
    ) -> Result<EngineRequest, NexusError> {
        self.validate(documents)?;

        let note = note
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .unwrap_or(prompts::DEFAULT_PARSE_PROMPT);

        let mut parts = vec![ContentPart::text(note)];
        parts.extend(
            documents
                .iter()
                .filter(|d| !d.is_blank())
                .filter_map(|d| match d {
                    Document::Text { text } => Some(ContentPart::text(format!(
                        "{}\n{}",
                        prompts::RECORD_CONTENT_HEADER,
                        text
                    ))),
                    Document::Image { .. } => None,
                }),
        );
        parts.extend(
            documents
                .iter()
                .filter(|d| matches!(d, Document::Image { .. }) && !d.is_blank())
                .map(ContentPart::from),
        );

        Ok(EngineRequest {
            tier: ModelTier::Vision,
            messages: vec![Message::system(self.instruction.as_str()), Message::user(parts)],
        })
    }

    fn validate(&self, documents: &[Document]) -> Result<(), NexusError> {
        if documents.iter().all(Document::is_blank) {
            return Err(NexusError::InvalidInput(
                "at least one document or text block is required".into(),
            ));
        }

        for (index, doc) in documents.iter().enumerate() {
            let (limit, what) = match doc {
                Document::Text { .. } => (self.limits.max_text_bytes, "text"),
                Document::Image { .. } => (self.limits.max_image_bytes, "image"),
            };
            if doc.payload_len() > limit {
                return Err(NexusError::InvalidInput(format!(
                    "{} document {} is {} bytes, over the {} byte budget",
                    what,
                    index,
                    doc.payload_len(),
                    limit
                )));
            }
        }
        Ok(())
    }

    /// Buffered extraction: one call, whole report.
    pub async fn extract(
        &self,
        documents: &[Document],
        note: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<String, NexusError> {
        let request = self.build_request(documents, note)?;

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(EngineError::Aborted),
            result = self.engine.complete(&request) => result,
        };

        match result {
            Ok(report) => self.accept(report),
            Err(e) => Err(self.fail(e, None)),
        }
    }

    /// Streamed extraction: deltas go to `sink` in arrival order while the
    /// full report is reconstructed.
    pub async fn extract_streaming(
        &self,
        documents: &[Document],
        note: Option<&str>,
        sink: &mut dyn DeltaSink,
        cancel: &CancellationToken,
    ) -> Result<String, NexusError> {
        let request = self.build_request(documents, note)?;

        let stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(EngineError::Aborted),
            stream = self.engine.stream(&request) => stream,
        };
        let stream = stream.map_err(|e| self.fail(e, None))?;

        match collect_stream(stream, sink, cancel).await {
            StreamOutcome::Complete(report) => self.accept(report),
            StreamOutcome::Failed { error, partial } => Err(self.fail(error, Some(partial))),
            StreamOutcome::Aborted { partial } => {
                Err(self.fail(EngineError::Aborted, Some(partial)))
            }
        }
    }

    fn accept(&self, report: String) -> Result<String, NexusError> {
        if report.trim().is_empty() {
            return Err(self.fail(
                EngineError::MalformedResponse("engine returned an empty report".into()),
                None,
            ));
        }
        tracing::info!(
            engine = self.engine.name(),
            chars = report.chars().count(),
            "Extraction complete"
        );
        Ok(report)
    }

    fn fail(&self, error: EngineError, partial: Option<String>) -> NexusError {
        match &error {
            EngineError::Aborted => tracing::info!("Extraction aborted"),
            _ => tracing::error!(
                engine = self.engine.name(),
                error = %error,
                "Extraction failed"
            ),
        }
        NexusError::extraction(error, partial)
    }
}

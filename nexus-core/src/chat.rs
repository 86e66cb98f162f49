//! Conversational context assembly
//!
//! Each question is answered against a freshly built prompt: the reasoner
//! instruction, the current report (or the serialized records when there is
//! no report yet) and the literal question. Prior turns are never sent.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::engine::{ContentPart, EngineError, EngineRequest, Message, ModelTier, ReasoningEngine};
use crate::models::{ClinicalRecord, Document};
use crate::prompts;
use crate::stream::{collect_stream, DeltaSink, StreamOutcome};

pub struct ContextAssembler {
    engine: Arc<dyn ReasoningEngine>,
    instruction: String,
}

impl ContextAssembler {
    pub fn new(engine: Arc<dyn ReasoningEngine>) -> Self {
        Self {
            engine,
            instruction: prompts::REASONER_INSTRUCTION.to_string(),
        }
    }

    pub fn with_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.instruction = instruction.into();
        self
    }

    /// The grounding block: the report when there is one, else the records.
    pub fn context(report: &str, records: &[ClinicalRecord]) -> String {
        if report.trim().is_empty() {
            serde_json::to_string(records).unwrap_or_else(|_| "[]".to_string())
        } else {
            report.to_string()
        }
    }

    pub fn build_request(
        &self,
        question: &str,
        attachments: &[Document],
        report: &str,
        records: &[ClinicalRecord],
    ) -> EngineRequest {
        let context = Self::context(report, records);
        let mut parts = vec![ContentPart::text(prompts::question_prompt(&context, question.trim()))];
        parts.extend(
            attachments
                .iter()
                .filter(|d| matches!(d, Document::Image { .. }) && !d.is_blank())
                .map(ContentPart::from),
        );

        EngineRequest {
            tier: ModelTier::Reasoning,
            messages: vec![Message::system(self.instruction.as_str()), Message::user(parts)],
        }
    }

    pub async fn answer(
        &self,
        request: &EngineRequest,
        cancel: &CancellationToken,
    ) -> Result<String, EngineError> {
        let answer = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(EngineError::Aborted),
            answer = self.engine.complete(request) => answer,
        };
        let answer = answer?;
        if answer.trim().is_empty() {
            return Err(EngineError::MalformedResponse("empty answer".into()));
        }
        Ok(answer)
    }

    pub async fn answer_streaming(
        &self,
        request: &EngineRequest,
        sink: &mut dyn DeltaSink,
        cancel: &CancellationToken,
    ) -> StreamOutcome {
        let stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(EngineError::Aborted),
            stream = self.engine.stream(request) => stream,
        };
        match stream {
            Ok(stream) => collect_stream(stream, sink, cancel).await,
            Err(EngineError::Aborted) => StreamOutcome::Aborted {
                partial: String::new(),
            },
            Err(error) => StreamOutcome::Failed {
                error,
                partial: String::new(),
            },
        }
    }
}

/// Assistant turn content for a failed question.
pub fn failure_notice(error: &EngineError) -> String {
    format!("{}: {}", prompts::CHAT_FAILURE_NOTICE, error)
}

/// Assistant turn content for an answer that broke off mid-stream.
pub fn mark_partial(partial: &str) -> String {
    format!("{}\n\n{}", partial.trim_end(), prompts::PARTIAL_ANSWER_MARKER)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RecordKind;
    use crate::testing::{Reply, ScriptedEngine};

    fn assembler(replies: Vec<Reply>) -> (Arc<ScriptedEngine>, ContextAssembler) {
        let engine = Arc::new(ScriptedEngine::new(replies));
        (engine.clone(), ContextAssembler::new(engine))
    }

    #[test]
    fn test_report_takes_precedence_over_records() {
        let records = vec![ClinicalRecord::new(RecordKind::Condition, "2023-5-1", "入院")];
        assert_eq!(ContextAssembler::context("报告正文", &records), "报告正文");

        let fallback = ContextAssembler::context("  ", &records);
        let parsed: Vec<ClinicalRecord> = serde_json::from_str(&fallback).unwrap();
        assert_eq!(parsed, records);
    }

    #[test]
    fn test_request_carries_instruction_context_and_question() {
        let (_, chat) = assembler(vec![]);
        let request = chat.build_request(
            " 血糖趋势如何？ ",
            &[Document::image("image/png", "AAAA"), Document::text("ignored")],
            "空腹血糖 7.8",
            &[],
        );

        assert_eq!(request.tier, ModelTier::Reasoning);
        assert_eq!(
            request.messages[0].parts,
            vec![ContentPart::text(prompts::REASONER_INSTRUCTION)]
        );
        let user = &request.messages[1].parts;
        assert_eq!(
            user[0],
            ContentPart::text("上下文报告：\n空腹血糖 7.8\n\n问题：血糖趋势如何？")
        );
        assert_eq!(user.len(), 2);
        assert_eq!(request.image_count(), 1);
    }

    #[tokio::test]
    async fn test_answer_returns_engine_text() {
        let (engine, chat) = assembler(vec![Reply::text("血糖控制欠佳")]);
        let request = chat.build_request("q", &[], "r", &[]);

        let answer = chat.answer(&request, &CancellationToken::new()).await.unwrap();
        assert_eq!(answer, "血糖控制欠佳");
        assert_eq!(engine.call_count(), 1);
    }

    #[tokio::test]
    async fn test_streamed_answer_failure_keeps_partial() {
        let (_, chat) = assembler(vec![Reply::ChunksThenCut(vec!["血糖".into()])]);
        let request = chat.build_request("q", &[], "r", &[]);
        let mut sink = |_: &str| {};

        match chat.answer_streaming(&request, &mut sink, &CancellationToken::new()).await {
            StreamOutcome::Failed { partial, .. } => assert_eq!(partial, "血糖"),
            other => panic!("Expected Failed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stream_setup_failure_is_failed_outcome() {
        let (_, chat) = assembler(vec![Reply::Fail(EngineError::MissingApiKey)]);
        let request = chat.build_request("q", &[], "r", &[]);
        let mut sink = |_: &str| {};

        let outcome = chat.answer_streaming(&request, &mut sink, &CancellationToken::new()).await;
        assert!(matches!(
            outcome,
            StreamOutcome::Failed { error: EngineError::MissingApiKey, .. }
        ));
    }

    #[test]
    fn test_notice_formats() {
        let notice = failure_notice(&EngineError::Timeout { secs: 5 });
        assert!(notice.starts_with("智能助理暂时无法回答: "));
        assert!(mark_partial("前半段 ").starts_with("前半段\n\n"));
    }
}

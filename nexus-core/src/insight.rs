//! Insight generation: accumulated records → ranked, cross-referenced insights
//!
//! One reasoning call per regeneration, constrained to a JSON array. Failure
//! never propagates: it is logged and reported through the set's status.

use std::sync::Arc;

use crate::engine::{ContentPart, EngineError, EngineRequest, Message, ModelTier, ReasoningEngine};
use crate::models::{rank_insights, ClinicalRecord, Insight, InsightSet, InsightStatus};
use crate::prompts;

pub struct InsightGenerator {
    engine: Arc<dyn ReasoningEngine>,
}

impl InsightGenerator {
    pub fn new(engine: Arc<dyn ReasoningEngine>) -> Self {
        Self { engine }
    }

    pub fn build_request(&self, records: &[ClinicalRecord]) -> EngineRequest {
        let history = serde_json::to_string(records).unwrap_or_else(|_| "[]".to_string());
        EngineRequest {
            tier: ModelTier::Reasoning,
            messages: vec![
                Message::system(prompts::ANALYST_INSTRUCTION),
                Message::user(vec![ContentPart::text(prompts::insight_prompt(&history))]),
            ],
        }
    }

    /// Regenerate the insight set for the records at `generation`.
    ///
    /// No records means no call and an `Empty` set.
    pub async fn generate(&self, records: &[ClinicalRecord], generation: u64) -> InsightSet {
        if records.is_empty() {
            return InsightSet::empty();
        }

        let request = self.build_request(records);
        let result = match self.engine.complete(&request).await {
            Ok(raw) => parse_insights(&raw),
            Err(e) => Err(e),
        };

        match result {
            Ok(mut insights) => {
                rank_insights(&mut insights);
                tracing::info!(
                    generation = generation,
                    insights = insights.len(),
                    records = records.len(),
                    "Insights regenerated"
                );
                InsightSet {
                    insights,
                    status: InsightStatus::Ready { generation },
                }
            }
            Err(e) => {
                tracing::warn!(
                    generation = generation,
                    engine = self.engine.name(),
                    error = %e,
                    "Insight generation failed, showing none"
                );
                InsightSet {
                    insights: Vec::new(),
                    status: InsightStatus::Unavailable {
                        kind: e.kind(),
                        reason: e.to_string(),
                    },
                }
            }
        }
    }
}

/// Parse an engine answer into insights.
///
/// Accepts a bare array, a fenced block, or an array wrapped in commentary.
/// Anything else (invalid JSON, a non-array, an element missing a required
/// field) is a malformed response.
pub fn parse_insights(raw: &str) -> Result<Vec<Insight>, EngineError> {
    let body = strip_fences(raw);

    let value = match serde_json::from_str::<serde_json::Value>(body) {
        Ok(value) => value,
        Err(first) => embedded_array(body)
            .ok_or_else(|| EngineError::MalformedResponse(first.to_string()))?,
    };
    if !value.is_array() {
        return Err(EngineError::MalformedResponse(format!(
            "expected a JSON array, got {}",
            json_type(&value)
        )));
    }
    serde_json::from_value(value).map_err(|e| EngineError::MalformedResponse(e.to_string()))
}

fn strip_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the info string (`json`) on the opening fence line.
    let rest = rest.split_once('\n').map(|(_, body)| body).unwrap_or("");
    rest.trim_end().trim_end_matches("```").trim()
}

/// First array in surrounding commentary that looks like an insight list:
/// empty, or made of objects. Brackets in the prose itself (`[1]`) are skipped.
fn embedded_array(text: &str) -> Option<serde_json::Value> {
    text.match_indices('[').find_map(|(start, _)| {
        let mut values = serde_json::Deserializer::from_str(&text[start..]).into_iter::<serde_json::Value>();
        match values.next()? {
            Ok(serde_json::Value::Array(items)) if items.iter().all(serde_json::Value::is_object) => {
                Some(serde_json::Value::Array(items))
            }
            _ => None,
        }
    })
}

fn json_type(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}

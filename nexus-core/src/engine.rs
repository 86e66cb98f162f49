//! Reasoning engine client: the one outbound dependency of the pipeline
//!
//! Provides a `ReasoningEngine` trait with:
//! - **Buffered** calls returning the whole answer at once
//! - **Streaming** calls returning an ordered `TextStream` of deltas
//!
//! `ArkClient` implements it against an OpenAI-compatible chat completions
//! endpoint (Volcengine Ark). Images travel as base64 data URLs.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::EngineConfig;
use crate::error::FailureKind;
use crate::models::Document;
use crate::stream::decode_event_stream;

/// Ordered text deltas of one streamed answer.
pub type TextStream = Pin<Box<dyn Stream<Item = Result<String, EngineError>> + Send>>;

// ============================================================================
// Request model
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    Image { media_type: String, data: String },
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }
}

impl From<&Document> for ContentPart {
    fn from(doc: &Document) -> Self {
        match doc {
            Document::Text { text } => Self::Text { text: text.clone() },
            Document::Image { media_type, data } => Self::Image {
                media_type: media_type.clone(),
                data: data.clone(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub parts: Vec<ContentPart>,
}

impl Message {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            parts: vec![ContentPart::text(text)],
        }
    }

    pub fn user(parts: Vec<ContentPart>) -> Self {
        Self {
            role: Role::User,
            parts,
        }
    }
}

/// Which configured model a request should run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelTier {
    /// Document extraction; must accept image parts.
    Vision,
    /// Insights and conversation.
    Reasoning,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineRequest {
    pub tier: ModelTier,
    pub messages: Vec<Message>,
}

impl EngineRequest {
    /// Concatenated text of every part, for logging and test assertions.
    pub fn text(&self) -> String {
        self.messages
            .iter()
            .flat_map(|m| m.parts.iter())
            .filter_map(|p| match p {
                ContentPart::Text { text } => Some(text.as_str()),
                ContentPart::Image { .. } => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn image_count(&self) -> usize {
        self.messages
            .iter()
            .flat_map(|m| m.parts.iter())
            .filter(|p| matches!(p, ContentPart::Image { .. }))
            .count()
    }
}

// ============================================================================
// ReasoningEngine trait
// ============================================================================

/// Abstraction over the external reasoning engine.
#[async_trait]
pub trait ReasoningEngine: Send + Sync {
    /// Run the request and return the complete answer text.
    async fn complete(&self, request: &EngineRequest) -> Result<String, EngineError>;

    /// Run the request and return the answer as ordered deltas. The stream
    /// yields `Err(StreamInterrupted)` if it ends without the completion sentinel.
    async fn stream(&self, request: &EngineRequest) -> Result<TextStream, EngineError>;

    /// Backend name for logging.
    fn name(&self) -> &str;
}

// ============================================================================
// Error types
// ============================================================================

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({code}): {message}")]
    Api { code: u16, message: String },

    #[error("Request timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("Missing API key")]
    MissingApiKey,

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("Stream ended before completion after {received} chunks")]
    StreamInterrupted { received: usize },

    #[error("Request aborted")]
    Aborted,
}

impl EngineError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Http(_) | Self::Api { .. } | Self::Timeout { .. } | Self::MissingApiKey => {
                FailureKind::TransportError
            }
            Self::MalformedResponse(_) => FailureKind::MalformedResponse,
            Self::StreamInterrupted { .. } => FailureKind::StreamInterrupted,
            Self::Aborted => FailureKind::Aborted,
        }
    }

    fn transport(error: reqwest::Error, timeout_secs: u64) -> Self {
        if error.is_timeout() {
            Self::Timeout { secs: timeout_secs }
        } else {
            Self::Http(error)
        }
    }
}

// ============================================================================
// Config types
// ============================================================================

/// Ark client configuration
#[derive(Debug, Clone)]
pub struct ArkConfig {
    pub api_key: String,
    pub base_url: String,
    pub vision_model: String,
    pub reasoning_model: String,
    pub temperature: f32,
    pub timeout_secs: u64,
}

impl ArkConfig {
    pub fn from_config(engine: &EngineConfig, api_key: Option<String>) -> Self {
        Self {
            api_key: api_key.unwrap_or_default(),
            base_url: engine.base_url.trim_end_matches('/').to_string(),
            vision_model: engine.vision_model.clone(),
            reasoning_model: engine.reasoning_model.clone(),
            temperature: engine.temperature,
            timeout_secs: engine.request_timeout_secs,
        }
    }

    fn model(&self, tier: ModelTier) -> &str {
        match tier {
            ModelTier::Vision => &self.vision_model,
            ModelTier::Reasoning => &self.reasoning_model,
        }
    }
}

// ============================================================================
// Chat completions wire structs (private)
// ============================================================================

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    temperature: f32,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct WireMessage<'a> {
    role: Role,
    content: WireContent<'a>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum WireContent<'a> {
    Text(&'a str),
    Parts(Vec<WirePart<'a>>),
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WirePart<'a> {
    Text { text: &'a str },
    ImageUrl { image_url: WireImageUrl },
}

#[derive(Debug, Serialize)]
struct WireImageUrl {
    url: String,
}

impl<'a> From<&'a Message> for WireMessage<'a> {
    fn from(message: &'a Message) -> Self {
        let content = match message.parts.as_slice() {
            [ContentPart::Text { text }] => WireContent::Text(text),
            parts => WireContent::Parts(
                parts
                    .iter()
                    .map(|p| match p {
                        ContentPart::Text { text } => WirePart::Text { text },
                        ContentPart::Image { media_type, data } => WirePart::ImageUrl {
                            image_url: WireImageUrl {
                                url: format!("data:{};base64,{}", media_type, data),
                            },
                        },
                    })
                    .collect(),
            ),
        };
        Self {
            role: message.role,
            content,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: Option<ApiErrorDetail>,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: Option<String>,
}

// ============================================================================
// ArkClient
// ============================================================================

/// Chat-completions client for an OpenAI-compatible endpoint.
#[derive(Debug, Clone)]
pub struct ArkClient {
    client: Client,
    config: ArkConfig,
}

impl ArkClient {
    pub fn new(config: ArkConfig) -> Result<Self, EngineError> {
        if config.api_key.is_empty() {
            return Err(EngineError::MissingApiKey);
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self { client, config })
    }

    pub fn config(&self) -> &ArkConfig {
        &self.config
    }

    async fn send(
        &self,
        request: &EngineRequest,
        stream: bool,
    ) -> Result<reqwest::Response, EngineError> {
        let url = format!("{}/chat/completions", self.config.base_url);
        let model = self.config.model(request.tier);

        let body = ChatRequest {
            model,
            messages: request.messages.iter().map(WireMessage::from).collect(),
            temperature: self.config.temperature,
            stream,
        };

        tracing::debug!(
            model = model,
            stream = stream,
            images = request.image_count(),
            "Sending reasoning request"
        );

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| EngineError::transport(e, self.config.timeout_secs))?;

        let status = response.status();

        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ApiErrorResponse>(&error_body)
                .ok()
                .and_then(|e| e.error.and_then(|d| d.message).or(e.message))
                .unwrap_or(error_body);

            tracing::error!(code = status.as_u16(), message = %message, "Reasoning engine API error");

            return Err(EngineError::Api {
                code: status.as_u16(),
                message,
            });
        }

        Ok(response)
    }
}

#[async_trait]
impl ReasoningEngine for ArkClient {
    async fn complete(&self, request: &EngineRequest) -> Result<String, EngineError> {
        let response = self.send(request, false).await?;
        let body = response
            .text()
            .await
            .map_err(|e| EngineError::transport(e, self.config.timeout_secs))?;

        let parsed: ChatResponse = serde_json::from_str(&body)
            .map_err(|e| EngineError::MalformedResponse(e.to_string()))?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| EngineError::MalformedResponse("response has no message content".into()))
    }

    async fn stream(&self, request: &EngineRequest) -> Result<TextStream, EngineError> {
        let response = self.send(request, true).await?;
        let timeout_secs = self.config.timeout_secs;
        let bytes = response
            .bytes_stream()
            .map(move |chunk| chunk.map_err(|e| EngineError::transport(e, timeout_secs)));
        Ok(decode_event_stream(bytes))
    }

    fn name(&self) -> &str {
        "ark"
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{collect_stream, StreamOutcome};
    use tokio_util::sync::CancellationToken;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config(api_key: &str, base_url: &str) -> ArkConfig {
        ArkConfig {
            api_key: api_key.to_string(),
            base_url: base_url.to_string(),
            vision_model: "vision-pro".to_string(),
            reasoning_model: "pro-32k".to_string(),
            temperature: 0.1,
            timeout_secs: 5,
        }
    }

    fn completion(content: &str) -> serde_json::Value {
        serde_json::json!({
            "choices": [{ "index": 0, "message": { "role": "assistant", "content": content } }]
        })
    }

    fn text_request(tier: ModelTier) -> EngineRequest {
        EngineRequest {
            tier,
            messages: vec![
                Message::system("instruction"),
                Message::user(vec![ContentPart::text("hello")]),
            ],
        }
    }

    #[tokio::test]
    async fn test_complete_posts_chat_request_and_returns_content() {
        let mock_server = MockServer::start().await;
        let client = ArkClient::new(test_config("test-key", &mock_server.uri())).unwrap();

        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer test-key"))
            .and(body_partial_json(serde_json::json!({
                "model": "pro-32k",
                "stream": false,
                "messages": [
                    { "role": "system", "content": "instruction" },
                    { "role": "user", "content": "hello" }
                ]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion("report text")))
            .mount(&mock_server)
            .await;

        let result = client.complete(&text_request(ModelTier::Reasoning)).await;
        assert_eq!(result.unwrap(), "report text");
    }

    #[tokio::test]
    async fn test_images_are_sent_as_data_urls_on_vision_model() {
        let mock_server = MockServer::start().await;
        let client = ArkClient::new(test_config("test-key", &mock_server.uri())).unwrap();

        Mock::given(method("POST"))
            .and(body_partial_json(serde_json::json!({
                "model": "vision-pro",
                "messages": [{
                    "role": "user",
                    "content": [
                        { "type": "text", "text": "parse" },
                        { "type": "image_url", "image_url": { "url": "data:image/png;base64,AAAA" } }
                    ]
                }]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion("ok")))
            .mount(&mock_server)
            .await;

        let request = EngineRequest {
            tier: ModelTier::Vision,
            messages: vec![Message::user(vec![
                ContentPart::text("parse"),
                ContentPart::Image {
                    media_type: "image/png".into(),
                    data: "AAAA".into(),
                },
            ])],
        };
        assert_eq!(request.image_count(), 1);

        let result = client.complete(&request).await;
        assert!(result.is_ok(), "Expected Ok, got {:?}", result.err());
    }

    #[tokio::test]
    async fn test_api_error_surfaces_status_and_message() {
        let mock_server = MockServer::start().await;
        let client = ArkClient::new(test_config("test-key", &mock_server.uri())).unwrap();

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_json(serde_json::json!({
                "error": { "code": "AuthenticationError", "message": "invalid api key" }
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        match client.complete(&text_request(ModelTier::Reasoning)).await {
            Err(EngineError::Api { code, message }) => {
                assert_eq!(code, 401);
                assert_eq!(message, "invalid api key");
            }
            other => panic!("Expected Api error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_content_is_malformed_response() {
        let mock_server = MockServer::start().await;
        let client = ArkClient::new(test_config("test-key", &mock_server.uri())).unwrap();

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "choices": [] })))
            .mount(&mock_server)
            .await;

        let err = client.complete(&text_request(ModelTier::Reasoning)).await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::MalformedResponse);
    }

    #[tokio::test]
    async fn test_non_json_body_is_malformed_response() {
        let mock_server = MockServer::start().await;
        let client = ArkClient::new(test_config("test-key", &mock_server.uri())).unwrap();

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>gateway</html>"))
            .mount(&mock_server)
            .await;

        let err = client.complete(&text_request(ModelTier::Reasoning)).await.unwrap_err();
        assert!(matches!(err, EngineError::MalformedResponse(_)));
    }

    #[tokio::test]
    async fn test_stream_decodes_event_stream_body() {
        let mock_server = MockServer::start().await;
        let client = ArkClient::new(test_config("test-key", &mock_server.uri())).unwrap();

        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"20\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"23年\"}}]}\n\n",
            "data: {broken\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"入院\"}}]}\n\n",
            "data: [DONE]\n\n",
        );

        Mock::given(method("POST"))
            .and(body_partial_json(serde_json::json!({ "stream": true })))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(body),
            )
            .mount(&mock_server)
            .await;

        let stream = client.stream(&text_request(ModelTier::Reasoning)).await.unwrap();
        let mut seen = Vec::new();
        let mut sink = |d: &str| seen.push(d.to_string());
        let outcome = collect_stream(stream, &mut sink, &CancellationToken::new()).await;

        match outcome {
            StreamOutcome::Complete(text) => assert_eq!(text, "2023年入院"),
            other => panic!("Expected Complete, got {:?}", other),
        }
        assert_eq!(seen, vec!["20", "23年", "入院"]);
    }

    #[tokio::test]
    async fn test_stream_without_sentinel_is_interrupted() {
        let mock_server = MockServer::start().await;
        let client = ArkClient::new(test_config("test-key", &mock_server.uri())).unwrap();

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "data: {\"choices\":[{\"delta\":{\"content\":\"partial\"}}]}\n\n",
            ))
            .mount(&mock_server)
            .await;

        let stream = client.stream(&text_request(ModelTier::Reasoning)).await.unwrap();
        let mut sink = |_: &str| {};
        match collect_stream(stream, &mut sink, &CancellationToken::new()).await {
            StreamOutcome::Failed { error, partial } => {
                assert_eq!(error.kind(), FailureKind::StreamInterrupted);
                assert_eq!(partial, "partial");
            }
            other => panic!("Expected Failed, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_api_key_is_rejected() {
        let result = ArkClient::new(test_config("", "http://localhost:1"));
        assert!(matches!(result, Err(EngineError::MissingApiKey)));
    }

    #[test]
    fn test_from_config_trims_trailing_slash() {
        let engine = EngineConfig {
            base_url: "https://ark.example.com/api/v3/".into(),
            vision_model: "v".into(),
            reasoning_model: "r".into(),
            api_key_env: "ARK_API_KEY".into(),
            temperature: 0.2,
            request_timeout_secs: 30,
        };
        let config = ArkConfig::from_config(&engine, Some("k".into()));
        assert_eq!(config.base_url, "https://ark.example.com/api/v3");
        assert_eq!(config.model(ModelTier::Vision), "v");
        assert_eq!(config.model(ModelTier::Reasoning), "r");
    }

    #[test]
    fn test_error_kinds_map_to_taxonomy() {
        assert_eq!(
            EngineError::Timeout { secs: 1 }.kind(),
            FailureKind::TransportError
        );
        assert_eq!(
            EngineError::Api { code: 500, message: "x".into() }.kind(),
            FailureKind::TransportError
        );
        assert_eq!(
            EngineError::StreamInterrupted { received: 0 }.kind(),
            FailureKind::StreamInterrupted
        );
        assert_eq!(EngineError::Aborted.kind(), FailureKind::Aborted);
    }
}

//! Event-stream decoding and consumption for streamed engine answers.
//!
//! The wire format is line oriented: `data: {json}` lines carrying
//! `choices[0].delta.content`, terminated by `data: [DONE]`. Malformed lines
//! are skipped; a body that ends without the sentinel is an interruption.

use std::collections::VecDeque;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::engine::{EngineError, TextStream};

/// Terminal marker of a complete stream.
pub const DONE_SENTINEL: &str = "[DONE]";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Delta(String),
    Done,
}

#[derive(Debug, Deserialize)]
struct ChunkPayload {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    delta: Option<ChunkDelta>,
}

#[derive(Debug, Deserialize)]
struct ChunkDelta {
    content: Option<String>,
}

/// Incremental line decoder. Bytes may arrive split anywhere, including
/// inside a multi-byte character; only complete lines are decoded.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    done: bool,
    skipped: usize,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the completion sentinel has been seen.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Number of malformed lines skipped so far.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if self.done {
            return events;
        }
        self.buffer.extend_from_slice(chunk);

        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if let Some(event) = self.decode_line(&line) {
                let done = event == StreamEvent::Done;
                events.push(event);
                if done {
                    self.done = true;
                    self.buffer.clear();
                    break;
                }
            }
        }
        events
    }

    /// Decode whatever is left once the body has ended without a newline.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        if self.done || self.buffer.is_empty() {
            return Vec::new();
        }
        let line = std::mem::take(&mut self.buffer);
        let event = self.decode_line(&line);
        if event == Some(StreamEvent::Done) {
            self.done = true;
        }
        event.into_iter().collect()
    }

    fn decode_line(&mut self, raw: &[u8]) -> Option<StreamEvent> {
        let line = String::from_utf8_lossy(raw);
        let line = line.trim();

        // Blank separators, comments and non-data fields carry no text.
        if line.is_empty() || line.starts_with(':') {
            return None;
        }
        let payload = line.strip_prefix("data:")?.trim();

        if payload == DONE_SENTINEL {
            return Some(StreamEvent::Done);
        }

        match serde_json::from_str::<ChunkPayload>(payload) {
            Ok(chunk) => {
                let text: String = chunk
                    .choices
                    .into_iter()
                    .filter_map(|c| c.delta.and_then(|d| d.content))
                    .collect();
                (!text.is_empty()).then_some(StreamEvent::Delta(text))
            }
            Err(e) => {
                self.skipped += 1;
                tracing::debug!(error = %e, "Skipping malformed stream line");
                None
            }
        }
    }
}

struct DecodeState<S> {
    inner: std::pin::Pin<Box<S>>,
    decoder: SseDecoder,
    pending: VecDeque<String>,
    terminal: Option<EngineError>,
    ended: bool,
    delivered: usize,
}

impl<S> DecodeState<S> {
    fn absorb(&mut self, events: Vec<StreamEvent>) {
        for event in events {
            match event {
                StreamEvent::Delta(text) => self.pending.push_back(text),
                StreamEvent::Done => self.ended = true,
            }
        }
    }
}

/// Turn a raw byte stream into ordered text deltas.
///
/// Deltas are yielded exactly once, in arrival order. A transport error or a
/// missing sentinel is yielded as the final item after every decoded delta.
pub fn decode_event_stream<S, E>(bytes: S) -> TextStream
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Into<EngineError>,
{
    let state = DecodeState {
        inner: Box::pin(bytes),
        decoder: SseDecoder::new(),
        pending: VecDeque::new(),
        terminal: None,
        ended: false,
        delivered: 0,
    };

    Box::pin(futures::stream::unfold(state, |mut st| async move {
        loop {
            if let Some(delta) = st.pending.pop_front() {
                st.delivered += 1;
                return Some((Ok(delta), st));
            }
            if let Some(error) = st.terminal.take() {
                st.ended = true;
                return Some((Err(error), st));
            }
            if st.ended {
                return None;
            }

            match st.inner.next().await {
                Some(Ok(chunk)) => {
                    let events = st.decoder.feed(&chunk);
                    st.absorb(events);
                }
                Some(Err(e)) => st.terminal = Some(e.into()),
                None => {
                    let events = st.decoder.finish();
                    st.absorb(events);
                    if st.decoder.is_done() {
                        st.ended = true;
                    } else {
                        st.terminal = Some(EngineError::StreamInterrupted {
                            received: st.delivered + st.pending.len(),
                        });
                    }
                }
            }
        }
    }))
}

// ============================================================================
// Consumption
// ============================================================================

/// Receives each delta as it is applied.
pub trait DeltaSink: Send {
    fn on_delta(&mut self, delta: &str);
}

impl<F> DeltaSink for F
where
    F: FnMut(&str) + Send,
{
    fn on_delta(&mut self, delta: &str) {
        self(delta)
    }
}

/// The single terminal state of a consumed stream.
#[derive(Debug)]
pub enum StreamOutcome {
    Complete(String),
    Failed { error: EngineError, partial: String },
    Aborted { partial: String },
}

impl StreamOutcome {
    /// Full text on completion; otherwise the error plus whatever arrived.
    pub fn into_result(self) -> Result<String, (EngineError, String)> {
        match self {
            Self::Complete(text) => Ok(text),
            Self::Failed { error, partial } => Err((error, partial)),
            Self::Aborted { partial } => Err((EngineError::Aborted, partial)),
        }
    }
}

/// Drain `stream` into `sink`, reconstructing the full text.
///
/// Cancelling `cancel` drops the stream (and with it the transport) and
/// returns `Aborted` with the text received so far.
pub async fn collect_stream(
    mut stream: TextStream,
    sink: &mut dyn DeltaSink,
    cancel: &CancellationToken,
) -> StreamOutcome {
    let mut text = String::new();
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::debug!(received = text.len(), "Stream aborted by caller");
                return StreamOutcome::Aborted { partial: text };
            }
            item = stream.next() => item,
        };

        match next {
            Some(Ok(delta)) => {
                text.push_str(&delta);
                sink.on_delta(&delta);
            }
            Some(Err(error)) => return StreamOutcome::Failed { error, partial: text },
            None => return StreamOutcome::Complete(text),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn delta_line(text: &str) -> String {
        format!(
            "data: {}\n\n",
            serde_json::json!({ "choices": [{ "delta": { "content": text } }] })
        )
    }

    fn byte_stream(chunks: Vec<Vec<u8>>) -> impl Stream<Item = Result<Bytes, EngineError>> + Send {
        futures::stream::iter(chunks.into_iter().map(|c| Ok(Bytes::from(c))))
    }

    async fn drain(stream: TextStream) -> (StreamOutcome, Vec<String>) {
        let mut seen = Vec::new();
        let mut sink = |d: &str| seen.push(d.to_string());
        let outcome = collect_stream(stream, &mut sink, &CancellationToken::new()).await;
        (outcome, seen)
    }

    #[tokio::test]
    async fn test_chunks_reconstruct_in_order() {
        let stream: TextStream = Box::pin(futures::stream::iter(
            ["A", "B", "C"].into_iter().map(|s| Ok(s.to_string())),
        ));

        let (outcome, seen) = drain(stream).await;
        match outcome {
            StreamOutcome::Complete(text) => assert_eq!(text, "ABC"),
            other => panic!("Expected Complete, got {:?}", other),
        }
        assert_eq!(seen, vec!["A", "B", "C"]);
    }

    #[test]
    fn test_decoder_handles_lines_split_across_chunks() {
        let mut decoder = SseDecoder::new();
        let line = delta_line("检查");
        let (a, b) = line.as_bytes().split_at(10);

        assert!(decoder.feed(a).is_empty());
        assert_eq!(decoder.feed(b), vec![StreamEvent::Delta("检查".into())]);
    }

    #[test]
    fn test_decoder_handles_multibyte_char_split() {
        let mut decoder = SseDecoder::new();
        let line = delta_line("诊断");
        let bytes = line.as_bytes();
        // Split inside the first CJK character.
        let cut = line.find('诊').unwrap() + 1;

        assert!(decoder.feed(&bytes[..cut]).is_empty());
        assert_eq!(
            decoder.feed(&bytes[cut..]),
            vec![StreamEvent::Delta("诊断".into())]
        );
    }

    #[test]
    fn test_decoder_skips_malformed_and_non_data_lines() {
        let mut decoder = SseDecoder::new();
        let input = format!(
            ": keep-alive\nevent: message\ndata: {{not json\n{}data: [DONE]\n",
            delta_line("ok")
        );

        let events = decoder.feed(input.as_bytes());
        assert_eq!(
            events,
            vec![StreamEvent::Delta("ok".into()), StreamEvent::Done]
        );
        assert_eq!(decoder.skipped(), 1);
        assert!(decoder.is_done());
    }

    #[test]
    fn test_decoder_ignores_input_after_sentinel() {
        let mut decoder = SseDecoder::new();
        let input = format!("data: [DONE]\n{}", delta_line("late"));
        assert_eq!(decoder.feed(input.as_bytes()), vec![StreamEvent::Done]);
        assert!(decoder.feed(delta_line("later").as_bytes()).is_empty());
    }

    #[test]
    fn test_finish_decodes_unterminated_sentinel() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.feed(b"data: [DONE]").is_empty());
        assert_eq!(decoder.finish(), vec![StreamEvent::Done]);
        assert!(decoder.is_done());
    }

    #[tokio::test]
    async fn test_decode_event_stream_completes_on_sentinel() {
        let body = format!("{}{}data: [DONE]\n\n", delta_line("A"), delta_line("B"));
        let bytes = body.into_bytes();
        let chunks = bytes.chunks(7).map(|c| c.to_vec()).collect();

        let (outcome, seen) = drain(decode_event_stream(byte_stream(chunks))).await;
        assert!(matches!(outcome, StreamOutcome::Complete(ref t) if t == "AB"));
        assert_eq!(seen, vec!["A", "B"]);
    }

    #[tokio::test]
    async fn test_decode_event_stream_flags_missing_sentinel() {
        let body = format!("{}{}", delta_line("A"), delta_line("B"));
        let (outcome, seen) = drain(decode_event_stream(byte_stream(vec![body.into_bytes()]))).await;

        match outcome {
            StreamOutcome::Failed { error, partial } => {
                assert!(matches!(error, EngineError::StreamInterrupted { received: 2 }));
                assert_eq!(partial, "AB");
            }
            other => panic!("Expected Failed, got {:?}", other),
        }
        assert_eq!(seen, vec!["A", "B"]);
    }

    #[tokio::test]
    async fn test_transport_error_ends_stream_after_pending_deltas() {
        let chunks: Vec<Result<Bytes, EngineError>> = vec![
            Ok(Bytes::from(delta_line("A"))),
            Err(EngineError::Timeout { secs: 3 }),
            Ok(Bytes::from(delta_line("never"))),
        ];
        let stream = decode_event_stream(futures::stream::iter(chunks));

        let (outcome, seen) = drain(stream).await;
        match outcome {
            StreamOutcome::Failed { error, partial } => {
                assert!(matches!(error, EngineError::Timeout { secs: 3 }));
                assert_eq!(partial, "A");
            }
            other => panic!("Expected Failed, got {:?}", other),
        }
        assert_eq!(seen, vec!["A"]);
    }

    #[tokio::test]
    async fn test_cancel_aborts_pending_stream() {
        let head = futures::stream::iter(vec![Ok("partial".to_string())]);
        let stream: TextStream = Box::pin(head.chain(futures::stream::pending()));

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let mut seen = Vec::new();
        let mut sink = |d: &str| {
            seen.push(d.to_string());
            trigger.cancel();
        };

        match collect_stream(stream, &mut sink, &cancel).await {
            StreamOutcome::Aborted { partial } => assert_eq!(partial, "partial"),
            other => panic!("Expected Aborted, got {:?}", other),
        }
        assert_eq!(seen, vec!["partial"]);
    }

    #[test]
    fn test_into_result_maps_abort() {
        let (error, partial) = StreamOutcome::Aborted { partial: "x".into() }
            .into_result()
            .unwrap_err();
        assert!(matches!(error, EngineError::Aborted));
        assert_eq!(partial, "x");
    }
}

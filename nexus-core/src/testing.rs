//! Scripted engine double for unit tests.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::oneshot;

use crate::engine::{EngineError, EngineRequest, ReasoningEngine, TextStream};

pub(crate) enum Reply {
    Text(String),
    Fail(EngineError),
    Chunks(Vec<String>),
    /// Deliver the chunks, then end without the completion sentinel.
    ChunksThenCut(Vec<String>),
    /// Resolve with whatever the test sends through the channel.
    Gate(oneshot::Receiver<String>),
    /// Deliver the chunks, then never finish.
    Hang(Vec<String>),
}

impl Reply {
    pub(crate) fn text(s: &str) -> Self {
        Self::Text(s.to_string())
    }

    pub(crate) fn chunks(chunks: &[&str]) -> Self {
        Self::Chunks(chunks.iter().map(|c| c.to_string()).collect())
    }
}

/// Pops one scripted reply per call and records every request.
#[derive(Default)]
pub(crate) struct ScriptedEngine {
    replies: Mutex<VecDeque<Reply>>,
    calls: Mutex<Vec<EngineRequest>>,
}

impl ScriptedEngine {
    pub(crate) fn new(replies: Vec<Reply>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn calls(&self) -> Vec<EngineRequest> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn next(&self, request: &EngineRequest) -> Option<Reply> {
        self.calls.lock().unwrap().push(request.clone());
        self.replies.lock().unwrap().pop_front()
    }
}

fn exhausted() -> EngineError {
    EngineError::MalformedResponse("no scripted reply left".into())
}

#[async_trait]
impl ReasoningEngine for ScriptedEngine {
    async fn complete(&self, request: &EngineRequest) -> Result<String, EngineError> {
        match self.next(request).ok_or_else(exhausted)? {
            Reply::Text(text) => Ok(text),
            Reply::Fail(e) => Err(e),
            Reply::Chunks(chunks) => Ok(chunks.concat()),
            Reply::ChunksThenCut(chunks) => Err(EngineError::StreamInterrupted {
                received: chunks.len(),
            }),
            Reply::Gate(rx) => rx.await.map_err(|_| EngineError::Aborted),
            Reply::Hang(_) => futures::future::pending().await,
        }
    }

    async fn stream(&self, request: &EngineRequest) -> Result<TextStream, EngineError> {
        let ok = |chunks: Vec<String>| futures::stream::iter(chunks.into_iter().map(Ok::<String, EngineError>));
        let stream: TextStream = match self.next(request).ok_or_else(exhausted)? {
            Reply::Text(text) => Box::pin(ok(vec![text])),
            Reply::Fail(e) => return Err(e),
            Reply::Chunks(chunks) => Box::pin(ok(chunks)),
            Reply::ChunksThenCut(chunks) => {
                let received = chunks.len();
                Box::pin(ok(chunks).chain(futures::stream::iter([Err(
                    EngineError::StreamInterrupted { received },
                )])))
            }
            Reply::Gate(rx) => Box::pin(futures::stream::once(async move {
                rx.await.map_err(|_| EngineError::Aborted)
            })),
            Reply::Hang(chunks) => Box::pin(ok(chunks).chain(futures::stream::pending())),
        };
        Ok(stream)
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

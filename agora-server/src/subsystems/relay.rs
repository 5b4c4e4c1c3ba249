//! Relay from a streamed completion to client-facing SSE frames.
//!
//! Frame order for one chat turn:
//! 1. `{"type":"sources","sources":[...]}`, only when knowledge was retrieved
//! 2. `{"content":"<token>"}` for each token, in upstream order
//! 3. exactly one terminal frame, after the full response has been persisted:
//!    `{"type":"done","saved":true}` or `{"type":"error","message":"..."}`
//!
//! The stream then closes. An upstream failure mid-stream ends the turn with an
//! error frame and the partial response is not persisted.

use agora_core::completion::{CompletionStream, FullText, TokenStream};
use agora_core::models::KnowledgeSource;
use agora_core::AgoraError;
use futures::future::BoxFuture;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use serde_json::{json, Value};
use uuid::Uuid;

pub const SAVE_FAILED_MESSAGE: &str = "Failed to save response";
pub const STREAM_INTERRUPTED_MESSAGE: &str = "Response stream interrupted";

/// Stores the assembled assistant response once the token stream ends.
pub type PersistFn = Box<dyn FnOnce(String) -> BoxFuture<'static, Result<(), AgoraError>> + Send>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayFrame {
    Sources(Vec<KnowledgeSource>),
    Content(String),
    Done,
    Error(String),
}

impl RelayFrame {
    /// JSON payload carried on the frame's `data:` line.
    pub fn to_json(&self) -> Value {
        match self {
            RelayFrame::Sources(sources) => json!({ "type": "sources", "sources": sources }),
            RelayFrame::Content(token) => json!({ "content": token }),
            RelayFrame::Done => json!({ "type": "done", "saved": true }),
            RelayFrame::Error(message) => json!({ "type": "error", "message": message }),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RelayFrame::Done | RelayFrame::Error(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayPhase {
    NotStarted,
    SourcesSent,
    Forwarding,
    Finished,
}

pub struct Relay {
    conversation_id: Uuid,
    phase: RelayPhase,
    sources: Vec<KnowledgeSource>,
    tokens: TokenStream,
    full_text: Option<FullText>,
    persist: Option<PersistFn>,
}

impl Relay {
    pub fn new(
        conversation_id: Uuid,
        sources: Vec<KnowledgeSource>,
        completion: CompletionStream,
        persist: PersistFn,
    ) -> Self {
        Self {
            conversation_id,
            phase: RelayPhase::NotStarted,
            sources,
            tokens: completion.tokens,
            full_text: Some(completion.full_text),
            persist: Some(persist),
        }
    }

    pub fn phase(&self) -> RelayPhase {
        self.phase
    }

    /// Advance the relay by one frame. `None` once the terminal frame has been produced.
    pub async fn next_frame(&mut self) -> Option<RelayFrame> {
        loop {
            match self.phase {
                RelayPhase::NotStarted => {
                    self.phase = RelayPhase::SourcesSent;
                    if !self.sources.is_empty() {
                        return Some(RelayFrame::Sources(self.sources.clone()));
                    }
                }
                RelayPhase::SourcesSent | RelayPhase::Forwarding => {
                    match self.tokens.next().await {
                        Some(Ok(token)) => {
                            self.phase = RelayPhase::Forwarding;
                            return Some(RelayFrame::Content(token));
                        }
                        Some(Err(e)) => {
                            tracing::warn!(
                                conversation_id = %self.conversation_id,
                                error = %e,
                                "Completion failed mid-stream, response not saved"
                            );
                            self.phase = RelayPhase::Finished;
                            return Some(RelayFrame::Error(STREAM_INTERRUPTED_MESSAGE.to_string()));
                        }
                        None => {
                            self.phase = RelayPhase::Finished;
                            return Some(self.finish().await);
                        }
                    }
                }
                RelayPhase::Finished => return None,
            }
        }
    }

    async fn finish(&mut self) -> RelayFrame {
        let full_text = match self.full_text.take() {
            Some(full_text) => full_text.wait().await,
            None => return RelayFrame::Error(STREAM_INTERRUPTED_MESSAGE.to_string()),
        };
        let text = match full_text {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(conversation_id = %self.conversation_id, error = %e, "Completion did not finish");
                return RelayFrame::Error(STREAM_INTERRUPTED_MESSAGE.to_string());
            }
        };

        let Some(persist) = self.persist.take() else {
            return RelayFrame::Error(SAVE_FAILED_MESSAGE.to_string());
        };
        let chars = text.chars().count();
        match persist(text).await {
            Ok(()) => {
                tracing::info!(conversation_id = %self.conversation_id, chars, "Assistant response saved");
                RelayFrame::Done
            }
            Err(e) => {
                tracing::error!(
                    conversation_id = %self.conversation_id,
                    error = %e,
                    "Failed to save assistant response"
                );
                RelayFrame::Error(SAVE_FAILED_MESSAGE.to_string())
            }
        }
    }

    /// Drive the relay as a stream of frames. Dropping the stream drops the
    /// token receiver, which cancels the upstream completion.
    pub fn into_stream(self) -> BoxStream<'static, RelayFrame> {
        stream::unfold(self, |mut relay| async move {
            relay.next_frame().await.map(|frame| (frame, relay))
        })
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agora_core::completion::CompletionError;
    use std::sync::{Arc, Mutex};

    fn completion(items: Vec<Result<&str, CompletionError>>) -> CompletionStream {
        let items: Vec<Result<String, CompletionError>> =
            items.into_iter().map(|r| r.map(str::to_string)).collect();
        CompletionStream::spawn(stream::iter(items).boxed())
    }

    fn recording_persist(saved: Arc<Mutex<Vec<String>>>) -> PersistFn {
        Box::new(move |text| {
            Box::pin(async move {
                saved.lock().unwrap().push(text);
                Ok(())
            })
        })
    }

    fn failing_persist() -> PersistFn {
        Box::new(|_| Box::pin(async { Err(AgoraError::Other("connection reset".to_string())) }))
    }

    fn source(title: &str) -> KnowledgeSource {
        KnowledgeSource {
            id: Uuid::new_v4(),
            title: title.to_string(),
            contributor: "ana".to_string(),
        }
    }

    async fn collect(relay: Relay) -> Vec<RelayFrame> {
        relay.into_stream().collect().await
    }

    // ========================================================================
    // TEST 1: sources first, then tokens in order, then done after persist
    // ========================================================================
    #[tokio::test]
    async fn test_full_turn_frame_order() {
        let saved = Arc::new(Mutex::new(Vec::new()));
        let sources = vec![source("Pools")];
        let relay = Relay::new(
            Uuid::new_v4(),
            sources.clone(),
            completion(vec![Ok("Hel"), Ok("lo")]),
            recording_persist(saved.clone()),
        );

        let frames = collect(relay).await;
        assert_eq!(
            frames,
            vec![
                RelayFrame::Sources(sources),
                RelayFrame::Content("Hel".to_string()),
                RelayFrame::Content("lo".to_string()),
                RelayFrame::Done,
            ]
        );
        assert_eq!(*saved.lock().unwrap(), vec!["Hello".to_string()]);
    }

    // ========================================================================
    // TEST 2: no sources frame when retrieval found nothing
    // ========================================================================
    #[tokio::test]
    async fn test_no_sources_frame_when_empty() {
        let saved = Arc::new(Mutex::new(Vec::new()));
        let relay = Relay::new(
            Uuid::new_v4(),
            vec![],
            completion(vec![Ok("Hi")]),
            recording_persist(saved),
        );

        let frames = collect(relay).await;
        assert_eq!(
            frames,
            vec![RelayFrame::Content("Hi".to_string()), RelayFrame::Done]
        );
    }

    // ========================================================================
    // TEST 3: persistence failure becomes the terminal error frame
    // ========================================================================
    #[tokio::test]
    async fn test_persist_failure_emits_error_frame() {
        let relay = Relay::new(
            Uuid::new_v4(),
            vec![],
            completion(vec![Ok("a"), Ok("b")]),
            failing_persist(),
        );

        let frames = collect(relay).await;
        assert_eq!(frames.len(), 3);
        assert_eq!(
            frames.last(),
            Some(&RelayFrame::Error(SAVE_FAILED_MESSAGE.to_string()))
        );
        assert!(!frames.contains(&RelayFrame::Done));
    }

    // ========================================================================
    // TEST 4: upstream error mid-stream ends the turn without persisting
    // ========================================================================
    #[tokio::test]
    async fn test_upstream_error_skips_persist() {
        let saved = Arc::new(Mutex::new(Vec::new()));
        let relay = Relay::new(
            Uuid::new_v4(),
            vec![source("x")],
            completion(vec![
                Ok("partial"),
                Err(CompletionError::Stream("connection reset".to_string())),
            ]),
            recording_persist(saved.clone()),
        );

        let frames = collect(relay).await;
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[1], RelayFrame::Content("partial".to_string()));
        assert_eq!(
            frames[2],
            RelayFrame::Error(STREAM_INTERRUPTED_MESSAGE.to_string())
        );
        assert!(saved.lock().unwrap().is_empty());
    }

    // ========================================================================
    // TEST 5: exactly one terminal frame, then the relay stays finished
    // ========================================================================
    #[tokio::test]
    async fn test_relay_is_finished_after_terminal_frame() {
        let saved = Arc::new(Mutex::new(Vec::new()));
        let mut relay = Relay::new(
            Uuid::new_v4(),
            vec![],
            completion(vec![]),
            recording_persist(saved.clone()),
        );

        assert_eq!(relay.phase(), RelayPhase::NotStarted);
        assert_eq!(relay.next_frame().await, Some(RelayFrame::Done));
        assert_eq!(relay.phase(), RelayPhase::Finished);
        assert_eq!(relay.next_frame().await, None);
        assert_eq!(relay.next_frame().await, None);
        // an empty response is still stored
        assert_eq!(*saved.lock().unwrap(), vec![String::new()]);
    }

    // ========================================================================
    // TEST 6: wire shape of each frame
    // ========================================================================
    #[test]
    fn test_frame_json_shapes() {
        let s = source("Tokio");
        assert_eq!(
            RelayFrame::Sources(vec![s.clone()]).to_json(),
            json!({"type": "sources", "sources": [{"id": s.id, "title": "Tokio", "contributor": "ana"}]})
        );
        assert_eq!(RelayFrame::Content("hi".into()).to_json(), json!({"content": "hi"}));
        assert_eq!(RelayFrame::Done.to_json(), json!({"type": "done", "saved": true}));
        assert_eq!(
            RelayFrame::Error("boom".into()).to_json(),
            json!({"type": "error", "message": "boom"})
        );
        assert!(RelayFrame::Done.is_terminal());
        assert!(!RelayFrame::Content(String::new()).is_terminal());
    }
}

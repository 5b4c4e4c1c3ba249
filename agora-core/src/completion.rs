//! Chat completion orchestration
//!
//! Provides a `CompletionBackend` trait with an OpenAI-compatible streaming
//! implementation, prompt assembly (system instruction + knowledge context +
//! bounded history) and `CompletionStream`, which pairs a live token stream
//! with a handle that resolves to the full text once the stream has ended.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::channel::{mpsc, oneshot};
use futures::stream::{self, BoxStream};
use futures::{SinkExt, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

use crate::config::LlmConfig;
use crate::models::Message;
use crate::sse::{data_payload, SseLineBuffer};

pub const SYSTEM_PROMPT: &str = "You are a helpful AI assistant with access to a shared knowledge base contributed by the community.

When relevant knowledge base entries are provided below, you MUST use them to answer the question and cite sources by number (e.g. [1], [2]). Do not claim you cannot search or access the knowledge base. The system automatically searches it for every message and injects relevant entries into this prompt.

If no knowledge base entries are provided, answer using your general knowledge. Be concise, accurate, and friendly.";

const TOKEN_CHANNEL_CAPACITY: usize = 64;

// ============================================================================
// Errors
// ============================================================================

#[derive(Error, Debug)]
pub enum CompletionError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({code}): {message}")]
    Api { code: u16, message: String },

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Completion was abandoned before it finished")]
    Cancelled,
}

impl CompletionError {
    /// Only failures that happen before the first byte are ever retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            CompletionError::Http(e) => e.is_connect() || e.is_timeout(),
            CompletionError::Api { code, .. } => *code == 429 || *code >= 500,
            _ => false,
        }
    }
}

// ============================================================================
// Prompt assembly
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptMessage {
    pub role: String,
    pub content: String,
}

impl PromptMessage {
    pub fn new(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: content.into(),
        }
    }
}

/// System instruction (with the knowledge context appended when non-empty)
/// followed by the most recent `max_context_messages` turns, oldest first.
pub fn build_prompt(
    history: &[Message],
    knowledge_context: &str,
    max_context_messages: usize,
) -> Vec<PromptMessage> {
    let mut system = SYSTEM_PROMPT.to_string();
    if !knowledge_context.is_empty() {
        system.push_str("\n\n");
        system.push_str(knowledge_context);
    }

    let start = history.len().saturating_sub(max_context_messages);
    std::iter::once(PromptMessage::new("system", system))
        .chain(
            history[start..]
                .iter()
                .map(|m| PromptMessage::new(m.role.as_str(), m.content.clone())),
        )
        .collect()
}

// ============================================================================
// Backend trait and stream handle
// ============================================================================

pub type TokenStream = BoxStream<'static, Result<String, CompletionError>>;

/// Abstraction over streaming chat-completion providers.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    /// Open a streaming completion. An `Err` here means no token was produced.
    async fn stream_tokens(&self, messages: &[PromptMessage])
        -> Result<TokenStream, CompletionError>;

    /// Backend name for logging.
    fn name(&self) -> &str;
}

/// Resolves to the assembled response once the token stream has ended.
pub struct FullText(oneshot::Receiver<Result<String, CompletionError>>);

impl FullText {
    pub async fn wait(self) -> Result<String, CompletionError> {
        self.0.await.unwrap_or(Err(CompletionError::Cancelled))
    }
}

pub struct CompletionStream {
    pub tokens: TokenStream,
    pub full_text: FullText,
}

impl CompletionStream {
    /// Pump `upstream` on a background task, forwarding tokens over a bounded
    /// channel and accumulating the full text.
    ///
    /// Dropping `tokens` closes the channel; the pump then stops and drops the
    /// upstream response, which aborts the provider request.
    pub fn spawn(mut upstream: TokenStream) -> Self {
        let (mut tx, rx) = mpsc::channel(TOKEN_CHANNEL_CAPACITY);
        let (done_tx, done_rx) = oneshot::channel();

        tokio::spawn(async move {
            let mut full = String::new();
            let outcome = loop {
                match upstream.next().await {
                    Some(Ok(token)) => {
                        full.push_str(&token);
                        if tx.send(Ok(token)).await.is_err() {
                            tracing::debug!(
                                received_chars = full.len(),
                                "Token receiver dropped, abandoning completion"
                            );
                            break Err(CompletionError::Cancelled);
                        }
                    }
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "Completion stream failed");
                        let message = match &e {
                            CompletionError::Stream(inner) => inner.clone(),
                            other => other.to_string(),
                        };
                        let _ = tx.send(Err(e)).await;
                        break Err(CompletionError::Stream(message));
                    }
                    None => break Ok(full),
                }
            };
            let _ = done_tx.send(outcome);
        });

        Self {
            tokens: rx.boxed(),
            full_text: FullText(done_rx),
        }
    }
}

/// Assemble the prompt and open a streaming completion.
pub async fn start_completion(
    backend: &dyn CompletionBackend,
    history: &[Message],
    knowledge_context: &str,
    max_context_messages: usize,
) -> Result<CompletionStream, CompletionError> {
    let prompt = build_prompt(history, knowledge_context, max_context_messages);
    tracing::debug!(
        backend = backend.name(),
        messages = prompt.len(),
        has_context = !knowledge_context.is_empty(),
        "Starting chat completion"
    );
    let upstream = backend.stream_tokens(&prompt).await?;
    Ok(CompletionStream::spawn(upstream))
}

// ============================================================================
// OpenAI-compatible client
// ============================================================================

#[derive(Debug, Clone)]
pub struct CompletionConfig {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
    pub timeout: Duration,
    pub max_retries: usize,
    pub retry_delay_ms: u64,
}

impl From<&LlmConfig> for CompletionConfig {
    fn from(llm: &LlmConfig) -> Self {
        Self {
            api_key: llm.resolved_api_key(),
            model: llm.model.clone(),
            base_url: llm.base_url.trim_end_matches('/').to_string(),
            timeout: Duration::from_secs(llm.timeout_seconds),
            max_retries: llm.max_retries,
            retry_delay_ms: llm.retry_delay_ms,
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [PromptMessage],
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    content: Option<String>,
}

#[derive(Debug)]
enum ChunkEvent {
    Token(String),
    Done,
    Failed(CompletionError),
}

/// Interpret one upstream SSE line. `None` for comments, blanks, empty deltas
/// and frames we do not understand.
fn parse_stream_line(line: &str) -> Option<ChunkEvent> {
    let data = data_payload(line)?.trim();
    if data.is_empty() {
        return None;
    }
    if data == "[DONE]" {
        return Some(ChunkEvent::Done);
    }

    let value: serde_json::Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => {
            tracing::debug!(error = %e, "Skipping unparseable completion frame");
            return None;
        }
    };

    if let Some(err) = value.get("error") {
        let message = err["message"]
            .as_str()
            .unwrap_or("unknown provider error")
            .to_string();
        let code = err["code"]
            .as_u64()
            .and_then(|c| u16::try_from(c).ok())
            .unwrap_or(500);
        return Some(ChunkEvent::Failed(CompletionError::Api { code, message }));
    }

    let chunk: StreamChunk = serde_json::from_value(value).ok()?;
    let content = chunk.choices.into_iter().next()?.delta.content?;
    if content.is_empty() {
        None
    } else {
        Some(ChunkEvent::Token(content))
    }
}

struct UpstreamState {
    bytes: BoxStream<'static, reqwest::Result<Bytes>>,
    lines: SseLineBuffer,
    pending: VecDeque<String>,
    eof: bool,
    finished: bool,
}

fn token_stream(bytes: BoxStream<'static, reqwest::Result<Bytes>>) -> TokenStream {
    let state = UpstreamState {
        bytes,
        lines: SseLineBuffer::new(),
        pending: VecDeque::new(),
        eof: false,
        finished: false,
    };

    stream::unfold(state, |mut st| async move {
        loop {
            if st.finished {
                return None;
            }

            while let Some(line) = st.pending.pop_front() {
                match parse_stream_line(&line) {
                    Some(ChunkEvent::Token(token)) => return Some((Ok(token), st)),
                    Some(ChunkEvent::Done) => return None,
                    Some(ChunkEvent::Failed(e)) => {
                        st.finished = true;
                        return Some((Err(e), st));
                    }
                    None => {}
                }
            }

            if st.eof {
                return None;
            }

            match st.bytes.next().await {
                Some(Ok(chunk)) => {
                    let lines = st.lines.push(&chunk);
                    st.pending.extend(lines);
                }
                Some(Err(e)) => {
                    st.finished = true;
                    return Some((
                        Err(CompletionError::Stream(format!("stream read error: {e}"))),
                        st,
                    ));
                }
                None => {
                    if let Some(tail) = st.lines.finish() {
                        st.pending.push_back(tail);
                    }
                    st.eof = true;
                }
            }
        }
    })
    .boxed()
}

/// Streams chat completions from any OpenAI-compatible `/chat/completions` endpoint.
#[derive(Debug, Clone)]
pub struct OpenAiCompletionClient {
    client: Client,
    config: CompletionConfig,
}

impl OpenAiCompletionClient {
    pub fn new(config: CompletionConfig) -> Result<Self, CompletionError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .read_timeout(config.timeout)
            .build()?;

        Ok(Self { client, config })
    }

    async fn send_once(
        &self,
        messages: &[PromptMessage],
    ) -> Result<reqwest::Response, CompletionError> {
        let url = format!("{}/chat/completions", self.config.base_url);
        let body = ChatRequest {
            model: &self.config.model,
            messages,
            stream: true,
        };

        let mut request = self
            .client
            .post(&url)
            .header("accept", "text/event-stream")
            .json(&body);
        if !self.config.api_key.is_empty() {
            request = request.bearer_auth(&self.config.api_key);
        }

        let response = request.send().await?;
        let status = response.status();

        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<serde_json::Value>(&error_body)
                .ok()
                .and_then(|v| v["error"]["message"].as_str().map(str::to_string))
                .unwrap_or(error_body);

            tracing::error!(code = status.as_u16(), message = %message, "Completion API error");

            return Err(CompletionError::Api {
                code: status.as_u16(),
                message,
            });
        }

        Ok(response)
    }
}

#[async_trait]
impl CompletionBackend for OpenAiCompletionClient {
    async fn stream_tokens(
        &self,
        messages: &[PromptMessage],
    ) -> Result<TokenStream, CompletionError> {
        let retry_strategy = ExponentialBackoff::from_millis(self.config.retry_delay_ms)
            .max_delay(Duration::from_secs(10))
            .map(jitter)
            .take(self.config.max_retries);

        let response = RetryIf::spawn(
            retry_strategy,
            || self.send_once(messages),
            |e: &CompletionError| e.is_retryable(),
        )
        .await
        .inspect_err(|e| {
            tracing::error!(
                max_retries = self.config.max_retries,
                error = %e,
                "Could not open completion stream"
            );
        })?;

        Ok(token_stream(response.bytes_stream().boxed()))
    }

    fn name(&self) -> &str {
        "openai-compatible"
    }
}

// ============================================================================
// TESTS
// ============================================================================

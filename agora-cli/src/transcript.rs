//! Client-side reconstruction of a streamed chat turn.
//!
//! The server sends one JSON object per `data:` line. Lines that are not
//! `data:` fields (comments, keep-alives, blank separators) and payloads that
//! fail to parse are skipped. A literal `[DONE]` payload also ends the stream.

use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Source {
    pub id: String,
    pub title: String,
    pub contributor: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Sources(Vec<Source>),
    Content(String),
    Done { saved: bool },
    Error(String),
    /// `[DONE]` sentinel.
    End,
}

/// Decode one line of the event stream. `None` for anything that is not a usable event.
pub fn parse_line(line: &str) -> Option<StreamEvent> {
    let payload = line.strip_prefix("data:")?;
    let payload = payload.strip_prefix(' ').unwrap_or(payload).trim_end();
    if payload == "[DONE]" {
        return Some(StreamEvent::End);
    }

    let value: Value = serde_json::from_str(payload).ok()?;
    match value.get("type").and_then(Value::as_str) {
        Some("sources") => {
            let sources = serde_json::from_value(value.get("sources")?.clone()).ok()?;
            Some(StreamEvent::Sources(sources))
        }
        Some("done") => Some(StreamEvent::Done {
            saved: value.get("saved").and_then(Value::as_bool).unwrap_or(false),
        }),
        Some("error") => Some(StreamEvent::Error(
            value
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("Unknown error")
                .to_string(),
        )),
        _ => value
            .get("content")
            .and_then(Value::as_str)
            .map(|c| StreamEvent::Content(c.to_string())),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Outcome {
    #[default]
    Streaming,
    Saved,
    /// The server finished but did not store the reply.
    Unsaved,
    Failed(String),
}

/// Accumulated state of one assistant reply.
#[derive(Debug, Clone, Default)]
pub struct Transcript {
    pub text: String,
    pub sources: Vec<Source>,
    pub outcome: Outcome,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one event in. Returns `false` once the stream should stop being read.
    pub fn apply(&mut self, event: StreamEvent) -> bool {
        match event {
            StreamEvent::Sources(sources) => self.sources = sources,
            StreamEvent::Content(token) => self.text.push_str(&token),
            StreamEvent::Done { saved } => {
                self.outcome = if saved { Outcome::Saved } else { Outcome::Unsaved };
                return false;
            }
            StreamEvent::Error(message) => {
                self.outcome = Outcome::Failed(message);
                return false;
            }
            StreamEvent::End => return false,
        }
        true
    }

    /// Something the user should be told about once the stream is over.
    pub fn warning(&self) -> Option<String> {
        match &self.outcome {
            Outcome::Saved => None,
            Outcome::Unsaved => Some("Response was not saved".to_string()),
            Outcome::Failed(message) => Some(message.clone()),
            Outcome::Streaming => Some("Response ended unexpectedly".to_string()),
        }
    }
}

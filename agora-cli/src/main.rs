//! agora-cli: terminal client for the Agora knowledge-augmented chat server
//!
//! # Subcommands
//! - `chat <message> [--conversation <id>]`       - send a message, stream the reply
//! - `conversations list|show|rename|delete`      - manage chat history
//! - `kb search|list|show|add|edit|delete`        - curate the shared knowledge base
//! - `status`                                     - show server health

mod transcript;

use std::io::{BufRead, BufReader, Write};
use std::time::Duration;

use clap::{Parser, Subcommand};
use reqwest::blocking::{Client, RequestBuilder};
use serde::Deserialize;
use serde_json::{json, Value};

use transcript::{parse_line, Transcript};

const DEFAULT_SERVER: &str = "http://127.0.0.1:8787";
const DEFAULT_LIMIT: u32 = 5;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Long enough for a slow model to finish a reply.
const STREAM_TIMEOUT: Duration = Duration::from_secs(300);

// ============================================================================
// CLI Definition
// ============================================================================

#[derive(Debug, Parser)]
#[command(
    name = "agora-cli",
    version,
    about = "Agora: chat with a shared, community-curated knowledge base"
)]
struct Cli {
    /// Agora HTTP server URL (overrides AGORA_HTTP_URL env var)
    #[arg(long, env = "AGORA_HTTP_URL", default_value = DEFAULT_SERVER)]
    server: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Send a message and stream the assistant's reply
    Chat {
        /// Message text
        message: String,

        /// Continue an existing conversation
        #[arg(short, long)]
        conversation: Option<String>,
    },

    /// Manage conversations
    #[command(subcommand)]
    Conversations(ConversationCommands),

    /// Manage knowledge base entries
    #[command(subcommand)]
    Kb(KbCommands),

    /// Show Agora server status
    Status,
}

#[derive(Debug, Subcommand)]
enum ConversationCommands {
    /// List conversations, most recently active first
    List,
    /// Print a conversation's messages
    Show { id: String },
    /// Rename a conversation
    Rename { id: String, title: String },
    /// Delete a conversation and its messages
    Delete { id: String },
}

#[derive(Debug, Subcommand)]
enum KbCommands {
    /// Search entries by relevance
    Search {
        query: String,

        /// Maximum number of results (1-20)
        #[arg(short = 'n', long, default_value_t = DEFAULT_LIMIT)]
        limit: u32,
    },
    /// List all entries, newest first
    List,
    /// Print one entry
    Show { id: String },
    /// Add an entry
    Add {
        #[arg(long)]
        title: String,
        #[arg(long)]
        content: String,
        /// Repeat for several tags
        #[arg(long = "tag")]
        tags: Vec<String>,
        #[arg(long, env = "AGORA_CONTRIBUTOR")]
        contributor: String,
    },
    /// Update selected fields of an entry
    Edit {
        id: String,
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        content: Option<String>,
        /// Replaces all tags; repeat for several
        #[arg(long = "tag")]
        tags: Option<Vec<String>>,
        #[arg(long)]
        contributor: Option<String>,
    },
    /// Delete an entry
    Delete { id: String },
}

// ============================================================================
// API Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub id: String,
    pub title: String,
    pub updated_at: String,
}

#[derive(Debug, Deserialize)]
pub struct MessageView {
    pub role: String,
    pub content: String,
    #[serde(default)]
    pub sources: Vec<transcript::Source>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryView {
    pub id: String,
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub contributor: String,
    pub created_at: String,
}

// ============================================================================
// Formatting
// ============================================================================

/// `[n] title (by contributor)` lines, numbered the way the model cites them.
pub fn format_sources(sources: &[transcript::Source]) -> String {
    sources
        .iter()
        .enumerate()
        .map(|(i, s)| format!("  [{}] {} (by {})", i + 1, s.title, s.contributor))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Short id for listings: first 8 characters.
pub fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

pub fn preview(content: &str, max_chars: usize) -> String {
    let first_line = content.lines().find(|l| !l.trim().is_empty()).unwrap_or("");
    if first_line.chars().count() <= max_chars {
        return first_line.to_string();
    }
    let mut cut: String = first_line.chars().take(max_chars).collect();
    cut.push('…');
    cut
}

fn print_entry_summary(entry: &EntryView) {
    let tags = if entry.tags.is_empty() {
        String::new()
    } else {
        format!(" [{}]", entry.tags.join(", "))
    };
    println!(
        "{}  {} (by {}){}",
        short_id(&entry.id),
        entry.title,
        entry.contributor,
        tags
    );
    println!("          {}", preview(&entry.content, 100));
}

// ============================================================================
// HTTP Client Calls
// ============================================================================

fn client(timeout: Duration) -> anyhow::Result<Client> {
    Ok(Client::builder().timeout(timeout).build()?)
}

fn fail(msg: impl std::fmt::Display) -> ! {
    eprintln!("agora-cli: {}", msg);
    std::process::exit(1);
}

/// Send a request and return the JSON body; exits with the server's message on failure.
fn call(url: &str, req: RequestBuilder) -> Value {
    let resp = match req.send() {
        Ok(r) => r,
        Err(e) => fail(format!("connection failed to {}: {}", url, e)),
    };

    let status = resp.status();
    let body: Value = resp.json().unwrap_or(Value::Null);
    if !status.is_success() {
        let message = body["error"].as_str().unwrap_or("request failed");
        fail(format!("server returned {}: {}", status, message));
    }
    body
}

fn parse_body<T: for<'de> Deserialize<'de>>(body: Value) -> T {
    match serde_json::from_value(body) {
        Ok(v) => v,
        Err(e) => fail(format!("failed to parse response: {}", e)),
    }
}

/// Stream one chat turn to stdout.
fn do_chat(server: &str, message: &str, conversation: Option<&str>) -> anyhow::Result<()> {
    let url = format!("{}/api/chat/send", server);
    let mut body = json!({ "content": message });
    if let Some(id) = conversation {
        body["conversationId"] = json!(id);
    }

    let resp = match client(STREAM_TIMEOUT)?.post(&url).json(&body).send() {
        Ok(r) => r,
        Err(e) => fail(format!("connection failed to {}: {}", url, e)),
    };

    if !resp.status().is_success() {
        let status = resp.status();
        let body: Value = resp.json().unwrap_or(Value::Null);
        fail(format!(
            "server returned {}: {}",
            status,
            body["error"].as_str().unwrap_or("request failed")
        ));
    }

    let conversation_id = resp
        .headers()
        .get("x-conversation-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let mut transcript = Transcript::new();
    let mut stdout = std::io::stdout();
    for line in BufReader::new(resp).lines() {
        let line = line?;
        let Some(event) = parse_line(&line) else {
            continue;
        };
        if let transcript::StreamEvent::Content(token) = &event {
            print!("{}", token);
            stdout.flush()?;
        }
        if !transcript.apply(event) {
            break;
        }
    }
    println!();

    if !transcript.sources.is_empty() {
        println!("\nSources:\n{}", format_sources(&transcript.sources));
    }
    if let Some(id) = conversation_id {
        println!("\nConversation: {}", id);
    }
    if let Some(warning) = transcript.warning() {
        eprintln!("agora-cli: warning: {}", warning);
        std::process::exit(2);
    }

    Ok(())
}

fn do_conversations(server: &str, command: ConversationCommands) -> anyhow::Result<()> {
    let http = client(REQUEST_TIMEOUT)?;

    match command {
        ConversationCommands::List => {
            let url = format!("{}/api/chat/conversations", server);
            let body = call(&url, http.get(&url));
            let conversations: Vec<ConversationSummary> =
                parse_body(body["conversations"].clone());
            if conversations.is_empty() {
                eprintln!("No conversations yet");
            }
            for c in &conversations {
                println!("{}  {}  {}", c.id, c.updated_at, c.title);
            }
        }
        ConversationCommands::Show { id } => {
            let url = format!("{}/api/chat/conversations/{}/messages", server, id);
            let body = call(&url, http.get(&url));
            let messages: Vec<MessageView> = parse_body(body["messages"].clone());
            for m in &messages {
                println!("{}:\n{}\n", m.role, m.content);
                if !m.sources.is_empty() {
                    println!("Sources:\n{}\n", format_sources(&m.sources));
                }
            }
        }
        ConversationCommands::Rename { id, title } => {
            let url = format!("{}/api/chat/conversations/{}", server, id);
            let body = call(&url, http.patch(&url).json(&json!({ "title": title })));
            println!("Renamed to: {}", body["title"].as_str().unwrap_or(&title));
        }
        ConversationCommands::Delete { id } => {
            let url = format!("{}/api/chat/conversations/{}", server, id);
            call(&url, http.delete(&url));
            println!("Deleted conversation {}", id);
        }
    }

    Ok(())
}

fn do_kb(server: &str, command: KbCommands) -> anyhow::Result<()> {
    let http = client(REQUEST_TIMEOUT)?;
    let base = format!("{}/api/knowledge", server);

    match command {
        KbCommands::Search { query, limit } => {
            let limit = limit.to_string();
            let body = call(
                &base,
                http.get(&base)
                    .query(&[("q", query.as_str()), ("limit", limit.as_str())]),
            );
            let entries: Vec<EntryView> = parse_body(body["entries"].clone());
            if entries.is_empty() {
                eprintln!("No results found for: {}", query);
            }
            entries.iter().for_each(print_entry_summary);
        }
        KbCommands::List => {
            let body = call(&base, http.get(&base));
            let entries: Vec<EntryView> = parse_body(body["entries"].clone());
            entries.iter().for_each(print_entry_summary);
        }
        KbCommands::Show { id } => {
            let url = format!("{}/{}", base, id);
            let entry: EntryView = parse_body(call(&url, http.get(&url)));
            println!("{}\n", entry.title);
            println!("id:          {}", entry.id);
            println!("contributor: {}", entry.contributor);
            println!("created:     {}", entry.created_at);
            if !entry.tags.is_empty() {
                println!("tags:        {}", entry.tags.join(", "));
            }
            println!("\n{}", entry.content);
        }
        KbCommands::Add {
            title,
            content,
            tags,
            contributor,
        } => {
            let payload = json!({
                "title": title,
                "content": content,
                "tags": tags,
                "contributor": contributor,
            });
            let entry: EntryView = parse_body(call(&base, http.post(&base).json(&payload)));
            println!("Added {} ({})", entry.title, entry.id);
        }
        KbCommands::Edit {
            id,
            title,
            content,
            tags,
            contributor,
        } => {
            let mut payload = serde_json::Map::new();
            if let Some(v) = title {
                payload.insert("title".into(), json!(v));
            }
            if let Some(v) = content {
                payload.insert("content".into(), json!(v));
            }
            if let Some(v) = tags {
                payload.insert("tags".into(), json!(v));
            }
            if let Some(v) = contributor {
                payload.insert("contributor".into(), json!(v));
            }
            if payload.is_empty() {
                fail("nothing to update (pass --title, --content, --tag or --contributor)");
            }
            let url = format!("{}/{}", base, id);
            let entry: EntryView =
                parse_body(call(&url, http.patch(&url).json(&Value::Object(payload))));
            println!("Updated {} ({})", entry.title, entry.id);
        }
        KbCommands::Delete { id } => {
            let url = format!("{}/{}", base, id);
            call(&url, http.delete(&url));
            println!("Deleted entry {}", id);
        }
    }

    Ok(())
}

/// Show the server status by calling GET /health.
fn do_status(server: &str) -> anyhow::Result<()> {
    let url = format!("{}/health", server);
    let resp = client(Duration::from_secs(10))?.get(&url).send();

    match resp {
        Ok(r) if r.status().is_success() => {
            let body: Value = r.json().unwrap_or_default();
            println!("Agora server:   {}", body["status"].as_str().unwrap_or("unknown"));
            println!("Version:        {}", body["version"].as_str().unwrap_or("?"));
            println!("PostgreSQL:     {}", body["postgresql"].as_str().unwrap_or("?"));
            println!(
                "Search trigger: {}",
                if body["searchTrigger"].as_bool().unwrap_or(false) {
                    "installed"
                } else {
                    "missing"
                }
            );
        }
        Ok(r) => fail(format!("server unhealthy (HTTP {})", r.status())),
        Err(e) => fail(format!("cannot reach {}: {}", url, e)),
    }

    Ok(())
}

// ============================================================================
// Main
// ============================================================================

fn main() {
    let cli = Cli::parse();
    let server = cli.server.trim_end_matches('/').to_string();

    let result = match cli.command {
        Commands::Chat {
            message,
            conversation,
        } => do_chat(&server, &message, conversation.as_deref()),
        Commands::Conversations(command) => do_conversations(&server, command),
        Commands::Kb(command) => do_kb(&server, command),
        Commands::Status => do_status(&server),
    };

    if let Err(e) = result {
        fail(e);
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use transcript::Source;

    fn source(title: &str, contributor: &str) -> Source {
        Source {
            id: "7b5c24ab-1234-5678-9abc-def012345678".to_string(),
            title: title.to_string(),
            contributor: contributor.to_string(),
        }
    }

    // ========================================================================
    // TEST 1: sources are numbered from 1 to match in-text citations
    // ========================================================================
    #[test]
    fn test_format_sources_numbering() {
        let out = format_sources(&[source("Pools", "ana"), source("Shutdown", "ben")]);
        assert_eq!(out, "  [1] Pools (by ana)\n  [2] Shutdown (by ben)");
    }

    // ========================================================================
    // TEST 2: short ids
    // ========================================================================
    #[test]
    fn test_short_id() {
        assert_eq!(short_id("7b5c24ab-1234-5678-9abc-def012345678"), "7b5c24ab");
        assert_eq!(short_id("abc"), "abc");
    }

    // ========================================================================
    // TEST 3: preview uses first non-empty line and truncates by chars
    // ========================================================================
    #[test]
    fn test_preview() {
        assert_eq!(preview("\n\nFirst line\nSecond", 100), "First line");
        assert_eq!(preview(&"é".repeat(10), 4), "éééé…");
        assert_eq!(preview("", 10), "");
    }

    // ========================================================================
    // TEST 4: message history parses with and without sources
    // ========================================================================
    #[test]
    fn test_message_view_parsing() {
        let body = json!([
            {"id": "1", "conversationId": "c", "role": "user", "content": "hi",
             "createdAt": "2026-01-01T00:00:00Z", "updatedAt": "2026-01-01T00:00:00Z"},
            {"id": "2", "conversationId": "c", "role": "assistant", "content": "hello [1]",
             "sources": [{"id": "e", "title": "Greeting", "contributor": "ana"}],
             "createdAt": "2026-01-01T00:00:01Z", "updatedAt": "2026-01-01T00:00:01Z"}
        ]);
        let messages: Vec<MessageView> = serde_json::from_value(body).unwrap();
        assert!(messages[0].sources.is_empty());
        assert_eq!(messages[1].sources[0].title, "Greeting");
    }

    // ========================================================================
    // TEST 5: CLI parses nested subcommands and repeated tags
    // ========================================================================
    #[test]
    fn test_cli_parses_kb_add() {
        let cli = Cli::try_parse_from([
            "agora-cli", "kb", "add", "--title", "T", "--content", "C", "--tag", "a", "--tag",
            "b", "--contributor", "ana",
        ])
        .unwrap();
        match cli.command {
            Commands::Kb(KbCommands::Add { tags, .. }) => assert_eq!(tags, vec!["a", "b"]),
            other => panic!("unexpected command: {:?}", other),
        }
    }
}

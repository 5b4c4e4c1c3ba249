pub mod completion;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod sse;
pub mod telemetry;

pub use completion::{
    build_prompt, start_completion, CompletionBackend, CompletionConfig, CompletionError,
    CompletionStream, FullText, OpenAiCompletionClient, PromptMessage, TokenStream,
    SYSTEM_PROMPT,
};
pub use config::AgoraConfig;
pub use db::TableNames;
pub use error::AgoraError;

//! Conversation service: lifecycle of conversations and their messages.

use agora_core::db::TableNames;
use agora_core::models::{Conversation, KnowledgeSource, Message, Role, UpdateConversationRequest};
use agora_core::AgoraError;
use sqlx::PgPool;
use uuid::Uuid;

use super::chat_store;

const CONVERSATION_KIND: &str = "Conversation";

/// Titles derived from the opening message are cut to this many characters.
const GENERATED_TITLE_CHARS: usize = 50;

pub async fn create_conversation(
    pool: &PgPool,
    tables: &TableNames,
    title: &str,
) -> Result<Conversation, AgoraError> {
    let conversation = chat_store::create_conversation(pool, tables, title).await?;
    tracing::info!(conversation_id = %conversation.id, "Conversation created");
    Ok(conversation)
}

pub async fn list_conversations(
    pool: &PgPool,
    tables: &TableNames,
) -> Result<Vec<Conversation>, AgoraError> {
    Ok(chat_store::find_all_conversations(pool, tables).await?)
}

#[tracing::instrument(skip(pool, tables))]
pub async fn get_conversation(
    pool: &PgPool,
    tables: &TableNames,
    id: Uuid,
) -> Result<Conversation, AgoraError> {
    chat_store::find_conversation_by_id(pool, tables, id)
        .await?
        .ok_or_else(|| AgoraError::not_found(CONVERSATION_KIND, id))
}

#[tracing::instrument(skip(pool, tables, request))]
pub async fn rename_conversation(
    pool: &PgPool,
    tables: &TableNames,
    id: Uuid,
    request: &UpdateConversationRequest,
) -> Result<Conversation, AgoraError> {
    request.validate()?;
    chat_store::rename_conversation(pool, tables, id, request.title.trim())
        .await?
        .ok_or_else(|| AgoraError::not_found(CONVERSATION_KIND, id))
}

#[tracing::instrument(skip(pool, tables))]
pub async fn delete_conversation(
    pool: &PgPool,
    tables: &TableNames,
    id: Uuid,
) -> Result<(), AgoraError> {
    if !chat_store::delete_conversation(pool, tables, id).await? {
        return Err(AgoraError::not_found(CONVERSATION_KIND, id));
    }
    tracing::info!(conversation_id = %id, "Conversation deleted");
    Ok(())
}

/// Append a message. Sources are stored only when there is at least one.
#[tracing::instrument(skip(pool, tables, content, sources))]
pub async fn add_message(
    pool: &PgPool,
    tables: &TableNames,
    conversation_id: Uuid,
    role: Role,
    content: &str,
    sources: Option<&[KnowledgeSource]>,
) -> Result<Message, AgoraError> {
    let sources = sources.filter(|s| !s.is_empty());
    let message = chat_store::insert_message(pool, tables, conversation_id, role, content, sources)
        .await
        .map_err(|e| match e {
            AgoraError::Database(sqlx::Error::Database(db)) if db.is_foreign_key_violation() => {
                AgoraError::not_found(CONVERSATION_KIND, conversation_id)
            }
            other => other,
        })?;
    tracing::debug!(
        conversation_id = %conversation_id,
        message_id = %message.id,
        role = %role,
        "Message stored"
    );
    Ok(message)
}

pub async fn get_messages(
    pool: &PgPool,
    tables: &TableNames,
    conversation_id: Uuid,
) -> Result<Vec<Message>, AgoraError> {
    chat_store::find_messages_by_conversation_id(pool, tables, conversation_id).await
}

/// Messages of a conversation that must exist; unknown ids are `NotFound`.
pub async fn get_conversation_messages(
    pool: &PgPool,
    tables: &TableNames,
    conversation_id: Uuid,
) -> Result<Vec<Message>, AgoraError> {
    get_conversation(pool, tables, conversation_id).await?;
    get_messages(pool, tables, conversation_id).await
}

/// Title for a new conversation: the trimmed opening message, cut to 50
/// characters with a trailing `...` when longer.
pub fn generate_title_from_message(message: &str) -> String {
    let trimmed = message.trim();
    if trimmed.chars().count() <= GENERATED_TITLE_CHARS {
        return trimmed.to_string();
    }
    let mut title: String = trimmed.chars().take(GENERATED_TITLE_CHARS).collect();
    title.push_str("...");
    title
}

//! Conversation and message repository.
//!
//! Table names come from [`TableNames`] so several deployments can share one
//! database under different prefixes.

use agora_core::db::TableNames;
use agora_core::models::{Conversation, KnowledgeSource, Message, Role};
use agora_core::AgoraError;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::PgPool;
use uuid::Uuid;

const CONVERSATION_COLUMNS: &str = "id, title, created_at, updated_at";
const MESSAGE_COLUMNS: &str = "id, conversation_id, role, content, sources, created_at, updated_at";

#[derive(sqlx::FromRow)]
struct MessageRow {
    id: Uuid,
    conversation_id: Uuid,
    role: String,
    content: String,
    sources: Option<Json<Vec<KnowledgeSource>>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<MessageRow> for Message {
    type Error = AgoraError;

    fn try_from(row: MessageRow) -> Result<Self, Self::Error> {
        Ok(Message {
            id: row.id,
            conversation_id: row.conversation_id,
            role: row.role.parse::<Role>()?,
            content: row.content,
            sources: row.sources.map(|Json(s)| s),
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

pub async fn create_conversation(
    pool: &PgPool,
    tables: &TableNames,
    title: &str,
) -> Result<Conversation, sqlx::Error> {
    sqlx::query_as::<_, Conversation>(&format!(
        "INSERT INTO {} (title) VALUES ($1) RETURNING {CONVERSATION_COLUMNS}",
        tables.conversations
    ))
    .bind(title)
    .fetch_one(pool)
    .await
}

/// Most recently active first.
pub async fn find_all_conversations(
    pool: &PgPool,
    tables: &TableNames,
) -> Result<Vec<Conversation>, sqlx::Error> {
    sqlx::query_as::<_, Conversation>(&format!(
        "SELECT {CONVERSATION_COLUMNS} FROM {} ORDER BY updated_at DESC",
        tables.conversations
    ))
    .fetch_all(pool)
    .await
}

pub async fn find_conversation_by_id(
    pool: &PgPool,
    tables: &TableNames,
    id: Uuid,
) -> Result<Option<Conversation>, sqlx::Error> {
    sqlx::query_as::<_, Conversation>(&format!(
        "SELECT {CONVERSATION_COLUMNS} FROM {} WHERE id = $1",
        tables.conversations
    ))
    .bind(id)
    .fetch_optional(pool)
    .await
}

pub async fn rename_conversation(
    pool: &PgPool,
    tables: &TableNames,
    id: Uuid,
    title: &str,
) -> Result<Option<Conversation>, sqlx::Error> {
    sqlx::query_as::<_, Conversation>(&format!(
        r#"
        UPDATE {}
        SET title = $2, updated_at = now()
        WHERE id = $1
        RETURNING {CONVERSATION_COLUMNS}
        "#,
        tables.conversations
    ))
    .bind(id)
    .bind(title)
    .fetch_optional(pool)
    .await
}

/// Messages go with the conversation via `ON DELETE CASCADE`.
pub async fn delete_conversation(
    pool: &PgPool,
    tables: &TableNames,
    id: Uuid,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(&format!("DELETE FROM {} WHERE id = $1", tables.conversations))
        .bind(id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Insert a message and bump the parent conversation's `updated_at` in one statement.
pub async fn insert_message(
    pool: &PgPool,
    tables: &TableNames,
    conversation_id: Uuid,
    role: Role,
    content: &str,
    sources: Option<&[KnowledgeSource]>,
) -> Result<Message, AgoraError> {
    let row = sqlx::query_as::<_, MessageRow>(&format!(
        r#"
        WITH inserted AS (
            INSERT INTO {messages} (conversation_id, role, content, sources)
            VALUES ($1, $2, $3, $4)
            RETURNING {MESSAGE_COLUMNS}
        ), touched AS (
            UPDATE {conversations} SET updated_at = now() WHERE id = $1
        )
        SELECT {MESSAGE_COLUMNS} FROM inserted
        "#,
        messages = tables.messages,
        conversations = tables.conversations,
    ))
    .bind(conversation_id)
    .bind(role.as_str())
    .bind(content)
    .bind(sources.map(|s| Json(s.to_vec())))
    .fetch_one(pool)
    .await?;

    Message::try_from(row)
}

/// Oldest first.
pub async fn find_messages_by_conversation_id(
    pool: &PgPool,
    tables: &TableNames,
    conversation_id: Uuid,
) -> Result<Vec<Message>, AgoraError> {
    let rows = sqlx::query_as::<_, MessageRow>(&format!(
        "SELECT {MESSAGE_COLUMNS} FROM {} WHERE conversation_id = $1 ORDER BY created_at ASC, id ASC",
        tables.messages
    ))
    .bind(conversation_id)
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(Message::try_from).collect()
}

//! One chat turn, from the user's message to a ready-to-stream relay.
//!
//! Everything that can fail with a proper HTTP status happens here, before the
//! first SSE byte is written: validation, conversation lookup or creation,
//! storing the user message, knowledge retrieval, and opening the completion.

use agora_core::completion::{start_completion, CompletionBackend};
use agora_core::db::TableNames;
use agora_core::models::{KnowledgeSource, Role, SendMessageRequest};
use agora_core::{AgoraConfig, AgoraError};
use sqlx::PgPool;
use uuid::Uuid;

use super::relay::{PersistFn, Relay};
use super::{chat, knowledge};

pub struct ChatTurn {
    pub conversation_id: Uuid,
    pub relay: Relay,
}

#[tracing::instrument(name = "chat_turn", skip_all, fields(conversation_id = ?request.conversation_id))]
pub async fn start_chat_turn(
    pool: &PgPool,
    tables: &TableNames,
    backend: &dyn CompletionBackend,
    config: &AgoraConfig,
    request: SendMessageRequest,
) -> Result<ChatTurn, AgoraError> {
    request.validate()?;

    let conversation_id = match request.conversation_id {
        Some(id) => chat::get_conversation(pool, tables, id).await?.id,
        None => {
            let title = chat::generate_title_from_message(&request.content);
            chat::create_conversation(pool, tables, &title).await?.id
        }
    };

    chat::add_message(pool, tables, conversation_id, Role::User, &request.content, None).await?;

    let knowledge =
        knowledge::build_knowledge_context(pool, &request.content, config.knowledge.context_limit)
            .await?;
    if !knowledge.sources.is_empty() {
        tracing::info!(
            conversation_id = %conversation_id,
            sources = knowledge.sources.len(),
            "Knowledge context attached"
        );
    }

    let history = chat::get_messages(pool, tables, conversation_id).await?;
    let completion = start_completion(
        backend,
        &history,
        &knowledge.context,
        config.llm.max_context_messages,
    )
    .await?;

    let persist = assistant_persister(
        pool.clone(),
        tables.clone(),
        conversation_id,
        knowledge.sources.clone(),
    );

    Ok(ChatTurn {
        conversation_id,
        relay: Relay::new(conversation_id, knowledge.sources, completion, persist),
    })
}

fn assistant_persister(
    pool: PgPool,
    tables: TableNames,
    conversation_id: Uuid,
    sources: Vec<KnowledgeSource>,
) -> PersistFn {
    Box::new(move |text| {
        Box::pin(async move {
            chat::add_message(
                &pool,
                &tables,
                conversation_id,
                Role::Assistant,
                &text,
                Some(&sources),
            )
            .await
            .map(|_| ())
        })
    })
}

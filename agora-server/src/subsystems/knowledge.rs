//! Knowledge service: validated CRUD, search, and prompt-context assembly
//! on top of [`knowledge_store`](super::knowledge_store).

use agora_core::models::{
    CreateKnowledgeEntry, KnowledgeEntry, KnowledgeSource, UpdateKnowledgeEntry,
};
use agora_core::AgoraError;
use sqlx::PgPool;
use uuid::Uuid;

use super::knowledge_store;

const ENTRY_KIND: &str = "Knowledge entry";

/// Retrieved knowledge formatted for the system prompt, plus its citations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KnowledgeContext {
    pub context: String,
    pub sources: Vec<KnowledgeSource>,
}

pub async fn list_entries(pool: &PgPool) -> Result<Vec<KnowledgeEntry>, AgoraError> {
    Ok(knowledge_store::find_all(pool).await?)
}

#[tracing::instrument(skip(pool))]
pub async fn get_entry(pool: &PgPool, id: Uuid) -> Result<KnowledgeEntry, AgoraError> {
    knowledge_store::find_by_id(pool, id)
        .await?
        .ok_or_else(|| AgoraError::not_found(ENTRY_KIND, id))
}

#[tracing::instrument(skip_all, fields(title = %input.title))]
pub async fn create_entry(
    pool: &PgPool,
    input: &CreateKnowledgeEntry,
) -> Result<KnowledgeEntry, AgoraError> {
    input.validate()?;
    let entry = knowledge_store::create(pool, input).await?;
    tracing::info!(id = %entry.id, contributor = %entry.contributor, "Knowledge entry created");
    Ok(entry)
}

#[tracing::instrument(skip(pool, input))]
pub async fn update_entry(
    pool: &PgPool,
    id: Uuid,
    input: &UpdateKnowledgeEntry,
) -> Result<KnowledgeEntry, AgoraError> {
    input.validate()?;
    let entry = knowledge_store::update(pool, id, input)
        .await?
        .ok_or_else(|| AgoraError::not_found(ENTRY_KIND, id))?;
    tracing::info!(id = %entry.id, "Knowledge entry updated");
    Ok(entry)
}

#[tracing::instrument(skip(pool))]
pub async fn delete_entry(pool: &PgPool, id: Uuid) -> Result<(), AgoraError> {
    if !knowledge_store::delete_by_id(pool, id).await? {
        return Err(AgoraError::not_found(ENTRY_KIND, id));
    }
    tracing::info!(id = %id, "Knowledge entry deleted");
    Ok(())
}

#[tracing::instrument(skip(pool))]
pub async fn search_entries(
    pool: &PgPool,
    query: &str,
    limit: u32,
) -> Result<Vec<KnowledgeEntry>, AgoraError> {
    let entries = knowledge_store::full_text_search(pool, query, limit).await?;
    tracing::debug!(query = %query, limit, found = entries.len(), "Knowledge search completed");
    Ok(entries)
}

/// Search the knowledge base with the user's message and format the hits.
///
/// An empty result yields an empty context and no sources.
pub async fn build_knowledge_context(
    pool: &PgPool,
    user_message: &str,
    limit: u32,
) -> Result<KnowledgeContext, AgoraError> {
    let entries = search_entries(pool, user_message, limit).await?;
    Ok(format_knowledge_context(&entries))
}

/// Render entries as numbered, attributed sections that the model can cite.
pub fn format_knowledge_context(entries: &[KnowledgeEntry]) -> KnowledgeContext {
    if entries.is_empty() {
        return KnowledgeContext::default();
    }

    let mut lines = Vec::with_capacity(entries.len() + 4);
    lines.push("## Relevant Knowledge Base Entries".to_string());
    lines.push(String::new());
    for (i, entry) in entries.iter().enumerate() {
        lines.push(format!(
            "### [{}] {} (by {})\n{}",
            i + 1,
            entry.title,
            entry.contributor,
            entry.content
        ));
    }
    lines.push(String::new());
    lines.push(
        "Use the above knowledge to inform your answer. Cite sources by number [1], [2] etc. when using them."
            .to_string(),
    );

    KnowledgeContext {
        context: lines.join("\n"),
        sources: entries.iter().map(KnowledgeSource::from).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn entry(title: &str, contributor: &str, content: &str) -> KnowledgeEntry {
        KnowledgeEntry {
            id: Uuid::new_v4(),
            title: title.to_string(),
            content: content.to_string(),
            tags: vec![],
            contributor: contributor.to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_empty_results_give_empty_context() {
        let ctx = format_knowledge_context(&[]);
        assert!(ctx.context.is_empty());
        assert!(ctx.sources.is_empty());
    }

    #[test]
    fn test_context_numbers_and_attributes_entries() {
        let entries = vec![
            entry("Graceful shutdown", "ana", "Use a broadcast channel."),
            entry("Pool sizing", "ben", "Five connections is plenty."),
        ];
        let ctx = format_knowledge_context(&entries);

        let expected = "## Relevant Knowledge Base Entries\n\
                        \n\
                        ### [1] Graceful shutdown (by ana)\nUse a broadcast channel.\n\
                        ### [2] Pool sizing (by ben)\nFive connections is plenty.\n\
                        \n\
                        Use the above knowledge to inform your answer. Cite sources by number [1], [2] etc. when using them.";
        assert_eq!(ctx.context, expected);
    }

    #[test]
    fn test_sources_follow_result_order() {
        let entries = vec![entry("b", "x", "..."), entry("a", "y", "...")];
        let ctx = format_knowledge_context(&entries);
        assert_eq!(ctx.sources.len(), 2);
        assert_eq!(ctx.sources[0].id, entries[0].id);
        assert_eq!(ctx.sources[0].title, "b");
        assert_eq!(ctx.sources[1].contributor, "y");
    }
}

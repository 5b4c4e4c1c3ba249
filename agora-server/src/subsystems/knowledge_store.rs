//! Knowledge repository: SQL against the shared `knowledge_entries` table.
//!
//! Search is two-tier:
//! - Full-text search over the trigger-maintained `search_vector` (title weight A,
//!   content weight B) with OR semantics between query terms, ranked by `ts_rank`
//! - If that matches nothing, a case-insensitive substring match on title or
//!   content for up to 5 significant query words, newest first

use agora_core::db::KNOWLEDGE_TABLE;
use agora_core::models::{CreateKnowledgeEntry, KnowledgeEntry, UpdateKnowledgeEntry};
use sqlx::PgPool;
use uuid::Uuid;

const ENTRY_COLUMNS: &str = "id, title, content, tags, contributor, created_at, updated_at";

/// Words of this many characters or fewer are ignored by the substring fallback.
const MIN_WORD_CHARS: usize = 2;

/// At most this many query words feed the substring fallback.
const MAX_FALLBACK_WORDS: usize = 5;

pub async fn find_all(pool: &PgPool) -> Result<Vec<KnowledgeEntry>, sqlx::Error> {
    sqlx::query_as::<_, KnowledgeEntry>(&format!(
        "SELECT {ENTRY_COLUMNS} FROM {KNOWLEDGE_TABLE} ORDER BY created_at DESC"
    ))
    .fetch_all(pool)
    .await
}

pub async fn find_by_id(pool: &PgPool, id: Uuid) -> Result<Option<KnowledgeEntry>, sqlx::Error> {
    sqlx::query_as::<_, KnowledgeEntry>(&format!(
        "SELECT {ENTRY_COLUMNS} FROM {KNOWLEDGE_TABLE} WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await
}

pub async fn create(
    pool: &PgPool,
    input: &CreateKnowledgeEntry,
) -> Result<KnowledgeEntry, sqlx::Error> {
    sqlx::query_as::<_, KnowledgeEntry>(&format!(
        r#"
        INSERT INTO {KNOWLEDGE_TABLE} (title, content, tags, contributor)
        VALUES ($1, $2, $3, $4)
        RETURNING {ENTRY_COLUMNS}
        "#
    ))
    .bind(&input.title)
    .bind(&input.content)
    .bind(&input.tags)
    .bind(&input.contributor)
    .fetch_one(pool)
    .await
}

/// Partial update; absent fields keep their stored value. `None` if the id is unknown.
pub async fn update(
    pool: &PgPool,
    id: Uuid,
    input: &UpdateKnowledgeEntry,
) -> Result<Option<KnowledgeEntry>, sqlx::Error> {
    sqlx::query_as::<_, KnowledgeEntry>(&format!(
        r#"
        UPDATE {KNOWLEDGE_TABLE}
        SET title = COALESCE($2, title),
            content = COALESCE($3, content),
            tags = COALESCE($4, tags),
            contributor = COALESCE($5, contributor),
            updated_at = now()
        WHERE id = $1
        RETURNING {ENTRY_COLUMNS}
        "#
    ))
    .bind(id)
    .bind(&input.title)
    .bind(&input.content)
    .bind(&input.tags)
    .bind(&input.contributor)
    .fetch_optional(pool)
    .await
}

pub async fn delete_by_id(pool: &PgPool, id: Uuid) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(&format!("DELETE FROM {KNOWLEDGE_TABLE} WHERE id = $1"))
        .bind(id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Ranked full-text search, falling back to a recency-ordered substring match.
///
/// `plainto_tsquery` joins lexemes with `&`; rewriting those to `|` gives OR
/// semantics for multi-word queries.
pub async fn full_text_search(
    pool: &PgPool,
    query: &str,
    limit: u32,
) -> Result<Vec<KnowledgeEntry>, sqlx::Error> {
    let ranked = sqlx::query_as::<_, KnowledgeEntry>(&format!(
        r#"
        WITH q AS (
            SELECT replace(plainto_tsquery('english', $1)::text, ' & ', ' | ')::tsquery AS query
        )
        SELECT {ENTRY_COLUMNS}
        FROM {KNOWLEDGE_TABLE}, q
        WHERE search_vector @@ q.query
        ORDER BY ts_rank(search_vector, q.query) DESC, created_at DESC
        LIMIT $2
        "#
    ))
    .bind(query)
    .bind(i64::from(limit))
    .fetch_all(pool)
    .await?;

    if !ranked.is_empty() {
        return Ok(ranked);
    }

    let patterns: Vec<String> = significant_words(query)
        .iter()
        .map(|w| ilike_pattern(w))
        .collect();
    if patterns.is_empty() {
        return Ok(Vec::new());
    }

    tracing::debug!(words = patterns.len(), "Full-text search empty, using substring fallback");

    sqlx::query_as::<_, KnowledgeEntry>(&format!(
        r#"
        SELECT {ENTRY_COLUMNS}
        FROM {KNOWLEDGE_TABLE}
        WHERE title ILIKE ANY($1) OR content ILIKE ANY($1)
        ORDER BY created_at DESC
        LIMIT $2
        "#
    ))
    .bind(&patterns)
    .bind(i64::from(limit))
    .fetch_all(pool)
    .await
}

/// Whitespace-separated words longer than two characters, first five only.
pub fn significant_words(query: &str) -> Vec<&str> {
    query
        .split_whitespace()
        .filter(|w| w.chars().count() > MIN_WORD_CHARS)
        .take(MAX_FALLBACK_WORDS)
        .collect()
}

/// `%word%` with LIKE metacharacters escaped (backslash is Postgres' default escape).
fn ilike_pattern(word: &str) -> String {
    let mut escaped = String::with_capacity(word.len() + 2);
    escaped.push('%');
    for c in word.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped.push('%');
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_significant_words_drops_short_words() {
        assert_eq!(
            significant_words("how do I use an axum router"),
            vec!["how", "use", "axum", "router"]
        );
    }

    #[test]
    fn test_significant_words_caps_at_five() {
        assert_eq!(
            significant_words("alpha beta gamma delta epsilon zeta eta"),
            vec!["alpha", "beta", "gamma", "delta", "epsilon"]
        );
    }

    #[test]
    fn test_all_short_words_yield_nothing() {
        assert!(significant_words("a is to be of").is_empty());
        assert!(significant_words("   ").is_empty());
    }

    #[test]
    fn test_significant_words_counts_characters() {
        // three chars, six bytes
        assert_eq!(significant_words("日本語 ab"), vec!["日本語"]);
    }

    #[test]
    fn test_ilike_pattern_wraps_and_escapes() {
        assert_eq!(ilike_pattern("tokio"), "%tokio%");
        assert_eq!(ilike_pattern("100%"), "%100\\%%");
        assert_eq!(ilike_pattern("snake_case"), "%snake\\_case%");
        assert_eq!(ilike_pattern(r"C:\path"), r"%C:\\path%");
    }
}

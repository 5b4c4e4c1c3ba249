use crate::config::DatabaseConfig;
use sqlx::{postgres::PgPoolOptions, PgPool};

/// Shared, never-prefixed knowledge table.
pub const KNOWLEDGE_TABLE: &str = "knowledge_entries";

/// Shared, never-prefixed users table (synced from an external auth provider).
pub const USERS_TABLE: &str = "users";

const SEARCH_TRIGGER: &str = "trg_knowledge_search_vector";

pub async fn create_pool(config: &DatabaseConfig) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&config.url)
        .await
}

pub async fn health_check(pool: &PgPool) -> Result<String, sqlx::Error> {
    let row: (String,) = sqlx::query_as("SELECT version()").fetch_one(pool).await?;
    Ok(row.0)
}

/// Returns true when the trigger maintaining `knowledge_entries.search_vector` is installed.
pub async fn check_search_trigger(pool: &PgPool) -> Result<bool, sqlx::Error> {
    let row: (bool,) =
        sqlx::query_as("SELECT EXISTS (SELECT 1 FROM pg_trigger WHERE tgname = $1)")
            .bind(SEARCH_TRIGGER)
            .fetch_one(pool)
            .await?;
    Ok(row.0)
}

/// Resolved names of the per-tenant tables.
///
/// The prefix is validated at config load time (`[A-Za-z0-9_]` only), which is
/// what makes it safe to splice these names into SQL text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableNames {
    pub projects: String,
    pub conversations: String,
    pub messages: String,
}

impl TableNames {
    pub fn new(prefix: &str) -> Self {
        let p = |name: &str| {
            if prefix.is_empty() {
                name.to_string()
            } else {
                format!("{prefix}_{name}")
            }
        };
        Self {
            projects: p("projects"),
            conversations: p("chat_conversations"),
            messages: p("chat_messages"),
        }
    }

    pub fn from_config(config: &DatabaseConfig) -> Self {
        Self::new(&config.table_prefix)
    }
}

impl Default for TableNames {
    fn default() -> Self {
        Self::new("")
    }
}

fn schema_statements(tables: &TableNames) -> Vec<String> {
    let TableNames {
        projects,
        conversations,
        messages,
    } = tables;

    vec![
        format!(
            r#"CREATE TABLE IF NOT EXISTS "{USERS_TABLE}" (
                "id" uuid PRIMARY KEY,
                "email" text NOT NULL,
                "display_name" text,
                "avatar_url" text,
                "created_at" timestamptz DEFAULT now() NOT NULL,
                "updated_at" timestamptz DEFAULT now() NOT NULL
            )"#
        ),
        format!(
            r#"CREATE TABLE IF NOT EXISTS "{projects}" (
                "id" uuid PRIMARY KEY DEFAULT gen_random_uuid(),
                "name" text NOT NULL,
                "slug" text NOT NULL,
                "description" text,
                "is_public" boolean DEFAULT false NOT NULL,
                "owner_id" uuid NOT NULL REFERENCES "{USERS_TABLE}"("id") ON DELETE CASCADE,
                "created_at" timestamptz DEFAULT now() NOT NULL,
                "updated_at" timestamptz DEFAULT now() NOT NULL,
                CONSTRAINT "{projects}_slug_unique" UNIQUE("slug")
            )"#
        ),
        format!(
            r#"CREATE TABLE IF NOT EXISTS "{conversations}" (
                "id" uuid PRIMARY KEY DEFAULT gen_random_uuid(),
                "title" text NOT NULL,
                "created_at" timestamptz DEFAULT now() NOT NULL,
                "updated_at" timestamptz DEFAULT now() NOT NULL
            )"#
        ),
        format!(
            r#"CREATE TABLE IF NOT EXISTS "{messages}" (
                "id" uuid PRIMARY KEY DEFAULT gen_random_uuid(),
                "conversation_id" uuid NOT NULL REFERENCES "{conversations}"("id") ON DELETE CASCADE,
                "role" text NOT NULL,
                "content" text NOT NULL,
                "sources" jsonb,
                "created_at" timestamptz DEFAULT now() NOT NULL,
                "updated_at" timestamptz DEFAULT now() NOT NULL
            )"#
        ),
        format!(r#"ALTER TABLE "{messages}" ADD COLUMN IF NOT EXISTS "sources" jsonb"#),
        format!(
            r#"CREATE INDEX IF NOT EXISTS "idx_{messages}_conversation"
                ON "{messages}" ("conversation_id", "created_at")"#
        ),
        format!(
            r#"CREATE TABLE IF NOT EXISTS "{KNOWLEDGE_TABLE}" (
                "id" uuid PRIMARY KEY DEFAULT gen_random_uuid(),
                "title" varchar(200) NOT NULL,
                "content" text NOT NULL,
                "tags" text[] NOT NULL DEFAULT '{{}}',
                "contributor" varchar(100) NOT NULL,
                "created_at" timestamptz DEFAULT now() NOT NULL,
                "updated_at" timestamptz DEFAULT now() NOT NULL
            )"#
        ),
        format!(r#"ALTER TABLE "{KNOWLEDGE_TABLE}" ADD COLUMN IF NOT EXISTS "search_vector" tsvector"#),
        r#"CREATE OR REPLACE FUNCTION knowledge_search_vector_update() RETURNS trigger AS $$
            BEGIN
              NEW.search_vector :=
                setweight(to_tsvector('english', COALESCE(NEW.title, '')), 'A') ||
                setweight(to_tsvector('english', COALESCE(NEW.content, '')), 'B');
              RETURN NEW;
            END $$ LANGUAGE plpgsql"#
            .to_string(),
        format!(r#"DROP TRIGGER IF EXISTS {SEARCH_TRIGGER} ON "{KNOWLEDGE_TABLE}""#),
        format!(
            r#"CREATE TRIGGER {SEARCH_TRIGGER}
                BEFORE INSERT OR UPDATE ON "{KNOWLEDGE_TABLE}"
                FOR EACH ROW EXECUTE FUNCTION knowledge_search_vector_update()"#
        ),
        format!(
            r#"CREATE INDEX IF NOT EXISTS idx_knowledge_search
                ON "{KNOWLEDGE_TABLE}" USING GIN(search_vector)"#
        ),
    ]
}

/// Create every application table, the FTS trigger and indexes. Idempotent.
pub async fn setup_schema(pool: &PgPool, tables: &TableNames) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;
    for statement in schema_statements(tables) {
        sqlx::query(&statement).execute(&mut *tx).await?;
    }
    tx.commit().await?;

    tracing::info!(
        conversations = %tables.conversations,
        messages = %tables.messages,
        projects = %tables.projects,
        "Database schema ready"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_names_without_prefix() {
        let t = TableNames::new("");
        assert_eq!(t.conversations, "chat_conversations");
        assert_eq!(t.messages, "chat_messages");
        assert_eq!(t.projects, "projects");
    }

    #[test]
    fn test_table_names_with_prefix() {
        let t = TableNames::new("cole");
        assert_eq!(t.conversations, "cole_chat_conversations");
        assert_eq!(t.messages, "cole_chat_messages");
        assert_eq!(t.projects, "cole_projects");
    }

    #[test]
    fn test_shared_tables_never_prefixed() {
        let statements = schema_statements(&TableNames::new("tenant"));
        let joined = statements.join("\n");
        assert!(joined.contains(r#""users""#));
        assert!(joined.contains(r#""knowledge_entries""#));
        assert!(!joined.contains("tenant_users"));
        assert!(!joined.contains("tenant_knowledge_entries"));
        assert!(joined.contains(r#"REFERENCES "tenant_chat_conversations"("id") ON DELETE CASCADE"#));
    }

    #[test]
    fn test_knowledge_tags_default_is_empty_array_literal() {
        let statements = schema_statements(&TableNames::default());
        assert!(statements
            .iter()
            .any(|s| s.contains(r#""tags" text[] NOT NULL DEFAULT '{}'"#)));
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::check_len;
use crate::error::AgoraError;

pub const TITLE_MAX: usize = 200;
pub const CONTENT_MAX: usize = 50_000;
pub const TAGS_MAX: usize = 10;
pub const TAG_MAX: usize = 50;
pub const CONTRIBUTOR_MAX: usize = 100;
pub const QUERY_MAX: usize = 500;
pub const SEARCH_LIMIT_DEFAULT: u32 = 5;
pub const SEARCH_LIMIT_MAX: u32 = 20;

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct KnowledgeEntry {
    pub id: Uuid,
    pub title: String,
    pub content: String,
    pub tags: Vec<String>,
    pub contributor: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Citation snapshot stored alongside assistant messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnowledgeSource {
    pub id: Uuid,
    pub title: String,
    pub contributor: String,
}

impl From<&KnowledgeEntry> for KnowledgeSource {
    fn from(entry: &KnowledgeEntry) -> Self {
        Self {
            id: entry.id,
            title: entry.title.clone(),
            contributor: entry.contributor.clone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateKnowledgeEntry {
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub contributor: String,
}

impl CreateKnowledgeEntry {
    pub fn validate(&self) -> Result<(), AgoraError> {
        check_len("title", &self.title, 1, TITLE_MAX)?;
        check_len("content", &self.content, 1, CONTENT_MAX)?;
        validate_tags(&self.tags)?;
        check_len("contributor", &self.contributor, 1, CONTRIBUTOR_MAX)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateKnowledgeEntry {
    pub title: Option<String>,
    pub content: Option<String>,
    pub tags: Option<Vec<String>>,
    pub contributor: Option<String>,
}

impl UpdateKnowledgeEntry {
    pub fn validate(&self) -> Result<(), AgoraError> {
        if let Some(title) = &self.title {
            check_len("title", title, 1, TITLE_MAX)?;
        }
        if let Some(content) = &self.content {
            check_len("content", content, 1, CONTENT_MAX)?;
        }
        if let Some(tags) = &self.tags {
            validate_tags(tags)?;
        }
        if let Some(contributor) = &self.contributor {
            check_len("contributor", contributor, 1, CONTRIBUTOR_MAX)?;
        }
        Ok(())
    }
}

fn validate_tags(tags: &[String]) -> Result<(), AgoraError> {
    if tags.len() > TAGS_MAX {
        return Err(AgoraError::validation(format!(
            "tags must contain at most {TAGS_MAX} items (got {})",
            tags.len()
        )));
    }
    for tag in tags {
        check_len("tag", tag, 1, TAG_MAX)?;
    }
    Ok(())
}

/// Raw `?q=&limit=` query string. `limit` stays a string so a malformed value
/// is reported as a validation error instead of an extractor rejection.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchKnowledgeQuery {
    pub q: Option<String>,
    pub limit: Option<String>,
}

impl SearchKnowledgeQuery {
    /// Returns `Ok(None)` when no query was given (list mode).
    pub fn validate(&self) -> Result<Option<(String, u32)>, AgoraError> {
        let q = match self.q.as_deref() {
            None | Some("") => return Ok(None),
            Some(q) => q,
        };
        check_len("q", q, 1, QUERY_MAX)?;

        let limit = match self.limit.as_deref().map(str::trim) {
            None | Some("") => SEARCH_LIMIT_DEFAULT,
            Some(raw) => raw
                .parse::<u32>()
                .map_err(|_| AgoraError::validation(format!("limit must be an integer: {raw:?}")))?,
        };
        if !(1..=SEARCH_LIMIT_MAX).contains(&limit) {
            return Err(AgoraError::validation(format!(
                "limit must be between 1 and {SEARCH_LIMIT_MAX}"
            )));
        }
        Ok(Some((q.to_string(), limit)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(tags: usize) -> CreateKnowledgeEntry {
        CreateKnowledgeEntry {
            title: "Borrow checker tips".to_string(),
            content: "Prefer slices over owned vectors in parameters.".to_string(),
            tags: (0..tags).map(|i| format!("tag{i}")).collect(),
            contributor: "sam".to_string(),
        }
    }

    #[test]
    fn test_create_accepts_ten_tags() {
        assert!(entry(10).validate().is_ok());
    }

    #[test]
    fn test_create_rejects_eleven_tags() {
        let err = entry(11).validate().unwrap_err();
        assert!(matches!(err, AgoraError::Validation(_)));
        assert!(err.to_string().contains("tags"));
    }

    #[test]
    fn test_create_rejects_long_title_and_empty_contributor() {
        let mut e = entry(0);
        e.title = "x".repeat(201);
        assert!(e.validate().is_err());

        let mut e = entry(0);
        e.contributor = String::new();
        assert!(e.validate().is_err());
    }

    #[test]
    fn test_create_counts_characters_not_bytes() {
        let mut e = entry(0);
        e.title = "é".repeat(200);
        assert!(e.validate().is_ok(), "200 two-byte chars is within the limit");
    }

    #[test]
    fn test_nul_character_is_rejected_in_any_field() {
        let mut e = entry(0);
        e.content = "a\0b".to_string();
        assert!(e.validate().is_err());

        let mut e = entry(0);
        e.tags = vec!["ok".to_string(), "b\0d".to_string()];
        assert!(e.validate().is_err());

        let q = SearchKnowledgeQuery {
            q: Some("tok\0io".to_string()),
            limit: None,
        };
        assert!(q.validate().is_err());
    }

    #[test]
    fn test_create_rejects_overlong_tag() {
        let mut e = entry(0);
        e.tags = vec!["t".repeat(51)];
        assert!(e.validate().is_err());
    }

    #[test]
    fn test_tags_default_to_empty_when_absent() {
        let e: CreateKnowledgeEntry = serde_json::from_value(serde_json::json!({
            "title": "t", "content": "c", "contributor": "me"
        }))
        .unwrap();
        assert!(e.tags.is_empty());
    }

    #[test]
    fn test_update_validates_only_present_fields() {
        assert!(UpdateKnowledgeEntry::default().validate().is_ok());
        let update = UpdateKnowledgeEntry {
            content: Some(String::new()),
            ..Default::default()
        };
        assert!(update.validate().is_err());
    }

    #[test]
    fn test_search_query_defaults_limit() {
        let q = SearchKnowledgeQuery {
            q: Some("tokio".to_string()),
            limit: None,
        };
        assert_eq!(q.validate().unwrap(), Some(("tokio".to_string(), 5)));
    }

    #[test]
    fn test_search_query_limit_bounds() {
        for bad in ["0", "21", "abc", "-1"] {
            let q = SearchKnowledgeQuery {
                q: Some("tokio".to_string()),
                limit: Some(bad.to_string()),
            };
            assert!(q.validate().is_err(), "limit {bad} should be rejected");
        }
        let q = SearchKnowledgeQuery {
            q: Some("tokio".to_string()),
            limit: Some("20".to_string()),
        };
        assert_eq!(q.validate().unwrap().unwrap().1, 20);
    }

    #[test]
    fn test_search_query_absent_means_list() {
        assert!(SearchKnowledgeQuery::default().validate().unwrap().is_none());
    }

    #[test]
    fn test_source_serializes_snapshot_fields() {
        let source = KnowledgeSource {
            id: Uuid::nil(),
            title: "Title".to_string(),
            contributor: "ana".to_string(),
        };
        let v = serde_json::to_value(&source).unwrap();
        assert_eq!(v["title"], "Title");
        assert_eq!(v["contributor"], "ana");
        assert_eq!(v.as_object().unwrap().len(), 3);
    }
}

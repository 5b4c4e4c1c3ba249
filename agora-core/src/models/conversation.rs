use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::check_len;
use super::knowledge::KnowledgeSource;
use crate::error::AgoraError;

pub const CONVERSATION_TITLE_MAX: usize = 200;
pub const MESSAGE_CONTENT_MAX: usize = 10_000;

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: Uuid,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = AgoraError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            other => Err(AgoraError::Other(format!("unknown message role: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub role: Role,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sources: Option<Vec<KnowledgeSource>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    pub content: String,
    pub conversation_id: Option<Uuid>,
}

impl SendMessageRequest {
    pub fn validate(&self) -> Result<(), AgoraError> {
        if self.content.trim().is_empty() {
            return Err(AgoraError::validation("content must not be empty"));
        }
        check_len("content", &self.content, 1, MESSAGE_CONTENT_MAX)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateConversationRequest {
    pub title: String,
}

impl UpdateConversationRequest {
    pub fn validate(&self) -> Result<(), AgoraError> {
        check_len("title", self.title.trim(), 1, CONVERSATION_TITLE_MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_round_trips_through_text_column() {
        for role in [Role::User, Role::Assistant] {
            assert_eq!(role.as_str().parse::<Role>().unwrap(), role);
        }
        assert!("system".parse::<Role>().is_err());
    }

    #[test]
    fn test_send_request_accepts_camel_case_conversation_id() {
        let id = Uuid::new_v4();
        let req: SendMessageRequest = serde_json::from_value(serde_json::json!({
            "content": "hello",
            "conversationId": id,
        }))
        .unwrap();
        assert_eq!(req.conversation_id, Some(id));
        assert!(req.validate().is_ok());
    }

    #[test]
    fn test_send_request_rejects_blank_content() {
        let req = SendMessageRequest {
            content: "   ".to_string(),
            conversation_id: None,
        };
        assert!(matches!(req.validate(), Err(AgoraError::Validation(_))));
    }

    #[test]
    fn test_message_omits_absent_sources() {
        let msg = Message {
            id: Uuid::nil(),
            conversation_id: Uuid::nil(),
            role: Role::User,
            content: "hi".to_string(),
            sources: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let v = serde_json::to_value(&msg).unwrap();
        assert!(v.get("sources").is_none());
        assert_eq!(v["role"], "user");
        assert!(v.get("conversationId").is_some());
    }

    #[test]
    fn test_rename_rejects_blank_title() {
        let req = UpdateConversationRequest {
            title: "  ".to_string(),
        };
        assert!(req.validate().is_err());
    }
}

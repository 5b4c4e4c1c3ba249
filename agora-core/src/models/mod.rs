pub mod conversation;
pub mod knowledge;

pub use conversation::{Conversation, Message, Role, SendMessageRequest, UpdateConversationRequest};
pub use knowledge::{
    CreateKnowledgeEntry, KnowledgeEntry, KnowledgeSource, SearchKnowledgeQuery,
    UpdateKnowledgeEntry,
};

use crate::error::AgoraError;

/// Check a string field's length in characters against an inclusive range.
pub(crate) fn check_len(
    field: &str,
    value: &str,
    min: usize,
    max: usize,
) -> Result<(), AgoraError> {
    if value.contains('\0') {
        return Err(AgoraError::validation(format!(
            "{field} must not contain NUL characters"
        )));
    }
    let len = value.chars().count();
    if len < min {
        return Err(AgoraError::validation(format!(
            "{field} must be at least {min} character(s)"
        )));
    }
    if len > max {
        return Err(AgoraError::validation(format!(
            "{field} must be at most {max} characters (got {len})"
        )));
    }
    Ok(())
}

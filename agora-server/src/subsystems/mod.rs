pub mod chat;
pub mod chat_store;
pub mod knowledge;
pub mod knowledge_store;
pub mod relay;
pub mod send;

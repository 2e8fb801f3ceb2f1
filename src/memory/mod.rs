//! 记忆层：会话历史、知识库、会话检查点

pub mod conversation;
pub mod knowledge;
pub mod session_store;
pub mod tokenizer;

pub use conversation::{last_user_request, prune, Message, Role};
pub use knowledge::{chunk_text, KnowledgeHit, KnowledgeIndex, KnowledgeStore, UNKNOWN_SOURCE};
pub use session_store::{Checkpoint, InMemorySessionStore, SessionStore, SqliteSessionStore};

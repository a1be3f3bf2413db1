//! 记忆层：会话历史（短期）、向量检索（长期）与侧车持久化

pub mod conversation;
pub mod persistence;
pub mod session;
pub mod vector;

pub use conversation::{Message, Role};
pub use persistence::{MemoryRecord, MemorySidecar, SIDECAR_FILE};
pub use session::{CompactionFn, Metadata, Session, SessionStore, COMPACTED_PREFIX};
pub use vector::{SearchHit, VectorMemory};

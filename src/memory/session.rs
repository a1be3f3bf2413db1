//! 会话存储：按会话 ID 保存对话历史与元数据
//!
//! 整个存储共用一把锁，所有读写串行；append / update_metadata 在会话不存在时自动创建。
//! compact_history 把较早的前缀交给调用方提供的压缩函数，替换为一条 system 摘要消息。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::core::error::SessionError;
use crate::memory::conversation::{Message, Role};

/// 压缩摘要前缀
pub const COMPACTED_PREFIX: &str = "[COMPACTED]: ";

/// 会话元数据
pub type Metadata = HashMap<String, Value>;

/// 压缩函数：`CompactionFn(Sequence<Message>) -> String`
///
/// 在存储锁内被调用，不能回调同一个 SessionStore。
pub trait CompactionFn {
    fn summarize(&self, messages: &[Arc<Message>]) -> String;
}

impl<F> CompactionFn for F
where
    F: Fn(&[Arc<Message>]) -> String,
{
    fn summarize(&self, messages: &[Arc<Message>]) -> String {
        self(messages)
    }
}

/// 单个会话
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
    pub history: Vec<Arc<Message>>,
    pub metadata: Metadata,
}

impl Session {
    fn new(id: &str, metadata: Metadata) -> Self {
        let now = Utc::now();
        Self {
            id: id.to_string(),
            created_at: now,
            last_active: now,
            history: Vec::new(),
            metadata,
        }
    }

    fn touch(&mut self) {
        self.last_active = Utc::now();
    }
}

/// 线程安全的会话存储；可在 Worker 池的阻塞线程中直接使用
#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: Mutex<HashMap<String, Session>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Session>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 新建会话；同 ID 已存在时覆盖
    pub fn create_session(&self, id: &str, metadata: Metadata) {
        self.lock().insert(id.to_string(), Session::new(id, metadata));
    }

    /// 追加一条消息（会话不存在时以空元数据创建）
    pub fn append(&self, id: &str, role: Role, content: impl Into<String>) {
        let mut sessions = self.lock();
        let session = sessions
            .entry(id.to_string())
            .or_insert_with(|| Session::new(id, Metadata::new()));
        session.history.push(Arc::new(Message::new(role, content)));
        session.touch();
    }

    /// 最近 `limit` 条消息（按时间顺序）；未知会话返回空
    pub fn get_history(&self, id: &str, limit: usize) -> Vec<Arc<Message>> {
        let sessions = self.lock();
        let Some(session) = sessions.get(id) else {
            return Vec::new();
        };
        let start = session.history.len().saturating_sub(limit);
        session.history[start..].to_vec()
    }

    pub fn get_metadata(&self, id: &str) -> Metadata {
        self.lock()
            .get(id)
            .map(|s| s.metadata.clone())
            .unwrap_or_default()
    }

    /// 设置一个元数据键（会话不存在时自动创建）
    pub fn update_metadata(&self, id: &str, key: &str, value: Value) {
        let mut sessions = self.lock();
        let session = sessions
            .entry(id.to_string())
            .or_insert_with(|| Session::new(id, Metadata::new()));
        session.metadata.insert(key.to_string(), value);
        session.touch();
    }

    /// 压缩历史：保留最后 keep_last 条，其余前缀替换为一条 system 摘要。
    ///
    /// 返回是否实际执行了压缩；历史长度不超过 keep_last 时为 no-op。
    pub fn compact_history<C>(&self, id: &str, compaction: C, keep_last: usize) -> Result<bool, SessionError>
    where
        C: CompactionFn,
    {
        if id.trim().is_empty() {
            return Err(SessionError::InvalidSessionId(id.to_string()));
        }

        let mut sessions = self.lock();
        let Some(session) = sessions.get_mut(id) else {
            return Ok(false);
        };
        let len = session.history.len();
        if len <= keep_last {
            return Ok(false);
        }

        let split = len - keep_last;
        let summary = compaction.summarize(&session.history[..split]);
        let tail = session.history.split_off(split);

        let mut compacted = Vec::with_capacity(keep_last + 1);
        compacted.push(Arc::new(Message::system(format!(
            "{}{}",
            COMPACTED_PREFIX, summary
        ))));
        compacted.extend(tail);
        session.history = compacted;
        session.touch();

        tracing::debug!(session = id, removed = split, "history compacted");
        Ok(true)
    }

    /// 删除会话；未知 ID 为 no-op
    pub fn delete_session(&self, id: &str) {
        self.lock().remove(id);
    }

    pub fn session_count(&self) -> usize {
        self.lock().len()
    }

    pub fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn last_active(&self, id: &str) -> Option<DateTime<Utc>> {
        self.lock().get(id).map(|s| s.last_active)
    }

    /// 清理空闲超过 `max_idle` 的会话，返回清理数量
    pub fn cleanup_idle(&self, max_idle: Duration) -> usize {
        let cutoff = match chrono::Duration::from_std(max_idle) {
            Ok(d) => Utc::now() - d,
            Err(_) => return 0,
        };
        let mut sessions = self.lock();
        let before = sessions.len();
        sessions.retain(|_, s| s.last_active >= cutoff);
        let removed = before - sessions.len();
        if removed > 0 {
            tracing::info!("Cleaned up {} idle sessions", removed);
        }
        removed
    }
}

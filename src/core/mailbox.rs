//! Agent-to-Agent 信箱路由
//!
//! 每个命名信箱是一条独立的 FIFO 队列：register 创建（幂等），unregister 销毁并丢弃未投递消息。
//! send 不阻塞；recv 挂起直到有消息、超时（返回 None）或信箱被注销（返回 NotRegistered）。

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{Notify, RwLock};
use tokio_util::sync::CancellationToken;

use crate::core::error::MailboxError;

/// 单个信箱
struct Inbox<M> {
    queue: Mutex<VecDeque<M>>,
    ready: Notify,
    /// 注销时触发，唤醒仍在等待的 recv
    closed: CancellationToken,
}

impl<M> Inbox<M> {
    fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            ready: Notify::new(),
            closed: CancellationToken::new(),
        }
    }

    fn queue(&self) -> MutexGuard<'_, VecDeque<M>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, message: M) {
        self.queue().push_back(message);
        self.ready.notify_one();
    }

    async fn pop(&self) -> M {
        loop {
            let next = self.queue().pop_front();
            if let Some(message) = next {
                return message;
            }
            // notify_one 在无人等待时会留下一个许可，push 与这里之间不会丢唤醒
            self.ready.notified().await;
        }
    }
}

/// 信箱路由器；默认载荷为 JSON
pub struct MailboxRouter<M = Value> {
    inboxes: RwLock<HashMap<String, Arc<Inbox<M>>>>,
}

impl<M: Send + 'static> MailboxRouter<M> {
    pub fn new() -> Self {
        Self {
            inboxes: RwLock::new(HashMap::new()),
        }
    }

    /// 注册信箱；已存在时不做任何事（不会清空队列）
    pub async fn register(&self, name: &str) {
        let mut inboxes = self.inboxes.write().await;
        if inboxes.contains_key(name) {
            return;
        }
        inboxes.insert(name.to_string(), Arc::new(Inbox::new()));
        tracing::debug!(inbox = name, "inbox registered");
    }

    /// 注销信箱，丢弃尚未投递的消息；未注册时为 no-op
    pub async fn unregister(&self, name: &str) {
        if let Some(inbox) = self.inboxes.write().await.remove(name) {
            inbox.closed.cancel();
            tracing::debug!(inbox = name, "inbox unregistered");
        }
    }

    pub async fn is_registered(&self, name: &str) -> bool {
        self.inboxes.read().await.contains_key(name)
    }

    /// 队列中待接收的消息数
    pub async fn pending(&self, name: &str) -> Result<usize, MailboxError> {
        let inbox = self.inbox(name).await?;
        let len = inbox.queue().len();
        Ok(len)
    }

    /// 投递到 `to` 的队尾，不阻塞
    pub async fn send(&self, to: &str, message: M) -> Result<(), MailboxError> {
        let inbox = self.inbox(to).await?;
        inbox.push(message);
        Ok(())
    }

    /// 从队首取一条消息。
    ///
    /// - `timeout` 为 None：一直等待
    /// - 超时：返回 `Ok(None)`，不是错误
    /// - 等待期间信箱被注销：返回 `NotRegistered`
    pub async fn recv(&self, name: &str, timeout: Option<Duration>) -> Result<Option<M>, MailboxError> {
        let inbox = self.inbox(name).await?;
        let not_registered = || MailboxError::NotRegistered(name.to_string());

        match timeout {
            None => tokio::select! {
                _ = inbox.closed.cancelled() => Err(not_registered()),
                msg = inbox.pop() => Ok(Some(msg)),
            },
            Some(limit) => tokio::select! {
                _ = inbox.closed.cancelled() => Err(not_registered()),
                res = tokio::time::timeout(limit, inbox.pop()) => match res {
                    Ok(msg) => Ok(Some(msg)),
                    Err(_) => {
                        tracing::debug!(inbox = name, "recv timed out");
                        Ok(None)
                    }
                },
            },
        }
    }

    async fn inbox(&self, name: &str) -> Result<Arc<Inbox<M>>, MailboxError> {
        self.inboxes
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| MailboxError::NotRegistered(name.to_string()))
    }
}

impl<M: Send + 'static> Default for MailboxRouter<M> {
    fn default() -> Self {
        Self::new()
    }
}

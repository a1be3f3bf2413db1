//! 任务调度：有界 Worker 池
//!
//! 阻塞型任务（CPU / 同步 I/O）在 tokio 阻塞线程上执行，用 Semaphore 限制同时运行的数量。
//! 池在整个进程生命周期内复用，不会在一次批处理后关闭。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// 默认并发度
pub const DEFAULT_MAX_WORKERS: usize = 4;

/// 任务 ID
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub(crate) struct TaskId(u64);

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(0);

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskId {
    pub(crate) fn new() -> Self {
        Self(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// 任务调度器：持有长生命周期的并发许可
#[derive(Clone, Debug)]
pub struct TaskScheduler {
    permits: Arc<Semaphore>,
    max_workers: usize,
}

impl TaskScheduler {
    pub fn new(max_workers: usize) -> Self {
        let max_workers = max_workers.max(1);
        Self {
            permits: Arc::new(Semaphore::new(max_workers)),
            max_workers,
        }
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// 获取一个执行许可；许可随返回值 drop 归还
    pub async fn acquire(&self) -> Option<OwnedSemaphorePermit> {
        // 信号量从不 close，Err 只在 close 后出现
        self.permits.clone().acquire_owned().await.ok()
    }

    /// 在阻塞线程池上执行 `f`，受并发上限约束；`f` panic 时返回 Err
    pub async fn run_blocking<F, R>(&self, f: F) -> Result<R, String>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let task_id = TaskId::new();
        let _permit = self.acquire().await;
        tracing::trace!(?task_id, "worker slot acquired");
        tokio::task::spawn_blocking(f)
            .await
            .map_err(|e| panic_message(e, task_id))
    }
}

fn panic_message(err: tokio::task::JoinError, task_id: TaskId) -> String {
    if err.is_panic() {
        let payload = err.into_panic();
        let msg = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "worker panicked".to_string());
        tracing::warn!(?task_id, "worker panicked: {}", msg);
        msg
    } else {
        "worker cancelled".to_string()
    }
}

impl Default for TaskScheduler {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_WORKERS)
    }
}

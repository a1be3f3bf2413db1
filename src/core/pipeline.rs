//! 流水线执行器
//!
//! 三种编排方式：
//! - **run_sequential**：按顺序执行各阶段，每个阶段拿到此前所有阶段输出合并后的上下文；任一阶段失败即终止
//! - **run_parallel**：在有界 Worker 池上并发处理一批条目，单条失败以 `{error}` 占位，不影响其他条目
//! - **run_loop_refine**：单协程迭代精化，refine 返回 None 或达到 max_iters 即停止

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::task::JoinSet;

use crate::core::error::PipelineError;
use crate::core::task_scheduler::TaskScheduler;

/// 流水线阶段：读取合并后的上下文，产出本阶段输出
#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self, context: &Value) -> anyhow::Result<Value>;
}

/// 基于闭包的阶段，便于测试与临时组装
pub struct FnStage<F> {
    name: String,
    f: F,
}

impl<F> FnStage<F>
where
    F: Fn(&Value) -> anyhow::Result<Value> + Send + Sync,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self { name: name.into(), f }
    }
}

#[async_trait]
impl<F> Stage for FnStage<F>
where
    F: Fn(&Value) -> anyhow::Result<Value> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, context: &Value) -> anyhow::Result<Value> {
        (self.f)(context)
    }
}

/// 批处理 Worker：`Worker(Item) -> Result`
pub trait Worker<I, O>: Send + Sync + 'static {
    fn work(&self, item: I) -> anyhow::Result<O>;
}

impl<I, O, F> Worker<I, O> for F
where
    F: Fn(I) -> anyhow::Result<O> + Send + Sync + 'static,
{
    fn work(&self, item: I) -> anyhow::Result<O> {
        self(item)
    }
}

/// 精化函数：`RefineFn(State) -> Option<State>`，None 表示停止
pub trait RefineFn<S> {
    fn refine(&mut self, state: S) -> impl Future<Output = anyhow::Result<Option<S>>> + Send;
}

impl<S, F, Fut> RefineFn<S> for F
where
    F: FnMut(S) -> Fut,
    Fut: Future<Output = anyhow::Result<Option<S>>> + Send,
{
    fn refine(&mut self, state: S) -> impl Future<Output = anyhow::Result<Option<S>>> + Send {
        (*self)(state)
    }
}

/// 单条批处理结果；失败时序列化为 `{"error": "..."}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ItemOutcome<O> {
    Failed { error: String },
    Done(O),
}

impl<O> ItemOutcome<O> {
    pub fn failed(error: impl Into<String>) -> Self {
        Self::Failed {
            error: error.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }

    pub fn ok(self) -> Option<O> {
        match self {
            Self::Done(v) => Some(v),
            Self::Failed { .. } => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            Self::Failed { error } => Some(error),
            Self::Done(_) => None,
        }
    }
}

/// 一次顺序运行的结果
#[derive(Debug, Clone)]
pub struct PipelineResult {
    pub outputs: HashMap<String, Value>,
    /// 阶段执行顺序
    pub order: Vec<String>,
    pub duration: Duration,
}

impl PipelineResult {
    pub fn get(&self, stage: &str) -> Option<&Value> {
        self.outputs.get(stage)
    }

    /// 按执行顺序遍历 (阶段名, 输出)
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.order
            .iter()
            .filter_map(|name| self.outputs.get(name).map(|v| (name.as_str(), v)))
    }

    pub fn to_json(&self) -> Value {
        let mut map = Map::new();
        for (name, value) in self.iter() {
            map.insert(name.to_string(), value.clone());
        }
        map.insert(
            "duration_seconds".to_string(),
            Value::from(self.duration.as_secs_f64()),
        );
        Value::Object(map)
    }
}

/// 流水线执行器：持有可复用的有界 Worker 池
#[derive(Clone, Debug, Default)]
pub struct PipelineExecutor {
    scheduler: TaskScheduler,
}

impl PipelineExecutor {
    pub fn new(max_workers: usize) -> Self {
        Self {
            scheduler: TaskScheduler::new(max_workers),
        }
    }

    pub fn max_workers(&self) -> usize {
        self.scheduler.max_workers()
    }

    /// 顺序执行各阶段；阶段错误原样向上传播（fail-fast）
    pub async fn run_sequential(
        &self,
        stages: &[Arc<dyn Stage>],
    ) -> Result<PipelineResult, PipelineError> {
        let start = Instant::now();
        let mut context = Value::Object(Map::new());
        let mut outputs = HashMap::new();
        let mut order = Vec::with_capacity(stages.len());

        for stage in stages {
            let name = stage.name().to_string();
            tracing::info!(stage = %name, "stage started");
            let output = stage
                .run(&context)
                .await
                .map_err(|source| PipelineError::StageFailed {
                    stage: name.clone(),
                    source,
                })?;
            merge_into(&mut context, &name, &output);
            outputs.insert(name.clone(), output);
            order.push(name);
        }

        let duration = start.elapsed();
        tracing::info!("pipeline finished in {:.2}s", duration.as_secs_f64());
        Ok(PipelineResult {
            outputs,
            order,
            duration,
        })
    }

    /// 在 Worker 池上并发处理 items；返回序列长度恒等于输入长度，并按原始下标对齐
    pub async fn run_parallel<I, O, W>(&self, items: Vec<I>, worker: W) -> Vec<ItemOutcome<O>>
    where
        I: Send + 'static,
        O: Send + 'static,
        W: Worker<I, O>,
    {
        let total = items.len();
        let worker = Arc::new(worker);
        let mut set = JoinSet::new();

        for (idx, item) in items.into_iter().enumerate() {
            let worker = Arc::clone(&worker);
            let scheduler = self.scheduler.clone();
            set.spawn(async move {
                let outcome = match scheduler.run_blocking(move || worker.work(item)).await {
                    Ok(Ok(v)) => ItemOutcome::Done(v),
                    Ok(Err(e)) => ItemOutcome::failed(e.to_string()),
                    Err(panic) => ItemOutcome::failed(panic),
                };
                (idx, outcome)
            });
        }

        let mut slots: Vec<Option<ItemOutcome<O>>> = (0..total).map(|_| None).collect();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((idx, outcome)) => {
                    if let ItemOutcome::Failed { error } = &outcome {
                        tracing::warn!(index = idx, "batch item failed: {}", error);
                    }
                    slots[idx] = Some(outcome);
                }
                Err(e) => tracing::warn!("batch task lost: {}", e),
            }
        }

        slots
            .into_iter()
            .map(|slot| slot.unwrap_or_else(|| ItemOutcome::failed("worker task lost")))
            .collect()
    }

    /// 迭代精化：最多执行 max_iters 次 refine，返回最后到达的状态
    pub async fn run_loop_refine<S, R>(
        &self,
        initial_state: S,
        mut refine: R,
        max_iters: usize,
    ) -> anyhow::Result<S>
    where
        S: Clone,
        R: RefineFn<S>,
    {
        let mut state = initial_state;
        for iter in 0..max_iters {
            match refine.refine(state.clone()).await? {
                Some(next) => state = next,
                None => {
                    tracing::debug!(iter, "refine loop stopped early");
                    break;
                }
            }
        }
        Ok(state)
    }
}

/// 对象输出按键合并进上下文（后者覆盖前者），非对象输出挂在阶段名下
fn merge_into(context: &mut Value, stage: &str, output: &Value) {
    let Value::Object(ctx) = context else {
        return;
    };
    match output {
        Value::Object(fields) => {
            for (k, v) in fields {
                ctx.insert(k.clone(), v.clone());
            }
        }
        other => {
            ctx.insert(stage.to_string(), other.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn stage<F>(name: &str, f: F) -> Arc<dyn Stage>
    where
        F: Fn(&Value) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        Arc::new(FnStage::new(name, f))
    }

    #[tokio::test]
    async fn test_sequential_merges_prior_outputs() {
        let exec = PipelineExecutor::default();
        let stages = vec![
            stage("excavation", |_| Ok(json!({"commits": [1, 2, 3]}))),
            stage("historian", |ctx| {
                let n = ctx["commits"].as_array().map(|a| a.len()).unwrap_or(0);
                Ok(json!({"commit_count": n}))
            }),
            stage("narrative", |ctx| {
                Ok(json!(format!(
                    "{} commits seen",
                    ctx["commit_count"].as_u64().unwrap_or(0)
                )))
            }),
        ];

        let result = exec.run_sequential(&stages).await.unwrap();
        assert_eq!(result.order, vec!["excavation", "historian", "narrative"]);
        assert_eq!(result.get("historian"), Some(&json!({"commit_count": 3})));
        assert_eq!(result.get("narrative"), Some(&json!("3 commits seen")));
        let as_json = result.to_json();
        assert!(as_json["duration_seconds"].is_number());
    }

    #[tokio::test]
    async fn test_sequential_is_fail_fast() {
        let exec = PipelineExecutor::default();
        let reached = Arc::new(AtomicUsize::new(0));
        let reached_clone = Arc::clone(&reached);
        let stages = vec![
            stage("a", |_| Ok(json!({}))),
            stage("b", |_| Err(anyhow::anyhow!("scanner crashed"))),
            stage("c", move |_| {
                reached_clone.fetch_add(1, Ordering::SeqCst);
                Ok(json!({}))
            }),
        ];

        let err = exec.run_sequential(&stages).await.unwrap_err();
        match err {
            PipelineError::StageFailed { stage, source } => {
                assert_eq!(stage, "b");
                assert!(source.to_string().contains("scanner crashed"));
            }
        }
        assert_eq!(reached.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_parallel_isolates_failures() {
        let exec = PipelineExecutor::new(2);
        let results = exec
            .run_parallel(vec![1, 2, 3], |n: i32| -> anyhow::Result<i32> {
                if n == 2 {
                    anyhow::bail!("bad commit {}", n);
                }
                Ok(n * 10)
            })
            .await;

        assert_eq!(results.len(), 3);
        assert_eq!(results[0], ItemOutcome::Done(10));
        assert_eq!(results[1].error(), Some("bad commit 2"));
        assert_eq!(results[2], ItemOutcome::Done(30));
    }

    #[tokio::test]
    async fn test_parallel_captures_panics_and_realigns() {
        let exec = PipelineExecutor::new(3);
        let results = exec
            .run_parallel((0..8).collect::<Vec<u64>>(), |n: u64| -> anyhow::Result<u64> {
                if n == 5 {
                    panic!("worker exploded");
                }
                // 越靠前的条目睡得越久，完成顺序与提交顺序相反
                std::thread::sleep(Duration::from_millis(40 - n * 5));
                Ok(n)
            })
            .await;

        assert_eq!(results.len(), 8);
        for (i, r) in results.iter().enumerate() {
            if i == 5 {
                assert_eq!(r.error(), Some("worker exploded"));
            } else {
                assert_eq!(r, &ItemOutcome::Done(i as u64));
            }
        }
    }

    #[tokio::test]
    async fn test_pool_is_reusable() {
        let exec = PipelineExecutor::new(2);
        for round in 0..3 {
            let results = exec
                .run_parallel(vec![round; 4], |n: i32| -> anyhow::Result<i32> { Ok(n + 1) })
                .await;
            assert!(results.iter().all(|r| r == &ItemOutcome::Done(round + 1)));
        }
        let empty: Vec<ItemOutcome<i32>> = exec
            .run_parallel(Vec::<i32>::new(), |n: i32| -> anyhow::Result<i32> { Ok(n) })
            .await;
        assert!(empty.is_empty());
    }

    #[test]
    fn test_failed_outcome_serializes_as_error_record() {
        let failed: ItemOutcome<i32> = ItemOutcome::failed("boom");
        assert_eq!(serde_json::to_value(&failed).unwrap(), json!({"error": "boom"}));
        let done: ItemOutcome<i32> = ItemOutcome::Done(4);
        assert_eq!(serde_json::to_value(&done).unwrap(), json!(4));
    }

    #[tokio::test]
    async fn test_loop_refine_stops_on_none() {
        let exec = PipelineExecutor::default();
        let out = exec
            .run_loop_refine(
                0,
                |n: i32| async move { anyhow::Ok(if n < 3 { Some(n + 1) } else { None }) },
                10,
            )
            .await
            .unwrap();
        assert_eq!(out, 3);
    }

    #[tokio::test]
    async fn test_loop_refine_respects_cap() {
        let exec = PipelineExecutor::default();
        let out = exec
            .run_loop_refine(0, |n: i32| async move { anyhow::Ok(Some(n + 1)) }, 5)
            .await
            .unwrap();
        assert_eq!(out, 5);
    }

    #[tokio::test]
    async fn test_loop_refine_immediate_stop_returns_initial() {
        let exec = PipelineExecutor::default();
        let out = exec
            .run_loop_refine("draft".to_string(), |_s: String| async move { anyhow::Ok(None) }, 5)
            .await
            .unwrap();
        assert_eq!(out, "draft");
    }

    #[tokio::test]
    async fn test_loop_refine_propagates_error() {
        let exec = PipelineExecutor::default();
        let res = exec
            .run_loop_refine(
                0,
                |n: i32| async move {
                    if n == 2 {
                        anyhow::bail!("refine failed at {}", n);
                    }
                    anyhow::Ok(Some(n + 1))
                },
                10,
            )
            .await;
        assert!(res.unwrap_err().to_string().contains("refine failed at 2"));
    }
}

//! Archaeologist 命令行入口
//!
//! 加载配置，组装 excavation → history → narrative 三阶段流水线并运行，输出报告；
//! 可选地基于长期记忆回答一个问题。

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use serde_json::json;

use archaeologist::agents::{ExcavatorStage, GitLogScanner, HistorianStage, NarratorStage};
use archaeologist::config::load_config_or_default;
use archaeologist::core::{MailboxRouter, PipelineExecutor, Stage};
use archaeologist::llm::{create_embedder_from_config, create_generator_from_config};
use archaeologist::memory::{Message, Metadata, Role, SessionStore, VectorMemory};
use archaeologist::observability;

/// 命令行收件箱名
const CLI_INBOX: &str = "cli";

#[derive(Parser, Debug)]
#[command(name = "archaeologist", version, about = "Dig through a git repository's history")]
struct Args {
    /// 待分析的仓库（默认取配置 app.repo_path，再退回当前目录）
    #[arg(short, long)]
    repo: Option<PathBuf>,

    /// 额外的配置文件
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// 会话 ID（默认随机生成）
    #[arg(short, long)]
    session: Option<String>,

    /// 运行结束后提问，例如 "why was the parser rewritten?"
    #[arg(long)]
    ask: Option<String>,

    /// 以 JSON 输出全部阶段结果
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();
    let args = Args::parse();

    let cfg = load_config_or_default(args.config.clone());
    let repo = args
        .repo
        .clone()
        .or_else(|| cfg.app.repo_path.clone())
        .unwrap_or_else(|| PathBuf::from("."));
    let session_id = args
        .session
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let generator = create_generator_from_config(&cfg.llm);
    let embedder = create_embedder_from_config(&cfg.embedding);
    let persist_dir = cfg.memory.persist_dir.clone();
    let memory = tokio::task::spawn_blocking(move || VectorMemory::open(persist_dir, embedder))
        .await
        .context("Failed to open long-term memory")?;
    let memory = Arc::new(Mutex::new(memory));

    let executor = PipelineExecutor::new(cfg.pipeline.max_workers);
    let sessions = Arc::new(SessionStore::new());
    let mut metadata = Metadata::new();
    metadata.insert("repo".to_string(), json!(repo.display().to_string()));
    sessions.create_session(&session_id, metadata);

    let router: Arc<MailboxRouter> = Arc::new(MailboxRouter::new());
    router.register(CLI_INBOX).await;

    let scanner = Arc::new(GitLogScanner::new(&repo, cfg.pipeline.max_commits));
    let historian = Arc::new(HistorianStage::new(
        Arc::clone(&generator),
        executor.clone(),
        Arc::clone(&memory),
    ));
    let stages: Vec<Arc<dyn Stage>> = vec![
        Arc::new(ExcavatorStage::new(scanner, Arc::clone(&memory))),
        historian.clone(),
        Arc::new(
            NarratorStage::new(
                Arc::clone(&generator),
                executor.clone(),
                Arc::clone(&sessions),
                session_id.clone(),
            )
            .with_refine_iters(cfg.pipeline.max_refine_iters)
            .with_notify(Arc::clone(&router), CLI_INBOX),
        ),
    ];

    tracing::info!("Analysing {} (session {})", repo.display(), session_id);
    let result = executor
        .run_sequential(&stages)
        .await
        .context("Pipeline failed")?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&result.to_json())?);
    } else if let Some(report) = result.get("narrative").and_then(|v| v["report"].as_str()) {
        println!("{}", report);
    }

    while let Some(event) = router
        .recv(CLI_INBOX, Some(Duration::from_millis(100)))
        .await?
    {
        tracing::info!("event: {}", event);
    }

    if let Some(question) = args.ask.as_deref() {
        let history = sessions.get_history(&session_id, cfg.memory.history_limit);
        let answer = historian.answer_in_session(question, &history).await;
        sessions.append(&session_id, Role::User, question);
        sessions.append(&session_id, Role::Agent, answer.clone());
        println!("\n## Q: {}\n\n{}", question, answer);
    }

    let compacted = sessions.compact_history(
        &session_id,
        |older: &[Arc<Message>]| format!("{} earlier messages", older.len()),
        cfg.memory.keep_last,
    )?;
    if compacted {
        tracing::info!("Session {} history compacted", session_id);
    }
    let removed = sessions.cleanup_idle(Duration::from_secs(cfg.memory.session_idle_secs));
    if removed > 0 {
        tracing::debug!("Removed {} idle sessions", removed);
    }

    router.unregister(CLI_INBOX).await;
    tracing::info!(
        "Done in {:.2}s, {} memories indexed",
        result.duration.as_secs_f64(),
        archaeologist::agents::lock_memory(&memory).len()
    );
    Ok(())
}

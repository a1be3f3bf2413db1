//! 仓库扫描：提交记录与源文件列表
//!
//! 记录对编排层是不透明的 JSON，只在阶段之间传递。

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::Context;
use serde_json::{json, Value};
use walkdir::WalkDir;

/// 扫描能力
pub trait Scanner: Send + Sync {
    /// 最近的提交（新 → 旧）
    fn commits(&self) -> anyhow::Result<Vec<Value>>;

    /// 仓库内的文件（相对路径）
    fn files(&self) -> Vec<String> {
        Vec::new()
    }

    /// 读取文本文件；不存在或非 UTF-8 时为 None
    fn read_file(&self, _path: &str) -> Option<String> {
        None
    }
}

/// 通过 `git log` 读取提交
pub struct GitLogScanner {
    repo: PathBuf,
    max_commits: usize,
}

/// 字段分隔符（ASCII Unit Separator），避免与提交信息冲突
const FIELD_SEP: char = '\u{1f}';
/// 记录分隔符（ASCII Record Separator），`--name-only` 的文件列表跟在每条记录头之后
const RECORD_SEP: char = '\u{1e}';

impl GitLogScanner {
    pub fn new(repo: impl AsRef<Path>, max_commits: usize) -> Self {
        Self {
            repo: repo.as_ref().to_path_buf(),
            max_commits: max_commits.max(1),
        }
    }

    fn run_git(&self, args: &[&str]) -> anyhow::Result<String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.repo)
            .output()
            .context("Failed to run git")?;
        if !output.status.success() {
            anyhow::bail!(
                "Git command failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

impl Scanner for GitLogScanner {
    fn commits(&self) -> anyhow::Result<Vec<Value>> {
        if !self.repo.join(".git").exists() {
            anyhow::bail!("Not a git repository: {}", self.repo.display());
        }
        let limit = format!("-n{}", self.max_commits);
        let out = self.run_git(&[
            "log",
            &limit,
            "--name-only",
            "--pretty=format:%x1e%h%x1f%an%x1f%aI%x1f%s",
        ])?;
        Ok(out.split(RECORD_SEP).filter_map(parse_log_record).collect())
    }

    fn files(&self) -> Vec<String> {
        WalkDir::new(&self.repo)
            .into_iter()
            .filter_entry(|e| e.file_name() != ".git")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter_map(|e| {
                e.path()
                    .strip_prefix(&self.repo)
                    .ok()
                    .map(|p| p.to_string_lossy().replace('\\', "/"))
            })
            .collect()
    }

    fn read_file(&self, path: &str) -> Option<String> {
        std::fs::read_to_string(self.repo.join(path)).ok()
    }
}

/// 一条 `git log --name-only` 记录：首行 `hash␟author␟date␟subject`，其后每行一个改动文件
fn parse_log_record(record: &str) -> Option<Value> {
    let mut lines = record.lines();
    let mut commit = parse_log_line(lines.next()?)?;
    let files: Vec<&str> = lines.map(str::trim).filter(|l| !l.is_empty()).collect();
    commit["files_changed"] = json!(files.len());
    commit["files"] = json!(files);
    Some(commit)
}

/// `hash␟author␟date␟subject` → JSON
fn parse_log_line(line: &str) -> Option<Value> {
    let mut parts = line.splitn(4, FIELD_SEP);
    let hash = parts.next()?.trim();
    if hash.is_empty() {
        return None;
    }
    let author = parts.next().unwrap_or_default();
    let date = parts.next().unwrap_or_default();
    let message = parts.next().unwrap_or_default();
    Some(json!({
        "hash": hash,
        "author": author,
        "date": date,
        "message": message.trim(),
    }))
}

/// 固定数据的扫描器，用于测试与演示
#[derive(Debug, Clone, Default)]
pub struct StaticScanner {
    pub commits: Vec<Value>,
    pub files: Vec<String>,
    /// 路径 → 文件内容
    pub contents: HashMap<String, String>,
}

impl Scanner for StaticScanner {
    fn commits(&self) -> anyhow::Result<Vec<Value>> {
        Ok(self.commits.clone())
    }

    fn files(&self) -> Vec<String> {
        self.files.clone()
    }

    fn read_file(&self, path: &str) -> Option<String> {
        self.contents.get(path).cloned()
    }
}

//! 仓库考古流水线的三个协作 Agent
//!
//! - **excavation**：扫描提交与文件，写入长期记忆
//! - **history**：并行分类提交并生成时间线
//! - **narrative**：生成报告、迭代精化并写入会话

pub mod excavator;
pub mod historian;
pub mod narrator;
pub mod scanner;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub use excavator::ExcavatorStage;
pub use historian::HistorianStage;
pub use narrator::NarratorStage;
pub use scanner::{GitLogScanner, Scanner, StaticScanner};

use crate::memory::VectorMemory;

/// 多个阶段共享的长期记忆；写入经由这把锁串行化
pub type SharedVectorMemory = Arc<Mutex<VectorMemory>>;

pub fn lock_memory(memory: &SharedVectorMemory) -> MutexGuard<'_, VectorMemory> {
    memory.lock().unwrap_or_else(PoisonError::into_inner)
}

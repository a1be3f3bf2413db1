//! 核心编排层：错误类型、有界 Worker 池、流水线执行器、Agent 信箱

pub mod error;
pub mod mailbox;
pub mod pipeline;
pub mod task_scheduler;

pub use error::{BackendError, MailboxError, PersistenceError, PipelineError, SessionError};
pub use mailbox::MailboxRouter;
pub use pipeline::{FnStage, ItemOutcome, PipelineExecutor, PipelineResult, RefineFn, Stage, Worker};
pub use task_scheduler::TaskScheduler;

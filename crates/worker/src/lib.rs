//! # taskbeat-worker
//!
//! Worker 池：并发消费队列中的信封，领取尝试、运行处理器并记录结果。
//! 内置 `shell` 与 `http` 两种处理器。

pub mod execution;
pub mod handlers;
pub mod pool;

pub use execution::{DeliveryOutcome, ExecutionManager, ExecutionSettings};
pub use handlers::{builtin_definitions, HttpHandler, HttpTaskParams, ShellHandler, ShellTaskParams};
pub use pool::{default_worker_id, WorkerPool, WorkerPoolConfig};

//! # taskbeat
//!
//! 进程入口的组装层：按 [`app::AppMode`] 启动 Worker 池和 beat 调度器，
//! 并处理优雅关闭。

pub mod app;
pub mod shutdown;

pub use app::{builtin_registry, AppMode, Application, Components};
pub use shutdown::ShutdownManager;

//! # taskbeat-core
//!
//! 周期任务调度与分布式分发的核心抽象：错误类型、数据模型、消息代理与存储接口、
//! 任务注册表、重试策略以及配置模型。具体实现位于 `taskbeat-infrastructure`。

pub mod config;
pub mod errors;
pub mod models;
pub mod registry;
pub mod retry;
pub mod traits;

pub use errors::{Result, TaskbeatError};
pub use models::*;
pub use registry::{ArgsSchema, TaskDefinition, TaskRegistry};
pub use retry::{Backoff, RetryPolicy};
pub use traits::*;

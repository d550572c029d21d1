//! # 数据模型
//!
//! 调度核心在组件之间传递和持久化的数据结构。
//!
//! ## 核心模型
//!
//! - [`TaskEnvelope`] - 放到消息代理上的工作单元，线格式只允许追加字段
//! - [`ExecutionRecord`] - 每次尝试一条记录，尝试序号从1开始
//! - [`EnvelopeState`] - 每个信封一行，所有状态转换的 CAS 目标
//! - [`ScheduleEntry`] - beat 调度器拥有的周期条目
//! - [`Lease`] - 领导者租约
//!
//! ## 状态流转
//!
//! ```text
//! PENDING → STARTED → (RETRY → STARTED)* → SUCCESS | FAILURE | REVOKED
//! PENDING | RETRY → REVOKED            (开始前撤销)
//! ```

pub mod envelope;
pub mod execution;
pub mod lease;
pub mod schedule;

pub use envelope::*;
pub use execution::*;
pub use lease::*;
pub use schedule::*;

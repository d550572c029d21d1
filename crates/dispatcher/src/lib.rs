//! # taskbeat-dispatcher
//!
//! 任务提交与周期调度：
//!
//! - [`DispatchCore`] - 提交、状态查询、撤销与未发布信封的补发
//! - [`BeatScheduler`] - 持有领导者租约时按间隔/CRON 触发调度条目
//! - [`LeaderElector`] - 租约的获取、续期与释放
//! - [`cron_utils`] - 触发器求值

pub mod beat;
pub mod cron_utils;
pub mod dispatch;
pub mod leader;

pub use beat::{BeatScheduler, EntryTick, TickReport};
pub use cron_utils::CronScheduler;
pub use dispatch::{DispatchCore, RecoveryConfig, SubmitOptions};
pub use leader::LeaderElector;

//! 持久化层接口定义
//!
//! - `ResultStore` - 信封状态行与每次尝试的执行记录
//! - `ScheduleStore` - beat 调度条目
//! - `LeaseStore` - 领导者租约
//!
//! 所有状态转换都是比较并交换（CAS）：条件不满足时返回 `false` 或对应的枚举结果，
//! 不返回错误。`Err` 只表示存储本身不可用。

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::models::{
    AttemptClaim, AttemptOutcome, EnvelopeState, ExecutionRecord, FireOutcome, Lease,
    RevokeOutcome, ScheduleEntry, TaskEnvelope,
};
use crate::Result;

#[async_trait]
pub trait ResultStore: Send + Sync {
    /// 发布前写入 PENDING 状态行
    async fn insert_pending(&self, envelope: &TaskEnvelope, now: DateTime<Utc>) -> Result<()>;

    /// 删除从未发布成功的 PENDING 行
    async fn discard_pending(&self, envelope_id: &str) -> Result<()>;

    async fn get_state(&self, envelope_id: &str) -> Result<Option<EnvelopeState>>;

    /// 领取一次尝试
    ///
    /// 状态为 PENDING/RETRY 时开启新的尝试；状态为 STARTED 且 `redelivered` 时
    /// 由当前 worker 接管同一尝试，原 worker 此后无法完成它。
    async fn begin_attempt(
        &self,
        envelope: &TaskEnvelope,
        worker_id: &str,
        redelivered: bool,
        now: DateTime<Utc>,
    ) -> Result<AttemptClaim>;

    /// 结束尝试，守卫条件为 `(status = STARTED, attempts = attempt, worker_id)`
    ///
    /// `Retry` 结果同时把状态行里的信封替换为下一次的副本并清空发布时间。
    async fn finish_attempt(
        &self,
        envelope_id: &str,
        attempt: u32,
        worker_id: &str,
        outcome: &AttemptOutcome,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// 记录代理已确认发布；只对 retries_done 相同的副本生效
    async fn mark_published(
        &self,
        envelope_id: &str,
        retries_done: u32,
        now: DateTime<Utc>,
    ) -> Result<()>;

    async fn revoke(&self, envelope_id: &str, now: DateTime<Utc>) -> Result<RevokeOutcome>;

    async fn is_revoke_requested(&self, envelope_id: &str) -> Result<bool>;

    /// 按尝试序号升序返回全部执行记录
    async fn list_attempts(&self, envelope_id: &str) -> Result<Vec<ExecutionRecord>>;

    /// PENDING/RETRY 且未确认发布、最后更新早于 `older_than` 的信封
    async fn list_unpublished(
        &self,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TaskEnvelope>>;
}

#[async_trait]
pub trait ScheduleStore: Send + Sync {
    /// 写入或更新条目定义，保留已有的 last_run_at、total_run_count 和 created_at
    async fn upsert_entry(&self, entry: &ScheduleEntry) -> Result<()>;

    async fn list_entries(&self) -> Result<Vec<ScheduleEntry>>;

    async fn get_entry(&self, name: &str) -> Result<Option<ScheduleEntry>>;

    async fn set_enabled(&self, name: &str, enabled: bool) -> Result<bool>;

    async fn remove_entry(&self, name: &str) -> Result<bool>;

    /// 单次条件更新：last_run_at 仍等于 `expected_last_run` 且 `lease` 仍有效时
    /// 把 last_run_at 推进到 `fired_at` 并累加运行次数
    async fn record_fire(
        &self,
        name: &str,
        expected_last_run: Option<DateTime<Utc>>,
        fired_at: DateTime<Utc>,
        lease: &Lease,
    ) -> Result<FireOutcome>;
}

#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// 租约空闲、已过期或已属于 `owner` 时获取（或续期）
    async fn try_acquire(
        &self,
        name: &str,
        owner: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<Lease>>;

    /// 只有 owner 与 token 都未变化时才能续期
    async fn renew(&self, lease: &Lease, ttl: Duration, now: DateTime<Utc>)
        -> Result<Option<Lease>>;

    async fn release(&self, lease: &Lease) -> Result<()>;

    async fn current(&self, name: &str) -> Result<Option<Lease>>;
}

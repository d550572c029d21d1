use std::str::FromStr;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use taskbeat_core::{
    AttemptClaim, AttemptOutcome, ClaimPlan, EnvelopeState, ErrorPayload, ExecutionRecord,
    FireOutcome, Lease, LeaseStore, Result, ResultStore, RevokeOutcome, ScheduleEntry,
    ScheduleStore, ScheduleTrigger, TaskEnvelope, TaskStatus, TaskbeatError,
};
use tracing::{debug, instrument, warn};

use crate::memory_store::revoked_payload;

/// CAS 冲突时的最大重读次数
const MAX_CAS_ATTEMPTS: usize = 5;

const ENVELOPE_COLUMNS: &str = "envelope, status, attempts, retries_done, revoke_requested, \
     worker_id, published_at, created_at, updated_at";

const EXECUTION_COLUMNS: &str = "envelope_id, attempt, status, result, error_kind, error_message, \
     started_at, finished_at, worker_id";

const SCHEDULE_COLUMNS: &str = "name, task_name, trigger_spec, args, queue, max_retries, \
     last_run_at, enabled, total_run_count, created_at";

fn millis(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| TaskbeatError::Serialization(format!("无效的时间戳: {ms}")))
}

fn from_optional_millis(ms: Option<i64>) -> Result<Option<DateTime<Utc>>> {
    ms.map(from_millis).transpose()
}

/// SQLite 持久化，实现全部三个存储接口
///
/// 时间戳以 UTC 毫秒存储。每个状态转换先读取当前行、计算转换计划，
/// 再以读到的值作为守卫条件执行一次条件更新；守卫失败时重读重算。
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// 连接数据库（不存在时创建）并运行迁移
    pub async fn connect(url: &str, max_connections: u32, timeout: StdDuration) -> Result<Self> {
        debug!("Connecting SQLite store at: {}", url);

        let connect_options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(timeout)
            .journal_mode(SqliteJournalMode::Wal);

        // 内存数据库每个连接都是独立的库，只能使用单连接且不能回收
        let in_memory = url.contains(":memory:") || url.contains("mode=memory");
        let pool = SqlitePoolOptions::new()
            .max_connections(if in_memory { 1 } else { max_connections })
            .min_connections(1)
            .acquire_timeout(timeout)
            .idle_timeout(if in_memory { None } else { Some(StdDuration::from_secs(600)) })
            .max_lifetime(if in_memory { None } else { Some(StdDuration::from_secs(1800)) })
            .connect_with(connect_options)
            .await?;

        let store = Self::new(pool);
        store.run_migrations().await?;
        Ok(store)
    }

    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(sqlx::Error::from)?;
        debug!("SQLite migrations applied");
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn row_to_state(row: &SqliteRow) -> Result<EnvelopeState> {
        let envelope: String = row.try_get("envelope")?;
        let status: String = row.try_get("status")?;
        Ok(EnvelopeState {
            envelope: TaskEnvelope::from_json(&envelope)?,
            status: status.parse()?,
            attempts: row.try_get::<i64, _>("attempts")? as u32,
            retries_done: row.try_get::<i64, _>("retries_done")? as u32,
            revoke_requested: row.try_get::<i64, _>("revoke_requested")? != 0,
            worker_id: row.try_get("worker_id")?,
            published_at: from_optional_millis(row.try_get("published_at")?)?,
            created_at: from_millis(row.try_get("created_at")?)?,
            updated_at: from_millis(row.try_get("updated_at")?)?,
        })
    }

    fn row_to_record(row: &SqliteRow) -> Result<ExecutionRecord> {
        let status: String = row.try_get("status")?;
        let result: Option<String> = row.try_get("result")?;
        let error_kind: Option<String> = row.try_get("error_kind")?;
        let error_message: Option<String> = row.try_get("error_message")?;

        Ok(ExecutionRecord {
            envelope_id: row.try_get("envelope_id")?,
            attempt: row.try_get::<i64, _>("attempt")? as u32,
            status: status.parse()?,
            result: result.map(|raw| serde_json::from_str(&raw)).transpose()?,
            error: error_kind.map(|kind| ErrorPayload::new(kind, error_message.unwrap_or_default())),
            started_at: from_optional_millis(row.try_get("started_at")?)?,
            finished_at: from_optional_millis(row.try_get("finished_at")?)?,
            worker_id: row.try_get("worker_id")?,
        })
    }

    fn row_to_entry(row: &SqliteRow) -> Result<ScheduleEntry> {
        let trigger: String = row.try_get("trigger_spec")?;
        let args: String = row.try_get("args")?;
        Ok(ScheduleEntry {
            name: row.try_get("name")?,
            task_name: row.try_get("task_name")?,
            trigger: serde_json::from_str::<ScheduleTrigger>(&trigger)?,
            args: serde_json::from_str(&args)?,
            queue: row.try_get("queue")?,
            max_retries: row
                .try_get::<Option<i64>, _>("max_retries")?
                .map(|value| value as u32),
            last_run_at: from_optional_millis(row.try_get("last_run_at")?)?,
            enabled: row.try_get::<i64, _>("enabled")? != 0,
            total_run_count: row.try_get::<i64, _>("total_run_count")? as u64,
            created_at: from_millis(row.try_get("created_at")?)?,
        })
    }

    fn row_to_lease(row: &SqliteRow) -> Result<Lease> {
        Ok(Lease {
            name: row.try_get("name")?,
            owner: row.try_get("owner")?,
            token: row.try_get::<i64, _>("token")? as u64,
            expires_at: from_millis(row.try_get("expires_at")?)?,
        })
    }

    /// 按计划执行领取；返回 `None` 表示守卫失败需要重读
    async fn apply_claim(
        &self,
        envelope: &TaskEnvelope,
        observed: &EnvelopeState,
        plan: ClaimPlan,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<AttemptClaim>> {
        if let ClaimPlan::Reply(claim) = plan {
            return Ok(Some(claim));
        }
        let mut tx = self.pool.begin().await?;

        let claim = match plan {
            ClaimPlan::Reply(claim) => claim,
            ClaimPlan::Start { attempt } => {
                let updated = sqlx::query(
                    "UPDATE envelopes SET status = 'STARTED', attempts = ?1, worker_id = ?2, updated_at = ?3
                     WHERE id = ?4 AND status = ?5 AND attempts = ?6 AND retries_done = ?7
                       AND revoke_requested = 0",
                )
                .bind(attempt as i64)
                .bind(worker_id)
                .bind(millis(now))
                .bind(&envelope.id)
                .bind(observed.status.as_str())
                .bind(observed.attempts as i64)
                .bind(observed.retries_done as i64)
                .execute(&mut *tx)
                .await?;
                if updated.rows_affected() == 0 {
                    tx.rollback().await?;
                    return Ok(None);
                }

                sqlx::query(
                    "INSERT INTO executions (envelope_id, attempt, status, started_at, worker_id)
                     VALUES (?1, ?2, 'STARTED', ?3, ?4)
                     ON CONFLICT (envelope_id, attempt) DO UPDATE SET
                       status = excluded.status, started_at = excluded.started_at,
                       worker_id = excluded.worker_id, finished_at = NULL,
                       result = NULL, error_kind = NULL, error_message = NULL",
                )
                .bind(&envelope.id)
                .bind(attempt as i64)
                .bind(millis(now))
                .bind(worker_id)
                .execute(&mut *tx)
                .await?;
                AttemptClaim::Started { attempt }
            }
            ClaimPlan::TakeOver { attempt } => {
                let updated = sqlx::query(
                    "UPDATE envelopes SET worker_id = ?1, updated_at = ?2
                     WHERE id = ?3 AND status = 'STARTED' AND attempts = ?4
                       AND worker_id IS ?5 AND revoke_requested = 0",
                )
                .bind(worker_id)
                .bind(millis(now))
                .bind(&envelope.id)
                .bind(attempt as i64)
                .bind(observed.worker_id.as_deref())
                .execute(&mut *tx)
                .await?;
                if updated.rows_affected() == 0 {
                    tx.rollback().await?;
                    return Ok(None);
                }

                sqlx::query("UPDATE executions SET worker_id = ?1 WHERE envelope_id = ?2 AND attempt = ?3")
                    .bind(worker_id)
                    .bind(&envelope.id)
                    .bind(attempt as i64)
                    .execute(&mut *tx)
                    .await?;
                debug!(envelope.id = %envelope.id, attempt, worker_id, "接管重新投递的尝试");
                AttemptClaim::Started { attempt }
            }
            ClaimPlan::Revoke { open_attempt } => {
                let updated = sqlx::query(
                    "UPDATE envelopes SET status = 'REVOKED', updated_at = ?1
                     WHERE id = ?2 AND status = ?3 AND attempts = ?4 AND revoke_requested = 1",
                )
                .bind(millis(now))
                .bind(&envelope.id)
                .bind(observed.status.as_str())
                .bind(observed.attempts as i64)
                .execute(&mut *tx)
                .await?;
                if updated.rows_affected() == 0 {
                    tx.rollback().await?;
                    return Ok(None);
                }

                if let Some(attempt) = open_attempt {
                    let payload = revoked_payload(&envelope.id);
                    sqlx::query(
                        "UPDATE executions SET status = 'REVOKED', error_kind = ?1, error_message = ?2,
                           finished_at = ?3
                         WHERE envelope_id = ?4 AND attempt = ?5 AND status = 'STARTED'",
                    )
                    .bind(&payload.kind)
                    .bind(&payload.message)
                    .bind(millis(now))
                    .bind(&envelope.id)
                    .bind(attempt as i64)
                    .execute(&mut *tx)
                    .await?;
                }
                AttemptClaim::Revoked
            }
        };

        tx.commit().await?;
        Ok(Some(claim))
    }
}

#[async_trait]
impl ResultStore for SqliteStore {
    #[instrument(skip(self, envelope), fields(envelope.id = %envelope.id))]
    async fn insert_pending(&self, envelope: &TaskEnvelope, now: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO envelopes
               (id, task_name, queue, envelope, status, attempts, retries_done, revoke_requested,
                worker_id, published_at, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, 'PENDING', 0, ?5, 0, NULL, NULL, ?6, ?6)",
        )
        .bind(&envelope.id)
        .bind(&envelope.task_name)
        .bind(&envelope.queue)
        .bind(envelope.to_json()?)
        .bind(envelope.retries_done as i64)
        .bind(millis(now))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn discard_pending(&self, envelope_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM envelopes WHERE id = ?1 AND status = 'PENDING' AND attempts = 0")
            .bind(envelope_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_state(&self, envelope_id: &str) -> Result<Option<EnvelopeState>> {
        let row = sqlx::query(&format!("SELECT {ENVELOPE_COLUMNS} FROM envelopes WHERE id = ?1"))
            .bind(envelope_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_state).transpose()
    }

    #[instrument(skip(self, envelope), fields(envelope.id = %envelope.id))]
    async fn begin_attempt(
        &self,
        envelope: &TaskEnvelope,
        worker_id: &str,
        redelivered: bool,
        now: DateTime<Utc>,
    ) -> Result<AttemptClaim> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let observed = match self.get_state(&envelope.id).await? {
                Some(state) => state,
                None => {
                    // 发布方的状态行丢失时以投递的信封补建
                    self.insert_pending(envelope, now).await?;
                    continue;
                }
            };

            let plan = observed.plan_claim(envelope, redelivered);
            if let Some(claim) = self
                .apply_claim(envelope, &observed, plan, worker_id, now)
                .await?
            {
                return Ok(claim);
            }
            debug!(envelope.id = %envelope.id, "领取尝试时发生并发冲突，重新读取");
        }

        warn!(envelope.id = %envelope.id, "领取尝试多次冲突");
        Err(TaskbeatError::Internal(format!(
            "领取信封 {} 的尝试时并发冲突次数过多",
            envelope.id
        )))
    }

    async fn finish_attempt(
        &self,
        envelope_id: &str,
        attempt: u32,
        worker_id: &str,
        outcome: &AttemptOutcome,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let updated = match outcome {
            AttemptOutcome::Retry { next, .. } => {
                sqlx::query(
                    "UPDATE envelopes SET status = 'RETRY', envelope = ?1, retries_done = ?2,
                       published_at = NULL, updated_at = ?3
                     WHERE id = ?4 AND status = 'STARTED' AND attempts = ?5 AND worker_id = ?6",
                )
                .bind(next.to_json()?)
                .bind(next.retries_done as i64)
                .bind(millis(now))
                .bind(envelope_id)
                .bind(attempt as i64)
                .bind(worker_id)
                .execute(&mut *tx)
                .await?
            }
            _ => {
                sqlx::query(
                    "UPDATE envelopes SET status = ?1, updated_at = ?2
                     WHERE id = ?3 AND status = 'STARTED' AND attempts = ?4 AND worker_id = ?5",
                )
                .bind(outcome.status().as_str())
                .bind(millis(now))
                .bind(envelope_id)
                .bind(attempt as i64)
                .bind(worker_id)
                .execute(&mut *tx)
                .await?
            }
        };
        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        let (result, error) = match outcome {
            AttemptOutcome::Success(value) => (Some(serde_json::to_string(value)?), None),
            AttemptOutcome::Retry { error, .. }
            | AttemptOutcome::Failure(error)
            | AttemptOutcome::Revoked(error) => (None, Some(error)),
        };
        sqlx::query(
            "UPDATE executions SET status = ?1, result = ?2, error_kind = ?3, error_message = ?4,
               finished_at = ?5
             WHERE envelope_id = ?6 AND attempt = ?7",
        )
        .bind(outcome.status().as_str())
        .bind(result)
        .bind(error.map(|e| e.kind.as_str()))
        .bind(error.map(|e| e.message.as_str()))
        .bind(millis(now))
        .bind(envelope_id)
        .bind(attempt as i64)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn mark_published(
        &self,
        envelope_id: &str,
        retries_done: u32,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE envelopes SET published_at = ?1
             WHERE id = ?2 AND retries_done = ?3 AND published_at IS NULL",
        )
        .bind(millis(now))
        .bind(envelope_id)
        .bind(retries_done as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn revoke(&self, envelope_id: &str, now: DateTime<Utc>) -> Result<RevokeOutcome> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let Some(observed) = self.get_state(envelope_id).await? else {
                return Ok(RevokeOutcome::NotFound);
            };
            if observed.status.is_terminal() {
                return Ok(RevokeOutcome::AlreadyTerminal(observed.status));
            }

            let (sql, outcome) = if observed.status == TaskStatus::Started {
                (
                    "UPDATE envelopes SET revoke_requested = 1, updated_at = ?1
                     WHERE id = ?2 AND status = ?3 AND attempts = ?4",
                    RevokeOutcome::Requested,
                )
            } else {
                (
                    "UPDATE envelopes SET status = 'REVOKED', revoke_requested = 1, updated_at = ?1
                     WHERE id = ?2 AND status = ?3 AND attempts = ?4",
                    RevokeOutcome::Revoked,
                )
            };
            let updated = sqlx::query(sql)
                .bind(millis(now))
                .bind(envelope_id)
                .bind(observed.status.as_str())
                .bind(observed.attempts as i64)
                .execute(&self.pool)
                .await?;
            if updated.rows_affected() > 0 {
                return Ok(outcome);
            }
        }

        Err(TaskbeatError::Internal(format!(
            "撤销信封 {envelope_id} 时并发冲突次数过多"
        )))
    }

    async fn is_revoke_requested(&self, envelope_id: &str) -> Result<bool> {
        let requested: Option<i64> =
            sqlx::query_scalar("SELECT revoke_requested FROM envelopes WHERE id = ?1")
                .bind(envelope_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(requested.unwrap_or(0) != 0)
    }

    async fn list_attempts(&self, envelope_id: &str) -> Result<Vec<ExecutionRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM executions WHERE envelope_id = ?1 ORDER BY attempt ASC"
        ))
        .bind(envelope_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_record).collect()
    }

    async fn list_unpublished(
        &self,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TaskEnvelope>> {
        let envelopes: Vec<String> = sqlx::query_scalar(
            "SELECT envelope FROM envelopes
             WHERE status IN ('PENDING', 'RETRY') AND published_at IS NULL
               AND revoke_requested = 0 AND updated_at <= ?1
             ORDER BY updated_at ASC
             LIMIT ?2",
        )
        .bind(millis(older_than))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        envelopes
            .iter()
            .map(|raw| TaskEnvelope::from_json(raw))
            .collect()
    }
}

#[async_trait]
impl ScheduleStore for SqliteStore {
    async fn upsert_entry(&self, entry: &ScheduleEntry) -> Result<()> {
        sqlx::query(
            "INSERT INTO schedule_entries
               (name, task_name, trigger_spec, args, queue, max_retries, last_run_at, enabled,
                total_run_count, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT (name) DO UPDATE SET
               task_name = excluded.task_name,
               trigger_spec = excluded.trigger_spec,
               args = excluded.args,
               queue = excluded.queue,
               max_retries = excluded.max_retries,
               enabled = excluded.enabled",
        )
        .bind(&entry.name)
        .bind(&entry.task_name)
        .bind(serde_json::to_string(&entry.trigger)?)
        .bind(serde_json::to_string(&entry.args)?)
        .bind(entry.queue.as_deref())
        .bind(entry.max_retries.map(i64::from))
        .bind(entry.last_run_at.map(millis))
        .bind(entry.enabled as i64)
        .bind(entry.total_run_count as i64)
        .bind(millis(entry.created_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_entries(&self) -> Result<Vec<ScheduleEntry>> {
        let rows = sqlx::query(&format!(
            "SELECT {SCHEDULE_COLUMNS} FROM schedule_entries ORDER BY name ASC"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_entry).collect()
    }

    async fn get_entry(&self, name: &str) -> Result<Option<ScheduleEntry>> {
        let row = sqlx::query(&format!(
            "SELECT {SCHEDULE_COLUMNS} FROM schedule_entries WHERE name = ?1"
        ))
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::row_to_entry).transpose()
    }

    async fn set_enabled(&self, name: &str, enabled: bool) -> Result<bool> {
        let updated = sqlx::query("UPDATE schedule_entries SET enabled = ?1 WHERE name = ?2")
            .bind(enabled as i64)
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(updated.rows_affected() > 0)
    }

    async fn remove_entry(&self, name: &str) -> Result<bool> {
        let deleted = sqlx::query("DELETE FROM schedule_entries WHERE name = ?1")
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(deleted.rows_affected() > 0)
    }

    #[instrument(skip(self, lease), fields(lease.token = lease.token))]
    async fn record_fire(
        &self,
        name: &str,
        expected_last_run: Option<DateTime<Utc>>,
        fired_at: DateTime<Utc>,
        lease: &Lease,
    ) -> Result<FireOutcome> {
        let updated = sqlx::query(
            "UPDATE schedule_entries
             SET last_run_at = ?1, total_run_count = total_run_count + 1
             WHERE name = ?2 AND last_run_at IS ?3
               AND EXISTS (
                 SELECT 1 FROM leases
                 WHERE leases.name = ?4 AND leases.owner = ?5 AND leases.token = ?6
                   AND leases.expires_at > ?1
               )",
        )
        .bind(millis(fired_at))
        .bind(name)
        .bind(expected_last_run.map(millis))
        .bind(&lease.name)
        .bind(&lease.owner)
        .bind(lease.token as i64)
        .execute(&self.pool)
        .await?;
        if updated.rows_affected() > 0 {
            return Ok(FireOutcome::Fired);
        }

        let still_valid = self.current(&lease.name).await?.is_some_and(|current| {
            current.token == lease.token && current.owner == lease.owner && current.expires_at > fired_at
        });
        Ok(if still_valid {
            FireOutcome::AlreadyFired
        } else {
            FireOutcome::LeaseLost
        })
    }
}

#[async_trait]
impl LeaseStore for SqliteStore {
    async fn try_acquire(
        &self,
        name: &str,
        owner: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<Lease>> {
        // 同一持有者续租保留令牌，接管过期租约时令牌加一
        let updated = sqlx::query(
            "INSERT INTO leases (name, owner, token, expires_at) VALUES (?1, ?2, 1, ?3)
             ON CONFLICT (name) DO UPDATE SET
               token = CASE WHEN leases.owner = excluded.owner AND leases.expires_at > ?4
                            THEN leases.token ELSE leases.token + 1 END,
               owner = excluded.owner,
               expires_at = excluded.expires_at
             WHERE leases.owner = excluded.owner OR leases.expires_at <= ?4",
        )
        .bind(name)
        .bind(owner)
        .bind(millis(now + ttl))
        .bind(millis(now))
        .execute(&self.pool)
        .await?;
        if updated.rows_affected() == 0 {
            return Ok(None);
        }

        Ok(self
            .current(name)
            .await?
            .filter(|lease| lease.owner == owner))
    }

    async fn renew(&self, lease: &Lease, ttl: Duration, now: DateTime<Utc>) -> Result<Option<Lease>> {
        let expires_at = now + ttl;
        let updated = sqlx::query(
            "UPDATE leases SET expires_at = ?1
             WHERE name = ?2 AND owner = ?3 AND token = ?4 AND expires_at > ?5",
        )
        .bind(millis(expires_at))
        .bind(&lease.name)
        .bind(&lease.owner)
        .bind(lease.token as i64)
        .bind(millis(now))
        .execute(&self.pool)
        .await?;

        Ok((updated.rows_affected() > 0).then(|| Lease {
            expires_at: from_millis(millis(expires_at)).unwrap_or(expires_at),
            ..lease.clone()
        }))
    }

    async fn release(&self, lease: &Lease) -> Result<()> {
        sqlx::query("UPDATE leases SET expires_at = 0 WHERE name = ?1 AND owner = ?2 AND token = ?3")
            .bind(&lease.name)
            .bind(&lease.owner)
            .bind(lease.token as i64)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn current(&self, name: &str) -> Result<Option<Lease>> {
        let row = sqlx::query("SELECT name, owner, token, expires_at FROM leases WHERE name = ?1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_lease).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_millis_round_trip_truncates_to_milliseconds() {
        let now = Utc::now();
        let restored = from_millis(millis(now)).unwrap();
        assert_eq!(restored.timestamp_millis(), now.timestamp_millis());
        assert!(from_millis(i64::MAX).is_err());
    }
}

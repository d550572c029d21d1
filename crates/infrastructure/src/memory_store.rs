use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use taskbeat_core::{
    AttemptClaim, AttemptOutcome, ClaimPlan, EnvelopeState, ErrorPayload, ExecutionRecord,
    FireOutcome, Lease, LeaseStore, Result, ResultStore, RevokeOutcome, ScheduleEntry,
    ScheduleStore, TaskEnvelope, TaskStatus, TaskbeatError,
};
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Debug, Default)]
struct Inner {
    envelopes: HashMap<String, EnvelopeState>,
    executions: HashMap<String, Vec<ExecutionRecord>>,
    schedules: HashMap<String, ScheduleEntry>,
    leases: HashMap<String, Lease>,
}

impl Inner {
    fn record_mut(&mut self, envelope_id: &str, attempt: u32) -> Option<&mut ExecutionRecord> {
        self.executions
            .get_mut(envelope_id)?
            .iter_mut()
            .find(|record| record.attempt == attempt)
    }
}

/// 进程内存储，实现全部三个存储接口
///
/// 一把互斥锁保护全部状态，每个操作天然是原子的。只用于单进程部署和测试。
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

pub(crate) fn revoked_payload(envelope_id: &str) -> ErrorPayload {
    ErrorPayload::from(&TaskbeatError::Revoked {
        id: envelope_id.to_string(),
    })
}

#[async_trait]
impl ResultStore for MemoryStore {
    async fn insert_pending(&self, envelope: &TaskEnvelope, now: DateTime<Utc>) -> Result<()> {
        self.inner
            .lock()
            .await
            .envelopes
            .entry(envelope.id.clone())
            .or_insert_with(|| EnvelopeState::pending(envelope, now));
        Ok(())
    }

    async fn discard_pending(&self, envelope_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let discard = inner
            .envelopes
            .get(envelope_id)
            .is_some_and(|state| state.status == TaskStatus::Pending && state.attempts == 0);
        if discard {
            inner.envelopes.remove(envelope_id);
        }
        Ok(())
    }

    async fn get_state(&self, envelope_id: &str) -> Result<Option<EnvelopeState>> {
        Ok(self.inner.lock().await.envelopes.get(envelope_id).cloned())
    }

    async fn begin_attempt(
        &self,
        envelope: &TaskEnvelope,
        worker_id: &str,
        redelivered: bool,
        now: DateTime<Utc>,
    ) -> Result<AttemptClaim> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        let state = inner
            .envelopes
            .entry(envelope.id.clone())
            .or_insert_with(|| EnvelopeState::pending(envelope, now));

        match state.plan_claim(envelope, redelivered) {
            ClaimPlan::Start { attempt } => {
                state.status = TaskStatus::Started;
                state.attempts = attempt;
                state.worker_id = Some(worker_id.to_string());
                state.updated_at = now;
                inner
                    .executions
                    .entry(envelope.id.clone())
                    .or_default()
                    .push(ExecutionRecord::started(&envelope.id, attempt, worker_id, now));
                Ok(AttemptClaim::Started { attempt })
            }
            ClaimPlan::TakeOver { attempt } => {
                debug!(envelope.id = %envelope.id, attempt, worker_id, "接管重新投递的尝试");
                state.worker_id = Some(worker_id.to_string());
                state.updated_at = now;
                if let Some(record) = inner.record_mut(&envelope.id, attempt) {
                    record.worker_id = Some(worker_id.to_string());
                }
                Ok(AttemptClaim::Started { attempt })
            }
            ClaimPlan::Revoke { open_attempt } => {
                state.status = TaskStatus::Revoked;
                state.updated_at = now;
                if let Some(attempt) = open_attempt {
                    let payload = revoked_payload(&envelope.id);
                    if let Some(record) = inner.record_mut(&envelope.id, attempt) {
                        record.close(&AttemptOutcome::Revoked(payload), now);
                    }
                }
                Ok(AttemptClaim::Revoked)
            }
            ClaimPlan::Reply(claim) => Ok(claim),
        }
    }

    async fn finish_attempt(
        &self,
        envelope_id: &str,
        attempt: u32,
        worker_id: &str,
        outcome: &AttemptOutcome,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        let Some(state) = inner.envelopes.get_mut(envelope_id) else {
            return Ok(false);
        };
        let owns_attempt = state.status == TaskStatus::Started
            && state.attempts == attempt
            && state.worker_id.as_deref() == Some(worker_id);
        if !owns_attempt {
            return Ok(false);
        }

        state.status = outcome.status();
        state.updated_at = now;
        if let AttemptOutcome::Retry { next, .. } = outcome {
            state.envelope = next.clone();
            state.retries_done = next.retries_done;
            state.published_at = None;
        }
        if let Some(record) = inner.record_mut(envelope_id, attempt) {
            record.close(outcome, now);
        }
        Ok(true)
    }

    async fn mark_published(
        &self,
        envelope_id: &str,
        retries_done: u32,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if let Some(state) = self.inner.lock().await.envelopes.get_mut(envelope_id) {
            if state.retries_done == retries_done && state.published_at.is_none() {
                state.published_at = Some(now);
            }
        }
        Ok(())
    }

    async fn revoke(&self, envelope_id: &str, now: DateTime<Utc>) -> Result<RevokeOutcome> {
        let mut inner = self.inner.lock().await;
        let Some(state) = inner.envelopes.get_mut(envelope_id) else {
            return Ok(RevokeOutcome::NotFound);
        };
        if state.status.is_terminal() {
            return Ok(RevokeOutcome::AlreadyTerminal(state.status));
        }

        state.revoke_requested = true;
        state.updated_at = now;
        if state.status == TaskStatus::Started {
            Ok(RevokeOutcome::Requested)
        } else {
            state.status = TaskStatus::Revoked;
            Ok(RevokeOutcome::Revoked)
        }
    }

    async fn is_revoke_requested(&self, envelope_id: &str) -> Result<bool> {
        Ok(self
            .inner
            .lock()
            .await
            .envelopes
            .get(envelope_id)
            .is_some_and(|state| state.revoke_requested))
    }

    async fn list_attempts(&self, envelope_id: &str) -> Result<Vec<ExecutionRecord>> {
        let mut records = self
            .inner
            .lock()
            .await
            .executions
            .get(envelope_id)
            .cloned()
            .unwrap_or_default();
        records.sort_by_key(|record| record.attempt);
        Ok(records)
    }

    async fn list_unpublished(
        &self,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TaskEnvelope>> {
        let inner = self.inner.lock().await;
        let mut states: Vec<&EnvelopeState> = inner
            .envelopes
            .values()
            .filter(|state| {
                matches!(state.status, TaskStatus::Pending | TaskStatus::Retry)
                    && state.published_at.is_none()
                    && !state.revoke_requested
                    && state.updated_at <= older_than
            })
            .collect();
        states.sort_by_key(|state| state.updated_at);
        Ok(states
            .into_iter()
            .take(limit)
            .map(|state| state.envelope.clone())
            .collect())
    }
}

#[async_trait]
impl ScheduleStore for MemoryStore {
    async fn upsert_entry(&self, entry: &ScheduleEntry) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let mut updated = entry.clone();
        if let Some(existing) = inner.schedules.get(&entry.name) {
            updated.last_run_at = existing.last_run_at;
            updated.total_run_count = existing.total_run_count;
            updated.created_at = existing.created_at;
        }
        inner.schedules.insert(entry.name.clone(), updated);
        Ok(())
    }

    async fn list_entries(&self) -> Result<Vec<ScheduleEntry>> {
        let mut entries: Vec<ScheduleEntry> =
            self.inner.lock().await.schedules.values().cloned().collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn get_entry(&self, name: &str) -> Result<Option<ScheduleEntry>> {
        Ok(self.inner.lock().await.schedules.get(name).cloned())
    }

    async fn set_enabled(&self, name: &str, enabled: bool) -> Result<bool> {
        Ok(match self.inner.lock().await.schedules.get_mut(name) {
            Some(entry) => {
                entry.enabled = enabled;
                true
            }
            None => false,
        })
    }

    async fn remove_entry(&self, name: &str) -> Result<bool> {
        Ok(self.inner.lock().await.schedules.remove(name).is_some())
    }

    async fn record_fire(
        &self,
        name: &str,
        expected_last_run: Option<DateTime<Utc>>,
        fired_at: DateTime<Utc>,
        lease: &Lease,
    ) -> Result<FireOutcome> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        let lease_valid = inner.leases.get(&lease.name).is_some_and(|current| {
            current.owner == lease.owner
                && current.token == lease.token
                && current.expires_at > fired_at
        });
        if !lease_valid {
            return Ok(FireOutcome::LeaseLost);
        }

        match inner.schedules.get_mut(name) {
            Some(entry) if entry.last_run_at == expected_last_run => {
                entry.last_run_at = Some(fired_at);
                entry.total_run_count += 1;
                Ok(FireOutcome::Fired)
            }
            _ => Ok(FireOutcome::AlreadyFired),
        }
    }
}

#[async_trait]
impl LeaseStore for MemoryStore {
    async fn try_acquire(
        &self,
        name: &str,
        owner: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<Lease>> {
        let mut inner = self.inner.lock().await;
        let token = match inner.leases.get(name) {
            None => 1,
            Some(current) if current.is_held_by(owner, now) => current.token,
            Some(current) if current.is_expired(now) => current.token + 1,
            Some(_) => return Ok(None),
        };

        let lease = Lease {
            name: name.to_string(),
            owner: owner.to_string(),
            token,
            expires_at: now + ttl,
        };
        inner.leases.insert(name.to_string(), lease.clone());
        Ok(Some(lease))
    }

    async fn renew(&self, lease: &Lease, ttl: Duration, now: DateTime<Utc>) -> Result<Option<Lease>> {
        let mut inner = self.inner.lock().await;
        match inner.leases.get_mut(&lease.name) {
            Some(current) if current.token == lease.token && current.is_held_by(&lease.owner, now) => {
                current.expires_at = now + ttl;
                Ok(Some(current.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn release(&self, lease: &Lease) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(current) = inner.leases.get_mut(&lease.name) {
            if current.owner == lease.owner && current.token == lease.token {
                current.expires_at = DateTime::<Utc>::UNIX_EPOCH;
            }
        }
        Ok(())
    }

    async fn current(&self, name: &str) -> Result<Option<Lease>> {
        Ok(self.inner.lock().await.leases.get(name).cloned())
    }
}

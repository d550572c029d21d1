//! MemoryStore 与 SqliteStore 的共享行为测试

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use taskbeat_core::{
    AttemptClaim, AttemptOutcome, ErrorPayload, FireOutcome, LeaseStore, ResultStore,
    RevokeOutcome, ScheduleEntry, ScheduleStore, TaskEnvelope, TaskStatus,
};
use taskbeat_infrastructure::{MemoryStore, SqliteStore};

trait Backend: ResultStore + ScheduleStore + LeaseStore {}
impl<T: ResultStore + ScheduleStore + LeaseStore> Backend for T {}

/// 毫秒精度的当前时间，两种存储的读回值一致
fn now() -> DateTime<Utc> {
    DateTime::from_timestamp_millis(Utc::now().timestamp_millis()).unwrap()
}

async fn backends() -> Vec<(&'static str, Arc<dyn Backend>)> {
    let sqlite = SqliteStore::connect("sqlite::memory:", 1, StdDuration::from_secs(5))
        .await
        .expect("in-memory sqlite should open");
    vec![
        ("memory", Arc::new(MemoryStore::new()) as Arc<dyn Backend>),
        ("sqlite", Arc::new(sqlite) as Arc<dyn Backend>),
    ]
}

fn failure(message: &str) -> ErrorPayload {
    ErrorPayload::new("TaskExecutionError", message)
}

#[tokio::test]
async fn test_retry_then_success_records_each_attempt() {
    for (name, store) in backends().await {
        let t0 = now();
        let envelope = TaskEnvelope::new("flaky", json!({}), "default", 2);
        store.insert_pending(&envelope, t0).await.unwrap();

        let claim = store.begin_attempt(&envelope, "w1", false, t0).await.unwrap();
        assert_eq!(claim, AttemptClaim::Started { attempt: 1 }, "{name}");

        let next = envelope.next_retry(t0 + Duration::seconds(1)).unwrap();
        let outcome = AttemptOutcome::Retry {
            error: failure("boom"),
            next: next.clone(),
        };
        assert!(store.finish_attempt(&envelope.id, 1, "w1", &outcome, t0).await.unwrap());
        store.mark_published(&envelope.id, next.retries_done, t0).await.unwrap();

        let state = store.get_state(&envelope.id).await.unwrap().unwrap();
        assert_eq!(state.status, TaskStatus::Retry, "{name}");
        assert_eq!(state.envelope, next, "{name}");
        assert!(state.published_at.is_some(), "{name}");

        let claim = store.begin_attempt(&next, "w2", false, t0).await.unwrap();
        assert_eq!(claim, AttemptClaim::Started { attempt: 2 }, "{name}");
        let success = AttemptOutcome::Success(json!({"ok": true}));
        assert!(store.finish_attempt(&envelope.id, 2, "w2", &success, t0).await.unwrap());

        let attempts = store.list_attempts(&envelope.id).await.unwrap();
        let statuses: Vec<_> = attempts.iter().map(|r| r.status).collect();
        assert_eq!(statuses, vec![TaskStatus::Retry, TaskStatus::Success], "{name}");
        assert_eq!(attempts[0].error, Some(failure("boom")), "{name}");
        assert_eq!(attempts[1].result, Some(json!({"ok": true})), "{name}");
        assert_eq!(attempts[1].worker_id.as_deref(), Some("w2"), "{name}");

        // 终态后的重复投递
        let claim = store.begin_attempt(&next, "w3", true, t0).await.unwrap();
        assert_eq!(claim, AttemptClaim::AlreadyTerminal(TaskStatus::Success), "{name}");
    }
}

#[tokio::test]
async fn test_redelivery_takes_over_and_fences_previous_worker() {
    for (name, store) in backends().await {
        let t0 = now();
        let envelope = TaskEnvelope::new("slow", json!({}), "default", 0);
        store.insert_pending(&envelope, t0).await.unwrap();
        store.begin_attempt(&envelope, "w1", false, t0).await.unwrap();

        let duplicate = store.begin_attempt(&envelope, "w2", false, t0).await.unwrap();
        assert_eq!(
            duplicate,
            AttemptClaim::InFlightElsewhere {
                worker_id: Some("w1".to_string())
            },
            "{name}"
        );

        let takeover = store.begin_attempt(&envelope, "w2", true, t0).await.unwrap();
        assert_eq!(takeover, AttemptClaim::Started { attempt: 1 }, "{name}");

        let late = AttemptOutcome::Success(json!("late"));
        assert!(!store.finish_attempt(&envelope.id, 1, "w1", &late, t0).await.unwrap(), "{name}");
        let done = AttemptOutcome::Success(json!("done"));
        assert!(store.finish_attempt(&envelope.id, 1, "w2", &done, t0).await.unwrap(), "{name}");

        let attempts = store.list_attempts(&envelope.id).await.unwrap();
        assert_eq!(attempts.len(), 1, "{name}");
        assert_eq!(attempts[0].result, Some(json!("done")), "{name}");
    }
}

#[tokio::test]
async fn test_stale_copy_is_superseded_and_requests_republish() {
    for (name, store) in backends().await {
        let t0 = now();
        let envelope = TaskEnvelope::new("flaky", json!({}), "default", 3);
        store.insert_pending(&envelope, t0).await.unwrap();
        store.begin_attempt(&envelope, "w1", false, t0).await.unwrap();

        let next = envelope.next_retry(t0).unwrap();
        let outcome = AttemptOutcome::Retry {
            error: failure("boom"),
            next: next.clone(),
        };
        store.finish_attempt(&envelope.id, 1, "w1", &outcome, t0).await.unwrap();

        // 新副本尚未确认发布，旧副本的重新投递负责补发
        let claim = store.begin_attempt(&envelope, "w2", true, t0).await.unwrap();
        assert_eq!(
            claim,
            AttemptClaim::Superseded {
                republish: Some(next.clone())
            },
            "{name}"
        );

        store.mark_published(&envelope.id, next.retries_done, t0).await.unwrap();
        let claim = store.begin_attempt(&envelope, "w2", true, t0).await.unwrap();
        assert_eq!(claim, AttemptClaim::Superseded { republish: None }, "{name}");
    }
}

#[tokio::test]
async fn test_revoke_before_and_during_execution() {
    for (name, store) in backends().await {
        let t0 = now();
        assert_eq!(store.revoke("missing", t0).await.unwrap(), RevokeOutcome::NotFound);

        let queued = TaskEnvelope::new("send_alert", json!({}), "default", 0);
        store.insert_pending(&queued, t0).await.unwrap();
        assert_eq!(store.revoke(&queued.id, t0).await.unwrap(), RevokeOutcome::Revoked, "{name}");
        let claim = store.begin_attempt(&queued, "w1", false, t0).await.unwrap();
        assert_eq!(claim, AttemptClaim::AlreadyTerminal(TaskStatus::Revoked), "{name}");
        assert!(store.list_attempts(&queued.id).await.unwrap().is_empty(), "{name}");

        let running = TaskEnvelope::new("send_alert", json!({}), "default", 0);
        store.insert_pending(&running, t0).await.unwrap();
        store.begin_attempt(&running, "w1", false, t0).await.unwrap();
        assert_eq!(
            store.revoke(&running.id, t0).await.unwrap(),
            RevokeOutcome::Requested,
            "{name}"
        );
        assert!(store.is_revoke_requested(&running.id).await.unwrap(), "{name}");

        let revoked = AttemptOutcome::Revoked(ErrorPayload::new("Revoked", "cancelled"));
        assert!(store.finish_attempt(&running.id, 1, "w1", &revoked, t0).await.unwrap());
        assert_eq!(
            store.revoke(&running.id, t0).await.unwrap(),
            RevokeOutcome::AlreadyTerminal(TaskStatus::Revoked),
            "{name}"
        );
    }
}

#[tokio::test]
async fn test_crashed_worker_with_pending_revoke_is_closed_on_redelivery() {
    for (name, store) in backends().await {
        let t0 = now();
        let envelope = TaskEnvelope::new("slow", json!({}), "default", 0);
        store.insert_pending(&envelope, t0).await.unwrap();
        store.begin_attempt(&envelope, "w1", false, t0).await.unwrap();
        store.revoke(&envelope.id, t0).await.unwrap();

        let claim = store.begin_attempt(&envelope, "w2", true, t0).await.unwrap();
        assert_eq!(claim, AttemptClaim::Revoked, "{name}");

        let attempts = store.list_attempts(&envelope.id).await.unwrap();
        assert_eq!(attempts[0].status, TaskStatus::Revoked, "{name}");
        assert!(attempts[0].finished_at.is_some(), "{name}");
    }
}

#[tokio::test]
async fn test_unpublished_sweep_and_discard() {
    for (name, store) in backends().await {
        let t0 = now();
        let published = TaskEnvelope::new("a", json!({}), "default", 0);
        let lost = TaskEnvelope::new("b", json!({}), "default", 0);
        let abandoned = TaskEnvelope::new("c", json!({}), "default", 0);
        for envelope in [&published, &lost, &abandoned] {
            store.insert_pending(envelope, t0).await.unwrap();
        }
        store.mark_published(&published.id, 0, t0).await.unwrap();
        store.discard_pending(&abandoned.id).await.unwrap();
        assert!(store.get_state(&abandoned.id).await.unwrap().is_none(), "{name}");

        let swept = store
            .list_unpublished(t0 + Duration::seconds(1), 10)
            .await
            .unwrap();
        let ids: Vec<_> = swept.iter().map(|e| e.id.clone()).collect();
        assert_eq!(ids, vec![lost.id.clone()], "{name}");

        // 宽限期内的行不参与扫描
        assert!(store
            .list_unpublished(t0 - Duration::seconds(1), 10)
            .await
            .unwrap()
            .is_empty());
    }
}

#[tokio::test]
async fn test_schedule_upsert_preserves_run_state() {
    for (name, store) in backends().await {
        let t0 = now();
        let lease = store
            .try_acquire("beat", "beat-a", Duration::seconds(15), t0)
            .await
            .unwrap()
            .unwrap();

        let entry = ScheduleEntry::interval("poll", "poll_feed", 60, json!({})).with_created_at(t0);
        store.upsert_entry(&entry).await.unwrap();
        assert_eq!(
            store.record_fire("poll", None, t0, &lease).await.unwrap(),
            FireOutcome::Fired,
            "{name}"
        );

        let redefined = ScheduleEntry::interval("poll", "poll_feed", 30, json!({"x": 1}));
        store.upsert_entry(&redefined).await.unwrap();
        let stored = store.get_entry("poll").await.unwrap().unwrap();
        assert_eq!(stored.last_run_at, Some(t0), "{name}");
        assert_eq!(stored.total_run_count, 1, "{name}");
        assert_eq!(stored.created_at, t0, "{name}");
        assert_eq!(stored.args, json!({"x": 1}), "{name}");

        assert!(store.set_enabled("poll", false).await.unwrap());
        assert!(!store.get_entry("poll").await.unwrap().unwrap().enabled);
        assert!(!store.set_enabled("missing", true).await.unwrap());

        assert!(store.remove_entry("poll").await.unwrap());
        assert!(store.list_entries().await.unwrap().is_empty(), "{name}");
    }
}

#[tokio::test]
async fn test_record_fire_is_fenced_by_lease_and_last_run() {
    for (name, store) in backends().await {
        let t0 = now();
        let entry = ScheduleEntry::interval("poll", "poll_feed", 60, json!({})).with_created_at(t0);
        store.upsert_entry(&entry).await.unwrap();

        let old = store
            .try_acquire("beat", "beat-a", Duration::seconds(5), t0)
            .await
            .unwrap()
            .unwrap();
        let t1 = t0 + Duration::seconds(10);
        let new = store
            .try_acquire("beat", "beat-b", Duration::seconds(5), t1)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(new.token, old.token + 1, "{name}");

        assert_eq!(
            store.record_fire("poll", None, t1, &old).await.unwrap(),
            FireOutcome::LeaseLost,
            "{name}"
        );
        assert_eq!(
            store.record_fire("poll", None, t1, &new).await.unwrap(),
            FireOutcome::Fired,
            "{name}"
        );
        assert_eq!(
            store.record_fire("poll", None, t1, &new).await.unwrap(),
            FireOutcome::AlreadyFired,
            "{name}"
        );
    }
}

#[tokio::test]
async fn test_lease_acquire_renew_release() {
    for (name, store) in backends().await {
        let t0 = now();
        let ttl = Duration::seconds(15);
        let a = store.try_acquire("beat", "a", ttl, t0).await.unwrap().unwrap();
        assert!(store.try_acquire("beat", "b", ttl, t0).await.unwrap().is_none(), "{name}");

        // 持有者重复获取保留令牌
        let again = store.try_acquire("beat", "a", ttl, t0).await.unwrap().unwrap();
        assert_eq!(again.token, a.token, "{name}");

        let renewed = store
            .renew(&a, ttl, t0 + Duration::seconds(5))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(renewed.expires_at, t0 + Duration::seconds(20), "{name}");

        store.release(&renewed).await.unwrap();
        let b = store.try_acquire("beat", "b", ttl, t0).await.unwrap().unwrap();
        assert_eq!(b.token, a.token + 1, "{name}");
        assert!(store.renew(&a, ttl, t0).await.unwrap().is_none(), "{name}");

        let current = store.current("beat").await.unwrap().unwrap();
        assert_eq!(current.owner, "b", "{name}");
    }
}

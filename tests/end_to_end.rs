//! 进程内端到端测试：内存代理 + 内存存储，覆盖提交、调度、执行、重试、撤销和接管

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use taskbeat::app::{AppMode, Application, Components};
use taskbeat_core::config::AppConfig;
use taskbeat_core::{
    AttemptClaim, Broker, FnHandler, ResultStore, RetryPolicy, ScheduleEntry, ScheduleStore,
    TaskContext, TaskDefinition, TaskRegistry, TaskStatus, TaskbeatError,
};
use taskbeat_dispatcher::{BeatScheduler, LeaderElector, SubmitOptions};
use taskbeat_infrastructure::{InMemoryBroker, MemoryStore, Stores};
use taskbeat_worker::{ExecutionSettings, WorkerPool, WorkerPoolConfig};
use tokio_util::sync::CancellationToken;

fn fast_retry(max_retries: u32) -> RetryPolicy {
    RetryPolicy {
        max_retries,
        base_delay_ms: 10,
        max_delay_ms: 50,
        multiplier: 2.0,
        jitter_factor: 0.0,
    }
}

fn pool_config() -> WorkerPoolConfig {
    WorkerPoolConfig {
        concurrency: 2,
        queues: vec!["default".to_string()],
        poll_interval: Duration::from_millis(10),
        prefetch: 1,
        shutdown_grace: Duration::from_secs(1),
        execution: ExecutionSettings {
            default_timeout: Duration::from_secs(5),
            revocation_poll: Duration::from_millis(20),
        },
    }
}

struct Harness {
    broker: Arc<InMemoryBroker>,
    store: Arc<MemoryStore>,
    components: Components,
}

impl Harness {
    fn new(registry: TaskRegistry) -> Self {
        let broker = Arc::new(InMemoryBroker::new());
        let store = Arc::new(MemoryStore::new());
        let components = Components::from_parts(
            &AppConfig::default(),
            registry,
            broker.clone(),
            Stores::from_backend(store.clone()),
        );
        Self {
            broker,
            store,
            components,
        }
    }

    fn pool(&self, worker_id: &str) -> WorkerPool {
        WorkerPool::new(
            worker_id,
            Arc::clone(&self.components.registry),
            self.components.broker.clone(),
            self.store.clone(),
            pool_config(),
        )
    }

    fn beat(&self, owner: &str) -> BeatScheduler {
        let leader = LeaderElector::new(
            self.store.clone(),
            "beat",
            owner,
            chrono::Duration::seconds(15),
        );
        BeatScheduler::new(
            self.store.clone(),
            Arc::clone(&self.components.dispatch),
            leader,
            Duration::from_secs(1),
        )
    }

    async fn wait_for_terminal(&self, id: &str) -> TaskStatus {
        for _ in 0..300 {
            if let Some(state) = self.store.get_state(id).await.unwrap() {
                if state.status.is_terminal() {
                    return state.status;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("envelope {id} never reached a terminal status");
    }
}

fn noop_registry(names: &[&str]) -> TaskRegistry {
    let mut registry = TaskRegistry::new();
    for name in names {
        registry
            .register(TaskDefinition::new(
                *name,
                Arc::new(FnHandler::new(|_ctx: TaskContext| async { Ok(json!(null)) })),
            ))
            .unwrap();
    }
    registry
}

#[tokio::test]
async fn test_flaky_task_retries_until_success() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();

    let mut registry = TaskRegistry::new();
    registry
        .register(
            TaskDefinition::new(
                "send_alert",
                Arc::new(FnHandler::new(move |ctx: TaskContext| {
                    let counter = counter.clone();
                    async move {
                        if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                            return Err(TaskbeatError::TaskExecution("smtp unavailable".to_string()));
                        }
                        Ok(json!({ "sent": ctx.args["doc_id"] }))
                    }
                })),
            )
            .with_retry_policy(fast_retry(2)),
        )
        .unwrap();

    let harness = Harness::new(registry);
    let id = harness
        .components
        .dispatch
        .submit("send_alert", json!({ "doc_id": 42 }), SubmitOptions::default())
        .await
        .unwrap();

    let shutdown = CancellationToken::new();
    let running = tokio::spawn(harness.pool("worker-a").run(shutdown.clone()));
    assert_eq!(harness.wait_for_terminal(&id).await, TaskStatus::Success);
    shutdown.cancel();
    running.await.unwrap().unwrap();

    let attempts = harness.components.dispatch.attempts(&id).await.unwrap();
    let statuses: Vec<TaskStatus> = attempts.iter().map(|record| record.status).collect();
    assert_eq!(
        statuses,
        vec![TaskStatus::Retry, TaskStatus::Retry, TaskStatus::Success]
    );
    assert_eq!(
        attempts.iter().map(|record| record.attempt).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
    assert_eq!(attempts[2].result, Some(json!({ "sent": 42 })));

    let status = harness.components.dispatch.get_status(&id).await.unwrap();
    assert_eq!(status.status, TaskStatus::Success);
}

#[tokio::test]
async fn test_attempts_are_bounded_by_max_retries() {
    let mut registry = TaskRegistry::new();
    registry
        .register(
            TaskDefinition::new(
                "always_fails",
                Arc::new(FnHandler::new(|_ctx: TaskContext| async {
                    Err(TaskbeatError::TaskExecution("boom".to_string()))
                })),
            )
            .with_retry_policy(fast_retry(5)),
        )
        .unwrap();

    let harness = Harness::new(registry);
    let id = harness
        .components
        .dispatch
        .submit(
            "always_fails",
            json!({}),
            SubmitOptions::default().with_max_retries(3),
        )
        .await
        .unwrap();

    let shutdown = CancellationToken::new();
    let running = tokio::spawn(harness.pool("worker-a").run(shutdown.clone()));
    assert_eq!(harness.wait_for_terminal(&id).await, TaskStatus::Failure);
    shutdown.cancel();
    running.await.unwrap().unwrap();

    let attempts = harness.components.dispatch.attempts(&id).await.unwrap();
    assert_eq!(attempts.len(), 4);
    let last = attempts.last().unwrap();
    assert_eq!(last.status, TaskStatus::Failure);
    assert_eq!(
        last.error.as_ref().map(|error| error.kind.as_str()),
        Some("TaskExecutionError")
    );
}

#[tokio::test]
async fn test_interval_entry_fires_once_in_sixty_one_seconds() {
    let harness = Harness::new(noop_registry(&["heartbeat"]));
    let mut beat = harness.beat("scheduler-a");
    let created = Utc::now();

    let entry = ScheduleEntry::interval("heartbeat-every-minute", "heartbeat", 60, json!({}))
        .with_created_at(created);
    beat.sync_entries(&[entry]).await.unwrap();

    let mut fired = Vec::new();
    for second in 0..=61 {
        let report = beat
            .tick_at(created + chrono::Duration::seconds(second))
            .await
            .unwrap();
        fired.extend(report.fired().into_iter().map(str::to_string));
    }

    assert_eq!(fired.len(), 1);
    assert_eq!(harness.broker.queue_len("default").await.unwrap(), 1);
    let entry = harness
        .store
        .get_entry("heartbeat-every-minute")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.total_run_count, 1);
    assert_eq!(entry.last_run_at, Some(created + chrono::Duration::seconds(60)));
}

#[tokio::test]
async fn test_contending_schedulers_fire_each_period_once() {
    let harness = Harness::new(noop_registry(&["poll_feed"]));
    let mut first = harness.beat("scheduler-a");
    let mut second = harness.beat("scheduler-b");
    let created = Utc::now();

    let entry = ScheduleEntry::interval("poll", "poll_feed", 10, json!({})).with_created_at(created);
    first.sync_entries(&[entry.clone()]).await.unwrap();
    second.sync_entries(&[entry]).await.unwrap();

    let mut fired = 0;
    for step in 0..=30 {
        let now = created + chrono::Duration::seconds(step);
        let (a, b) = tokio::join!(first.tick_at(now), second.tick_at(now));
        let (a, b) = (a.unwrap(), b.unwrap());
        assert!(!(a.leader && b.leader), "two leaders at {step}s");
        fired += a.fired().len() + b.fired().len();
    }

    // 10s、20s、30s 三个周期
    assert_eq!(fired, 3);
    assert_eq!(harness.broker.queue_len("default").await.unwrap(), 3);
}

#[tokio::test]
async fn test_revoke_before_consume_skips_handler() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();

    let mut registry = TaskRegistry::new();
    registry
        .register(TaskDefinition::new(
            "archive",
            Arc::new(FnHandler::new(move |_ctx: TaskContext| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(json!(null))
                }
            })),
        ))
        .unwrap();

    let harness = Harness::new(registry);
    let id = harness
        .components
        .dispatch
        .submit("archive", json!({}), SubmitOptions::default())
        .await
        .unwrap();
    assert!(harness.components.dispatch.revoke(&id).await.unwrap());

    let shutdown = CancellationToken::new();
    let running = tokio::spawn(harness.pool("worker-a").run(shutdown.clone()));
    assert_eq!(harness.wait_for_terminal(&id).await, TaskStatus::Revoked);

    for _ in 0..100 {
        if harness.broker.queue_len("default").await.unwrap() == 0
            && harness.broker.in_flight_len("default").await == 0
        {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    shutdown.cancel();
    running.await.unwrap().unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(harness.broker.queue_len("default").await.unwrap(), 0);
    assert!(!harness.components.dispatch.revoke(&id).await.unwrap());
}

#[tokio::test]
async fn test_redelivered_envelope_is_taken_over_after_worker_crash() {
    let harness = Harness::new(noop_registry(&["reindex"]));
    let id = harness
        .components
        .dispatch
        .submit("reindex", json!({ "shard": 3 }), SubmitOptions::default())
        .await
        .unwrap();

    // 模拟崩溃：取到投递并开始尝试后，不确认也不完成
    let delivery = harness.broker.fetch("default", 1).await.unwrap().remove(0);
    let claim = harness
        .store
        .begin_attempt(&delivery.envelope, "worker-crashed", false, Utc::now())
        .await
        .unwrap();
    assert_eq!(claim, AttemptClaim::Started { attempt: 1 });
    harness.broker.requeue(&delivery).await.unwrap();

    let shutdown = CancellationToken::new();
    let running = tokio::spawn(harness.pool("worker-b").run(shutdown.clone()));
    assert_eq!(harness.wait_for_terminal(&id).await, TaskStatus::Success);
    shutdown.cancel();
    running.await.unwrap().unwrap();

    let attempts = harness.components.dispatch.attempts(&id).await.unwrap();
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].attempt, 1);
    assert_eq!(attempts[0].worker_id.as_deref(), Some("worker-b"));
}

#[tokio::test]
async fn test_application_runs_beat_and_workers_together() {
    let executed = Arc::new(AtomicU32::new(0));
    let counter = executed.clone();

    let mut registry = TaskRegistry::new();
    registry
        .register(TaskDefinition::new(
            "tick",
            Arc::new(FnHandler::new(move |_ctx: TaskContext| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(json!(null))
                }
            })),
        ))
        .unwrap();

    let mut config = AppConfig::default();
    config.beat.tick_interval_ms = 100;
    config.beat.entries = vec![ScheduleEntry::interval("every-second", "tick", 1, json!({}))
        .with_created_at(Utc::now() - chrono::Duration::seconds(5))];
    config.worker.poll_interval_ms = 10;
    config.worker.shutdown_grace_seconds = 1;

    let store = Arc::new(MemoryStore::new());
    let components = Components::from_parts(
        &config,
        registry,
        Arc::new(InMemoryBroker::new()),
        Stores::from_backend(store.clone()),
    );
    let app = Application::with_components(config, AppMode::All, "node-1".to_string(), components);

    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    let running = tokio::spawn(async move { app.run(token).await });

    for _ in 0..300 {
        if executed.load(Ordering::SeqCst) >= 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    shutdown.cancel();
    running.await.unwrap().unwrap();

    assert!(executed.load(Ordering::SeqCst) >= 2);
    let entry = store.get_entry("every-second").await.unwrap().unwrap();
    assert!(entry.total_run_count >= 2);
    assert!(entry.last_run_at.is_some());
}

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use taskbeat_core::{Broker, FnHandler, TaskDefinition, TaskRegistry};
use taskbeat_dispatcher::{DispatchCore, RecoveryConfig, SubmitOptions};
use taskbeat_infrastructure::{
    InMemoryBroker, MemoryStore, ResilientBroker, ResilientBrokerConfig,
};

fn registry() -> Arc<TaskRegistry> {
    let mut registry = TaskRegistry::new();
    registry
        .register(
            TaskDefinition::new(
                "send_alert",
                Arc::new(FnHandler::new(|_ctx| async { Ok(json!(null)) })),
            )
            .with_default_queue("alerts"),
        )
        .unwrap();
    Arc::new(registry)
}

#[tokio::test]
async fn test_recovery_sweep_does_not_duplicate_buffered_envelope() {
    let inner = Arc::new(InMemoryBroker::new());
    let store = Arc::new(MemoryStore::new());
    let resilient = Arc::new(
        ResilientBroker::new(inner.clone(), ResilientBrokerConfig::default())
            .with_store(store.clone()),
    );
    let dispatch = DispatchCore::new(registry(), resilient.clone(), store.clone()).with_recovery(
        RecoveryConfig {
            grace: chrono::Duration::seconds(30),
            batch: 10,
        },
    );

    inner.set_available(false);
    let id = dispatch
        .submit("send_alert", json!({"doc_id": 1}), SubmitOptions::default())
        .await
        .unwrap();
    assert_eq!(resilient.buffered_len().await, 1);

    // 代理宕机期间每一轮扫描都会再次看到这条未确认发布的信封
    let later = Utc::now() + chrono::Duration::seconds(120);
    for _ in 0..5 {
        assert_eq!(dispatch.recover_unpublished(later).await.unwrap(), 0);
    }
    assert_eq!(resilient.buffered_len().await, 1);

    inner.set_available(true);
    assert_eq!(resilient.flush().await.unwrap(), 1);
    assert_eq!(inner.queue_len("alerts").await.unwrap(), 1);
    assert_eq!(inner.fetch("alerts", 10).await.unwrap().len(), 1);

    // 刷新后已标记为已发布，不再补发
    assert_eq!(dispatch.recover_unpublished(later).await.unwrap(), 0);
    assert_eq!(resilient.buffered_len().await, 0);
    assert!(dispatch.get_status(&id).await.is_ok());
}

#[tokio::test]
async fn test_buffer_accepts_a_retry_of_the_same_envelope() {
    let inner = Arc::new(InMemoryBroker::new());
    let resilient = ResilientBroker::new(inner.clone(), ResilientBrokerConfig::default());

    let dispatch = DispatchCore::new(registry(), inner.clone(), Arc::new(MemoryStore::new()));
    let envelope = dispatch
        .build_envelope("send_alert", json!({"doc_id": 2}), SubmitOptions::default(), Utc::now())
        .unwrap();
    let mut retry = envelope.clone();
    retry.retries_done = 1;

    inner.set_available(false);
    resilient.publish("alerts", &envelope).await.unwrap();
    resilient.publish("alerts", &envelope).await.unwrap();
    resilient.publish("alerts", &retry).await.unwrap();
    assert_eq!(resilient.buffered_len().await, 2);
}

//! Structured logging utilities
//!
//! 所有事件都带 `event` 字段，便于在 JSON 日志中按事件类型过滤。

use chrono::{DateTime, Utc};
use taskbeat_core::{ErrorPayload, TaskEnvelope};
use tracing::{debug, error, info, warn};

pub struct StructuredLogger;

impl StructuredLogger {
    pub fn log_task_submitted(envelope: &TaskEnvelope, buffered: bool) {
        info!(
            event = "task_submitted",
            envelope.id = %envelope.id,
            task.name = %envelope.task_name,
            task.queue = %envelope.queue,
            task.eta = ?envelope.eta,
            task.max_retries = envelope.max_retries,
            publish.buffered = buffered,
            "Task submitted"
        );
    }

    pub fn log_task_started(envelope: &TaskEnvelope, attempt: u32, worker_id: &str) {
        info!(
            event = "task_started",
            envelope.id = %envelope.id,
            task.name = %envelope.task_name,
            task.attempt = attempt,
            worker.id = worker_id,
            "Task execution started"
        );
    }

    pub fn log_task_succeeded(
        envelope: &TaskEnvelope,
        attempt: u32,
        worker_id: &str,
        duration_ms: u64,
    ) {
        info!(
            event = "task_succeeded",
            envelope.id = %envelope.id,
            task.name = %envelope.task_name,
            task.attempt = attempt,
            task.duration_ms = duration_ms,
            worker.id = worker_id,
            "Task execution completed successfully"
        );
    }

    pub fn log_task_retry(envelope: &TaskEnvelope, error: &ErrorPayload, eta: DateTime<Utc>) {
        warn!(
            event = "task_retry",
            envelope.id = %envelope.id,
            task.name = %envelope.task_name,
            task.retries_done = envelope.retries_done,
            task.max_retries = envelope.max_retries,
            task.error_kind = %error.kind,
            task.error = %error.message,
            task.next_eta = %eta,
            "Task retry scheduled"
        );
    }

    pub fn log_task_failed(
        envelope: &TaskEnvelope,
        attempt: u32,
        worker_id: &str,
        error: &ErrorPayload,
    ) {
        error!(
            event = "task_failed",
            envelope.id = %envelope.id,
            task.name = %envelope.task_name,
            task.attempt = attempt,
            worker.id = worker_id,
            task.error_kind = %error.kind,
            task.error = %error.message,
            "Task execution failed"
        );
    }

    pub fn log_task_revoked(envelope_id: &str, task_name: &str, during_execution: bool) {
        info!(
            event = "task_revoked",
            envelope.id = envelope_id,
            task.name = task_name,
            task.during_execution = during_execution,
            "Task revoked"
        );
    }

    pub fn log_duplicate_delivery(envelope: &TaskEnvelope, reason: &str) {
        debug!(
            event = "duplicate_delivery",
            envelope.id = %envelope.id,
            task.name = %envelope.task_name,
            task.retries_done = envelope.retries_done,
            reason,
            "Duplicate delivery discarded"
        );
    }

    pub fn log_beat_fired(entry: &str, task_name: &str, envelope_id: &str, fired_at: DateTime<Utc>) {
        info!(
            event = "beat_fired",
            schedule.name = entry,
            task.name = task_name,
            envelope.id = envelope_id,
            schedule.fired_at = %fired_at,
            "Schedule entry fired"
        );
    }

    pub fn log_leadership_acquired(lease: &str, owner: &str, token: u64) {
        info!(
            event = "leadership_acquired",
            lease.name = lease,
            lease.owner = owner,
            lease.token = token,
            "Beat leadership acquired"
        );
    }

    pub fn log_leadership_lost(lease: &str, owner: &str, reason: &str) {
        warn!(
            event = "leadership_lost",
            lease.name = lease,
            lease.owner = owner,
            reason,
            "Beat leadership lost"
        );
    }

    pub fn log_broker_outage(broker: &str, error: &str, buffered: usize) {
        warn!(
            event = "broker_outage",
            broker.kind = broker,
            broker.error = error,
            publish.buffered = buffered,
            "Broker unavailable"
        );
    }

    pub fn log_broker_recovered(broker: &str, flushed: usize) {
        info!(
            event = "broker_recovered",
            broker.kind = broker,
            publish.flushed = flushed,
            "Broker connection recovered"
        );
    }
}

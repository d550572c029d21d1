use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Result, TaskbeatError};

/// 当前信封线格式版本
pub const ENVELOPE_VERSION: u32 = 1;

fn default_version() -> u32 {
    ENVELOPE_VERSION
}

/// 任务信封：放到消息代理上的一个工作单元
///
/// 新增字段必须带 `#[serde(default)]`，旧版本 worker 在滚动升级期间仍能读取。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub id: String,
    pub task_name: String,
    #[serde(default)]
    pub args: serde_json::Value,
    pub queue: String,
    #[serde(default)]
    pub eta: Option<DateTime<Utc>>,
    #[serde(default)]
    pub retries_done: u32,
    #[serde(default)]
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    /// 由 beat 产生时对应的调度条目名称
    #[serde(default)]
    pub schedule: Option<String>,
    #[serde(default = "default_version")]
    pub version: u32,
}

impl TaskEnvelope {
    pub fn new(
        task_name: impl Into<String>,
        args: serde_json::Value,
        queue: impl Into<String>,
        max_retries: u32,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            task_name: task_name.into(),
            args,
            queue: queue.into(),
            eta: None,
            retries_done: 0,
            max_retries,
            created_at: Utc::now(),
            timeout_seconds: None,
            schedule: None,
            version: ENVELOPE_VERSION,
        }
    }

    pub fn with_eta(mut self, eta: Option<DateTime<Utc>>) -> Self {
        self.eta = eta;
        self
    }

    pub fn with_timeout_seconds(mut self, timeout_seconds: Option<u64>) -> Self {
        self.timeout_seconds = timeout_seconds;
        self
    }

    pub fn with_schedule(mut self, schedule: impl Into<String>) -> Self {
        self.schedule = Some(schedule.into());
        self
    }

    /// 本信封对应的尝试序号（从1开始）
    pub fn attempt(&self) -> u32 {
        self.retries_done + 1
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.eta.map_or(true, |eta| eta <= now)
    }

    pub fn retries_exhausted(&self) -> bool {
        self.retries_done >= self.max_retries
    }

    /// 构造重试副本：retries_done 加一并设置新的最早执行时间
    pub fn next_retry(&self, eta: DateTime<Utc>) -> Result<Self> {
        if self.retries_exhausted() {
            return Err(TaskbeatError::Internal(format!(
                "信封 {} 已用尽重试次数 {}/{}",
                self.id, self.retries_done, self.max_retries
            )));
        }
        let mut next = self.clone();
        next.retries_done += 1;
        next.eta = Some(eta);
        Ok(next)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| TaskbeatError::Serialization(format!("序列化信封失败: {e}")))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| TaskbeatError::Serialization(format!("序列化信封失败: {e}")))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| TaskbeatError::Serialization(format!("反序列化信封失败: {e}")))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| TaskbeatError::Serialization(format!("反序列化信封失败: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    #[test]
    fn test_envelope_creation() {
        let envelope = TaskEnvelope::new("send_alert", json!({"doc_id": 42}), "default", 2);

        assert!(!envelope.id.is_empty());
        assert_eq!(envelope.retries_done, 0);
        assert_eq!(envelope.attempt(), 1);
        assert_eq!(envelope.version, ENVELOPE_VERSION);
        assert!(envelope.is_due(Utc::now()));
    }

    #[test]
    fn test_next_retry_increments_and_sets_eta() {
        let envelope = TaskEnvelope::new("send_alert", json!({}), "default", 1);
        let eta = Utc::now() + Duration::seconds(30);

        let retry = envelope.next_retry(eta).unwrap();
        assert_eq!(retry.id, envelope.id);
        assert_eq!(retry.retries_done, 1);
        assert_eq!(retry.eta, Some(eta));
        assert!(!retry.is_due(Utc::now()));
        assert!(retry.retries_exhausted());
        assert!(retry.next_retry(eta).is_err());
    }

    #[test]
    fn test_reads_older_wire_format() {
        // 旧版本生产者不带 timeout_seconds / schedule / version 字段
        let raw = r#"{
            "id": "abc",
            "task_name": "ocr_document",
            "args": {"doc_id": 7},
            "queue": "documents",
            "eta": null,
            "retries_done": 1,
            "max_retries": 3,
            "created_at": "2024-01-01T00:00:00Z",
            "unknown_future_field": true
        }"#;

        let envelope = TaskEnvelope::from_json(raw).unwrap();
        assert_eq!(envelope.task_name, "ocr_document");
        assert_eq!(envelope.retries_done, 1);
        assert_eq!(envelope.timeout_seconds, None);
        assert_eq!(envelope.version, ENVELOPE_VERSION);
    }

    #[test]
    fn test_rejects_garbage() {
        let err = TaskEnvelope::from_bytes(b"not json").unwrap_err();
        assert!(matches!(err, TaskbeatError::Serialization(_)));
    }
}

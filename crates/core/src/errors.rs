use thiserror::Error;

/// 调度核心错误类型定义
#[derive(Debug, Error)]
pub enum TaskbeatError {
    #[error("未注册的任务: {name}")]
    UnknownTask { name: String },

    #[error("任务重复注册: {name}")]
    DuplicateTask { name: String },

    #[error("消息代理不可用: {0}")]
    BrokerUnavailable(String),

    #[error("发布缓冲区已满 (容量 {capacity})，请稍后重试")]
    PublishBackpressure { capacity: usize },

    #[error("任务执行超时: {seconds}s")]
    TaskTimeout { seconds: u64 },

    #[error("任务执行错误: {0}")]
    TaskExecution(String),

    #[error("无效的任务参数: {0}")]
    InvalidTaskParams(String),

    #[error("任务已撤销: {id}")]
    Revoked { id: String },

    #[error("任务信封未找到: {id}")]
    EnvelopeNotFound { id: String },

    #[error("无效的CRON表达式: {expr} - {message}")]
    InvalidCron { expr: String, message: String },

    #[error("失去领导权: {lease}")]
    LeaseLost { lease: String },

    #[error("消息队列错误: {0}")]
    MessageQueue(String),

    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    #[error("序列化错误: {0}")]
    Serialization(String),

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

impl TaskbeatError {
    /// 处理器失败后是否允许进入重试路径
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TaskbeatError::TaskTimeout { .. }
                | TaskbeatError::TaskExecution(_)
                | TaskbeatError::BrokerUnavailable(_)
                | TaskbeatError::Internal(_)
        )
    }

    /// 写入执行记录 error_payload 时使用的错误类别
    pub fn kind(&self) -> &'static str {
        match self {
            TaskbeatError::UnknownTask { .. } => "UnknownTaskError",
            TaskbeatError::DuplicateTask { .. } => "DuplicateTaskError",
            TaskbeatError::BrokerUnavailable(_) => "BrokerUnavailableError",
            TaskbeatError::PublishBackpressure { .. } => "PublishBackpressureError",
            TaskbeatError::TaskTimeout { .. } => "TaskTimeoutError",
            TaskbeatError::TaskExecution(_) => "TaskExecutionError",
            TaskbeatError::InvalidTaskParams(_) => "InvalidTaskParamsError",
            TaskbeatError::Revoked { .. } => "RevokedError",
            TaskbeatError::EnvelopeNotFound { .. } => "EnvelopeNotFoundError",
            TaskbeatError::InvalidCron { .. } => "InvalidCronError",
            TaskbeatError::LeaseLost { .. } => "LeaseLostError",
            TaskbeatError::MessageQueue(_) => "MessageQueueError",
            TaskbeatError::Database(_) => "DatabaseError",
            TaskbeatError::Serialization(_) => "SerializationError",
            TaskbeatError::Configuration(_) => "ConfigurationError",
            TaskbeatError::Internal(_) => "InternalError",
        }
    }
}

impl From<serde_json::Error> for TaskbeatError {
    fn from(e: serde_json::Error) -> Self {
        TaskbeatError::Serialization(e.to_string())
    }
}

/// 统一的Result类型
pub type Result<T> = std::result::Result<T, TaskbeatError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(TaskbeatError::TaskTimeout { seconds: 5 }.is_retryable());
        assert!(TaskbeatError::TaskExecution("boom".to_string()).is_retryable());
        assert!(!TaskbeatError::InvalidTaskParams("missing doc_id".to_string()).is_retryable());
        assert!(!TaskbeatError::UnknownTask {
            name: "nope".to_string()
        }
        .is_retryable());
    }

    #[test]
    fn test_error_kind_names() {
        assert_eq!(
            TaskbeatError::TaskTimeout { seconds: 1 }.kind(),
            "TaskTimeoutError"
        );
        assert_eq!(
            TaskbeatError::PublishBackpressure { capacity: 8 }.kind(),
            "PublishBackpressureError"
        );
    }
}

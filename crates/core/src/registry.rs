use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::retry::RetryPolicy;
use crate::traits::TaskHandler;
use crate::{Result, TaskbeatError};

/// 任务参数的声明式约束，提交时校验
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ArgsSchema {
    /// 任意 JSON
    #[default]
    Any,
    /// JSON 对象，且必须包含给定字段
    Object { required: Vec<String> },
}

impl ArgsSchema {
    pub fn object<I, S>(required: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ArgsSchema::Object {
            required: required.into_iter().map(Into::into).collect(),
        }
    }

    pub fn validate(&self, task_name: &str, args: &serde_json::Value) -> Result<()> {
        match self {
            ArgsSchema::Any => Ok(()),
            ArgsSchema::Object { required } => {
                let object = args.as_object().ok_or_else(|| {
                    TaskbeatError::InvalidTaskParams(format!("{task_name}: 参数必须是JSON对象"))
                })?;
                let missing: Vec<&str> = required
                    .iter()
                    .filter(|field| !object.contains_key(field.as_str()))
                    .map(String::as_str)
                    .collect();
                if missing.is_empty() {
                    Ok(())
                } else {
                    Err(TaskbeatError::InvalidTaskParams(format!(
                        "{task_name}: 缺少必填参数 {}",
                        missing.join(", ")
                    )))
                }
            }
        }
    }
}

/// 任务定义，启动时注册一次
#[derive(Clone)]
pub struct TaskDefinition {
    pub name: String,
    pub handler: Arc<dyn TaskHandler>,
    pub schema: ArgsSchema,
    pub retry_policy: RetryPolicy,
    pub default_queue: String,
    pub timeout: Option<Duration>,
}

impl TaskDefinition {
    pub fn new(name: impl Into<String>, handler: Arc<dyn TaskHandler>) -> Self {
        Self {
            name: name.into(),
            handler,
            schema: ArgsSchema::Any,
            retry_policy: RetryPolicy::default(),
            default_queue: "default".to_string(),
            timeout: None,
        }
    }

    pub fn with_schema(mut self, schema: ArgsSchema) -> Self {
        self.schema = schema;
        self
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn with_default_queue(mut self, queue: impl Into<String>) -> Self {
        self.default_queue = queue.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl fmt::Debug for TaskDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskDefinition")
            .field("name", &self.name)
            .field("schema", &self.schema)
            .field("retry_policy", &self.retry_policy)
            .field("default_queue", &self.default_queue)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// 任务名称到定义的映射
///
/// 在 worker 池和 beat 启动前构建完成，之后只读，通过 `Arc<TaskRegistry>` 共享。
#[derive(Debug, Default)]
pub struct TaskRegistry {
    definitions: HashMap<String, TaskDefinition>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, definition: TaskDefinition) -> Result<()> {
        if self.definitions.contains_key(&definition.name) {
            return Err(TaskbeatError::DuplicateTask {
                name: definition.name,
            });
        }
        self.definitions.insert(definition.name.clone(), definition);
        Ok(())
    }

    pub fn resolve(&self, name: &str) -> Result<&TaskDefinition> {
        self.definitions
            .get(name)
            .ok_or_else(|| TaskbeatError::UnknownTask {
                name: name.to_string(),
            })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.definitions.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.definitions.keys().cloned().collect();
        names.sort();
        names
    }

    /// 所有定义涉及的默认队列（去重、排序）
    pub fn queues(&self) -> Vec<String> {
        let mut queues: Vec<String> = self
            .definitions
            .values()
            .map(|d| d.default_queue.clone())
            .collect();
        queues.sort();
        queues.dedup();
        queues
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::{FnHandler, TaskContext};
    use serde_json::json;

    fn noop() -> Arc<dyn TaskHandler> {
        Arc::new(FnHandler::new(|_ctx: TaskContext| async { Ok(json!(null)) }))
    }

    #[test]
    fn test_register_and_resolve() {
        let mut registry = TaskRegistry::new();
        registry
            .register(TaskDefinition::new("ocr_document", noop()).with_default_queue("documents"))
            .unwrap();

        let definition = registry.resolve("ocr_document").unwrap();
        assert_eq!(definition.default_queue, "documents");
        assert_eq!(registry.queues(), vec!["documents".to_string()]);
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut registry = TaskRegistry::new();
        registry
            .register(TaskDefinition::new("send_alert", noop()))
            .unwrap();

        let err = registry
            .register(TaskDefinition::new("send_alert", noop()))
            .unwrap_err();
        assert!(matches!(err, TaskbeatError::DuplicateTask { name } if name == "send_alert"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_unknown_task() {
        let registry = TaskRegistry::new();
        assert!(matches!(
            registry.resolve("nope"),
            Err(TaskbeatError::UnknownTask { .. })
        ));
    }

    #[test]
    fn test_schema_validation() {
        let schema = ArgsSchema::object(["doc_id"]);

        assert!(schema.validate("send_alert", &json!({"doc_id": 42})).is_ok());
        assert!(matches!(
            schema.validate("send_alert", &json!({})),
            Err(TaskbeatError::InvalidTaskParams(_))
        ));
        assert!(matches!(
            schema.validate("send_alert", &json!([42])),
            Err(TaskbeatError::InvalidTaskParams(_))
        ));
        assert!(ArgsSchema::Any.validate("x", &json!("anything")).is_ok());
    }
}

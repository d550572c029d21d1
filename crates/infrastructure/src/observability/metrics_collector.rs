//! Metrics collector
//!
//! 通过 `metrics` 门面记录，是否导出由二进制安装的 recorder 决定。

use metrics::{counter, gauge, histogram, Counter, Gauge, Histogram};

#[derive(Clone)]
pub struct MetricsCollector {
    tasks_submitted_total: Counter,
    beat_fires_total: Counter,
    beat_tick_duration: Histogram,
    publish_buffer_depth: Gauge,
    tasks_in_flight: Gauge,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            tasks_submitted_total: counter!("taskbeat_tasks_submitted_total"),
            beat_fires_total: counter!("taskbeat_beat_fires_total"),
            beat_tick_duration: histogram!("taskbeat_beat_tick_duration_seconds"),
            publish_buffer_depth: gauge!("taskbeat_publish_buffer_depth"),
            tasks_in_flight: gauge!("taskbeat_tasks_in_flight"),
        }
    }

    pub fn record_task_submitted(&self) {
        self.tasks_submitted_total.increment(1);
    }

    /// 一次尝试结束，`status` 为尝试记录的终止状态
    pub fn record_task_execution(&self, task_name: &str, status: &str, duration_seconds: f64) {
        counter!(
            "taskbeat_task_executions_total",
            "task" => task_name.to_string(),
            "status" => status.to_string()
        )
        .increment(1);
        histogram!(
            "taskbeat_task_execution_duration_seconds",
            "task" => task_name.to_string()
        )
        .record(duration_seconds);
    }

    pub fn record_task_retry(&self, task_name: &str) {
        counter!("taskbeat_task_retries_total", "task" => task_name.to_string()).increment(1);
    }

    pub fn record_beat_fire(&self) {
        self.beat_fires_total.increment(1);
    }

    pub fn record_beat_tick(&self, duration_seconds: f64) {
        self.beat_tick_duration.record(duration_seconds);
    }

    pub fn record_broker_operation(&self, broker: &'static str, operation: &'static str, ok: bool) {
        counter!(
            "taskbeat_broker_operations_total",
            "broker" => broker,
            "operation" => operation,
            "result" => if ok { "ok" } else { "error" }
        )
        .increment(1);
    }

    pub fn update_publish_buffer_depth(&self, depth: usize) {
        self.publish_buffer_depth.set(depth as f64);
    }

    pub fn update_tasks_in_flight(&self, count: usize) {
        self.tasks_in_flight.set(count as f64);
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

//! 结构化事件日志与指标
//!
//! 事件日志统一带有 `event` 字段，便于在json日志中检索；
//! 指标通过 `metrics` 门面记录，未安装recorder时为空操作。

use std::sync::atomic::{AtomicI64, Ordering};

use batch_core::models::{ExecState, ExecType};
use metrics::{counter, gauge, histogram, Counter, Gauge, Histogram};
use tracing::{info, warn};

pub struct StructuredLogger;

impl StructuredLogger {
    pub fn log_batch_started(batch_id: &str, schedule_id: i64, exec_type: ExecType, task_total: usize) {
        info!(
            event = "batch_started",
            batch.id = batch_id,
            schedule.id = schedule_id,
            exec_type = exec_type.as_i8(),
            task_total = task_total,
            "批次开始执行"
        );
    }

    pub fn log_task_dispatched(batch_task_id: &str, task_id: i64, task_name: &str, address: &str) {
        info!(
            event = "task_dispatched",
            batch_task.id = batch_task_id,
            task.id = task_id,
            task.name = task_name,
            worker.address = address,
            "任务已派发至Worker"
        );
    }

    pub fn log_task_finished(
        batch_task_id: &str,
        task_id: i64,
        state: ExecState,
        attempts: u32,
        duration_ms: i64,
    ) {
        if state.is_success() {
            info!(
                event = "task_finished",
                batch_task.id = batch_task_id,
                task.id = task_id,
                state = %state,
                attempts = attempts,
                duration_ms = duration_ms,
                "任务执行结束"
            );
        } else {
            warn!(
                event = "task_finished",
                batch_task.id = batch_task_id,
                task.id = task_id,
                state = %state,
                attempts = attempts,
                duration_ms = duration_ms,
                "任务执行失败"
            );
        }
    }

    pub fn log_job_finished(batch_job_id: &str, job_id: i64, state: ExecState, result: f64) {
        info!(
            event = "job_finished",
            batch_job.id = batch_job_id,
            job.id = job_id,
            state = %state,
            result = result,
            "作业执行结束"
        );
    }

    pub fn log_batch_finished(
        batch_id: &str,
        state: ExecState,
        result: f64,
        succeeded: usize,
        failed: usize,
    ) {
        info!(
            event = "batch_finished",
            batch.id = batch_id,
            state = %state,
            result = result,
            succeeded = succeeded,
            failed = failed,
            "批次执行结束"
        );
    }

    pub fn log_restore(batch_id: &str, schedule_id: i64, skipped: usize, remaining: usize) {
        info!(
            event = "batch_restore",
            batch.id = batch_id,
            schedule.id = schedule_id,
            skipped = skipped,
            remaining = remaining,
            "恢复批次执行"
        );
    }
}

/// 调度引擎指标
pub struct MetricsCollector {
    task_executions_total: Counter,
    task_failures_total: Counter,
    task_retries_total: Counter,
    task_execution_duration: Histogram,
    batches_started_total: Counter,
    batch_duration: Histogram,
    dispatches_in_flight: Gauge,
    in_flight: AtomicI64,
    enabled: bool,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            task_executions_total: counter!("batch_task_executions_total"),
            task_failures_total: counter!("batch_task_failures_total"),
            task_retries_total: counter!("batch_task_retries_total"),
            task_execution_duration: histogram!("batch_task_execution_duration_seconds"),
            batches_started_total: counter!("batch_batches_started_total"),
            batch_duration: histogram!("batch_batch_duration_seconds"),
            dispatches_in_flight: gauge!("batch_dispatches_in_flight"),
            in_flight: AtomicI64::new(0),
            enabled: true,
        }
    }

    /// 关闭指标采集时使用，所有记录都是空操作
    pub fn disabled() -> Self {
        Self {
            task_executions_total: Counter::noop(),
            task_failures_total: Counter::noop(),
            task_retries_total: Counter::noop(),
            task_execution_duration: Histogram::noop(),
            batches_started_total: Counter::noop(),
            batch_duration: Histogram::noop(),
            dispatches_in_flight: Gauge::noop(),
            in_flight: AtomicI64::new(0),
            enabled: false,
        }
    }

    pub fn record_task_execution(&self, state: ExecState, duration_seconds: f64) {
        self.task_executions_total.increment(1);
        self.task_execution_duration.record(duration_seconds);
        if !state.is_success() {
            self.task_failures_total.increment(1);
        }
    }

    pub fn record_task_retry(&self) {
        self.task_retries_total.increment(1);
    }

    pub fn record_batch_started(&self) {
        self.batches_started_total.increment(1);
    }

    pub fn record_batch_finished(&self, duration_seconds: f64) {
        self.batch_duration.record(duration_seconds);
    }

    /// 记录一次Worker调用开始，返回的守卫在释放时（包括panic展开）计数减一
    pub fn dispatch_started(&self) -> DispatchGuard<'_> {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        self.dispatches_in_flight.increment(1.0);
        DispatchGuard { metrics: self }
    }

    fn dispatch_finished(&self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
        self.dispatches_in_flight.decrement(1.0);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// 当前正在调用Worker的任务数
    pub fn dispatches_in_flight(&self) -> i64 {
        self.in_flight.load(Ordering::Relaxed)
    }
}

pub struct DispatchGuard<'a> {
    metrics: &'a MetricsCollector,
}

impl Drop for DispatchGuard<'_> {
    fn drop(&mut self) {
        self.metrics.dispatch_finished();
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_collector_still_tracks_in_flight() {
        let metrics = MetricsCollector::disabled();
        assert!(!metrics.is_enabled());
        metrics.record_task_execution(ExecState::Aborted, 1.5);
        metrics.record_batch_started();

        let first = metrics.dispatch_started();
        let second = metrics.dispatch_started();
        assert_eq!(metrics.dispatches_in_flight(), 2);
        drop(first);
        assert_eq!(metrics.dispatches_in_flight(), 1);
        drop(second);
        assert_eq!(metrics.dispatches_in_flight(), 0);
    }

    #[test]
    fn test_guard_releases_on_panic() {
        let metrics = MetricsCollector::new();
        assert!(metrics.is_enabled());
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = metrics.dispatch_started();
            panic!("worker call blew up");
        }));
        assert!(result.is_err());
        assert_eq!(metrics.dispatches_in_flight(), 0);
    }
}

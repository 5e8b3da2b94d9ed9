use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::Utc;
use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use batch_core::models::{ExecState, Reply, TaskPayload};

use crate::batch::ExecTask;
use crate::context::DispatcherContext;
use crate::observability::StructuredLogger;

/// 单个任务的Worker调用
///
/// 最多尝试 `max(retry, 1)` 次，连接失败、传输错误以及带错误信息的回复
/// 都会在固定退避后重试，最后一次失败后不再等待。
#[derive(Clone)]
pub struct WorkerDispatcher {
    ctx: Arc<DispatcherContext>,
}

impl WorkerDispatcher {
    pub fn new(ctx: Arc<DispatcherContext>) -> Self {
        Self { ctx }
    }

    /// 作为独立的执行单元运行任务，结束后（包括panic）把任务送回完成通道
    pub fn spawn(
        &self,
        task: ExecTask,
        completions: mpsc::UnboundedSender<ExecTask>,
    ) -> JoinHandle<()> {
        let dispatcher = self.clone();
        tokio::spawn(async move {
            let fallback = task.clone();
            let finished = match AssertUnwindSafe(dispatcher.execute(task))
                .catch_unwind()
                .await
            {
                Ok(task) => task,
                Err(panic) => {
                    let mut task = fallback;
                    task.state = ExecState::Aborted;
                    task.end_time = Some(Utc::now());
                    task.error = format!("任务执行单元异常退出: {}", panic_message(&panic));
                    error!(
                        "任务 {} ({}) 执行单元panic: {}",
                        task.task.name, task.batch_task_id, task.error
                    );
                    dispatcher.persist(&mut task).await;
                    task
                }
            };

            if completions.send(finished).is_err() {
                warn!("批次循环已退出，丢弃任务完成通知");
            }
        })
    }

    pub async fn execute(&self, mut task: ExecTask) -> ExecTask {
        if task.state == ExecState::Blocked {
            task.end_time = Some(Utc::now());
            info!(
                "任务 {} ({}) 处于阻塞状态，不调用Worker",
                task.task.name, task.batch_task_id
            );
            self.persist(&mut task).await;
            return task;
        }

        let _permit = match self.ctx.permits.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(e) => {
                task.state = ExecState::Aborted;
                task.end_time = Some(Utc::now());
                task.error = format!("获取调度许可失败: {e}");
                self.persist(&mut task).await;
                return task;
            }
        };

        let address = self.ctx.worker_address(&task.task.address);
        let payload = TaskPayload::from(&task.task);
        let attempts = task.task.attempts();
        let backoff = self.ctx.config.retry_backoff();

        task.start_time = Some(Utc::now());
        task.state = ExecState::Running;
        self.persist(&mut task).await;
        StructuredLogger::log_task_dispatched(
            &task.batch_task_id,
            task.task.id,
            &task.task.name,
            &address,
        );
        let in_flight = self.ctx.metrics.dispatch_started();

        let mut last_reply: Option<Reply> = None;
        let mut last_error: Option<String> = None;
        for attempt in 1..=attempts {
            task.attempts = attempt;
            match self.ctx.worker.execute(&address, &payload).await {
                Ok(reply) if reply.is_success() => {
                    debug!("任务 {} 第 {} 次尝试成功", task.batch_task_id, attempt);
                    last_error = None;
                    last_reply = Some(reply);
                    break;
                }
                Ok(reply) => {
                    warn!(
                        "任务 {} 第 {}/{} 次执行返回错误: {}",
                        task.batch_task_id, attempt, attempts, reply.error
                    );
                    last_error = Some(reply.error.clone());
                    last_reply = Some(reply);
                }
                Err(e) => {
                    warn!(
                        "任务 {} 第 {}/{} 次调用Worker {} 失败: {}",
                        task.batch_task_id, attempt, attempts, address, e
                    );
                    last_error = Some(e.to_string());
                }
            }

            if attempt < attempts {
                self.ctx.metrics.record_task_retry();
                tokio::time::sleep(backoff).await;
            }
        }
        drop(in_flight);

        if let Some(reply) = last_reply {
            task.stdout = reply.stdout;
            task.stderr = reply.stderr;
        }
        task.state = match last_error {
            None => ExecState::Done,
            Some(error) => {
                task.error = error;
                ExecState::Aborted
            }
        };
        task.end_time = Some(Utc::now());
        self.persist(&mut task).await;

        let duration = match (task.start_time, task.end_time) {
            (Some(start), Some(end)) => (end - start).num_milliseconds(),
            _ => 0,
        };
        StructuredLogger::log_task_finished(
            &task.batch_task_id,
            task.task.id,
            task.state,
            task.attempts,
            duration,
        );
        self.ctx
            .metrics
            .record_task_execution(task.state, duration as f64 / 1000.0);

        task
    }

    async fn persist(&self, task: &mut ExecTask) {
        match self.ctx.logs.upsert_task_run(&task.to_log()).await {
            Ok(id) => task.log_id = Some(id),
            Err(e) => warn!("写入任务运行日志 {} 失败: {}", task.batch_task_id, e),
        }
    }
}

fn panic_message(panic: &Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

//! 调度目录与管理操作
//!
//! 管理操作先写元数据库，再以控制信号通知对应调度的触发循环；
//! 涉及作业链或调度本身的变更通过停止并重启循环完成。

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

use batch_core::{
    models::{Job, Schedule, Task, TaskType},
    SchedulerError, SchedulerResult,
};

use crate::context::DispatcherContext;
use crate::dependency_checker::DependencyChecker;
use crate::restore::RestoreOutcome;
use crate::schedule_loop::{BatchInfo, ScheduleSignal, ScheduleTimer, TimerParts};

struct RunningSchedule {
    signals: mpsc::UnboundedSender<ScheduleSignal>,
    join: JoinHandle<TimerParts>,
}

pub struct ScheduleManager {
    ctx: Arc<DispatcherContext>,
    schedules: Mutex<HashMap<i64, RunningSchedule>>,
    dependency_checker: DependencyChecker,
}

impl ScheduleManager {
    pub fn new(ctx: Arc<DispatcherContext>) -> Self {
        let dependency_checker = DependencyChecker::new(ctx.metadata.clone());
        Self {
            ctx,
            schedules: Mutex::new(HashMap::new()),
            dependency_checker,
        }
    }

    pub fn context(&self) -> &Arc<DispatcherContext> {
        &self.ctx
    }

    /// 从元数据库加载全部调度并启动各自的触发循环
    #[instrument(skip(self))]
    pub async fn start(&self) -> SchedulerResult<usize> {
        let schedules = self.ctx.metadata.list_schedules().await?;
        let mut running = self.schedules.lock().await;
        for summary in schedules {
            if running.contains_key(&summary.id) {
                continue;
            }
            match self.ctx.metadata.load_schedule(summary.id).await? {
                Some(schedule) => {
                    let timer = ScheduleTimer::new(schedule, self.ctx.clone());
                    running.insert(summary.id, spawn_timer(timer));
                }
                None => warn!("调度 {} 加载时已不存在", summary.id),
            }
        }
        info!("已启动 {} 个调度", running.len());
        Ok(running.len())
    }

    /// 停止所有触发循环，在途批次继续执行至结束
    pub async fn shutdown(&self) {
        let mut running = self.schedules.lock().await;
        for (id, schedule) in running.drain() {
            let _ = schedule.signals.send(ScheduleSignal::Stop);
            if let Err(e) = schedule.join.await {
                error!("调度 {} 触发循环异常退出: {}", id, e);
            }
        }
        info!("所有调度触发循环已停止");
    }

    #[instrument(skip(self, schedule), fields(schedule.name = %schedule.name))]
    pub async fn create_schedule(&self, schedule: Schedule) -> SchedulerResult<Schedule> {
        self.validate_schedule(&schedule)?;
        let created = self.ctx.metadata.create_schedule(&schedule).await?;
        let loaded = self
            .ctx
            .metadata
            .load_schedule(created.id)
            .await?
            .ok_or(SchedulerError::ScheduleNotFound { id: created.id })?;

        let timer = ScheduleTimer::new(loaded, self.ctx.clone());
        self.schedules
            .lock()
            .await
            .insert(created.id, spawn_timer(timer));
        info!("调度 {} 已创建", created.id);
        Ok(created)
    }

    pub async fn update_schedule(&self, schedule: &Schedule) -> SchedulerResult<()> {
        self.validate_schedule(schedule)?;
        let mut existing = self
            .ctx
            .metadata
            .get_schedule(schedule.id)
            .await?
            .ok_or(SchedulerError::ScheduleNotFound { id: schedule.id })?;

        existing.name = schedule.name.clone();
        existing.cycle = schedule.cycle.clone();
        existing.timeout_seconds = schedule.timeout_seconds;
        existing.description = schedule.description.clone();
        existing.updated_at = Utc::now();
        self.ctx.metadata.update_schedule(&existing).await?;

        self.refresh(schedule.id).await
    }

    /// 停止循环后依次删除任务（含依赖边）、作业和调度本身
    pub async fn delete_schedule(&self, id: i64) -> SchedulerResult<()> {
        let schedule = self
            .ctx
            .metadata
            .load_schedule(id)
            .await?
            .ok_or(SchedulerError::ScheduleNotFound { id })?;

        if let Some(running) = self.schedules.lock().await.remove(&id) {
            let _ = running.signals.send(ScheduleSignal::Stop);
            if let Err(e) = running.join.await {
                error!("调度 {} 触发循环异常退出: {}", id, e);
            }
        }

        for task in &schedule.tasks {
            self.ctx.metadata.delete_task(task.id).await?;
        }
        for job in schedule.jobs.iter().rev() {
            self.ctx.metadata.delete_job(job.id).await?;
        }
        self.ctx.metadata.delete_schedule(id).await?;
        info!("调度 {} 已删除", id);
        Ok(())
    }

    /// 通过触发循环取得调度的当前快照
    pub async fn get_schedule(&self, id: i64) -> SchedulerResult<Schedule> {
        let (reply, rx) = oneshot::channel();
        self.send(id, ScheduleSignal::Snapshot { reply }).await?;
        rx.await
            .map_err(|_| SchedulerError::ChannelClosed(format!("调度 {id} 触发循环")))
    }

    pub async fn list_schedules(&self) -> SchedulerResult<Vec<Schedule>> {
        let mut ids: Vec<i64> = self.schedules.lock().await.keys().copied().collect();
        ids.sort_unstable();

        let mut schedules = Vec::with_capacity(ids.len());
        for id in ids {
            match self.get_schedule(id).await {
                Ok(schedule) => schedules.push(schedule),
                Err(SchedulerError::ScheduleNotFound { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(schedules)
    }

    /// 在作业链末端追加作业
    pub async fn add_job(&self, mut job: Job) -> SchedulerResult<Job> {
        if job.name.trim().is_empty() {
            return Err(SchedulerError::InvalidDefinition("作业名称不能为空".to_string()));
        }
        let schedule = self
            .ctx
            .metadata
            .load_schedule(job.schedule_id)
            .await?
            .ok_or(SchedulerError::ScheduleNotFound {
                id: job.schedule_id,
            })?;

        let tail = schedule.tail_job().cloned();
        job.prev_job_id = tail.as_ref().map(|t| t.id);
        job.next_job_id = None;
        job.task_ids.clear();
        let created = self.ctx.metadata.create_job(&job).await?;

        if let Some(mut tail) = tail {
            tail.next_job_id = Some(created.id);
            tail.updated_at = Utc::now();
            self.ctx.metadata.update_job(&tail).await?;
        }

        self.refresh(job.schedule_id).await?;
        Ok(created)
    }

    pub async fn update_job(&self, job: &Job) -> SchedulerResult<()> {
        let mut existing = self
            .ctx
            .metadata
            .get_job(job.id)
            .await?
            .ok_or(SchedulerError::JobNotFound { id: job.id })?;

        existing.name = job.name.clone();
        existing.description = job.description.clone();
        existing.exec_type = job.exec_type;
        existing.disabled = job.disabled;
        existing.updated_at = Utc::now();
        self.ctx.metadata.update_job(&existing).await?;

        self.refresh(existing.schedule_id).await
    }

    /// 只有作业链末端且没有任务的作业可以删除
    pub async fn delete_job(&self, id: i64) -> SchedulerResult<()> {
        let job = self
            .ctx
            .metadata
            .get_job(id)
            .await?
            .ok_or(SchedulerError::JobNotFound { id })?;

        if !job.task_ids.is_empty() {
            return Err(SchedulerError::JobNotDeletable {
                id,
                reason: format!("作业下仍有 {} 个任务", job.task_ids.len()),
            });
        }
        if !job.is_tail() {
            return Err(SchedulerError::JobNotDeletable {
                id,
                reason: "只能删除作业链末端的作业".to_string(),
            });
        }

        if let Some(prev_id) = job.prev_job_id {
            if let Some(mut prev) = self.ctx.metadata.get_job(prev_id).await? {
                prev.next_job_id = None;
                prev.updated_at = Utc::now();
                self.ctx.metadata.update_job(&prev).await?;
            }
        }
        self.ctx.metadata.delete_job(id).await?;

        self.refresh(job.schedule_id).await
    }

    /// 创建任务及其依赖边
    pub async fn add_task(&self, task: Task) -> SchedulerResult<Task> {
        let job = self
            .ctx
            .metadata
            .get_job(task.job_id)
            .await?
            .ok_or(SchedulerError::JobNotFound { id: task.job_id })?;
        self.validate_task(&task)?;
        for &dependency_id in &task.dependencies {
            if self.ctx.metadata.get_task(dependency_id).await?.is_none() {
                return Err(SchedulerError::DependencyNotFound {
                    task_id: task.id,
                    dependency_id,
                });
            }
        }

        let mut created = self.ctx.metadata.create_task(&task).await?;
        let mut dependencies = task.dependencies.clone();
        dependencies.sort_unstable();
        dependencies.dedup();
        for &dependency_id in &dependencies {
            self.ctx
                .metadata
                .add_task_dependency(created.id, dependency_id)
                .await?;
        }
        created.dependencies = dependencies;

        self.notify(job.schedule_id, ScheduleSignal::TaskChanged { task_id: created.id })
            .await?;
        info!("任务 {} 已添加到作业 {}", created.id, job.id);
        Ok(created)
    }

    pub async fn update_task(&self, task: &Task) -> SchedulerResult<()> {
        let existing = self
            .ctx
            .metadata
            .get_task(task.id)
            .await?
            .ok_or(SchedulerError::TaskNotFound { id: task.id })?;
        let job = self
            .ctx
            .metadata
            .get_job(task.job_id)
            .await?
            .ok_or(SchedulerError::JobNotFound { id: task.job_id })?;
        self.validate_task(task)?;

        let mut updated = task.clone();
        updated.dependencies = existing.dependencies.clone();
        updated.updated_at = Utc::now();
        self.ctx.metadata.update_task(&updated).await?;

        if existing.job_id != task.job_id {
            if let Some(old_job) = self.ctx.metadata.get_job(existing.job_id).await? {
                if old_job.schedule_id != job.schedule_id {
                    self.notify(old_job.schedule_id, ScheduleSignal::TaskChanged { task_id: task.id })
                        .await?;
                }
            }
        }
        self.notify(job.schedule_id, ScheduleSignal::TaskChanged { task_id: task.id })
            .await
    }

    pub async fn delete_task(&self, id: i64) -> SchedulerResult<()> {
        let schedule_id = self.schedule_of_task(id).await?;
        self.ctx.metadata.delete_task(id).await?;
        self.notify(schedule_id, ScheduleSignal::TaskChanged { task_id: id })
            .await
    }

    pub async fn add_task_dependency(&self, task_id: i64, dependency_id: i64) -> SchedulerResult<()> {
        self.dependency_checker
            .validate_dependency(task_id, dependency_id)
            .await?;

        let existing = self.ctx.metadata.list_task_dependencies(task_id).await?;
        if !existing.contains(&dependency_id) {
            self.ctx
                .metadata
                .add_task_dependency(task_id, dependency_id)
                .await?;
        }

        let schedule_id = self.schedule_of_task(task_id).await?;
        self.notify(schedule_id, ScheduleSignal::TaskChanged { task_id })
            .await
    }

    pub async fn remove_task_dependency(
        &self,
        task_id: i64,
        dependency_id: i64,
    ) -> SchedulerResult<()> {
        let schedule_id = self.schedule_of_task(task_id).await?;
        self.ctx
            .metadata
            .remove_task_dependency(task_id, dependency_id)
            .await?;
        self.notify(schedule_id, ScheduleSignal::TaskChanged { task_id })
            .await
    }

    /// 立即执行任务
    pub async fn trigger_task(&self, task_id: i64) -> SchedulerResult<()> {
        let schedule_id = self.schedule_of_task(task_id).await?;
        self.send(schedule_id, ScheduleSignal::RunTask { task_id })
            .await
    }

    /// 暂停在途批次，返回被置为阻塞的任务数
    pub async fn pause_batch(&self, schedule_id: i64, batch_id: &str) -> SchedulerResult<usize> {
        let (reply, rx) = oneshot::channel();
        self.send(
            schedule_id,
            ScheduleSignal::PauseBatch {
                batch_id: batch_id.to_string(),
                reply,
            },
        )
        .await?;
        rx.await
            .map_err(|_| SchedulerError::ChannelClosed(format!("批次 {batch_id}")))?
    }

    pub async fn restore_batch(
        &self,
        schedule_id: i64,
        batch_id: &str,
    ) -> SchedulerResult<RestoreOutcome> {
        let (reply, rx) = oneshot::channel();
        self.send(
            schedule_id,
            ScheduleSignal::Restore {
                batch_id: batch_id.to_string(),
                reply,
            },
        )
        .await?;
        rx.await
            .map_err(|_| SchedulerError::ChannelClosed(format!("调度 {schedule_id} 触发循环")))?
    }

    pub async fn live_batches(&self, schedule_id: i64) -> SchedulerResult<Vec<BatchInfo>> {
        let (reply, rx) = oneshot::channel();
        self.send(schedule_id, ScheduleSignal::ListBatches { reply })
            .await?;
        rx.await
            .map_err(|_| SchedulerError::ChannelClosed(format!("调度 {schedule_id} 触发循环")))
    }

    /// 停止触发循环，并以重新加载的定义重启，在途批次登记保留
    async fn refresh(&self, id: i64) -> SchedulerResult<()> {
        let mut running = self.schedules.lock().await;
        let Some(current) = running.remove(&id) else {
            return Err(SchedulerError::ScheduleNotFound { id });
        };
        let _ = current.signals.send(ScheduleSignal::Stop);
        let parts = current
            .join
            .await
            .map_err(|e| SchedulerError::Internal(format!("调度 {id} 触发循环异常退出: {e}")))?;

        let (schedule, result) = match self.ctx.metadata.load_schedule(id).await {
            Ok(Some(schedule)) => (schedule, Ok(())),
            Ok(None) => (parts.schedule.clone(), Err(SchedulerError::ScheduleNotFound { id })),
            Err(e) => {
                warn!("重新加载调度 {} 失败，沿用原定义: {}", id, e);
                (parts.schedule.clone(), Err(e))
            }
        };

        info!(
            "调度 {} 重新加载，在途批次 {} 个",
            id,
            parts.live_batch_count()
        );
        let timer = ScheduleTimer::resume(schedule, self.ctx.clone(), parts);
        running.insert(id, spawn_timer(timer));
        result
    }

    async fn send(&self, schedule_id: i64, signal: ScheduleSignal) -> SchedulerResult<()> {
        let running = self.schedules.lock().await;
        let schedule = running
            .get(&schedule_id)
            .ok_or(SchedulerError::ScheduleNotFound { id: schedule_id })?;
        schedule
            .signals
            .send(signal)
            .map_err(|_| SchedulerError::ChannelClosed(format!("调度 {schedule_id} 触发循环")))
    }

    /// 通知定义变更；调度未在运行时只记录日志
    async fn notify(&self, schedule_id: i64, signal: ScheduleSignal) -> SchedulerResult<()> {
        match self.send(schedule_id, signal).await {
            Err(SchedulerError::ScheduleNotFound { .. }) => {
                warn!("调度 {} 未在运行，变更将在下次加载时生效", schedule_id);
                Ok(())
            }
            other => other,
        }
    }

    async fn schedule_of_task(&self, task_id: i64) -> SchedulerResult<i64> {
        let task = self
            .ctx
            .metadata
            .get_task(task_id)
            .await?
            .ok_or(SchedulerError::TaskNotFound { id: task_id })?;
        let job = self
            .ctx
            .metadata
            .get_job(task.job_id)
            .await?
            .ok_or(SchedulerError::JobNotFound { id: task.job_id })?;
        Ok(job.schedule_id)
    }

    fn validate_schedule(&self, schedule: &Schedule) -> SchedulerResult<()> {
        if schedule.name.trim().is_empty() {
            return Err(SchedulerError::InvalidDefinition("调度名称不能为空".to_string()));
        }
        self.ctx
            .resolver
            .next_activation(&schedule.cycle, "", Utc::now())
            .map(|_| ())
    }

    fn validate_task(&self, task: &Task) -> SchedulerResult<()> {
        if task.name.trim().is_empty() {
            return Err(SchedulerError::InvalidDefinition("任务名称不能为空".to_string()));
        }
        if task.address.trim().is_empty() {
            return Err(SchedulerError::InvalidDefinition(format!(
                "任务 {} 的Worker地址不能为空",
                task.name
            )));
        }
        if task.dependencies.contains(&task.id) && task.id != 0 {
            return Err(SchedulerError::CircularDependency);
        }
        if task.task_type == TaskType::Timed {
            self.ctx
                .resolver
                .next_activation(&task.cycle, &task.cron, Utc::now())?;
        }
        Ok(())
    }
}

fn spawn_timer(timer: ScheduleTimer) -> RunningSchedule {
    let signals = timer.signals();
    let schedule_id = timer.schedule_id();
    let join = tokio::spawn(async move {
        let parts = timer.run().await;
        info!("调度 {} 触发循环结束", schedule_id);
        parts
    });
    RunningSchedule { signals, join }
}

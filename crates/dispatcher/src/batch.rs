//! 批次执行结构与依赖图调度
//!
//! 每次激活生成一个 [`ExecSchedule`]，由唯一的 [`BatchRunner`] 持有并驱动。
//! 依赖邻接集、状态与计数只在批次循环内修改，任务执行单元通过完成通道
//! 把 [`ExecTask`] 交还给循环，暂停和插入任务以 [`BatchCommand`] 送达。

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use batch_core::{
    models::{ExecState, ExecType, Job, JobRunLog, Schedule, ScheduleRunLog, Task, TaskRunLog},
    SchedulerResult,
};

use crate::context::DispatcherContext;
use crate::dispatch::WorkerDispatcher;
use crate::observability::StructuredLogger;

fn ratio(succeeded: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        succeeded as f64 / total as f64
    }
}

/// 任务运行实体
#[derive(Debug, Clone)]
pub struct ExecTask {
    pub batch_task_id: String,
    pub batch_job_id: String,
    pub batch_id: String,
    pub task: Task,
    pub state: ExecState,
    pub exec_type: ExecType,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub stdout: String,
    pub stderr: String,
    pub error: String,
    /// 尚未完成的上游任务
    pub rel_exec_tasks: HashSet<i64>,
    /// 本批次内的下游任务
    pub next_exec_tasks: HashSet<i64>,
    pub log_id: Option<i64>,
    /// 实际调用Worker的次数
    pub attempts: u32,
}

impl ExecTask {
    pub fn new(job: &ExecJob, task: Task, exec_type: ExecType) -> Self {
        Self {
            batch_task_id: format!("{}.{}", job.batch_job_id, task.id),
            batch_job_id: job.batch_job_id.clone(),
            batch_id: job.batch_id.clone(),
            task,
            state: ExecState::Pending,
            exec_type,
            start_time: None,
            end_time: None,
            stdout: String::new(),
            stderr: String::new(),
            error: String::new(),
            rel_exec_tasks: HashSet::new(),
            next_exec_tasks: HashSet::new(),
            log_id: None,
            attempts: 0,
        }
    }

    pub fn task_id(&self) -> i64 {
        self.task.id
    }

    pub fn is_eligible(&self) -> bool {
        self.rel_exec_tasks.is_empty() && self.state.is_dispatchable()
    }

    pub fn to_log(&self) -> TaskRunLog {
        TaskRunLog {
            batch_task_id: self.batch_task_id.clone(),
            batch_job_id: self.batch_job_id.clone(),
            batch_id: self.batch_id.clone(),
            task_id: self.task.id,
            exec_type: self.exec_type,
            state: self.state,
            start_time: self.start_time,
            end_time: self.end_time,
            result: if self.state.is_success() { 1.0 } else { 0.0 },
            stdout: self.stdout.clone(),
            stderr: self.stderr.clone(),
            error: self.error.clone(),
        }
    }
}

/// 作业运行实体
#[derive(Debug, Clone)]
pub struct ExecJob {
    pub batch_job_id: String,
    pub batch_id: String,
    pub job_id: i64,
    pub name: String,
    pub exec_type: ExecType,
    pub state: ExecState,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub result: f64,
    pub total: usize,
    pub remaining: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub log_id: Option<i64>,
}

impl ExecJob {
    pub fn new(batch_id: &str, job: &Job, exec_type: ExecType) -> Self {
        Self {
            batch_job_id: format!("{}.{}", batch_id, job.id),
            batch_id: batch_id.to_string(),
            job_id: job.id,
            name: job.name.clone(),
            exec_type,
            state: ExecState::Pending,
            start_time: None,
            end_time: None,
            result: 0.0,
            total: 0,
            remaining: 0,
            succeeded: 0,
            failed: 0,
            log_id: None,
        }
    }

    /// 第一个任务开始时记录作业开始，返回是否是首次
    fn start(&mut self) -> bool {
        if self.start_time.is_some() {
            return false;
        }
        self.start_time = Some(Utc::now());
        self.state = ExecState::Running;
        true
    }

    fn finish(&mut self) {
        self.end_time = Some(Utc::now());
        self.result = ratio(self.succeeded, self.total);
        self.state = if self.failed == 0 {
            ExecState::Done
        } else {
            ExecState::Aborted
        };
    }

    pub fn to_log(&self) -> JobRunLog {
        JobRunLog {
            batch_job_id: self.batch_job_id.clone(),
            batch_id: self.batch_id.clone(),
            job_id: self.job_id,
            exec_type: self.exec_type,
            state: self.state,
            start_time: self.start_time,
            end_time: self.end_time,
            result: self.result,
        }
    }
}

/// 一次完成处理对作业和批次的影响
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub job_finished: Option<i64>,
    pub batch_finished: bool,
}

/// 调度运行实体（批次）
#[derive(Debug, Clone)]
pub struct ExecSchedule {
    pub batch_id: String,
    pub schedule_id: i64,
    pub schedule_name: String,
    pub activation: DateTime<Utc>,
    pub exec_type: ExecType,
    pub state: ExecState,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub result: f64,
    pub jobs: HashMap<i64, ExecJob>,
    /// 尚未派发的任务
    pub pending: HashMap<i64, ExecTask>,
    pub in_flight: HashSet<i64>,
    /// 已结束任务的最终状态
    pub finished: HashMap<i64, ExecState>,
    pub members: HashSet<i64>,
    pub total: usize,
    pub remaining: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub log_id: Option<i64>,
}

impl ExecSchedule {
    pub fn batch_id_for(schedule_id: i64, activation: DateTime<Utc>) -> String {
        format!("{}.{}", schedule_id, activation.timestamp_millis())
    }

    /// 解析批次ID，返回调度ID和激活时间
    pub fn parse_batch_id(batch_id: &str) -> Option<(i64, DateTime<Utc>)> {
        let (schedule_id, millis) = batch_id.split_once('.')?;
        let schedule_id = schedule_id.parse().ok()?;
        let activation = DateTime::from_timestamp_millis(millis.parse().ok()?)?;
        Some((schedule_id, activation))
    }

    /// 为激活时间构建批次，选中下次运行时间等于激活时间的启用任务
    pub fn build(schedule: &Schedule, activation: DateTime<Utc>, exec_type: ExecType) -> Self {
        let batch_id = Self::batch_id_for(schedule.id, activation);
        Self::build_with(schedule, batch_id, activation, exec_type, |task| {
            !task.disabled && task.next_run_at == Some(activation)
        })
    }

    pub fn build_with<F>(
        schedule: &Schedule,
        batch_id: String,
        activation: DateTime<Utc>,
        exec_type: ExecType,
        select: F,
    ) -> Self
    where
        F: Fn(&Task) -> bool,
    {
        let jobs = schedule
            .jobs
            .iter()
            .map(|job| (job.id, ExecJob::new(&batch_id, job, exec_type)))
            .collect();

        let mut exec = Self {
            batch_id,
            schedule_id: schedule.id,
            schedule_name: schedule.name.clone(),
            activation,
            exec_type,
            state: ExecState::Pending,
            start_time: None,
            end_time: None,
            result: 0.0,
            jobs,
            pending: HashMap::new(),
            in_flight: HashSet::new(),
            finished: HashMap::new(),
            members: HashSet::new(),
            total: 0,
            remaining: 0,
            succeeded: 0,
            failed: 0,
            log_id: None,
        };

        let selected = schedule.tasks.iter().filter(|t| select(t)).cloned().collect();
        exec.insert_tasks(selected);
        exec
    }

    /// 注册任务并按静态依赖在本批次内建立邻接关系，返回新加入的任务数
    pub fn insert_tasks(&mut self, tasks: Vec<Task>) -> usize {
        let mut added = Vec::new();
        for task in tasks {
            let id = task.id;
            if self.members.contains(&id) {
                continue;
            }
            let Some(job) = self.jobs.get_mut(&task.job_id) else {
                warn!(
                    "批次 {} 中不存在任务 {} 所属的作业 {}",
                    self.batch_id, id, task.job_id
                );
                continue;
            };
            job.total += 1;
            job.remaining += 1;
            let exec_task = ExecTask::new(job, task, self.exec_type);

            self.members.insert(id);
            self.pending.insert(id, exec_task);
            self.total += 1;
            self.remaining += 1;
            added.push(id);
        }

        for id in &added {
            self.link(*id);
        }
        added.len()
    }

    fn link(&mut self, task_id: i64) {
        let dependencies = match self.pending.get(&task_id) {
            Some(t) => t.task.dependencies.clone(),
            None => return,
        };

        for dependency in dependencies {
            if dependency == task_id {
                continue;
            }
            // 上游已在本批次中失败结束，插入的任务直接阻塞
            if let Some(state) = self.finished.get(&dependency) {
                if !state.is_success() {
                    if let Some(task) = self.pending.get_mut(&task_id) {
                        debug!("上游任务 {} 已失败，插入的任务 {} 置为阻塞", dependency, task_id);
                        task.state = ExecState::Blocked;
                    }
                }
                continue;
            }
            let registered =
                self.pending.contains_key(&dependency) || self.in_flight.contains(&dependency);
            if !registered {
                continue;
            }
            if let Some(task) = self.pending.get_mut(&task_id) {
                task.rel_exec_tasks.insert(dependency);
            }
            if let Some(upstream) = self.pending.get_mut(&dependency) {
                upstream.next_exec_tasks.insert(task_id);
            }
        }
    }

    /// 取出所有可执行任务，返回任务以及首次开始的作业ID
    pub fn take_eligible(&mut self) -> (Vec<ExecTask>, Vec<i64>) {
        let mut ids: Vec<(i16, i64)> = self
            .pending
            .values()
            .filter(|t| t.is_eligible())
            .map(|t| (t.task.priority, t.task.id))
            .collect();
        ids.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

        let mut tasks = Vec::with_capacity(ids.len());
        let mut started_jobs = Vec::new();
        for (_, id) in ids {
            let Some(task) = self.pending.remove(&id) else {
                continue;
            };
            if let Some(job) = self.jobs.get_mut(&task.task.job_id) {
                if job.start() {
                    started_jobs.push(job.job_id);
                }
            }
            self.in_flight.insert(id);
            tasks.push(task);
        }
        (tasks, started_jobs)
    }

    /// 处理一个已结束的任务：更新邻接集、传播失败、累计计数
    pub fn complete(&mut self, task: &ExecTask) -> Completion {
        let id = task.task_id();
        self.in_flight.remove(&id);
        let failed = !task.state.is_success();

        for other in self.pending.values_mut() {
            if failed && other.rel_exec_tasks.contains(&id) && other.state != ExecState::Blocked {
                debug!(
                    "上游任务 {} 未成功，任务 {} 置为阻塞",
                    id,
                    other.task_id()
                );
                other.state = ExecState::Blocked;
            }
            other.rel_exec_tasks.remove(&id);
            other.next_exec_tasks.remove(&id);
        }

        self.finished.insert(id, task.state);
        if failed {
            self.failed += 1;
        } else {
            self.succeeded += 1;
        }

        let mut job_finished = None;
        if let Some(job) = self.jobs.get_mut(&task.task.job_id) {
            job.remaining = job.remaining.saturating_sub(1);
            if failed {
                job.failed += 1;
            } else {
                job.succeeded += 1;
            }
            if job.remaining == 0 {
                job.finish();
                job_finished = Some(job.job_id);
            }
        }

        self.remaining = self.remaining.saturating_sub(1);
        self.result = ratio(self.succeeded, self.total);
        if self.remaining == 0 {
            self.finish();
        }

        Completion {
            job_finished,
            batch_finished: self.remaining == 0,
        }
    }

    /// 暂停：所有未派发任务置为阻塞，已派发的不受影响
    pub fn pause(&mut self) -> usize {
        for task in self.pending.values_mut() {
            task.state = ExecState::Blocked;
        }
        self.pending.len()
    }

    /// 恢复时移除已成功的任务，并从下游的依赖集合中删除它们
    pub fn skip_succeeded(&mut self, task_ids: &[i64]) -> usize {
        let mut skipped = 0;
        for id in task_ids {
            let Some(task) = self.pending.remove(id) else {
                continue;
            };
            for next in &task.next_exec_tasks {
                if let Some(downstream) = self.pending.get_mut(next) {
                    downstream.rel_exec_tasks.remove(id);
                }
            }
            if let Some(job) = self.jobs.get_mut(&task.task.job_id) {
                job.remaining = job.remaining.saturating_sub(1);
                job.succeeded += 1;
            }
            self.finished.insert(*id, ExecState::Done);
            self.succeeded += 1;
            self.remaining = self.remaining.saturating_sub(1);
            skipped += 1;
        }
        self.result = ratio(self.succeeded, self.total);
        skipped
    }

    /// 剩余任务及其作业标记为修复执行
    pub fn mark_repair(&mut self) {
        self.exec_type = ExecType::Repair;
        for task in self.pending.values_mut() {
            task.exec_type = ExecType::Repair;
            task.state = ExecState::Pending;
            if let Some(job) = self.jobs.get_mut(&task.task.job_id) {
                job.exec_type = ExecType::Repair;
                job.state = ExecState::Running;
            }
        }
    }

    /// 没有在途任务也没有可执行任务时，剩余任务无法收敛，全部置为阻塞
    pub fn break_stall(&mut self) -> usize {
        if !self.in_flight.is_empty() || self.pending.values().any(|t| t.is_eligible()) {
            return 0;
        }
        for task in self.pending.values_mut() {
            task.rel_exec_tasks.clear();
            task.state = ExecState::Blocked;
        }
        self.pending.len()
    }

    fn start(&mut self) {
        self.start_time = Some(Utc::now());
        self.state = ExecState::Running;
    }

    fn finish(&mut self) {
        self.end_time = Some(Utc::now());
        self.result = ratio(self.succeeded, self.total);
        self.state = if self.failed == 0 {
            ExecState::Done
        } else {
            ExecState::Aborted
        };
    }

    pub fn to_log(&self) -> ScheduleRunLog {
        ScheduleRunLog {
            batch_id: self.batch_id.clone(),
            schedule_id: self.schedule_id,
            exec_type: self.exec_type,
            state: self.state,
            start_time: self.start_time,
            end_time: self.end_time,
            result: self.result,
            task_total: self.total as i64,
            task_succeeded: self.succeeded as i64,
            task_failed: self.failed as i64,
        }
    }
}

/// 批次结束后的汇总
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub batch_id: String,
    pub schedule_id: i64,
    pub exec_type: ExecType,
    pub state: ExecState,
    pub result: f64,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub task_states: HashMap<i64, ExecState>,
}

/// 发送给批次循环的控制命令
#[derive(Debug)]
pub enum BatchCommand {
    Pause {
        reply: Option<oneshot::Sender<SchedulerResult<usize>>>,
    },
    Insert {
        tasks: Vec<Task>,
    },
}

/// 批次控制循环
pub struct BatchRunner {
    exec: ExecSchedule,
    ctx: Arc<DispatcherContext>,
    dispatcher: WorkerDispatcher,
    commands: mpsc::UnboundedReceiver<BatchCommand>,
    completions_tx: mpsc::UnboundedSender<ExecTask>,
    completions_rx: mpsc::UnboundedReceiver<ExecTask>,
}

impl BatchRunner {
    pub fn new(
        exec: ExecSchedule,
        ctx: Arc<DispatcherContext>,
    ) -> (Self, mpsc::UnboundedSender<BatchCommand>) {
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        let dispatcher = WorkerDispatcher::new(ctx.clone());
        (
            Self {
                exec,
                ctx,
                dispatcher,
                commands,
                completions_tx,
                completions_rx,
            },
            commands_tx,
        )
    }

    pub async fn run(mut self) -> BatchReport {
        let started = std::time::Instant::now();
        self.start().await;

        if self.exec.remaining > 0 {
            self.dispatch_eligible().await;
        }

        while self.exec.remaining > 0 {
            tokio::select! {
                Some(done) = self.completions_rx.recv() => self.on_completion(done).await,
                Some(command) = self.commands.recv() => self.on_command(command),
                else => break,
            }
            if self.exec.remaining > 0 {
                self.dispatch_eligible().await;
            }
        }

        if self.exec.end_time.is_none() {
            self.exec.finish();
        }
        self.persist_schedule().await;
        StructuredLogger::log_batch_finished(
            &self.exec.batch_id,
            self.exec.state,
            self.exec.result,
            self.exec.succeeded,
            self.exec.failed,
        );
        self.ctx
            .metrics
            .record_batch_finished(started.elapsed().as_secs_f64());

        BatchReport {
            batch_id: self.exec.batch_id.clone(),
            schedule_id: self.exec.schedule_id,
            exec_type: self.exec.exec_type,
            state: self.exec.state,
            result: self.exec.result,
            total: self.exec.total,
            succeeded: self.exec.succeeded,
            failed: self.exec.failed,
            task_states: self.exec.finished.clone(),
        }
    }

    async fn start(&mut self) {
        self.exec.start();
        StructuredLogger::log_batch_started(
            &self.exec.batch_id,
            self.exec.schedule_id,
            self.exec.exec_type,
            self.exec.total,
        );
        self.ctx.metrics.record_batch_started();
        self.persist_schedule().await;

        let job_ids: Vec<i64> = self
            .exec
            .jobs
            .values()
            .filter(|j| j.remaining > 0)
            .map(|j| j.job_id)
            .collect();
        for job_id in job_ids {
            self.persist_job(job_id).await;
        }

        let logs: Vec<TaskRunLog> = self.exec.pending.values().map(|t| t.to_log()).collect();
        for log in logs {
            match self.ctx.logs.upsert_task_run(&log).await {
                Ok(id) => {
                    if let Some(task) = self.exec.pending.get_mut(&log.task_id) {
                        task.log_id = Some(id);
                    }
                }
                Err(e) => warn!("写入任务日志 {} 失败: {}", log.batch_task_id, e),
            }
        }
    }

    async fn dispatch_eligible(&mut self) {
        let (mut tasks, mut started_jobs) = self.exec.take_eligible();
        if tasks.is_empty() {
            let stalled = self.exec.break_stall();
            if stalled > 0 {
                warn!(
                    "批次 {} 中 {} 个任务的依赖无法满足，全部置为阻塞",
                    self.exec.batch_id, stalled
                );
                (tasks, started_jobs) = self.exec.take_eligible();
            }
        }

        for job_id in started_jobs {
            self.persist_job(job_id).await;
        }

        for task in tasks {
            debug!("派发任务 {} ({})", task.task.name, task.batch_task_id);
            self.dispatcher.spawn(task, self.completions_tx.clone());
        }
    }

    async fn on_completion(&mut self, task: ExecTask) {
        let completion = self.exec.complete(&task);
        debug!(
            "任务 {} 结束，状态 {}，批次剩余 {}",
            task.batch_task_id, task.state, self.exec.remaining
        );

        if let Some(job_id) = completion.job_finished {
            if let Some(job) = self.exec.jobs.get(&job_id) {
                StructuredLogger::log_job_finished(
                    &job.batch_job_id,
                    job.job_id,
                    job.state,
                    job.result,
                );
            }
            self.persist_job(job_id).await;
        }
    }

    fn on_command(&mut self, command: BatchCommand) {
        match command {
            BatchCommand::Pause { reply } => {
                let paused = self.exec.pause();
                info!("批次 {} 已暂停，{} 个未派发任务置为阻塞", self.exec.batch_id, paused);
                if let Some(reply) = reply {
                    let _ = reply.send(Ok(paused));
                }
            }
            BatchCommand::Insert { tasks } => {
                let added = self.exec.insert_tasks(tasks);
                info!("批次 {} 插入 {} 个任务", self.exec.batch_id, added);
            }
        }
    }

    async fn persist_schedule(&mut self) {
        match self.ctx.logs.upsert_schedule_run(&self.exec.to_log()).await {
            Ok(id) => self.exec.log_id = Some(id),
            Err(e) => warn!("写入调度运行日志 {} 失败: {}", self.exec.batch_id, e),
        }
    }

    async fn persist_job(&mut self, job_id: i64) {
        let Some(log) = self.exec.jobs.get(&job_id).map(|j| j.to_log()) else {
            return;
        };
        match self.ctx.logs.upsert_job_run(&log).await {
            Ok(id) => {
                if let Some(job) = self.exec.jobs.get_mut(&job_id) {
                    job.log_id = Some(id);
                }
            }
            Err(e) => warn!("写入作业运行日志 {} 失败: {}", log.batch_job_id, e),
        }
    }
}

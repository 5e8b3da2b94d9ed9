//! 调度触发循环
//!
//! 每个调度一个循环，独占调度的任务列表和在途批次登记表。
//! 外部的修改请求都以 [`ScheduleSignal`] 送入循环，由循环串行处理。

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use batch_core::{
    models::{ExecType, Schedule, Task, TaskType},
    SchedulerError, SchedulerResult,
};

use crate::batch::{BatchCommand, BatchRunner, ExecSchedule};
use crate::context::DispatcherContext;
use crate::next_run::{earliest_next_run, refresh_next_runs};
use crate::restore::{prepare_restore, RestoreOutcome, RestorePlan};

/// 调度循环的控制信号
#[derive(Debug)]
pub enum ScheduleSignal {
    /// 立即执行任务
    RunTask { task_id: i64 },
    /// 任务定义已变更，从元数据库重新加载
    TaskChanged { task_id: i64 },
    /// 批次已结束
    BatchRetired { batch_id: String },
    PauseBatch {
        batch_id: String,
        reply: oneshot::Sender<SchedulerResult<usize>>,
    },
    Restore {
        batch_id: String,
        reply: oneshot::Sender<SchedulerResult<RestoreOutcome>>,
    },
    Snapshot {
        reply: oneshot::Sender<Schedule>,
    },
    ListBatches {
        reply: oneshot::Sender<Vec<BatchInfo>>,
    },
    Stop,
}

/// 在途批次的登记信息
pub struct BatchHandle {
    pub batch_id: String,
    pub activation: DateTime<Utc>,
    pub exec_type: ExecType,
    pub task_ids: HashSet<i64>,
    commands: mpsc::UnboundedSender<BatchCommand>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BatchInfo {
    pub batch_id: String,
    pub activation: DateTime<Utc>,
    pub exec_type: ExecType,
    pub task_ids: Vec<i64>,
}

impl BatchHandle {
    fn info(&self) -> BatchInfo {
        let mut task_ids: Vec<i64> = self.task_ids.iter().copied().collect();
        task_ids.sort_unstable();
        BatchInfo {
            batch_id: self.batch_id.clone(),
            activation: self.activation,
            exec_type: self.exec_type,
            task_ids,
        }
    }
}

/// 循环退出后交还的状态，用于以新定义重启循环
pub struct TimerParts {
    pub schedule: Schedule,
    signals_tx: mpsc::UnboundedSender<ScheduleSignal>,
    signals_rx: mpsc::UnboundedReceiver<ScheduleSignal>,
    live_batches: HashMap<String, BatchHandle>,
}

impl TimerParts {
    pub fn live_batch_count(&self) -> usize {
        self.live_batches.len()
    }
}

pub struct ScheduleTimer {
    schedule: Schedule,
    ctx: Arc<DispatcherContext>,
    signals_tx: mpsc::UnboundedSender<ScheduleSignal>,
    signals_rx: mpsc::UnboundedReceiver<ScheduleSignal>,
    live_batches: HashMap<String, BatchHandle>,
    manual: HashSet<i64>,
    last_activation: Option<DateTime<Utc>>,
}

impl ScheduleTimer {
    pub fn new(schedule: Schedule, ctx: Arc<DispatcherContext>) -> Self {
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        Self {
            schedule,
            ctx,
            signals_tx,
            signals_rx,
            live_batches: HashMap::new(),
            manual: HashSet::new(),
            last_activation: None,
        }
    }

    /// 以重新加载的定义接管旧循环的信号通道和在途批次
    pub fn resume(schedule: Schedule, ctx: Arc<DispatcherContext>, parts: TimerParts) -> Self {
        Self {
            schedule,
            ctx,
            signals_tx: parts.signals_tx,
            signals_rx: parts.signals_rx,
            live_batches: parts.live_batches,
            manual: HashSet::new(),
            last_activation: None,
        }
    }

    pub fn signals(&self) -> mpsc::UnboundedSender<ScheduleSignal> {
        self.signals_tx.clone()
    }

    pub fn schedule_id(&self) -> i64 {
        self.schedule.id
    }

    pub async fn run(mut self) -> TimerParts {
        info!(
            "调度 [{} {}] 触发循环启动，任务数 {}",
            self.schedule.id,
            self.schedule.name,
            self.schedule.task_count()
        );
        refresh_next_runs(
            &mut self.schedule,
            self.ctx.resolver.as_ref(),
            Utc::now(),
            None,
        );

        loop {
            let next = self.next_activation();
            let deadline = next.map(|at| {
                let wait = (at - Utc::now()).to_std().unwrap_or_default();
                Instant::now() + wait
            });

            tokio::select! {
                _ = sleep_until(deadline) => {
                    if let Some(at) = next {
                        self.fire(at);
                    }
                }
                signal = self.signals_rx.recv() => match signal {
                    Some(ScheduleSignal::Stop) | None => break,
                    Some(signal) => self.handle_signal(signal).await,
                },
            }
        }

        info!("调度 [{} {}] 触发循环退出", self.schedule.id, self.schedule.name);
        TimerParts {
            schedule: self.schedule,
            signals_tx: self.signals_tx,
            signals_rx: self.signals_rx,
            live_batches: self.live_batches,
        }
    }

    /// 排序任务并确定调度的下次激活时间
    fn next_activation(&mut self) -> Option<DateTime<Utc>> {
        let next = earliest_next_run(&mut self.schedule).or_else(|| {
            let now = Utc::now();
            let after = self.last_activation.map_or(now, |last| last.max(now));
            self.ctx
                .resolver
                .next_activation(&self.schedule.cycle, "", after)
                .ok()
        });
        self.schedule.next_start = next;
        next
    }

    fn fire(&mut self, at: DateTime<Utc>) {
        self.last_activation = Some(at);
        let matched: HashSet<i64> = self
            .schedule
            .tasks
            .iter()
            .filter(|t| t.next_run_at == Some(at))
            .map(|t| t.id)
            .collect();

        let exec_type = if matched.iter().any(|id| self.manual.contains(id)) {
            ExecType::Manual
        } else {
            ExecType::Auto
        };
        self.manual.retain(|id| !matched.contains(id));

        let exec = ExecSchedule::build(&self.schedule, at, exec_type);
        if exec.total == 0 {
            debug!("调度 {} 在 {} 没有需要执行的任务", self.schedule.id, at);
        } else if self.live_batches.contains_key(&exec.batch_id) {
            warn!("批次 {} 已在执行中，跳过本次激活", exec.batch_id);
        } else {
            info!(
                "调度 [{} {}] 启动批次 {}，任务数 {}",
                self.schedule.id, self.schedule.name, exec.batch_id, exec.total
            );
            self.launch(exec);
        }

        let after = Utc::now().max(at);
        refresh_next_runs(
            &mut self.schedule,
            self.ctx.resolver.as_ref(),
            after,
            Some(&matched),
        );
    }

    fn launch(&mut self, exec: ExecSchedule) {
        let batch_id = exec.batch_id.clone();
        let handle_info = (exec.activation, exec.exec_type, exec.members.clone());
        let (runner, commands) = BatchRunner::new(exec, self.ctx.clone());

        self.live_batches.insert(
            batch_id.clone(),
            BatchHandle {
                batch_id,
                activation: handle_info.0,
                exec_type: handle_info.1,
                task_ids: handle_info.2,
                commands,
            },
        );

        let signals = self.signals_tx.clone();
        tokio::spawn(async move {
            let report = runner.run().await;
            let _ = signals.send(ScheduleSignal::BatchRetired {
                batch_id: report.batch_id,
            });
        });
    }

    async fn handle_signal(&mut self, signal: ScheduleSignal) {
        match signal {
            ScheduleSignal::RunTask { task_id } => match self.schedule.task_mut(task_id) {
                Some(task) => {
                    info!("任务 {} 手动触发", task_id);
                    task.next_run_at = Some(Utc::now());
                    self.manual.insert(task_id);
                }
                None => warn!("调度 {} 中不存在任务 {}", self.schedule.id, task_id),
            },
            ScheduleSignal::TaskChanged { task_id } => self.reload_task(task_id).await,
            ScheduleSignal::BatchRetired { batch_id } => {
                if self.live_batches.remove(&batch_id).is_some() {
                    debug!("批次 {} 已从在途列表移除", batch_id);
                }
            }
            ScheduleSignal::PauseBatch { batch_id, reply } => {
                let Some(handle) = self.live_batches.get(&batch_id) else {
                    let _ = reply.send(Err(SchedulerError::BatchNotFound { batch_id }));
                    return;
                };
                let command = BatchCommand::Pause { reply: Some(reply) };
                if let Err(mpsc::error::SendError(BatchCommand::Pause { reply: Some(reply) })) =
                    handle.commands.send(command)
                {
                    let _ = reply.send(Err(SchedulerError::BatchNotFound { batch_id }));
                }
            }
            ScheduleSignal::Restore { batch_id, reply } => {
                let _ = reply.send(self.restore(&batch_id).await);
            }
            ScheduleSignal::Snapshot { reply } => {
                let _ = reply.send(self.schedule.clone());
            }
            ScheduleSignal::ListBatches { reply } => {
                let mut batches: Vec<BatchInfo> =
                    self.live_batches.values().map(BatchHandle::info).collect();
                batches.sort_by_key(|b| b.activation);
                let _ = reply.send(batches);
            }
            ScheduleSignal::Stop => {}
        }
    }

    async fn restore(&mut self, batch_id: &str) -> SchedulerResult<RestoreOutcome> {
        if self.live_batches.contains_key(batch_id) {
            return Err(SchedulerError::InvalidDefinition(format!(
                "批次 {batch_id} 仍在执行中，不能恢复"
            )));
        }

        match prepare_restore(&self.ctx, &self.schedule, batch_id).await? {
            RestorePlan::AlreadyComplete => Ok(RestoreOutcome::AlreadyComplete {
                batch_id: batch_id.to_string(),
            }),
            RestorePlan::Resume { exec, skipped } => {
                let remaining = exec.remaining;
                self.launch(exec);
                Ok(RestoreOutcome::Resumed {
                    batch_id: batch_id.to_string(),
                    skipped,
                    remaining,
                })
            }
        }
    }

    async fn reload_task(&mut self, task_id: i64) {
        let loaded = match self.ctx.metadata.get_task(task_id).await {
            Ok(loaded) => loaded,
            Err(e) => {
                warn!("重新加载任务 {} 失败: {}", task_id, e);
                return;
            }
        };

        let task = match loaded {
            Some(task) if self.schedule.job(task.job_id).is_some() => task,
            _ => {
                if self.schedule.remove_task(task_id).is_some() {
                    info!("任务 {} 已从调度 {} 中移除", task_id, self.schedule.id);
                }
                return;
            }
        };

        let is_new = self.schedule.task(task_id).is_none();
        self.schedule.upsert_task(task.clone());

        let mut refresh: HashSet<i64> = self
            .schedule
            .tasks
            .iter()
            .filter(|t| t.task_type == TaskType::Dependent && !self.manual.contains(&t.id))
            .map(|t| t.id)
            .collect();
        refresh.insert(task_id);
        refresh_next_runs(
            &mut self.schedule,
            self.ctx.resolver.as_ref(),
            Utc::now(),
            Some(&refresh),
        );
        info!("任务 {} 定义已重新加载", task_id);

        if is_new && task.task_type == TaskType::Dependent && !task.disabled {
            self.insert_into_live_batches(task);
        }
    }

    /// 新的依赖触发任务，上游在某个在途批次中时插入该批次
    fn insert_into_live_batches(&mut self, task: Task) {
        for handle in self.live_batches.values_mut() {
            let upstream_live = task
                .dependencies
                .iter()
                .any(|id| handle.task_ids.contains(id));
            if !upstream_live {
                continue;
            }
            let command = BatchCommand::Insert {
                tasks: vec![task.clone()],
            };
            if handle.commands.send(command).is_ok() {
                handle.task_ids.insert(task.id);
                info!("任务 {} 插入在途批次 {}", task.id, handle.batch_id);
            }
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

//! 批处理调度执行引擎
//!
//! 每个调度由一个触发循环驱动，到点时构建批次，批次内按任务依赖
//! 关系派发到Worker执行，并把运行记录写入日志存储。

pub mod batch;
pub mod context;
pub mod cron_utils;
pub mod dependency_checker;
pub mod dispatch;
pub mod manager;
pub mod next_run;
pub mod observability;
pub mod restore;
pub mod schedule_loop;

pub use batch::{BatchCommand, BatchReport, BatchRunner, ExecJob, ExecSchedule, ExecTask};
pub use context::DispatcherContext;
pub use cron_utils::{CronScheduler, CronTriggerResolver, CycleCode};
pub use dependency_checker::DependencyChecker;
pub use dispatch::WorkerDispatcher;
pub use manager::ScheduleManager;
pub use restore::RestoreOutcome;
pub use schedule_loop::{BatchInfo, ScheduleSignal, ScheduleTimer, TimerParts};

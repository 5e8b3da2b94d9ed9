use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ExecState, ExecType};

/// 调度运行日志，以批次ID为键
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScheduleRunLog {
    pub batch_id: String,
    pub schedule_id: i64,
    pub exec_type: ExecType,
    pub state: ExecState,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// 成功比例 succeeded / total
    pub result: f64,
    pub task_total: i64,
    pub task_succeeded: i64,
    pub task_failed: i64,
}

/// 作业运行日志，以作业批次ID为键
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobRunLog {
    pub batch_job_id: String,
    pub batch_id: String,
    pub job_id: i64,
    pub exec_type: ExecType,
    pub state: ExecState,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub result: f64,
}

/// 任务运行日志，以任务批次ID为键
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskRunLog {
    pub batch_task_id: String,
    pub batch_job_id: String,
    pub batch_id: String,
    pub task_id: i64,
    pub exec_type: ExecType,
    pub state: ExecState,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub result: f64,
    pub stdout: String,
    pub stderr: String,
    pub error: String,
}

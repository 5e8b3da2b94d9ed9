use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ExecType;

/// 调度定义
///
/// 一个调度包含一条有序的作业链以及所有作业下任务的扁平列表。
/// 调度的生命周期内，只有它自己的触发循环会修改这些结构，
/// 管理操作都通过触发循环的控制通道串行化。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub id: i64,
    pub name: String,
    /// 周期代码，如 "mi"、"h"、"d"
    pub cycle: String,
    /// 下次激活时间
    pub next_start: Option<DateTime<Utc>>,
    /// 最大执行时间（秒），0表示不限制
    pub timeout_seconds: i64,
    pub description: String,
    /// 按链顺序排列的作业
    pub jobs: Vec<Job>,
    /// 调度下全部任务
    pub tasks: Vec<Task>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Schedule {
    pub fn new(name: impl Into<String>, cycle: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: 0, // 将由元数据库生成
            name: name.into(),
            cycle: cycle.into(),
            next_start: None,
            timeout_seconds: 0,
            description: String::new(),
            jobs: Vec::new(),
            tasks: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn task(&self, id: i64) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    pub fn task_mut(&mut self, id: i64) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| t.id == id)
    }

    pub fn job(&self, id: i64) -> Option<&Job> {
        self.jobs.iter().find(|j| j.id == id)
    }

    pub fn job_mut(&mut self, id: i64) -> Option<&mut Job> {
        self.jobs.iter_mut().find(|j| j.id == id)
    }

    /// 作业链末端的作业
    pub fn tail_job(&self) -> Option<&Job> {
        self.jobs.last()
    }

    /// 新增或替换任务，并维护所属作业的任务集合
    pub fn upsert_task(&mut self, task: Task) {
        if let Some(job) = self.job_mut(task.job_id) {
            job.task_ids.insert(task.id);
        }
        match self.tasks.iter_mut().find(|t| t.id == task.id) {
            Some(existing) => {
                if existing.job_id != task.job_id {
                    let old_job = existing.job_id;
                    let id = task.id;
                    *existing = task;
                    if let Some(job) = self.job_mut(old_job) {
                        job.task_ids.remove(&id);
                    }
                } else {
                    *existing = task;
                }
            }
            None => self.tasks.push(task),
        }
    }

    /// 从扁平列表和所属作业中移除任务
    pub fn remove_task(&mut self, id: i64) -> Option<Task> {
        let index = self.tasks.iter().position(|t| t.id == id)?;
        let task = self.tasks.remove(index);
        if let Some(job) = self.job_mut(task.job_id) {
            job.task_ids.remove(&id);
        }
        Some(task)
    }

    /// 按 prev/next 指针整理作业顺序，断链的作业追加在末尾
    pub fn order_jobs(&mut self) {
        let mut remaining = std::mem::take(&mut self.jobs);
        let mut ordered = Vec::with_capacity(remaining.len());

        let head = remaining
            .iter()
            .position(|j| j.prev_job_id.is_none())
            .or(if remaining.is_empty() { None } else { Some(0) });

        if let Some(mut index) = head {
            loop {
                let job = remaining.remove(index);
                let next = job.next_job_id;
                ordered.push(job);
                match next.and_then(|id| remaining.iter().position(|j| j.id == id)) {
                    Some(i) => index = i,
                    None => break,
                }
            }
        }

        remaining.sort_by_key(|j| j.id);
        ordered.extend(remaining);
        self.jobs = ordered;
    }
}

/// 作业定义
///
/// 作业之间通过 prev/next id 串成链，只用于管理操作的排序，
/// 不构成执行依赖。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    pub schedule_id: i64,
    pub name: String,
    pub description: String,
    pub exec_type: ExecType,
    pub disabled: bool,
    pub prev_job_id: Option<i64>,
    pub next_job_id: Option<i64>,
    /// 作业包含的任务
    pub task_ids: BTreeSet<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(schedule_id: i64, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            schedule_id,
            name: name.into(),
            description: String::new(),
            exec_type: ExecType::Auto,
            disabled: false,
            prev_job_id: None,
            next_job_id: None,
            task_ids: BTreeSet::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn task_count(&self) -> usize {
        self.task_ids.len()
    }

    pub fn is_tail(&self) -> bool {
        self.next_job_id.is_none()
    }
}

/// 任务类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(try_from = "i8", into = "i8")]
pub enum TaskType {
    /// 不参与调度
    Inactive = 0,
    /// 按自身周期或CRON触发
    Timed = 1,
    /// 继承上游依赖任务的触发时间
    Dependent = 2,
}

impl TaskType {
    pub fn as_i8(self) -> i8 {
        self as i8
    }
}

impl TryFrom<i8> for TaskType {
    type Error = String;

    fn try_from(value: i8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(TaskType::Inactive),
            1 => Ok(TaskType::Timed),
            2 => Ok(TaskType::Dependent),
            _ => Err(format!("Invalid task type: {value}")),
        }
    }
}

impl From<TaskType> for i8 {
    fn from(value: TaskType) -> Self {
        value.as_i8()
    }
}

/// 任务定义
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub job_id: i64,
    /// Worker地址，`host` 或 `host:port`
    pub address: String,
    pub name: String,
    pub task_type: TaskType,
    pub cycle: String,
    /// CRON表达式，空字符串表示按周期代码计算
    pub cron: String,
    /// 最大尝试次数，小于1时按1处理
    pub retry: i32,
    pub concurrent: bool,
    pub disabled: bool,
    pub priority: i16,
    /// 周期内启动偏移（秒）
    pub start_offset_seconds: i64,
    pub command: String,
    pub description: String,
    /// 超时时间（秒），0表示不限制，由Worker执行
    pub timeout_seconds: i64,
    pub attributes: HashMap<String, String>,
    /// 依赖的任务 ID（静态定义，运行期间不变）
    pub dependencies: Vec<i64>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub prev_run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(job_id: i64, name: impl Into<String>, command: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            job_id,
            address: "127.0.0.1".to_string(),
            name: name.into(),
            task_type: TaskType::Timed,
            cycle: "d".to_string(),
            cron: String::new(),
            retry: 1,
            concurrent: false,
            disabled: false,
            priority: 0,
            start_offset_seconds: 0,
            command: command.into(),
            description: String::new(),
            timeout_seconds: 0,
            attributes: HashMap::new(),
            dependencies: Vec::new(),
            next_run_at: None,
            prev_run_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn has_cron(&self) -> bool {
        !self.cron.trim().is_empty()
    }

    /// 实际尝试次数，至少为1
    pub fn attempts(&self) -> u32 {
        self.retry.max(1) as u32
    }

    pub fn start_offset(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.start_offset_seconds.max(0))
    }
}

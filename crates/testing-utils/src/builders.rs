//! 测试数据构建器
//!
//! 默认值贴近生产数据，测试只需覆盖关心的字段。

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use batch_core::models::{Job, Schedule, Task, TaskType};

/// 任务构建器，默认是按天触发的定时任务
pub struct TaskBuilder {
    task: Task,
}

impl TaskBuilder {
    pub fn new(id: i64, job_id: i64) -> Self {
        let mut task = Task::new(job_id, format!("task_{id}"), format!("echo task_{id}"));
        task.id = id;
        Self { task }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.task.name = name.to_string();
        self
    }

    pub fn with_address(mut self, address: &str) -> Self {
        self.task.address = address.to_string();
        self
    }

    pub fn with_command(mut self, command: &str) -> Self {
        self.task.command = command.to_string();
        self
    }

    pub fn with_cycle(mut self, cycle: &str) -> Self {
        self.task.cycle = cycle.to_string();
        self
    }

    pub fn with_cron(mut self, cron: &str) -> Self {
        self.task.cron = cron.to_string();
        self
    }

    pub fn with_retry(mut self, retry: i32) -> Self {
        self.task.retry = retry;
        self
    }

    pub fn with_priority(mut self, priority: i16) -> Self {
        self.task.priority = priority;
        self
    }

    pub fn with_offset(mut self, seconds: i64) -> Self {
        self.task.start_offset_seconds = seconds;
        self
    }

    pub fn with_attribute(mut self, key: &str, value: &str) -> Self {
        self.task.attributes.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_attributes(mut self, attributes: HashMap<String, String>) -> Self {
        self.task.attributes = attributes;
        self
    }

    /// 依赖触发任务，下次运行时间跟随第一个依赖
    pub fn depends_on(mut self, dependencies: &[i64]) -> Self {
        self.task.task_type = TaskType::Dependent;
        self.task.dependencies = dependencies.to_vec();
        self
    }

    /// 只加依赖边，保留定时触发
    pub fn after(mut self, dependencies: &[i64]) -> Self {
        self.task.dependencies = dependencies.to_vec();
        self
    }

    pub fn with_type(mut self, task_type: TaskType) -> Self {
        self.task.task_type = task_type;
        self
    }

    pub fn next_run(mut self, at: DateTime<Utc>) -> Self {
        self.task.next_run_at = Some(at);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.task.disabled = true;
        self
    }

    pub fn build(self) -> Task {
        self.task
    }
}

pub struct JobBuilder {
    job: Job,
}

impl JobBuilder {
    pub fn new(id: i64, schedule_id: i64) -> Self {
        let mut job = Job::new(schedule_id, format!("job_{id}"));
        job.id = id;
        Self { job }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.job.name = name.to_string();
        self
    }

    pub fn disabled(mut self) -> Self {
        self.job.disabled = true;
        self
    }

    pub fn build(self) -> Job {
        self.job
    }
}

/// 调度构建器
///
/// 作业按添加顺序串成链，任务归入其 `job_id` 对应的作业。
pub struct ScheduleBuilder {
    schedule: Schedule,
}

impl ScheduleBuilder {
    pub fn new(id: i64) -> Self {
        let mut schedule = Schedule::new(format!("schedule_{id}"), "d");
        schedule.id = id;
        Self { schedule }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.schedule.name = name.to_string();
        self
    }

    pub fn with_cycle(mut self, cycle: &str) -> Self {
        self.schedule.cycle = cycle.to_string();
        self
    }

    pub fn with_job(mut self, mut job: Job) -> Self {
        job.schedule_id = self.schedule.id;
        job.prev_job_id = self.schedule.jobs.last().map(|j| j.id);
        job.next_job_id = None;
        if let Some(prev) = self.schedule.jobs.last_mut() {
            prev.next_job_id = Some(job.id);
        }
        self.schedule.jobs.push(job);
        self
    }

    pub fn with_task(mut self, task: Task) -> Self {
        self.schedule.upsert_task(task);
        self
    }

    pub fn with_tasks(mut self, tasks: impl IntoIterator<Item = Task>) -> Self {
        for task in tasks {
            self.schedule.upsert_task(task);
        }
        self
    }

    pub fn build(self) -> Schedule {
        self.schedule
    }
}

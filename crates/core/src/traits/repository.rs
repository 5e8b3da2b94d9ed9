//! 存储层接口定义
//!
//! - [`MetadataStore`]：调度、作业、任务定义及任务依赖边的持久化
//! - [`ExecLogStore`]：调度运行、作业运行、任务运行日志
//!
//! 查询不到的记录以 `Ok(None)` 表示，与传输错误区分开。

use async_trait::async_trait;

use crate::{
    models::{Job, JobRunLog, Schedule, ScheduleRunLog, Task, TaskRunLog},
    SchedulerResult,
};

/// 元数据存储
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// 创建调度，返回带有生成ID的调度（不含作业和任务）
    async fn create_schedule(&self, schedule: &Schedule) -> SchedulerResult<Schedule>;

    /// 读取调度本身的字段，`jobs` 和 `tasks` 为空
    async fn get_schedule(&self, id: i64) -> SchedulerResult<Option<Schedule>>;

    async fn update_schedule(&self, schedule: &Schedule) -> SchedulerResult<()>;

    async fn delete_schedule(&self, id: i64) -> SchedulerResult<()>;

    async fn list_schedules(&self) -> SchedulerResult<Vec<Schedule>>;

    async fn create_job(&self, job: &Job) -> SchedulerResult<Job>;

    /// 读取作业，`task_ids` 已填充
    async fn get_job(&self, id: i64) -> SchedulerResult<Option<Job>>;

    async fn update_job(&self, job: &Job) -> SchedulerResult<()>;

    async fn delete_job(&self, id: i64) -> SchedulerResult<()>;

    async fn list_jobs(&self, schedule_id: i64) -> SchedulerResult<Vec<Job>>;

    /// 创建任务及其属性，返回带有生成ID的任务
    async fn create_task(&self, task: &Task) -> SchedulerResult<Task>;

    /// 读取任务，属性和依赖ID已填充
    async fn get_task(&self, id: i64) -> SchedulerResult<Option<Task>>;

    /// 更新任务字段并整体替换属性
    async fn update_task(&self, task: &Task) -> SchedulerResult<()>;

    /// 删除任务、属性以及所有指向或来自它的依赖边
    async fn delete_task(&self, id: i64) -> SchedulerResult<()>;

    async fn list_tasks(&self, job_id: i64) -> SchedulerResult<Vec<Task>>;

    async fn add_task_dependency(&self, task_id: i64, dependency_id: i64) -> SchedulerResult<()>;

    async fn remove_task_dependency(&self, task_id: i64, dependency_id: i64)
        -> SchedulerResult<()>;

    async fn list_task_dependencies(&self, task_id: i64) -> SchedulerResult<Vec<i64>>;

    /// 加载完整调度：按链排序的作业、所有任务及其依赖
    async fn load_schedule(&self, id: i64) -> SchedulerResult<Option<Schedule>> {
        let Some(mut schedule) = self.get_schedule(id).await? else {
            return Ok(None);
        };

        schedule.jobs = self.list_jobs(id).await?;
        schedule.order_jobs();

        let mut tasks = Vec::new();
        for job in schedule.jobs.iter_mut() {
            let job_tasks = self.list_tasks(job.id).await?;
            job.task_ids = job_tasks.iter().map(|t| t.id).collect();
            tasks.extend(job_tasks);
        }
        schedule.tasks = tasks;

        Ok(Some(schedule))
    }
}

/// 运行日志存储，按批次ID追加或更新
#[async_trait]
pub trait ExecLogStore: Send + Sync {
    /// 按批次ID写入或更新调度运行日志，返回日志记录ID
    async fn upsert_schedule_run(&self, log: &ScheduleRunLog) -> SchedulerResult<i64>;

    /// 按作业批次ID写入或更新
    async fn upsert_job_run(&self, log: &JobRunLog) -> SchedulerResult<i64>;

    /// 按任务批次ID写入或更新
    async fn upsert_task_run(&self, log: &TaskRunLog) -> SchedulerResult<i64>;

    /// 批次中已成功（DONE 或 IGNORED）的任务ID
    async fn succeeded_task_ids(&self, batch_id: &str) -> SchedulerResult<Vec<i64>>;

    /// 批次中有日志记录的全部任务ID
    async fn task_ids_in_batch(&self, batch_id: &str) -> SchedulerResult<Vec<i64>>;

    async fn task_runs(&self, batch_id: &str) -> SchedulerResult<Vec<TaskRunLog>>;

    async fn schedule_run(&self, batch_id: &str) -> SchedulerResult<Option<ScheduleRunLog>>;
}

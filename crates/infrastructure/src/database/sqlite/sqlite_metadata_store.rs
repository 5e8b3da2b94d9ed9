use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use batch_core::{
    models::{Job, Schedule, Task},
    traits::MetadataStore,
    SchedulerError, SchedulerResult,
};
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};
use tracing::{debug, instrument};

use crate::database::mapping::MappingHelpers;

const TASK_COLUMNS: &str = "id, job_id, address, name, task_type, cycle, cron, retry, concurrent, \
     disabled, priority, start_offset_seconds, command, description, timeout_seconds, \
     created_at, updated_at";

const JOB_COLUMNS: &str = "id, schedule_id, name, description, exec_type, disabled, \
     prev_job_id, next_job_id, created_at, updated_at";

pub struct SqliteMetadataStore {
    pool: SqlitePool,
}

impl SqliteMetadataStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_schedule(row: &SqliteRow) -> SchedulerResult<Schedule> {
        Ok(Schedule {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            cycle: row.try_get("cycle")?,
            next_start: None,
            timeout_seconds: row.try_get("timeout_seconds")?,
            description: row.try_get("description")?,
            jobs: Vec::new(),
            tasks: Vec::new(),
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn row_to_job(row: &SqliteRow) -> SchedulerResult<Job> {
        Ok(Job {
            id: row.try_get("id")?,
            schedule_id: row.try_get("schedule_id")?,
            name: row.try_get("name")?,
            description: row.try_get("description")?,
            exec_type: MappingHelpers::exec_type(row, "exec_type")?,
            disabled: row.try_get("disabled")?,
            prev_job_id: row.try_get("prev_job_id")?,
            next_job_id: row.try_get("next_job_id")?,
            task_ids: BTreeSet::new(),
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn row_to_task(row: &SqliteRow) -> SchedulerResult<Task> {
        let priority: i64 = row.try_get("priority")?;
        Ok(Task {
            id: row.try_get("id")?,
            job_id: row.try_get("job_id")?,
            address: row.try_get("address")?,
            name: row.try_get("name")?,
            task_type: MappingHelpers::task_type(row, "task_type")?,
            cycle: row.try_get("cycle")?,
            cron: row.try_get("cron")?,
            retry: row.try_get("retry")?,
            concurrent: row.try_get("concurrent")?,
            disabled: row.try_get("disabled")?,
            priority: i16::try_from(priority).map_err(|_| {
                SchedulerError::Serialization(format!("任务优先级超出范围: {priority}"))
            })?,
            start_offset_seconds: row.try_get("start_offset_seconds")?,
            command: row.try_get("command")?,
            description: row.try_get("description")?,
            timeout_seconds: row.try_get("timeout_seconds")?,
            attributes: HashMap::new(),
            dependencies: Vec::new(),
            next_run_at: None,
            prev_run_at: None,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    async fn job_task_ids(&self, job_id: i64) -> SchedulerResult<BTreeSet<i64>> {
        let rows = sqlx::query("SELECT id FROM tasks WHERE job_id = $1")
            .bind(job_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| row.try_get::<i64, _>("id").map_err(SchedulerError::from))
            .collect()
    }

    /// 填充任务属性和依赖ID
    async fn hydrate_task(&self, mut task: Task) -> SchedulerResult<Task> {
        let rows = sqlx::query("SELECT name, value FROM task_attributes WHERE task_id = $1")
            .bind(task.id)
            .fetch_all(&self.pool)
            .await?;
        for row in rows {
            task.attributes
                .insert(row.try_get("name")?, row.try_get("value")?);
        }
        task.dependencies = self.list_task_dependencies(task.id).await?;
        Ok(task)
    }
}

#[async_trait]
impl MetadataStore for SqliteMetadataStore {
    #[instrument(skip(self, schedule), fields(schedule_name = %schedule.name))]
    async fn create_schedule(&self, schedule: &Schedule) -> SchedulerResult<Schedule> {
        let result = sqlx::query(
            r#"
            INSERT INTO schedules (name, cycle, timeout_seconds, description, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(&schedule.name)
        .bind(&schedule.cycle)
        .bind(schedule.timeout_seconds)
        .bind(&schedule.description)
        .bind(schedule.created_at)
        .bind(schedule.updated_at)
        .execute(&self.pool)
        .await?;

        let mut created = schedule.clone();
        created.id = result.last_insert_rowid();
        created.jobs.clear();
        created.tasks.clear();
        debug!("创建调度成功: {} ({})", created.name, created.id);
        Ok(created)
    }

    #[instrument(skip(self), fields(schedule_id = %id))]
    async fn get_schedule(&self, id: i64) -> SchedulerResult<Option<Schedule>> {
        let row = sqlx::query("SELECT * FROM schedules WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_schedule).transpose()
    }

    #[instrument(skip(self, schedule), fields(schedule_id = %schedule.id))]
    async fn update_schedule(&self, schedule: &Schedule) -> SchedulerResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE schedules
            SET name = $1, cycle = $2, timeout_seconds = $3, description = $4, updated_at = $5
            WHERE id = $6
            "#,
        )
        .bind(&schedule.name)
        .bind(&schedule.cycle)
        .bind(schedule.timeout_seconds)
        .bind(&schedule.description)
        .bind(schedule.updated_at)
        .bind(schedule.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(SchedulerError::ScheduleNotFound { id: schedule.id });
        }
        Ok(())
    }

    #[instrument(skip(self), fields(schedule_id = %id))]
    async fn delete_schedule(&self, id: i64) -> SchedulerResult<()> {
        sqlx::query("DELETE FROM schedules WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        debug!("删除调度: {}", id);
        Ok(())
    }

    async fn list_schedules(&self) -> SchedulerResult<Vec<Schedule>> {
        let rows = sqlx::query("SELECT * FROM schedules ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_schedule).collect()
    }

    #[instrument(skip(self, job), fields(schedule_id = %job.schedule_id, job_name = %job.name))]
    async fn create_job(&self, job: &Job) -> SchedulerResult<Job> {
        let result = sqlx::query(
            r#"
            INSERT INTO jobs (schedule_id, name, description, exec_type, disabled,
                              prev_job_id, next_job_id, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(job.schedule_id)
        .bind(&job.name)
        .bind(&job.description)
        .bind(i64::from(job.exec_type.as_i8()))
        .bind(job.disabled)
        .bind(job.prev_job_id)
        .bind(job.next_job_id)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&self.pool)
        .await?;

        let mut created = job.clone();
        created.id = result.last_insert_rowid();
        created.task_ids.clear();
        debug!("创建作业成功: {} ({})", created.name, created.id);
        Ok(created)
    }

    #[instrument(skip(self), fields(job_id = %id))]
    async fn get_job(&self, id: i64) -> SchedulerResult<Option<Job>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let mut job = Self::row_to_job(&row)?;
        job.task_ids = self.job_task_ids(job.id).await?;
        Ok(Some(job))
    }

    #[instrument(skip(self, job), fields(job_id = %job.id))]
    async fn update_job(&self, job: &Job) -> SchedulerResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET name = $1, description = $2, exec_type = $3, disabled = $4,
                prev_job_id = $5, next_job_id = $6, updated_at = $7
            WHERE id = $8
            "#,
        )
        .bind(&job.name)
        .bind(&job.description)
        .bind(i64::from(job.exec_type.as_i8()))
        .bind(job.disabled)
        .bind(job.prev_job_id)
        .bind(job.next_job_id)
        .bind(job.updated_at)
        .bind(job.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(SchedulerError::JobNotFound { id: job.id });
        }
        Ok(())
    }

    #[instrument(skip(self), fields(job_id = %id))]
    async fn delete_job(&self, id: i64) -> SchedulerResult<()> {
        sqlx::query("DELETE FROM jobs WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        debug!("删除作业: {}", id);
        Ok(())
    }

    #[instrument(skip(self), fields(schedule_id = %schedule_id))]
    async fn list_jobs(&self, schedule_id: i64) -> SchedulerResult<Vec<Job>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE schedule_id = $1 ORDER BY id");
        let rows = sqlx::query(&sql)
            .bind(schedule_id)
            .fetch_all(&self.pool)
            .await?;

        let mut jobs = Vec::with_capacity(rows.len());
        for row in rows {
            let mut job = Self::row_to_job(&row)?;
            job.task_ids = self.job_task_ids(job.id).await?;
            jobs.push(job);
        }
        Ok(jobs)
    }

    #[instrument(skip(self, task), fields(job_id = %task.job_id, task_name = %task.name))]
    async fn create_task(&self, task: &Task) -> SchedulerResult<Task> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            INSERT INTO tasks (job_id, address, name, task_type, cycle, cron, retry, concurrent,
                               disabled, priority, start_offset_seconds, command, description,
                               timeout_seconds, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            "#,
        )
        .bind(task.job_id)
        .bind(&task.address)
        .bind(&task.name)
        .bind(i64::from(task.task_type.as_i8()))
        .bind(&task.cycle)
        .bind(&task.cron)
        .bind(task.retry)
        .bind(task.concurrent)
        .bind(task.disabled)
        .bind(i64::from(task.priority))
        .bind(task.start_offset_seconds)
        .bind(&task.command)
        .bind(&task.description)
        .bind(task.timeout_seconds)
        .bind(task.created_at)
        .bind(task.updated_at)
        .execute(&mut *tx)
        .await?;
        let id = result.last_insert_rowid();

        for (name, value) in &task.attributes {
            sqlx::query("INSERT INTO task_attributes (task_id, name, value) VALUES ($1, $2, $3)")
                .bind(id)
                .bind(name)
                .bind(value)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        let mut created = task.clone();
        created.id = id;
        created.dependencies.clear();
        debug!("创建任务成功: {} ({})", created.name, created.id);
        Ok(created)
    }

    #[instrument(skip(self), fields(task_id = %id))]
    async fn get_task(&self, id: i64) -> SchedulerResult<Option<Task>> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(self.hydrate_task(Self::row_to_task(&row)?).await?)),
            None => Ok(None),
        }
    }

    #[instrument(skip(self, task), fields(task_id = %task.id))]
    async fn update_task(&self, task: &Task) -> SchedulerResult<()> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET job_id = $1, address = $2, name = $3, task_type = $4, cycle = $5, cron = $6,
                retry = $7, concurrent = $8, disabled = $9, priority = $10,
                start_offset_seconds = $11, command = $12, description = $13,
                timeout_seconds = $14, updated_at = $15
            WHERE id = $16
            "#,
        )
        .bind(task.job_id)
        .bind(&task.address)
        .bind(&task.name)
        .bind(i64::from(task.task_type.as_i8()))
        .bind(&task.cycle)
        .bind(&task.cron)
        .bind(task.retry)
        .bind(task.concurrent)
        .bind(task.disabled)
        .bind(i64::from(task.priority))
        .bind(task.start_offset_seconds)
        .bind(&task.command)
        .bind(&task.description)
        .bind(task.timeout_seconds)
        .bind(task.updated_at)
        .bind(task.id)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(SchedulerError::TaskNotFound { id: task.id });
        }

        sqlx::query("DELETE FROM task_attributes WHERE task_id = $1")
            .bind(task.id)
            .execute(&mut *tx)
            .await?;
        for (name, value) in &task.attributes {
            sqlx::query("INSERT INTO task_attributes (task_id, name, value) VALUES ($1, $2, $3)")
                .bind(task.id)
                .bind(name)
                .bind(value)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    #[instrument(skip(self), fields(task_id = %id))]
    async fn delete_task(&self, id: i64) -> SchedulerResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM task_dependencies WHERE task_id = $1 OR dependency_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM task_attributes WHERE task_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM tasks WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        debug!("删除任务: {}", id);
        Ok(())
    }

    #[instrument(skip(self), fields(job_id = %job_id))]
    async fn list_tasks(&self, job_id: i64) -> SchedulerResult<Vec<Task>> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE job_id = $1 ORDER BY id");
        let rows = sqlx::query(&sql)
            .bind(job_id)
            .fetch_all(&self.pool)
            .await?;

        let mut tasks = Vec::with_capacity(rows.len());
        for row in rows {
            tasks.push(self.hydrate_task(Self::row_to_task(&row)?).await?);
        }
        Ok(tasks)
    }

    async fn add_task_dependency(&self, task_id: i64, dependency_id: i64) -> SchedulerResult<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO task_dependencies (task_id, dependency_id) VALUES ($1, $2)",
        )
        .bind(task_id)
        .bind(dependency_id)
        .execute(&self.pool)
        .await?;
        debug!("添加任务依赖: {} -> {}", task_id, dependency_id);
        Ok(())
    }

    async fn remove_task_dependency(
        &self,
        task_id: i64,
        dependency_id: i64,
    ) -> SchedulerResult<()> {
        sqlx::query("DELETE FROM task_dependencies WHERE task_id = $1 AND dependency_id = $2")
            .bind(task_id)
            .bind(dependency_id)
            .execute(&self.pool)
            .await?;
        debug!("移除任务依赖: {} -> {}", task_id, dependency_id);
        Ok(())
    }

    async fn list_task_dependencies(&self, task_id: i64) -> SchedulerResult<Vec<i64>> {
        let rows = sqlx::query(
            "SELECT dependency_id FROM task_dependencies WHERE task_id = $1 ORDER BY dependency_id",
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| row.try_get::<i64, _>("dependency_id").map_err(SchedulerError::from))
            .collect()
    }
}

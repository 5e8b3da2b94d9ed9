use async_trait::async_trait;
use batch_core::{
    models::{ExecState, JobRunLog, ScheduleRunLog, TaskRunLog},
    traits::ExecLogStore,
    SchedulerError, SchedulerResult,
};
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};
use tracing::{debug, instrument};

use crate::database::mapping::MappingHelpers;

/// 运行日志按批次ID去重写入，重复写入同一批次ID时更新原记录
pub struct SqliteExecLogStore {
    pool: SqlitePool,
}

impl SqliteExecLogStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_schedule_run(row: &SqliteRow) -> SchedulerResult<ScheduleRunLog> {
        Ok(ScheduleRunLog {
            batch_id: row.try_get("batch_id")?,
            schedule_id: row.try_get("schedule_id")?,
            exec_type: MappingHelpers::exec_type(row, "exec_type")?,
            state: MappingHelpers::exec_state(row, "state")?,
            start_time: row.try_get("start_time")?,
            end_time: row.try_get("end_time")?,
            result: row.try_get("result")?,
            task_total: row.try_get("task_total")?,
            task_succeeded: row.try_get("task_succeeded")?,
            task_failed: row.try_get("task_failed")?,
        })
    }

    fn row_to_task_run(row: &SqliteRow) -> SchedulerResult<TaskRunLog> {
        Ok(TaskRunLog {
            batch_task_id: row.try_get("batch_task_id")?,
            batch_job_id: row.try_get("batch_job_id")?,
            batch_id: row.try_get("batch_id")?,
            task_id: row.try_get("task_id")?,
            exec_type: MappingHelpers::exec_type(row, "exec_type")?,
            state: MappingHelpers::exec_state(row, "state")?,
            start_time: row.try_get("start_time")?,
            end_time: row.try_get("end_time")?,
            result: row.try_get("result")?,
            stdout: row.try_get("stdout")?,
            stderr: row.try_get("stderr")?,
            error: row.try_get("error")?,
        })
    }

    fn ids(rows: &[SqliteRow]) -> SchedulerResult<Vec<i64>> {
        rows.iter()
            .map(|row| row.try_get::<i64, _>("task_id").map_err(SchedulerError::from))
            .collect()
    }
}

#[async_trait]
impl ExecLogStore for SqliteExecLogStore {
    #[instrument(skip(self, log), fields(batch_id = %log.batch_id, state = %log.state))]
    async fn upsert_schedule_run(&self, log: &ScheduleRunLog) -> SchedulerResult<i64> {
        let row = sqlx::query(
            r#"
            INSERT INTO schedule_run_log (batch_id, schedule_id, exec_type, state, start_time,
                                          end_time, result, task_total, task_succeeded, task_failed)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT(batch_id) DO UPDATE SET
                exec_type = excluded.exec_type,
                state = excluded.state,
                start_time = excluded.start_time,
                end_time = excluded.end_time,
                result = excluded.result,
                task_total = excluded.task_total,
                task_succeeded = excluded.task_succeeded,
                task_failed = excluded.task_failed
            RETURNING id
            "#,
        )
        .bind(&log.batch_id)
        .bind(log.schedule_id)
        .bind(i64::from(log.exec_type.as_i8()))
        .bind(i64::from(log.state.as_i8()))
        .bind(log.start_time)
        .bind(log.end_time)
        .bind(log.result)
        .bind(log.task_total)
        .bind(log.task_succeeded)
        .bind(log.task_failed)
        .fetch_one(&self.pool)
        .await?;

        let id: i64 = row.try_get("id")?;
        debug!("调度运行日志已写入: {} ({})", log.batch_id, id);
        Ok(id)
    }

    #[instrument(skip(self, log), fields(batch_job_id = %log.batch_job_id, state = %log.state))]
    async fn upsert_job_run(&self, log: &JobRunLog) -> SchedulerResult<i64> {
        let row = sqlx::query(
            r#"
            INSERT INTO job_run_log (batch_job_id, batch_id, job_id, exec_type, state,
                                     start_time, end_time, result)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT(batch_job_id) DO UPDATE SET
                exec_type = excluded.exec_type,
                state = excluded.state,
                start_time = excluded.start_time,
                end_time = excluded.end_time,
                result = excluded.result
            RETURNING id
            "#,
        )
        .bind(&log.batch_job_id)
        .bind(&log.batch_id)
        .bind(log.job_id)
        .bind(i64::from(log.exec_type.as_i8()))
        .bind(i64::from(log.state.as_i8()))
        .bind(log.start_time)
        .bind(log.end_time)
        .bind(log.result)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.try_get("id")?)
    }

    #[instrument(skip(self, log), fields(batch_task_id = %log.batch_task_id, state = %log.state))]
    async fn upsert_task_run(&self, log: &TaskRunLog) -> SchedulerResult<i64> {
        let row = sqlx::query(
            r#"
            INSERT INTO task_run_log (batch_task_id, batch_job_id, batch_id, task_id, exec_type,
                                      state, start_time, end_time, result, stdout, stderr, error)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT(batch_task_id) DO UPDATE SET
                exec_type = excluded.exec_type,
                state = excluded.state,
                start_time = excluded.start_time,
                end_time = excluded.end_time,
                result = excluded.result,
                stdout = excluded.stdout,
                stderr = excluded.stderr,
                error = excluded.error
            RETURNING id
            "#,
        )
        .bind(&log.batch_task_id)
        .bind(&log.batch_job_id)
        .bind(&log.batch_id)
        .bind(log.task_id)
        .bind(i64::from(log.exec_type.as_i8()))
        .bind(i64::from(log.state.as_i8()))
        .bind(log.start_time)
        .bind(log.end_time)
        .bind(log.result)
        .bind(&log.stdout)
        .bind(&log.stderr)
        .bind(&log.error)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.try_get("id")?)
    }

    /// 状态为 DONE 或 IGNORED 的任务
    async fn succeeded_task_ids(&self, batch_id: &str) -> SchedulerResult<Vec<i64>> {
        let rows = sqlx::query(
            "SELECT DISTINCT task_id FROM task_run_log WHERE batch_id = $1 AND state IN ($2, $3) ORDER BY task_id",
        )
        .bind(batch_id)
        .bind(i64::from(ExecState::Done.as_i8()))
        .bind(i64::from(ExecState::Ignored.as_i8()))
        .fetch_all(&self.pool)
        .await?;
        Self::ids(&rows)
    }

    async fn task_ids_in_batch(&self, batch_id: &str) -> SchedulerResult<Vec<i64>> {
        let rows = sqlx::query(
            "SELECT DISTINCT task_id FROM task_run_log WHERE batch_id = $1 ORDER BY task_id",
        )
        .bind(batch_id)
        .fetch_all(&self.pool)
        .await?;
        Self::ids(&rows)
    }

    async fn task_runs(&self, batch_id: &str) -> SchedulerResult<Vec<TaskRunLog>> {
        let rows = sqlx::query("SELECT * FROM task_run_log WHERE batch_id = $1 ORDER BY task_id")
            .bind(batch_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_task_run).collect()
    }

    async fn schedule_run(&self, batch_id: &str) -> SchedulerResult<Option<ScheduleRunLog>> {
        let row = sqlx::query("SELECT * FROM schedule_run_log WHERE batch_id = $1")
            .bind(batch_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_schedule_run).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::sqlite::test_support::temp_database;
    use batch_core::models::ExecType;
    use chrono::Utc;

    fn task_log(task_id: i64, state: ExecState) -> TaskRunLog {
        TaskRunLog {
            batch_task_id: format!("1.1000.10.{task_id}"),
            batch_job_id: "1.1000.10".to_string(),
            batch_id: "1.1000".to_string(),
            task_id,
            exec_type: ExecType::Auto,
            state,
            start_time: None,
            end_time: None,
            result: 0.0,
            stdout: String::new(),
            stderr: String::new(),
            error: String::new(),
        }
    }

    #[tokio::test]
    async fn test_task_run_upsert_keeps_one_row_per_batch_task() {
        let (db, _dir) = temp_database().await;
        let store = db.exec_log_store();

        let first = store.upsert_task_run(&task_log(1, ExecState::Pending)).await.unwrap();
        let mut done = task_log(1, ExecState::Done);
        done.stdout = "hello".to_string();
        done.end_time = Some(Utc::now());
        let second = store.upsert_task_run(&done).await.unwrap();
        assert_eq!(first, second);

        store.upsert_task_run(&task_log(2, ExecState::Aborted)).await.unwrap();
        store.upsert_task_run(&task_log(3, ExecState::Ignored)).await.unwrap();
        store
            .upsert_task_run(&TaskRunLog {
                batch_id: "2.1000".to_string(),
                batch_task_id: "2.1000.10.9".to_string(),
                ..task_log(9, ExecState::Done)
            })
            .await
            .unwrap();

        assert_eq!(store.succeeded_task_ids("1.1000").await.unwrap(), vec![1, 3]);
        assert_eq!(store.task_ids_in_batch("1.1000").await.unwrap(), vec![1, 2, 3]);

        let runs = store.task_runs("1.1000").await.unwrap();
        assert_eq!(runs.len(), 3);
        assert_eq!(runs[0].stdout, "hello");
        assert!(runs[0].end_time.is_some());
    }

    #[tokio::test]
    async fn test_schedule_and_job_runs() {
        let (db, _dir) = temp_database().await;
        let store = db.exec_log_store();

        let mut run = ScheduleRunLog {
            batch_id: "1.1000".to_string(),
            schedule_id: 1,
            exec_type: ExecType::Auto,
            state: ExecState::Running,
            start_time: Some(Utc::now()),
            end_time: None,
            result: 0.0,
            task_total: 4,
            task_succeeded: 0,
            task_failed: 0,
        };
        let id = store.upsert_schedule_run(&run).await.unwrap();

        run.state = ExecState::Aborted;
        run.exec_type = ExecType::Repair;
        run.result = 0.75;
        run.task_succeeded = 3;
        run.task_failed = 1;
        assert_eq!(store.upsert_schedule_run(&run).await.unwrap(), id);

        let loaded = store.schedule_run("1.1000").await.unwrap().unwrap();
        assert_eq!(loaded.state, ExecState::Aborted);
        assert_eq!(loaded.exec_type, ExecType::Repair);
        assert_eq!(loaded.result, 0.75);
        assert!(store.schedule_run("missing").await.unwrap().is_none());

        let job = JobRunLog {
            batch_job_id: "1.1000.10".to_string(),
            batch_id: "1.1000".to_string(),
            job_id: 10,
            exec_type: ExecType::Auto,
            state: ExecState::Done,
            start_time: None,
            end_time: None,
            result: 1.0,
        };
        let job_id = store.upsert_job_run(&job).await.unwrap();
        assert_eq!(store.upsert_job_run(&job).await.unwrap(), job_id);
    }
}

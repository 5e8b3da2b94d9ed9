pub mod sqlite_exec_log_store;
pub mod sqlite_metadata_store;

pub use sqlite_exec_log_store::SqliteExecLogStore;
pub use sqlite_metadata_store::SqliteMetadataStore;

use std::str::FromStr;

use batch_core::{config::DatabaseConfig, SchedulerResult};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::{debug, info};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS schedules (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        cycle TEXT NOT NULL,
        timeout_seconds INTEGER NOT NULL DEFAULT 0,
        description TEXT NOT NULL DEFAULT '',
        created_at DATETIME NOT NULL,
        updated_at DATETIME NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS jobs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        schedule_id INTEGER NOT NULL,
        name TEXT NOT NULL,
        description TEXT NOT NULL DEFAULT '',
        exec_type INTEGER NOT NULL DEFAULT 1,
        disabled INTEGER NOT NULL DEFAULT 0,
        prev_job_id INTEGER,
        next_job_id INTEGER,
        created_at DATETIME NOT NULL,
        updated_at DATETIME NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS tasks (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        job_id INTEGER NOT NULL,
        address TEXT NOT NULL,
        name TEXT NOT NULL,
        task_type INTEGER NOT NULL DEFAULT 1,
        cycle TEXT NOT NULL DEFAULT 'd',
        cron TEXT NOT NULL DEFAULT '',
        retry INTEGER NOT NULL DEFAULT 1,
        concurrent INTEGER NOT NULL DEFAULT 0,
        disabled INTEGER NOT NULL DEFAULT 0,
        priority INTEGER NOT NULL DEFAULT 0,
        start_offset_seconds INTEGER NOT NULL DEFAULT 0,
        command TEXT NOT NULL DEFAULT '',
        description TEXT NOT NULL DEFAULT '',
        timeout_seconds INTEGER NOT NULL DEFAULT 0,
        created_at DATETIME NOT NULL,
        updated_at DATETIME NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS task_attributes (
        task_id INTEGER NOT NULL,
        name TEXT NOT NULL,
        value TEXT NOT NULL,
        PRIMARY KEY (task_id, name)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS task_dependencies (
        task_id INTEGER NOT NULL,
        dependency_id INTEGER NOT NULL,
        PRIMARY KEY (task_id, dependency_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS schedule_run_log (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        batch_id TEXT NOT NULL UNIQUE,
        schedule_id INTEGER NOT NULL,
        exec_type INTEGER NOT NULL,
        state INTEGER NOT NULL,
        start_time DATETIME,
        end_time DATETIME,
        result REAL NOT NULL DEFAULT 0,
        task_total INTEGER NOT NULL DEFAULT 0,
        task_succeeded INTEGER NOT NULL DEFAULT 0,
        task_failed INTEGER NOT NULL DEFAULT 0
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS job_run_log (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        batch_job_id TEXT NOT NULL UNIQUE,
        batch_id TEXT NOT NULL,
        job_id INTEGER NOT NULL,
        exec_type INTEGER NOT NULL,
        state INTEGER NOT NULL,
        start_time DATETIME,
        end_time DATETIME,
        result REAL NOT NULL DEFAULT 0
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS task_run_log (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        batch_task_id TEXT NOT NULL UNIQUE,
        batch_job_id TEXT NOT NULL,
        batch_id TEXT NOT NULL,
        task_id INTEGER NOT NULL,
        exec_type INTEGER NOT NULL,
        state INTEGER NOT NULL,
        start_time DATETIME,
        end_time DATETIME,
        result REAL NOT NULL DEFAULT 0,
        stdout TEXT NOT NULL DEFAULT '',
        stderr TEXT NOT NULL DEFAULT '',
        error TEXT NOT NULL DEFAULT ''
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_jobs_schedule_id ON jobs(schedule_id)",
    "CREATE INDEX IF NOT EXISTS idx_tasks_job_id ON tasks(job_id)",
    "CREATE INDEX IF NOT EXISTS idx_task_dependencies_dependency_id ON task_dependencies(dependency_id)",
    "CREATE INDEX IF NOT EXISTS idx_job_run_log_batch_id ON job_run_log(batch_id)",
    "CREATE INDEX IF NOT EXISTS idx_task_run_log_batch_id ON task_run_log(batch_id)",
];

/// SQLite连接池及表结构初始化
pub struct DatabaseManager {
    pool: SqlitePool,
}

impl DatabaseManager {
    pub async fn new(config: &DatabaseConfig) -> SchedulerResult<Self> {
        debug!("连接SQLite数据库: {}", config.url);

        let connect_options = SqliteConnectOptions::from_str(&config.url)?
            .create_if_missing(config.create_if_missing)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(connect_options)
            .await?;

        let manager = Self { pool };
        manager.migrate().await?;
        Ok(manager)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// 创建缺失的表和索引
    pub async fn migrate(&self) -> SchedulerResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        info!("SQLite表结构检查完成");
        Ok(())
    }

    pub async fn health_check(&self) -> SchedulerResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub fn metadata_store(&self) -> SqliteMetadataStore {
        SqliteMetadataStore::new(self.pool.clone())
    }

    pub fn exec_log_store(&self) -> SqliteExecLogStore {
        SqliteExecLogStore::new(self.pool.clone())
    }
}

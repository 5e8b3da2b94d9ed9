use std::sync::Arc;
use std::time::Duration;

use batch_core::config::{DatabaseConfig, DispatcherConfig};
use batch_core::models::{ExecState, Job, Schedule, Task, TaskType};
use batch_core::traits::{ExecLogStore, MetadataStore};
use batch_dispatcher::{CronTriggerResolver, DispatcherContext, ScheduleManager};
use batch_infrastructure::{DatabaseManager, HttpWorkerClient};
use batch_worker::{ShellExecutor, WorkerServer};
use sqlx::Row;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

async fn start_worker() -> (String, oneshot::Sender<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    let (tx, rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        WorkerServer::new(Arc::new(ShellExecutor::default()))
            .serve(listener, async {
                let _ = rx.await;
            })
            .await
            .unwrap();
    });
    (address, tx)
}

async fn database(dir: &tempfile::TempDir) -> DatabaseManager {
    let config = DatabaseConfig {
        url: format!("sqlite://{}", dir.path().join("e2e.db").display()),
        max_connections: 4,
        create_if_missing: true,
    };
    DatabaseManager::new(&config).await.unwrap()
}

fn manager_for(db: &DatabaseManager, config: DispatcherConfig) -> ScheduleManager {
    let ctx = DispatcherContext::new(
        config,
        Arc::new(db.metadata_store()),
        Arc::new(db.exec_log_store()),
        Arc::new(CronTriggerResolver::new()),
        Arc::new(HttpWorkerClient::new(Duration::from_secs(2)).unwrap()),
    );
    ScheduleManager::new(ctx)
}

/// 轮询直到出现指定状态的调度批次
async fn wait_for_batch(db: &DatabaseManager, state: ExecState) -> Option<String> {
    for _ in 0..100 {
        let row = sqlx::query(
            "SELECT batch_id FROM schedule_run_log WHERE state = $1 ORDER BY batch_id LIMIT 1",
        )
        .bind(i64::from(state.as_i8()))
        .fetch_optional(db.pool())
        .await
        .unwrap();
        if let Some(row) = row {
            return Some(row.get::<String, _>("batch_id"));
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    None
}

#[tokio::test]
async fn test_timed_task_and_dependent_run_through_worker() {
    let dir = tempfile::tempdir().unwrap();
    let db = database(&dir).await;
    let (worker_address, stop_worker) = start_worker().await;

    let metadata = db.metadata_store();
    let schedule = metadata
        .create_schedule(&Schedule::new("every_second", "ss"))
        .await
        .unwrap();
    let job = metadata
        .create_job(&Job::new(schedule.id, "load"))
        .await
        .unwrap();

    let mut extract = Task::new(job.id, "extract", "echo extracted");
    extract.address = worker_address.clone();
    extract.cycle = "ss".to_string();
    let extract = metadata.create_task(&extract).await.unwrap();

    let mut report = Task::new(job.id, "report", "echo $BATCH_ATTR_GREETING");
    report.address = worker_address.clone();
    report.task_type = TaskType::Dependent;
    report
        .attributes
        .insert("greeting".to_string(), "hello".to_string());
    let report = metadata.create_task(&report).await.unwrap();
    metadata
        .add_task_dependency(report.id, extract.id)
        .await
        .unwrap();

    let manager = manager_for(&db, DispatcherConfig::default());
    assert_eq!(manager.start().await.unwrap(), 1);

    let finished = wait_for_batch(&db, ExecState::Done).await;
    manager.shutdown().await;
    let batch_id = finished.expect("no batch finished");

    let logs = db.exec_log_store();
    let runs = logs.task_runs(&batch_id).await.unwrap();
    assert_eq!(runs.len(), 2);

    let extract_run = runs.iter().find(|r| r.task_id == extract.id).unwrap();
    assert_eq!(extract_run.state, ExecState::Done);
    assert_eq!(extract_run.stdout, "extracted\n");

    let report_run = runs.iter().find(|r| r.task_id == report.id).unwrap();
    assert_eq!(report_run.state, ExecState::Done);
    assert_eq!(report_run.stdout, "hello\n");

    let run = logs.schedule_run(&batch_id).await.unwrap().unwrap();
    assert_eq!(run.task_total, 2);
    assert_eq!(run.result, 1.0);

    let _ = stop_worker.send(());
    db.close().await;
}

#[tokio::test]
async fn test_manual_trigger_records_failure() {
    let dir = tempfile::tempdir().unwrap();
    let db = database(&dir).await;
    let (worker_address, stop_worker) = start_worker().await;

    let metadata = db.metadata_store();
    let schedule = metadata
        .create_schedule(&Schedule::new("yearly", "y"))
        .await
        .unwrap();
    let job = metadata
        .create_job(&Job::new(schedule.id, "only"))
        .await
        .unwrap();
    let mut failing = Task::new(job.id, "broken", "echo oops >&2; exit 2");
    failing.address = worker_address;
    failing.cycle = "y".to_string();
    let failing = metadata.create_task(&failing).await.unwrap();

    let manager = manager_for(
        &db,
        DispatcherConfig {
            retry_backoff_ms: 10,
            ..DispatcherConfig::default()
        },
    );
    manager.start().await.unwrap();
    manager.trigger_task(failing.id).await.unwrap();

    let aborted = wait_for_batch(&db, ExecState::Aborted).await;
    manager.shutdown().await;
    let batch_id = aborted.expect("batch did not abort");

    let runs = db.exec_log_store().task_runs(&batch_id).await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].state, ExecState::Aborted);
    assert_eq!(runs[0].stderr, "oops\n");
    assert!(runs[0].error.starts_with("error: "));

    let _ = stop_worker.send(());
    db.close().await;
}

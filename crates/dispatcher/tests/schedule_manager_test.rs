use std::sync::Arc;
use std::time::Duration;

use batch_core::config::DispatcherConfig;
use batch_core::models::{ExecState, ExecType, Job, Schedule, Task, TaskRunLog};
use batch_core::traits::{ExecLogStore, MetadataStore};
use batch_core::SchedulerError;
use batch_dispatcher::batch::ExecSchedule;
use batch_dispatcher::context::DispatcherContext;
use batch_dispatcher::cron_utils::CronTriggerResolver;
use batch_dispatcher::manager::ScheduleManager;
use batch_dispatcher::restore::RestoreOutcome;
use batch_testing_utils::*;

struct Fixture {
    manager: ScheduleManager,
    metadata: MockMetadataStore,
    logs: MockExecLogStore,
    worker: ScriptedWorkerClient,
}

/// 年度周期的任务在测试期间不会自动触发
fn yearly_schedule() -> Schedule {
    ScheduleBuilder::new(1)
        .with_cycle("y")
        .with_job(JobBuilder::new(10, 1).build())
        .with_job(JobBuilder::new(20, 1).build())
        .with_task(TaskBuilder::new(100, 10).with_cycle("y").build())
        .with_task(TaskBuilder::new(101, 10).with_cycle("y").after(&[100]).build())
        .with_task(TaskBuilder::new(200, 20).with_cycle("y").after(&[101]).build())
        .build()
}

async fn fixture(schedule: Schedule) -> Fixture {
    let metadata = MockMetadataStore::with_schedule(schedule);
    let logs = MockExecLogStore::new();
    let worker = ScriptedWorkerClient::new();
    let ctx = DispatcherContext::new(
        DispatcherConfig::default(),
        Arc::new(metadata.clone()),
        Arc::new(logs.clone()),
        Arc::new(CronTriggerResolver::new()),
        Arc::new(worker.clone()),
    );
    let manager = ScheduleManager::new(ctx);
    manager.start().await.unwrap();
    Fixture {
        manager,
        metadata,
        logs,
        worker,
    }
}

#[tokio::test]
async fn test_start_loads_schedules_with_next_runs() {
    let f = fixture(yearly_schedule()).await;

    let snapshot = f.manager.get_schedule(1).await.unwrap();
    assert_eq!(snapshot.job_count(), 2);
    assert_eq!(snapshot.task_count(), 3);
    assert!(snapshot.tasks.iter().all(|t| t.next_run_at.is_some()));
    assert!(snapshot.next_start.is_some());

    let all = f.manager.list_schedules().await.unwrap();
    assert_eq!(all.len(), 1);
    f.manager.shutdown().await;
}

#[tokio::test]
async fn test_create_schedule_rejects_unknown_cycle() {
    let f = fixture(yearly_schedule()).await;

    let err = f
        .manager
        .create_schedule(Schedule::new("bad", "fortnight"))
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::InvalidCycle(_)));

    let created = f
        .manager
        .create_schedule(Schedule::new("nightly", "d"))
        .await
        .unwrap();
    assert!(f.manager.get_schedule(created.id).await.is_ok());
    f.manager.shutdown().await;
}

#[tokio::test]
async fn test_dependency_cycle_is_rejected() {
    let f = fixture(yearly_schedule()).await;

    let err = f.manager.add_task_dependency(100, 200).await.unwrap_err();
    assert!(matches!(err, SchedulerError::CircularDependency));

    let err = f.manager.add_task_dependency(100, 100).await.unwrap_err();
    assert!(matches!(err, SchedulerError::CircularDependency));

    let err = f.manager.add_task_dependency(100, 999).await.unwrap_err();
    assert!(matches!(err, SchedulerError::DependencyNotFound { .. }));

    f.manager.add_task_dependency(200, 100).await.unwrap();
    f.manager.add_task_dependency(200, 100).await.unwrap();
    let edges = f.metadata.edges();
    assert_eq!(edges.iter().filter(|e| **e == (200, 100)).count(), 1);
    f.manager.shutdown().await;
}

#[tokio::test]
async fn test_delete_job_only_allows_empty_tail() {
    let f = fixture(yearly_schedule()).await;

    let err = f.manager.delete_job(10).await.unwrap_err();
    assert!(matches!(err, SchedulerError::JobNotDeletable { id: 10, .. }));

    let err = f.manager.delete_job(20).await.unwrap_err();
    assert!(matches!(err, SchedulerError::JobNotDeletable { id: 20, .. }));

    let tail = f.manager.add_job(Job::new(1, "cleanup")).await.unwrap();
    let prev = f.metadata.get_job(20).await.unwrap().unwrap();
    assert_eq!(prev.next_job_id, Some(tail.id));
    assert_eq!(tail.prev_job_id, Some(20));

    f.manager.delete_job(tail.id).await.unwrap();
    let prev = f.metadata.get_job(20).await.unwrap().unwrap();
    assert_eq!(prev.next_job_id, None);

    let snapshot = f.manager.get_schedule(1).await.unwrap();
    assert_eq!(snapshot.job_count(), 2);
    f.manager.shutdown().await;
}

#[tokio::test]
async fn test_add_task_collapses_repeated_dependencies() {
    let f = fixture(yearly_schedule()).await;

    let mut task = Task::new(20, "fan_in", "echo fan_in");
    task.cycle = "y".to_string();
    task.dependencies = vec![200, 101, 200];
    let created = f.manager.add_task(task).await.unwrap();
    assert_eq!(created.dependencies, vec![101, 200]);

    let stored = f.metadata.get_task(created.id).await.unwrap().unwrap();
    assert_eq!(stored.dependencies, vec![101, 200]);
    f.manager.shutdown().await;
}

#[tokio::test]
async fn test_add_task_validates_and_reaches_schedule_loop() {
    let f = fixture(yearly_schedule()).await;

    let mut bad = Task::new(20, "bad_cron", "echo");
    bad.cron = "not a cron".to_string();
    let err = f.manager.add_task(bad).await.unwrap_err();
    assert!(matches!(err, SchedulerError::InvalidCron { .. }));

    let err = f
        .manager
        .add_task(Task::new(999, "orphan", "echo"))
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::JobNotFound { id: 999 }));

    let mut task = Task::new(20, "report", "echo report");
    task.cycle = "y".to_string();
    task.dependencies = vec![200];
    let created = f.manager.add_task(task).await.unwrap();
    assert_eq!(created.dependencies, vec![200]);
    let created_id = created.id;

    let manager = &f.manager;
    let visible = TestEnv::wait_for(
        || async move {
            manager
                .get_schedule(1)
                .await
                .map(|s| s.task(created_id).is_some())
                .unwrap_or(false)
        },
        Duration::from_secs(2),
    )
    .await;
    assert!(visible);

    f.manager.delete_task(created_id).await.unwrap();
    let gone = TestEnv::wait_for(
        || async move {
            manager
                .get_schedule(1)
                .await
                .map(|s| s.task(created_id).is_none())
                .unwrap_or(false)
        },
        Duration::from_secs(2),
    )
    .await;
    assert!(gone);
    f.manager.shutdown().await;
}

#[tokio::test]
async fn test_trigger_task_runs_manual_batch() {
    let f = fixture(yearly_schedule()).await;

    f.manager.trigger_task(100).await.unwrap();

    let logs = &f.logs;
    let finished = TestEnv::wait_for(
        || async move {
            logs.schedule_runs()
                .iter()
                .any(|r| r.state == ExecState::Done)
        },
        Duration::from_secs(3),
    )
    .await;
    assert!(finished);

    let runs = f.logs.schedule_runs();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].exec_type, ExecType::Manual);
    assert_eq!(runs[0].task_total, 1);
    assert_eq!(f.worker.calls_for(100).len(), 1);
    assert!(f.worker.calls_for(101).is_empty());

    let err = f.manager.trigger_task(12345).await.unwrap_err();
    assert!(matches!(err, SchedulerError::TaskNotFound { .. }));
    f.manager.shutdown().await;
}

#[tokio::test]
async fn test_pause_unknown_batch_is_reported() {
    let f = fixture(yearly_schedule()).await;

    let err = f.manager.pause_batch(1, "1.0").await.unwrap_err();
    assert!(matches!(err, SchedulerError::BatchNotFound { .. }));
    assert!(f.manager.live_batches(1).await.unwrap().is_empty());
    f.manager.shutdown().await;
}

#[tokio::test]
async fn test_restore_batch_from_logs() {
    let f = fixture(yearly_schedule()).await;
    let batch_id = ExecSchedule::batch_id_for(1, TestEnv::activation());

    for (task_id, job_id, state) in [
        (100, 10, ExecState::Done),
        (101, 10, ExecState::Aborted),
        (200, 20, ExecState::Blocked),
    ] {
        f.logs.seed_task_run(TaskRunLog {
            batch_task_id: format!("{batch_id}.{job_id}.{task_id}"),
            batch_job_id: format!("{batch_id}.{job_id}"),
            batch_id: batch_id.clone(),
            task_id,
            exec_type: ExecType::Auto,
            state,
            start_time: None,
            end_time: None,
            result: 0.0,
            stdout: String::new(),
            stderr: String::new(),
            error: String::new(),
        });
    }

    let outcome = f.manager.restore_batch(1, &batch_id).await.unwrap();
    assert_eq!(
        outcome,
        RestoreOutcome::Resumed {
            batch_id: batch_id.clone(),
            skipped: 1,
            remaining: 2,
        }
    );

    let logs = &f.logs;
    let id = batch_id.clone();
    let finished = TestEnv::wait_for(
        || {
            let id = id.clone();
            async move {
                matches!(
                    logs.schedule_run(&id).await,
                    Ok(Some(run)) if run.state == ExecState::Done
                )
            }
        },
        Duration::from_secs(3),
    )
    .await;
    assert!(finished);
    assert!(f.worker.calls_for(100).is_empty());
    assert_eq!(f.worker.calls_for(101).len(), 1);
    assert_eq!(f.worker.calls_for(200).len(), 1);

    let manager = &f.manager;
    let retired = TestEnv::wait_for(
        || async move {
            manager
                .live_batches(1)
                .await
                .map(|b| b.is_empty())
                .unwrap_or(false)
        },
        Duration::from_secs(2),
    )
    .await;
    assert!(retired);

    let again = f.manager.restore_batch(1, &batch_id).await.unwrap();
    assert_eq!(again, RestoreOutcome::AlreadyComplete { batch_id });
    assert_eq!(f.worker.call_count(), 2);
    f.manager.shutdown().await;
}

#[tokio::test]
async fn test_reload_failure_keeps_previous_definition() {
    let f = fixture(yearly_schedule()).await;

    let mut job = f.metadata.get_job(10).await.unwrap().unwrap();
    job.name = "renamed".to_string();
    f.metadata.fail_loads(true);
    assert!(f.manager.update_job(&job).await.is_err());

    let snapshot = f.manager.get_schedule(1).await.unwrap();
    assert_eq!(snapshot.task_count(), 3);
    assert_eq!(snapshot.job(10).unwrap().name, "job_10");
    f.manager.shutdown().await;
}

#[tokio::test]
async fn test_delete_schedule_removes_definitions() {
    let f = fixture(yearly_schedule()).await;

    f.manager.delete_schedule(1).await.unwrap();

    assert_eq!(f.metadata.task_count(), 0);
    assert_eq!(f.metadata.job_count(), 0);
    assert!(f.metadata.edges().is_empty());
    let err = f.manager.get_schedule(1).await.unwrap_err();
    assert!(matches!(err, SchedulerError::ScheduleNotFound { id: 1 }));
}

#[tokio::test(start_paused = true)]
async fn test_timer_fires_dependent_chain() {
    let schedule = ScheduleBuilder::new(7)
        .with_job(JobBuilder::new(1, 7).build())
        .with_task(TaskBuilder::new(1, 1).with_cycle("ss").build())
        .with_task(TaskBuilder::new(2, 1).depends_on(&[1]).build())
        .build();
    let f = fixture(schedule).await;

    let logs = &f.logs;
    let finished = TestEnv::wait_for(
        || async move {
            logs.schedule_runs()
                .iter()
                .any(|r| r.state == ExecState::Done && r.task_total == 2)
        },
        Duration::from_secs(5),
    )
    .await;
    assert!(finished);

    let order: Vec<i64> = f.worker.calls().iter().map(|c| c.task_id).take(2).collect();
    assert_eq!(order, vec![1, 2]);
    f.manager.shutdown().await;
}

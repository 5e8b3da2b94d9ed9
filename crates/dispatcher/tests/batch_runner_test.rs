use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;

use batch_core::config::DispatcherConfig;
use batch_core::models::{ExecState, ExecType, Schedule, Task};
use batch_core::traits::ExecLogStore;
use batch_dispatcher::batch::{BatchCommand, BatchRunner, ExecSchedule};
use batch_dispatcher::context::DispatcherContext;
use batch_dispatcher::cron_utils::CronTriggerResolver;
use batch_dispatcher::restore::{prepare_restore, RestorePlan};
use batch_testing_utils::*;

fn context(
    worker: &ScriptedWorkerClient,
    config: DispatcherConfig,
) -> (Arc<DispatcherContext>, MockExecLogStore) {
    let logs = MockExecLogStore::new();
    let ctx = DispatcherContext::new(
        config,
        Arc::new(MockMetadataStore::new()),
        Arc::new(logs.clone()),
        Arc::new(CronTriggerResolver::new()),
        Arc::new(worker.clone()),
    );
    (ctx, logs)
}

fn schedule(tasks: Vec<Task>) -> Schedule {
    let activation = TestEnv::activation();
    ScheduleBuilder::new(1)
        .with_job(JobBuilder::new(1, 1).build())
        .with_tasks(tasks.into_iter().map(|mut t| {
            t.next_run_at = Some(activation);
            t
        }))
        .build()
}

async fn run_batch(schedule: &Schedule, ctx: &Arc<DispatcherContext>) -> batch_dispatcher::BatchReport {
    let exec = ExecSchedule::build(schedule, TestEnv::activation(), ExecType::Auto);
    let (runner, _commands) = BatchRunner::new(exec, ctx.clone());
    runner.run().await
}

#[tokio::test]
async fn test_acyclic_batch_converges_in_dependency_order() {
    let worker = ScriptedWorkerClient::new();
    let (ctx, logs) = context(&worker, DispatcherConfig::default());
    let s = schedule(vec![
        TaskBuilder::new(1, 1).build(),
        TaskBuilder::new(2, 1).after(&[1]).build(),
        TaskBuilder::new(3, 1).after(&[2]).build(),
        TaskBuilder::new(4, 1).build(),
    ]);

    let report = run_batch(&s, &ctx).await;

    assert_eq!(report.state, ExecState::Done);
    assert_eq!(report.total, 4);
    assert_eq!(report.succeeded, 4);
    assert_eq!(report.result, 1.0);
    assert!(report.task_states.values().all(|s| *s == ExecState::Done));

    let order: Vec<i64> = worker.calls().iter().map(|c| c.task_id).collect();
    let position = |id: i64| order.iter().position(|t| *t == id).unwrap();
    assert!(position(1) < position(2));
    assert!(position(2) < position(3));
    assert_eq!(order.len(), 4);

    let run = logs.schedule_run(&report.batch_id).await.unwrap().unwrap();
    assert_eq!(run.state, ExecState::Done);
    assert_eq!(run.task_total, 4);
    let jobs = logs.job_runs(&report.batch_id);
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].state, ExecState::Done);
    assert_eq!(jobs[0].result, 1.0);
}

#[tokio::test]
async fn test_worker_address_gets_default_port() {
    let worker = ScriptedWorkerClient::new();
    let (ctx, _logs) = context(&worker, DispatcherConfig::default());
    let s = schedule(vec![
        TaskBuilder::new(1, 1).with_address("10.0.0.5").build(),
        TaskBuilder::new(2, 1).with_address("10.0.0.6:9000").build(),
    ]);

    run_batch(&s, &ctx).await;

    assert_eq!(worker.calls_for(1)[0].address, "10.0.0.5:3128");
    assert_eq!(worker.calls_for(2)[0].address, "10.0.0.6:9000");
}

#[tokio::test]
async fn test_aborted_upstream_blocks_downstream_without_dispatch() {
    let worker = ScriptedWorkerClient::new();
    worker.script_task(1, WorkerBehavior::Fail("exit status 1".to_string()));
    let (ctx, logs) = context(&worker, DispatcherConfig::default());
    let s = schedule(vec![
        TaskBuilder::new(1, 1).build(),
        TaskBuilder::new(2, 1).after(&[1]).build(),
        TaskBuilder::new(3, 1).after(&[2]).build(),
    ]);

    let report = run_batch(&s, &ctx).await;

    assert_eq!(report.task_states[&1], ExecState::Aborted);
    assert_eq!(report.task_states[&2], ExecState::Blocked);
    assert_eq!(report.task_states[&3], ExecState::Blocked);
    assert!(worker.calls_for(2).is_empty());
    assert!(worker.calls_for(3).is_empty());
    assert_eq!(report.state, ExecState::Aborted);
    assert_eq!(report.result, 0.0);

    let t1 = logs.task_run(&format!("{}.1.1", report.batch_id)).unwrap();
    assert_eq!(t1.error, "exit status 1");
    let t2 = logs.task_run(&format!("{}.1.2", report.batch_id)).unwrap();
    assert_eq!(t2.state, ExecState::Blocked);
}

#[tokio::test]
async fn test_partial_failure_result_ratio() {
    let worker = ScriptedWorkerClient::new();
    worker.script_task(2, WorkerBehavior::Fail("boom".to_string()));
    let (ctx, _logs) = context(&worker, DispatcherConfig::default());
    let s = schedule(vec![
        TaskBuilder::new(1, 1).build(),
        TaskBuilder::new(2, 1).build(),
        TaskBuilder::new(3, 1).build(),
        TaskBuilder::new(4, 1).build(),
    ]);

    let report = run_batch(&s, &ctx).await;

    assert_eq!(report.succeeded, 3);
    assert_eq!(report.failed, 1);
    assert_eq!(report.result, 0.75);
    assert_eq!(report.state, ExecState::Aborted);
}

#[tokio::test(start_paused = true)]
async fn test_refused_worker_is_retried_with_fixed_backoff() {
    let worker = ScriptedWorkerClient::with_default(WorkerBehavior::Refuse);
    let (ctx, logs) = context(&worker, DispatcherConfig::default());
    let s = schedule(vec![TaskBuilder::new(1, 1).with_retry(3).build()]);

    let report = run_batch(&s, &ctx).await;

    let calls = worker.calls_for(1);
    assert_eq!(calls.len(), 3);
    for pair in calls.windows(2) {
        assert!(pair[1].at.duration_since(pair[0].at) >= Duration::from_millis(500));
    }
    assert_eq!(report.task_states[&1], ExecState::Aborted);

    let log = logs.task_run(&format!("{}.1.1", report.batch_id)).unwrap();
    assert!(log.error.contains("connection refused"));
}

#[tokio::test(start_paused = true)]
async fn test_zero_retry_still_attempts_once() {
    let worker = ScriptedWorkerClient::with_default(WorkerBehavior::Refuse);
    let (ctx, _logs) = context(&worker, DispatcherConfig::default());
    let s = schedule(vec![TaskBuilder::new(1, 1).with_retry(0).build()]);

    run_batch(&s, &ctx).await;

    assert_eq!(worker.calls_for(1).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_pause_blocks_pending_and_lets_in_flight_finish() {
    let worker = ScriptedWorkerClient::new();
    let slow = WorkerBehavior::delayed(Duration::from_secs(10), WorkerBehavior::Succeed("ok".into()));
    worker.script_task(1, slow.clone());
    worker.script_task(2, slow);
    let (ctx, _logs) = context(&worker, DispatcherConfig::default());

    let mut tasks = vec![TaskBuilder::new(1, 1).build(), TaskBuilder::new(2, 1).build()];
    for id in 3..=7 {
        tasks.push(TaskBuilder::new(id, 1).after(&[1]).build());
    }
    let s = schedule(tasks);

    let exec = ExecSchedule::build(&s, TestEnv::activation(), ExecType::Auto);
    let (runner, commands) = BatchRunner::new(exec, ctx.clone());
    let (reply, paused) = oneshot::channel();
    commands
        .send(BatchCommand::Pause { reply: Some(reply) })
        .unwrap();

    let report = runner.run().await;

    assert_eq!(paused.await.unwrap().unwrap(), 5);
    assert_eq!(report.task_states[&1], ExecState::Done);
    assert_eq!(report.task_states[&2], ExecState::Done);
    for id in 3..=7 {
        assert_eq!(report.task_states[&id], ExecState::Blocked);
        assert!(worker.calls_for(id).is_empty());
    }
    assert_eq!(worker.call_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_dispatch_limit() {
    let worker = ScriptedWorkerClient::with_default(WorkerBehavior::delayed(
        Duration::from_secs(1),
        WorkerBehavior::Succeed("ok".into()),
    ));
    let config = DispatcherConfig {
        max_concurrent_dispatches: 2,
        ..DispatcherConfig::default()
    };
    let (ctx, _logs) = context(&worker, config);
    let s = schedule((1..=6).map(|id| TaskBuilder::new(id, 1).build()).collect());

    let report = run_batch(&s, &ctx).await;

    assert_eq!(report.succeeded, 6);
    assert_eq!(worker.max_in_flight(), 2);
}

#[tokio::test]
async fn test_panicking_execution_unit_becomes_aborted() {
    let worker = ScriptedWorkerClient::new();
    worker.script_task(1, WorkerBehavior::Panic);
    let (ctx, logs) = context(&worker, DispatcherConfig::default());
    let s = schedule(vec![
        TaskBuilder::new(1, 1).build(),
        TaskBuilder::new(2, 1).after(&[1]).build(),
        TaskBuilder::new(3, 1).build(),
    ]);

    let report = run_batch(&s, &ctx).await;

    assert_eq!(report.task_states[&1], ExecState::Aborted);
    assert_eq!(report.task_states[&2], ExecState::Blocked);
    assert_eq!(report.task_states[&3], ExecState::Done);
    let log = logs.task_run(&format!("{}.1.1", report.batch_id)).unwrap();
    assert!(log.error.contains("scripted worker panic"));
    assert_eq!(ctx.metrics.dispatches_in_flight(), 0);
}

#[tokio::test]
async fn test_log_store_failures_do_not_stop_batch() {
    let worker = ScriptedWorkerClient::new();
    let (ctx, logs) = context(&worker, DispatcherConfig::default());
    logs.fail_writes(true);
    let s = schedule(vec![
        TaskBuilder::new(1, 1).build(),
        TaskBuilder::new(2, 1).after(&[1]).build(),
    ]);

    let report = run_batch(&s, &ctx).await;

    assert_eq!(report.state, ExecState::Done);
    assert_eq!(worker.call_count(), 2);
}

#[tokio::test]
async fn test_inserted_task_waits_for_live_upstream() {
    let worker = ScriptedWorkerClient::new();
    let (ctx, _logs) = context(&worker, DispatcherConfig::default());
    let s = schedule(vec![TaskBuilder::new(1, 1).build()]);

    let exec = ExecSchedule::build(&s, TestEnv::activation(), ExecType::Auto);
    let (runner, commands) = BatchRunner::new(exec, ctx.clone());
    commands
        .send(BatchCommand::Insert {
            tasks: vec![TaskBuilder::new(2, 1).depends_on(&[1]).build()],
        })
        .unwrap();

    let report = runner.run().await;

    assert_eq!(report.total, 2);
    assert_eq!(report.task_states[&2], ExecState::Done);
    let order: Vec<i64> = worker.calls().iter().map(|c| c.task_id).collect();
    assert_eq!(order, vec![1, 2]);
}

#[tokio::test(start_paused = true)]
async fn test_inserted_task_after_failed_upstream_is_never_dispatched() {
    let worker = ScriptedWorkerClient::new();
    worker.script_task(1, WorkerBehavior::Fail("boom".to_string()));
    worker.script_task(
        2,
        WorkerBehavior::delayed(Duration::from_secs(10), WorkerBehavior::Succeed("ok".into())),
    );
    let (ctx, _logs) = context(&worker, DispatcherConfig::default());
    let s = schedule(vec![TaskBuilder::new(1, 1).build(), TaskBuilder::new(2, 1).build()]);

    let exec = ExecSchedule::build(&s, TestEnv::activation(), ExecType::Auto);
    let (runner, commands) = BatchRunner::new(exec, ctx.clone());
    let handle = tokio::spawn(runner.run());

    // 任务1已失败，任务2仍在执行
    tokio::time::sleep(Duration::from_secs(2)).await;
    commands
        .send(BatchCommand::Insert {
            tasks: vec![TaskBuilder::new(5, 1).depends_on(&[1]).build()],
        })
        .unwrap();

    let report = handle.await.unwrap();

    assert_eq!(report.task_states[&1], ExecState::Aborted);
    assert_eq!(report.task_states[&2], ExecState::Done);
    assert_eq!(report.task_states[&5], ExecState::Blocked);
    assert!(worker.calls_for(5).is_empty());
    assert_eq!(report.total, 3);
    assert_eq!(report.failed, 2);
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_address_only_fails_its_tasks() {
    let worker = ScriptedWorkerClient::new();
    worker.script_address("down-host:3128", WorkerBehavior::Refuse);
    let (ctx, _logs) = context(&worker, DispatcherConfig::default());
    let s = schedule(vec![
        TaskBuilder::new(1, 1).with_address("down-host").build(),
        TaskBuilder::new(2, 1).with_address("up-host:4000").build(),
    ]);

    let report = run_batch(&s, &ctx).await;

    assert_eq!(report.task_states[&1], ExecState::Aborted);
    assert_eq!(report.task_states[&2], ExecState::Done);
    assert_eq!(worker.calls_for(1)[0].address, "down-host:3128");
    assert_eq!(worker.calls_for(2)[0].address, "up-host:4000");
}

#[tokio::test]
async fn test_restore_runs_only_unsucceeded_tasks_and_is_idempotent() {
    let worker = ScriptedWorkerClient::new();
    worker.script_task(2, WorkerBehavior::Fail("disk full".to_string()));
    let (ctx, logs) = context(&worker, DispatcherConfig::default());
    let s = schedule(vec![
        TaskBuilder::new(1, 1).build(),
        TaskBuilder::new(2, 1).after(&[1]).build(),
        TaskBuilder::new(3, 1).after(&[2]).build(),
    ]);

    let first = run_batch(&s, &ctx).await;
    assert_eq!(first.task_states[&2], ExecState::Aborted);
    assert_eq!(first.task_states[&3], ExecState::Blocked);

    worker.script_task(2, WorkerBehavior::Succeed("ok".to_string()));
    let calls_before = worker.call_count();

    let RestorePlan::Resume { exec, skipped } =
        prepare_restore(&ctx, &s, &first.batch_id).await.unwrap()
    else {
        panic!("expected a resumable batch");
    };
    assert_eq!(skipped, 1);
    assert_eq!(exec.remaining, 2);
    assert_eq!(exec.exec_type, ExecType::Repair);

    let (runner, _commands) = BatchRunner::new(exec, ctx.clone());
    let repaired = runner.run().await;
    assert_eq!(repaired.batch_id, first.batch_id);
    assert_eq!(repaired.state, ExecState::Done);
    assert_eq!(repaired.result, 1.0);
    assert_eq!(worker.call_count() - calls_before, 2);
    assert!(worker.calls_for(1).len() == 1);

    let run = logs.schedule_run(&first.batch_id).await.unwrap().unwrap();
    assert_eq!(run.exec_type, ExecType::Repair);
    assert_eq!(run.task_succeeded, 3);

    let calls_after = worker.call_count();
    let plan = prepare_restore(&ctx, &s, &first.batch_id).await.unwrap();
    assert!(matches!(plan, RestorePlan::AlreadyComplete));
    assert_eq!(worker.call_count(), calls_after);
}

#[tokio::test]
async fn test_restore_rejects_foreign_batch_id() {
    let worker = ScriptedWorkerClient::new();
    let (ctx, _logs) = context(&worker, DispatcherConfig::default());
    let s = schedule(vec![TaskBuilder::new(1, 1).build()]);

    let foreign = ExecSchedule::batch_id_for(99, TestEnv::activation());
    assert!(prepare_restore(&ctx, &s, &foreign).await.is_err());
    assert!(prepare_restore(&ctx, &s, "not-a-batch").await.is_err());
}

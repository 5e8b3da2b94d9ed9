//! 存储与Worker调用的内存Mock实现
//!
//! 无需数据库和网络即可驱动调度引擎的单元测试与集成测试。

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use batch_core::{
    models::{Job, JobRunLog, Reply, Schedule, ScheduleRunLog, Task, TaskPayload, TaskRunLog},
    traits::{ExecLogStore, MetadataStore, WorkerClient},
    SchedulerError, SchedulerResult,
};

#[derive(Debug, Default)]
struct MetadataState {
    schedules: HashMap<i64, Schedule>,
    jobs: HashMap<i64, Job>,
    tasks: HashMap<i64, Task>,
    edges: BTreeSet<(i64, i64)>,
    next_id: i64,
}

impl MetadataState {
    fn allocate(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn bump(&mut self, id: i64) {
        if id > self.next_id {
            self.next_id = id;
        }
    }

    fn hydrate_job(&self, job: &Job) -> Job {
        let mut job = job.clone();
        job.task_ids = self
            .tasks
            .values()
            .filter(|t| t.job_id == job.id)
            .map(|t| t.id)
            .collect();
        job
    }

    fn hydrate_task(&self, task: &Task) -> Task {
        let mut task = task.clone();
        task.dependencies = self
            .edges
            .iter()
            .filter(|(from, _)| *from == task.id)
            .map(|(_, to)| *to)
            .collect();
        task
    }
}

/// 元数据存储的内存实现
#[derive(Debug, Clone, Default)]
pub struct MockMetadataStore {
    state: Arc<Mutex<MetadataState>>,
    fail_loads: Arc<AtomicBool>,
}

impl MockMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 按原ID写入完整调度（作业、任务及依赖边）
    pub fn with_schedule(schedule: Schedule) -> Self {
        let store = Self::new();
        store.insert_schedule(schedule);
        store
    }

    pub fn insert_schedule(&self, schedule: Schedule) {
        let mut state = self.state.lock().unwrap();
        state.bump(schedule.id);
        for job in &schedule.jobs {
            state.bump(job.id);
            state.jobs.insert(job.id, job.clone());
        }
        for task in &schedule.tasks {
            state.bump(task.id);
            for dep in &task.dependencies {
                state.edges.insert((task.id, *dep));
            }
            state.tasks.insert(task.id, task.clone());
        }
        let mut shallow = schedule;
        shallow.jobs.clear();
        shallow.tasks.clear();
        state.schedules.insert(shallow.id, shallow);
    }

    /// 之后的 `get_schedule` 返回存储错误
    pub fn fail_loads(&self, fail: bool) {
        self.fail_loads.store(fail, Ordering::SeqCst);
    }

    pub fn task_count(&self) -> usize {
        self.state.lock().unwrap().tasks.len()
    }

    pub fn job_count(&self) -> usize {
        self.state.lock().unwrap().jobs.len()
    }

    pub fn edges(&self) -> Vec<(i64, i64)> {
        self.state.lock().unwrap().edges.iter().copied().collect()
    }
}

#[async_trait]
impl MetadataStore for MockMetadataStore {
    async fn create_schedule(&self, schedule: &Schedule) -> SchedulerResult<Schedule> {
        let mut state = self.state.lock().unwrap();
        let mut created = schedule.clone();
        created.id = state.allocate();
        created.jobs.clear();
        created.tasks.clear();
        state.schedules.insert(created.id, created.clone());
        Ok(created)
    }

    async fn get_schedule(&self, id: i64) -> SchedulerResult<Option<Schedule>> {
        if self.fail_loads.load(Ordering::SeqCst) {
            return Err(SchedulerError::DatabaseOperation(
                "mock metadata store unavailable".to_string(),
            ));
        }
        Ok(self.state.lock().unwrap().schedules.get(&id).cloned())
    }

    async fn update_schedule(&self, schedule: &Schedule) -> SchedulerResult<()> {
        let mut state = self.state.lock().unwrap();
        let Some(existing) = state.schedules.get_mut(&schedule.id) else {
            return Err(SchedulerError::ScheduleNotFound { id: schedule.id });
        };
        let mut shallow = schedule.clone();
        shallow.jobs.clear();
        shallow.tasks.clear();
        *existing = shallow;
        Ok(())
    }

    async fn delete_schedule(&self, id: i64) -> SchedulerResult<()> {
        self.state.lock().unwrap().schedules.remove(&id);
        Ok(())
    }

    async fn list_schedules(&self) -> SchedulerResult<Vec<Schedule>> {
        let state = self.state.lock().unwrap();
        let mut schedules: Vec<Schedule> = state.schedules.values().cloned().collect();
        schedules.sort_by_key(|s| s.id);
        Ok(schedules)
    }

    async fn create_job(&self, job: &Job) -> SchedulerResult<Job> {
        let mut state = self.state.lock().unwrap();
        let mut created = job.clone();
        created.id = state.allocate();
        created.task_ids.clear();
        state.jobs.insert(created.id, created.clone());
        Ok(created)
    }

    async fn get_job(&self, id: i64) -> SchedulerResult<Option<Job>> {
        let state = self.state.lock().unwrap();
        Ok(state.jobs.get(&id).map(|job| state.hydrate_job(job)))
    }

    async fn update_job(&self, job: &Job) -> SchedulerResult<()> {
        let mut state = self.state.lock().unwrap();
        if !state.jobs.contains_key(&job.id) {
            return Err(SchedulerError::JobNotFound { id: job.id });
        }
        state.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn delete_job(&self, id: i64) -> SchedulerResult<()> {
        self.state.lock().unwrap().jobs.remove(&id);
        Ok(())
    }

    async fn list_jobs(&self, schedule_id: i64) -> SchedulerResult<Vec<Job>> {
        let state = self.state.lock().unwrap();
        let mut jobs: Vec<Job> = state
            .jobs
            .values()
            .filter(|j| j.schedule_id == schedule_id)
            .map(|j| state.hydrate_job(j))
            .collect();
        jobs.sort_by_key(|j| j.id);
        Ok(jobs)
    }

    async fn create_task(&self, task: &Task) -> SchedulerResult<Task> {
        let mut state = self.state.lock().unwrap();
        let mut created = task.clone();
        created.id = state.allocate();
        created.dependencies.clear();
        state.tasks.insert(created.id, created.clone());
        Ok(created)
    }

    async fn get_task(&self, id: i64) -> SchedulerResult<Option<Task>> {
        let state = self.state.lock().unwrap();
        Ok(state.tasks.get(&id).map(|task| state.hydrate_task(task)))
    }

    async fn update_task(&self, task: &Task) -> SchedulerResult<()> {
        let mut state = self.state.lock().unwrap();
        if !state.tasks.contains_key(&task.id) {
            return Err(SchedulerError::TaskNotFound { id: task.id });
        }
        state.tasks.insert(task.id, task.clone());
        Ok(())
    }

    async fn delete_task(&self, id: i64) -> SchedulerResult<()> {
        let mut state = self.state.lock().unwrap();
        state.tasks.remove(&id);
        state.edges.retain(|(from, to)| *from != id && *to != id);
        Ok(())
    }

    async fn list_tasks(&self, job_id: i64) -> SchedulerResult<Vec<Task>> {
        let state = self.state.lock().unwrap();
        let mut tasks: Vec<Task> = state
            .tasks
            .values()
            .filter(|t| t.job_id == job_id)
            .map(|t| state.hydrate_task(t))
            .collect();
        tasks.sort_by_key(|t| t.id);
        Ok(tasks)
    }

    async fn add_task_dependency(&self, task_id: i64, dependency_id: i64) -> SchedulerResult<()> {
        self.state
            .lock()
            .unwrap()
            .edges
            .insert((task_id, dependency_id));
        Ok(())
    }

    async fn remove_task_dependency(
        &self,
        task_id: i64,
        dependency_id: i64,
    ) -> SchedulerResult<()> {
        self.state
            .lock()
            .unwrap()
            .edges
            .remove(&(task_id, dependency_id));
        Ok(())
    }

    async fn list_task_dependencies(&self, task_id: i64) -> SchedulerResult<Vec<i64>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .edges
            .iter()
            .filter(|(from, _)| *from == task_id)
            .map(|(_, to)| *to)
            .collect())
    }
}

#[derive(Debug, Default)]
struct LogState {
    schedule_runs: HashMap<String, (i64, ScheduleRunLog)>,
    job_runs: HashMap<String, (i64, JobRunLog)>,
    task_runs: HashMap<String, (i64, TaskRunLog)>,
    /// 每次写入任务日志的快照，按写入顺序
    task_history: Vec<TaskRunLog>,
    next_id: i64,
}

/// 运行日志存储的内存实现
#[derive(Debug, Clone, Default)]
pub struct MockExecLogStore {
    state: Arc<Mutex<LogState>>,
    fail_writes: Arc<AtomicBool>,
}

impl MockExecLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 之后的写入都返回存储错误
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// 直接写入一条任务日志，用于构造待恢复的批次
    pub fn seed_task_run(&self, log: TaskRunLog) {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = state.next_id;
        state.task_runs.insert(log.batch_task_id.clone(), (id, log));
    }

    pub fn task_run(&self, batch_task_id: &str) -> Option<TaskRunLog> {
        let state = self.state.lock().unwrap();
        state.task_runs.get(batch_task_id).map(|(_, log)| log.clone())
    }

    pub fn task_history(&self) -> Vec<TaskRunLog> {
        self.state.lock().unwrap().task_history.clone()
    }

    pub fn job_runs(&self, batch_id: &str) -> Vec<JobRunLog> {
        let state = self.state.lock().unwrap();
        let mut runs: Vec<JobRunLog> = state
            .job_runs
            .values()
            .filter(|(_, log)| log.batch_id == batch_id)
            .map(|(_, log)| log.clone())
            .collect();
        runs.sort_by_key(|log| log.job_id);
        runs
    }

    pub fn schedule_runs(&self) -> Vec<ScheduleRunLog> {
        let state = self.state.lock().unwrap();
        let mut runs: Vec<ScheduleRunLog> =
            state.schedule_runs.values().map(|(_, log)| log.clone()).collect();
        runs.sort_by(|a, b| a.batch_id.cmp(&b.batch_id));
        runs
    }

    fn check_writes(&self) -> SchedulerResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(SchedulerError::DatabaseOperation(
                "mock log store unavailable".to_string(),
            ));
        }
        Ok(())
    }
}

fn upsert<T: Clone>(
    next_id: &mut i64,
    map: &mut HashMap<String, (i64, T)>,
    key: &str,
    log: &T,
) -> i64 {
    if let Some((id, existing)) = map.get_mut(key) {
        *existing = log.clone();
        return *id;
    }
    *next_id += 1;
    map.insert(key.to_string(), (*next_id, log.clone()));
    *next_id
}

#[async_trait]
impl ExecLogStore for MockExecLogStore {
    async fn upsert_schedule_run(&self, log: &ScheduleRunLog) -> SchedulerResult<i64> {
        self.check_writes()?;
        let mut state = self.state.lock().unwrap();
        let LogState {
            schedule_runs,
            next_id,
            ..
        } = &mut *state;
        Ok(upsert(next_id, schedule_runs, &log.batch_id, log))
    }

    async fn upsert_job_run(&self, log: &JobRunLog) -> SchedulerResult<i64> {
        self.check_writes()?;
        let mut state = self.state.lock().unwrap();
        let LogState {
            job_runs, next_id, ..
        } = &mut *state;
        Ok(upsert(next_id, job_runs, &log.batch_job_id, log))
    }

    async fn upsert_task_run(&self, log: &TaskRunLog) -> SchedulerResult<i64> {
        self.check_writes()?;
        let mut state = self.state.lock().unwrap();
        state.task_history.push(log.clone());
        let LogState {
            task_runs, next_id, ..
        } = &mut *state;
        Ok(upsert(next_id, task_runs, &log.batch_task_id, log))
    }

    async fn succeeded_task_ids(&self, batch_id: &str) -> SchedulerResult<Vec<i64>> {
        let state = self.state.lock().unwrap();
        let mut ids: Vec<i64> = state
            .task_runs
            .values()
            .filter(|(_, log)| log.batch_id == batch_id && log.state.is_success())
            .map(|(_, log)| log.task_id)
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    async fn task_ids_in_batch(&self, batch_id: &str) -> SchedulerResult<Vec<i64>> {
        let state = self.state.lock().unwrap();
        let mut ids: Vec<i64> = state
            .task_runs
            .values()
            .filter(|(_, log)| log.batch_id == batch_id)
            .map(|(_, log)| log.task_id)
            .collect();
        ids.sort_unstable();
        ids.dedup();
        Ok(ids)
    }

    async fn task_runs(&self, batch_id: &str) -> SchedulerResult<Vec<TaskRunLog>> {
        let state = self.state.lock().unwrap();
        let mut runs: Vec<TaskRunLog> = state
            .task_runs
            .values()
            .filter(|(_, log)| log.batch_id == batch_id)
            .map(|(_, log)| log.clone())
            .collect();
        runs.sort_by_key(|log| log.task_id);
        Ok(runs)
    }

    async fn schedule_run(&self, batch_id: &str) -> SchedulerResult<Option<ScheduleRunLog>> {
        let state = self.state.lock().unwrap();
        Ok(state.schedule_runs.get(batch_id).map(|(_, log)| log.clone()))
    }
}

/// Worker对一次调用的表现
#[derive(Debug, Clone)]
pub enum WorkerBehavior {
    Succeed(String),
    Fail(String),
    /// 连接被拒绝
    Refuse,
    Panic,
    /// 等待一段时间后按内层表现回复
    Delay(Duration, Box<WorkerBehavior>),
}

impl WorkerBehavior {
    pub fn delayed(delay: Duration, then: WorkerBehavior) -> Self {
        WorkerBehavior::Delay(delay, Box::new(then))
    }
}

/// 一次Worker调用的记录
#[derive(Debug, Clone)]
pub struct WorkerCall {
    pub address: String,
    pub task_id: i64,
    pub at: Instant,
}

/// 按任务ID或地址编排回复的Worker客户端
///
/// 查找顺序：任务ID、地址、默认表现（成功）。
#[derive(Debug, Clone)]
pub struct ScriptedWorkerClient {
    by_task: Arc<Mutex<HashMap<i64, WorkerBehavior>>>,
    by_address: Arc<Mutex<HashMap<String, WorkerBehavior>>>,
    default: WorkerBehavior,
    calls: Arc<Mutex<Vec<WorkerCall>>>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl Default for ScriptedWorkerClient {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedWorkerClient {
    pub fn new() -> Self {
        Self::with_default(WorkerBehavior::Succeed("ok".to_string()))
    }

    pub fn with_default(default: WorkerBehavior) -> Self {
        Self {
            by_task: Arc::new(Mutex::new(HashMap::new())),
            by_address: Arc::new(Mutex::new(HashMap::new())),
            default,
            calls: Arc::new(Mutex::new(Vec::new())),
            in_flight: Arc::new(AtomicUsize::new(0)),
            max_in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn script_task(&self, task_id: i64, behavior: WorkerBehavior) {
        self.by_task.lock().unwrap().insert(task_id, behavior);
    }

    pub fn script_address(&self, address: &str, behavior: WorkerBehavior) {
        self.by_address
            .lock()
            .unwrap()
            .insert(address.to_string(), behavior);
    }

    pub fn calls(&self) -> Vec<WorkerCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn calls_for(&self, task_id: i64) -> Vec<WorkerCall> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.task_id == task_id)
            .cloned()
            .collect()
    }

    /// 同时在途调用数的峰值
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn behavior_for(&self, address: &str, task_id: i64) -> WorkerBehavior {
        if let Some(behavior) = self.by_task.lock().unwrap().get(&task_id) {
            return behavior.clone();
        }
        if let Some(behavior) = self.by_address.lock().unwrap().get(address) {
            return behavior.clone();
        }
        self.default.clone()
    }
}

struct InFlightGuard(Arc<AtomicUsize>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl WorkerClient for ScriptedWorkerClient {
    async fn execute(&self, address: &str, payload: &TaskPayload) -> SchedulerResult<Reply> {
        self.calls.lock().unwrap().push(WorkerCall {
            address: address.to_string(),
            task_id: payload.id,
            at: Instant::now(),
        });
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        let _guard = InFlightGuard(self.in_flight.clone());

        let mut behavior = self.behavior_for(address, payload.id);
        loop {
            match behavior {
                WorkerBehavior::Succeed(stdout) => return Ok(Reply::success(stdout)),
                WorkerBehavior::Fail(error) => return Ok(Reply::failure(error)),
                WorkerBehavior::Refuse => {
                    return Err(SchedulerError::Network(format!(
                        "connection refused: {address}"
                    )))
                }
                WorkerBehavior::Panic => panic!("scripted worker panic for task {}", payload.id),
                WorkerBehavior::Delay(delay, then) => {
                    tokio::time::sleep(delay).await;
                    behavior = *then;
                }
            }
        }
    }
}

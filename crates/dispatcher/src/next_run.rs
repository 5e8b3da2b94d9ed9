//! 任务下次运行时间计算

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use tracing::warn;

use batch_core::{
    models::{Schedule, Task, TaskType},
    traits::TriggerResolver,
};

/// 计算单个任务在 `after` 之后的下次运行时间
///
/// 依赖触发的任务沿第一个存在的依赖向上递归，`visited` 用于截断依赖环。
pub fn next_run_time(
    tasks: &HashMap<i64, &Task>,
    task_id: i64,
    resolver: &dyn TriggerResolver,
    after: DateTime<Utc>,
    visited: &mut HashSet<i64>,
) -> Option<DateTime<Utc>> {
    let task = tasks.get(&task_id)?;
    if task.disabled {
        return None;
    }
    if !visited.insert(task_id) {
        warn!("任务 {} 的依赖链存在循环，不计算下次运行时间", task_id);
        return None;
    }

    match task.task_type {
        TaskType::Inactive => None,
        TaskType::Timed => {
            let result = if task.has_cron() {
                resolver.next_activation(&task.cycle, &task.cron, after)
            } else {
                let offset = task.start_offset();
                resolver
                    .next_activation(&task.cycle, "", after - offset)
                    .map(|at| at + offset)
            };
            match result {
                Ok(at) => Some(at),
                Err(e) => {
                    warn!("任务 {} 计算下次运行时间失败: {}", task.id, e);
                    None
                }
            }
        }
        TaskType::Dependent => {
            let upstream = task
                .dependencies
                .iter()
                .copied()
                .find(|id| tasks.contains_key(id))?;
            next_run_time(tasks, upstream, resolver, after, visited)
        }
    }
}

/// 刷新调度内任务的下次运行时间
///
/// `only` 为 `None` 时刷新全部任务，否则只刷新指定的任务。
pub fn refresh_next_runs(
    schedule: &mut Schedule,
    resolver: &dyn TriggerResolver,
    after: DateTime<Utc>,
    only: Option<&HashSet<i64>>,
) {
    let computed: Vec<(i64, Option<DateTime<Utc>>)> = {
        let lookup: HashMap<i64, &Task> = schedule.tasks.iter().map(|t| (t.id, t)).collect();
        schedule
            .tasks
            .iter()
            .filter(|t| only.map_or(true, |ids| ids.contains(&t.id)))
            .map(|t| {
                let mut visited = HashSet::new();
                (t.id, next_run_time(&lookup, t.id, resolver, after, &mut visited))
            })
            .collect()
    };

    for (id, next) in computed {
        if let Some(task) = schedule.task_mut(id) {
            if next != task.next_run_at {
                task.prev_run_at = task.next_run_at;
            }
            task.next_run_at = next;
        }
    }
}

/// 按下次运行时间排序任务（无运行时间的排在最后），返回最早的时间
pub fn earliest_next_run(schedule: &mut Schedule) -> Option<DateTime<Utc>> {
    schedule.tasks.sort_by(|a, b| match (a.next_run_at, b.next_run_at) {
        (Some(x), Some(y)) => x.cmp(&y).then(a.id.cmp(&b.id)),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => a.id.cmp(&b.id),
    });
    schedule.tasks.first().and_then(|t| t.next_run_at)
}

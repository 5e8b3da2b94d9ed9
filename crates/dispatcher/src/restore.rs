use std::collections::HashSet;

use serde::Serialize;
use tracing::info;

use batch_core::{
    models::{ExecType, Schedule},
    SchedulerError, SchedulerResult,
};

use crate::batch::ExecSchedule;
use crate::context::DispatcherContext;
use crate::observability::StructuredLogger;

/// 恢复结果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum RestoreOutcome {
    /// 批次中的任务都已成功，不做任何派发
    AlreadyComplete { batch_id: String },
    /// 剩余任务已重新进入调度
    Resumed {
        batch_id: String,
        skipped: usize,
        remaining: usize,
    },
}

/// 准备好的恢复批次
pub enum RestorePlan {
    AlreadyComplete,
    Resume { exec: ExecSchedule, skipped: usize },
}

/// 按当前定义重建批次，并移除日志中已成功的任务
///
/// 批次成员取日志中记录过的任务；没有记录时取调度下全部启用的任务。
pub async fn prepare_restore(
    ctx: &DispatcherContext,
    schedule: &Schedule,
    batch_id: &str,
) -> SchedulerResult<RestorePlan> {
    let (schedule_id, activation) = ExecSchedule::parse_batch_id(batch_id).ok_or_else(|| {
        SchedulerError::BatchNotFound {
            batch_id: batch_id.to_string(),
        }
    })?;
    if schedule_id != schedule.id {
        return Err(SchedulerError::BatchNotFound {
            batch_id: batch_id.to_string(),
        });
    }

    let succeeded = ctx.logs.succeeded_task_ids(batch_id).await?;
    let logged: HashSet<i64> = ctx
        .logs
        .task_ids_in_batch(batch_id)
        .await?
        .into_iter()
        .collect();

    let mut exec = ExecSchedule::build_with(
        schedule,
        batch_id.to_string(),
        activation,
        ExecType::Repair,
        |task| {
            if logged.is_empty() {
                !task.disabled
            } else {
                logged.contains(&task.id)
            }
        },
    );
    let skipped = exec.skip_succeeded(&succeeded);
    exec.mark_repair();
    StructuredLogger::log_restore(batch_id, schedule.id, skipped, exec.remaining);

    if exec.remaining == 0 {
        info!("批次 {} 的任务均已成功，无需恢复", batch_id);
        return Ok(RestorePlan::AlreadyComplete);
    }

    Ok(RestorePlan::Resume { exec, skipped })
}

use chrono::{DateTime, Utc};

use crate::SchedulerResult;

/// 触发时间解析
///
/// 给定周期代码和可选的CRON表达式，返回 `after` 之后的下一次激活时间。
/// 实现必须是纯函数，无副作用。
pub trait TriggerResolver: Send + Sync {
    fn next_activation(
        &self,
        cycle: &str,
        cron: &str,
        after: DateTime<Utc>,
    ) -> SchedulerResult<DateTime<Utc>>;
}

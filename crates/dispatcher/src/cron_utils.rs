use chrono::{DateTime, Datelike, Duration, Months, NaiveDate, TimeZone, Timelike, Utc};
use cron::Schedule;
use std::str::FromStr;
use tracing::debug;

use batch_core::{traits::TriggerResolver, SchedulerError, SchedulerResult};

/// CRON表达式解析
///
/// 接受6或7个字段的表达式（秒 分 时 日 月 周 [年]），
/// 5个字段的表达式会在前面补一个秒字段 `0`。
pub struct CronScheduler {
    schedule: Schedule,
}

impl CronScheduler {
    pub fn new(cron_expr: &str) -> SchedulerResult<Self> {
        let normalized = Self::normalize(cron_expr);
        let schedule =
            Schedule::from_str(&normalized).map_err(|e| SchedulerError::InvalidCron {
                expr: cron_expr.to_string(),
                message: e.to_string(),
            })?;

        Ok(Self { schedule })
    }

    fn normalize(cron_expr: &str) -> String {
        let trimmed = cron_expr.trim();
        if trimmed.split_whitespace().count() == 5 {
            format!("0 {trimmed}")
        } else {
            trimmed.to_string()
        }
    }

    /// `from` 之后（不含）的下一次执行时间
    pub fn next_execution_time(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&from).next()
    }

    pub fn upcoming_times(&self, from: DateTime<Utc>, count: usize) -> Vec<DateTime<Utc>> {
        self.schedule.after(&from).take(count).collect()
    }

    pub fn validate_cron_expression(cron_expr: &str) -> SchedulerResult<()> {
        Self::new(cron_expr).map(|_| ())
    }
}

/// 周期代码
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleCode {
    Second,
    Minute,
    Hour,
    Day,
    /// 以周一为一周的开始
    Week,
    Month,
    Year,
}

impl FromStr for CycleCode {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "ss" => Ok(CycleCode::Second),
            "mi" => Ok(CycleCode::Minute),
            "h" => Ok(CycleCode::Hour),
            "d" => Ok(CycleCode::Day),
            "w" => Ok(CycleCode::Week),
            "m" => Ok(CycleCode::Month),
            "y" => Ok(CycleCode::Year),
            other => Err(SchedulerError::InvalidCycle(other.to_string())),
        }
    }
}

impl CycleCode {
    /// `at` 所在周期的起点
    pub fn period_start(self, at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let date = at.date_naive();
        let naive = match self {
            CycleCode::Second => date.and_hms_opt(at.hour(), at.minute(), at.second())?,
            CycleCode::Minute => date.and_hms_opt(at.hour(), at.minute(), 0)?,
            CycleCode::Hour => date.and_hms_opt(at.hour(), 0, 0)?,
            CycleCode::Day => date.and_hms_opt(0, 0, 0)?,
            CycleCode::Week => {
                let back = at.weekday().num_days_from_monday() as i64;
                (date - Duration::days(back)).and_hms_opt(0, 0, 0)?
            }
            CycleCode::Month => NaiveDate::from_ymd_opt(at.year(), at.month(), 1)?.and_hms_opt(0, 0, 0)?,
            CycleCode::Year => NaiveDate::from_ymd_opt(at.year(), 1, 1)?.and_hms_opt(0, 0, 0)?,
        };
        Some(Utc.from_utc_datetime(&naive))
    }

    /// `after` 之后（不含）的下一个周期起点
    pub fn next_boundary(self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let start = self.period_start(after)?;
        match self {
            CycleCode::Second => start.checked_add_signed(Duration::seconds(1)),
            CycleCode::Minute => start.checked_add_signed(Duration::minutes(1)),
            CycleCode::Hour => start.checked_add_signed(Duration::hours(1)),
            CycleCode::Day => start.checked_add_signed(Duration::days(1)),
            CycleCode::Week => start.checked_add_signed(Duration::weeks(1)),
            CycleCode::Month => start.checked_add_months(Months::new(1)),
            CycleCode::Year => start.checked_add_months(Months::new(12)),
        }
    }
}

/// 基于CRON表达式和周期代码的触发时间解析
#[derive(Debug, Clone, Copy, Default)]
pub struct CronTriggerResolver;

impl CronTriggerResolver {
    pub fn new() -> Self {
        Self
    }
}

impl TriggerResolver for CronTriggerResolver {
    fn next_activation(
        &self,
        cycle: &str,
        cron: &str,
        after: DateTime<Utc>,
    ) -> SchedulerResult<DateTime<Utc>> {
        if !cron.trim().is_empty() {
            let scheduler = CronScheduler::new(cron)?;
            return scheduler
                .next_execution_time(after)
                .ok_or_else(|| SchedulerError::InvalidCron {
                    expr: cron.to_string(),
                    message: "没有后续的执行时间".to_string(),
                });
        }

        let code = CycleCode::from_str(cycle)?;
        let next = code
            .next_boundary(after)
            .ok_or_else(|| SchedulerError::InvalidCycle(cycle.to_string()))?;
        debug!("周期 {} 在 {} 之后的下一个起点: {}", cycle, after, next);
        Ok(next)
    }
}

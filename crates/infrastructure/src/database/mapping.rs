//! SQLite行与领域类型之间的转换
//!
//! 状态、执行类型和任务类型在库中以整数存储。

use batch_core::{
    models::{ExecState, ExecType, TaskType},
    SchedulerError, SchedulerResult,
};
use sqlx::{sqlite::SqliteRow, Row};

pub struct MappingHelpers;

impl MappingHelpers {
    fn small_int(row: &SqliteRow, field_name: &str) -> SchedulerResult<i8> {
        let value: i64 = row.try_get(field_name)?;
        i8::try_from(value).map_err(|_| {
            SchedulerError::Serialization(format!("字段 {field_name} 超出范围: {value}"))
        })
    }

    pub fn exec_state(row: &SqliteRow, field_name: &str) -> SchedulerResult<ExecState> {
        ExecState::try_from(Self::small_int(row, field_name)?)
            .map_err(|e| SchedulerError::Serialization(format!("解析运行状态失败: {e}")))
    }

    pub fn exec_type(row: &SqliteRow, field_name: &str) -> SchedulerResult<ExecType> {
        ExecType::try_from(Self::small_int(row, field_name)?)
            .map_err(|e| SchedulerError::Serialization(format!("解析执行类型失败: {e}")))
    }

    pub fn task_type(row: &SqliteRow, field_name: &str) -> SchedulerResult<TaskType> {
        TaskType::try_from(Self::small_int(row, field_name)?)
            .map_err(|e| SchedulerError::Serialization(format!("解析任务类型失败: {e}")))
    }
}

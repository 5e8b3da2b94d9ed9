use serde::{Deserialize, Serialize};
use std::fmt;

/// 运行实体（调度运行、作业运行、任务运行）共用的状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(try_from = "i8", into = "i8")]
pub enum ExecState {
    Pending = 0,
    Running = 1,
    /// 上游失败或被暂停，计入失败数，本批次内不再重试
    Blocked = 2,
    Done = 3,
    Aborted = 4,
    Ignored = 5,
}

impl ExecState {
    pub fn as_i8(self) -> i8 {
        self as i8
    }

    /// DONE 和 IGNORED 计为成功
    pub fn is_success(self) -> bool {
        matches!(self, ExecState::Done | ExecState::Ignored)
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecState::Done | ExecState::Aborted | ExecState::Blocked | ExecState::Ignored
        )
    }

    /// 依赖清空后允许调度的状态
    pub fn is_dispatchable(self) -> bool {
        matches!(self, ExecState::Pending | ExecState::Blocked)
    }
}

impl TryFrom<i8> for ExecState {
    type Error = String;

    fn try_from(value: i8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ExecState::Pending),
            1 => Ok(ExecState::Running),
            2 => Ok(ExecState::Blocked),
            3 => Ok(ExecState::Done),
            4 => Ok(ExecState::Aborted),
            5 => Ok(ExecState::Ignored),
            _ => Err(format!("Invalid exec state: {value}")),
        }
    }
}

impl From<ExecState> for i8 {
    fn from(value: ExecState) -> Self {
        value.as_i8()
    }
}

impl fmt::Display for ExecState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExecState::Pending => "PENDING",
            ExecState::Running => "RUNNING",
            ExecState::Blocked => "BLOCKED",
            ExecState::Done => "DONE",
            ExecState::Aborted => "ABORTED",
            ExecState::Ignored => "IGNORED",
        };
        f.write_str(name)
    }
}

/// 执行方式
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(try_from = "i8", into = "i8")]
pub enum ExecType {
    /// 定时器触发
    #[default]
    Auto = 1,
    /// 手动立即执行触发
    Manual = 2,
    /// 断点恢复
    Repair = 3,
}

impl ExecType {
    pub fn as_i8(self) -> i8 {
        self as i8
    }
}

impl TryFrom<i8> for ExecType {
    type Error = String;

    fn try_from(value: i8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(ExecType::Auto),
            2 => Ok(ExecType::Manual),
            3 => Ok(ExecType::Repair),
            _ => Err(format!("Invalid exec type: {value}")),
        }
    }
}

impl From<ExecType> for i8 {
    fn from(value: ExecType) -> Self {
        value.as_i8()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_classification() {
        assert!(ExecState::Done.is_success());
        assert!(ExecState::Ignored.is_success());
        assert!(!ExecState::Blocked.is_success());
        assert!(ExecState::Blocked.is_terminal());
        assert!(!ExecState::Running.is_terminal());
        assert!(ExecState::Blocked.is_dispatchable());
        assert!(!ExecState::Done.is_dispatchable());
    }

    #[test]
    fn test_state_codes() {
        for code in 0..=5i8 {
            let state = ExecState::try_from(code).unwrap();
            assert_eq!(state.as_i8(), code);
        }
        assert!(ExecState::try_from(6).is_err());
        assert_eq!(ExecType::try_from(3).unwrap(), ExecType::Repair);
        assert!(ExecType::try_from(0).is_err());
    }
}

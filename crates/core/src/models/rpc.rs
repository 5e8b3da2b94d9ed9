use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::{Task, TaskType};

/// `Execute` 调用发送给Worker的任务载荷
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaskPayload {
    pub id: i64,
    pub address: String,
    pub name: String,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub cycle: String,
    pub start_offset: i64,
    pub command: String,
    pub timeout_seconds: i64,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
}

impl From<&Task> for TaskPayload {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id,
            address: task.address.clone(),
            name: task.name.clone(),
            task_type: task.task_type,
            cycle: task.cycle.clone(),
            start_offset: task.start_offset_seconds,
            command: task.command.clone(),
            timeout_seconds: task.timeout_seconds,
            attributes: task.attributes.clone(),
        }
    }
}

/// Worker的执行回复，`error` 为空表示成功
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Reply {
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
}

impl Reply {
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            ..Default::default()
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            ..Default::default()
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_empty()
    }
}

use thiserror::Error;

/// 调度器错误类型定义
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    #[error("数据库操作错误: {0}")]
    DatabaseOperation(String),

    #[error("调度未找到: {id}")]
    ScheduleNotFound { id: i64 },

    #[error("作业未找到: {id}")]
    JobNotFound { id: i64 },

    #[error("任务未找到: {id}")]
    TaskNotFound { id: i64 },

    #[error("批次未找到: {batch_id}")]
    BatchNotFound { batch_id: String },

    #[error("任务 {task_id} 的依赖任务 {dependency_id} 不存在")]
    DependencyNotFound { task_id: i64, dependency_id: i64 },

    #[error("无效的CRON表达式: {expr} - {message}")]
    InvalidCron { expr: String, message: String },

    #[error("无效的调度周期: {0}")]
    InvalidCycle(String),

    #[error("检测到循环依赖")]
    CircularDependency,

    #[error("作业 {id} 不能删除: {reason}")]
    JobNotDeletable { id: i64, reason: String },

    #[error("无效的定义: {0}")]
    InvalidDefinition(String),

    #[error("网络错误: {0}")]
    Network(String),

    #[error("Worker调用错误: {0}")]
    WorkerRpc(String),

    #[error("控制通道已关闭: {0}")]
    ChannelClosed(String),

    #[error("序列化错误: {0}")]
    Serialization(String),

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

impl SchedulerError {
    /// 定义类错误：调用方的请求本身有问题，不应重试
    pub fn is_definition_error(&self) -> bool {
        matches!(
            self,
            SchedulerError::ScheduleNotFound { .. }
                | SchedulerError::JobNotFound { .. }
                | SchedulerError::TaskNotFound { .. }
                | SchedulerError::BatchNotFound { .. }
                | SchedulerError::DependencyNotFound { .. }
                | SchedulerError::InvalidCron { .. }
                | SchedulerError::InvalidCycle(_)
                | SchedulerError::CircularDependency
                | SchedulerError::JobNotDeletable { .. }
                | SchedulerError::InvalidDefinition(_)
        )
    }

    /// 传输类错误：由Worker调度器在本地重试
    pub fn is_transport_error(&self) -> bool {
        matches!(
            self,
            SchedulerError::Network(_) | SchedulerError::WorkerRpc(_)
        )
    }
}

impl From<serde_json::Error> for SchedulerError {
    fn from(e: serde_json::Error) -> Self {
        SchedulerError::Serialization(e.to_string())
    }
}

/// 统一的Result类型
pub type SchedulerResult<T> = std::result::Result<T, SchedulerError>;

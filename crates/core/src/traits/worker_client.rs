use async_trait::async_trait;

use crate::{
    models::{Reply, TaskPayload},
    SchedulerResult,
};

/// Worker `Execute` 调用的客户端
///
/// 每次调用使用新的连接，收到回复后立即关闭。
/// 连接失败或传输错误返回 `Err`，远程命令失败体现在 `Reply::error` 中。
#[async_trait]
pub trait WorkerClient: Send + Sync {
    async fn execute(&self, address: &str, payload: &TaskPayload) -> SchedulerResult<Reply>;
}

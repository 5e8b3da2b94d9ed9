use std::time::Duration;

use async_trait::async_trait;
use batch_core::{
    models::{Reply, TaskPayload},
    traits::WorkerClient,
    SchedulerError, SchedulerResult,
};
use tracing::{debug, warn};

/// Worker执行接口的HTTP客户端
///
/// 每次调用新建连接，不复用空闲连接。
pub struct HttpWorkerClient {
    http_client: reqwest::Client,
}

impl HttpWorkerClient {
    pub fn new(connect_timeout: Duration) -> SchedulerResult<Self> {
        let http_client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .pool_max_idle_per_host(0)
            .build()
            .map_err(|e| SchedulerError::Configuration(format!("创建HTTP客户端失败: {e}")))?;
        Ok(Self { http_client })
    }

    fn endpoint(address: &str) -> String {
        format!("http://{address}/rpc/execute")
    }
}

#[async_trait]
impl WorkerClient for HttpWorkerClient {
    async fn execute(&self, address: &str, payload: &TaskPayload) -> SchedulerResult<Reply> {
        let url = Self::endpoint(address);
        debug!("调用Worker {}，任务 {} ({})", url, payload.name, payload.id);

        let response = self
            .http_client
            .post(&url)
            .json(payload)
            .send()
            .await
            .map_err(|e| {
                warn!("连接Worker {} 失败: {}", address, e);
                SchedulerError::Network(format!("连接Worker {address} 失败: {e}"))
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SchedulerError::WorkerRpc(format!(
                "Worker {address} 返回 HTTP {status}: {body}"
            )));
        }

        response
            .json::<Reply>()
            .await
            .map_err(|e| SchedulerError::WorkerRpc(format!("解析Worker {address} 回复失败: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::post, Json, Router};
    use batch_core::models::Task;

    fn payload() -> TaskPayload {
        TaskPayload::from(&Task::new(1, "echo", "echo hi"))
    }

    #[tokio::test]
    async fn test_execute_posts_payload_and_parses_reply() {
        let app = Router::new().route(
            "/rpc/execute",
            post(|Json(payload): Json<TaskPayload>| async move {
                Json(Reply::success(format!("ran {}", payload.command)))
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let client = HttpWorkerClient::new(Duration::from_secs(2)).unwrap();
        let reply = client.execute(&address, &payload()).await.unwrap();
        assert!(reply.is_success());
        assert_eq!(reply.stdout, "ran echo hi");
    }

    #[tokio::test]
    async fn test_refused_connection_is_network_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let client = HttpWorkerClient::new(Duration::from_secs(2)).unwrap();
        let err = client.execute(&address, &payload()).await.unwrap_err();
        assert!(matches!(err, SchedulerError::Network(_)));
    }
}

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use batch_core::{
    config::WorkerConfig,
    models::{Reply, TaskPayload},
};
use futures::FutureExt;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::executor::{ShellExecutor, TaskExecutor};

#[derive(Clone)]
struct WorkerState {
    executor: Arc<dyn TaskExecutor>,
    hostname: String,
}

/// Worker的HTTP执行服务
pub struct WorkerServer {
    state: WorkerState,
}

impl WorkerServer {
    pub fn new(executor: Arc<dyn TaskExecutor>) -> Self {
        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string());
        Self {
            state: WorkerState { executor, hostname },
        }
    }

    pub fn from_config(config: &WorkerConfig) -> Self {
        Self::new(Arc::new(ShellExecutor::new(config.shell.clone())))
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/rpc/execute", post(execute))
            .route("/health", get(health_check))
            .with_state(self.state.clone())
    }

    /// 在 `listener` 上提供服务，直到 `shutdown` 完成
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let address = listener.local_addr().context("获取监听地址失败")?;
        info!("Worker服务已启动: {}", address);
        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await
            .context("Worker服务运行失败")?;
        info!("Worker服务已停止");
        Ok(())
    }
}

/// 绑定配置中的地址并启动Worker服务
pub async fn serve<F>(config: &WorkerConfig, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(&config.bind_address)
        .await
        .with_context(|| format!("绑定Worker地址失败: {}", config.bind_address))?;
    WorkerServer::from_config(config)
        .serve(listener, shutdown)
        .await
}

async fn execute(State(state): State<WorkerState>, Json(payload): Json<TaskPayload>) -> Json<Reply> {
    let outcome = AssertUnwindSafe(state.executor.execute(&payload))
        .catch_unwind()
        .await;
    match outcome {
        Ok(reply) => Json(reply),
        Err(_) => {
            error!("任务执行过程中发生panic: task_id={}", payload.id);
            Json(Reply::failure("error"))
        }
    }
}

async fn health_check(State(state): State<WorkerState>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now(),
        "service": "batch-worker",
        "hostname": state.hostname,
        "version": env!("CARGO_PKG_VERSION")
    }))
}

use std::sync::Arc;

use async_trait::async_trait;
use batch_core::models::{Reply, Task, TaskPayload};
use batch_worker::{ShellExecutor, TaskExecutor, WorkerServer};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

struct PanickingExecutor;

#[async_trait]
impl TaskExecutor for PanickingExecutor {
    async fn execute(&self, _payload: &TaskPayload) -> Reply {
        panic!("executor exploded");
    }
}

async fn start(executor: Arc<dyn TaskExecutor>) -> (String, oneshot::Sender<()>, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    let (tx, rx) = oneshot::channel::<()>();
    let handle = tokio::spawn(async move {
        WorkerServer::new(executor)
            .serve(listener, async {
                let _ = rx.await;
            })
            .await
            .unwrap();
    });
    (address, tx, handle)
}

#[tokio::test]
async fn test_execute_endpoint_runs_command() {
    let (address, stop, handle) = start(Arc::new(ShellExecutor::default())).await;

    let payload = TaskPayload::from(&Task::new(1, "greet", "echo hello"));
    let reply: Reply = reqwest::Client::new()
        .post(format!("http://{address}/rpc/execute"))
        .json(&payload)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert!(reply.is_success());
    assert_eq!(reply.stdout, "hello\n");

    stop.send(()).unwrap();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_panic_in_executor_becomes_error_reply() {
    let (address, stop, handle) = start(Arc::new(PanickingExecutor)).await;

    let payload = TaskPayload::from(&Task::new(1, "boom", "true"));
    let reply: Reply = reqwest::Client::new()
        .post(format!("http://{address}/rpc/execute"))
        .json(&payload)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(reply.error, "error");

    stop.send(()).unwrap();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_health_reports_hostname() {
    let (address, stop, handle) = start(Arc::new(ShellExecutor::default())).await;

    let body: serde_json::Value = reqwest::get(format!("http://{address}/health"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(body["status"], "healthy");
    assert_eq!(body["service"], "batch-worker");
    assert!(body["hostname"].is_string());

    stop.send(()).unwrap();
    handle.await.unwrap();
}

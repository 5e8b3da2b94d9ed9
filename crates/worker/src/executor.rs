use std::collections::HashMap;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use batch_core::models::{Reply, TaskPayload};
use tokio::process::Command;
use tracing::{info, warn};

/// 任务执行器
///
/// 执行失败不返回 `Err`，而是体现在 [`Reply::error`] 中，由调度端判断是否重试。
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, payload: &TaskPayload) -> Reply;
}

/// 以 `<shell> -c <command>` 方式执行任务命令
pub struct ShellExecutor {
    shell: String,
}

impl ShellExecutor {
    pub fn new(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
        }
    }

    fn command(&self, command: &str, attributes: &HashMap<String, String>) -> Command {
        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // 任务属性以 BATCH_ATTR_<NAME> 环境变量传给命令
        for (name, value) in attributes {
            cmd.env(attribute_env_name(name), value);
        }
        cmd
    }
}

impl Default for ShellExecutor {
    fn default() -> Self {
        Self::new("sh")
    }
}

fn attribute_env_name(name: &str) -> String {
    let normalized: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("BATCH_ATTR_{normalized}")
}

#[async_trait]
impl TaskExecutor for ShellExecutor {
    async fn execute(&self, payload: &TaskPayload) -> Reply {
        let started = Instant::now();
        info!(
            "执行任务: id={}, name={}, command={}",
            payload.id, payload.name, payload.command
        );

        let child = match self.command(&payload.command, &payload.attributes).spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!("启动命令失败: task_id={}, error={}", payload.id, e);
                return Reply::failure(format!("error: {e}"));
            }
        };

        // 超时后丢弃 future，kill_on_drop 会结束子进程
        let output = if payload.timeout_seconds > 0 {
            let limit = Duration::from_secs(payload.timeout_seconds as u64);
            match tokio::time::timeout(limit, child.wait_with_output()).await {
                Ok(output) => output,
                Err(_) => {
                    warn!(
                        "任务执行超时: task_id={}, timeout={}s",
                        payload.id, payload.timeout_seconds
                    );
                    return Reply::failure(format!(
                        "error: timed out after {}s",
                        payload.timeout_seconds
                    ));
                }
            }
        } else {
            child.wait_with_output().await
        };

        let output = match output {
            Ok(output) => output,
            Err(e) => return Reply::failure(format!("error: {e}")),
        };

        let reply = Reply {
            error: if output.status.success() {
                String::new()
            } else {
                format!("error: {}", output.status)
            },
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        info!(
            "任务执行结束: id={}, success={}, 耗时={}ms",
            payload.id,
            reply.is_success(),
            started.elapsed().as_millis()
        );
        reply
    }
}

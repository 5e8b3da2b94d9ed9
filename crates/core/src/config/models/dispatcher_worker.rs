use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    pub enabled: bool,
    /// 任务地址未带端口时使用的Worker端口
    pub worker_port: u16,
    /// 两次尝试之间的固定退避（毫秒）
    pub retry_backoff_ms: u64,
    /// 同时调用Worker的任务数上限，超出部分排队
    pub max_concurrent_dispatches: usize,
    pub connect_timeout_seconds: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            worker_port: 3128,
            retry_backoff_ms: 500,
            max_concurrent_dispatches: 100,
            connect_timeout_seconds: 10,
        }
    }
}

impl DispatcherConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.worker_port == 0 {
            return Err(anyhow::anyhow!("Worker端口必须大于0"));
        }

        if self.max_concurrent_dispatches == 0 {
            return Err(anyhow::anyhow!("最大并发调度数必须大于0"));
        }

        if self.connect_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("连接超时时间必须大于0"));
        }

        Ok(())
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub enabled: bool,
    pub bind_address: String,
    /// 执行命令使用的shell，以 `<shell> -c <command>` 方式调用
    pub shell: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_address: "0.0.0.0:3128".to_string(),
            shell: "sh".to_string(),
        }
    }
}

impl WorkerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.bind_address.is_empty() {
            return Err(anyhow::anyhow!("绑定地址不能为空"));
        }

        if self.bind_address.parse::<std::net::SocketAddr>().is_err() {
            return Err(anyhow::anyhow!("绑定地址格式无效: {}", self.bind_address));
        }

        if self.shell.trim().is_empty() {
            return Err(anyhow::anyhow!("shell不能为空"));
        }

        Ok(())
    }
}

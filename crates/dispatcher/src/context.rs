use std::sync::Arc;

use tokio::sync::Semaphore;

use batch_core::{
    config::DispatcherConfig,
    traits::{ExecLogStore, MetadataStore, TriggerResolver, WorkerClient},
};

use crate::observability::MetricsCollector;

/// 调度引擎各组件共享的运行上下文
///
/// 由进程入口构造一次，以 `Arc` 传入各组件构造函数。
pub struct DispatcherContext {
    pub config: DispatcherConfig,
    pub metadata: Arc<dyn MetadataStore>,
    pub logs: Arc<dyn ExecLogStore>,
    pub resolver: Arc<dyn TriggerResolver>,
    pub worker: Arc<dyn WorkerClient>,
    /// 同时调用Worker的许可，容量为 `max_concurrent_dispatches`
    pub permits: Arc<Semaphore>,
    pub metrics: Arc<MetricsCollector>,
}

impl DispatcherContext {
    pub fn new(
        config: DispatcherConfig,
        metadata: Arc<dyn MetadataStore>,
        logs: Arc<dyn ExecLogStore>,
        resolver: Arc<dyn TriggerResolver>,
        worker: Arc<dyn WorkerClient>,
    ) -> Arc<Self> {
        Self::with_metrics(config, metadata, logs, resolver, worker, MetricsCollector::new())
    }

    pub fn with_metrics(
        config: DispatcherConfig,
        metadata: Arc<dyn MetadataStore>,
        logs: Arc<dyn ExecLogStore>,
        resolver: Arc<dyn TriggerResolver>,
        worker: Arc<dyn WorkerClient>,
        metrics: MetricsCollector,
    ) -> Arc<Self> {
        let permits = Arc::new(Semaphore::new(config.max_concurrent_dispatches));
        Arc::new(Self {
            config,
            metadata,
            logs,
            resolver,
            worker,
            permits,
            metrics: Arc::new(metrics),
        })
    }

    /// 补全Worker地址端口
    pub fn worker_address(&self, address: &str) -> String {
        let has_port = address
            .rsplit_once(':')
            .map(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok())
            .unwrap_or(false);

        if has_port {
            address.to_string()
        } else {
            format!("{}:{}", address, self.config.worker_port)
        }
    }
}

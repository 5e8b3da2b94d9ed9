use std::sync::Arc;

use anyhow::{Context, Result};
use batch_core::AppConfig;
use batch_dispatcher::{
    observability::MetricsCollector, CronTriggerResolver, DispatcherContext, ScheduleManager,
};
use batch_infrastructure::{DatabaseManager, HttpWorkerClient};
use tracing::{error, info};

use crate::shutdown::ShutdownSignal;

/// 应用运行模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum AppMode {
    /// 仅运行调度端
    Scheduler,
    /// 仅运行Worker
    Worker,
    /// 在同一进程中运行调度端和Worker
    All,
}

impl AppMode {
    fn runs_scheduler(self) -> bool {
        matches!(self, AppMode::Scheduler | AppMode::All)
    }

    fn runs_worker(self) -> bool {
        matches!(self, AppMode::Worker | AppMode::All)
    }
}

pub struct Application {
    config: AppConfig,
    mode: AppMode,
}

impl Application {
    pub fn new(config: AppConfig, mode: AppMode) -> Result<Self> {
        match mode {
            AppMode::Scheduler if !config.dispatcher.enabled => {
                return Err(anyhow::anyhow!("调度端被禁用，请检查配置"));
            }
            AppMode::Worker if !config.worker.enabled => {
                return Err(anyhow::anyhow!("Worker被禁用，请检查配置"));
            }
            _ => {}
        }
        Ok(Self { config, mode })
    }

    /// 运行直到收到关闭信号
    pub async fn run(self, signal: ShutdownSignal) -> Result<()> {
        info!("启动应用程序，模式: {:?}", self.mode);

        let worker = if self.mode.runs_worker() {
            let config = self.config.worker.clone();
            let signal = signal.clone();
            Some(tokio::spawn(async move {
                batch_worker::serve(&config, signal.wait()).await
            }))
        } else {
            None
        };

        if self.mode.runs_scheduler() {
            self.run_scheduler(signal).await?;
        }

        if let Some(handle) = worker {
            handle.await.context("Worker任务异常退出")??;
        }
        Ok(())
    }

    fn metrics(&self) -> MetricsCollector {
        if self.config.observability.metrics_enabled {
            MetricsCollector::new()
        } else {
            MetricsCollector::disabled()
        }
    }

    async fn run_scheduler(&self, signal: ShutdownSignal) -> Result<()> {
        let database = DatabaseManager::new(&self.config.database)
            .await
            .context("初始化元数据库失败")?;

        let worker_client = HttpWorkerClient::new(self.config.dispatcher.connect_timeout())?;
        let ctx = DispatcherContext::with_metrics(
            self.config.dispatcher.clone(),
            Arc::new(database.metadata_store()),
            Arc::new(database.exec_log_store()),
            Arc::new(CronTriggerResolver::new()),
            Arc::new(worker_client),
            self.metrics(),
        );

        let manager = ScheduleManager::new(ctx);
        let started = manager.start().await.context("启动调度失败")?;
        info!("调度端已启动，共 {} 个调度", started);

        signal.wait().await;

        info!("停止调度触发循环");
        manager.shutdown().await;
        if let Err(e) = database.health_check().await {
            error!("关闭前数据库检查失败: {}", e);
        }
        database.close().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_components_are_rejected() {
        let mut config = AppConfig::default();
        config.worker.enabled = false;
        assert!(Application::new(config.clone(), AppMode::Worker).is_err());
        assert!(Application::new(config.clone(), AppMode::All).is_ok());

        config.dispatcher.enabled = false;
        assert!(Application::new(config, AppMode::Scheduler).is_err());
    }

    #[test]
    fn test_metrics_follow_observability_config() {
        let mut config = AppConfig::default();
        config.observability.metrics_enabled = false;
        let app = Application::new(config.clone(), AppMode::Scheduler).unwrap();
        assert!(!app.metrics().is_enabled());

        config.observability.metrics_enabled = true;
        let app = Application::new(config, AppMode::Scheduler).unwrap();
        assert!(app.metrics().is_enabled());
    }

    #[test]
    fn test_mode_components() {
        assert!(AppMode::All.runs_scheduler() && AppMode::All.runs_worker());
        assert!(!AppMode::Worker.runs_scheduler());
        assert!(!AppMode::Scheduler.runs_worker());
    }
}

//! 测试辅助函数

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use tokio::time::sleep;

pub struct TestEnv;

impl TestEnv {
    /// 轮询等待条件成立，超时返回 `false`
    pub async fn wait_for<F, Fut>(mut condition: F, timeout: Duration) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if condition().await {
                return true;
            }
            sleep(Duration::from_millis(20)).await;
        }
        condition().await
    }

    /// 固定的激活时间，便于断言批次ID
    pub fn activation() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 10, 10, 30, 0)
            .single()
            .unwrap_or_else(Utc::now)
    }
}


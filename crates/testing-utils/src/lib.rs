//! # Batch Scheduler Testing Utils
//!
//! 各crate共享的测试工具：
//!
//! - **Mock存储**：[`MockMetadataStore`]、[`MockExecLogStore`] 内存实现
//! - **脚本化Worker**：[`ScriptedWorkerClient`] 按地址编排回复并记录每次调用
//! - **测试数据构建器**：调度、作业、任务的Builder
//! - **辅助函数**：条件等待等
//!
//! ```toml
//! [dev-dependencies]
//! batch-testing-utils = { path = "../testing-utils" }
//! ```

pub mod builders;
pub mod helpers;
pub mod mocks;

pub use builders::*;
pub use helpers::*;
pub use mocks::*;

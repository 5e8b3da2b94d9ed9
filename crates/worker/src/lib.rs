//! 任务执行端
//!
//! 接收调度端通过 `POST /rpc/execute` 发来的任务，在本机shell中执行命令并返回输出。

pub mod executor;
pub mod server;

pub use executor::{ShellExecutor, TaskExecutor};
pub use server::{serve, WorkerServer};

//! 配置管理
//!
//! 配置按以下顺序叠加：内置默认值、TOML配置文件、`BATCH_` 前缀的环境变量。
//! 加载后的 [`AppConfig`] 以值的形式传入各组件的构造函数，不存在全局配置对象。

pub mod models;

pub use models::*;

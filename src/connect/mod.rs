//! Connector-management API: typed client and lifecycle workflows.
//!
//! 模块划分：
//! - client：带重试的 REST 客户端（`ConnectorApi` 的默认实现）
//! - lifecycle：创建/重建/重启/暂停等工作流，同名串行
//! - types：状态、任务、插件等响应结构

mod client;
pub mod config;
mod error;
mod lifecycle;
mod types;

pub use client::{ConnectorApi, ConnectorClient};
pub use config::{ConnectConf, LifecycleConf};
pub use error::{ConnectError, ConnectResult, LifecycleError, LifecycleResult};
pub use lifecycle::ConnectorLifecycleManager;
pub use types::{
    ConnectorConfig, ConnectorInfo, ConnectorKind, ConnectorState, ConnectorStatus, PluginInfo,
    StatusLookup, TaskId, TaskStatus, ValidationReport,
};

//! CDC pipeline coordination.
//!
//! - `connect`：连接器管理 REST 客户端与生命周期工作流
//! - `generator`：按引擎生成 sink/source 连接器配置（纯函数）
//! - `ingest`：消费变更事件、批量落库、落库后提交位点
//! - `offset`：读取源库当前位点（尽力而为）

pub mod conf;
pub mod connect;
pub mod descriptor;
pub mod generator;
pub mod ingest;
pub mod offset;
pub mod retry;

pub use conf::{ConfError, ConfResult, CoordinatorConf};
pub use descriptor::{ConnectionDescriptor, EngineType};
pub use retry::RetryPolicy;

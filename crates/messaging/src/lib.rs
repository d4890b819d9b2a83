//! relay-messaging - 消息总线连接管理
//!
//! - `ConnectionManager`: 单个逻辑连接的状态机（连接、自动重连、drain 关闭）
//! - `Transport` / `Connector`: 底层总线的抽象端口
//! - `memory`: 进程内总线实现，用于本地开发和测试

mod manager;
pub mod memory;
mod options;
mod state;
mod subscription;
mod transport;

pub use manager::*;
pub use options::*;
pub use state::*;
pub use subscription::*;
pub use transport::*;

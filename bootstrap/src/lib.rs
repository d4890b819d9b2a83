//! relay-bootstrap - 统一服务启动骨架
//!
//! 子系统初始化、关闭回调登记和应用生命周期，所有服务复用

mod lifecycle;
mod runtime;
mod setup;
mod shutdown;

pub use lifecycle::*;
pub use runtime::*;
pub use setup::*;
pub use shutdown::*;

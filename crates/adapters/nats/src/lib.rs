//! relay-adapter-nats - NATS 传输适配器
//!
//! 实现 `relay_messaging::Connector` / `Transport`，重连策略由 `ConnectionManager` 负责

mod connector;

pub use connector::*;

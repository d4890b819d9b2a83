//! ports - 抽象 trait 层
//!
//! 业务代码只依赖这里的接口，不直接依赖总线客户端类型

mod message_publisher;

pub use message_publisher::*;

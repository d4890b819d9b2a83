//! 总线传输层端口
//!
//! `ConnectionManager` 只通过这里的 trait 访问底层客户端

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use relay_errors::AppResult;
use tokio::sync::mpsc;

use crate::options::ConnectOptions;

/// 总线上收到的一条消息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub subject: String,
    pub payload: Bytes,
}

impl Message {
    pub fn new(subject: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            subject: subject.into(),
            payload: payload.into(),
        }
    }
}

/// 订阅返回的消息流，流结束表示订阅已失效（drain、close 或断线）
pub type MessageStream = BoxStream<'static, Message>;

/// 传输层异步通知
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// 连接断开
    Disconnected(String),
    /// 传输层自行恢复了连接
    Reconnected,
    /// 传输层已关闭，不会再恢复
    Closed,
}

pub type TransportEvents = mpsc::UnboundedReceiver<TransportEvent>;

/// 一次成功的连接：传输句柄和它的事件流
pub struct Connection {
    pub transport: Box<dyn Transport>,
    pub events: TransportEvents,
}

/// 已建立的底层连接
#[async_trait]
pub trait Transport: Send + Sync {
    /// 发布消息，不缓冲、不重试
    async fn publish(&self, subject: &str, payload: Bytes) -> AppResult<()>;

    /// 订阅 subject
    async fn subscribe(&self, subject: &str) -> AppResult<MessageStream>;

    /// 停止接收新消息，投递完已缓冲的消息并刷新出站缓冲区后关闭
    async fn drain(&self) -> AppResult<()>;

    /// 立即关闭
    async fn close(&self);

    /// 当前连接的服务器地址
    fn server_url(&self) -> Option<String> {
        None
    }
}

/// 建立底层连接（单次尝试，不重试）
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, options: &ConnectOptions) -> AppResult<Connection>;
}

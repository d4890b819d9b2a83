//! 连接选项

use std::time::Duration;

pub const DEFAULT_RECONNECT_WAIT: Duration = Duration::from_secs(2);
pub const DEFAULT_MAX_RECONNECTS: u32 = 60;
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// 最大重连次数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectLimit {
    Limited(u32),
    Unlimited,
}

impl ReconnectLimit {
    /// 从配置值转换：负数表示无限，0 表示使用默认值
    pub fn from_sentinel(value: i64) -> Self {
        match value {
            v if v < 0 => Self::Unlimited,
            0 => Self::Limited(DEFAULT_MAX_RECONNECTS),
            v => Self::Limited(u32::try_from(v).unwrap_or(u32::MAX)),
        }
    }

    /// 已经失败 `attempts` 次后是否还允许再试一次
    pub fn allows(&self, attempts: u32) -> bool {
        match self {
            Self::Limited(max) => attempts < *max,
            Self::Unlimited => true,
        }
    }
}

impl Default for ReconnectLimit {
    fn default() -> Self {
        Self::Limited(DEFAULT_MAX_RECONNECTS)
    }
}

/// 连接选项
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// 服务器地址
    pub url: String,
    /// 客户端名称（显示在服务端连接列表中）
    pub name: String,
    /// 两次重连之间的等待时间
    pub reconnect_wait: Duration,
    /// 最大重连次数（仅用于连接成功后的断线重连）
    pub max_reconnects: ReconnectLimit,
    /// 优雅关闭时 drain 的超时时间
    pub drain_timeout: Duration,
    /// 单次连接尝试的超时时间
    pub connect_timeout: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            url: "nats://localhost:4222".to_string(),
            name: "relay".to_string(),
            reconnect_wait: DEFAULT_RECONNECT_WAIT,
            max_reconnects: ReconnectLimit::default(),
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

impl ConnectOptions {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_reconnect_wait(mut self, wait: Duration) -> Self {
        self.reconnect_wait = wait;
        self
    }

    pub fn with_max_reconnects(mut self, limit: ReconnectLimit) -> Self {
        self.max_reconnects = limit;
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// 把零值时间替换为默认值
    pub fn normalized(mut self) -> Self {
        if self.reconnect_wait.is_zero() {
            self.reconnect_wait = DEFAULT_RECONNECT_WAIT;
        }
        if self.drain_timeout.is_zero() {
            self.drain_timeout = DEFAULT_DRAIN_TIMEOUT;
        }
        if self.connect_timeout.is_zero() {
            self.connect_timeout = DEFAULT_CONNECT_TIMEOUT;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconnect_limit_from_sentinel() {
        assert_eq!(ReconnectLimit::from_sentinel(-1), ReconnectLimit::Unlimited);
        assert_eq!(
            ReconnectLimit::from_sentinel(0),
            ReconnectLimit::Limited(DEFAULT_MAX_RECONNECTS)
        );
        assert_eq!(ReconnectLimit::from_sentinel(3), ReconnectLimit::Limited(3));
    }

    #[test]
    fn test_reconnect_limit_allows() {
        let limit = ReconnectLimit::Limited(2);
        assert!(limit.allows(0));
        assert!(limit.allows(1));
        assert!(!limit.allows(2));
        assert!(ReconnectLimit::Unlimited.allows(u32::MAX));
        assert!(!ReconnectLimit::Limited(0).allows(0));
    }

    #[test]
    fn test_normalized_fills_zero_durations() {
        let options = ConnectOptions::new("memory://test")
            .with_reconnect_wait(Duration::ZERO)
            .with_drain_timeout(Duration::ZERO)
            .normalized();

        assert_eq!(options.reconnect_wait, DEFAULT_RECONNECT_WAIT);
        assert_eq!(options.drain_timeout, DEFAULT_DRAIN_TIMEOUT);
        assert_eq!(options.connect_timeout, DEFAULT_CONNECT_TIMEOUT);
    }
}

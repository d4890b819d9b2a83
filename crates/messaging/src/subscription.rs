//! 订阅句柄

use tokio_util::sync::CancellationToken;
use tracing::debug;

/// 由 `ConnectionManager::subscribe` 返回
///
/// 取消后处理任务在当前消息处理完后退出；drop 句柄不会取消订阅
#[derive(Debug, Clone)]
pub struct Subscription {
    subject: String,
    token: CancellationToken,
}

impl Subscription {
    pub(crate) fn new(subject: impl Into<String>, token: CancellationToken) -> Self {
        Self {
            subject: subject.into(),
            token,
        }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// 取消订阅
    pub fn unsubscribe(&self) {
        if !self.token.is_cancelled() {
            debug!(subject = %self.subject, "Unsubscribing");
            self.token.cancel();
        }
    }

    pub fn is_active(&self) -> bool {
        !self.token.is_cancelled()
    }
}

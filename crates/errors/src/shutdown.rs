//! 关闭阶段的聚合错误
//!
//! 一个 registry 的 cleanup 会尝试所有回调，失败不会中断后续回调，
//! 所有失败按执行顺序收集到 `ShutdownError` 中

use std::fmt;

use thiserror::Error;

use crate::AppError;

/// 单个 cleanup 回调的失败记录
#[derive(Debug, Error)]
#[error("[{registry}] cleanup #{index} ({name}) failed: {source}")]
pub struct CleanupFailure {
    /// 所属 registry 名称
    pub registry: String,
    /// 注册时的序号
    pub index: usize,
    /// 回调名称
    pub name: String,
    #[source]
    pub source: AppError,
}

/// 聚合关闭错误
///
/// 顺序与回调执行顺序一致（即注册顺序的逆序）
#[derive(Debug, Default)]
pub struct ShutdownError {
    failures: Vec<CleanupFailure>,
}

impl ShutdownError {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, failure: CleanupFailure) {
        self.failures.push(failure);
    }

    /// 合并另一个 registry 的失败记录
    pub fn merge(&mut self, other: ShutdownError) {
        self.failures.extend(other.failures);
    }

    pub fn failures(&self) -> &[CleanupFailure] {
        &self.failures
    }

    pub fn len(&self) -> usize {
        self.failures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    /// 没有失败时返回 Ok
    pub fn into_result(self) -> Result<(), ShutdownError> {
        if self.failures.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl fmt::Display for ShutdownError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} cleanup step(s) failed", self.failures.len())?;
        for failure in &self.failures {
            write!(f, "; {}", failure)?;
        }
        Ok(())
    }
}

impl std::error::Error for ShutdownError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.failures
            .first()
            .map(|f| f as &(dyn std::error::Error + 'static))
    }
}

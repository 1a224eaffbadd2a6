//! 批处理结果与三态结果
//!
//! 每个批次的结局只有三种：远程成功、本地兜底、失败。
//! 失败由 [`resolve_batch`](super::batch_orchestrator::resolve_batch) 统一转成兜底结果，
//! 调用方看到的永远是"每个工作项恰好一条结果"。

use serde::{Deserialize, Serialize};

use crate::error::OrchestratorError;

/// 结果来源
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ResultOrigin {
    Remote,
    Fallback { reason: String },
}

/// 单个工作项的结果
#[derive(Debug, Clone, PartialEq)]
pub struct BatchResult<T> {
    pub work_item_id: String,
    pub output: T,
    pub confidence: f64,
    pub origin: ResultOrigin,
}

impl<T> BatchResult<T> {
    pub fn remote(work_item_id: impl Into<String>, output: T, confidence: f64) -> Self {
        Self {
            work_item_id: work_item_id.into(),
            output,
            confidence,
            origin: ResultOrigin::Remote,
        }
    }

    pub fn fallback(
        work_item_id: impl Into<String>,
        output: T,
        confidence: f64,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            work_item_id: work_item_id.into(),
            output,
            confidence,
            origin: ResultOrigin::Fallback {
                reason: reason.into(),
            },
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self.origin, ResultOrigin::Fallback { .. })
    }

    pub fn fallback_reason(&self) -> Option<&str> {
        match &self.origin {
            ResultOrigin::Fallback { reason } => Some(reason),
            ResultOrigin::Remote => None,
        }
    }
}

/// 一个批次的结局
#[derive(Debug)]
pub enum Outcome<T> {
    /// 远程调用并解析成功（可能缺少部分工作项，由 resolve 补齐）
    Remote(T),
    /// 未发送请求，直接给出本地结果
    Fallback(T, String),
    /// 调用或解析失败
    Failed(OrchestratorError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fallback_reason() {
        let remote = BatchResult::remote("1", 5.0, 0.9);
        assert!(!remote.is_fallback());
        assert_eq!(remote.fallback_reason(), None);

        let local = BatchResult::fallback("2", 0.0, 0.0, "解析失败");
        assert!(local.is_fallback());
        assert_eq!(local.fallback_reason(), Some("解析失败"));
    }
}

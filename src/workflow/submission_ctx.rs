//! 提交处理上下文
//!
//! 封装"我正在处理第几份提交、它的 ID 是什么"这一信息

use std::fmt::Display;

/// 提交处理上下文
#[derive(Debug, Clone)]
pub struct SubmissionCtx {
    /// 提交ID（持久化时作为逻辑键的一部分）
    pub submission_id: String,

    /// 提交索引（仅用于日志显示，从1开始）
    pub submission_index: usize,

    /// 评分标准标题
    pub guide_title: String,
}

impl SubmissionCtx {
    /// 创建新的提交上下文
    pub fn new(
        submission_id: impl Into<String>,
        submission_index: usize,
        guide_title: impl Into<String>,
    ) -> Self {
        Self {
            submission_id: submission_id.into(),
            submission_index,
            guide_title: guide_title.into(),
        }
    }
}

impl Display for SubmissionCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[提交 #{} ID#{} 标准#{}]",
            self.submission_index, self.submission_id, self.guide_title
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let ctx = SubmissionCtx::new("stu-42", 3, "期中物理");
        assert_eq!(ctx.to_string(), "[提交 #3 ID#stu-42 标准#期中物理]");
    }
}

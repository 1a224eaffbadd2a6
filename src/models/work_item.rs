use serde::{Deserialize, Serialize};

use crate::models::guide::GuideQuestion;

/// 提交给批处理器的最小工作单元
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: String,
    pub question_text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_answer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub student_answer: Option<String>,
    pub max_score: f64,
}

impl WorkItem {
    /// 由评分标准中的题目构建（映射阶段，尚无学生作答）
    pub fn from_guide(question: &GuideQuestion) -> Self {
        Self {
            id: question.id.clone(),
            question_text: question.text.clone(),
            expected_answer: question.expected_answer.clone(),
            student_answer: None,
            max_score: question.max_score,
        }
    }

    /// 附上映射得到的学生作答（评分阶段）
    pub fn with_answer(question: &GuideQuestion, answer: impl Into<String>) -> Self {
        Self {
            student_answer: Some(answer.into()),
            ..Self::from_guide(question)
        }
    }

    /// 学生作答（去除首尾空白），缺失时为空串
    pub fn answer_text(&self) -> &str {
        self.student_answer.as_deref().map(str::trim).unwrap_or("")
    }
}

/// 映射结果：某道题对应的学生作答
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappedAnswer {
    pub question_id: String,
    pub question_text: String,
    pub answer_text: String,
    pub confidence: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_answer_text_trims_and_defaults() {
        let q = GuideQuestion {
            id: "3".into(),
            text: "解释光合作用".into(),
            expected_answer: None,
            max_score: 5.0,
        };
        assert_eq!(WorkItem::from_guide(&q).answer_text(), "");
        assert_eq!(WorkItem::with_answer(&q, "  叶绿体  ").answer_text(), "叶绿体");
    }
}

use serde::{Deserialize, Serialize};

/// 评分标准中的一道题
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuideQuestion {
    pub id: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_answer: Option<String>,
    pub max_score: f64,
}

/// 评分标准（marking guide）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkingGuide {
    pub title: String,
    /// 评分时附带给模型的整体说明
    #[serde(default)]
    pub context: String,
    pub questions: Vec<GuideQuestion>,
    #[serde(skip_serializing, skip_deserializing)]
    pub file_path: Option<String>,
}

impl MarkingGuide {
    /// 满分
    pub fn total_marks(&self) -> f64 {
        self.questions.iter().map(|q| q.max_score).sum()
    }

    /// 评分时使用的上下文：标题 + 说明
    pub fn grading_context(&self) -> String {
        if self.context.trim().is_empty() {
            self.title.clone()
        } else {
            format!("{}\n{}", self.title, self.context.trim())
        }
    }
}

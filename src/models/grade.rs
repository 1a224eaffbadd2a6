//! 评分结果与等级划分

use serde::{Deserialize, Serialize};

use crate::config::Config;

/// 等级
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LetterGrade {
    A,
    B,
    C,
    D,
    F,
}

impl LetterGrade {
    pub fn as_str(self) -> &'static str {
        match self {
            LetterGrade::A => "A",
            LetterGrade::B => "B",
            LetterGrade::C => "C",
            LetterGrade::D => "D",
            LetterGrade::F => "F",
        }
    }
}

/// 百分比到等级的阈值
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GradeScale {
    pub a: f64,
    pub b: f64,
    pub c: f64,
    pub d: f64,
}

impl Default for GradeScale {
    fn default() -> Self {
        Self {
            a: 90.0,
            b: 80.0,
            c: 70.0,
            d: 60.0,
        }
    }
}

impl GradeScale {
    pub fn from_config(config: &Config) -> Self {
        Self {
            a: config.grade_a_threshold,
            b: config.grade_b_threshold,
            c: config.grade_c_threshold,
            d: config.grade_d_threshold,
        }
    }

    pub fn letter(&self, percentage: f64) -> LetterGrade {
        if percentage >= self.a {
            LetterGrade::A
        } else if percentage >= self.b {
            LetterGrade::B
        } else if percentage >= self.c {
            LetterGrade::C
        } else if percentage >= self.d {
            LetterGrade::D
        } else {
            LetterGrade::F
        }
    }
}

/// 得分率，结果落在 [0, 100]；满分不为正时记为 0
pub fn percentage(score: f64, max_score: f64) -> f64 {
    if max_score <= 0.0 || !score.is_finite() {
        return 0.0;
    }
    (score / max_score * 100.0).clamp(0.0, 100.0)
}

/// 单题评分记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradeRecord {
    pub question_id: String,
    pub question_text: String,
    pub student_answer: String,
    pub score: f64,
    pub max_score: f64,
    pub percentage: f64,
    pub letter: LetterGrade,
    pub feedback: String,
    pub strengths: Vec<String>,
    pub weaknesses: Vec<String>,
    pub confidence: f64,
    /// 是否建议人工复核（兜底评分时为 true）
    pub needs_review: bool,
    /// 兜底原因；远程评分时为 None
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_reason: Option<String>,
}

/// 整份提交的汇总
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradingSummary {
    pub submission_id: String,
    pub total_score: f64,
    pub max_score: f64,
    pub percentage: f64,
    pub letter: LetterGrade,
    pub question_count: usize,
    pub fallback_count: usize,
}

impl GradingSummary {
    pub fn from_records(submission_id: &str, records: &[GradeRecord], scale: &GradeScale) -> Self {
        let total_score: f64 = records.iter().map(|r| r.score).sum();
        let max_score: f64 = records.iter().map(|r| r.max_score).sum();
        let pct = percentage(total_score, max_score);
        Self {
            submission_id: submission_id.to_string(),
            total_score,
            max_score,
            percentage: pct,
            letter: scale.letter(pct),
            question_count: records.len(),
            fallback_count: records.iter().filter(|r| r.fallback_reason.is_some()).count(),
        }
    }
}

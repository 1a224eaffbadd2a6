//! 评分 - 按评分标准给每道题打分
//!
//! 远程评分失败时按作答长度估分：
//!
//! | 作答字符数 | 得分 |
//! |-----------|------|
//! | 0         | 0    |
//! | < 20      | 30%  |
//! | < 100     | 60%  |
//! | 其他      | 80%  |
//!
//! 兜底结果一律标记 `needs_review`。

use serde_json::{json, Value};
use std::sync::Arc;

use crate::clients::LanguageModel;
use crate::error::OrchestratorError;
use crate::models::{percentage, GradeRecord, GradeScale, WorkItem};
use crate::orchestrator::batch_orchestrator::{BatchConfig, BatchOrchestrator, BatchTask};
use crate::orchestrator::response_parser::{clip, f64_field, str_field, str_list_field};

/// 反馈上限（字符）
pub const MAX_FEEDBACK_CHARS: usize = 2000;
/// 作答上限（字符）
pub const MAX_ANSWER_CHARS: usize = 4000;
/// 优点 / 不足列表的条数上限
pub const MAX_LIST_ENTRIES: usize = 5;
/// 列表单条上限（字符）
pub const MAX_LIST_ENTRY_CHARS: usize = 300;

const DEFAULT_REMOTE_CONFIDENCE: f64 = 0.9;

const GRADING_SCHEMA: &str = r#"[{"question_id": string, "score": number, "feedback": string, "strengths": [string], "weaknesses": [string]}]"#;

/// 按作答长度估分
pub fn heuristic_score(answer: &str, max_score: f64) -> f64 {
    let chars = answer.trim().chars().count();
    let ratio = match chars {
        0 => 0.0,
        1..=19 => 0.3,
        20..=99 => 0.6,
        _ => 0.8,
    };
    max_score.max(0.0) * ratio
}

/// 评分任务
pub struct GradingTask<'a> {
    guide_context: &'a str,
    scale: GradeScale,
}

impl<'a> GradingTask<'a> {
    pub fn new(guide_context: &'a str, scale: GradeScale) -> Self {
        Self {
            guide_context,
            scale,
        }
    }

    fn record(
        &self,
        item: &WorkItem,
        score: f64,
        feedback: String,
        strengths: Vec<String>,
        weaknesses: Vec<String>,
        confidence: f64,
        needs_review: bool,
    ) -> GradeRecord {
        let max_score = item.max_score.max(0.0);
        let score = score.clamp(0.0, max_score);
        let pct = percentage(score, max_score);
        GradeRecord {
            question_id: item.id.clone(),
            question_text: item.question_text.clone(),
            student_answer: clip(item.answer_text(), MAX_ANSWER_CHARS),
            score,
            max_score,
            percentage: pct,
            letter: self.scale.letter(pct),
            feedback,
            strengths,
            weaknesses,
            confidence,
            needs_review,
            fallback_reason: None,
        }
    }
}

fn capped_list(entry: &Value, name: &str) -> Vec<String> {
    str_list_field(entry, name)
        .into_iter()
        .take(MAX_LIST_ENTRIES)
        .map(|s| clip(&s, MAX_LIST_ENTRY_CHARS))
        .collect()
}

impl BatchTask for GradingTask<'_> {
    type Output = GradeRecord;

    fn kind(&self) -> &'static str {
        "评分"
    }

    fn system_prompt(&self) -> String {
        format!(
            "你是一名严谨的阅卷老师。请依据参考答案和满分为每道题评分，\
             score 不得超过 max_score，并给出简短反馈、优点和不足。\n\n评分说明：\n{}",
            self.guide_context
        )
    }

    fn user_prompt(&self, items: &[&WorkItem]) -> String {
        let entries: Vec<Value> = items
            .iter()
            .map(|item| {
                json!({
                    "question_id": item.id,
                    "question_text": item.question_text,
                    "expected_answer": item.expected_answer.as_deref().unwrap_or(""),
                    "max_score": item.max_score,
                    "student_answer": item.answer_text(),
                })
            })
            .collect();
        format!("待评分题目：\n{}", Value::Array(entries))
    }

    fn schema_hint(&self) -> &'static str {
        GRADING_SCHEMA
    }

    fn parse_entry(&self, entry: &Value, item: &WorkItem) -> Result<(GradeRecord, f64), String> {
        let score = f64_field(entry, "score").ok_or("缺少 score")?;
        let feedback = str_field(entry, "feedback").ok_or("缺少 feedback")?;
        let confidence = f64_field(entry, "confidence")
            .unwrap_or(DEFAULT_REMOTE_CONFIDENCE)
            .clamp(0.0, 1.0);

        let record = self.record(
            item,
            score,
            clip(feedback.trim(), MAX_FEEDBACK_CHARS),
            capped_list(entry, "strengths"),
            capped_list(entry, "weaknesses"),
            confidence,
            false,
        );
        Ok((record, confidence))
    }

    fn fallback(&self, item: &WorkItem) -> (GradeRecord, f64) {
        let answer = item.answer_text();
        let feedback = if answer.is_empty() {
            "未检测到作答。自动评分不可用，建议人工复核。"
        } else {
            "自动评分不可用，已按作答长度给出估计分，建议人工复核。"
        };
        let record = self.record(
            item,
            heuristic_score(answer, item.max_score),
            feedback.to_string(),
            Vec::new(),
            Vec::new(),
            0.0,
            true,
        );
        (record, 0.0)
    }

    fn parse_error(&self, reason: String) -> OrchestratorError {
        OrchestratorError::GradingParse(reason)
    }
}

/// 评分编排器
#[derive(Clone)]
pub struct GradingOrchestrator {
    batch: BatchOrchestrator,
    scale: GradeScale,
}

impl GradingOrchestrator {
    pub fn new(model: Arc<dyn LanguageModel>, config: BatchConfig, scale: GradeScale) -> Self {
        Self {
            batch: BatchOrchestrator::new(model, config),
            scale,
        }
    }

    pub fn scale(&self) -> &GradeScale {
        &self.scale
    }

    /// 为已映射的作答评分，结果与 `mapped_items` 同序
    ///
    /// 兜底记录的 `fallback_reason` 会被填上
    pub async fn grade_mapped(&self, mapped_items: &[WorkItem], guide_context: &str) -> Vec<GradeRecord> {
        let task = GradingTask::new(guide_context, self.scale);
        self.batch
            .process(&task, mapped_items)
            .await
            .into_iter()
            .map(|result| {
                let reason = result.fallback_reason().map(str::to_owned);
                let mut record = result.output;
                record.confidence = result.confidence;
                if reason.is_some() {
                    record.fallback_reason = reason;
                    record.needs_review = true;
                }
                record
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LlmError;
    use crate::models::LetterGrade;
    use crate::orchestrator::testing::ScriptedModel;
    use std::time::Duration;

    fn item(id: &str, answer: &str, max_score: f64) -> WorkItem {
        WorkItem {
            id: id.into(),
            question_text: format!("题目 {}", id),
            expected_answer: Some("参考答案".into()),
            student_answer: Some(answer.into()),
            max_score,
        }
    }

    fn grader(model: &Arc<ScriptedModel>) -> GradingOrchestrator {
        let config = BatchConfig {
            call_backoff: Duration::ZERO,
            ..BatchConfig::default()
        };
        GradingOrchestrator::new(model.clone(), config, GradeScale::default())
    }

    #[test]
    fn test_heuristic_thresholds() {
        assert_eq!(heuristic_score("", 10.0), 0.0);
        assert_eq!(heuristic_score("   ", 10.0), 0.0);
        assert_eq!(heuristic_score("短答", 10.0), 3.0);
        assert_eq!(heuristic_score(&"a".repeat(19), 10.0), 3.0);
        assert_eq!(heuristic_score(&"a".repeat(20), 10.0), 6.0);
        assert_eq!(heuristic_score(&"a".repeat(99), 10.0), 6.0);
        assert_eq!(heuristic_score(&"a".repeat(100), 10.0), 8.0);
    }

    #[tokio::test]
    async fn test_remote_grades_are_validated() {
        let long_feedback = "好".repeat(MAX_FEEDBACK_CHARS + 10);
        let response = json!({"grades": [
            {
                "question_id": "1",
                "score": 12,
                "feedback": long_feedback,
                "strengths": ["a", "b", "c", "d", "e", "f", "g"],
                "weaknesses": ["x".repeat(MAX_LIST_ENTRY_CHARS + 5)]
            },
            {"question_id": "2", "score": -3, "feedback": "未答到要点", "strengths": [], "weaknesses": []}
        ]})
        .to_string();
        let model = ScriptedModel::new(move |_, _| Ok(response.clone()));
        let records = grader(&model)
            .grade_mapped(&[item("1", "完整作答", 10.0), item("2", "错误", 5.0)], "期中考试")
            .await;

        assert_eq!(records.len(), 2);
        let first = &records[0];
        assert_eq!(first.score, 10.0);
        assert_eq!(first.percentage, 100.0);
        assert_eq!(first.letter, LetterGrade::A);
        assert_eq!(first.feedback.chars().count(), MAX_FEEDBACK_CHARS);
        assert_eq!(first.strengths.len(), MAX_LIST_ENTRIES);
        assert_eq!(first.weaknesses[0].chars().count(), MAX_LIST_ENTRY_CHARS);
        assert!(!first.needs_review);
        assert!(first.fallback_reason.is_none());

        assert_eq!(records[1].score, 0.0);
        assert_eq!(records[1].letter, LetterGrade::F);
    }

    #[tokio::test]
    async fn test_call_failure_uses_length_heuristic() {
        let model = ScriptedModel::new(|_, _| Err(LlmError::api_failed("test", "429 Too Many Requests")));
        let records = grader(&model)
            .grade_mapped(
                &[item("1", "", 10.0), item("2", "短答", 10.0), item("3", &"字".repeat(150), 10.0)],
                "",
            )
            .await;

        let scores: Vec<f64> = records.iter().map(|r| r.score).collect();
        assert_eq!(scores, vec![0.0, 3.0, 8.0]);
        assert!(records.iter().all(|r| r.needs_review));
        assert!(records
            .iter()
            .all(|r| r.fallback_reason.as_deref().unwrap_or_default().contains("429")));
        assert_eq!(model.call_count(), 2);
    }

    #[tokio::test]
    async fn test_missing_required_field_falls_back_after_cleanup() {
        let model = ScriptedModel::new(|_, _| Ok(r#"[{"question_id": "1", "feedback": "没有分数"}]"#.to_string()));
        let records = grader(&model).grade_mapped(&[item("1", "作答内容", 4.0)], "").await;

        assert_eq!(records.len(), 1);
        assert!(records[0].needs_review);
        assert!(records[0]
            .fallback_reason
            .as_deref()
            .unwrap_or_default()
            .contains("评分结果解析失败"));
        assert_eq!(model.call_count(), 2);
    }
}

//! 答案映射 - 把提交全文拆到评分标准的每道题上
//!
//! 远程映射失败时按题号标记切分原文：`Q1`、`Question 1`、`1.`、`1)`、`第1题`。
//! 找到片段的置信度为 0.2，找不到则给空作答、置信度 0。

use regex::Regex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::clients::LanguageModel;
use crate::error::OrchestratorError;
use crate::models::{GuideQuestion, MappedAnswer, WorkItem};
use crate::orchestrator::batch_orchestrator::{
    resolve_batch, BatchConfig, BatchOrchestrator, BatchTask,
};
use crate::orchestrator::outcome::{BatchResult, Outcome};
use crate::orchestrator::response_parser::{clip, f64_field, str_field};

/// 作答文本上限（字符）
pub const MAX_ANSWER_CHARS: usize = 4000;

/// 模型未给出置信度时使用
const DEFAULT_REMOTE_CONFIDENCE: f64 = 0.5;

const SCANNED_CONFIDENCE: f64 = 0.2;

const MAPPING_SCHEMA: &str = r#"[{"question_id": string, "question_text": string, "answer_text": string, "confidence": number (0-1)}]"#;

/// 映射任务
pub struct MappingTask<'a> {
    submission_text: &'a str,
    /// 题号扫描得到的片段：题目 id → 原文
    scanned: HashMap<String, String>,
}

impl<'a> MappingTask<'a> {
    pub fn new(guide_questions: &[GuideQuestion], submission_text: &'a str) -> Self {
        let sections = scan_markers(submission_text);
        let scanned = guide_questions
            .iter()
            .enumerate()
            .filter_map(|(pos, q)| {
                let number = question_number(&q.id).unwrap_or(pos as u32 + 1);
                sections.get(&number).map(|text| (q.id.clone(), text.clone()))
            })
            .collect();
        Self {
            submission_text,
            scanned,
        }
    }
}

impl BatchTask for MappingTask<'_> {
    type Output = MappedAnswer;

    fn kind(&self) -> &'static str {
        "映射"
    }

    fn system_prompt(&self) -> String {
        "你是一名阅卷助手。下面给出若干道题目和一名学生提交的完整作答文本。\
         请为每道题找出学生对应的作答原文，不要改写或补充；找不到的题目 answer_text 留空、confidence 为 0。"
            .to_string()
    }

    fn user_prompt(&self, items: &[&WorkItem]) -> String {
        let questions: Vec<Value> = items
            .iter()
            .map(|item| json!({"question_id": item.id, "question_text": item.question_text}))
            .collect();
        format!(
            "题目列表：\n{}\n\n学生提交内容：\n{}",
            Value::Array(questions),
            self.submission_text
        )
    }

    fn schema_hint(&self) -> &'static str {
        MAPPING_SCHEMA
    }

    fn parse_entry(&self, entry: &Value, item: &WorkItem) -> Result<(MappedAnswer, f64), String> {
        let answer = str_field(entry, "answer_text").ok_or("缺少 answer_text")?;
        let confidence = f64_field(entry, "confidence")
            .unwrap_or(DEFAULT_REMOTE_CONFIDENCE)
            .clamp(0.0, 1.0);
        Ok((
            MappedAnswer {
                question_id: item.id.clone(),
                question_text: item.question_text.clone(),
                answer_text: clip(answer.trim(), MAX_ANSWER_CHARS),
                confidence,
            },
            confidence,
        ))
    }

    fn fallback(&self, item: &WorkItem) -> (MappedAnswer, f64) {
        let (answer_text, confidence) = match self.scanned.get(&item.id) {
            Some(text) if !text.is_empty() => (clip(text, MAX_ANSWER_CHARS), SCANNED_CONFIDENCE),
            _ => (String::new(), 0.0),
        };
        (
            MappedAnswer {
                question_id: item.id.clone(),
                question_text: item.question_text.clone(),
                answer_text,
                confidence,
            },
            confidence,
        )
    }

    fn parse_error(&self, reason: String) -> OrchestratorError {
        OrchestratorError::MappingParse(reason)
    }
}

/// 题目 id 中的第一段数字，如 `q3` → 3
fn question_number(id: &str) -> Option<u32> {
    let digits: String = id
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

/// 按题号标记切分文本，返回 题号 → 片段（同一题号以第一次出现为准）
pub fn scan_markers(text: &str) -> HashMap<u32, String> {
    let mut sections = HashMap::new();
    let Ok(re) = Regex::new(
        r"(?mi)^[ \t]*(?:question[ \t]*(\d+)|q[ \t]*(\d+)|第[ \t]*(\d+)[ \t]*题|(\d+)[ \t]*[.)）、])",
    ) else {
        return sections;
    };

    let mut markers: Vec<(u32, usize, usize)> = Vec::new();
    for caps in re.captures_iter(text) {
        let Some(whole) = caps.get(0) else { continue };
        // "3.5" 这样的小数不是题号
        if text[whole.end()..].starts_with(|c: char| c.is_ascii_digit()) {
            continue;
        }
        let number = (1..=4)
            .filter_map(|i| caps.get(i))
            .find_map(|m| m.as_str().parse::<u32>().ok());
        if let Some(number) = number {
            markers.push((number, whole.start(), whole.end()));
        }
    }

    for (i, &(number, _, end)) in markers.iter().enumerate() {
        let next_start = markers.get(i + 1).map(|m| m.1).unwrap_or(text.len());
        let body = text[end..next_start]
            .trim_start_matches(|c: char| c.is_whitespace() || ".:：)）、-".contains(c))
            .trim()
            .to_string();
        sections.entry(number).or_insert(body);
    }
    sections
}

/// 答案映射编排器
#[derive(Clone)]
pub struct MappingOrchestrator {
    batch: BatchOrchestrator,
}

impl MappingOrchestrator {
    pub fn new(model: Arc<dyn LanguageModel>, config: BatchConfig) -> Self {
        Self {
            batch: BatchOrchestrator::new(model, config),
        }
    }

    /// 把提交文本映射到每道题，结果与 `guide_questions` 同序
    pub async fn map_answers(
        &self,
        guide_questions: &[GuideQuestion],
        submission_text: &str,
    ) -> Vec<BatchResult<MappedAnswer>> {
        let task = MappingTask::new(guide_questions, submission_text);
        let items: Vec<WorkItem> = guide_questions.iter().map(WorkItem::from_guide).collect();
        debug!(
            "[映射] 题号扫描命中 {}/{} 题",
            task.scanned.len(),
            guide_questions.len()
        );

        if submission_text.trim().is_empty() {
            info!("[映射] 提交内容为空，全部题目记为未作答");
            let refs: Vec<&WorkItem> = items.iter().collect();
            return resolve_batch(
                &task,
                &refs,
                Outcome::Fallback(Vec::new(), "提交内容为空".to_string()),
            );
        }

        self.batch.process(&task, &items).await
    }
}

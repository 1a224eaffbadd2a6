//! 分批编排器 - 编排层
//!
//! ## 职责
//!
//! 把一组工作项切成若干批次发给语言模型，并保证每个工作项恰好得到一条结果。
//!
//! ## 处理步骤
//!
//! 1. **切分**：按 `max_items_per_batch` 切块，请求超出字节预算时对半拆分（带深度的工作队列）
//! 2. **调用**：每批一次低温调用，失败时重试至 `max_call_attempts` 次
//! 3. **解析**：解析失败时追加一次"整理成 JSON"的调用，仍失败则整批兜底
//! 4. **校验**：由具体任务完成字段校验、截断和夹取
//! 5. **补齐**：缺失的工作项用兜底结果补齐
//!
//! 映射和评分是同一算法的两个实例，差异都在 [`BatchTask`] 里。

use futures::stream::{self, StreamExt};
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::clients::LanguageModel;
use crate::config::Config;
use crate::error::{LlmError, OrchestratorError};
use crate::models::WorkItem;
use crate::orchestrator::outcome::{BatchResult, Outcome};
use crate::orchestrator::response_parser;
use crate::utils::retry::{retry_with_backoff, RetryPolicy};

/// 二次整理调用的系统提示
pub(crate) const CLEANUP_SYSTEM_PROMPT: &str =
    "你是一个格式整理助手。把用户给出的内容整理成符合结构说明的 JSON 数组，不要增删任何条目的含义。";

/// 一种批处理任务（映射、评分）
pub trait BatchTask: Send + Sync {
    type Output: Send;

    /// 任务名称，用于日志
    fn kind(&self) -> &'static str;

    fn system_prompt(&self) -> String;

    fn user_prompt(&self, items: &[&WorkItem]) -> String;

    /// 期望的 JSON 结构说明
    fn schema_hint(&self) -> &'static str;

    /// 校验单个条目，返回 (结果, 置信度)；缺少必需字段时返回 Err
    fn parse_entry(&self, entry: &Value, item: &WorkItem) -> Result<(Self::Output, f64), String>;

    /// 本地兜底结果，返回 (结果, 置信度)
    fn fallback(&self, item: &WorkItem) -> (Self::Output, f64);

    /// 把解析失败原因包装成对应的错误类型
    fn parse_error(&self, reason: String) -> OrchestratorError;
}

/// 分批参数
#[derive(Debug, Clone, PartialEq)]
pub struct BatchConfig {
    pub max_items_per_batch: usize,
    /// 单次请求（系统提示 + 用户提示 + 结构说明）的字节上限
    pub budget_bytes: usize,
    pub max_split_depth: u32,
    pub max_call_attempts: u32,
    pub max_concurrent_batches: usize,
    /// 调用失败后的等待
    pub call_backoff: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_items_per_batch: 8,
            budget_bytes: 24 * 1024,
            max_split_depth: 3,
            max_call_attempts: 2,
            max_concurrent_batches: 1,
            call_backoff: Duration::from_millis(500),
        }
    }
}

impl BatchConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_items_per_batch: config.max_items_per_batch.max(1),
            budget_bytes: config.prompt_budget_bytes,
            max_split_depth: config.max_split_depth,
            max_call_attempts: config.max_call_attempts.max(1),
            max_concurrent_batches: config.max_concurrent_batches.max(1),
            ..Self::default()
        }
    }

    fn call_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_call_attempts.max(1),
            base_delay: self.call_backoff,
            max_delay: self.call_backoff.saturating_mul(4),
            jitter: Duration::ZERO,
        }
    }
}

/// 无法放进预算的一组工作项
#[derive(Debug, Clone, PartialEq)]
pub struct OversizedGroup {
    pub indices: Vec<usize>,
    pub bytes: usize,
}

/// 切分结果：批次内是工作项下标，保持输入顺序
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BatchPlan {
    pub batches: Vec<Vec<usize>>,
    pub oversized: Vec<OversizedGroup>,
}

/// 一次请求的字节数
pub fn request_bytes<T: BatchTask>(task: &T, items: &[&WorkItem]) -> usize {
    task.system_prompt().len() + task.user_prompt(items).len() + task.schema_hint().len()
}

/// 切分工作项
///
/// 先按条数切块，再对超出预算的块对半拆分；拆分深度达到上限或只剩一项仍超出预算的，
/// 归入 `oversized`，不会被发送
pub fn plan_batches<T: BatchTask>(
    task: &T,
    items: &[WorkItem],
    config: &BatchConfig,
    budget: usize,
) -> BatchPlan {
    let chunk_size = config.max_items_per_batch.max(1);
    let all: Vec<usize> = (0..items.len()).collect();
    let mut worklist: VecDeque<(Vec<usize>, u32)> = all
        .chunks(chunk_size)
        .map(|chunk| (chunk.to_vec(), 0))
        .collect();

    let mut plan = BatchPlan::default();
    while let Some((indices, depth)) = worklist.pop_front() {
        let refs: Vec<&WorkItem> = indices.iter().map(|&i| &items[i]).collect();
        let bytes = request_bytes(task, &refs);

        if bytes <= budget {
            plan.batches.push(indices);
        } else if indices.len() == 1 || depth >= config.max_split_depth {
            debug!(
                "[{}] {} 项请求 {} 字节超出预算 {} (深度 {})",
                task.kind(),
                indices.len(),
                bytes,
                budget,
                depth
            );
            plan.oversized.push(OversizedGroup { indices, bytes });
        } else {
            let mid = indices.len() / 2;
            let (left, right) = indices.split_at(mid);
            worklist.push_front((right.to_vec(), depth + 1));
            worklist.push_front((left.to_vec(), depth + 1));
        }
    }
    plan
}

/// 把一个批次的结局转成按工作项顺序排列的结果
///
/// - `Remote`：缺失的工作项补兜底
/// - `Fallback`：已有结果原样保留，其余按给定原因兜底
/// - `Failed`：整批兜底，原因为错误信息
pub fn resolve_batch<T: BatchTask>(
    task: &T,
    items: &[&WorkItem],
    outcome: Outcome<Vec<BatchResult<T::Output>>>,
) -> Vec<BatchResult<T::Output>> {
    let (results, missing_reason) = match outcome {
        Outcome::Remote(results) => (results, "模型未返回该题结果".to_string()),
        Outcome::Fallback(results, reason) => (results, reason),
        Outcome::Failed(err) => (Vec::new(), err.to_string()),
    };

    let mut by_id: HashMap<String, BatchResult<T::Output>> = HashMap::new();
    for result in results {
        by_id.entry(result.work_item_id.clone()).or_insert(result);
    }

    items
        .iter()
        .map(|item| {
            by_id.remove(&item.id).unwrap_or_else(|| {
                let (output, confidence) = task.fallback(item);
                BatchResult::fallback(item.id.clone(), output, confidence, missing_reason.clone())
            })
        })
        .collect()
}

/// 解析并校验一次响应
///
/// 未知 id 忽略，重复 id 保留第一条；任一已知条目缺少必需字段视为结构错误
fn parse_response<T: BatchTask>(
    task: &T,
    items: &[&WorkItem],
    raw: &str,
) -> Result<Vec<BatchResult<T::Output>>, String> {
    let entries = response_parser::extract_entries(raw)?;
    let mut seen = HashSet::new();
    let mut results = Vec::new();

    for entry in &entries {
        let id = response_parser::entry_id(entry).ok_or_else(|| "条目缺少 question_id".to_string())?;
        let Some(item) = items.iter().find(|item| item.id == id) else {
            debug!("[{}] 忽略未知题目 {}", task.kind(), id);
            continue;
        };
        if !seen.insert(id.clone()) {
            debug!("[{}] 忽略重复题目 {}", task.kind(), id);
            continue;
        }
        let (output, confidence) = task
            .parse_entry(entry, item)
            .map_err(|reason| format!("题目 {}: {}", id, reason))?;
        let confidence = if confidence.is_finite() {
            confidence.clamp(0.0, 1.0)
        } else {
            0.0
        };
        results.push(BatchResult::remote(id, output, confidence));
    }

    if results.is_empty() && !items.is_empty() {
        return Err("响应中没有任何可用条目".to_string());
    }
    Ok(results)
}

/// 分批编排器
#[derive(Clone)]
pub struct BatchOrchestrator {
    model: Arc<dyn LanguageModel>,
    config: BatchConfig,
}

impl BatchOrchestrator {
    pub fn new(model: Arc<dyn LanguageModel>, config: BatchConfig) -> Self {
        Self { model, config }
    }

    /// 按配置中的预算处理
    pub async fn process<T: BatchTask>(
        &self,
        task: &T,
        items: &[WorkItem],
    ) -> Vec<BatchResult<T::Output>> {
        self.process_with_budget(task, items, self.config.budget_bytes)
            .await
    }

    /// 处理全部工作项，返回与输入一一对应（同序）的结果
    pub async fn process_with_budget<T: BatchTask>(
        &self,
        task: &T,
        items: &[WorkItem],
        budget: usize,
    ) -> Vec<BatchResult<T::Output>> {
        if items.is_empty() {
            return Vec::new();
        }

        let kind = task.kind();
        let plan = plan_batches(task, items, &self.config, budget);
        let total_batches = plan.batches.len();
        info!(
            "[{}] 共 {} 项, 分为 {} 批, {} 组超出预算",
            kind,
            items.len(),
            total_batches,
            plan.oversized.len()
        );

        let mut slots: Vec<Option<BatchResult<T::Output>>> = items.iter().map(|_| None).collect();

        for group in &plan.oversized {
            let refs: Vec<&WorkItem> = group.indices.iter().map(|&i| &items[i]).collect();
            let reason = OrchestratorError::BatchTooLarge {
                bytes: group.bytes,
                budget,
            }
            .to_string();
            warn!("[{}] ⚠️ {} 项未发送: {}", kind, refs.len(), reason);
            let results = resolve_batch(task, &refs, Outcome::Fallback(Vec::new(), reason));
            for (&index, result) in group.indices.iter().zip(results) {
                slots[index] = Some(result);
            }
        }

        let resolved: Vec<(Vec<usize>, Vec<BatchResult<T::Output>>)> =
            stream::iter(plan.batches.into_iter().enumerate())
                .map(|(n, indices)| async move {
                    let batch: Vec<&WorkItem> = indices.iter().map(|&i| &items[i]).collect();
                    let label = format!("{} 批次 {}/{}", kind, n + 1, total_batches);
                    let outcome = self.run_batch(task, &batch, &label, budget).await;
                    if let Outcome::Failed(e) = &outcome {
                        warn!("[{}] ❌ 整批兜底: {}", label, e);
                    }
                    let results = resolve_batch(task, &batch, outcome);
                    (indices, results)
                })
                .buffer_unordered(self.config.max_concurrent_batches.max(1))
                .collect()
                .await;

        for (indices, results) in resolved {
            for (index, result) in indices.into_iter().zip(results) {
                slots[index] = Some(result);
            }
        }

        let output: Vec<BatchResult<T::Output>> = slots
            .into_iter()
            .zip(items)
            .map(|(slot, item)| {
                slot.unwrap_or_else(|| {
                    let (output, confidence) = task.fallback(item);
                    BatchResult::fallback(item.id.clone(), output, confidence, "未分配到任何批次")
                })
            })
            .collect();

        let fallbacks = output.iter().filter(|r| r.is_fallback()).count();
        info!(
            "[{}] ✓ 完成: 远程 {} 项, 兜底 {} 项",
            kind,
            output.len() - fallbacks,
            fallbacks
        );
        output
    }

    /// 执行一个批次：调用（带重试）→ 解析 →（必要时）整理后再解析
    async fn run_batch<T: BatchTask>(
        &self,
        task: &T,
        batch: &[&WorkItem],
        label: &str,
        budget: usize,
    ) -> Outcome<Vec<BatchResult<T::Output>>> {
        let system_prompt = task.system_prompt();
        let user_prompt = task.user_prompt(batch);
        let schema_hint = task.schema_hint();

        debug!("[{}] 发送 {} 项, {} 字节", label, batch.len(), user_prompt.len());

        let raw = match retry_with_backoff(
            &self.config.call_policy(),
            label,
            |_: &LlmError| true,
            |_| self.model.complete(&system_prompt, &user_prompt, schema_hint),
        )
        .await
        {
            Ok((raw, _attempts)) => raw,
            Err(e) => return Outcome::Failed(OrchestratorError::Call(e.into_inner())),
        };

        let first_error = match parse_response(task, batch, &raw) {
            Ok(results) => return Outcome::Remote(results),
            Err(reason) => reason,
        };

        let cleanup_prompt = format!("需要整理的内容：\n{}", raw);
        let cleanup_bytes = CLEANUP_SYSTEM_PROMPT.len() + cleanup_prompt.len() + schema_hint.len();
        if cleanup_bytes > budget {
            warn!(
                "[{}] ⚠️ 响应不符合结构 ({}), 整理请求 {} 字节超出预算 {}, 放弃整理",
                label, first_error, cleanup_bytes, budget
            );
            return Outcome::Failed(task.parse_error(format!(
                "{}; 整理请求 {} 字节超出预算 {} 字节",
                first_error, cleanup_bytes, budget
            )));
        }

        warn!("[{}] ⚠️ 响应不符合结构 ({}), 尝试整理", label, first_error);
        let cleaned = match self
            .model
            .complete(CLEANUP_SYSTEM_PROMPT, &cleanup_prompt, schema_hint)
            .await
        {
            Ok(cleaned) => cleaned,
            Err(e) => return Outcome::Failed(OrchestratorError::Call(e)),
        };

        match parse_response(task, batch, &cleaned) {
            Ok(results) => {
                info!("[{}] ✓ 整理后解析成功", label);
                Outcome::Remote(results)
            }
            Err(reason) => Outcome::Failed(task.parse_error(reason)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::testing::ScriptedModel;
    use serde_json::json;

    /// 最简单的任务：每项返回一个 answer 字段
    struct EchoTask;

    impl BatchTask for EchoTask {
        type Output = String;

        fn kind(&self) -> &'static str {
            "测试"
        }

        fn system_prompt(&self) -> String {
            "system".to_string()
        }

        fn user_prompt(&self, items: &[&WorkItem]) -> String {
            let ids: Vec<&str> = items.iter().map(|i| i.id.as_str()).collect();
            json!(ids).to_string()
        }

        fn schema_hint(&self) -> &'static str {
            r#"[{"question_id": string, "answer": string}]"#
        }

        fn parse_entry(&self, entry: &Value, _item: &WorkItem) -> Result<(String, f64), String> {
            let answer = response_parser::str_field(entry, "answer").ok_or("缺少 answer")?;
            Ok((answer.to_string(), 0.9))
        }

        fn fallback(&self, _item: &WorkItem) -> (String, f64) {
            ("兜底".to_string(), 0.0)
        }

        fn parse_error(&self, reason: String) -> OrchestratorError {
            OrchestratorError::MappingParse(reason)
        }
    }

    fn items(n: usize) -> Vec<WorkItem> {
        (1..=n)
            .map(|i| WorkItem {
                id: format!("q{:02}", i),
                question_text: format!("题目 {}", i),
                expected_answer: None,
                student_answer: None,
                max_score: 1.0,
            })
            .collect()
    }

    fn ids_in(user_prompt: &str) -> Vec<String> {
        serde_json::from_str(user_prompt).unwrap_or_default()
    }

    fn answer_all(user_prompt: &str) -> String {
        let entries: Vec<Value> = ids_in(user_prompt)
            .into_iter()
            .map(|id| json!({"question_id": id, "answer": format!("答案 {}", id)}))
            .collect();
        json!(entries).to_string()
    }

    fn config() -> BatchConfig {
        BatchConfig {
            call_backoff: Duration::ZERO,
            budget_bytes: 1 << 20,
            ..BatchConfig::default()
        }
    }

    fn orchestrator(model: &Arc<ScriptedModel>, config: BatchConfig) -> BatchOrchestrator {
        BatchOrchestrator::new(model.clone(), config)
    }

    #[tokio::test]
    async fn test_empty_input_yields_empty_output() {
        let model = ScriptedModel::new(|_, user| Ok(answer_all(user)));
        let results = orchestrator(&model, config()).process(&EchoTask, &[]).await;
        assert!(results.is_empty());
        assert_eq!(model.call_count(), 0);
    }

    #[tokio::test]
    async fn test_twenty_five_items_third_batch_fails() {
        let model = ScriptedModel::new(|_, user| {
            if ids_in(user).iter().any(|id| id == "q17") {
                Err(LlmError::api_failed("test", "503 Service Unavailable"))
            } else {
                Ok(answer_all(user))
            }
        });
        let work = items(25);
        let results = orchestrator(&model, config()).process(&EchoTask, &work).await;

        assert_eq!(results.len(), 25);
        for (result, item) in results.iter().zip(&work) {
            assert_eq!(result.work_item_id, item.id);
        }
        let fallback_ids: Vec<&str> = results
            .iter()
            .filter(|r| r.is_fallback())
            .map(|r| r.work_item_id.as_str())
            .collect();
        let expected: Vec<String> = (17..=24).map(|i| format!("q{:02}", i)).collect();
        assert_eq!(fallback_ids, expected.iter().map(String::as_str).collect::<Vec<_>>());
        assert_eq!(results.iter().filter(|r| !r.is_fallback()).count(), 17);

        // 批次 8,8,8,1；第三批调用两次
        assert_eq!(model.batch_sizes(), vec![8, 8, 8, 8, 1]);
        assert_eq!(model.call_count(), 5);
    }

    #[tokio::test]
    async fn test_oversized_chunks_are_halved() {
        let model = ScriptedModel::new(|_, user| Ok(answer_all(user)));
        let work = items(16);
        let first_four: Vec<&WorkItem> = work.iter().take(4).collect();
        let budget = request_bytes(&EchoTask, &first_four);

        let results = orchestrator(&model, config())
            .process_with_budget(&EchoTask, &work, budget)
            .await;

        assert_eq!(results.len(), 16);
        assert!(results.iter().all(|r| !r.is_fallback()));
        assert!(model.batch_sizes().iter().all(|&n| n <= 4));
        assert_eq!(model.call_count(), 4);
    }

    #[test]
    fn test_plan_respects_depth_bound() {
        let work = items(8);
        let first_two: Vec<&WorkItem> = work.iter().take(2).collect();
        let budget = request_bytes(&EchoTask, &first_two);
        let shallow = BatchConfig {
            max_split_depth: 1,
            ..config()
        };

        let plan = plan_batches(&EchoTask, &work, &shallow, budget);
        assert!(plan.batches.is_empty());
        let stranded: usize = plan.oversized.iter().map(|g| g.indices.len()).sum();
        assert_eq!(stranded, 8);

        let plan = plan_batches(&EchoTask, &work, &config(), budget);
        assert_eq!(plan.batches.len(), 4);
        assert!(plan.oversized.is_empty());
        assert_eq!(plan.batches.concat(), (0..8).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_nothing_fits_means_all_fallback_without_calls() {
        let model = ScriptedModel::new(|_, user| Ok(answer_all(user)));
        let work = items(5);
        let results = orchestrator(&model, config())
            .process_with_budget(&EchoTask, &work, 10)
            .await;

        assert_eq!(results.len(), 5);
        assert!(results.iter().all(|r| r.is_fallback()));
        assert!(results[0].fallback_reason().unwrap_or_default().contains("超出预算"));
        assert_eq!(model.call_count(), 0);
    }

    #[tokio::test]
    async fn test_cleanup_call_rescues_bad_response() {
        let model = ScriptedModel::new(|system, _| {
            if system == CLEANUP_SYSTEM_PROMPT {
                Ok(r#"```json
[{"question_id": "q01", "answer": "整理后"}, {"question_id": "q02", "answer": "整理后"}]
```"#
                    .to_string())
            } else {
                Ok("q01 的答案是 A，q02 的答案是 B".to_string())
            }
        });
        let results = orchestrator(&model, config()).process(&EchoTask, &items(2)).await;

        assert!(results.iter().all(|r| !r.is_fallback()));
        assert_eq!(results[0].output, "整理后");
        assert_eq!(model.call_count(), 2);
    }

    #[tokio::test]
    async fn test_cleanup_request_over_budget_is_not_sent() {
        let model = ScriptedModel::new(|_, _| Ok("无法解析的长回复".repeat(2000)));
        let work = items(2);
        let refs: Vec<&WorkItem> = work.iter().collect();
        let budget = request_bytes(&EchoTask, &refs) + 100;

        let results = orchestrator(&model, config())
            .process_with_budget(&EchoTask, &work, budget)
            .await;

        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.is_fallback()));
        assert!(results[0].fallback_reason().unwrap_or_default().contains("超出预算"));
        assert_eq!(model.call_count(), 1);
        assert!(model.payload_sizes().iter().all(|&n| n <= budget));
    }

    #[tokio::test]
    async fn test_unparseable_after_cleanup_falls_back() {
        let model = ScriptedModel::new(|_, _| Ok("无法完成".to_string()));
        let results = orchestrator(&model, config()).process(&EchoTask, &items(3)).await;

        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| r.is_fallback()));
        assert_eq!(results[0].output, "兜底");
        assert_eq!(model.call_count(), 2);
    }

    #[tokio::test]
    async fn test_unknown_duplicate_and_missing_ids() {
        let model = ScriptedModel::new(|_, _| {
            Ok(json!([
                {"question_id": "q01", "answer": "第一次"},
                {"question_id": "q01", "answer": "第二次"},
                {"question_id": "q99", "answer": "不存在"},
                {"question_id": "q03", "answer": "三"}
            ])
            .to_string())
        });
        let results = orchestrator(&model, config()).process(&EchoTask, &items(3)).await;

        assert_eq!(results.len(), 3);
        assert_eq!(results[0].output, "第一次");
        assert!(results[1].is_fallback());
        assert_eq!(results[2].output, "三");
        assert_eq!(model.call_count(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_batches_keep_input_order() {
        let model = ScriptedModel::new(|_, user| Ok(answer_all(user)));
        let cfg = BatchConfig {
            max_items_per_batch: 3,
            max_concurrent_batches: 4,
            ..config()
        };
        let work = items(20);
        let results = orchestrator(&model, cfg).process(&EchoTask, &work).await;

        assert_eq!(results.len(), 20);
        for (result, item) in results.iter().zip(&work) {
            assert_eq!(result.work_item_id, item.id);
            assert_eq!(result.output, format!("答案 {}", item.id));
        }
        assert_eq!(model.call_count(), 7);
    }

    #[tokio::test]
    async fn test_call_retry_recovers() {
        let model = ScriptedModel::failing_first(1, |_, user| Ok(answer_all(user)));
        let results = orchestrator(&model, config()).process(&EchoTask, &items(2)).await;
        assert!(results.iter().all(|r| !r.is_fallback()));
        assert_eq!(model.call_count(), 2);
    }
}

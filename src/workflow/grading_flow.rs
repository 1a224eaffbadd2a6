//! 提交评分流程 - 流程层
//!
//! 核心职责：定义"一份提交"的完整处理流程
//!
//! 流程顺序：
//! 1. 识别所有作答文件（带缓存，并发）
//! 2. 把识别文本映射到评分标准的每道题
//! 3. 逐题评分
//! 4. 持久化映射、评分和汇总（锁冲突时重试）
//!
//! `GradingPipeline` 是组合根：缓存、识别、编排、存储都在这里装配，没有全局单例。

use anyhow::{bail, Context, Result};
use std::sync::Arc;
use tracing::{info, warn};

use crate::clients::{LanguageModel, OcrProvider};
use crate::config::Config;
use crate::infrastructure::{CacheConfig, ContentCache, RelationalStore};
use crate::models::{
    GradeRecord, GradeScale, GradingSummary, LogicalKey, MappedAnswer, MarkingGuide,
    PersistedRecord, RecordKind, WorkItem,
};
use crate::orchestrator::{BatchConfig, GradingOrchestrator, MappingOrchestrator};
use crate::services::{ExtractionInput, Extractor, ResilientStore, WriteReport};
use crate::utils::logging::truncate_text;
use crate::utils::RetryPolicy;
use crate::workflow::submission_ctx::SubmissionCtx;

/// 单份提交的处理结果
#[derive(Debug, Clone)]
pub struct SubmissionReport {
    pub submission_id: String,
    /// 识别成功的文件数
    pub extracted_files: usize,
    /// 识别失败的文件：(文件名, 原因)
    pub extraction_failures: Vec<(String, String)>,
    pub mapped: Vec<MappedAnswer>,
    /// 映射阶段使用兜底的题数
    pub mapping_fallbacks: usize,
    pub grades: Vec<GradeRecord>,
    pub summary: GradingSummary,
    pub writes: Vec<WriteReport>,
}

/// 提交评分流程
///
/// - 编排完整的提交处理流程
/// - 决定何时识别、映射、评分、持久化
/// - 只依赖业务能力（services / orchestrator）
#[derive(Clone)]
pub struct GradingPipeline {
    extractor: Extractor,
    mapper: MappingOrchestrator,
    grader: GradingOrchestrator,
    store: ResilientStore,
}

impl GradingPipeline {
    pub fn new(
        extractor: Extractor,
        mapper: MappingOrchestrator,
        grader: GradingOrchestrator,
        store: ResilientStore,
    ) -> Self {
        Self {
            extractor,
            mapper,
            grader,
            store,
        }
    }

    /// 按配置装配整条流水线
    pub fn from_config(
        config: &Config,
        ocr: Arc<dyn OcrProvider>,
        model: Arc<dyn LanguageModel>,
        relational: Arc<dyn RelationalStore>,
    ) -> Self {
        let cache = Arc::new(ContentCache::open(CacheConfig::from_config(config)));
        let batch = BatchConfig::from_config(config);

        Self {
            extractor: Extractor::from_config(config, ocr, cache),
            mapper: MappingOrchestrator::new(model.clone(), batch.clone()),
            grader: GradingOrchestrator::new(model, batch, GradeScale::from_config(config)),
            store: ResilientStore::new(relational, RetryPolicy::from_config(config)),
        }
    }

    pub fn cache(&self) -> &Arc<ContentCache> {
        self.extractor.cache()
    }

    /// 处理一份提交：识别 → 映射 → 评分 → 持久化
    pub async fn grade_submission(
        &self,
        ctx: &SubmissionCtx,
        guide: &MarkingGuide,
        files: Vec<ExtractionInput>,
    ) -> Result<SubmissionReport> {
        if files.is_empty() {
            bail!("{} 没有任何作答文件", ctx);
        }
        info!("{} 📝 开始处理, 共 {} 个文件", ctx, files.len());

        // ========== 步骤 1: 识别 ==========
        let mut outcomes = self.extractor.extract_many(files).await;
        outcomes.sort_by_key(|o| o.index);

        let mut texts = Vec::new();
        let mut extraction_failures = Vec::new();
        for outcome in outcomes {
            match outcome.result {
                Ok(text) => texts.push(text),
                Err(e) => {
                    warn!("{} ⚠️ 文件 {} 识别失败: {}", ctx, outcome.name, e);
                    extraction_failures.push((outcome.name, e.to_string()));
                }
            }
        }
        if texts.is_empty() {
            bail!("{} 所有文件识别失败", ctx);
        }
        let submission_text = texts.join("\n\n");
        self.log_text_preview(ctx, &submission_text);

        // ========== 步骤 2: 映射 ==========
        let mapping_results = self
            .mapper
            .map_answers(&guide.questions, &submission_text)
            .await;
        let mapping_fallbacks = mapping_results.iter().filter(|r| r.is_fallback()).count();
        if mapping_fallbacks > 0 {
            warn!(
                "{} ⚠️ {} / {} 道题的映射使用了题号扫描",
                ctx,
                mapping_fallbacks,
                mapping_results.len()
            );
        }
        let mapped: Vec<MappedAnswer> = mapping_results.into_iter().map(|r| r.output).collect();

        // ========== 步骤 3: 评分 ==========
        let items: Vec<WorkItem> = guide
            .questions
            .iter()
            .zip(&mapped)
            .map(|(question, answer)| WorkItem::with_answer(question, answer.answer_text.clone()))
            .collect();
        let grades = self
            .grader
            .grade_mapped(&items, &guide.grading_context())
            .await;
        let summary = GradingSummary::from_records(&ctx.submission_id, &grades, self.grader.scale());

        // ========== 步骤 4: 持久化 ==========
        let writes = self.persist_results(ctx, &mapped, &grades, &summary).await?;

        info!(
            "{} ✓ 完成: {:.1}/{:.1} 等级 {}",
            ctx,
            summary.total_score,
            summary.max_score,
            summary.letter.as_str()
        );

        Ok(SubmissionReport {
            submission_id: ctx.submission_id.clone(),
            extracted_files: texts.len(),
            extraction_failures,
            mapped,
            mapping_fallbacks,
            grades,
            summary,
            writes,
        })
    }

    /// 三类记录各自作为一次逻辑写入
    async fn persist_results(
        &self,
        ctx: &SubmissionCtx,
        mapped: &[MappedAnswer],
        grades: &[GradeRecord],
        summary: &GradingSummary,
    ) -> Result<Vec<WriteReport>> {
        let batches = [
            (
                RecordKind::Mapping,
                mapped.iter().cloned().map(PersistedRecord::Mapping).collect::<Vec<_>>(),
            ),
            (
                RecordKind::Grade,
                grades.iter().cloned().map(PersistedRecord::Grade).collect(),
            ),
            (
                RecordKind::Summary,
                vec![PersistedRecord::Summary(summary.clone())],
            ),
        ];

        let mut writes = Vec::with_capacity(batches.len());
        for (kind, records) in batches {
            let key = LogicalKey::new(kind, ctx.submission_id.clone());
            let report = self
                .store
                .persist(records, &key)
                .await
                .with_context(|| format!("{} 保存 {} 失败", ctx, kind.as_str()))?;
            writes.push(report);
        }
        Ok(writes)
    }

    // ========== 日志辅助函数 ==========

    fn log_text_preview(&self, ctx: &SubmissionCtx, text: &str) {
        info!(
            "{} 识别文本 {} 字符: {}",
            ctx,
            text.chars().count(),
            truncate_text(&text.replace('\n', " "), 60)
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{LlmError, OcrError};
    use crate::infrastructure::MemoryStore;
    use crate::models::GuideQuestion;
    use crate::orchestrator::testing::ScriptedModel;
    use crate::utils::RetryPolicy;
    use async_trait::async_trait;
    use std::time::Duration;

    /// 把字节原样当作识别文本；内容为 "坏" 时报错
    struct Utf8Ocr;

    #[async_trait]
    impl OcrProvider for Utf8Ocr {
        async fn extract_text(&self, image: &[u8]) -> Result<String, OcrError> {
            let text = String::from_utf8_lossy(image).to_string();
            if text == "坏" {
                return Err(OcrError::RequestFailed("图片损坏".into()));
            }
            Ok(text)
        }
    }

    fn guide() -> MarkingGuide {
        MarkingGuide {
            title: "期中物理".into(),
            context: "按要点给分".into(),
            questions: vec![
                GuideQuestion {
                    id: "1".into(),
                    text: "牛顿第一定律是什么？".into(),
                    expected_answer: Some("惯性定律".into()),
                    max_score: 4.0,
                },
                GuideQuestion {
                    id: "2".into(),
                    text: "写出牛顿第二定律".into(),
                    expected_answer: Some("F=ma".into()),
                    max_score: 6.0,
                },
            ],
            file_path: None,
        }
    }

    fn pipeline(model: Arc<ScriptedModel>, memory: &MemoryStore) -> GradingPipeline {
        let cache = Arc::new(ContentCache::new(CacheConfig::default()));
        let batch = BatchConfig {
            call_backoff: Duration::ZERO,
            ..BatchConfig::default()
        };
        GradingPipeline::new(
            Extractor::new(Arc::new(Utf8Ocr), cache),
            MappingOrchestrator::new(model.clone(), batch.clone()),
            GradingOrchestrator::new(model, batch, GradeScale::default()),
            ResilientStore::new(Arc::new(memory.clone()), RetryPolicy::immediate(3)),
        )
    }

    #[tokio::test]
    async fn test_llm_down_still_grades_and_persists() {
        let model = ScriptedModel::new(|_, _| Err(LlmError::api_failed("test", "服务不可用")));
        let memory = MemoryStore::new();
        let pipeline = pipeline(model, &memory);
        let ctx = SubmissionCtx::new("stu-1", 1, "期中物理");

        let files = vec![
            ExtractionInput::new("p1.png", "Q1 惯性定律"),
            ExtractionInput::new("p2.png", "坏"),
            ExtractionInput::new("p3.png", "Q2 F=ma"),
        ];
        let report = pipeline.grade_submission(&ctx, &guide(), files).await.unwrap();

        assert_eq!(report.extracted_files, 2);
        assert_eq!(report.extraction_failures.len(), 1);
        assert_eq!(report.extraction_failures[0].0, "p2.png");
        assert_eq!(report.mapping_fallbacks, 2);
        assert_eq!(report.mapped[0].answer_text, "惯性定律");
        assert_eq!(report.mapped[1].answer_text, "F=ma");
        assert!(report.grades.iter().all(|g| g.needs_review));
        assert_eq!(report.summary.fallback_count, 2);
        assert_eq!(report.writes.len(), 3);

        let grade_key = LogicalKey::new(RecordKind::Grade, "stu-1");
        assert_eq!(memory.rows(&grade_key).await.len(), 2);
        assert_eq!(memory.row_count().await, 5);
    }

    #[tokio::test]
    async fn test_all_files_failing_is_an_error() {
        let model = ScriptedModel::new(|_, _| Ok("[]".into()));
        let memory = MemoryStore::new();
        let pipeline = pipeline(model, &memory);
        let ctx = SubmissionCtx::new("stu-2", 1, "期中物理");

        let result = pipeline
            .grade_submission(&ctx, &guide(), vec![ExtractionInput::new("p.png", "坏")])
            .await;
        assert!(result.is_err());
        assert_eq!(memory.row_count().await, 0);

        let empty = pipeline.grade_submission(&ctx, &guide(), Vec::new()).await;
        assert!(empty.is_err());
    }

    #[tokio::test]
    async fn test_persistence_contention_is_surfaced() {
        let model = ScriptedModel::new(|_, _| Err(LlmError::api_failed("test", "服务不可用")));
        let memory = MemoryStore::new();
        memory.inject_contention(100);
        let pipeline = pipeline(model, &memory);
        let ctx = SubmissionCtx::new("stu-3", 1, "期中物理");

        let err = pipeline
            .grade_submission(&ctx, &guide(), vec![ExtractionInput::new("p.png", "Q1 惯性")])
            .await
            .unwrap_err();
        let persistence = err
            .downcast_ref::<crate::error::PersistenceError>()
            .expect("根因应为持久化错误");
        assert!(persistence.is_contention());
        assert_eq!(persistence.attempts(), 3);
    }
}

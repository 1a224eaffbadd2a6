use anyhow::{bail, Context, Result};
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info, warn};

use grading_core::clients::{HttpOcrClient, OpenAiLanguageModel};
use grading_core::models::{list_submission_files, load_guide};
use grading_core::utils::logging;
use grading_core::{Config, ExtractionInput, GradingPipeline, MemoryStore, SubmissionCtx};

#[tokio::main]
async fn main() -> Result<()> {
    // 初始化日志
    logging::init();

    // 加载配置
    let config = Config::from_env();
    config.validate().context("配置无效")?;

    logging::init_log_file(&config.output_log_file)?;
    logging::log_startup(&config);

    // 加载评分标准
    let guide = load_guide(Path::new(&config.guide_file)).await?;
    info!(
        "📋 评分标准: {} ({} 题, 满分 {})",
        guide.title,
        guide.questions.len(),
        guide.total_marks()
    );

    let files = list_submission_files(&config.submission_folder).await?;
    if files.is_empty() {
        warn!("⚠️ 没有找到待评分的作答文件，程序结束");
        return Ok(());
    }

    // 装配流水线
    let ocr = Arc::new(HttpOcrClient::new(&config)?);
    let model = Arc::new(OpenAiLanguageModel::new(&config));
    let store = Arc::new(MemoryStore::new());
    let pipeline = GradingPipeline::from_config(&config, ocr, model, store);

    // 每个文件视为一份提交
    let mut failed = 0;
    for (index, path) in files.iter().enumerate() {
        let submission_id = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| format!("submission-{}", index + 1));
        let ctx = SubmissionCtx::new(submission_id, index + 1, guide.title.clone());

        let input = match ExtractionInput::from_path(path).await {
            Ok(input) => input,
            Err(e) => {
                error!("{} ❌ {}", ctx, e);
                failed += 1;
                continue;
            }
        };

        match pipeline.grade_submission(&ctx, &guide, vec![input]).await {
            Ok(report) => logging::log_submission_summary(&report.summary),
            Err(e) => {
                error!("{} ❌ 处理失败: {:#}", ctx, e);
                failed += 1;
            }
        }
    }

    logging::log_cache_stats(&pipeline.cache().stats());
    if config.cache_snapshot_path.is_some() && !pipeline.cache().flush() {
        warn!("⚠️ 缓存快照未写入");
    }

    info!("🏁 全部完成: 成功 {}, 失败 {}", files.len() - failed, failed);
    if failed == files.len() {
        bail!("所有提交都处理失败");
    }
    Ok(())
}

use anyhow::Result;
/// 日志工具模块
///
/// 提供日志初始化、格式化和输出的辅助函数
use std::fs;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::infrastructure::CacheStats;
use crate::models::GradingSummary;

/// 初始化 tracing 订阅者
///
/// 默认级别为 info，可通过 `RUST_LOG` 覆盖；重复调用不会报错
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

/// 初始化日志文件
///
/// # 参数
/// - `log_file_path`: 日志文件路径
pub fn init_log_file(log_file_path: &str) -> Result<()> {
    let log_header = format!(
        "{}\n阅卷日志 - {}\n{}\n\n",
        "=".repeat(60),
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
        "=".repeat(60)
    );
    fs::write(log_file_path, log_header)?;
    Ok(())
}

/// 记录程序启动信息
pub fn log_startup(config: &Config) {
    info!("{}", "=".repeat(60));
    info!("🚀 程序启动 - 阅卷流水线");
    info!("📊 识别并发数: {}", config.extraction_workers());
    info!(
        "📦 每批最多 {} 题, 请求预算 {} 字节",
        config.max_items_per_batch, config.prompt_budget_bytes
    );
    info!("{}", "=".repeat(60));
}

/// 打印单份提交的评分汇总
pub fn log_submission_summary(summary: &GradingSummary) {
    info!("\n{}", "─".repeat(60));
    info!("📊 提交 {} 评分完成", summary.submission_id);
    info!(
        "总分: {:.1}/{:.1} ({:.1}%) 等级 {}",
        summary.total_score,
        summary.max_score,
        summary.percentage,
        summary.letter.as_str()
    );
    if summary.fallback_count > 0 {
        info!(
            "⚠️ {} / {} 道题使用了兜底评分，建议人工复核",
            summary.fallback_count, summary.question_count
        );
    }
    info!("{}", "─".repeat(60));
}

/// 打印缓存统计
pub fn log_cache_stats(stats: &CacheStats) {
    let lookups = stats.hits + stats.misses;
    let hit_rate = if lookups == 0 {
        0.0
    } else {
        stats.hits as f64 / lookups as f64 * 100.0
    };
    info!(
        "🗃️ 缓存: {} 条, 命中 {}/{} ({:.1}%), 淘汰 {}, 过期 {}",
        stats.entries, stats.hits, lookups, hit_rate, stats.evictions, stats.expirations
    );
}

/// 截断长文本用于日志显示
///
/// # 参数
/// - `text`: 原始文本
/// - `max_len`: 最大长度
///
/// # 返回
/// 返回截断后的文本
pub fn truncate_text(text: &str, max_len: usize) -> String {
    if text.chars().count() > max_len {
        text.chars().take(max_len).collect::<String>() + "..."
    } else {
        text.to_string()
    }
}

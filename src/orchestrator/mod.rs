//! 编排层（Orchestration Layer）
//!
//! ## 职责
//!
//! 把"一组题目"交给语言模型处理，并保证无论远程调用成败，每道题都有结果。
//!
//! ## 模块划分
//!
//! ### `batch_orchestrator` - 通用分批算法
//! - 按条数和字节预算切分（超预算对半拆分，深度有上限）
//! - 调用重试、二次整理、字段校验、缺失补齐
//! - 批次之间可并发（`buffer_unordered`）
//!
//! ### `mapping` - 答案映射
//! - 把识别出的提交文本对应到评分标准中的每道题
//! - 兜底：按题号标记（Q1、1.、第1题 ...）切分原文
//!
//! ### `grading` - 评分
//! - 按评分标准给每道题打分并给出反馈
//! - 兜底：按作答长度估分，标记人工复核
//!
//! ## 层次关系
//!
//! ```text
//! workflow::GradingPipeline
//!     ↓
//! mapping / grading (BatchTask 实例)
//!     ↓
//! batch_orchestrator (切分 → 调用 → 解析 → 校验 → 补齐)
//!     ↓
//! clients::LanguageModel
//! ```

pub mod batch_orchestrator;
pub mod grading;
pub mod mapping;
pub mod outcome;
pub mod response_parser;

// 重新导出主要类型
pub use batch_orchestrator::{
    plan_batches, resolve_batch, BatchConfig, BatchOrchestrator, BatchPlan, BatchTask,
};
pub use grading::GradingOrchestrator;
pub use mapping::MappingOrchestrator;
pub use outcome::{BatchResult, Outcome, ResultOrigin};

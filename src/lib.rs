//! # Grading Core
//!
//! 作答识别、分批评分与抗冲突持久化的核心库
//!
//! ## 架构设计
//!
//! 本系统采用分层架构：
//!
//! ### ① 基础设施层（Infrastructure）
//! - `infrastructure/` - 持有状态和存储接口，只暴露能力
//! - `ContentCache` - 以内容哈希为键的识别结果缓存（TTL + 容量淘汰）
//! - `RelationalStore` / `UnitOfWork` - 关系存储接口，`MemoryStore` 为内存实现
//!
//! ### ② 客户端层（Clients）
//! - `clients/` - 外部服务接口
//! - `OcrProvider` / `HttpOcrClient` - 文字识别
//! - `LanguageModel` / `OpenAiLanguageModel` - 语言模型
//!
//! ### ③ 业务能力层（Services）
//! - `services/` - 描述"我能做什么"
//! - `Extractor` - 带缓存的并发识别
//! - `ResilientStore` - 锁冲突时退避重试的写入
//!
//! ### ④ 编排层（Orchestration）
//! - `orchestrator/` - 分批调用语言模型，失败时本地兜底
//! - `MappingOrchestrator` - 作答映射
//! - `GradingOrchestrator` - 逐题评分
//!
//! ### ⑤ 流程层（Workflow）
//! - `workflow/` - 定义"一份提交"的完整处理流程
//! - `SubmissionCtx` - 上下文封装
//! - `GradingPipeline` - 识别 → 映射 → 评分 → 持久化
//!
//! ## 模块结构

pub mod clients;
pub mod config;
pub mod error;
pub mod infrastructure;
pub mod models;
pub mod orchestrator;
pub mod services;
pub mod utils;
pub mod workflow;

// 重新导出常用类型
pub use config::Config;
pub use error::{AppError, AppResult};
pub use infrastructure::{ContentCache, ContentHash, MemoryStore};
pub use models::{GradeRecord, GradingSummary, MarkingGuide};
pub use orchestrator::{BatchResult, GradingOrchestrator, MappingOrchestrator};
pub use services::{ExtractionInput, Extractor, ResilientStore};
pub use workflow::{GradingPipeline, SubmissionCtx, SubmissionReport};

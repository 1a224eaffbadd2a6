//! 错误类型
//!
//! 按"能否吸收"划分：
//! - 单题/单文件范围的错误（识别、解析、批次过大）在流程内被吸收，替换为兜底结果
//! - 威胁数据完整性的错误（持久化重试耗尽）向调用方传播
//! - 缓存错误一律降级为未命中

use thiserror::Error;

use crate::models::LogicalKey;
use crate::services::resilient_store::WriteState;

/// 应用程序错误类型
#[derive(Debug, Error)]
pub enum AppError {
    /// 文字识别错误
    #[error("识别错误: {0}")]
    Extraction(#[from] ExtractionError),
    /// 批处理错误
    #[error("批处理错误: {0}")]
    Orchestrator(#[from] OrchestratorError),
    /// 持久化错误
    #[error("持久化错误: {0}")]
    Persistence(#[from] PersistenceError),
    /// 配置错误
    #[error("配置错误: {0}")]
    Config(#[from] ConfigError),
    /// 文件错误
    #[error("文件错误: {0}")]
    File(#[from] FileError),
}

/// OCR 服务返回的错误
#[derive(Debug, Error)]
pub enum OcrError {
    #[error("OCR 请求失败: {0}")]
    RequestFailed(String),
    #[error("OCR 返回错误响应: status={status}, body={body}")]
    BadResponse { status: u16, body: String },
    #[error("OCR 调用超时 ({0:?})")]
    Timeout(std::time::Duration),
}

/// 单个输入的识别错误
#[derive(Debug, Error)]
pub enum ExtractionError {
    /// OCR 服务调用失败
    #[error("[{name}] OCR 调用失败: {source}")]
    Provider {
        name: String,
        #[source]
        source: OcrError,
    },
    /// OCR 返回空文本
    #[error("[{name}] OCR 返回空文本")]
    EmptyText { name: String },
    /// 识别任务异常退出
    #[error("[{name}] 识别任务异常退出: {reason}")]
    TaskAborted { name: String, reason: String },
}

/// 语言模型调用错误
#[derive(Debug, Error)]
pub enum LlmError {
    /// API 调用失败
    #[error("LLM API调用失败 (模型: {model}): {reason}")]
    ApiCallFailed { model: String, reason: String },
    /// 返回内容为空
    #[error("LLM返回内容为空 (模型: {model})")]
    EmptyContent { model: String },
    /// 调用超时
    #[error("LLM 调用超时 ({0:?})")]
    Timeout(std::time::Duration),
    /// 构建请求失败
    #[error("构建 LLM 请求失败: {0}")]
    InvalidRequest(String),
}

/// 批处理内部错误，最终都会被转换为兜底结果
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// 映射结果解析失败
    #[error("映射结果解析失败: {0}")]
    MappingParse(String),
    /// 评分结果解析失败
    #[error("评分结果解析失败: {0}")]
    GradingParse(String),
    /// 请求超出字节预算且无法继续拆分
    #[error("请求大小 {bytes} 字节超出预算 {budget} 字节")]
    BatchTooLarge { bytes: usize, budget: usize },
    /// 远程调用失败
    #[error("远程调用失败: {0}")]
    Call(#[from] LlmError),
}

/// 关系存储返回的错误
#[derive(Debug, Error)]
pub enum StoreError {
    /// 锁冲突 / 超时等瞬时错误，可重试
    #[error("存储锁冲突: {0}")]
    Contention(String),
    /// 其他错误，不可重试
    #[error("存储错误: {0}")]
    Other(String),
}

impl StoreError {
    /// 是否为可重试的瞬时错误
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Contention(_))
    }
}

/// 持久化错误
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// 锁冲突重试耗尽
    #[error("写入 {key} 时锁冲突，已尝试 {attempts} 次")]
    Contention {
        key: LogicalKey,
        attempts: u32,
        history: Vec<WriteState>,
        #[source]
        last: StoreError,
    },
    /// 不可重试的存储错误
    #[error("写入 {key} 失败: {source}")]
    Store {
        key: LogicalKey,
        #[source]
        source: StoreError,
    },
}

/// 缓存错误，只在缓存内部使用，对外一律表现为未命中
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("缓存锁已损坏")]
    Poisoned,
    #[error("缓存快照读写失败 ({path}): {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("缓存快照格式错误 ({path}): {source}")]
    Corrupt {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// 配置错误
#[derive(Debug, Error)]
pub enum ConfigError {
    /// 配置项取值不合法
    #[error("配置项 {field} 不合法: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// 文件操作错误
#[derive(Debug, Error)]
pub enum FileError {
    /// 文件不存在
    #[error("文件不存在: {path}")]
    NotFound { path: String },
    /// 读取文件失败
    #[error("读取文件失败 ({path}): {source}")]
    ReadFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },
    /// TOML 解析失败
    #[error("TOML解析失败 ({path}): {source}")]
    TomlParseFailed {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    /// 评分标准内容不合法
    #[error("评分标准无效 ({path}): {reason}")]
    InvalidGuide { path: String, reason: String },
}

// ========== 便捷构造函数 ==========

impl ExtractionError {
    /// 出错的输入名称
    pub fn input_name(&self) -> &str {
        match self {
            ExtractionError::Provider { name, .. }
            | ExtractionError::EmptyText { name }
            | ExtractionError::TaskAborted { name, .. } => name,
        }
    }
}

impl LlmError {
    /// 创建 API 调用失败错误
    pub fn api_failed(model: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        LlmError::ApiCallFailed {
            model: model.into(),
            reason: reason.to_string(),
        }
    }
}

impl PersistenceError {
    /// 实际尝试次数
    pub fn attempts(&self) -> u32 {
        match self {
            PersistenceError::Contention { attempts, .. } => *attempts,
            PersistenceError::Store { .. } => 1,
        }
    }

    pub fn is_contention(&self) -> bool {
        matches!(self, PersistenceError::Contention { .. })
    }
}

// ========== Result 类型别名 ==========

/// 应用程序结果类型
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_transience() {
        assert!(StoreError::Contention("database is locked".into()).is_transient());
        assert!(!StoreError::Other("constraint failed".into()).is_transient());
    }

    #[test]
    fn test_extraction_error_keeps_input_name() {
        let err = ExtractionError::EmptyText {
            name: "page-3.png".to_string(),
        };
        assert_eq!(err.input_name(), "page-3.png");
        assert!(err.to_string().contains("page-3.png"));
    }

    #[test]
    fn test_app_error_from_conversions() {
        let err: AppError = ConfigError::Invalid {
            field: "cache_capacity",
            reason: "必须大于 0".into(),
        }
        .into();
        assert!(matches!(err, AppError::Config(_)));
    }
}

/// 程序配置
use std::time::Duration;

use crate::error::ConfigError;

#[derive(Clone, Debug)]
pub struct Config {
    // --- 缓存配置 ---
    /// 缓存条目最大数量
    pub cache_capacity: usize,
    /// 缓存条目有效期（秒）
    pub cache_ttl_secs: u64,
    /// 缓存快照文件（为空则只保存在内存中）
    pub cache_snapshot_path: Option<String>,

    // --- 文字识别配置 ---
    /// 并发识别的最大任务数（0 表示按 CPU 核数自动决定）
    pub max_extraction_workers: usize,
    /// 单次外部调用超时（秒）
    pub call_timeout_secs: u64,

    // --- 批处理配置 ---
    /// 每批最多包含的题目数
    pub max_items_per_batch: usize,
    /// 单次请求的字节预算
    pub prompt_budget_bytes: usize,
    /// 超预算时最多对半拆分的层数
    pub max_split_depth: u32,
    /// 单批远程调用的最大尝试次数
    pub max_call_attempts: u32,
    /// 同时进行的批次数
    pub max_concurrent_batches: usize,

    // --- 持久化重试配置 ---
    /// 写入最大尝试次数
    pub write_max_attempts: u32,
    /// 退避基准（毫秒）
    pub write_backoff_base_ms: u64,
    /// 退避上限（毫秒）
    pub write_backoff_cap_ms: u64,
    /// 随机抖动上限（毫秒）
    pub write_jitter_ms: u64,

    // --- 等级划分 ---
    pub grade_a_threshold: f64,
    pub grade_b_threshold: f64,
    pub grade_c_threshold: f64,
    pub grade_d_threshold: f64,

    // --- LLM 配置 ---
    pub llm_api_key: String,
    pub llm_api_base_url: String,
    pub llm_model_name: String,

    // --- OCR 配置 ---
    pub ocr_api_url: String,
    pub ocr_api_key: String,

    // --- 运行输入 ---
    /// 评分标准 TOML 文件
    pub guide_file: String,
    /// 学生作答图片所在目录
    pub submission_folder: String,
    /// 输出日志文件
    pub output_log_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache_capacity: 1000,
            cache_ttl_secs: 7 * 24 * 60 * 60,
            cache_snapshot_path: None,
            max_extraction_workers: 0,
            call_timeout_secs: 120,
            max_items_per_batch: 8,
            prompt_budget_bytes: 24 * 1024,
            max_split_depth: 3,
            max_call_attempts: 2,
            max_concurrent_batches: 1,
            write_max_attempts: 3,
            write_backoff_base_ms: 200,
            write_backoff_cap_ms: 2_000,
            write_jitter_ms: 100,
            grade_a_threshold: 90.0,
            grade_b_threshold: 80.0,
            grade_c_threshold: 70.0,
            grade_d_threshold: 60.0,
            llm_api_key: String::new(),
            llm_api_base_url: "https://api.openai.com/v1".to_string(),
            llm_model_name: "gpt-4o-mini".to_string(),
            ocr_api_url: "http://localhost:8088/ocr".to_string(),
            ocr_api_key: String::new(),
            guide_file: "guide.toml".to_string(),
            submission_folder: "submissions".to_string(),
            output_log_file: "grading.log".to_string(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let default = Self::default();
        Self {
            cache_capacity: env_parse("CACHE_CAPACITY").unwrap_or(default.cache_capacity),
            cache_ttl_secs: env_parse("CACHE_TTL_SECS").unwrap_or(default.cache_ttl_secs),
            cache_snapshot_path: std::env::var("CACHE_SNAPSHOT_PATH").ok().filter(|v| !v.is_empty()).or(default.cache_snapshot_path),
            max_extraction_workers: env_parse("MAX_EXTRACTION_WORKERS").unwrap_or(default.max_extraction_workers),
            call_timeout_secs: env_parse("CALL_TIMEOUT_SECS").unwrap_or(default.call_timeout_secs),
            max_items_per_batch: env_parse("MAX_ITEMS_PER_BATCH").unwrap_or(default.max_items_per_batch),
            prompt_budget_bytes: env_parse("PROMPT_BUDGET_BYTES").unwrap_or(default.prompt_budget_bytes),
            max_split_depth: env_parse("MAX_SPLIT_DEPTH").unwrap_or(default.max_split_depth),
            max_call_attempts: env_parse("MAX_CALL_ATTEMPTS").unwrap_or(default.max_call_attempts),
            max_concurrent_batches: env_parse("MAX_CONCURRENT_BATCHES").unwrap_or(default.max_concurrent_batches),
            write_max_attempts: env_parse("WRITE_MAX_ATTEMPTS").unwrap_or(default.write_max_attempts),
            write_backoff_base_ms: env_parse("WRITE_BACKOFF_BASE_MS").unwrap_or(default.write_backoff_base_ms),
            write_backoff_cap_ms: env_parse("WRITE_BACKOFF_CAP_MS").unwrap_or(default.write_backoff_cap_ms),
            write_jitter_ms: env_parse("WRITE_JITTER_MS").unwrap_or(default.write_jitter_ms),
            grade_a_threshold: env_parse("GRADE_A_THRESHOLD").unwrap_or(default.grade_a_threshold),
            grade_b_threshold: env_parse("GRADE_B_THRESHOLD").unwrap_or(default.grade_b_threshold),
            grade_c_threshold: env_parse("GRADE_C_THRESHOLD").unwrap_or(default.grade_c_threshold),
            grade_d_threshold: env_parse("GRADE_D_THRESHOLD").unwrap_or(default.grade_d_threshold),
            llm_api_key: std::env::var("LLM_API_KEY").unwrap_or(default.llm_api_key),
            llm_api_base_url: std::env::var("LLM_API_BASE_URL").unwrap_or(default.llm_api_base_url),
            llm_model_name: std::env::var("LLM_MODEL_NAME").unwrap_or(default.llm_model_name),
            ocr_api_url: std::env::var("OCR_API_URL").unwrap_or(default.ocr_api_url),
            ocr_api_key: std::env::var("OCR_API_KEY").unwrap_or(default.ocr_api_key),
            guide_file: std::env::var("GUIDE_FILE").unwrap_or(default.guide_file),
            submission_folder: std::env::var("SUBMISSION_FOLDER").unwrap_or(default.submission_folder),
            output_log_file: std::env::var("OUTPUT_LOG_FILE").unwrap_or(default.output_log_file),
        }
    }

    /// 检查配置是否自洽
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache_capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "cache_capacity",
                reason: "必须大于 0".to_string(),
            });
        }
        if self.max_items_per_batch == 0 {
            return Err(ConfigError::Invalid {
                field: "max_items_per_batch",
                reason: "必须大于 0".to_string(),
            });
        }
        if self.prompt_budget_bytes == 0 {
            return Err(ConfigError::Invalid {
                field: "prompt_budget_bytes",
                reason: "必须大于 0".to_string(),
            });
        }
        if self.write_max_attempts == 0 || self.max_call_attempts == 0 {
            return Err(ConfigError::Invalid {
                field: "max_attempts",
                reason: "尝试次数至少为 1".to_string(),
            });
        }
        let thresholds = [
            self.grade_a_threshold,
            self.grade_b_threshold,
            self.grade_c_threshold,
            self.grade_d_threshold,
        ];
        if thresholds.windows(2).any(|w| w[0] < w[1]) {
            return Err(ConfigError::Invalid {
                field: "grade_thresholds",
                reason: format!("等级阈值必须递减: {:?}", thresholds),
            });
        }
        Ok(())
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    /// 实际使用的识别并发数：min(4, CPU 核数)，除非显式配置
    pub fn extraction_workers(&self) -> usize {
        if self.max_extraction_workers > 0 {
            return self.max_extraction_workers;
        }
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        cores.min(4)
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_zero_capacity() {
        let config = Config {
            cache_capacity: 0,
            ..Config::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "cache_capacity", .. })
        ));
    }

    #[test]
    fn test_rejects_unordered_thresholds() {
        let config = Config {
            grade_b_threshold: 95.0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_extraction_workers_bounded() {
        let config = Config::default();
        let workers = config.extraction_workers();
        assert!((1..=4).contains(&workers));

        let config = Config {
            max_extraction_workers: 9,
            ..Config::default()
        };
        assert_eq!(config.extraction_workers(), 9);
    }
}

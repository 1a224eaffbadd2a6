//! 文字识别服务 - 业务能力层
//!
//! 只负责"把一份原始文件变成文字"，不关心映射和评分。
//!
//! ## 流程
//! 1. 对原始字节计算哈希（预处理不影响键）
//! 2. 查缓存，命中直接返回
//! 3. 未命中时（可选）预处理 → 调用 OCR → 写入缓存

use futures::stream::{FuturesUnordered, StreamExt};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::clients::{OcrProvider, Preprocessor};
use crate::config::Config;
use crate::error::{ExtractionError, OcrError};
use crate::infrastructure::{ContentCache, ContentHash};

/// 待识别的输入
#[derive(Debug, Clone)]
pub struct ExtractionInput {
    /// 文件名（仅用于日志和结果关联）
    pub name: String,
    pub bytes: Arc<[u8]>,
}

impl ExtractionInput {
    pub fn new(name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        let bytes: Vec<u8> = bytes.into();
        Self {
            name: name.into(),
            bytes: Arc::from(bytes),
        }
    }

    /// 从文件读取
    pub async fn from_path(path: &Path) -> anyhow::Result<Self> {
        let bytes = tokio::fs::read(path).await.map_err(|e| {
            anyhow::anyhow!("无法读取作答文件 {}: {}", path.display(), e)
        })?;
        let name = path
            .file_name()
            .unwrap_or_default()
            .to_string_lossy()
            .to_string();
        Ok(Self::new(name, bytes))
    }

    /// 原始字节的哈希
    pub fn hash(&self) -> ContentHash {
        ContentHash::of(&self.bytes)
    }
}

/// 单个输入的识别结果
#[derive(Debug)]
pub struct ExtractionOutcome {
    /// 输入在原列表中的位置
    pub index: usize,
    pub name: String,
    pub result: Result<String, ExtractionError>,
}

/// 文字识别服务
///
/// 职责：
/// - 以内容哈希查询/填充缓存
/// - 调用 OCR，必要时先预处理
/// - 多个输入并发识别，单个失败不影响其他输入
#[derive(Clone)]
pub struct Extractor {
    ocr: Arc<dyn OcrProvider>,
    preprocessor: Option<Arc<dyn Preprocessor>>,
    cache: Arc<ContentCache>,
    max_workers: usize,
    call_timeout: Duration,
}

impl Extractor {
    /// 创建新的识别服务
    pub fn new(ocr: Arc<dyn OcrProvider>, cache: Arc<ContentCache>) -> Self {
        Self {
            ocr,
            preprocessor: None,
            cache,
            max_workers: Config::default().extraction_workers(),
            call_timeout: Config::default().call_timeout(),
        }
    }

    pub fn from_config(config: &Config, ocr: Arc<dyn OcrProvider>, cache: Arc<ContentCache>) -> Self {
        Self::new(ocr, cache)
            .with_max_workers(config.extraction_workers())
            .with_call_timeout(config.call_timeout())
    }

    pub fn with_preprocessor(mut self, preprocessor: Arc<dyn Preprocessor>) -> Self {
        self.preprocessor = Some(preprocessor);
        self
    }

    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers.max(1);
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn cache(&self) -> &Arc<ContentCache> {
        &self.cache
    }

    /// 识别单个输入
    pub async fn extract(&self, input: &ExtractionInput) -> Result<String, ExtractionError> {
        let hash = input.hash();

        if let Some(text) = self.cache.get(&hash) {
            debug!("[{}] ✓ 命中缓存 ({})", input.name, hash.short());
            return Ok(text);
        }

        let image = self.preprocess(input).await;

        let text = match tokio::time::timeout(self.call_timeout, self.ocr.extract_text(&image)).await {
            Ok(Ok(text)) => text,
            Ok(Err(source)) => {
                return Err(ExtractionError::Provider {
                    name: input.name.clone(),
                    source,
                })
            }
            Err(_) => {
                return Err(ExtractionError::Provider {
                    name: input.name.clone(),
                    source: OcrError::Timeout(self.call_timeout),
                })
            }
        };

        let text = text.trim().to_string();
        if text.is_empty() {
            return Err(ExtractionError::EmptyText {
                name: input.name.clone(),
            });
        }

        // 键始终是原始字节的哈希
        self.cache.put(hash, text.clone());
        debug!("[{}] ✓ 识别完成，{} 字符", input.name, text.chars().count());
        Ok(text)
    }

    /// 并发识别多个输入
    ///
    /// 结果按完成顺序返回，每个结果带有原输入的位置和名称
    pub async fn extract_many(&self, inputs: Vec<ExtractionInput>) -> Vec<ExtractionOutcome> {
        let total = inputs.len();
        if total == 0 {
            return Vec::new();
        }
        info!("📄 开始识别 {} 个文件 (并发数 {})", total, self.max_workers);

        let semaphore = Arc::new(Semaphore::new(self.max_workers));
        let mut tasks = FuturesUnordered::new();

        for (index, input) in inputs.into_iter().enumerate() {
            let extractor = self.clone();
            let semaphore = semaphore.clone();
            let name = input.name.clone();

            let handle = tokio::spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(e) => {
                        return Err(ExtractionError::TaskAborted {
                            name: input.name.clone(),
                            reason: e.to_string(),
                        })
                    }
                };
                extractor.extract(&input).await
            });

            tasks.push(async move {
                let result = match handle.await {
                    Ok(result) => result,
                    Err(e) => {
                        error!("[{}] 识别任务执行失败: {}", name, e);
                        Err(ExtractionError::TaskAborted {
                            name: name.clone(),
                            reason: e.to_string(),
                        })
                    }
                };
                ExtractionOutcome {
                    index,
                    name,
                    result,
                }
            });
        }

        let mut outcomes = Vec::with_capacity(total);
        while let Some(outcome) = tasks.next().await {
            if let Err(e) = &outcome.result {
                warn!("⚠️ {}", e);
            }
            outcomes.push(outcome);
        }

        let failed = outcomes.iter().filter(|o| o.result.is_err()).count();
        info!("✓ 识别完成: 成功 {}/{}", total - failed, total);
        outcomes
    }

    /// 预处理在阻塞线程池中执行；失败时退回原始字节
    async fn preprocess(&self, input: &ExtractionInput) -> Arc<[u8]> {
        let Some(preprocessor) = self.preprocessor.clone() else {
            return input.bytes.clone();
        };

        let bytes = input.bytes.clone();
        match tokio::task::spawn_blocking(move || preprocessor.preprocess(&bytes)).await {
            Ok(Ok(processed)) => Arc::from(processed),
            Ok(Err(e)) => {
                warn!("[{}] 预处理失败，使用原图: {}", input.name, e);
                input.bytes.clone()
            }
            Err(e) => {
                warn!("[{}] 预处理任务异常，使用原图: {}", input.name, e);
                input.bytes.clone()
            }
        }
    }
}

/// OCR 客户端
///
/// 定义识别能力的接口，并提供一个基于 HTTP 的参考实现
use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::OcrError;

/// 文字识别服务
#[async_trait]
pub trait OcrProvider: Send + Sync {
    /// 识别图片中的文字
    async fn extract_text(&self, image: &[u8]) -> Result<String, OcrError>;
}

/// 图片预处理（缩放、对比度、去噪等）
///
/// CPU 密集，由调用方放到阻塞线程池中执行
pub trait Preprocessor: Send + Sync {
    fn preprocess(&self, image: &[u8]) -> anyhow::Result<Vec<u8>>;
}

#[derive(Debug, Deserialize)]
struct OcrResponse {
    text: String,
}

/// HTTP OCR 客户端
///
/// 以 `application/octet-stream` POST 原始图片字节，期望返回 `{"text": "..."}`
pub struct HttpOcrClient {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    timeout: Duration,
}

impl HttpOcrClient {
    /// 创建新的 OCR 客户端
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.call_timeout())
            .build()?;
        Ok(Self {
            client,
            endpoint: config.ocr_api_url.clone(),
            api_key: config.ocr_api_key.clone(),
            timeout: config.call_timeout(),
        })
    }
}

#[async_trait]
impl OcrProvider for HttpOcrClient {
    async fn extract_text(&self, image: &[u8]) -> Result<String, OcrError> {
        debug!("调用 OCR API: {} ({} 字节)", self.endpoint, image.len());

        let mut request = self
            .client
            .post(&self.endpoint)
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(image.to_vec());
        if !self.api_key.is_empty() {
            request = request.header(AUTHORIZATION, format!("Bearer {}", self.api_key));
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                OcrError::Timeout(self.timeout)
            } else {
                warn!("OCR API 调用失败: {}", e);
                OcrError::RequestFailed(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(OcrError::BadResponse {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: OcrResponse = response
            .json()
            .await
            .map_err(|e| OcrError::RequestFailed(format!("响应解析失败: {}", e)))?;

        Ok(parsed.text)
    }
}

//! LLM 客户端
//!
//! 批处理器只依赖 [`LanguageModel`]：给出系统提示、用户提示和结构说明，拿回原始文本。
//! 结构化解析和校验由批处理器负责。
//!
//! ## 技术栈
//! - 参考实现使用 `async-openai` crate
//! - 兼容 OpenAI API 的服务（如 Azure, Gemini, Doubao 等）

use async_openai::{
    config::OpenAIConfig,
    types::chat::{
        ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
        ChatCompletionRequestUserMessageArgs, CreateChatCompletionRequestArgs,
    },
    Client,
};
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::LlmError;

/// 语言模型服务
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// 发送一次补全请求
    ///
    /// `schema_hint` 描述期望的 JSON 结构，由实现决定如何传给模型
    async fn complete(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        schema_hint: &str,
    ) -> Result<String, LlmError>;
}

/// 基于 OpenAI 兼容接口的语言模型
pub struct OpenAiLanguageModel {
    client: Client<OpenAIConfig>,
    model_name: String,
    timeout: Duration,
    max_tokens: u32,
}

impl OpenAiLanguageModel {
    /// 创建新的 LLM 客户端
    pub fn new(config: &Config) -> Self {
        // 配置 OpenAI 客户端（兼容 OpenAI API 的服务）
        let openai_config = OpenAIConfig::new()
            .with_api_key(&config.llm_api_key)
            .with_api_base(&config.llm_api_base_url);

        Self {
            client: Client::with_config(openai_config),
            model_name: config.llm_model_name.clone(),
            timeout: config.call_timeout(),
            max_tokens: 4096,
        }
    }

    fn build_messages(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        schema_hint: &str,
    ) -> Result<Vec<ChatCompletionRequestMessage>, LlmError> {
        let system = format!(
            "{}\n\n只返回符合以下结构的 JSON，不要返回任何其他内容：\n{}",
            system_prompt, schema_hint
        );
        let system_msg = ChatCompletionRequestSystemMessageArgs::default()
            .content(system)
            .build()
            .map_err(|e| LlmError::InvalidRequest(e.to_string()))?;
        let user_msg = ChatCompletionRequestUserMessageArgs::default()
            .content(user_prompt)
            .build()
            .map_err(|e| LlmError::InvalidRequest(e.to_string()))?;

        Ok(vec![
            ChatCompletionRequestMessage::System(system_msg),
            ChatCompletionRequestMessage::User(user_msg),
        ])
    }
}

#[async_trait]
impl LanguageModel for OpenAiLanguageModel {
    async fn complete(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        schema_hint: &str,
    ) -> Result<String, LlmError> {
        debug!("调用 LLM API，模型: {}", self.model_name);
        debug!("用户消息长度: {} 字节", user_prompt.len());

        let messages = self.build_messages(system_prompt, user_prompt, schema_hint)?;

        // 低温度，保证同样的输入得到稳定的输出
        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model_name)
            .messages(messages)
            .temperature(0.0)
            .max_tokens(self.max_tokens)
            .build()
            .map_err(|e| LlmError::InvalidRequest(e.to_string()))?;

        let response = tokio::time::timeout(self.timeout, self.client.chat().create(request))
            .await
            .map_err(|_| LlmError::Timeout(self.timeout))?
            .map_err(|e| {
                warn!("LLM API 调用失败: {}", e);
                LlmError::api_failed(&self.model_name, e)
            })?;

        debug!("LLM API 调用成功");

        let content = response
            .choices
            .first()
            .and_then(|choice| choice.message.content.clone())
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| LlmError::EmptyContent {
                model: self.model_name.clone(),
            })?;

        Ok(content.trim().to_string())
    }
}

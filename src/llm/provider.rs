use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use std::sync::Arc;
use std::time::Duration;

use crate::config::LLMConfig;
use crate::llm::openai::OpenAIAdapter;
use crate::types::{AppError, AppResult, LLMProvider, LLMRequest, LLMResponse};

/// Stream of text deltas from a provider
pub type TextStream = BoxStream<'static, AppResult<String>>;

/// One provider backend. The key is chosen by the caller per logical call so
/// that retries keep using the same credential.
#[async_trait]
pub trait LLMAdapter: Send + Sync {
    async fn create_chat_completion(
        &self,
        request: &LLMRequest,
        api_key: &str,
    ) -> AppResult<LLMResponse>;

    /// Defaults to a single chunk carrying the whole completion
    async fn create_chat_completion_stream(
        &self,
        request: &LLMRequest,
        api_key: &str,
    ) -> AppResult<TextStream> {
        let response = self.create_chat_completion(request, api_key).await?;
        Ok(stream::once(async move { Ok(response.content) }).boxed())
    }
}

/// Build the adapter for the configured provider
pub fn create_adapter(config: &LLMConfig) -> AppResult<Arc<dyn LLMAdapter>> {
    let provider = LLMProvider::from_id(&config.provider)
        .ok_or_else(|| AppError::Config(format!("Unsupported provider: {}", config.provider)))?;

    let base_url = config
        .base_url
        .clone()
        .unwrap_or_else(|| provider.default_base_url().to_string());

    let adapter = OpenAIAdapter::new(
        provider,
        base_url,
        Duration::from_secs(config.request_timeout_secs),
    )?;

    Ok(Arc::new(adapter))
}

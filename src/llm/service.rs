//! LLM service
//!
//! Binds a provider adapter, the shared [`ProviderKeyManager`] and the
//! [`RetryExecutor`]. Each public call is one logical request: a key is taken
//! from the manager once, and every retry of that request reuses it.

use serde::de::DeserializeOwned;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::{LLMConfig, ResearchConfig};
use crate::llm::keys::ProviderKeyManager;
use crate::llm::provider::{create_adapter, LLMAdapter, TextStream};
use crate::types::{AppError, AppResult, LLMRequest, LLMResponse};
use crate::utils::retry::{RetryExecutor, RetryPolicy};

pub struct LLMService {
    adapter: Arc<dyn LLMAdapter>,
    keys: Arc<ProviderKeyManager>,
    retry: RetryExecutor,
    policy: RetryPolicy,
    model: String,
}

impl LLMService {
    pub fn new(
        adapter: Arc<dyn LLMAdapter>,
        keys: Arc<ProviderKeyManager>,
        policy: RetryPolicy,
        model: impl Into<String>,
    ) -> Self {
        Self {
            retry: RetryExecutor::new(Some(keys.clone())),
            adapter,
            keys,
            policy,
            model: model.into(),
        }
    }

    /// Single place where the key manager is created for the process
    pub fn from_config(llm: &LLMConfig, research: &ResearchConfig) -> AppResult<Self> {
        if llm.api_keys.is_empty() {
            warn!("No LLM API keys configured; agents will fall back to deterministic output");
        }

        let adapter = create_adapter(llm)?;
        let keys = Arc::new(ProviderKeyManager::new(
            llm.api_keys.clone(),
            research.key_manager_config(),
        ));

        info!(
            provider = %llm.provider,
            model = %llm.model,
            keys = keys.key_count(),
            "LLM service initialized"
        );

        Ok(Self::new(adapter, keys, research.retry_policy(), llm.model.clone()))
    }

    pub fn key_manager(&self) -> Arc<ProviderKeyManager> {
        self.keys.clone()
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn prepare(&self, mut request: LLMRequest) -> AppResult<(Arc<LLMRequest>, String)> {
        if request.model.is_empty() {
            request.model = self.model.clone();
        }
        let key = self
            .keys
            .get_key()
            .ok_or_else(|| AppError::Config("No LLM API keys configured".to_string()))?;
        Ok((Arc::new(request), key))
    }

    pub async fn complete(&self, request: LLMRequest) -> AppResult<LLMResponse> {
        let (request, key) = self.prepare(request)?;
        let adapter = self.adapter.clone();
        let call_key = key.clone();

        let response = self
            .retry
            .execute(&self.policy, Some(&key), move || {
                let adapter = adapter.clone();
                let request = request.clone();
                let key = call_key.clone();
                async move { adapter.create_chat_completion(&request, &key).await }
            })
            .await?;

        debug!(
            response_len = response.content.len(),
            total_tokens = response.usage.total_tokens,
            "LLM completion received"
        );
        Ok(response)
    }

    /// Only stream initiation is retried
    pub async fn complete_stream(&self, request: LLMRequest) -> AppResult<TextStream> {
        let (request, key) = self.prepare(request)?;
        let adapter = self.adapter.clone();
        let call_key = key.clone();

        self.retry
            .execute_stream(&self.policy, Some(&key), move || {
                let adapter = adapter.clone();
                let request = request.clone();
                let key = call_key.clone();
                async move { adapter.create_chat_completion_stream(&request, &key).await }
            })
            .await
    }

    /// Complete and deserialize a JSON answer. Malformed output is a `Parse`
    /// error for the caller's fallback to handle.
    pub async fn complete_json<T: DeserializeOwned>(&self, request: LLMRequest) -> AppResult<T> {
        let response = self.complete(request).await?;
        parse_json_response(&response.content)
    }
}

/// Extract the JSON payload from a model answer, tolerating code fences and
/// prose around the object.
pub fn extract_json(response: &str) -> &str {
    let trimmed = response.trim();

    if let Some(fenced) = trimmed
        .split("```json")
        .nth(1)
        .and_then(|s| s.split("```").next())
    {
        return fenced.trim();
    }
    if trimmed.contains("```") {
        if let Some(fenced) = trimmed.split("```").nth(1) {
            return fenced.trim();
        }
    }

    let start = trimmed.find(['{', '[']);
    let end = trimmed.rfind(['}', ']']);
    match (start, end) {
        (Some(start), Some(end)) if end > start => &trimmed[start..=end],
        _ => trimmed,
    }
}

pub fn parse_json_response<T: DeserializeOwned>(response: &str) -> AppResult<T> {
    serde_json::from_str(extract_json(response))
        .map_err(|e| AppError::Parse(format!("Invalid JSON from model: {}", e)))
}

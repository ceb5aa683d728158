//! Scripted collaborators for unit tests

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::llm::keys::{KeyManagerConfig, ProviderKeyManager};
use crate::llm::provider::{LLMAdapter, TextStream};
use crate::llm::LLMService;
use crate::tools::{
    ToolCall, ToolExecutor, ToolItem, ToolResult, ToolSpec, NEWS_SEARCH, STOCK_QUOTE, WEB_SEARCH,
};
use crate::types::{AppError, AppResult, LLMRequest, LLMResponse, TokenUsage};
use crate::utils::retry::RetryPolicy;

#[derive(Debug, Clone)]
pub enum MockReply {
    Text(String),
    Chunks(Vec<String>),
    Error(String),
}

#[derive(Default)]
struct AdapterState {
    queue: VecDeque<MockReply>,
    routes: Vec<(String, MockReply)>,
    keys: Vec<String>,
    models: Vec<String>,
    prompts: Vec<String>,
}

/// Adapter that answers from routes (matched against the system instruction
/// and prompt, reusable) first, then from a FIFO queue. Unscripted calls fail
/// with a non-retryable error so agents take their fallbacks.
#[derive(Default)]
pub struct MockAdapter {
    state: Mutex<AdapterState>,
}

impl MockAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, AdapterState> {
        self.state.lock().unwrap()
    }

    pub fn push_text(&self, text: &str) {
        self.state().queue.push_back(MockReply::Text(text.to_string()));
    }

    pub fn push_chunks(&self, chunks: &[&str]) {
        self.state()
            .queue
            .push_back(MockReply::Chunks(chunks.iter().map(|c| c.to_string()).collect()));
    }

    pub fn push_error(&self, message: &str) {
        self.state().queue.push_back(MockReply::Error(message.to_string()));
    }

    /// Answer every request containing `marker` with `text`
    pub fn route(&self, marker: &str, text: &str) {
        self.state()
            .routes
            .push((marker.to_string(), MockReply::Text(text.to_string())));
    }

    pub fn route_error(&self, marker: &str, message: &str) {
        self.state()
            .routes
            .push((marker.to_string(), MockReply::Error(message.to_string())));
    }

    pub fn seen_keys(&self) -> Vec<String> {
        self.state().keys.clone()
    }

    pub fn seen_models(&self) -> Vec<String> {
        self.state().models.clone()
    }

    pub fn call_count(&self) -> usize {
        self.state().prompts.len()
    }

    pub fn prompts(&self) -> Vec<String> {
        self.state().prompts.clone()
    }

    pub fn last_prompt(&self) -> String {
        self.state().prompts.last().cloned().unwrap_or_default()
    }

    fn next_reply(&self, request: &LLMRequest, api_key: &str) -> MockReply {
        let prompt: String = request
            .messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        let system = request.system_instruction.clone().unwrap_or_default();

        let mut state = self.state();
        state.keys.push(api_key.to_string());
        state.models.push(request.model.clone());
        state.prompts.push(prompt.clone());

        let routed = state
            .routes
            .iter()
            .find(|(marker, _)| prompt.contains(marker.as_str()) || system.contains(marker.as_str()))
            .map(|(_, reply)| reply.clone());

        routed
            .or_else(|| state.queue.pop_front())
            .unwrap_or_else(|| MockReply::Error("mock adapter has no scripted reply".to_string()))
    }
}

#[async_trait]
impl LLMAdapter for MockAdapter {
    async fn create_chat_completion(&self, request: &LLMRequest, api_key: &str) -> AppResult<LLMResponse> {
        let content = match self.next_reply(request, api_key) {
            MockReply::Text(text) => text,
            MockReply::Chunks(chunks) => chunks.concat(),
            MockReply::Error(message) => return Err(AppError::LLMApi(message)),
        };
        Ok(LLMResponse {
            content,
            finish_reason: "stop".to_string(),
            usage: TokenUsage::default(),
        })
    }

    async fn create_chat_completion_stream(&self, request: &LLMRequest, api_key: &str) -> AppResult<TextStream> {
        let chunks = match self.next_reply(request, api_key) {
            MockReply::Text(text) => vec![text],
            MockReply::Chunks(chunks) => chunks,
            MockReply::Error(message) => return Err(AppError::LLMApi(message)),
        };
        Ok(stream::iter(chunks.into_iter().map(Ok)).boxed())
    }
}

/// LLM service over a mock adapter with one key and millisecond backoff
pub fn mock_llm(adapter: Arc<MockAdapter>) -> Arc<LLMService> {
    let keys = Arc::new(ProviderKeyManager::new(
        vec!["test-key".to_string()],
        KeyManagerConfig::default(),
    ));
    let policy = RetryPolicy {
        max_retries: 2,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        jitter_factor: 0.1,
    };
    Arc::new(LLMService::new(adapter, keys, policy, "mock-model"))
}

#[derive(Default)]
struct ToolsState {
    calls: Vec<ToolCall>,
    failures: HashMap<String, String>,
    fail_all: Option<String>,
    fail_next: VecDeque<String>,
}

/// Tool executor returning two hits per query, with URLs derived from the
/// query. Tracks how many calls overlap in time.
#[derive(Default)]
pub struct MockTools {
    state: Mutex<ToolsState>,
    delay: Option<Duration>,
    stock_quote: bool,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockTools {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Also offer `stock_quote`
    pub fn with_stock_quote(mut self) -> Self {
        self.stock_quote = true;
        self
    }

    /// Fail the next call only, whatever its query
    pub fn fail_next(&self, message: &str) {
        self.state
            .lock()
            .unwrap()
            .fail_next
            .push_back(message.to_string());
    }

    pub fn fail_query(&self, query: &str, message: &str) {
        self.state
            .lock()
            .unwrap()
            .failures
            .insert(query.to_string(), message.to_string());
    }

    pub fn fail_all(&self, message: &str) {
        self.state.lock().unwrap().fail_all = Some(message.to_string());
    }

    pub fn calls(&self) -> Vec<ToolCall> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

pub fn slug(text: &str) -> String {
    text.to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect()
}

#[async_trait]
impl ToolExecutor for MockTools {
    fn available_tools(&self) -> Vec<ToolSpec> {
        let mut tools = vec![
            ToolSpec {
                name: WEB_SEARCH,
                description: "mock web search",
            },
            ToolSpec {
                name: NEWS_SEARCH,
                description: "mock news search",
            },
        ];
        if self.stock_quote {
            tools.push(ToolSpec {
                name: STOCK_QUOTE,
                description: "mock stock quote",
            });
        }
        tools
    }

    async fn execute(&self, call: &ToolCall) -> AppResult<ToolResult> {
        let query = call.arg("query").unwrap_or_default().to_string();
        let failure = {
            let mut state = self.state.lock().unwrap();
            state.calls.push(call.clone());
            state
                .fail_next
                .pop_front()
                .or_else(|| state.fail_all.clone())
                .or_else(|| state.failures.get(&query).cloned())
        };

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if let Some(message) = failure {
            return Err(AppError::Tool(message));
        }

        let base = format!("https://example.com/{}", slug(&query));
        Ok(ToolResult {
            tool: call.name.clone(),
            items: vec![
                ToolItem {
                    title: format!("{} overview", query),
                    url: base.clone(),
                    snippet: format!("Overview fact about {}", query),
                    source_type: "web".to_string(),
                },
                ToolItem {
                    title: format!("{} analysis", query),
                    url: format!("{}/analysis", base),
                    snippet: format!("Analysis fact about {}", query),
                    source_type: "news".to_string(),
                },
            ],
        })
    }
}

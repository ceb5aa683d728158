// OpenAI-compatible chat completions adapter
// Serves OpenAI, OpenRouter, Groq and GLM; they all speak the same
// /chat/completions dialect, including SSE streaming.

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use reqwest::header::RETRY_AFTER;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;

use crate::llm::provider::{LLMAdapter, TextStream};
use crate::types::{AppError, AppResult, LLMProvider, LLMRequest, LLMResponse, TokenUsage};

pub struct OpenAIAdapter {
    client: Client,
    provider: LLMProvider,
    base_url: String,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    stream: bool,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChatUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: String,
    #[serde(default)]
    code: Option<serde_json::Value>,
}

impl OpenAIAdapter {
    pub fn new(
        provider: LLMProvider,
        base_url: impl Into<String>,
        timeout: Duration,
    ) -> AppResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            provider,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn chat_request<'a>(request: &'a LLMRequest, stream: bool) -> ChatRequest<'a> {
        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        if let Some(system) = &request.system_instruction {
            messages.push(ChatMessage {
                role: "system",
                content: system,
            });
        }
        messages.extend(request.messages.iter().map(|m| ChatMessage {
            role: &m.role,
            content: &m.content,
        }));

        ChatRequest {
            model: &request.model,
            messages,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            stream,
        }
    }

    async fn send(&self, body: &ChatRequest<'_>, api_key: &str) -> AppResult<reqwest::Response> {
        let url = format!("{}/chat/completions", self.base_url);

        let response = self
            .client
            .post(&url)
            .bearer_auth(api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| AppError::LLMApi(format!("{} request failed: {}", self.provider, e)))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let error_text = response.text().await.unwrap_or_default();

        // The classifier reads status, body and retry-after from this message
        let mut message = match serde_json::from_str::<ErrorResponse>(&error_text) {
            Ok(parsed) => format!(
                "{} API error ({}): {} (code: {:?})",
                self.provider, status, parsed.error.message, parsed.error.code
            ),
            Err(_) => format!("{} API error ({}): {}", self.provider, status, error_text),
        };
        if let Some(seconds) = retry_after {
            message.push_str(&format!(" (retry-after: {})", seconds));
        }

        Err(AppError::LLMApi(message))
    }
}

#[async_trait]
impl LLMAdapter for OpenAIAdapter {
    async fn create_chat_completion(
        &self,
        request: &LLMRequest,
        api_key: &str,
    ) -> AppResult<LLMResponse> {
        let body = Self::chat_request(request, false);
        let response = self.send(&body, api_key).await?;

        let parsed: ChatResponse = response.json().await.map_err(|e| {
            AppError::LLMApi(format!("Failed to parse {} response: {}", self.provider, e))
        })?;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| AppError::LLMApi(format!("{} returned no choices", self.provider)))?;

        let usage = parsed
            .usage
            .map(|u| TokenUsage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
                total_tokens: u.total_tokens,
            })
            .unwrap_or_default();

        Ok(LLMResponse {
            content: choice.message.content.unwrap_or_default(),
            finish_reason: choice.finish_reason.unwrap_or_else(|| "stop".to_string()),
            usage,
        })
    }

    async fn create_chat_completion_stream(
        &self,
        request: &LLMRequest,
        api_key: &str,
    ) -> AppResult<TextStream> {
        let body = Self::chat_request(request, true);
        let response = self.send(&body, api_key).await?;

        let bytes = response
            .bytes_stream()
            .map(|chunk| chunk.map(|b| b.to_vec()))
            .boxed();

        Ok(sse_deltas(bytes))
    }
}

#[derive(Debug, PartialEq)]
enum SseLine {
    Delta(String),
    Done,
    Skip,
}

fn parse_sse_line(line: &str) -> SseLine {
    let Some(data) = line.trim().strip_prefix("data:") else {
        return SseLine::Skip;
    };
    let data = data.trim();
    if data == "[DONE]" {
        return SseLine::Done;
    }

    match serde_json::from_str::<StreamChunk>(data) {
        Ok(chunk) => {
            let text: String = chunk
                .choices
                .into_iter()
                .filter_map(|c| c.delta.content)
                .collect();
            if text.is_empty() {
                SseLine::Skip
            } else {
                SseLine::Delta(text)
            }
        }
        Err(_) => SseLine::Skip,
    }
}

struct SseState {
    bytes: BoxStream<'static, reqwest::Result<Vec<u8>>>,
    buffer: Vec<u8>,
    pending: VecDeque<String>,
    finished: bool,
}

impl SseState {
    fn drain_lines(&mut self, flush: bool) {
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if self.handle_line(&line) {
                return;
            }
        }
        if flush && !self.buffer.is_empty() {
            let line = std::mem::take(&mut self.buffer);
            self.handle_line(&line);
        }
    }

    /// Returns true once the terminator is seen
    fn handle_line(&mut self, line: &[u8]) -> bool {
        match parse_sse_line(&String::from_utf8_lossy(line)) {
            SseLine::Delta(text) => {
                self.pending.push_back(text);
                false
            }
            SseLine::Done => {
                self.finished = true;
                self.buffer.clear();
                true
            }
            SseLine::Skip => false,
        }
    }
}

/// Turn an SSE byte stream into content deltas. Lines are split on raw bytes
/// so multi-byte characters spanning chunks stay intact.
fn sse_deltas(bytes: BoxStream<'static, reqwest::Result<Vec<u8>>>) -> TextStream {
    let state = SseState {
        bytes,
        buffer: Vec::new(),
        pending: VecDeque::new(),
        finished: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(text) = state.pending.pop_front() {
                return Some((Ok(text), state));
            }
            if state.finished {
                return None;
            }
            match state.bytes.next().await {
                Some(Ok(chunk)) => {
                    state.buffer.extend_from_slice(&chunk);
                    state.drain_lines(false);
                }
                Some(Err(e)) => {
                    state.finished = true;
                    return Some((
                        Err(AppError::LLMApi(format!("Stream interrupted: {}", e))),
                        state,
                    ));
                }
                None => {
                    state.drain_lines(true);
                    state.finished = true;
                }
            }
        }
    })
    .boxed()
}

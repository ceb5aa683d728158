//! Retry utilities for provider calls
//!
//! Every provider failure is classified as one of:
//!
//! - **RateLimited**: retried with exponential backoff and jitter on the same
//!   key. The key manager is told about the limit so that the *next* fresh
//!   request may rotate.
//! - **TooLarge**: the payload or token budget was exceeded. Retrying cannot
//!   help, so it is returned immediately with whatever token counts the
//!   provider reported.
//! - **Other**: returned unchanged on the first occurrence.

use rand::Rng;
use regex::Regex;
use std::future::Future;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::llm::keys::ProviderKeyManager;
use crate::types::{AppError, AppResult};

/// Backoff settings for one logical provider call
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Extra delay as a fraction of the computed delay, scaled by U(0,1)
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter_factor: 0.1,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FailureKind {
    RateLimited {
        retry_after: Option<Duration>,
    },
    TooLarge {
        requested_tokens: Option<u64>,
        max_tokens: Option<u64>,
    },
    Other,
}

struct Patterns {
    rate_limit: Vec<Regex>,
    too_large: Vec<Regex>,
    retry_after: Vec<Regex>,
    max_tokens: Vec<Regex>,
    requested_tokens: Vec<Regex>,
    tokens_over_maximum: Vec<Regex>,
}

/// Compile literal patterns, skipping (and logging) any that fail
pub(crate) fn compile(patterns: &[&str]) -> Vec<Regex> {
    patterns
        .iter()
        .filter_map(|p| match Regex::new(p) {
            Ok(re) => Some(re),
            Err(e) => {
                warn!(pattern = %p, error = %e, "Skipping invalid pattern");
                None
            }
        })
        .collect()
}

static PATTERNS: OnceLock<Patterns> = OnceLock::new();

fn patterns() -> &'static Patterns {
    PATTERNS.get_or_init(|| Patterns {
        rate_limit: compile(&[
            r"\b429\b",
            r"(?i)rate[_\-\s]?limit",
            r"(?i)too\s+many\s+requests",
            r"(?i)quota\s*(exceeded|limit)",
            r"(?i)resource[_\s]exhausted",
            r"(?i)overloaded",
        ]),
        too_large: compile(&[
            r"\b413\b",
            r"(?i)(request|payload)\s+(is\s+)?too\s+large",
            r"(?i)context[_\s]length[_\s]exceeded",
            r"(?i)maximum\s+context\s+length",
            r"(?i)prompt\s+is\s+too\s+long",
            r"(?i)too\s+many\s+(input\s+)?tokens",
        ]),
        retry_after: compile(&[
            r#"(?i)retry[_\-\s]?after["':\s]*(\d+(?:\.\d+)?)\s*(ms|s)?"#,
            r"(?i)try\s+again\s+in\s+(\d+(?:\.\d+)?)\s*(ms|s)",
        ]),
        max_tokens: compile(&[
            r"(?i)maximum\s+context\s+length\s+is\s+(\d+)",
            r"(?i)\blimit[:\s]+(\d+)",
        ]),
        requested_tokens: compile(&[
            r"(?i)resulted\s+in\s+(\d+)\s+tokens",
            r"(?i)requested[:\s]+(\d+)",
        ]),
        tokens_over_maximum: compile(&[r"(?i)(\d+)\s+tokens\s*>\s*(\d+)\s+maximum"]),
    })
}

fn first_number(regexes: &[Regex], text: &str) -> Option<u64> {
    regexes
        .iter()
        .find_map(|re| re.captures(text))
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Parse a retry-after hint such as `retry-after: 20` or `try again in 350ms`
pub fn extract_retry_after(text: &str) -> Option<Duration> {
    let caps = patterns().retry_after.iter().find_map(|re| re.captures(text))?;
    let value: f64 = caps.get(1)?.as_str().parse().ok()?;
    let seconds = match caps.get(2).map(|m| m.as_str().to_lowercase()) {
        Some(unit) if unit == "ms" => value / 1000.0,
        _ => value,
    };
    Duration::try_from_secs_f64(seconds).ok()
}

/// Classify a provider error message
pub fn classify_failure(message: &str) -> FailureKind {
    let p = patterns();

    if p.too_large.iter().any(|re| re.is_match(message)) {
        let over_maximum = p.tokens_over_maximum.iter().find_map(|re| re.captures(message));
        let (requested_tokens, max_tokens) = match over_maximum {
            Some(caps) => (
                caps.get(1).and_then(|m| m.as_str().parse().ok()),
                caps.get(2).and_then(|m| m.as_str().parse().ok()),
            ),
            None => (
                first_number(&p.requested_tokens, message),
                first_number(&p.max_tokens, message),
            ),
        };
        return FailureKind::TooLarge {
            requested_tokens,
            max_tokens,
        };
    }

    if p.rate_limit.iter().any(|re| re.is_match(message)) {
        return FailureKind::RateLimited {
            retry_after: extract_retry_after(message),
        };
    }

    FailureKind::Other
}

fn classify_error(error: &AppError) -> FailureKind {
    match error {
        AppError::TooLarge {
            requested_tokens,
            max_tokens,
            ..
        } => FailureKind::TooLarge {
            requested_tokens: *requested_tokens,
            max_tokens: *max_tokens,
        },
        AppError::LLMApi(message) | AppError::Tool(message) => classify_failure(message),
        _ => FailureKind::Other,
    }
}

/// Delay before retry number `attempt` (0-based). `unit_sample` is drawn from
/// U(0,1) and scales the jitter.
pub fn backoff_delay(
    policy: &RetryPolicy,
    attempt: u32,
    retry_after: Option<Duration>,
    unit_sample: f64,
) -> Duration {
    let exponential = policy
        .base_delay
        .saturating_mul(2u32.saturating_pow(attempt))
        .min(policy.max_delay);

    let delay = match retry_after {
        Some(hint) if hint < policy.max_delay && hint > exponential => hint,
        _ => exponential,
    };

    let jitter = delay.mul_f64(policy.jitter_factor.max(0.0) * unit_sample.clamp(0.0, 1.0));
    delay + jitter
}

/// Aborts an attempt whose caller stopped waiting for it
struct AttemptTask<T>(JoinHandle<T>);

impl<T> Drop for AttemptTask<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Runs provider calls with classified retries
#[derive(Clone, Default)]
pub struct RetryExecutor {
    key_manager: Option<Arc<ProviderKeyManager>>,
}

impl RetryExecutor {
    pub fn new(key_manager: Option<Arc<ProviderKeyManager>>) -> Self {
        Self { key_manager }
    }

    /// Run `operation` until it succeeds, fails with a non-retryable error, or
    /// exhausts `policy.max_retries` rate-limit retries.
    ///
    /// Each attempt is spawned onto the runtime's worker pool and aborted if
    /// this future is dropped mid-attempt. `api_key` is the
    /// key the caller picked for this logical call; it stays fixed across
    /// retries and is only used to report rate limits.
    pub async fn execute<T, F, Fut>(
        &self,
        policy: &RetryPolicy,
        api_key: Option<&str>,
        operation: F,
    ) -> AppResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = AppResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        let mut attempt: u32 = 0;

        loop {
            let mut task = AttemptTask(tokio::spawn(operation()));
            let outcome = match (&mut task.0).await {
                Ok(result) => result,
                Err(join_error) => Err(AppError::Internal(format!(
                    "Provider call task failed: {}",
                    join_error
                ))),
            };

            let error = match outcome {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(retries = attempt, "Provider call succeeded after retries");
                    }
                    return Ok(value);
                }
                Err(error) => error,
            };

            match classify_error(&error) {
                FailureKind::TooLarge {
                    requested_tokens,
                    max_tokens,
                } => {
                    warn!(
                        requested_tokens = ?requested_tokens,
                        max_tokens = ?max_tokens,
                        "Provider rejected request as too large"
                    );
                    return Err(match error {
                        AppError::TooLarge { .. } => error,
                        other => AppError::TooLarge {
                            requested_tokens,
                            max_tokens,
                            message: other.to_string(),
                        },
                    });
                }
                FailureKind::RateLimited { retry_after } => {
                    if let (Some(keys), Some(key)) = (&self.key_manager, api_key) {
                        keys.report_rate_limit(key, retry_after);
                    }

                    if attempt >= policy.max_retries {
                        warn!(
                            attempts = attempt + 1,
                            retry_after = ?retry_after,
                            "Rate limit retries exhausted"
                        );
                        return Err(AppError::RateLimitExhausted {
                            attempts: attempt + 1,
                            retry_after,
                        });
                    }

                    let delay =
                        backoff_delay(policy, attempt, retry_after, rand::thread_rng().gen::<f64>());
                    warn!(
                        attempt = attempt + 1,
                        max_retries = policy.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        "Rate limited by provider, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                FailureKind::Other => return Err(error),
            }
        }
    }

    /// Streaming variant: only the initiation of the stream is retried. Once a
    /// stream is handed back, errors inside it belong to the consumer.
    pub async fn execute_stream<S, F, Fut>(
        &self,
        policy: &RetryPolicy,
        api_key: Option<&str>,
        start_stream: F,
    ) -> AppResult<S>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = AppResult<S>> + Send + 'static,
        S: futures::Stream + Send + 'static,
    {
        self.execute(policy, api_key, start_stream).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::keys::KeyManagerConfig;
    use futures::StreamExt;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            jitter_factor: 0.1,
        }
    }

    #[test]
    fn test_classify_rate_limit_with_retry_after() {
        assert_eq!(
            classify_failure("openai API error (429 Too Many Requests): slow down; retry-after: 20"),
            FailureKind::RateLimited {
                retry_after: Some(Duration::from_secs(20))
            }
        );
        assert_eq!(
            classify_failure("Rate limit reached for gpt-4o. Please try again in 350ms."),
            FailureKind::RateLimited {
                retry_after: Some(Duration::from_millis(350))
            }
        );
        assert_eq!(
            classify_failure("RESOURCE_EXHAUSTED: quota exceeded"),
            FailureKind::RateLimited { retry_after: None }
        );
    }

    #[test]
    fn test_classify_too_large_with_counts() {
        assert_eq!(
            classify_failure(
                "This model's maximum context length is 8192 tokens. However, your messages resulted in 12000 tokens."
            ),
            FailureKind::TooLarge {
                requested_tokens: Some(12000),
                max_tokens: Some(8192),
            }
        );
        assert_eq!(
            classify_failure("prompt is too long: 210000 tokens > 200000 maximum"),
            FailureKind::TooLarge {
                requested_tokens: Some(210000),
                max_tokens: Some(200000),
            }
        );
        assert_eq!(
            classify_failure("Request too large for gpt-4 on tokens per min (TPM): Limit 10000, Requested 12000"),
            FailureKind::TooLarge {
                requested_tokens: Some(12000),
                max_tokens: Some(10000),
            }
        );
    }

    #[test]
    fn test_classify_other() {
        assert_eq!(classify_failure("invalid api key"), FailureKind::Other);
        assert_eq!(classify_failure("session ses_4290abc not found"), FailureKind::Other);
    }

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let policy = RetryPolicy {
            max_retries: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            jitter_factor: 0.25,
        };
        let mut rng = StdRng::seed_from_u64(9);

        for attempt in 0..10u32 {
            let expected = Duration::from_millis(100 * 2u64.pow(attempt)).min(policy.max_delay);
            let sample: f64 = rng.gen();
            let delay = backoff_delay(&policy, attempt, None, sample);
            let jitter = delay - expected;

            assert!(delay >= expected);
            assert!(jitter.as_secs_f64() < expected.as_secs_f64() * policy.jitter_factor);
        }
    }

    #[test]
    fn test_backoff_honours_retry_after_within_bounds() {
        let policy = RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter_factor: 0.0,
        };
        assert_eq!(
            backoff_delay(&policy, 0, Some(Duration::from_secs(5)), 0.5),
            Duration::from_secs(5)
        );
        // Larger than the cap: ignored
        assert_eq!(
            backoff_delay(&policy, 0, Some(Duration::from_secs(90)), 0.5),
            Duration::from_secs(1)
        );
        // Shorter than the computed delay: ignored
        assert_eq!(
            backoff_delay(&policy, 2, Some(Duration::from_millis(500)), 0.5),
            Duration::from_secs(4)
        );
    }

    #[tokio::test]
    async fn test_too_large_is_attempted_once() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let executor = RetryExecutor::default();

        let result: AppResult<()> = executor
            .execute(&fast_policy(5), None, move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(AppError::LLMApi(
                        "413 Payload Too Large: maximum context length is 4096 tokens".to_string(),
                    ))
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        match result {
            Err(AppError::TooLarge { max_tokens, .. }) => assert_eq!(max_tokens, Some(4096)),
            other => panic!("expected TooLarge, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_rate_limit_retries_then_succeeds() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let executor = RetryExecutor::default();

        let result = executor
            .execute(&fast_policy(5), None, move || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(AppError::LLMApi("429 Too Many Requests".to_string()))
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;

        tokio_test::assert_ok!(&result);
        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_rate_limit_exhaustion_carries_hint() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let executor = RetryExecutor::default();

        let result: AppResult<()> = executor
            .execute(&fast_policy(3), None, move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(AppError::LLMApi("rate limit exceeded, retry after 2s".to_string()))
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        match result {
            Err(AppError::RateLimitExhausted {
                attempts,
                retry_after,
            }) => {
                assert_eq!(attempts, 4);
                assert_eq!(retry_after, Some(Duration::from_secs(2)));
            }
            other => panic!("expected RateLimitExhausted, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_other_errors_propagate_unchanged() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let executor = RetryExecutor::default();

        let result: AppResult<()> = executor
            .execute(&fast_policy(5), None, move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(AppError::LLMApi("invalid api key".to_string()))
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(AppError::LLMApi(ref m)) if m == "invalid api key"));
    }

    #[tokio::test]
    async fn test_rate_limits_are_reported_without_rotation() {
        let keys = Arc::new(ProviderKeyManager::with_rng(
            vec!["key-a".to_string(), "key-b".to_string()],
            KeyManagerConfig {
                rotation_probability: 1.0,
                ..KeyManagerConfig::default()
            },
            StdRng::seed_from_u64(1),
        ));
        let executor = RetryExecutor::new(Some(keys.clone()));

        let result: AppResult<()> = executor
            .execute(&fast_policy(2), Some("key-a"), || async {
                Err(AppError::LLMApi("429".to_string()))
            })
            .await;
        assert!(matches!(result, Err(AppError::RateLimitExhausted { attempts: 3, .. })));

        let stats = keys.get_stats();
        assert_eq!(stats.keys[0].rate_limit_count, 3);
        assert_eq!(stats.current_index, 0);
        assert!(stats.rotation_pending);
    }

    #[tokio::test]
    async fn test_stream_initiation_is_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let executor = RetryExecutor::default();

        let stream = executor
            .execute_stream(&fast_policy(3), None, move || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(AppError::LLMApi("429".to_string()))
                    } else {
                        Ok(futures::stream::iter(vec!["a", "b"]).boxed())
                    }
                }
            })
            .await
            .unwrap();

        let chunks: Vec<&str> = stream.collect().await;
        assert_eq!(chunks, vec!["a", "b"]);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_dropped_call_aborts_in_flight_attempt() {
        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();
        let executor = RetryExecutor::default();

        let policy = fast_policy(0);
        let call = executor.execute(&policy, None, move || {
            let flag = flag.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                flag.store(true, Ordering::SeqCst);
                Ok::<_, AppError>(())
            }
        });

        let timed_out = tokio::time::timeout(Duration::from_millis(10), call).await.is_err();
        assert!(timed_out);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!finished.load(Ordering::SeqCst));
    }

    #[test]
    fn test_invalid_patterns_are_skipped() {
        let compiled = compile(&[r"(unclosed", r"\b429\b"]);
        assert_eq!(compiled.len(), 1);
        assert!(compiled[0].is_match("status 429"));
    }
}

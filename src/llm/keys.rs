//! Provider Key Manager
//!
//! Tracks the configured provider API keys, their cooldowns after rate-limit
//! responses, and the rotation policy between them.
//!
//! Rotation never happens in the middle of a retry loop: a rate-limit report
//! only marks the key as cooling down and flags a pending rotation. The next
//! fresh request that asks for a key decides whether to rotate, with a fixed
//! probability, so that concurrent callers do not all flip keys in lockstep.
//!
//! There is one manager per [`LLMService`](crate::llm::LLMService); it is
//! created in `LLMService::from_config` and shared through an `Arc`.

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Cooldown and rotation settings
#[derive(Debug, Clone)]
pub struct KeyManagerConfig {
    /// Cooldown applied when the provider gives no retry-after hint
    pub default_cooldown: Duration,
    /// Upper bound for any cooldown, including server hints
    pub max_cooldown: Duration,
    /// Chance that a fresh request rotates after a rate limit was reported
    pub rotation_probability: f64,
}

impl Default for KeyManagerConfig {
    fn default() -> Self {
        Self {
            default_cooldown: Duration::from_secs(60),
            max_cooldown: Duration::from_secs(300),
            rotation_probability: 0.5,
        }
    }
}

/// Usage and cooldown state of one key
#[derive(Debug, Clone)]
pub struct KeyState {
    pub key: String,
    pub request_count: u64,
    pub rate_limit_count: u64,
    pub rate_limited_until: Option<Instant>,
    pub last_used: Option<DateTime<Utc>>,
}

impl KeyState {
    fn new(key: String) -> Self {
        Self {
            key,
            request_count: 0,
            rate_limit_count: 0,
            rate_limited_until: None,
            last_used: None,
        }
    }

    pub fn is_rate_limited(&self, now: Instant) -> bool {
        self.rate_limited_until.is_some_and(|until| until > now)
    }

    pub fn remaining_cooldown(&self, now: Instant) -> Duration {
        self.rate_limited_until
            .map(|until| until.saturating_duration_since(now))
            .unwrap_or_default()
    }
}

/// Snapshot of a single key for diagnostics; the key itself is masked
#[derive(Debug, Clone, Serialize)]
pub struct KeyUsage {
    pub key_hint: String,
    pub request_count: u64,
    pub rate_limit_count: u64,
    pub rate_limited: bool,
    pub cooldown_remaining_secs: f64,
    pub last_used: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct KeyManagerStats {
    pub total_keys: usize,
    pub current_index: usize,
    pub rotation_pending: bool,
    pub keys: Vec<KeyUsage>,
}

struct KeyManagerInner {
    keys: Vec<KeyState>,
    current_index: usize,
    rotation_pending: bool,
    rng: StdRng,
}

impl KeyManagerInner {
    /// First key after the current one that is out of cooldown, otherwise the
    /// key with the least cooldown left
    fn next_available_index(&self, now: Instant) -> usize {
        let total = self.keys.len();
        (1..=total)
            .map(|offset| (self.current_index + offset) % total)
            .find(|&index| !self.keys[index].is_rate_limited(now))
            .or_else(|| {
                self.keys
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, state)| state.remaining_cooldown(now))
                    .map(|(index, _)| index)
            })
            .unwrap_or(self.current_index)
    }
}

pub struct ProviderKeyManager {
    config: KeyManagerConfig,
    inner: Mutex<KeyManagerInner>,
}

impl ProviderKeyManager {
    pub fn new(keys: Vec<String>, config: KeyManagerConfig) -> Self {
        Self::with_rng(keys, config, StdRng::from_entropy())
    }

    /// Construct with an explicit RNG, used for deterministic rotation in tests
    pub fn with_rng(keys: Vec<String>, config: KeyManagerConfig, rng: StdRng) -> Self {
        info!(key_count = keys.len(), "Initializing provider key manager");
        Self {
            config,
            inner: Mutex::new(KeyManagerInner {
                keys: keys.into_iter().map(KeyState::new).collect(),
                current_index: 0,
                rotation_pending: false,
                rng,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, KeyManagerInner> {
        // A panic while holding the lock cannot leave the counters inconsistent
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn key_count(&self) -> usize {
        self.lock().keys.len()
    }

    /// Key for a fresh top-level request. Retries of the same call must reuse
    /// the key they started with instead of calling this again.
    pub fn get_key(&self) -> Option<String> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        if inner.keys.is_empty() {
            return None;
        }

        if inner.rotation_pending {
            inner.rotation_pending = false;
            let probability = self.config.rotation_probability.clamp(0.0, 1.0);
            if inner.keys.len() > 1 && inner.rng.gen_bool(probability) {
                let next = inner.next_available_index(Instant::now());
                if next != inner.current_index {
                    debug!(from = inner.current_index, to = next, "Rotating provider key");
                }
                inner.current_index = next;
            }
        }

        let state = &mut inner.keys[inner.current_index];
        state.request_count += 1;
        state.last_used = Some(Utc::now());
        Some(state.key.clone())
    }

    /// Start a cooldown for `key` and flag a rotation for the next fresh request
    pub fn report_rate_limit(&self, key: &str, retry_after: Option<Duration>) {
        let cooldown = retry_after
            .unwrap_or(self.config.default_cooldown)
            .min(self.config.max_cooldown);

        let mut guard = self.lock();
        let inner = &mut *guard;
        match inner.keys.iter_mut().find(|state| state.key == key) {
            Some(state) => {
                state.rate_limit_count += 1;
                state.rate_limited_until = Some(Instant::now() + cooldown);
                inner.rotation_pending = true;
                warn!(
                    key = %mask_key(key),
                    cooldown_secs = cooldown.as_secs_f64(),
                    rate_limits = state.rate_limit_count,
                    "Provider key rate limited"
                );
            }
            None => warn!(key = %mask_key(key), "Rate limit reported for unknown key"),
        }
    }

    pub fn get_stats(&self) -> KeyManagerStats {
        let inner = self.lock();
        let now = Instant::now();
        KeyManagerStats {
            total_keys: inner.keys.len(),
            current_index: inner.current_index,
            rotation_pending: inner.rotation_pending,
            keys: inner
                .keys
                .iter()
                .map(|state| KeyUsage {
                    key_hint: mask_key(&state.key),
                    request_count: state.request_count,
                    rate_limit_count: state.rate_limit_count,
                    rate_limited: state.is_rate_limited(now),
                    cooldown_remaining_secs: state.remaining_cooldown(now).as_secs_f64(),
                    last_used: state.last_used,
                })
                .collect(),
        }
    }

    /// Clear all counters and cooldowns, keeping the configured keys
    pub fn reset(&self) {
        let mut guard = self.lock();
        let inner = &mut *guard;
        for state in inner.keys.iter_mut() {
            *state = KeyState::new(std::mem::take(&mut state.key));
        }
        inner.current_index = 0;
        inner.rotation_pending = false;
    }
}

fn mask_key(key: &str) -> String {
    let prefix: String = key.chars().take(4).collect();
    format!("{}…", prefix)
}

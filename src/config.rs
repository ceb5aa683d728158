use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

use crate::llm::keys::KeyManagerConfig;
use crate::utils::retry::RetryPolicy;

#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub llm: LLMConfig,
    pub search: SearchConfig,
    pub logging: LoggingConfig,
    pub research: ResearchConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
    pub cors_allowed_origins: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Without a URL transcripts are kept in memory
    pub url: Option<String>,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LLMConfig {
    pub provider: String,
    pub model: String,
    /// Overrides the provider's default OpenAI-compatible endpoint
    pub base_url: Option<String>,
    /// Keys rotated by the key manager, in configured order
    pub api_keys: Vec<String>,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchConfig {
    pub serpapi_key: String,
    pub base_url: String,
    pub max_results: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Directory for daily-rolling log files; stdout only when unset
    pub log_dir: Option<String>,
}

/// Pipeline tuning, loaded from `RESEARCH_*` environment variables
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResearchConfig {
    pub max_concurrent_units: usize,
    pub max_tool_calls_per_unit: usize,
    pub follow_up_enabled: bool,
    pub max_follow_up_questions: usize,
    pub follow_up_max_tool_calls_per_unit: usize,
    pub min_sub_questions: usize,
    pub max_sub_questions: usize,
    pub report_chunk_size: usize,
    pub poll_interval_ms: u64,
    pub run_timeout_secs: u64,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub retry_jitter_factor: f64,
    pub key_default_cooldown_secs: u64,
    pub key_max_cooldown_secs: u64,
    pub key_rotation_probability: f64,
    pub max_fallback_findings: usize,
}

impl Default for ResearchConfig {
    fn default() -> Self {
        Self {
            max_concurrent_units: 3,
            max_tool_calls_per_unit: 6,
            follow_up_enabled: true,
            max_follow_up_questions: 3,
            follow_up_max_tool_calls_per_unit: 3,
            min_sub_questions: 2,
            max_sub_questions: 6,
            report_chunk_size: 100,
            poll_interval_ms: 50,
            run_timeout_secs: 900,
            max_retries: 5,
            retry_base_delay_ms: 1000,
            retry_max_delay_ms: 60_000,
            retry_jitter_factor: 0.1,
            key_default_cooldown_secs: 60,
            key_max_cooldown_secs: 300,
            key_rotation_probability: 0.5,
            max_fallback_findings: 10,
        }
    }
}

impl ResearchConfig {
    pub fn load() -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::Environment::with_prefix("RESEARCH").try_parsing(true))
            .build()
            .context("Failed to read RESEARCH_* settings")?;

        let research: ResearchConfig = settings
            .try_deserialize()
            .context("Invalid RESEARCH_* settings")?;
        research.validate()?;
        Ok(research)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_units == 0 {
            anyhow::bail!("RESEARCH_MAX_CONCURRENT_UNITS must be at least 1");
        }
        if self.min_sub_questions == 0 || self.min_sub_questions > self.max_sub_questions {
            anyhow::bail!(
                "Sub-question bounds are invalid (min {}, max {})",
                self.min_sub_questions,
                self.max_sub_questions
            );
        }
        if self.report_chunk_size == 0 {
            anyhow::bail!("RESEARCH_REPORT_CHUNK_SIZE must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.key_rotation_probability) {
            anyhow::bail!("RESEARCH_KEY_ROTATION_PROBABILITY must be within [0, 1]");
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
            jitter_factor: self.retry_jitter_factor,
        }
    }

    pub fn key_manager_config(&self) -> KeyManagerConfig {
        KeyManagerConfig {
            default_cooldown: Duration::from_secs(self.key_default_cooldown_secs),
            max_cooldown: Duration::from_secs(self.key_max_cooldown_secs),
            rotation_probability: self.key_rotation_probability,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            server: ServerConfig {
                port: env::var("PORT")
                    .unwrap_or_else(|_| "3000".to_string())
                    .parse()
                    .context("PORT must be a valid port number")?,
                host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                cors_allowed_origins: split_list(
                    &env::var("ALLOWED_ORIGINS")
                        .unwrap_or_else(|_| "http://localhost:3000,http://localhost:5173".to_string()),
                ),
            },
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").ok().filter(|url| !url.trim().is_empty()),
                max_connections: env::var("DB_MAX_CONNECTIONS")
                    .unwrap_or_else(|_| "10".to_string())
                    .parse()?,
                min_connections: env::var("DB_MIN_CONNECTIONS")
                    .unwrap_or_else(|_| "1".to_string())
                    .parse()?,
            },
            llm: LLMConfig {
                provider: env::var("LLM_PROVIDER").unwrap_or_else(|_| "openai".to_string()),
                model: env::var("LLM_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string()),
                base_url: env::var("LLM_BASE_URL").ok().filter(|url| !url.trim().is_empty()),
                api_keys: llm_api_keys(),
                request_timeout_secs: env::var("LLM_REQUEST_TIMEOUT_SECS")
                    .unwrap_or_else(|_| "120".to_string())
                    .parse()?,
            },
            search: SearchConfig {
                serpapi_key: env::var("SERPAPI_KEY").unwrap_or_default(),
                base_url: env::var("SERPAPI_BASE_URL")
                    .unwrap_or_else(|_| "https://serpapi.com".to_string()),
                max_results: env::var("SEARCH_MAX_RESULTS")
                    .unwrap_or_else(|_| "8".to_string())
                    .parse()?,
            },
            logging: LoggingConfig {
                log_dir: env::var("LOG_DIR").ok().filter(|dir| !dir.trim().is_empty()),
            },
            research: ResearchConfig::load()?,
        })
    }
}

/// `LLM_API_KEYS` (comma separated) wins over the single `LLM_API_KEY`
fn llm_api_keys() -> Vec<String> {
    match env::var("LLM_API_KEYS") {
        Ok(keys) => split_list(&keys),
        Err(_) => env::var("LLM_API_KEY")
            .map(|key| split_list(&key))
            .unwrap_or_default(),
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_list_skips_blanks() {
        assert_eq!(split_list("a, b,,c "), vec!["a", "b", "c"]);
        assert!(split_list("").is_empty());
    }

    #[test]
    fn test_research_defaults_are_valid() {
        let research = ResearchConfig::default();
        assert!(research.validate().is_ok());
        assert!(research.follow_up_max_tool_calls_per_unit < research.max_tool_calls_per_unit);
        assert_eq!(research.retry_policy().max_retries, 5);
        assert_eq!(research.key_manager_config().rotation_probability, 0.5);
    }

    #[test]
    fn test_research_validate_rejects_bad_bounds() {
        let research = ResearchConfig {
            min_sub_questions: 7,
            max_sub_questions: 6,
            ..ResearchConfig::default()
        };
        assert!(research.validate().is_err());

        let research = ResearchConfig {
            key_rotation_probability: 1.5,
            ..ResearchConfig::default()
        };
        assert!(research.validate().is_err());
    }
}

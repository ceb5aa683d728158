//! SerpAPI tools
//!
//! - `web_search`: Google organic results
//! - `news_search`: Google News
//! - `stock_quote`: Google Finance quote summary for a ticker
//!
//! Requests go straight to the SerpAPI JSON endpoint so the base URL can be
//! pointed elsewhere and each call picks its own engine.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{ToolCall, ToolExecutor, ToolItem, ToolResult, ToolSpec, NEWS_SEARCH, STOCK_QUOTE, WEB_SEARCH};
use crate::config::SearchConfig;
use crate::types::{AppError, AppResult};

/// SerpAPI answers with this error text when a query simply has no hits
const NO_RESULTS_MARKER: &str = "hasn't returned any results";

pub struct SerpApiTools {
    client: Client,
    api_key: String,
    base_url: String,
    max_results: usize,
}

impl SerpApiTools {
    pub fn new(api_key: impl Into<String>, base_url: impl Into<String>, max_results: usize) -> AppResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| AppError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_key: api_key.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            max_results,
        })
    }

    pub fn from_config(config: &SearchConfig) -> AppResult<Self> {
        if config.serpapi_key.is_empty() {
            warn!("SERPAPI_KEY not set; tool calls will fail and units will rely on fallbacks");
        }
        Self::new(config.serpapi_key.clone(), config.base_url.clone(), config.max_results)
    }

    async fn search(&self, engine: &str, params: &[(&str, &str)]) -> AppResult<Value> {
        if self.api_key.is_empty() {
            return Err(AppError::Tool("SerpAPI key not configured".to_string()));
        }

        info!(engine = %engine, "Searching via SerpAPI");

        let url = format!("{}/search.json", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[("engine", engine), ("api_key", self.api_key.as_str()), ("hl", "en")])
            .query(params)
            .send()
            .await
            .map_err(|e| AppError::Tool(format!("SerpAPI request failed: {}", e)))?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(AppError::Tool(format!("SerpAPI error ({}): {}", status, body)));
        }

        let value: Value = serde_json::from_str(&body)
            .map_err(|e| AppError::Tool(format!("Failed to parse SerpAPI response: {}", e)))?;

        if let Some(error) = value.get("error").and_then(|v| v.as_str()) {
            if error.contains(NO_RESULTS_MARKER) {
                debug!(engine = %engine, "SerpAPI returned no results");
                return Ok(Value::Null);
            }
            return Err(AppError::Tool(format!("SerpAPI error: {}", error)));
        }

        Ok(value)
    }

    async fn web_search(&self, query: &str) -> AppResult<Vec<ToolItem>> {
        let num = self.max_results.to_string();
        let value = self
            .search("google", &[("q", query), ("gl", "us"), ("num", num.as_str())])
            .await?;
        Ok(parse_organic(&value, self.max_results))
    }

    async fn news_search(&self, query: &str) -> AppResult<Vec<ToolItem>> {
        let value = self.search("google_news", &[("q", query), ("gl", "us")]).await?;
        Ok(parse_news(&value, self.max_results))
    }

    async fn stock_quote(&self, symbol: &str) -> AppResult<Vec<ToolItem>> {
        let value = self.search("google_finance", &[("q", symbol)]).await?;
        Ok(parse_quote(&value).into_iter().collect())
    }
}

#[async_trait]
impl ToolExecutor for SerpApiTools {
    fn available_tools(&self) -> Vec<ToolSpec> {
        vec![
            ToolSpec {
                name: WEB_SEARCH,
                description: "General web search. Arguments: {\"query\": string}",
            },
            ToolSpec {
                name: NEWS_SEARCH,
                description: "Recent news articles. Arguments: {\"query\": string}",
            },
            ToolSpec {
                name: STOCK_QUOTE,
                description: "Current quote for a ticker. Arguments: {\"symbol\": string}",
            },
        ]
    }

    async fn execute(&self, call: &ToolCall) -> AppResult<ToolResult> {
        let items = match call.name.as_str() {
            WEB_SEARCH | NEWS_SEARCH => {
                let query = call
                    .arg("query")
                    .ok_or_else(|| AppError::Tool(format!("{} requires a query", call.name)))?;
                if call.name == WEB_SEARCH {
                    self.web_search(query).await?
                } else {
                    self.news_search(query).await?
                }
            }
            STOCK_QUOTE => {
                let symbol = call
                    .arg("symbol")
                    .or_else(|| call.arg("query"))
                    .ok_or_else(|| AppError::Tool("stock_quote requires a symbol".to_string()))?;
                self.stock_quote(symbol).await?
            }
            other => return Err(AppError::Tool(format!("Unknown tool: {}", other))),
        };

        info!(tool = %call.name, count = items.len(), "Tool call completed");
        Ok(ToolResult {
            tool: call.name.clone(),
            items,
        })
    }
}

fn str_field<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(|v| v.as_str())
}

fn parse_organic(value: &Value, max_results: usize) -> Vec<ToolItem> {
    let Some(results) = value.get("organic_results").and_then(|v| v.as_array()) else {
        return Vec::new();
    };

    results
        .iter()
        .filter_map(|result| {
            let url = str_field(result, "link")?.to_string();
            Some(ToolItem {
                title: str_field(result, "title").unwrap_or("Untitled").to_string(),
                snippet: str_field(result, "snippet").unwrap_or("").to_string(),
                source_type: source_type_for(&url, "web").to_string(),
                url,
            })
        })
        .take(max_results)
        .collect()
}

fn parse_news(value: &Value, max_results: usize) -> Vec<ToolItem> {
    let Some(results) = value.get("news_results").and_then(|v| v.as_array()) else {
        return Vec::new();
    };

    results
        .iter()
        // Story clusters nest the articles one level down
        .flat_map(|result| match result.get("stories").and_then(|v| v.as_array()) {
            Some(stories) => stories.iter().collect::<Vec<_>>(),
            None => vec![result],
        })
        .filter_map(|story| {
            let url = str_field(story, "link")?.to_string();
            let source = story
                .get("source")
                .and_then(|s| s.get("name").and_then(|v| v.as_str()).or_else(|| s.as_str()));
            let date = str_field(story, "date");
            let snippet = match (source, date) {
                (Some(source), Some(date)) => format!("{} ({})", source, date),
                (Some(source), None) => source.to_string(),
                (None, Some(date)) => date.to_string(),
                (None, None) => String::new(),
            };
            Some(ToolItem {
                title: str_field(story, "title").unwrap_or("Untitled").to_string(),
                url,
                snippet,
                source_type: "news".to_string(),
            })
        })
        .take(max_results)
        .collect()
}

fn parse_quote(value: &Value) -> Option<ToolItem> {
    let summary = value.get("summary")?;
    let stock = str_field(summary, "stock")?;
    let exchange = str_field(summary, "exchange").unwrap_or("");
    let title = str_field(summary, "title").unwrap_or(stock);

    let price = summary
        .get("extracted_price")
        .and_then(|v| v.as_f64())
        .map(|p| format!("{:.2}", p))
        .or_else(|| str_field(summary, "price").map(str::to_string))
        .unwrap_or_else(|| "n/a".to_string());
    let currency = str_field(summary, "currency").unwrap_or("");

    let movement = summary.get("price_movement").map(|m| {
        let direction = str_field(m, "movement").unwrap_or("");
        let pct = m.get("percentage").and_then(|v| v.as_f64()).unwrap_or(0.0);
        format!(" ({} {:.2}%)", direction, pct)
    });

    let url = if exchange.is_empty() {
        format!("https://www.google.com/finance/quote/{}", stock)
    } else {
        format!("https://www.google.com/finance/quote/{}:{}", stock, exchange)
    };

    Some(ToolItem {
        title: format!("{} ({})", title, stock),
        url,
        snippet: format!(
            "Price {} {}{}",
            price,
            currency,
            movement.unwrap_or_default()
        )
        .trim()
        .to_string(),
        source_type: "market_data".to_string(),
    })
}

/// Classify a source by its domain
fn source_type_for(url: &str, default: &'static str) -> &'static str {
    const FILINGS: [&str; 3] = ["sec.gov", "investor.", "/investors"];
    const ACADEMIC: [&str; 6] = ["arxiv.org", "ssrn.com", "nber.org", ".edu", "scholar.", "jstor.org"];
    const NEWS: [&str; 7] = [
        "reuters.com",
        "bloomberg.com",
        "wsj.com",
        ".ft.com",
        "cnbc.com",
        "marketwatch.com",
        "apnews.com",
    ];

    let lower = url.to_lowercase();
    if FILINGS.iter().any(|d| lower.contains(d)) {
        "filing"
    } else if ACADEMIC.iter().any(|d| lower.contains(d)) {
        "academic"
    } else if NEWS.iter().any(|d| lower.contains(d)) {
        "news"
    } else {
        default
    }
}

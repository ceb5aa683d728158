//! Tool Executor
//!
//! Research units gather evidence through tools. A tool call is a name plus
//! JSON arguments; every tool answers with a flat list of source hits so the
//! unit can turn them into notes without knowing which backend produced them.

pub mod serpapi;

pub use serpapi::SerpApiTools;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

use crate::types::AppResult;
use crate::utils::retry::compile;

pub const WEB_SEARCH: &str = "web_search";
pub const NEWS_SEARCH: &str = "news_search";
pub const STOCK_QUOTE: &str = "stock_quote";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    pub arguments: serde_json::Value,
}

impl ToolCall {
    pub fn query(name: &str, query: &str) -> Self {
        Self {
            name: name.to_string(),
            arguments: serde_json::json!({ "query": query }),
        }
    }

    /// String argument lookup
    pub fn arg(&self, key: &str) -> Option<&str> {
        self.arguments
            .get(key)
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolItem {
    pub title: String,
    pub url: String,
    pub snippet: String,
    pub source_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool: String,
    pub items: Vec<ToolItem>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolSpec {
    pub name: &'static str,
    pub description: &'static str,
}

#[async_trait]
pub trait ToolExecutor: Send + Sync {
    fn available_tools(&self) -> Vec<ToolSpec>;

    async fn execute(&self, call: &ToolCall) -> AppResult<ToolResult>;
}

const QUOTE_MARKERS: [&str; 4] = ["stock price", "share price", "stock quote", "market cap"];
const NEWS_MARKERS: [&str; 5] = ["news", "latest", "recent", "this week", "today"];

/// `NVDA`, `$NVDA`, `NVDA:NASDAQ`
static TICKER: OnceLock<Vec<Regex>> = OnceLock::new();

fn as_ticker(token: &str) -> Option<String> {
    let token = token.trim_matches(|c: char| matches!(c, '?' | ',' | '.' | '(' | ')' | '\'' | '"'));
    let patterns = TICKER.get_or_init(|| compile(&[r"^\$?([A-Z]{1,5}(?::[A-Z]{2,10})?)$"]));
    patterns
        .iter()
        .find_map(|re| re.captures(token))
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// Ticker a query asks a quote for: a bare ticker, or a ticker next to a
/// price marker such as "NVDA stock price"
pub fn quote_symbol(query: &str) -> Option<String> {
    let tokens: Vec<&str> = query.split_whitespace().collect();
    if let [only] = tokens.as_slice() {
        return as_ticker(only);
    }

    let lower = query.to_lowercase();
    if !QUOTE_MARKERS.iter().any(|marker| lower.contains(marker)) {
        return None;
    }
    tokens.iter().find_map(|token| as_ticker(token))
}

/// Pick the tool for a search query. Quote requests go to the quote tool and
/// news-flavoured queries to the news engine, when the executor offers them.
pub fn tool_for_query(query: &str, available: &[ToolSpec]) -> &'static str {
    let offers = |name: &str| available.iter().any(|t| t.name == name);

    if offers(STOCK_QUOTE) && quote_symbol(query).is_some() {
        return STOCK_QUOTE;
    }

    let lower = query.to_lowercase();
    if offers(NEWS_SEARCH) && NEWS_MARKERS.iter().any(|marker| lower.contains(marker)) {
        NEWS_SEARCH
    } else {
        WEB_SEARCH
    }
}

/// The full call for a search query, with `symbol` filled in for quotes
pub fn tool_call_for_query(query: &str, available: &[ToolSpec]) -> ToolCall {
    let tool = tool_for_query(query, available);
    let mut call = ToolCall::query(tool, query);
    if tool == STOCK_QUOTE {
        if let Some(symbol) = quote_symbol(query) {
            call.arguments["symbol"] = serde_json::Value::String(symbol);
        }
    }
    call
}

#[cfg(test)]
mod tests {
    use super::*;

    fn specs(names: &[&'static str]) -> Vec<ToolSpec> {
        names
            .iter()
            .map(|&name| ToolSpec {
                name,
                description: "",
            })
            .collect()
    }

    #[test]
    fn test_tool_for_query() {
        let all = specs(&[WEB_SEARCH, NEWS_SEARCH]);
        assert_eq!(tool_for_query("NVDA latest news", &all), NEWS_SEARCH);
        assert_eq!(tool_for_query("NVDA gross margin 2024", &all), WEB_SEARCH);
        assert_eq!(tool_for_query("NVDA latest news", &specs(&[WEB_SEARCH])), WEB_SEARCH);
    }

    #[test]
    fn test_quote_requests_route_to_stock_quote() {
        let all = specs(&[WEB_SEARCH, NEWS_SEARCH, STOCK_QUOTE]);
        assert_eq!(tool_for_query("NVDA", &all), STOCK_QUOTE);
        assert_eq!(tool_for_query("$AAPL", &all), STOCK_QUOTE);
        assert_eq!(tool_for_query("What is the NVDA stock price?", &all), STOCK_QUOTE);
        assert_eq!(tool_for_query("NVDA gross margin 2024", &all), WEB_SEARCH);
        assert_eq!(tool_for_query("nvidia stock price", &all), WEB_SEARCH);
        assert_eq!(tool_for_query("NVDA", &specs(&[WEB_SEARCH, NEWS_SEARCH])), WEB_SEARCH);

        let call = tool_call_for_query("TSM:NYSE share price", &all);
        assert_eq!(call.name, STOCK_QUOTE);
        assert_eq!(call.arg("symbol"), Some("TSM:NYSE"));
        assert_eq!(call.arg("query"), Some("TSM:NYSE share price"));

        let search = tool_call_for_query("NVDA latest news", &all);
        assert_eq!(search.name, NEWS_SEARCH);
        assert_eq!(search.arg("symbol"), None);
    }

    #[test]
    fn test_tool_call_arg_trims_and_skips_blank() {
        let call = ToolCall {
            name: STOCK_QUOTE.to_string(),
            arguments: serde_json::json!({ "symbol": " AAPL ", "query": "  " }),
        };
        assert_eq!(call.arg("symbol"), Some("AAPL"));
        assert_eq!(call.arg("query"), None);
        assert_eq!(call.arg("missing"), None);
    }
}

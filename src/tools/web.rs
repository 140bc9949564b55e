//! Web search via the DuckDuckGo HTML endpoint.
//!
//! No API key is needed. Failures never abort the agent turn: they come
//! back as a JSON `{"status": "error"}` payload the model can read.

use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::Serialize;
use serde_json::{json, Value};

use super::Tool;

const SEARCH_URL: &str = "https://html.duckduckgo.com/html/";
const DEFAULT_RESULTS: usize = 5;
const MAX_RESULTS: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResult {
    pub title: String,
    pub url: String,
    pub snippet: String,
}

pub struct WebSearch {
    client: reqwest::Client,
    endpoint: String,
}

impl WebSearch {
    pub fn new() -> Self {
        Self::with_endpoint(SEARCH_URL)
    }

    pub fn with_endpoint(endpoint: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .user_agent("Mozilla/5.0 (compatible; research-crew)")
            .build()
            .unwrap_or_default();
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchResult>, reqwest::Error> {
        let url = format!("{}?q={}", self.endpoint, urlencoding::encode(query));
        let html = self
            .client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        let mut results = parse_results(&html);
        results.truncate(limit);
        Ok(results)
    }
}

impl Default for WebSearch {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for WebSearch {
    fn name(&self) -> &str {
        "web_search"
    }

    fn description(&self) -> &str {
        "Search the web for information using DuckDuckGo"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": { "type": "string", "description": "The search query" },
                "num_results": {
                    "type": "integer",
                    "description": "Number of results to return (1-10)",
                    "default": DEFAULT_RESULTS
                }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, args: Value) -> anyhow::Result<String> {
        let query = args["query"]
            .as_str()
            .map(str::trim)
            .filter(|q| !q.is_empty())
            .ok_or_else(|| anyhow::anyhow!("Missing 'query' argument"))?;
        let limit = args["num_results"]
            .as_u64()
            .map(|n| (n as usize).clamp(1, MAX_RESULTS))
            .unwrap_or(DEFAULT_RESULTS);

        tracing::info!(query = %query, limit, "Web search");
        let output = match self.search(query, limit).await {
            Ok(results) if results.is_empty() => json!({
                "status": "no_results",
                "message": format!("No results found for query: {query}"),
            }),
            Ok(results) => json!({
                "status": "success",
                "query": query,
                "results": results,
            }),
            Err(e) => {
                tracing::warn!(query = %query, error = %e, "Web search failed");
                json!({ "status": "error", "message": format!("Search failed: {e}") })
            }
        };
        Ok(output.to_string())
    }
}

fn title_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r#"(?s)<a[^>]*class="[^"]*result__a[^"]*"[^>]*href="([^"]*)"[^>]*>(.*?)</a>"#)
            .expect("valid title regex")
    })
}

fn snippet_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r#"(?s)<a[^>]*class="[^"]*result__snippet[^"]*"[^>]*>(.*?)</a>"#)
            .expect("valid snippet regex")
    })
}

fn tag_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"<[^>]+>").expect("valid tag regex"))
}

/// Extract results from a DuckDuckGo HTML page.
///
/// Each result block carries one title anchor; the snippet, when present,
/// follows it before the next title.
pub fn parse_results(html: &str) -> Vec<SearchResult> {
    let titles: Vec<_> = title_pattern().captures_iter(html).collect();
    let mut results = Vec::with_capacity(titles.len());

    for (i, caps) in titles.iter().enumerate() {
        let (Some(whole), Some(href), Some(title)) = (caps.get(0), caps.get(1), caps.get(2))
        else {
            continue;
        };
        let block_end = titles
            .get(i + 1)
            .and_then(|next| next.get(0))
            .map(|m| m.start())
            .unwrap_or(html.len());
        let snippet = snippet_pattern()
            .captures(&html[whole.end()..block_end])
            .and_then(|c| c.get(1))
            .map(|m| clean_text(m.as_str()))
            .unwrap_or_default();

        let title = clean_text(title.as_str());
        if title.is_empty() {
            continue;
        }
        results.push(SearchResult {
            title,
            url: resolve_href(href.as_str()),
            snippet,
        });
    }
    results
}

/// DuckDuckGo wraps targets in a redirect (`/l/?uddg=<encoded>`).
fn resolve_href(href: &str) -> String {
    let href = decode_entities(href);
    if let Some(start) = href.find("uddg=") {
        let encoded = &href[start + 5..];
        let encoded = encoded.split('&').next().unwrap_or(encoded);
        if let Ok(decoded) = urlencoding::decode(encoded) {
            return decoded.into_owned();
        }
    }
    if let Some(rest) = href.strip_prefix("//") {
        return format!("https://{rest}");
    }
    href
}

fn clean_text(fragment: &str) -> String {
    let stripped = tag_pattern().replace_all(fragment, "");
    decode_entities(&stripped)
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn decode_entities(text: &str) -> String {
    text.replace("&amp;", "&")
        .replace("&quot;", "\"")
        .replace("&#x27;", "'")
        .replace("&#39;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&nbsp;", " ")
}

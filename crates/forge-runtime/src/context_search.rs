//! Context search collaborator: gathers reference material for the
//! learn-a-skill workflow.
//!
//! The built-in implementation scrapes DuckDuckGo's HTML endpoint, which
//! needs no API key.

use async_trait::async_trait;
use forge_types::config::SearchSettings;
use std::time::Duration;
use tracing::{debug, warn};

/// Returns a text blob of reference material for `text`.
#[async_trait]
pub trait ContextSearch: Send + Sync {
    async fn query(&self, text: &str) -> Result<String, String>;
}

/// DuckDuckGo HTML search.
pub struct DuckDuckGoSearch {
    client: reqwest::Client,
    max_results: usize,
}

impl DuckDuckGoSearch {
    pub fn new(settings: &SearchSettings) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .unwrap_or_default();
        Self {
            client,
            max_results: settings.max_results,
        }
    }

    async fn search(&self, query: &str) -> Result<String, String> {
        debug!(query, "Searching via DuckDuckGo HTML");

        let resp = self
            .client
            .get("https://html.duckduckgo.com/html/")
            .query(&[("q", query)])
            .header("User-Agent", "Mozilla/5.0 (compatible; ForgeAgent/0.1)")
            .send()
            .await
            .map_err(|e| format!("DuckDuckGo request failed: {e}"))?;

        if !resp.status().is_success() {
            return Err(format!("DuckDuckGo returned {}", resp.status()));
        }

        let body = resp
            .text()
            .await
            .map_err(|e| format!("Failed to read DuckDuckGo response: {e}"))?;

        Ok(format_results(query, &parse_results(&body, self.max_results)))
    }
}

#[async_trait]
impl ContextSearch for DuckDuckGoSearch {
    /// Two phrasings of the task, concatenated. A failing phrasing is skipped.
    async fn query(&self, text: &str) -> Result<String, String> {
        let queries = [
            format!("{text} WebAssembly text format example"),
            format!("how to {text} in wasm"),
        ];
        let mut blobs = Vec::new();
        let mut last_err = None;
        for q in &queries {
            match self.search(q).await {
                Ok(blob) => blobs.push(blob),
                Err(e) => {
                    warn!(query = %q, "Context search failed: {e}");
                    last_err = Some(e);
                }
            }
        }
        if blobs.is_empty() {
            return Err(last_err.unwrap_or_else(|| "no search results".to_string()));
        }
        Ok(blobs.join("\n\n"))
    }
}

/// A single search hit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchHit {
    pub title: String,
    pub url: String,
    pub snippet: String,
}

/// Pull up to `max` hits out of a DuckDuckGo HTML results page.
pub fn parse_results(html: &str, max: usize) -> Vec<SearchHit> {
    let mut hits = Vec::new();
    for chunk in html.split("class=\"result__a\"").skip(1) {
        if hits.len() >= max {
            break;
        }
        let Some(href) = between(chunk, "href=\"", "\"") else {
            continue;
        };
        let url = match href.split("uddg=").nth(1) {
            Some(encoded) => percent_decode(encoded.split('&').next().unwrap_or(encoded)),
            None => href.to_string(),
        };
        let title = between(chunk, ">", "</a>").map(strip_tags).unwrap_or_default();
        let snippet = chunk
            .find("class=\"result__snippet\"")
            .and_then(|idx| between(&chunk[idx..], ">", "</"))
            .map(strip_tags)
            .unwrap_or_default();
        if !title.is_empty() && !url.is_empty() {
            hits.push(SearchHit {
                title,
                url,
                snippet,
            });
        }
    }
    hits
}

fn format_results(query: &str, hits: &[SearchHit]) -> String {
    if hits.is_empty() {
        return format!("No results found for '{query}'.");
    }
    let mut out = format!("Search results for '{query}':\n\n");
    for (i, hit) in hits.iter().enumerate() {
        out.push_str(&format!(
            "{}. {}\n   URL: {}\n   {}\n\n",
            i + 1,
            hit.title,
            hit.url,
            hit.snippet
        ));
    }
    out
}

fn between<'a>(text: &'a str, start: &str, end: &str) -> Option<&'a str> {
    let from = text.find(start)? + start.len();
    let len = text[from..].find(end)?;
    Some(&text[from..from + len])
}

fn strip_tags(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut in_tag = false;
    for c in s.chars() {
        match c {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => out.push(c),
            _ => {}
        }
    }
    out.replace("&amp;", "&")
        .replace("&quot;", "\"")
        .replace("&#x27;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .trim()
        .to_string()
}

fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                let hi = (bytes[i + 1] as char).to_digit(16);
                let lo = (bytes[i + 2] as char).to_digit(16);
                if let (Some(hi), Some(lo)) = (hi, lo) {
                    out.push((hi * 16 + lo) as u8);
                    i += 3;
                    continue;
                }
                out.push(b'%');
            }
            b'+' => out.push(b' '),
            b => out.push(b),
        }
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

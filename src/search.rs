//! Web search providers
//!
//! A `SearchProvider` returns ranked hits for a query. Two production
//! implementations are provided: Tavily (JSON API, needs an API key) and
//! DuckDuckGo (HTML endpoint, no key). The planner only ever sees
//! `SearchHit` values, so providers are interchangeable.

use crate::config::{SearchConfig, SearchProviderKind};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One search result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub title: String,
    pub snippet: String,
    pub url: String,
}

/// Errors from a search provider.
#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    #[error("search API error ({status}): {message}")]
    Api { status: u16, message: String },
    #[error("search transport error: {0}")]
    Transport(String),
    #[error("search response parse error: {0}")]
    Parse(String),
}

#[async_trait]
pub trait SearchProvider: Send + Sync {
    async fn search(&self, query: &str, k: usize) -> Result<Vec<SearchHit>, SearchError>;
    fn name(&self) -> &str;
}

/// Build the configured provider.
pub fn provider_from_config(config: &SearchConfig) -> Box<dyn SearchProvider> {
    match config.provider {
        SearchProviderKind::Tavily => Box::new(TavilyClient::new(
            config.api_key.clone().unwrap_or_default(),
        )),
        SearchProviderKind::DuckDuckGo => Box::new(DuckDuckGoClient::new()),
    }
}

/// Tavily search API client.
pub struct TavilyClient {
    client: reqwest::Client,
    api_key: String,
}

impl TavilyClient {
    pub fn new(api_key: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("reqwest client");
        Self { client, api_key }
    }
}

#[async_trait]
impl SearchProvider for TavilyClient {
    async fn search(&self, query: &str, k: usize) -> Result<Vec<SearchHit>, SearchError> {
        let body = serde_json::json!({
            "api_key": self.api_key,
            "query": query,
            "max_results": k,
        });

        let response = self
            .client
            .post("https://api.tavily.com/search")
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| SearchError::Transport(format!("request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(SearchError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let resp_json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| SearchError::Parse(format!("JSON parse error: {}", e)))?;

        let hits = resp_json
            .get("results")
            .and_then(|r| r.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|r| {
                        let url = r.get("url")?.as_str()?.to_string();
                        let title = r
                            .get("title")
                            .and_then(|t| t.as_str())
                            .unwrap_or("")
                            .to_string();
                        let snippet = r
                            .get("content")
                            .and_then(|c| c.as_str())
                            .unwrap_or("")
                            .to_string();
                        Some(SearchHit {
                            title,
                            snippet,
                            url,
                        })
                    })
                    .take(k)
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        tracing::debug!("tavily search '{}' returned {} hits", query, hits.len());
        Ok(hits)
    }

    fn name(&self) -> &str {
        "tavily"
    }
}

/// DuckDuckGo HTML endpoint client.
pub struct DuckDuckGoClient {
    client: reqwest::Client,
}

impl Default for DuckDuckGoClient {
    fn default() -> Self {
        Self::new()
    }
}

impl DuckDuckGoClient {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent("Mozilla/5.0 (compatible; weft/0.1)")
            .build()
            .expect("reqwest client");
        Self { client }
    }

    /// Parse the HTML result page. Kept synchronous and separate from the
    /// fetch so the non-Send parser state never crosses an await point.
    fn parse_results(html: &str, k: usize) -> Vec<SearchHit> {
        let document = scraper::Html::parse_document(html);
        let result_sel = scraper::Selector::parse("div.result").unwrap();
        let title_sel = scraper::Selector::parse("a.result__a").unwrap();
        let snippet_sel = scraper::Selector::parse("a.result__snippet").unwrap();

        let mut hits = Vec::new();
        for result in document.select(&result_sel).take(k * 2) {
            let Some(anchor) = result.select(&title_sel).next() else {
                continue;
            };
            let Some(href) = anchor.value().attr("href") else {
                continue;
            };
            let url = decode_ddg_redirect(href);
            if url.is_empty() {
                continue;
            }
            let title = anchor.text().collect::<String>().trim().to_string();
            let snippet = result
                .select(&snippet_sel)
                .next()
                .map(|s| s.text().collect::<String>().trim().to_string())
                .unwrap_or_default();
            hits.push(SearchHit {
                title,
                snippet,
                url,
            });
            if hits.len() >= k {
                break;
            }
        }
        hits
    }
}

/// DuckDuckGo wraps result links in a redirect (`/l/?uddg=<encoded>`).
fn decode_ddg_redirect(href: &str) -> String {
    if let Some(idx) = href.find("uddg=") {
        let encoded = &href[idx + 5..];
        let encoded = encoded.split('&').next().unwrap_or(encoded);
        return percent_decode(encoded);
    }
    if href.starts_with("http") {
        return href.to_string();
    }
    String::new()
}

fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 3 <= bytes.len() {
            if let Some(v) = input
                .get(i + 1..i + 3)
                .and_then(|h| u8::from_str_radix(h, 16).ok())
            {
                out.push(v);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[async_trait]
impl SearchProvider for DuckDuckGoClient {
    async fn search(&self, query: &str, k: usize) -> Result<Vec<SearchHit>, SearchError> {
        let response = self
            .client
            .get("https://html.duckduckgo.com/html/")
            .query(&[("q", query)])
            .send()
            .await
            .map_err(|e| SearchError::Transport(format!("request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(SearchError::Api {
                status: status.as_u16(),
                message: "DuckDuckGo HTML endpoint error".to_string(),
            });
        }

        let html = response
            .text()
            .await
            .map_err(|e| SearchError::Transport(format!("body read failed: {}", e)))?;

        let hits = Self::parse_results(&html, k);
        tracing::debug!("duckduckgo search '{}' returned {} hits", query, hits.len());
        Ok(hits)
    }

    fn name(&self) -> &str {
        "duckduckgo"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ddg_results() {
        let html = r#"
            <html><body>
            <div class="result">
              <a class="result__a" href="//duckduckgo.com/l/?uddg=https%3A%2F%2Fexample.org%2Fpage&amp;rut=abc">Example Page</a>
              <a class="result__snippet">A snippet about the page.</a>
            </div>
            <div class="result">
              <a class="result__a" href="https://plain.example.com/x">Plain Link</a>
            </div>
            </body></html>
        "#;
        let hits = DuckDuckGoClient::parse_results(html, 10);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].url, "https://example.org/page");
        assert_eq!(hits[0].title, "Example Page");
        assert_eq!(hits[0].snippet, "A snippet about the page.");
        assert_eq!(hits[1].url, "https://plain.example.com/x");
    }

    #[test]
    fn test_parse_ddg_respects_limit() {
        let mut html = String::from("<html><body>");
        for i in 0..10 {
            html.push_str(&format!(
                r#"<div class="result"><a class="result__a" href="https://e.com/{}">t</a></div>"#,
                i
            ));
        }
        html.push_str("</body></html>");
        let hits = DuckDuckGoClient::parse_results(&html, 3);
        assert_eq!(hits.len(), 3);
    }

    #[test]
    fn test_decode_redirect() {
        assert_eq!(
            decode_ddg_redirect("/l/?uddg=https%3A%2F%2Fa.b%2Fc&rut=x"),
            "https://a.b/c"
        );
        assert_eq!(decode_ddg_redirect("https://a.b/c"), "https://a.b/c");
        assert_eq!(decode_ddg_redirect("javascript:void(0)"), "");
    }

    #[test]
    fn test_tavily_parse_shape() {
        let resp = serde_json::json!({
            "results": [
                { "title": "T1", "url": "https://a.b/1", "content": "s1" },
                { "url": "https://a.b/2" }
            ]
        });
        let hits: Vec<SearchHit> = resp["results"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|r| {
                Some(SearchHit {
                    title: r.get("title").and_then(|t| t.as_str()).unwrap_or("").into(),
                    snippet: r.get("content").and_then(|c| c.as_str()).unwrap_or("").into(),
                    url: r.get("url")?.as_str()?.into(),
                })
            })
            .collect();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[1].title, "");
    }
}

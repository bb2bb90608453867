//! Page fetching and readable-text extraction
//!
//! The `HttpFetcher` downloads a page, rejects non-text content, and
//! extracts a readable body: title from `<title>`, text from headings,
//! paragraphs and list items, with script/style/nav boilerplate left
//! behind and whitespace collapsed.

use async_trait::async_trait;
use std::time::Duration;

/// A fetched, extracted page.
#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub url: String,
    pub title: String,
    pub text: String,
    pub mime: String,
}

/// Errors from the fetch pipeline.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("fetch transport error: {0}")]
    Transport(String),
    #[error("fetch returned HTTP {0}")]
    HttpStatus(u16),
    #[error("unsupported content type: {0}")]
    UnsupportedMime(String),
    #[error("extracted body too short: {len} chars (minimum {min})")]
    TooShort { len: usize, min: usize },
}

#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<FetchedPage, FetchError>;
}

/// Production fetcher over reqwest.
pub struct HttpFetcher {
    client: reqwest::Client,
    min_chars: usize,
}

impl HttpFetcher {
    pub fn new(min_chars: usize) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent("Mozilla/5.0 (compatible; weft/0.1)")
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .expect("reqwest client");
        Self { client, min_chars }
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedPage, FetchError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| FetchError::Transport(format!("request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus(status.as_u16()));
        }

        let mime = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .split(';')
            .next()
            .unwrap_or("")
            .trim()
            .to_string();

        if !is_text_mime(&mime) {
            return Err(FetchError::UnsupportedMime(mime));
        }

        let final_url = response.url().to_string();
        let body = response
            .text()
            .await
            .map_err(|e| FetchError::Transport(format!("body read failed: {}", e)))?;

        let (title, text) = if mime == "text/html" {
            extract_readable(&body)
        } else {
            (String::new(), collapse_whitespace(&body))
        };

        if text.len() < self.min_chars {
            return Err(FetchError::TooShort {
                len: text.len(),
                min: self.min_chars,
            });
        }

        tracing::debug!("fetched {} ({} chars, {})", final_url, text.len(), mime);
        Ok(FetchedPage {
            url: final_url,
            title,
            text,
            mime,
        })
    }
}

fn is_text_mime(mime: &str) -> bool {
    mime.starts_with("text/") || mime == "application/xhtml+xml" || mime == "application/json"
}

/// Extract `(title, readable body)` from an HTML document.
///
/// Synchronous on purpose: the parser state is not `Send` and must never
/// cross an await point.
pub fn extract_readable(html: &str) -> (String, String) {
    let document = scraper::Html::parse_document(html);

    let title = scraper::Selector::parse("title")
        .ok()
        .and_then(|sel| {
            document
                .select(&sel)
                .next()
                .map(|t| collapse_whitespace(&t.text().collect::<String>()))
        })
        .unwrap_or_default();

    let content_sel =
        scraper::Selector::parse("article p, article li, main p, main li, h1, h2, h3, h4, h5, h6, p, li, pre, blockquote")
            .unwrap();

    let mut seen = std::collections::HashSet::new();
    let mut parts: Vec<String> = Vec::new();
    for element in document.select(&content_sel) {
        // The selector union can match the same node through several
        // alternatives; dedupe on node identity.
        if !seen.insert(element.id()) {
            continue;
        }
        let chunk = collapse_whitespace(&element.text().collect::<String>());
        if chunk.len() < 3 {
            continue;
        }
        parts.push(chunk);
    }
    // Nested matches (a <p> inside <article>) produce repeated text; drop
    // exact duplicates while preserving order.
    let mut unique = std::collections::HashSet::new();
    parts.retain(|p| unique.insert(p.clone()));

    (title, parts.join("\n"))
}

/// Collapse runs of whitespace into single spaces and trim.
pub fn collapse_whitespace(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_readable_basic() {
        let html = r#"
            <html>
              <head><title>  The   Title </title><style>p { color: red }</style></head>
              <body>
                <script>var x = 1;</script>
                <h1>Heading</h1>
                <p>First paragraph with content.</p>
                <ul><li>Item one</li><li>Item two</li></ul>
              </body>
            </html>
        "#;
        let (title, text) = extract_readable(html);
        assert_eq!(title, "The Title");
        assert!(text.contains("Heading"));
        assert!(text.contains("First paragraph with content."));
        assert!(text.contains("Item one"));
        assert!(!text.contains("var x"));
        assert!(!text.contains("color: red"));
    }

    #[test]
    fn test_extract_readable_dedupes_nested() {
        let html = r#"
            <html><body>
              <article><p>Only once please.</p></article>
            </body></html>
        "#;
        let (_, text) = extract_readable(html);
        assert_eq!(text.matches("Only once please.").count(), 1);
    }

    #[test]
    fn test_collapse_whitespace() {
        assert_eq!(collapse_whitespace("  a \n\t b   c "), "a b c");
        assert_eq!(collapse_whitespace(""), "");
    }

    #[test]
    fn test_mime_gate() {
        assert!(is_text_mime("text/html"));
        assert!(is_text_mime("text/plain"));
        assert!(!is_text_mime("application/pdf"));
        assert!(!is_text_mime("image/png"));
    }
}

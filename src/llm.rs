//! LLM client for single-turn chat completions
//!
//! Agent loops rebuild their full prompt every step, so the client exposes a
//! single-turn `ChatProvider` trait. The production `LlmClient` speaks the
//! OpenAI-compatible chat-completions wire format against a configurable
//! base URL, with the Anthropic Messages format selected when the base URL
//! points at an Anthropic endpoint. Transient failures are retried with
//! exponential backoff; token usage is logged on every call.

use crate::config::LlmConfig;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A single-turn chat request.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub system: String,
    pub user: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl ChatRequest {
    pub fn new(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            user: user.into(),
            max_tokens: 4096,
            temperature: 0.3,
        }
    }
}

/// Token accounting reported by the endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    pub fn add(&mut self, other: &TokenUsage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}

/// A completed chat turn.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub content: String,
    pub usage: TokenUsage,
    pub model: String,
}

/// Errors from the chat endpoint.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("response parse error: {0}")]
    Parse(String),
    #[error("retries exhausted after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: String },
}

impl LlmError {
    /// Whether a retry could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            LlmError::Timeout(_) | LlmError::RateLimited { .. } | LlmError::Transport(_) => true,
            LlmError::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// Single-turn chat completion. Streaming is an implementation detail of a
/// provider and is never observable by callers.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse, LlmError>;
    fn model(&self) -> &str;
}

/// Wire formats the client can speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WireFormat {
    OpenAi,
    Anthropic,
}

/// Production chat client.
pub struct LlmClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    wire: WireFormat,
    max_retries: u32,
    request_timeout: Duration,
}

impl LlmClient {
    pub fn new(config: &LlmConfig) -> Result<Self, LlmError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| LlmError::Transport(format!("HTTP client error: {}", e)))?;

        let wire = if config.base_url.contains("anthropic") {
            WireFormat::Anthropic
        } else {
            WireFormat::OpenAi
        };

        tracing::info!(
            "LLM client initialized: model={} base_url={}",
            config.model,
            config.base_url
        );

        Ok(Self {
            client,
            api_key: config.api_key.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            wire,
            max_retries: config.max_retries,
            request_timeout: config.request_timeout,
        })
    }

    fn build_openai_body(&self, request: &ChatRequest) -> serde_json::Value {
        serde_json::json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": request.system },
                { "role": "user", "content": request.user }
            ],
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
        })
    }

    fn build_anthropic_body(&self, request: &ChatRequest) -> serde_json::Value {
        serde_json::json!({
            "model": self.model,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
            "system": request.system,
            "messages": [
                { "role": "user", "content": request.user }
            ]
        })
    }

    fn parse_openai_response(&self, resp: &serde_json::Value) -> Result<ChatResponse, LlmError> {
        let content = resp
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .ok_or_else(|| LlmError::Parse("no content in response choices".into()))?
            .to_string();

        let usage = resp
            .get("usage")
            .map(|u| TokenUsage {
                prompt_tokens: u.get("prompt_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
                completion_tokens: u
                    .get("completion_tokens")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0),
                total_tokens: u.get("total_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
            })
            .unwrap_or_default();

        let model = resp
            .get("model")
            .and_then(|m| m.as_str())
            .unwrap_or(&self.model)
            .to_string();

        Ok(ChatResponse {
            content,
            usage,
            model,
        })
    }

    fn parse_anthropic_response(&self, resp: &serde_json::Value) -> Result<ChatResponse, LlmError> {
        let content = resp
            .get("content")
            .and_then(|c| c.as_array())
            .and_then(|blocks| {
                blocks
                    .iter()
                    .find(|b| b.get("type").and_then(|t| t.as_str()) == Some("text"))
            })
            .and_then(|b| b.get("text"))
            .and_then(|t| t.as_str())
            .ok_or_else(|| LlmError::Parse("no text content in response".into()))?
            .to_string();

        let usage = resp
            .get("usage")
            .map(|u| {
                let input = u.get("input_tokens").and_then(|v| v.as_u64()).unwrap_or(0);
                let output = u.get("output_tokens").and_then(|v| v.as_u64()).unwrap_or(0);
                TokenUsage {
                    prompt_tokens: input,
                    completion_tokens: output,
                    total_tokens: input + output,
                }
            })
            .unwrap_or_default();

        let model = resp
            .get("model")
            .and_then(|m| m.as_str())
            .unwrap_or(&self.model)
            .to_string();

        Ok(ChatResponse {
            content,
            usage,
            model,
        })
    }

    async fn complete_once(&self, request: &ChatRequest) -> Result<ChatResponse, LlmError> {
        let (url, body) = match self.wire {
            WireFormat::OpenAi => (
                format!("{}/chat/completions", self.base_url),
                self.build_openai_body(request),
            ),
            WireFormat::Anthropic => (
                format!("{}/messages", self.base_url),
                self.build_anthropic_body(request),
            ),
        };

        let request_builder = match self.wire {
            WireFormat::OpenAi => self
                .client
                .post(&url)
                .header("Authorization", format!("Bearer {}", self.api_key)),
            WireFormat::Anthropic => self
                .client
                .post(&url)
                .header("x-api-key", &self.api_key)
                .header("anthropic-version", "2023-06-01"),
        };

        let start = std::time::Instant::now();
        let response = request_builder
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::Timeout(self.request_timeout)
                } else {
                    LlmError::Transport(format!("request failed: {}", e))
                }
            })?;

        let status = response.status();
        if status.as_u16() == 429 {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(1);
            return Err(LlmError::RateLimited {
                retry_after_ms: retry_after * 1000,
            });
        }
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(LlmError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let resp_json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| LlmError::Parse(format!("JSON parse error: {}", e)))?;

        let parsed = match self.wire {
            WireFormat::OpenAi => self.parse_openai_response(&resp_json)?,
            WireFormat::Anthropic => self.parse_anthropic_response(&resp_json)?,
        };

        tracing::info!(
            "LLM usage: model={} prompt_tokens={} completion_tokens={} total_tokens={} latency={:?}",
            parsed.model,
            parsed.usage.prompt_tokens,
            parsed.usage.completion_tokens,
            parsed.usage.total_tokens,
            start.elapsed(),
        );

        Ok(parsed)
    }
}

#[async_trait]
impl ChatProvider for LlmClient {
    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse, LlmError> {
        let mut last_error: Option<LlmError> = None;
        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = match &last_error {
                    Some(LlmError::RateLimited { retry_after_ms }) => {
                        Duration::from_millis(*retry_after_ms)
                    }
                    _ => Duration::from_millis(500u64 << (attempt - 1)),
                };
                tracing::debug!("LLM retry {}/{} after {:?}", attempt, self.max_retries, delay);
                tokio::time::sleep(delay).await;
            }
            match self.complete_once(request).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_transient() => {
                    tracing::warn!("transient LLM failure (attempt {}): {}", attempt + 1, e);
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(LlmError::Exhausted {
            attempts: self.max_retries + 1,
            last: last_error.map(|e| e.to_string()).unwrap_or_default(),
        })
    }

    fn model(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_client(base_url: &str) -> LlmClient {
        let config = LlmConfig {
            api_key: "test".into(),
            base_url: base_url.into(),
            ..LlmConfig::default()
        };
        LlmClient::new(&config).unwrap()
    }

    #[test]
    fn test_wire_detection() {
        assert_eq!(
            test_client("https://api.anthropic.com/v1").wire,
            WireFormat::Anthropic
        );
        assert_eq!(
            test_client("https://api.openai.com/v1").wire,
            WireFormat::OpenAi
        );
        assert_eq!(
            test_client("https://openrouter.ai/api/v1").wire,
            WireFormat::OpenAi
        );
    }

    #[test]
    fn test_parse_openai_response() {
        let client = test_client("https://api.openai.com/v1");
        let resp = serde_json::json!({
            "choices": [{ "message": { "role": "assistant", "content": "Hello!" } }],
            "usage": { "prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15 },
            "model": "gpt-4o"
        });
        let parsed = client.parse_openai_response(&resp).unwrap();
        assert_eq!(parsed.content, "Hello!");
        assert_eq!(parsed.usage.total_tokens, 15);
        assert_eq!(parsed.model, "gpt-4o");
    }

    #[test]
    fn test_parse_openai_missing_content_is_error() {
        let client = test_client("https://api.openai.com/v1");
        let resp = serde_json::json!({ "choices": [] });
        assert!(matches!(
            client.parse_openai_response(&resp),
            Err(LlmError::Parse(_))
        ));
    }

    #[test]
    fn test_parse_anthropic_response() {
        let client = test_client("https://api.anthropic.com/v1");
        let resp = serde_json::json!({
            "content": [ { "type": "text", "text": "Report body." } ],
            "usage": { "input_tokens": 20, "output_tokens": 8 },
            "model": "claude-sonnet-4-5"
        });
        let parsed = client.parse_anthropic_response(&resp).unwrap();
        assert_eq!(parsed.content, "Report body.");
        assert_eq!(parsed.usage.total_tokens, 28);
    }

    #[test]
    fn test_transient_classification() {
        assert!(LlmError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(LlmError::RateLimited { retry_after_ms: 100 }.is_transient());
        assert!(LlmError::Api {
            status: 503,
            message: "overloaded".into()
        }
        .is_transient());
        assert!(!LlmError::Api {
            status: 401,
            message: "bad key".into()
        }
        .is_transient());
        assert!(!LlmError::Parse("bad json".into()).is_transient());
    }

    #[test]
    fn test_usage_accumulation() {
        let mut total = TokenUsage::default();
        total.add(&TokenUsage {
            prompt_tokens: 100,
            completion_tokens: 50,
            total_tokens: 150,
        });
        total.add(&TokenUsage {
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 15,
        });
        assert_eq!(total.total_tokens, 165);
    }
}

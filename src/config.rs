//! Configuration for the research engine
//!
//! Provides centralized configuration handling with validation, environment
//! variable abstraction, and conservative defaults. The configuration is a
//! single immutable struct constructed once at startup and passed through
//! the orchestrator; there are no process-global settings.

use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}")]
    MissingRequired { key: String },

    #[error("Invalid configuration value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },
}

/// Supported web search providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchProviderKind {
    Tavily,
    DuckDuckGo,
}

/// LLM endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// API key for the chat endpoint.
    #[serde(skip_serializing)]
    pub api_key: String,
    /// Base URL of the chat endpoint.
    pub base_url: String,
    /// Model identifier sent with every request.
    pub model: String,
    /// Completion token cap per request.
    pub max_tokens: u32,
    /// Sampling temperature.
    pub temperature: f32,
    /// Per-request timeout.
    pub request_timeout: Duration,
    /// Retry budget for transient failures.
    pub max_retries: u32,
}

/// Search provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    pub provider: SearchProviderKind,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
}

/// Planner loop limits and acquisition-pipeline knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannerConfig {
    /// Hard step ceiling for the planner loop.
    pub max_steps: u32,
    /// Results requested per search query.
    pub max_results: usize,
    /// URLs kept per query after the relevance filter.
    pub max_urls_per_query: usize,
    /// Minimum extracted body length for a page to become evidence.
    pub min_page_chars: usize,
    /// Bounded worker pool width for fetching and per-page summarization.
    pub fetch_concurrency: usize,
    /// Consecutive no-progress steps before forced termination.
    pub stagnation_limit: u32,
    /// Evidence count below which the planner is nudged to keep searching.
    pub min_evidence: usize,
    /// Evidence budget; reaching it forces termination.
    pub max_evidence: usize,
    /// Page fetch budget; reaching it forces termination.
    pub max_fetches: usize,
}

/// Writer loop limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriterConfig {
    /// Outline heading level the writer targets, 1-6.
    pub write_level: u8,
    /// Step ceiling per section.
    pub max_steps_per_section: u32,
    /// Character cap per section body.
    pub max_chars_per_section: usize,
    /// Whether evidence consumed by an earlier section may be served again
    /// without an explicit by-id re-request.
    pub allow_evidence_reuse: bool,
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub llm: LlmConfig,
    pub search: SearchConfig,
    /// Root directory under which run directories are allocated.
    pub artifacts_dir: PathBuf,
    pub planner: PlannerConfig,
    pub writer: WriterConfig,
    /// Per-step retry budget for unparseable agent output.
    pub protocol_retries: u32,
    /// Global wall-clock budget for one run.
    pub run_timeout: Duration,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o".to_string(),
            max_tokens: 4096,
            temperature: 0.3,
            request_timeout: Duration::from_secs(120),
            max_retries: 3,
        }
    }
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            max_steps: 12,
            max_results: 8,
            max_urls_per_query: 4,
            min_page_chars: 400,
            fetch_concurrency: 4,
            stagnation_limit: 3,
            min_evidence: 5,
            max_evidence: 60,
            max_fetches: 120,
        }
    }
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            write_level: 2,
            max_steps_per_section: 8,
            max_chars_per_section: 12_000,
            allow_evidence_reuse: false,
        }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            provider: SearchProviderKind::DuckDuckGo,
            api_key: None,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            llm: LlmConfig::default(),
            search: SearchConfig::default(),
            artifacts_dir: PathBuf::from("./artifacts"),
            planner: PlannerConfig::default(),
            writer: WriterConfig::default(),
            protocol_retries: 2,
            run_timeout: Duration::from_secs(3600),
        }
    }
}

impl EngineConfig {
    /// Build configuration from environment variables, falling back to
    /// defaults for everything optional. Secrets only ever come from the
    /// environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        config.llm.api_key = env::var("LLM_API_KEY").map_err(|_| ConfigError::MissingRequired {
            key: "LLM_API_KEY".to_string(),
        })?;
        if let Ok(base_url) = env::var("LLM_BASE_URL") {
            config.llm.base_url = base_url;
        }
        if let Ok(model) = env::var("LLM_MODEL") {
            config.llm.model = model;
        }

        if let Ok(provider) = env::var("SEARCH_PROVIDER") {
            config.search.provider = match provider.as_str() {
                "tavily" => SearchProviderKind::Tavily,
                "duckduckgo" => SearchProviderKind::DuckDuckGo,
                other => {
                    return Err(ConfigError::InvalidValue {
                        key: "SEARCH_PROVIDER".to_string(),
                        reason: format!("unknown provider '{}', expected tavily or duckduckgo", other),
                    })
                }
            };
        }
        config.search.api_key = env::var("SEARCH_API_KEY").ok();

        if let Ok(dir) = env::var("ARTIFACTS_DIR") {
            config.artifacts_dir = PathBuf::from(dir);
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.llm.api_key.is_empty() {
            return Err(ConfigError::MissingRequired {
                key: "LLM_API_KEY".to_string(),
            });
        }
        if self.search.provider == SearchProviderKind::Tavily && self.search.api_key.is_none() {
            return Err(ConfigError::MissingRequired {
                key: "SEARCH_API_KEY".to_string(),
            });
        }
        if !(1..=6).contains(&self.writer.write_level) {
            return Err(ConfigError::InvalidValue {
                key: "write_level".to_string(),
                reason: format!("{} is outside 1-6", self.writer.write_level),
            });
        }
        if self.planner.fetch_concurrency == 0 {
            return Err(ConfigError::InvalidValue {
                key: "fetch_concurrency".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.planner.max_steps == 0 {
            return Err(ConfigError::InvalidValue {
                key: "max_planner_steps".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let mut config = EngineConfig::default();
        config.llm.api_key = "test-key".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_api_key_rejected() {
        let config = EngineConfig::default();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingRequired { .. })
        ));
    }

    #[test]
    fn test_tavily_requires_search_key() {
        let mut config = EngineConfig::default();
        config.llm.api_key = "test-key".to_string();
        config.search.provider = SearchProviderKind::Tavily;
        config.search.api_key = None;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("SEARCH_API_KEY"));
    }

    #[test]
    fn test_write_level_bounds() {
        let mut config = EngineConfig::default();
        config.llm.api_key = "test-key".to_string();
        config.writer.write_level = 7;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { .. })
        ));
    }
}

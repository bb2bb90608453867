//! Planner agent: evidence acquisition and outline refinement
//!
//! A ReAct loop over `search` / `write_outline` / `terminate` actions. Each
//! step rebuilds the prompt from the user query, a one-line status, the
//! current outline, and bank summaries; raw pages never reach the prompt.
//! Termination is enforced by the loop even when the model never asks for
//! it: a hard step ceiling, evidence and fetch budgets, and a stagnation
//! window of consecutive no-progress steps.
//!
//! Inside a `search` action, URL fetching and per-page summarization run on
//! a bounded worker pool; any single search, fetch or LLM sub-call failure
//! is journalled and skipped. A planner step never aborts the run.

use crate::config::PlannerConfig;
use crate::evidence::{EvidenceBank, EvidenceDraft, EvidenceItem, EvidenceItemType, SourceMeta};
use crate::fetch::PageFetcher;
use crate::journal::{EventJournal, EventKind, JournalError};
use crate::llm::{ChatProvider, ChatRequest, TokenUsage};
use crate::outline::Outline;
use crate::prompts;
use crate::protocol::{self, PlannerAction, ProtocolError};
use crate::search::{SearchHit, SearchProvider};
use futures::stream::{self, StreamExt};

/// Consecutive whole-step LLM failures tolerated before the run is declared
/// dead in the water.
const MAX_CONSECUTIVE_LLM_FAILURES: u32 = 3;

/// State carried into the loop when resuming an interrupted run.
#[derive(Debug, Default)]
pub struct PlannerResume {
    pub outline: Option<Outline>,
    pub past_queries: Vec<String>,
    pub start_round: u32,
}

/// How the planner loop ended.
#[derive(Debug)]
pub struct PlannerOutcome {
    pub outline: Option<Outline>,
    pub reason: String,
    pub rounds: u32,
}

/// Fatal planner failures. Everything else is journalled and skipped.
#[derive(Debug, thiserror::Error)]
pub enum PlannerError {
    #[error("agent protocol retries exhausted at round {round}")]
    ProtocolExhausted { round: u32 },
    #[error("LLM endpoint unavailable: {0}")]
    LlmUnavailable(String),
    #[error(transparent)]
    Journal(#[from] JournalError),
}

/// The planner agent. Borrows its collaborators from the orchestrator.
pub struct Planner<'a> {
    pub llm: &'a dyn ChatProvider,
    pub search: &'a dyn SearchProvider,
    pub fetcher: &'a dyn PageFetcher,
    pub bank: &'a EvidenceBank,
    pub journal: &'a EventJournal,
    pub config: &'a PlannerConfig,
    pub protocol_retries: u32,
}

/// A planner action that survived parsing and validation.
enum ResolvedAction {
    Search { queries: Vec<String>, goal: String },
    CommitOutline(Outline),
    Terminate { reason: String },
}

impl ResolvedAction {
    fn label(&self) -> &'static str {
        match self {
            ResolvedAction::Search { .. } => "search",
            ResolvedAction::CommitOutline(_) => "write_outline",
            ResolvedAction::Terminate { .. } => "terminate",
        }
    }
}

impl<'a> Planner<'a> {
    pub async fn run(
        &self,
        user_query: &str,
        resume: PlannerResume,
    ) -> Result<PlannerOutcome, PlannerError> {
        let mut outline = resume.outline;
        let mut past_queries = resume.past_queries;
        let mut round = resume.start_round;
        let mut stagnant_steps = 0u32;
        let mut total_fetches = 0usize;
        let mut consecutive_llm_failures = 0u32;
        let mut carry_observation: Option<String> = None;

        loop {
            let evidence_count = self.bank.len().await;

            if round >= self.config.max_steps {
                return self.forced_exit(outline, round, "step_limit").await;
            }
            if evidence_count >= self.config.max_evidence || total_fetches >= self.config.max_fetches
            {
                return self.forced_exit(outline, round, "budget").await;
            }
            if stagnant_steps >= self.config.stagnation_limit {
                return self.forced_exit(outline, round, "stagnation").await;
            }

            round += 1;
            let nudge_ready = outline
                .as_ref()
                .map(|o| o.leaves_all_cited() && evidence_count >= self.config.min_evidence)
                .unwrap_or(false);

            let (resolved, usage) = match self
                .next_action(
                    user_query,
                    round,
                    evidence_count,
                    outline.as_ref(),
                    &past_queries,
                    nudge_ready,
                    carry_observation.take(),
                )
                .await?
            {
                StepResult::Action(action, usage) => {
                    consecutive_llm_failures = 0;
                    (action, usage)
                }
                StepResult::LlmFailed(detail) => {
                    consecutive_llm_failures += 1;
                    if consecutive_llm_failures >= MAX_CONSECUTIVE_LLM_FAILURES {
                        return Err(PlannerError::LlmUnavailable(detail));
                    }
                    stagnant_steps += 1;
                    continue;
                }
            };

            self.journal.append(
                EventKind::PlannerStep,
                serde_json::json!({
                    "round": round,
                    "action": resolved.label(),
                    "usage": usage,
                    "evidence_count": evidence_count,
                }),
            )?;

            match resolved {
                ResolvedAction::Search { queries, goal } => {
                    let before = self.bank.len().await;
                    let fetches = self
                        .handle_search(user_query, queries, &goal, &mut past_queries)
                        .await?;
                    total_fetches += fetches;
                    let progressed = self.bank.len().await > before;
                    stagnant_steps = if progressed { 0 } else { stagnant_steps + 1 };
                }
                ResolvedAction::CommitOutline(parsed) => {
                    let markdown = parsed.to_markdown();
                    let changed = outline.as_ref() != Some(&parsed);
                    self.journal
                        .append(EventKind::OutlineUpdated, serde_json::json!({ "markdown": markdown }))?;
                    outline = Some(parsed);
                    stagnant_steps = if changed { 0 } else { stagnant_steps + 1 };
                }
                ResolvedAction::Terminate { reason } => {
                    self.journal
                        .append(EventKind::PlannerTerminated, serde_json::json!({ "reason": &reason }))?;
                    tracing::info!("planner terminated after {} rounds: {}", round, reason);
                    return Ok(PlannerOutcome {
                        outline,
                        reason,
                        rounds: round,
                    });
                }
            }
        }
    }

    async fn forced_exit(
        &self,
        outline: Option<Outline>,
        rounds: u32,
        reason: &str,
    ) -> Result<PlannerOutcome, PlannerError> {
        self.journal
            .append(EventKind::PlannerTerminated, serde_json::json!({ "reason": reason }))?;
        tracing::info!("planner force-terminated after {} rounds: {}", rounds, reason);
        Ok(PlannerOutcome {
            outline,
            reason: reason.to_string(),
            rounds,
        })
    }

    /// One reasoning turn with the per-step protocol retry budget. Outline
    /// validation happens here so an unresolved citation is corrected
    /// within the same step, like any other protocol error.
    #[allow(clippy::too_many_arguments)]
    async fn next_action(
        &self,
        user_query: &str,
        round: u32,
        evidence_count: usize,
        outline: Option<&Outline>,
        past_queries: &[String],
        nudge_ready: bool,
        carried: Option<String>,
    ) -> Result<StepResult, PlannerError> {
        let summaries = self.bank.summaries(None).await;
        let outline_md = outline.map(|o| o.to_markdown());
        let mut observation = carried;

        for _attempt in 0..=self.protocol_retries {
            let request = ChatRequest::new(
                prompts::planner_system(),
                prompts::planner_user(
                    user_query,
                    round,
                    evidence_count,
                    outline_md.as_deref(),
                    &summaries,
                    past_queries,
                    nudge_ready,
                    observation.as_deref(),
                ),
            );

            let response = match self.llm.complete(&request).await {
                Ok(response) => response,
                Err(e) => {
                    tracing::warn!("planner LLM call failed: {}", e);
                    self.journal.append(
                        EventKind::Error,
                        serde_json::json!({ "scope": "planner_llm", "detail": e.to_string() }),
                    )?;
                    return Ok(StepResult::LlmFailed(e.to_string()));
                }
            };

            match self.resolve(&response.content).await {
                Ok(action) => return Ok(StepResult::Action(action, response.usage)),
                Err(protocol_error) => {
                    tracing::debug!("planner protocol error: {}", protocol_error);
                    self.journal.append(
                        EventKind::Error,
                        serde_json::json!({
                            "scope": "planner_protocol",
                            "detail": protocol_error.to_string(),
                        }),
                    )?;
                    observation = Some(protocol_error.corrective_observation());
                }
            }
        }
        Err(PlannerError::ProtocolExhausted { round })
    }

    /// Parse and validate one response into a resolved action.
    async fn resolve(&self, content: &str) -> Result<ResolvedAction, ProtocolError> {
        match protocol::parse_planner_action(content)? {
            PlannerAction::Search { queries, goal } => Ok(ResolvedAction::Search { queries, goal }),
            PlannerAction::Terminate { reason } => Ok(ResolvedAction::Terminate { reason }),
            PlannerAction::WriteOutline { markdown } => {
                let parsed = Outline::parse(&markdown).map_err(|e| {
                    ProtocolError::InvalidArguments {
                        tool: "write_outline".into(),
                        detail: e.to_string(),
                    }
                })?;
                let missing = self.bank.missing_from(&parsed.all_citations()).await;
                if !missing.is_empty() {
                    return Err(ProtocolError::UnresolvedCitation { ids: missing });
                }
                Ok(ResolvedAction::CommitOutline(parsed))
            }
        }
    }

    /// Dispatch one `search` action: dedupe queries, search, filter, then
    /// fetch + summarize on a bounded worker pool. Returns the number of
    /// fetch attempts made.
    async fn handle_search(
        &self,
        user_query: &str,
        queries: Vec<String>,
        goal: &str,
        past_queries: &mut Vec<String>,
    ) -> Result<usize, PlannerError> {
        let new_queries: Vec<String> = queries
            .into_iter()
            .filter(|q| !past_queries.iter().any(|p| p.eq_ignore_ascii_case(q)))
            .collect();

        self.journal.append(
            EventKind::SearchIssued,
            serde_json::json!({ "queries": &new_queries, "goal": goal }),
        )?;
        if new_queries.is_empty() {
            return Ok(0);
        }
        past_queries.extend(new_queries.iter().cloned());

        let mut work: Vec<(String, SearchHit)> = Vec::new();
        for query in &new_queries {
            let hits = match self.search.search(query, self.config.max_results).await {
                Ok(hits) => hits,
                Err(e) => {
                    tracing::warn!("search '{}' failed: {}", query, e);
                    self.journal.append(
                        EventKind::Error,
                        serde_json::json!({ "scope": "search", "query": query, "detail": e.to_string() }),
                    )?;
                    continue;
                }
            };
            if hits.is_empty() {
                continue;
            }
            let kept = self.filter_hits(user_query, goal, hits).await;
            work.extend(kept.into_iter().map(|hit| (query.clone(), hit)));
        }

        let fetch_count = work.len();
        let results: Vec<Result<EvidenceDraft, (String, String)>> = stream::iter(work)
            .map(|(query, hit)| self.process_page(user_query, query, hit))
            .buffer_unordered(self.config.fetch_concurrency)
            .collect()
            .await;

        for result in results {
            match result {
                Ok(draft) => {
                    let outcome = match self.bank.add(draft).await {
                        Ok(outcome) => outcome,
                        Err(e) => {
                            self.journal.append(
                                EventKind::Error,
                                serde_json::json!({ "scope": "bank", "detail": e.to_string() }),
                            )?;
                            continue;
                        }
                    };
                    if !outcome.deduplicated {
                        if let Some(evidence) = self.bank.get(&outcome.id).await {
                            self.journal.append(
                                EventKind::EvidenceAdded,
                                serde_json::to_value(&evidence)
                                    .map_err(|e| JournalError::Serde(e.to_string()))?,
                            )?;
                        }
                    }
                }
                Err((url, detail)) => {
                    tracing::warn!("skipping {}: {}", url, detail);
                    self.journal.append(
                        EventKind::Error,
                        serde_json::json!({ "scope": "fetch", "url": url, "detail": detail }),
                    )?;
                }
            }
        }
        Ok(fetch_count)
    }

    /// LLM relevance filter over `(title, snippet)`, capped at
    /// `max_urls_per_query`. Falls back to rank order when the filter
    /// response is unusable.
    async fn filter_hits(&self, user_query: &str, goal: &str, hits: Vec<SearchHit>) -> Vec<SearchHit> {
        let cap = self.config.max_urls_per_query;
        let request = ChatRequest::new(
            prompts::url_filter_system(),
            prompts::url_filter_user(user_query, goal, &hits, cap),
        );
        let keep_urls: Option<Vec<String>> = match self.llm.complete(&request).await {
            Ok(response) => extract_json_array(&response.content).map(|values| {
                values
                    .into_iter()
                    .filter_map(|v| v.as_str().map(|s| s.to_string()))
                    .collect()
            }),
            Err(e) => {
                tracing::warn!("URL filter call failed, keeping rank order: {}", e);
                None
            }
        };
        match keep_urls {
            Some(urls) => hits
                .into_iter()
                .filter(|hit| urls.iter().any(|u| u == &hit.url))
                .take(cap)
                .collect(),
            None => hits.into_iter().take(cap).collect(),
        }
    }

    /// Fetch one page and derive its summary and structured items. Errors
    /// carry the URL so the caller can journal the skip.
    async fn process_page(
        &self,
        user_query: &str,
        query: String,
        hit: SearchHit,
    ) -> Result<EvidenceDraft, (String, String)> {
        let page = self
            .fetcher
            .fetch(&hit.url)
            .await
            .map_err(|e| (hit.url.clone(), e.to_string()))?;

        let summary_request = ChatRequest::new(
            prompts::page_summary_system(),
            prompts::page_summary_user(user_query, &page.title, &page.text),
        );
        let mut summary = self
            .llm
            .complete(&summary_request)
            .await
            .map_err(|e| (hit.url.clone(), format!("summary failed: {}", e)))?
            .content
            .trim()
            .to_string();
        summary.truncate_to_chars(1024);

        let items_request = ChatRequest::new(
            prompts::page_items_system(),
            prompts::page_items_user(user_query, &page.text),
        );
        let items = match self.llm.complete(&items_request).await {
            Ok(response) => parse_items(&response.content),
            Err(e) => {
                // Items are an enrichment; a summary-only record is still
                // useful evidence.
                tracing::warn!("item extraction failed for {}: {}", hit.url, e);
                Vec::new()
            }
        };

        let publisher = url::Url::parse(&page.url)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_string()));

        let title = if page.title.is_empty() {
            hit.title.clone()
        } else {
            page.title.clone()
        };

        Ok(EvidenceDraft {
            query,
            source: SourceMeta {
                url: page.url.clone(),
                title,
                publisher,
                author: None,
                published_at: None,
                retrieved_at: chrono::Utc::now(),
            },
            summary,
            items,
            raw_text: Some(page.text),
        })
    }
}

enum StepResult {
    Action(ResolvedAction, TokenUsage),
    LlmFailed(String),
}

/// Find and parse the first JSON array in free-form LLM output.
fn extract_json_array(text: &str) -> Option<Vec<serde_json::Value>> {
    let start = text.find('[')?;
    let end = text.rfind(']')?;
    if end <= start {
        return None;
    }
    serde_json::from_str::<Vec<serde_json::Value>>(&text[start..=end]).ok()
}

/// Tolerant parse of extracted evidence items; malformed elements are
/// dropped rather than failing the page.
fn parse_items(text: &str) -> Vec<EvidenceItem> {
    let Some(values) = extract_json_array(text) else {
        return Vec::new();
    };
    values
        .into_iter()
        .filter_map(|v| {
            let item_type = EvidenceItemType::parse(v.get("type")?.as_str()?)?;
            let content = v.get("content")?.as_str()?.to_string();
            if content.is_empty() {
                return None;
            }
            let location = v
                .get("location")
                .and_then(|l| l.as_str())
                .map(|s| s.to_string());
            let confidence = v
                .get("confidence")
                .and_then(|c| c.as_f64())
                .unwrap_or(0.5)
                .clamp(0.0, 1.0) as f32;
            Some(EvidenceItem {
                item_type,
                content,
                location,
                confidence,
            })
        })
        .take(8)
        .collect()
}

trait TruncateChars {
    fn truncate_to_chars(&mut self, cap: usize);
}

impl TruncateChars for String {
    fn truncate_to_chars(&mut self, cap: usize) {
        if let Some((idx, _)) = self.char_indices().nth(cap) {
            self.truncate(idx);
        }
    }
}

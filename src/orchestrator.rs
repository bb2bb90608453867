//! Run orchestration
//!
//! Allocates the run directory, owns the journal and the evidence bank,
//! sequences the planner and then the writer under a global wall-clock
//! budget, and writes the final artifacts. All collaborators are passed in
//! explicitly; there is no global state.
//!
//! Resume is journal replay: `continue <run_id>` folds `events.jsonl` into
//! a `RunState`, reopens the bank from its own JSONL, skips the planner if
//! it already terminated, and hands the writer the sections that were
//! already sealed. Events from the prior run are never re-emitted.

use crate::config::EngineConfig;
use crate::evidence::EvidenceBank;
use crate::fetch::{HttpFetcher, PageFetcher};
use crate::journal::{replay, Event, EventJournal, EventKind, JournalError, RunState};
use crate::judge::{JudgeError, LlmOutlineJudge, OutlineJudge};
use crate::llm::{ChatProvider, LlmClient};
use crate::outline::Outline;
use crate::planner::{Planner, PlannerError, PlannerResume};
use crate::search::{provider_from_config, SearchProvider};
use crate::writer::{assemble_report, ReportSection, Writer, WriterError, OMITTED_SECTION_BODY};
use rand::Rng;
use std::path::{Path, PathBuf};

/// Body of the report when planning ended without usable evidence.
pub const INSUFFICIENT_EVIDENCE_BODY: &str = "Insufficient evidence gathered.";

const INCOMPLETE_MARKER: &str = "<!-- incomplete -->";

/// Terminal status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Complete,
    Partial,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Complete => "complete",
            RunStatus::Partial => "partial",
        }
    }
}

/// What a finished (or resumed) run hands back to the caller.
#[derive(Debug)]
pub struct RunReport {
    pub run_id: String,
    pub run_dir: PathBuf,
    pub status: RunStatus,
    pub report_path: PathBuf,
}

/// Top-level engine errors. Anything that reaches the caller here is
/// fatal for the run; recoverable failures were journalled and absorbed.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),
    #[error(transparent)]
    Journal(#[from] JournalError),
    #[error(transparent)]
    Bank(#[from] crate::evidence::BankError),
    #[error(transparent)]
    Planner(#[from] PlannerError),
    #[error(transparent)]
    Writer(#[from] WriterError),
    #[error("unknown run: {0}")]
    UnknownRun(String),
    #[error("fatal: {0}")]
    Fatal(String),
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        EngineError::Fatal(format!("I/O error: {}", e))
    }
}

pub struct Orchestrator {
    config: EngineConfig,
    llm: Box<dyn ChatProvider>,
    search: Box<dyn SearchProvider>,
    fetcher: Box<dyn PageFetcher>,
}

impl Orchestrator {
    pub fn new(
        config: EngineConfig,
        llm: Box<dyn ChatProvider>,
        search: Box<dyn SearchProvider>,
        fetcher: Box<dyn PageFetcher>,
    ) -> Self {
        Self {
            config,
            llm,
            search,
            fetcher,
        }
    }

    /// Wire the production collaborators from configuration.
    pub fn from_config(config: EngineConfig) -> Result<Self, EngineError> {
        let llm = LlmClient::new(&config.llm)
            .map_err(|e| EngineError::Fatal(format!("LLM client init failed: {}", e)))?;
        let search = provider_from_config(&config.search);
        let fetcher = HttpFetcher::new(config.planner.min_page_chars);
        Ok(Self {
            config,
            llm: Box::new(llm),
            search,
            fetcher: Box::new(fetcher),
        })
    }

    /// `<utc_timestamp>_<8hex>`, unique per invocation.
    pub fn generate_run_id() -> String {
        let ts = chrono::Utc::now().format("%Y%m%dT%H%M%SZ");
        let suffix: u32 = rand::thread_rng().gen();
        format!("{}_{:08x}", ts, suffix)
    }

    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.config.artifacts_dir.join(format!("run_{}", run_id))
    }

    /// Start a fresh run.
    pub async fn run(&self, user_query: &str) -> Result<RunReport, EngineError> {
        let run_id = Self::generate_run_id();
        let run_dir = self.run_dir(&run_id);
        std::fs::create_dir_all(&run_dir)
            .map_err(|e| EngineError::Fatal(format!("run directory unwritable: {}", e)))?;
        tracing::info!("run {} started in {}", run_id, run_dir.display());

        let (journal, _) = EventJournal::open(&run_dir, &run_id)?;
        journal.append(EventKind::RunStarted, serde_json::json!({ "query": user_query }))?;
        let bank = EvidenceBank::open(&run_dir)?;

        self.drive(&run_id, &run_dir, user_query, &journal, &bank, RunState::default())
            .await
    }

    /// Resume an interrupted run by replaying its journal.
    pub async fn resume(&self, run_id: &str) -> Result<RunReport, EngineError> {
        let run_dir = self.run_dir(run_id);
        if !run_dir.exists() {
            return Err(EngineError::UnknownRun(run_id.to_string()));
        }

        let (journal, events) = EventJournal::open(&run_dir, run_id)?;
        let state = replay(&events);

        if state.finished.as_deref() == Some("complete") {
            tracing::info!("run {} already complete; nothing to do", run_id);
            return Ok(RunReport {
                run_id: run_id.to_string(),
                run_dir: run_dir.clone(),
                status: RunStatus::Complete,
                report_path: run_dir.join("report.md"),
            });
        }

        let user_query = state
            .query
            .clone()
            .ok_or_else(|| EngineError::Fatal("journal has no run_started event".into()))?;
        // The journal is the source of truth: the bank is rebuilt from its
        // evidence_added events, and the bank's own file is reconciled
        // against that sequence.
        let bank = EvidenceBank::open_replayed(&run_dir, &state.evidence)?;
        tracing::info!(
            "resuming run {}: {} evidence records, {} sections written",
            run_id,
            state.evidence.len(),
            state.sections.len()
        );

        self.drive(run_id, &run_dir, &user_query, &journal, &bank, state)
            .await
    }

    /// Load a run's events for `replay` streaming.
    pub fn load_events(&self, run_id: &str) -> Result<Vec<Event>, EngineError> {
        let path = self.run_dir(run_id).join("events.jsonl");
        if !path.exists() {
            return Err(EngineError::UnknownRun(run_id.to_string()));
        }
        Ok(EventJournal::load(&path)?)
    }

    /// Run the planner/writer sequence under the global wall-clock budget.
    async fn drive(
        &self,
        run_id: &str,
        run_dir: &Path,
        user_query: &str,
        journal: &EventJournal,
        bank: &EvidenceBank,
        prior: RunState,
    ) -> Result<RunReport, EngineError> {
        let driven = tokio::time::timeout(
            self.config.run_timeout,
            self.drive_inner(run_dir, user_query, journal, bank, prior),
        )
        .await;

        let status = match driven {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                // Unrecoverable: record the failure and surface it. The
                // journal keeps the run resumable.
                let _ = journal.append(
                    EventKind::Error,
                    serde_json::json!({ "scope": "orchestrator", "detail": e.to_string() }),
                );
                let _ = journal.append(
                    EventKind::RunFinished,
                    serde_json::json!({ "status": "fatal" }),
                );
                return Err(e);
            }
            Err(_elapsed) => {
                tracing::warn!("run {} hit its global timeout; sealing partial report", run_id);
                journal.append(
                    EventKind::Error,
                    serde_json::json!({ "scope": "orchestrator", "detail": "global timeout" }),
                )?;
                // Best effort: assemble whatever sections the journal holds.
                let state = replay(&EventJournal::load(journal.path())?);
                if let Some(outline) = state.outline.as_ref() {
                    let report = assemble_report(
                        outline,
                        &state.sections,
                        bank,
                        self.config.writer.write_level,
                    )
                    .await;
                    std::fs::write(
                        run_dir.join("report.md"),
                        format!("{}\n{}\n", report.trim_end(), INCOMPLETE_MARKER),
                    )?;
                }
                RunStatus::Partial
            }
        };

        journal.append(
            EventKind::RunFinished,
            serde_json::json!({ "status": status.as_str() }),
        )?;
        tracing::info!("run {} finished: {}", run_id, status.as_str());

        Ok(RunReport {
            run_id: run_id.to_string(),
            run_dir: run_dir.to_path_buf(),
            status,
            report_path: run_dir.join("report.md"),
        })
    }

    async fn drive_inner(
        &self,
        run_dir: &Path,
        user_query: &str,
        journal: &EventJournal,
        bank: &EvidenceBank,
        prior: RunState,
    ) -> Result<RunStatus, EngineError> {
        // Phase 1: planning, unless the journal says it already finished.
        let outline = if prior.planner_terminated.is_none() {
            let planner = Planner {
                llm: self.llm.as_ref(),
                search: self.search.as_ref(),
                fetcher: self.fetcher.as_ref(),
                bank,
                journal,
                config: &self.config.planner,
                protocol_retries: self.config.protocol_retries,
            };
            let outcome = planner
                .run(
                    user_query,
                    PlannerResume {
                        outline: prior.outline.clone(),
                        past_queries: prior.past_queries.clone(),
                        start_round: prior.planner_rounds,
                    },
                )
                .await?;
            outcome.outline
        } else {
            prior.outline.clone()
        };

        // Artifacts that only depend on the outline.
        if let Some(ref outline) = outline {
            std::fs::write(run_dir.join("outline.md"), outline.to_markdown())?;
            self.judge_outline(run_dir, user_query, outline).await?;
        }

        // Phase 2: writing.
        let (sections, insufficient) = match outline.as_ref().filter(|o| !o.is_empty()) {
            Some(outline) => {
                let writer = Writer {
                    llm: self.llm.as_ref(),
                    bank,
                    journal,
                    config: &self.config.writer,
                    protocol_retries: self.config.protocol_retries,
                };
                let outcome = writer.run(user_query, outline, prior.sections).await?;
                (outcome.sections, false)
            }
            None => {
                // No committed outline: emit the single-section fallback
                // report without involving the writer model.
                let fallback = Outline::fallback(user_query);
                let section = ReportSection {
                    node_id: fallback.roots[0].id.clone(),
                    markdown_body: INSUFFICIENT_EVIDENCE_BODY.to_string(),
                    used_citation_ids: Vec::new(),
                };
                if !prior.section_written(&section.node_id) {
                    journal.append(
                        EventKind::SectionWritten,
                        serde_json::to_value(&section)
                            .map_err(|e| JournalError::Serde(e.to_string()))?,
                    )?;
                    journal.append(
                        EventKind::WriterTerminated,
                        serde_json::json!({ "reason": "insufficient_evidence", "sections": 1 }),
                    )?;
                }
                (vec![section], true)
            }
        };

        let report_outline = match outline {
            Some(ref o) if !o.is_empty() => o.clone(),
            _ => Outline::fallback(user_query),
        };
        let report = assemble_report(
            &report_outline,
            &sections,
            bank,
            self.config.writer.write_level,
        )
        .await;

        let omitted = sections
            .iter()
            .any(|s| s.markdown_body == OMITTED_SECTION_BODY);
        let status = if insufficient || omitted {
            RunStatus::Partial
        } else {
            RunStatus::Complete
        };

        let body = if status == RunStatus::Partial && !insufficient {
            format!("{}\n{}\n", report.trim_end(), INCOMPLETE_MARKER)
        } else {
            report
        };
        std::fs::write(run_dir.join("report.md"), body)?;

        let stats = bank.stats().await;
        tracing::info!(
            "report assembled: {} sections, {} evidence records from {} domains",
            sections.len(),
            stats.count,
            stats.distinct_domains
        );
        Ok(status)
    }

    /// Judge the committed outline once; failures are recorded, never fatal.
    async fn judge_outline(
        &self,
        run_dir: &Path,
        user_query: &str,
        outline: &Outline,
    ) -> Result<(), EngineError> {
        let path = run_dir.join("outline_judgement.json");
        if path.exists() {
            return Ok(());
        }
        let judge = LlmOutlineJudge {
            llm: self.llm.as_ref(),
        };
        let content = match judge.judge(user_query, &outline.to_markdown()).await {
            Ok(report) => serde_json::to_string_pretty(&report)
                .unwrap_or_else(|e| format!("{{\"error\": \"{}\"}}", e)),
            Err(JudgeError::Llm(e)) => {
                tracing::warn!("outline judge LLM call failed: {}", e);
                serde_json::json!({ "error": e.to_string() }).to_string()
            }
            Err(JudgeError::Parse(e)) => {
                tracing::warn!("outline judgement malformed: {}", e);
                serde_json::json!({ "error": e }).to_string()
            }
        };
        std::fs::write(path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_id_shape() {
        let id = Orchestrator::generate_run_id();
        let (ts, hex) = id.rsplit_once('_').unwrap();
        assert_eq!(hex.len(), 8);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit()));
        assert!(ts.ends_with('Z'));
        assert!(ts.contains('T'));
    }

    #[test]
    fn test_run_ids_distinct() {
        let a = Orchestrator::generate_run_id();
        let b = Orchestrator::generate_run_id();
        assert_ne!(a, b);
    }

    #[test]
    fn test_status_strings() {
        assert_eq!(RunStatus::Complete.as_str(), "complete");
        assert_eq!(RunStatus::Partial.as_str(), "partial");
    }
}

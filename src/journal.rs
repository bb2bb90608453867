//! Crash-safe event journal
//!
//! Every state transition of a run is appended to `events.jsonl` as one
//! JSON object per line, fsynced before the step counter advances. The
//! journal is the basis for replay: folding the events of a run rebuilds
//! the evidence bank contents, the last committed outline, and writer
//! progress, which is how `continue` resumes an interrupted run.
//!
//! Replay is tolerant by design: corrupt lines (a crash mid-write leaves at
//! most one truncated trailing line) and unknown event kinds are skipped
//! with a warning, never a failure.

use crate::evidence::Evidence;
use crate::outline::Outline;
use crate::writer::ReportSection;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Closed enumeration of journalled state transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    RunStarted,
    PlannerStep,
    SearchIssued,
    EvidenceAdded,
    OutlineUpdated,
    PlannerTerminated,
    WriterStep,
    SectionRetrieved,
    SectionWritten,
    WriterTerminated,
    Error,
    RunFinished,
}

/// One journalled record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub ts: DateTime<Utc>,
    pub run_id: String,
    pub step: u64,
    pub kind: EventKind,
    pub payload: serde_json::Value,
}

/// Journal errors.
#[derive(Debug, thiserror::Error)]
pub enum JournalError {
    #[error("journal I/O error: {0}")]
    Io(String),
    #[error("journal serialization error: {0}")]
    Serde(String),
}

impl From<std::io::Error> for JournalError {
    fn from(e: std::io::Error) -> Self {
        JournalError::Io(e.to_string())
    }
}

struct JournalInner {
    file: std::fs::File,
    next_step: u64,
}

/// Single-writer append-only journal for one run.
pub struct EventJournal {
    run_id: String,
    path: PathBuf,
    inner: Mutex<JournalInner>,
}

impl EventJournal {
    /// Open (or create) the journal for a run directory, loading every
    /// valid existing event and resuming the step counter after the last
    /// valid line.
    pub fn open(run_dir: &Path, run_id: &str) -> Result<(Self, Vec<Event>), JournalError> {
        let path = run_dir.join("events.jsonl");
        let existing = if path.exists() {
            Self::load(&path)?
        } else {
            Vec::new()
        };
        let next_step = existing.last().map(|e| e.step + 1).unwrap_or(0);
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        Ok((
            Self {
                run_id: run_id.to_string(),
                path,
                inner: Mutex::new(JournalInner { file, next_step }),
            },
            existing,
        ))
    }

    /// Append one event: assign the next step, stamp the time, write the
    /// line and fsync before the counter advances.
    pub fn append(&self, kind: EventKind, payload: serde_json::Value) -> Result<Event, JournalError> {
        let mut inner = self.inner.lock().expect("journal mutex poisoned");
        let event = Event {
            ts: Utc::now(),
            run_id: self.run_id.clone(),
            step: inner.next_step,
            kind,
            payload,
        };
        let line = serde_json::to_string(&event).map_err(|e| JournalError::Serde(e.to_string()))?;
        inner.file.write_all(line.as_bytes())?;
        inner.file.write_all(b"\n")?;
        inner.file.sync_data()?;
        inner.next_step += 1;
        Ok(event)
    }

    /// Tolerant reader: skips corrupt lines and unknown kinds.
    pub fn load(path: &Path) -> Result<Vec<Event>, JournalError> {
        let content = std::fs::read_to_string(path)?;
        let mut events = Vec::new();
        for (lineno, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let value: serde_json::Value = match serde_json::from_str(line) {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!("discarding unreadable event line {}: {}", lineno + 1, e);
                    continue;
                }
            };
            let kind_str = value.get("kind").and_then(|k| k.as_str()).unwrap_or("");
            let Ok(kind) =
                serde_json::from_value::<EventKind>(serde_json::Value::String(kind_str.into()))
            else {
                // Forward compatibility: newer writers may add kinds.
                tracing::warn!("ignoring unknown event kind '{}' on replay", kind_str);
                continue;
            };
            match serde_json::from_value::<Event>(value) {
                Ok(mut event) => {
                    event.kind = kind;
                    events.push(event);
                }
                Err(e) => {
                    tracing::warn!("discarding malformed event line {}: {}", lineno + 1, e);
                }
            }
        }
        Ok(events)
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn next_step(&self) -> u64 {
        self.inner.lock().expect("journal mutex poisoned").next_step
    }
}

/// State reconstructed by folding a run's events.
#[derive(Debug, Default)]
pub struct RunState {
    pub query: Option<String>,
    pub evidence: Vec<Evidence>,
    pub outline: Option<Outline>,
    pub sections: Vec<ReportSection>,
    pub planner_terminated: Option<String>,
    pub writer_terminated: bool,
    pub finished: Option<String>,
    pub past_queries: Vec<String>,
    pub planner_rounds: u32,
}

impl RunState {
    pub fn section_written(&self, node_id: &str) -> bool {
        self.sections.iter().any(|s| s.node_id == node_id)
    }
}

/// Fold events into a `RunState`. Individual malformed payloads are
/// discarded, mirroring the journal reader's tolerance.
pub fn replay(events: &[Event]) -> RunState {
    let mut state = RunState::default();
    for event in events {
        match event.kind {
            EventKind::RunStarted => {
                state.query = event
                    .payload
                    .get("query")
                    .and_then(|q| q.as_str())
                    .map(|s| s.to_string());
            }
            EventKind::EvidenceAdded => {
                match serde_json::from_value::<Evidence>(event.payload.clone()) {
                    Ok(evidence) => state.evidence.push(evidence),
                    Err(e) => tracing::warn!("discarding evidence_added payload: {}", e),
                }
            }
            EventKind::OutlineUpdated => {
                if let Some(markdown) = event.payload.get("markdown").and_then(|m| m.as_str()) {
                    match Outline::parse(markdown) {
                        Ok(outline) => state.outline = Some(outline),
                        Err(e) => tracing::warn!("discarding outline_updated payload: {}", e),
                    }
                }
            }
            EventKind::SearchIssued => {
                if let Some(queries) = event.payload.get("queries").and_then(|q| q.as_array()) {
                    state.past_queries.extend(
                        queries
                            .iter()
                            .filter_map(|v| v.as_str().map(|s| s.to_string())),
                    );
                }
            }
            EventKind::PlannerStep => state.planner_rounds += 1,
            EventKind::PlannerTerminated => {
                state.planner_terminated = Some(
                    event
                        .payload
                        .get("reason")
                        .and_then(|r| r.as_str())
                        .unwrap_or("unknown")
                        .to_string(),
                );
            }
            EventKind::SectionWritten => {
                match serde_json::from_value::<ReportSection>(event.payload.clone()) {
                    Ok(section) => {
                        state.sections.retain(|s| s.node_id != section.node_id);
                        state.sections.push(section);
                    }
                    Err(e) => tracing::warn!("discarding section_written payload: {}", e),
                }
            }
            EventKind::WriterTerminated => state.writer_terminated = true,
            EventKind::RunFinished => {
                state.finished = event
                    .payload
                    .get("status")
                    .and_then(|s| s.as_str())
                    .map(|s| s.to_string());
            }
            EventKind::WriterStep | EventKind::SectionRetrieved | EventKind::Error => {}
        }
    }
    state
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_append_assigns_monotonic_steps() {
        let dir = tempdir().unwrap();
        let (journal, existing) = EventJournal::open(dir.path(), "run_test").unwrap();
        assert!(existing.is_empty());

        let e0 = journal
            .append(EventKind::RunStarted, serde_json::json!({"query": "q"}))
            .unwrap();
        let e1 = journal
            .append(EventKind::PlannerStep, serde_json::json!({"round": 1}))
            .unwrap();
        assert_eq!(e0.step, 0);
        assert_eq!(e1.step, 1);
        assert_eq!(journal.next_step(), 2);
    }

    #[test]
    fn test_reopen_resumes_step_counter() {
        let dir = tempdir().unwrap();
        {
            let (journal, _) = EventJournal::open(dir.path(), "run_test").unwrap();
            journal
                .append(EventKind::RunStarted, serde_json::json!({"query": "q"}))
                .unwrap();
            journal
                .append(EventKind::PlannerStep, serde_json::json!({}))
                .unwrap();
        }
        let (journal, existing) = EventJournal::open(dir.path(), "run_test").unwrap();
        assert_eq!(existing.len(), 2);
        let next = journal
            .append(EventKind::PlannerStep, serde_json::json!({}))
            .unwrap();
        assert_eq!(next.step, 2);
    }

    #[test]
    fn test_truncated_line_skipped() {
        let dir = tempdir().unwrap();
        {
            let (journal, _) = EventJournal::open(dir.path(), "run_test").unwrap();
            journal
                .append(EventKind::RunStarted, serde_json::json!({"query": "q"}))
                .unwrap();
        }
        let path = dir.path().join("events.jsonl");
        let mut content = std::fs::read_to_string(&path).unwrap();
        content.push_str("{\"ts\": \"2026-01-01T00:0");
        std::fs::write(&path, content).unwrap();

        let (_, events) = EventJournal::open(dir.path(), "run_test").unwrap();
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_unknown_kind_ignored() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        std::fs::write(
            &path,
            concat!(
                "{\"ts\":\"2026-01-01T00:00:00Z\",\"run_id\":\"r\",\"step\":0,\"kind\":\"run_started\",\"payload\":{\"query\":\"q\"}}\n",
                "{\"ts\":\"2026-01-01T00:00:01Z\",\"run_id\":\"r\",\"step\":1,\"kind\":\"telemetry_v2\",\"payload\":{}}\n",
            ),
        )
        .unwrap();
        let events = EventJournal::load(&path).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::RunStarted);
    }

    #[test]
    fn test_kind_serializes_snake_case() {
        let json = serde_json::to_string(&EventKind::EvidenceAdded).unwrap();
        assert_eq!(json, "\"evidence_added\"");
        let json = serde_json::to_string(&EventKind::SectionWritten).unwrap();
        assert_eq!(json, "\"section_written\"");
    }

    #[test]
    fn test_replay_folds_state() {
        let mk = |step: u64, kind: EventKind, payload: serde_json::Value| Event {
            ts: Utc::now(),
            run_id: "r".into(),
            step,
            kind,
            payload,
        };
        let evidence = serde_json::json!({
            "id": "ev_0001",
            "query": "q",
            "source": {"url": "https://e.com", "title": "E", "retrieved_at": "2026-01-01T00:00:00Z"},
            "summary": "s",
            "items": [],
            "raw_ref": null,
            "hash": "abc"
        });
        let events = vec![
            mk(0, EventKind::RunStarted, serde_json::json!({"query": "the query"})),
            mk(1, EventKind::SearchIssued, serde_json::json!({"queries": ["a", "b"]})),
            mk(2, EventKind::EvidenceAdded, evidence),
            mk(
                3,
                EventKind::OutlineUpdated,
                serde_json::json!({"markdown": "# T <citation>ev_0001</citation>\n## S <citation>ev_0001</citation>\n"}),
            ),
            mk(4, EventKind::PlannerTerminated, serde_json::json!({"reason": "ready"})),
            mk(
                5,
                EventKind::SectionWritten,
                serde_json::json!({
                    "node_id": "sec_1_1",
                    "markdown_body": "body[^ev_0001]",
                    "used_citation_ids": ["ev_0001"]
                }),
            ),
        ];
        let state = replay(&events);
        assert_eq!(state.query.as_deref(), Some("the query"));
        assert_eq!(state.past_queries, vec!["a", "b"]);
        assert_eq!(state.evidence.len(), 1);
        assert_eq!(state.planner_terminated.as_deref(), Some("ready"));
        let outline = state.outline.as_ref().unwrap();
        assert_eq!(outline.roots[0].title, "T");
        assert!(state.section_written("sec_1_1"));
        assert!(!state.section_written("sec_1_2"));
        assert!(state.finished.is_none());
    }
}

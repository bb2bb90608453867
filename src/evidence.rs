//! Evidence model and the append-only Evidence Bank
//!
//! The bank maps stable `ev_NNNN` identifiers to retrieved, summarized
//! source records. IDs are dense and monotonic for the life of a run and
//! are used verbatim as citation anchors. Deduplication is content-based:
//! a record whose hash (normalized URL + normalized body) already exists
//! resolves to the existing ID instead of inserting a duplicate.
//!
//! Persistence is one JSON line per record in `evidence_bank/evidence.jsonl`
//! plus an optional raw-text sidecar under `evidence_bank/raw/<hash>.txt`.
//! A line is written and fsynced before the in-memory counter advances, so
//! a crash mid-write leaves at most one truncated trailing line, which the
//! loader discards.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

/// Kind of a structured evidence item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceItemType {
    Quote,
    Data,
    Definition,
    Claim,
    Case,
}

impl EvidenceItemType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "quote" => Some(Self::Quote),
            "data" => Some(Self::Data),
            "definition" => Some(Self::Definition),
            "claim" => Some(Self::Claim),
            "case" => Some(Self::Case),
            _ => None,
        }
    }
}

/// One structured item extracted from a source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceItem {
    #[serde(rename = "type")]
    pub item_type: EvidenceItemType,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    pub confidence: f32,
}

/// Source attribution for an evidence record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceMeta {
    pub url: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publisher: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_at: Option<String>,
    pub retrieved_at: DateTime<Utc>,
}

/// An immutable evidence record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evidence {
    pub id: String,
    pub query: String,
    pub source: SourceMeta,
    pub summary: String,
    pub items: Vec<EvidenceItem>,
    pub raw_ref: Option<String>,
    pub hash: String,
}

/// Input to `EvidenceBank::add`; the bank assigns `id`, `hash`, `raw_ref`.
#[derive(Debug, Clone)]
pub struct EvidenceDraft {
    pub query: String,
    pub source: SourceMeta,
    pub summary: String,
    pub items: Vec<EvidenceItem>,
    pub raw_text: Option<String>,
}

/// Result of an insert.
#[derive(Debug, Clone)]
pub struct AddOutcome {
    pub id: String,
    /// True when the draft hashed to an existing record and no new line was
    /// written.
    pub deduplicated: bool,
}

/// Bank statistics.
#[derive(Debug, Clone, Serialize)]
pub struct BankStats {
    pub count: usize,
    pub total_summary_chars: usize,
    pub distinct_domains: usize,
}

/// Errors from the bank.
#[derive(Debug, thiserror::Error)]
pub enum BankError {
    #[error("evidence bank I/O error: {0}")]
    Io(String),
    #[error("evidence bank serialization error: {0}")]
    Serde(String),
    #[error("missing evidence: {}", ids.join(", "))]
    MissingEvidence { ids: Vec<String> },
}

impl From<std::io::Error> for BankError {
    fn from(e: std::io::Error) -> Self {
        BankError::Io(e.to_string())
    }
}

/// Format the nth evidence ID (`ev_0001` for n = 1).
pub fn format_evidence_id(n: u32) -> String {
    format!("ev_{:04}", n)
}

/// Parse an `ev_NNNN` identifier back to its ordinal.
pub fn parse_evidence_id(id: &str) -> Option<u32> {
    id.strip_prefix("ev_")?.parse().ok()
}

/// Content hash over normalized URL + normalized body, used for dedup.
pub fn content_hash(url: &str, body: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize_url(url).as_bytes());
    hasher.update(b"\n");
    hasher.update(normalize_body(body).as_bytes());
    hex::encode(hasher.finalize())
}

/// Normalize a URL for hashing: lowercase scheme and host, drop fragments,
/// tracking parameters and trailing slashes.
pub fn normalize_url(raw: &str) -> String {
    let Ok(mut parsed) = url::Url::parse(raw) else {
        return raw.trim().to_string();
    };
    parsed.set_fragment(None);
    let kept: Vec<(String, String)> = parsed
        .query_pairs()
        .filter(|(k, _)| !k.starts_with("utm_") && k != "ref" && k != "fbclid")
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if kept.is_empty() {
        parsed.set_query(None);
    } else {
        let query = kept
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&");
        parsed.set_query(Some(&query));
    }
    let mut out = parsed.to_string();
    while out.ends_with('/') {
        out.pop();
    }
    out
}

fn normalize_body(body: &str) -> String {
    body.split_whitespace().collect::<Vec<_>>().join(" ")
}

struct BankInner {
    records: Vec<Evidence>,
    by_id: HashMap<String, usize>,
    by_hash: HashMap<String, usize>,
    next_ordinal: u32,
    jsonl_path: PathBuf,
    raw_dir: PathBuf,
}

impl BankInner {
    fn create(run_dir: &Path) -> Result<Self, BankError> {
        let bank_dir = run_dir.join("evidence_bank");
        let raw_dir = bank_dir.join("raw");
        std::fs::create_dir_all(&raw_dir)?;
        Ok(Self {
            records: Vec::new(),
            by_id: HashMap::new(),
            by_hash: HashMap::new(),
            next_ordinal: 1,
            jsonl_path: bank_dir.join("evidence.jsonl"),
            raw_dir,
        })
    }

    fn persist(&self, evidence: &Evidence) -> Result<(), BankError> {
        let line = serde_json::to_string(evidence).map_err(|e| BankError::Serde(e.to_string()))?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.jsonl_path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        file.sync_data()?;
        Ok(())
    }

    fn index(&mut self, evidence: Evidence) {
        let idx = self.records.len();
        self.by_id.insert(evidence.id.clone(), idx);
        self.by_hash.insert(evidence.hash.clone(), idx);
        if let Some(ordinal) = parse_evidence_id(&evidence.id) {
            self.next_ordinal = self.next_ordinal.max(ordinal + 1);
        }
        self.records.push(evidence);
    }
}

/// The append-only evidence store. All mutations serialize through one
/// async mutex; reads clone an immutable snapshot.
pub struct EvidenceBank {
    inner: Mutex<BankInner>,
}

impl EvidenceBank {
    /// Open (or create) the bank under `<run_dir>/evidence_bank/`, loading
    /// any existing records and resuming the counter at `max(ids) + 1`.
    pub fn open(run_dir: &Path) -> Result<Self, BankError> {
        let mut inner = BankInner::create(run_dir)?;
        for evidence in read_records(&inner.jsonl_path)? {
            inner.index(evidence);
        }
        Ok(Self {
            inner: Mutex::new(inner),
        })
    }

    /// Open the bank with the journal as the source of truth: `journalled`
    /// is the record sequence folded from `evidence_added` events. When the
    /// on-disk file disagrees (a crash between the bank fsync and the
    /// journal append leaves an unjournalled tail record) the file is
    /// rewritten from the journalled sequence and the divergence is logged.
    pub fn open_replayed(run_dir: &Path, journalled: &[Evidence]) -> Result<Self, BankError> {
        let mut inner = BankInner::create(run_dir)?;
        let on_disk = read_records(&inner.jsonl_path)?;

        let matches = on_disk.len() == journalled.len()
            && on_disk
                .iter()
                .zip(journalled)
                .all(|(disk, journal)| disk.id == journal.id && disk.hash == journal.hash);
        if !matches {
            tracing::warn!(
                "evidence file holds {} records but the journal holds {}; rebuilding from the journal",
                on_disk.len(),
                journalled.len()
            );
            rewrite_records(&inner.jsonl_path, journalled)?;
        }

        for evidence in journalled {
            inner.index(evidence.clone());
        }
        Ok(Self {
            inner: Mutex::new(inner),
        })
    }

    /// Insert a draft, deduplicating on content hash. The JSONL line (and
    /// raw sidecar, if text was provided) hit disk before the counter
    /// advances.
    pub async fn add(&self, draft: EvidenceDraft) -> Result<AddOutcome, BankError> {
        let mut inner = self.inner.lock().await;

        let body_for_hash = draft
            .raw_text
            .as_deref()
            .unwrap_or(draft.summary.as_str());
        let hash = content_hash(&draft.source.url, body_for_hash);

        if let Some(&idx) = inner.by_hash.get(&hash) {
            let id = inner.records[idx].id.clone();
            tracing::debug!("evidence dedup: {} already stored as {}", draft.source.url, id);
            return Ok(AddOutcome {
                id,
                deduplicated: true,
            });
        }

        let id = format_evidence_id(inner.next_ordinal);
        let raw_ref = if let Some(ref text) = draft.raw_text {
            let rel = format!("raw/{}.txt", hash);
            std::fs::write(inner.raw_dir.join(format!("{}.txt", hash)), text)?;
            Some(rel)
        } else {
            None
        };

        let evidence = Evidence {
            id: id.clone(),
            query: draft.query,
            source: draft.source,
            summary: draft.summary,
            items: draft.items,
            raw_ref,
            hash,
        };

        inner.persist(&evidence)?;
        inner.index(evidence);

        Ok(AddOutcome {
            id,
            deduplicated: false,
        })
    }

    pub async fn get(&self, id: &str) -> Option<Evidence> {
        let inner = self.inner.lock().await;
        inner.by_id.get(id).map(|&idx| inner.records[idx].clone())
    }

    /// Fetch records preserving input order; any missing ID fails the call.
    pub async fn bulk_get(&self, ids: &[String]) -> Result<Vec<Evidence>, BankError> {
        let inner = self.inner.lock().await;
        let mut found = Vec::with_capacity(ids.len());
        let mut missing = Vec::new();
        for id in ids {
            match inner.by_id.get(id) {
                Some(&idx) => found.push(inner.records[idx].clone()),
                None => missing.push(id.clone()),
            }
        }
        if !missing.is_empty() {
            return Err(BankError::MissingEvidence { ids: missing });
        }
        Ok(found)
    }

    /// `(id, url, summary)` triples for prompt building. Raw pages never
    /// leave the bank.
    pub async fn summaries(&self, ids: Option<&[String]>) -> Vec<(String, String, String)> {
        let inner = self.inner.lock().await;
        let pick = |e: &Evidence| (e.id.clone(), e.source.url.clone(), e.summary.clone());
        match ids {
            Some(ids) => ids
                .iter()
                .filter_map(|id| inner.by_id.get(id).map(|&idx| pick(&inner.records[idx])))
                .collect(),
            None => inner.records.iter().map(pick).collect(),
        }
    }

    /// IDs from `ids` that do not resolve in the bank.
    pub async fn missing_from(&self, ids: &BTreeSet<String>) -> Vec<String> {
        let inner = self.inner.lock().await;
        ids.iter()
            .filter(|id| !inner.by_id.contains_key(*id))
            .cloned()
            .collect()
    }

    pub async fn stats(&self) -> BankStats {
        let inner = self.inner.lock().await;
        let domains: BTreeSet<String> = inner
            .records
            .iter()
            .filter_map(|e| {
                url::Url::parse(&e.source.url)
                    .ok()
                    .and_then(|u| u.host_str().map(|h| h.to_string()))
            })
            .collect();
        BankStats {
            count: inner.records.len(),
            total_summary_chars: inner.records.iter().map(|e| e.summary.len()).sum(),
            distinct_domains: domains.len(),
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Clone of every record, in insertion order.
    pub async fn snapshot(&self) -> Vec<Evidence> {
        self.inner.lock().await.records.clone()
    }
}

/// Tolerant JSONL reader. A crash mid-write leaves at most one truncated
/// trailing line; anything else unreadable is corruption, also skipped
/// rather than failing the run.
fn read_records(jsonl_path: &Path) -> Result<Vec<Evidence>, BankError> {
    let mut records = Vec::new();
    if !jsonl_path.exists() {
        return Ok(records);
    }
    let content = std::fs::read_to_string(jsonl_path)?;
    for (lineno, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Evidence>(line) {
            Ok(evidence) => records.push(evidence),
            Err(e) => {
                tracing::warn!("discarding unreadable evidence line {}: {}", lineno + 1, e);
            }
        }
    }
    Ok(records)
}

/// Replace the JSONL file with the given record sequence.
fn rewrite_records(jsonl_path: &Path, records: &[Evidence]) -> Result<(), BankError> {
    let mut out = String::new();
    for evidence in records {
        out.push_str(&serde_json::to_string(evidence).map_err(|e| BankError::Serde(e.to_string()))?);
        out.push('\n');
    }
    let mut file = std::fs::File::create(jsonl_path)?;
    file.write_all(out.as_bytes())?;
    file.sync_data()?;
    Ok(())
}

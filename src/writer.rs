//! Writer agent: section-by-section report composition
//!
//! Consumes the final outline depth-first at the configured write level.
//! Every section opens a fresh context: the prompt carries the user query,
//! a compact outline map, the section's path and bullets, and one-line
//! summaries of the section's candidate evidence only. Prior section
//! bodies never bleed across.
//!
//! Context pruning is explicit data: `used_ids_global` records every
//! evidence ID consumed by earlier sections. By default each ID is served
//! once across the whole report; an explicit by-id re-request is honored
//! and flagged. Sections are deliberately sequential to keep that set and
//! the report's narrative coherent.

use crate::config::WriterConfig;
use crate::evidence::{Evidence, EvidenceBank};
use crate::journal::{EventJournal, EventKind, JournalError};
use crate::llm::{ChatProvider, ChatRequest};
use crate::outline::{Outline, OutlineNode};
use crate::prompts;
use crate::protocol::{self, WriterAction};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Body used when a section could not be generated at all.
pub const OMITTED_SECTION_BODY: &str = "<section omitted: no content generated>";

/// Note appended to sections with no supporting evidence.
pub const UNSUPPORTED_NOTE: &str = "> Note: no external source supports this section.";

/// One sealed report section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportSection {
    pub node_id: String,
    pub markdown_body: String,
    pub used_citation_ids: Vec<String>,
}

/// How the writer pass ended.
#[derive(Debug)]
pub struct WriterOutcome {
    pub sections: Vec<ReportSection>,
    /// False when the pass aborted before covering every target section.
    pub completed: bool,
}

/// Fatal writer failures.
#[derive(Debug, thiserror::Error)]
pub enum WriterError {
    #[error(transparent)]
    Journal(#[from] JournalError),
}

pub struct Writer<'a> {
    pub llm: &'a dyn ChatProvider,
    pub bank: &'a EvidenceBank,
    pub journal: &'a EventJournal,
    pub config: &'a WriterConfig,
    pub protocol_retries: u32,
}

impl<'a> Writer<'a> {
    /// Write every target section not already sealed in `resumed`.
    pub async fn run(
        &self,
        user_query: &str,
        outline: &Outline,
        resumed: Vec<ReportSection>,
    ) -> Result<WriterOutcome, WriterError> {
        let targets = outline.write_targets(self.config.write_level);
        let section_map = outline.section_map();

        let mut sections: Vec<ReportSection> = Vec::new();
        let mut used_global: BTreeSet<String> = BTreeSet::new();
        for section in resumed {
            used_global.extend(section.used_citation_ids.iter().cloned());
            sections.push(section);
        }

        for &target in &targets {
            if sections.iter().any(|s| s.node_id == target.id) {
                continue;
            }
            let section = self
                .write_section(user_query, outline, &section_map, target, &used_global)
                .await?;

            self.journal.append(
                EventKind::SectionWritten,
                serde_json::to_value(&section).map_err(|e| JournalError::Serde(e.to_string()))?,
            )?;
            used_global.extend(section.used_citation_ids.iter().cloned());
            sections.push(section);
        }

        self.journal.append(
            EventKind::WriterTerminated,
            serde_json::json!({ "reason": "all_sections_written", "sections": sections.len() }),
        )?;

        // Order sections by outline order for assembly.
        let mut ordered = Vec::with_capacity(sections.len());
        for target in &targets {
            if let Some(section) = sections.iter().find(|s| s.node_id == target.id) {
                ordered.push(section.clone());
            }
        }
        Ok(WriterOutcome {
            sections: ordered,
            completed: true,
        })
    }

    /// The per-section ReAct loop.
    async fn write_section(
        &self,
        user_query: &str,
        outline: &Outline,
        section_map: &str,
        node: &OutlineNode,
        used_global: &BTreeSet<String>,
    ) -> Result<ReportSection, WriterError> {
        let candidate_ids: Vec<String> = node.subtree_citations().into_iter().collect();
        let path_titles = outline.path_titles(&node.id);
        tracing::info!(
            "writing section {} ({}) with {} candidates",
            node.id,
            node.title,
            candidate_ids.len()
        );

        if candidate_ids.is_empty() {
            let body = self
                .unsupported_section(user_query, &path_titles, &node.bullets)
                .await?;
            return Ok(ReportSection {
                node_id: node.id.clone(),
                markdown_body: body,
                used_citation_ids: Vec::new(),
            });
        }

        let candidates = self.bank.summaries(Some(candidate_ids.as_slice())).await;
        let mut draft = String::new();
        let mut steps = 0u32;
        let mut observation: Option<String> = None;
        let mut llm_failures = 0u32;
        let mut truncated = false;

        'steps: while steps < self.config.max_steps_per_section {
            steps += 1;
            let chars_left = self.config.max_chars_per_section.saturating_sub(draft.len());

            let mut action = None;
            for _attempt in 0..=self.protocol_retries {
                let request = ChatRequest::new(
                    prompts::writer_system(),
                    prompts::writer_user(
                        user_query,
                        section_map,
                        &path_titles,
                        &node.bullets,
                        &candidates,
                        &draft,
                        self.config.max_steps_per_section - steps + 1,
                        chars_left,
                        observation.as_deref(),
                    ),
                );
                let response = match self.llm.complete(&request).await {
                    Ok(response) => response,
                    Err(e) => {
                        tracing::warn!("writer LLM call failed: {}", e);
                        self.journal.append(
                            EventKind::Error,
                            serde_json::json!({ "scope": "writer_llm", "section_id": node.id, "detail": e.to_string() }),
                        )?;
                        llm_failures += 1;
                        if llm_failures >= 2 {
                            break 'steps;
                        }
                        continue 'steps;
                    }
                };
                llm_failures = 0;
                match protocol::parse_writer_action(&response.content) {
                    Ok(parsed) => {
                        self.journal.append(
                            EventKind::WriterStep,
                            serde_json::json!({
                                "section_id": node.id,
                                "step": steps,
                                "action": action_label(&parsed),
                                "usage": response.usage,
                            }),
                        )?;
                        action = Some(parsed);
                        break;
                    }
                    Err(protocol_error) => {
                        self.journal.append(
                            EventKind::Error,
                            serde_json::json!({
                                "scope": "writer_protocol",
                                "section_id": node.id,
                                "detail": protocol_error.to_string(),
                            }),
                        )?;
                        observation = Some(protocol_error.corrective_observation());
                    }
                }
            }
            // Retries exhausted without a parseable action: give up on the
            // loop and let the fallback generation cover the section.
            let Some(action) = action else { break };

            match action {
                WriterAction::Retrieve {
                    query,
                    top_k,
                    citation_ids,
                } => {
                    observation = Some(
                        self.handle_retrieve(
                            &node.id,
                            query,
                            top_k,
                            citation_ids,
                            &candidate_ids,
                            used_global,
                        )
                        .await?,
                    );
                }
                WriterAction::Write { markdown } => {
                    if !draft.is_empty() {
                        draft.push_str("\n\n");
                    }
                    draft.push_str(markdown.trim());
                    if draft.len() > self.config.max_chars_per_section {
                        truncate_at_boundary(&mut draft, self.config.max_chars_per_section);
                        truncated = true;
                        tracing::warn!("section {} hit its character cap, sealing", node.id);
                        break;
                    }
                    observation = Some(format!(
                        "Appended {} characters. {} remain. Continue or <terminate>.",
                        markdown.len(),
                        self.config.max_chars_per_section.saturating_sub(draft.len()),
                    ));
                }
                WriterAction::Terminate { .. } => break,
            }
        }

        if truncated {
            self.journal.append(
                EventKind::Error,
                serde_json::json!({ "scope": "writer_budget", "section_id": node.id, "detail": "character cap reached" }),
            )?;
        }

        if draft.is_empty() {
            draft = self
                .fallback_generation(user_query, &path_titles, &node.bullets, &candidate_ids)
                .await?;
        }

        // Only IDs that resolve in the bank become citations; the model may
        // have referenced an ID it never retrieved.
        let mut used = Vec::new();
        for id in protocol::footnote_refs(&draft) {
            if self.bank.get(&id).await.is_some() {
                used.push(id);
            }
        }

        Ok(ReportSection {
            node_id: node.id.clone(),
            markdown_body: draft,
            used_citation_ids: used,
        })
    }

    /// Serve a `retrieve` action and return the observation text.
    async fn handle_retrieve(
        &self,
        section_id: &str,
        query: Option<String>,
        top_k: Option<usize>,
        citation_ids: Vec<String>,
        candidate_ids: &[String],
        used_global: &BTreeSet<String>,
    ) -> Result<String, WriterError> {
        let (served, reused): (Vec<Evidence>, Vec<String>) = if !citation_ids.is_empty() {
            // Explicit by-id requests are the sanctioned way to reuse
            // evidence another section already consumed.
            let mut served = Vec::new();
            let mut reused = Vec::new();
            for id in &citation_ids {
                if let Some(evidence) = self.bank.get(id).await {
                    if used_global.contains(id) {
                        reused.push(id.clone());
                    }
                    served.push(evidence);
                }
            }
            (served, reused)
        } else {
            let query = query.unwrap_or_default();
            let k = top_k.unwrap_or(5);
            let pool: Vec<String> = candidate_ids
                .iter()
                .filter(|id| self.config.allow_evidence_reuse || !used_global.contains(*id))
                .cloned()
                .collect();
            let summaries = self.bank.summaries(Some(pool.as_slice())).await;
            let mut scored: Vec<(usize, &(String, String, String))> = summaries
                .iter()
                .map(|entry| (lexical_overlap(&query, &entry.2), entry))
                .collect();
            scored.sort_by(|a, b| b.0.cmp(&a.0));
            let mut served = Vec::new();
            for (_, (id, _, _)) in scored.into_iter().take(k) {
                if let Some(evidence) = self.bank.get(id).await {
                    served.push(evidence);
                }
            }
            (served, Vec::new())
        };

        self.journal.append(
            EventKind::SectionRetrieved,
            serde_json::json!({
                "section_id": section_id,
                "ids": served.iter().map(|e| e.id.clone()).collect::<Vec<_>>(),
                "reused": reused,
            }),
        )?;

        if served.is_empty() {
            return Ok(
                "No evidence matched that request. Unconsumed candidate IDs may be \
                 retrieved by explicit citation_ids."
                    .to_string(),
            );
        }
        Ok(render_evidence_blocks(&served))
    }

    /// Prose-only body for a section no evidence supports.
    async fn unsupported_section(
        &self,
        user_query: &str,
        path_titles: &[String],
        bullets: &[String],
    ) -> Result<String, WriterError> {
        let request = ChatRequest::new(
            prompts::writer_system(),
            prompts::fallback_section_user(user_query, path_titles, bullets, ""),
        );
        let body = match self.llm.complete(&request).await {
            Ok(response) => {
                let content = response.content.trim().to_string();
                strip_action_tags(&content)
            }
            Err(e) => {
                tracing::warn!("unsupported-section generation failed: {}", e);
                String::new()
            }
        };
        if body.is_empty() {
            Ok(UNSUPPORTED_NOTE.to_string())
        } else {
            Ok(format!("{}\n\n{}", body, UNSUPPORTED_NOTE))
        }
    }

    /// One-shot generation used when the loop never produced a `<write>`.
    async fn fallback_generation(
        &self,
        user_query: &str,
        path_titles: &[String],
        bullets: &[String],
        candidate_ids: &[String],
    ) -> Result<String, WriterError> {
        let evidence = match self.bank.bulk_get(candidate_ids).await {
            Ok(evidence) => evidence,
            Err(_) => Vec::new(),
        };
        let blocks = render_evidence_blocks(&evidence);
        let request = ChatRequest::new(
            prompts::writer_system(),
            prompts::fallback_section_user(user_query, path_titles, bullets, &blocks),
        );
        match self.llm.complete(&request).await {
            Ok(response) => {
                let body = strip_action_tags(response.content.trim());
                if body.is_empty() {
                    self.journal.append(
                        EventKind::Error,
                        serde_json::json!({ "scope": "writer_fallback", "detail": "empty fallback generation" }),
                    )?;
                    Ok(OMITTED_SECTION_BODY.to_string())
                } else {
                    Ok(body)
                }
            }
            Err(e) => {
                self.journal.append(
                    EventKind::Error,
                    serde_json::json!({ "scope": "writer_fallback", "detail": e.to_string() }),
                )?;
                Ok(OMITTED_SECTION_BODY.to_string())
            }
        }
    }
}

fn action_label(action: &WriterAction) -> &'static str {
    match action {
        WriterAction::Retrieve { .. } => "retrieve",
        WriterAction::Write { .. } => "write",
        WriterAction::Terminate { .. } => "terminate",
    }
}

/// The fallback prompt asks for plain prose, but a model primed on the
/// action grammar may still wrap its reply in a `<write>` tag.
fn strip_action_tags(text: &str) -> String {
    match protocol::parse_raw(text) {
        Ok(protocol::RawAction::Write { markdown }) => markdown,
        _ => text.to_string(),
    }
}

/// Case-insensitive term overlap between a query and a summary.
fn lexical_overlap(query: &str, summary: &str) -> usize {
    let summary_lower = summary.to_lowercase();
    query
        .to_lowercase()
        .split_whitespace()
        .filter(|term| term.len() > 2 && summary_lower.contains(*term))
        .count()
}

/// Full-content evidence rendering served to the writer on retrieval.
fn render_evidence_blocks(evidence: &[Evidence]) -> String {
    let mut out = String::new();
    for record in evidence {
        out.push_str(&format!(
            "[{}] {} ({})\nSummary: {}\n",
            record.id, record.source.title, record.source.url, record.summary
        ));
        for item in &record.items {
            out.push_str(&format!(
                "  - {:?}: {} (confidence {:.2})\n",
                item.item_type, item.content, item.confidence
            ));
        }
        out.push('\n');
    }
    out
}

/// Concatenate sections in outline order and append the References list in
/// first-use order.
pub async fn assemble_report(
    outline: &Outline,
    sections: &[ReportSection],
    bank: &EvidenceBank,
    write_level: u8,
) -> String {
    let targets = outline.write_targets(write_level);
    let mut out = String::new();

    if let Some(root) = outline.roots.first() {
        if targets.first().map(|t| t.id != root.id).unwrap_or(false) {
            out.push_str(&format!("# {}\n\n", root.title));
        }
    }

    let mut reference_order: Vec<String> = Vec::new();
    for target in &targets {
        let Some(section) = sections.iter().find(|s| s.node_id == target.id) else {
            continue;
        };
        out.push_str(&format!(
            "{} {}\n\n{}\n\n",
            "#".repeat(target.level as usize),
            target.title,
            section.markdown_body.trim()
        ));
        for id in &section.used_citation_ids {
            if !reference_order.contains(id) {
                reference_order.push(id.clone());
            }
        }
    }

    if !reference_order.is_empty() {
        out.push_str("## References\n\n");
        for id in &reference_order {
            if let Some(evidence) = bank.get(id).await {
                out.push_str(&format!("{}\n", format_reference(&evidence)));
            }
        }
    }

    out.trim_end().to_string() + "\n"
}

/// `[^ev_NNNN]: <title> — <publisher?> (<date?>). <url>`
pub fn format_reference(evidence: &Evidence) -> String {
    let mut entry = format!("[^{}]: {}", evidence.id, evidence.source.title);
    if let Some(ref publisher) = evidence.source.publisher {
        entry.push_str(&format!(" — {}", publisher));
    }
    if let Some(ref date) = evidence.source.published_at {
        entry.push_str(&format!(" ({})", date));
    }
    entry.push_str(&format!(". {}", evidence.source.url));
    entry
}

fn truncate_at_boundary(text: &mut String, cap: usize) {
    let mut cut = cap.min(text.len());
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text.truncate(cut);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evidence::{EvidenceItem, EvidenceItemType, SourceMeta};

    fn evidence(id: &str, title: &str, publisher: Option<&str>, date: Option<&str>) -> Evidence {
        Evidence {
            id: id.into(),
            query: "q".into(),
            source: SourceMeta {
                url: format!("https://example.com/{}", id),
                title: title.into(),
                publisher: publisher.map(|s| s.into()),
                author: None,
                published_at: date.map(|s| s.into()),
                retrieved_at: chrono::Utc::now(),
            },
            summary: "summary".into(),
            items: vec![EvidenceItem {
                item_type: EvidenceItemType::Data,
                content: "42".into(),
                location: None,
                confidence: 0.9,
            }],
            raw_ref: None,
            hash: id.into(),
        }
    }

    #[test]
    fn test_format_reference_variants() {
        let full = evidence("ev_0001", "A Study", Some("Nature"), Some("2024-01-01"));
        assert_eq!(
            format_reference(&full),
            "[^ev_0001]: A Study — Nature (2024-01-01). https://example.com/ev_0001"
        );

        let bare = evidence("ev_0002", "A Post", None, None);
        assert_eq!(
            format_reference(&bare),
            "[^ev_0002]: A Post. https://example.com/ev_0002"
        );
    }

    #[test]
    fn test_lexical_overlap() {
        assert_eq!(
            lexical_overlap("quantum repeater loss", "Loss budgets for quantum repeaters"),
            2
        );
        assert_eq!(lexical_overlap("a an of", "anything"), 0);
    }

    #[test]
    fn test_render_evidence_blocks() {
        let blocks = render_evidence_blocks(&[evidence("ev_0001", "T", None, None)]);
        assert!(blocks.contains("[ev_0001] T"));
        assert!(blocks.contains("Summary: summary"));
        assert!(blocks.contains("42"));
    }

    #[test]
    fn test_strip_action_tags() {
        assert_eq!(strip_action_tags("<write>The body.</write>"), "The body.");
        assert_eq!(strip_action_tags("Plain prose."), "Plain prose.");
    }

    #[test]
    fn test_truncate_at_boundary() {
        let mut text = String::from("αβγδε");
        // Byte 3 is mid-character; truncation backs off to a boundary.
        truncate_at_boundary(&mut text, 3);
        assert_eq!(text, "α");
    }

    #[tokio::test]
    async fn test_assemble_report_orders_and_references() {
        let dir = tempfile::tempdir().unwrap();
        let bank = EvidenceBank::open_replayed(
            dir.path(),
            &[
                evidence("ev_0001", "First Source", Some("Pub"), None),
                evidence("ev_0002", "Second Source", None, None),
            ],
        )
        .unwrap();

        let outline = Outline::parse(
            "# Report\n## Alpha <citation>ev_0001</citation>\n## Beta <citation>ev_0002</citation>\n",
        )
        .unwrap();
        let sections = vec![
            ReportSection {
                node_id: "sec_1_2".into(),
                markdown_body: "Beta body[^ev_0002].".into(),
                used_citation_ids: vec!["ev_0002".into()],
            },
            ReportSection {
                node_id: "sec_1_1".into(),
                markdown_body: "Alpha body[^ev_0001].".into(),
                used_citation_ids: vec!["ev_0001".into()],
            },
        ];

        let report = assemble_report(&outline, &sections, &bank, 2).await;
        let alpha_pos = report.find("## Alpha").unwrap();
        let beta_pos = report.find("## Beta").unwrap();
        assert!(alpha_pos < beta_pos);
        assert!(report.starts_with("# Report"));
        assert!(report.contains("## References"));
        let ref1 = report.find("[^ev_0001]: First Source — Pub.").unwrap();
        let ref2 = report.find("[^ev_0002]: Second Source.").unwrap();
        assert!(ref1 < ref2);
    }
}

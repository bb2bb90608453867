//! Action protocol: the tagged grammar agents speak
//!
//! Agents emit free-form text containing exactly one top-level action tag
//! per turn. The parser scans for the earliest opening tag and takes the
//! first whose body is valid; prose outside any tag is discarded. Malformed
//! payloads become typed `ProtocolError` values whose corrective text is
//! returned to the agent as its next observation.
//!
//! Grammar (case-sensitive, no nesting of distinct action tags):
//!
//! ```text
//! <tool_call>{"name": ..., "arguments": {...}}</tool_call>
//! <write_outline> markdown with <citation>id,id</citation> spans </write_outline>
//! <write> section markdown with [^ev_NNNN] footnotes </write>
//! <terminate> reason </terminate>
//! ```

use regex::Regex;
use std::collections::BTreeSet;
use std::sync::OnceLock;

/// A raw action extracted from agent text, before per-agent validation.
#[derive(Debug, Clone, PartialEq)]
pub enum RawAction {
    ToolCall {
        name: String,
        arguments: serde_json::Value,
    },
    WriteOutline {
        markdown: String,
    },
    Write {
        markdown: String,
    },
    Terminate {
        reason: String,
    },
}

/// Actions the planner may take.
#[derive(Debug, Clone, PartialEq)]
pub enum PlannerAction {
    Search { queries: Vec<String>, goal: String },
    WriteOutline { markdown: String },
    Terminate { reason: String },
}

/// Actions the writer may take.
#[derive(Debug, Clone, PartialEq)]
pub enum WriterAction {
    Retrieve {
        query: Option<String>,
        top_k: Option<usize>,
        citation_ids: Vec<String>,
    },
    Write {
        markdown: String,
    },
    Terminate {
        reason: String,
    },
}

/// Protocol violations. Non-terminal: the corrective text goes back to the
/// agent as its next-turn observation.
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum ProtocolError {
    #[error("no action tag found in response")]
    MissingAction,
    #[error("malformed tool_call JSON: {0}")]
    MalformedJson(String),
    #[error("unknown tool '{0}'")]
    UnknownTool(String),
    #[error("invalid arguments for '{tool}': {detail}")]
    InvalidArguments { tool: String, detail: String },
    #[error("tag <{0}> is not available to this agent")]
    ForbiddenTag(String),
    #[error("outline cites unknown evidence: {}", ids.join(", "))]
    UnresolvedCitation { ids: Vec<String> },
}

impl ProtocolError {
    /// Observation text fed back to the agent so it can self-correct.
    pub fn corrective_observation(&self) -> String {
        match self {
            ProtocolError::MissingAction => {
                "Your response contained no action. Reply with exactly one action tag: \
                 <tool_call>{\"name\": ..., \"arguments\": {...}}</tool_call>, a write tag, \
                 or <terminate>reason</terminate>."
                    .to_string()
            }
            ProtocolError::UnresolvedCitation { ids } => format!(
                "Your outline cites evidence IDs that do not exist: {}. \
                 Only cite IDs from the evidence list you were given.",
                ids.join(", ")
            ),
            other => format!("Your previous action was rejected: {}. Emit one valid action tag.", other),
        }
    }
}

fn tag_regex(tag: &str) -> Regex {
    Regex::new(&format!(r"(?s)<{tag}>(.*?)</{tag}>")).unwrap()
}

fn protocol_regexes() -> &'static [(&'static str, Regex)] {
    static REGEXES: OnceLock<Vec<(&'static str, Regex)>> = OnceLock::new();
    REGEXES.get_or_init(|| {
        vec![
            ("tool_call", tag_regex("tool_call")),
            ("write_outline", tag_regex("write_outline")),
            ("write", tag_regex("write")),
            ("terminate", tag_regex("terminate")),
        ]
    })
}

/// Extract the first valid top-level action tag from agent output.
///
/// Candidate tags are ordered by byte offset; the earliest one with a valid
/// body wins. If every candidate is invalid, the error from the earliest
/// candidate is returned.
pub fn parse_raw(text: &str) -> Result<RawAction, ProtocolError> {
    let mut candidates: Vec<(usize, &str, String)> = Vec::new();
    for (tag, re) in protocol_regexes() {
        for capture in re.captures_iter(text) {
            let whole = capture.get(0).unwrap();
            let body = capture.get(1).unwrap().as_str().to_string();
            candidates.push((whole.start(), *tag, body));
        }
    }
    if candidates.is_empty() {
        return Err(ProtocolError::MissingAction);
    }
    candidates.sort_by_key(|(start, _, _)| *start);

    let mut first_error: Option<ProtocolError> = None;
    for (_, tag, body) in candidates {
        match parse_tag_body(tag, &body) {
            Ok(action) => return Ok(action),
            Err(e) => {
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
    }
    Err(first_error.unwrap_or(ProtocolError::MissingAction))
}

fn parse_tag_body(tag: &str, body: &str) -> Result<RawAction, ProtocolError> {
    match tag {
        "tool_call" => {
            let value: serde_json::Value = serde_json::from_str(body.trim())
                .map_err(|e| ProtocolError::MalformedJson(e.to_string()))?;
            let name = value
                .get("name")
                .and_then(|n| n.as_str())
                .ok_or_else(|| ProtocolError::MalformedJson("missing 'name' field".into()))?
                .to_string();
            let arguments = value
                .get("arguments")
                .cloned()
                .unwrap_or(serde_json::Value::Object(Default::default()));
            Ok(RawAction::ToolCall { name, arguments })
        }
        "write_outline" => Ok(RawAction::WriteOutline {
            markdown: body.trim().to_string(),
        }),
        "write" => Ok(RawAction::Write {
            markdown: body.trim().to_string(),
        }),
        "terminate" => Ok(RawAction::Terminate {
            reason: body.trim().to_string(),
        }),
        _ => unreachable!("unknown protocol tag"),
    }
}

/// Validate a raw action against the planner's action set.
pub fn parse_planner_action(text: &str) -> Result<PlannerAction, ProtocolError> {
    match parse_raw(text)? {
        RawAction::ToolCall { name, arguments } => match name.as_str() {
            "search" => {
                let queries = arguments
                    .get("queries")
                    .and_then(|q| q.as_array())
                    .map(|arr| {
                        arr.iter()
                            .filter_map(|v| v.as_str().map(|s| s.trim().to_string()))
                            .filter(|s| !s.is_empty())
                            .collect::<Vec<_>>()
                    })
                    .unwrap_or_default();
                if queries.is_empty() {
                    return Err(ProtocolError::InvalidArguments {
                        tool: "search".into(),
                        detail: "'queries' must be a non-empty array of strings".into(),
                    });
                }
                let goal = arguments
                    .get("goal")
                    .and_then(|g| g.as_str())
                    .unwrap_or("")
                    .to_string();
                Ok(PlannerAction::Search { queries, goal })
            }
            other => Err(ProtocolError::UnknownTool(other.to_string())),
        },
        RawAction::WriteOutline { markdown } => Ok(PlannerAction::WriteOutline { markdown }),
        RawAction::Write { .. } => Err(ProtocolError::ForbiddenTag("write".into())),
        RawAction::Terminate { reason } => Ok(PlannerAction::Terminate { reason }),
    }
}

/// Validate a raw action against the writer's action set.
pub fn parse_writer_action(text: &str) -> Result<WriterAction, ProtocolError> {
    match parse_raw(text)? {
        RawAction::ToolCall { name, arguments } => match name.as_str() {
            "retrieve" => {
                let query = arguments
                    .get("query")
                    .and_then(|q| q.as_str())
                    .map(|s| s.to_string());
                let top_k = arguments
                    .get("top_k")
                    .and_then(|k| k.as_u64())
                    .map(|k| k as usize);
                let citation_ids = arguments
                    .get("citation_ids")
                    .and_then(|c| c.as_array())
                    .map(|arr| {
                        arr.iter()
                            .filter_map(|v| v.as_str().map(|s| s.to_string()))
                            .collect::<Vec<_>>()
                    })
                    .unwrap_or_default();
                if query.is_none() && citation_ids.is_empty() {
                    return Err(ProtocolError::InvalidArguments {
                        tool: "retrieve".into(),
                        detail: "provide 'query' or 'citation_ids'".into(),
                    });
                }
                Ok(WriterAction::Retrieve {
                    query,
                    top_k,
                    citation_ids,
                })
            }
            other => Err(ProtocolError::UnknownTool(other.to_string())),
        },
        RawAction::Write { markdown } => Ok(WriterAction::Write { markdown }),
        RawAction::WriteOutline { .. } => Err(ProtocolError::ForbiddenTag("write_outline".into())),
        RawAction::Terminate { reason } => Ok(WriterAction::Terminate { reason }),
    }
}

/// Render a tool call in the wire form agents are instructed to emit.
/// Exact inverse of the parser, used by round-trip tests and prompts.
pub fn render_tool_call(name: &str, arguments: &serde_json::Value) -> String {
    format!(
        "<tool_call>{}</tool_call>",
        serde_json::json!({ "name": name, "arguments": arguments })
    )
}

pub fn render_write_outline(markdown: &str) -> String {
    format!("<write_outline>\n{}\n</write_outline>", markdown)
}

pub fn render_write(markdown: &str) -> String {
    format!("<write>\n{}\n</write>", markdown)
}

pub fn render_terminate(reason: &str) -> String {
    format!("<terminate>{}</terminate>", reason)
}

/// Parse a `<citation>ev_0001,ev_0002</citation>` body into an ID set.
pub fn parse_citation_list(body: &str) -> BTreeSet<String> {
    body.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// `[^ev_NNNN]` footnote references in a markdown body, in first-use order.
pub fn footnote_refs(markdown: &str) -> Vec<String> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"\[\^(ev_\d{4})\](:)?").unwrap());
    let mut seen = BTreeSet::new();
    let mut out = Vec::new();
    for capture in re.captures_iter(markdown) {
        // A trailing colon marks a footnote definition, not a body use.
        if capture.get(2).is_some() {
            continue;
        }
        let id = capture.get(1).unwrap().as_str().to_string();
        if seen.insert(id.clone()) {
            out.push(id);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tool_call() {
        let text = r#"Let me search for more.
<tool_call>{"name": "search", "arguments": {"queries": ["rust async"], "goal": "background"}}</tool_call>"#;
        let action = parse_planner_action(text).unwrap();
        assert_eq!(
            action,
            PlannerAction::Search {
                queries: vec!["rust async".into()],
                goal: "background".into()
            }
        );
    }

    #[test]
    fn test_prose_outside_tags_discarded() {
        let text = "Thinking aloud here...\n<terminate>enough evidence</terminate>\ntrailing prose";
        assert_eq!(
            parse_raw(text).unwrap(),
            RawAction::Terminate {
                reason: "enough evidence".into()
            }
        );
    }

    #[test]
    fn test_first_valid_tag_wins() {
        let text = "<terminate>first</terminate><write>second</write>";
        assert_eq!(
            parse_raw(text).unwrap(),
            RawAction::Terminate {
                reason: "first".into()
            }
        );
    }

    #[test]
    fn test_malformed_first_tag_falls_through_to_valid_later_tag() {
        let text = r#"<tool_call>{not json}</tool_call> <terminate>ok</terminate>"#;
        assert_eq!(
            parse_raw(text).unwrap(),
            RawAction::Terminate { reason: "ok".into() }
        );
    }

    #[test]
    fn test_malformed_json_rejected() {
        let text = r#"<tool_call>{"name": "search", }</tool_call>"#;
        assert!(matches!(
            parse_raw(text),
            Err(ProtocolError::MalformedJson(_))
        ));
    }

    #[test]
    fn test_missing_action() {
        assert_eq!(
            parse_raw("no tags anywhere").unwrap_err(),
            ProtocolError::MissingAction
        );
    }

    #[test]
    fn test_write_outline_not_confused_with_write() {
        let text = "<write_outline># Outline</write_outline>";
        assert_eq!(
            parse_raw(text).unwrap(),
            RawAction::WriteOutline {
                markdown: "# Outline".into()
            }
        );
    }

    #[test]
    fn test_planner_rejects_writer_tags() {
        assert!(matches!(
            parse_planner_action("<write>body</write>"),
            Err(ProtocolError::ForbiddenTag(_))
        ));
        assert!(matches!(
            parse_writer_action("<write_outline># x</write_outline>"),
            Err(ProtocolError::ForbiddenTag(_))
        ));
    }

    #[test]
    fn test_unknown_tool() {
        let text = r#"<tool_call>{"name": "browse", "arguments": {}}</tool_call>"#;
        assert!(matches!(
            parse_planner_action(text),
            Err(ProtocolError::UnknownTool(_))
        ));
    }

    #[test]
    fn test_search_requires_queries() {
        let text = r#"<tool_call>{"name": "search", "arguments": {"queries": []}}</tool_call>"#;
        assert!(matches!(
            parse_planner_action(text),
            Err(ProtocolError::InvalidArguments { .. })
        ));
    }

    #[test]
    fn test_retrieve_variants() {
        let by_query = r#"<tool_call>{"name": "retrieve", "arguments": {"query": "costs", "top_k": 3}}</tool_call>"#;
        assert_eq!(
            parse_writer_action(by_query).unwrap(),
            WriterAction::Retrieve {
                query: Some("costs".into()),
                top_k: Some(3),
                citation_ids: vec![]
            }
        );

        let by_ids = r#"<tool_call>{"name": "retrieve", "arguments": {"citation_ids": ["ev_0001", "ev_0002"]}}</tool_call>"#;
        assert_eq!(
            parse_writer_action(by_ids).unwrap(),
            WriterAction::Retrieve {
                query: None,
                top_k: None,
                citation_ids: vec!["ev_0001".into(), "ev_0002".into()]
            }
        );

        let empty = r#"<tool_call>{"name": "retrieve", "arguments": {}}</tool_call>"#;
        assert!(matches!(
            parse_writer_action(empty),
            Err(ProtocolError::InvalidArguments { .. })
        ));
    }

    #[test]
    fn test_round_trip_tool_call() {
        let args = serde_json::json!({"queries": ["a", "b"], "goal": "g"});
        let rendered = render_tool_call("search", &args);
        let parsed = parse_planner_action(&rendered).unwrap();
        assert_eq!(
            parsed,
            PlannerAction::Search {
                queries: vec!["a".into(), "b".into()],
                goal: "g".into()
            }
        );
    }

    #[test]
    fn test_round_trip_terminate_and_write() {
        assert_eq!(
            parse_raw(&render_terminate("done")).unwrap(),
            RawAction::Terminate { reason: "done".into() }
        );
        assert_eq!(
            parse_raw(&render_write("## Body")).unwrap(),
            RawAction::Write { markdown: "## Body".into() }
        );
        assert_eq!(
            parse_raw(&render_write_outline("# O")).unwrap(),
            RawAction::WriteOutline { markdown: "# O".into() }
        );
    }

    #[test]
    fn test_citation_list() {
        let ids = parse_citation_list(" ev_0001, ev_0002 ,ev_0001,");
        assert_eq!(ids.len(), 2);
        assert!(ids.contains("ev_0001"));
        assert!(ids.contains("ev_0002"));
    }

    #[test]
    fn test_footnote_refs_order_and_dedup() {
        let body = "First[^ev_0002] then[^ev_0001][^ev_0003] and again[^ev_0002].";
        assert_eq!(footnote_refs(body), vec!["ev_0002", "ev_0001", "ev_0003"]);
    }

    #[test]
    fn test_footnote_refs_skip_definitions() {
        let body = "Use[^ev_0001].\n\n[^ev_0002]: Some Title. https://e.com";
        assert_eq!(footnote_refs(body), vec!["ev_0001"]);
    }
}

//! Prompt construction for the planner and writer agents
//!
//! Prompts are rebuilt from scratch every step; nothing is carried between
//! turns except what these builders are explicitly given. Raw page text
//! never appears in an agent prompt, only bank summaries.

use crate::search::SearchHit;

/// Cap applied to page text embedded in summarization prompts.
const PAGE_TEXT_CAP: usize = 6000;

fn truncate(text: &str, cap: usize) -> &str {
    match text.char_indices().nth(cap) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

pub fn planner_system() -> String {
    "You are the research planner of a deep-research system. Each turn you take \
     exactly one action, emitted as a single tag:\n\
     <tool_call>{\"name\": \"search\", \"arguments\": {\"queries\": [\"...\"], \"goal\": \"...\"}}</tool_call> \
     to gather web evidence;\n\
     <write_outline>...markdown...</write_outline> to commit the report outline, using \
     headings (#, ##, ###), '-' bullets, and <citation>ev_0001,ev_0002</citation> spans \
     to bind evidence to headings or bullets;\n\
     <terminate>reason</terminate> when the outline is complete and well supported.\n\
     Cite only evidence IDs from the list you are shown. Avoid repeating past search \
     queries. Text outside the tag is ignored."
        .to_string()
}

#[allow(clippy::too_many_arguments)]
pub fn planner_user(
    user_query: &str,
    round: u32,
    evidence_count: usize,
    outline_md: Option<&str>,
    summaries: &[(String, String, String)],
    past_queries: &[String],
    nudge_ready: bool,
    observation: Option<&str>,
) -> String {
    let mut out = String::new();
    out.push_str(&format!("Research question: {}\n\n", user_query));
    out.push_str(&format!(
        "Status: round {}, {} evidence records collected.\n\n",
        round, evidence_count
    ));

    match outline_md {
        Some(md) => {
            out.push_str("Current outline:\n");
            out.push_str(md);
            out.push_str("\n\n");
        }
        None => out.push_str("No outline committed yet.\n\n"),
    }

    if summaries.is_empty() {
        out.push_str("Evidence bank is empty.\n\n");
    } else {
        out.push_str("Evidence bank (id | url | summary):\n");
        for (id, url, summary) in summaries {
            out.push_str(&format!("{} | {} | {}\n", id, url, summary));
        }
        out.push('\n');
    }

    if !past_queries.is_empty() {
        out.push_str("Already searched (do not repeat):\n");
        for query in past_queries {
            out.push_str(&format!("- {}\n", query));
        }
        out.push('\n');
    }

    if nudge_ready {
        out.push_str(
            "The outline is committed, every leaf is cited, and evidence coverage is \
             sufficient. If nothing substantial is missing, emit <terminate>.\n\n",
        );
    }

    if let Some(observation) = observation {
        out.push_str(&format!("Observation: {}\n\n", observation));
    }

    out.push_str("Emit exactly one action.");
    out
}

pub fn url_filter_system() -> String {
    "You select which search results are worth fetching for a research goal. \
     Reply with a JSON array of the chosen URLs, best first, nothing else."
        .to_string()
}

pub fn url_filter_user(user_query: &str, goal: &str, hits: &[SearchHit], max_keep: usize) -> String {
    let mut out = format!(
        "Research question: {}\nSearch goal: {}\n\nCandidates:\n",
        user_query, goal
    );
    for (i, hit) in hits.iter().enumerate() {
        out.push_str(&format!(
            "{}. {} | {} | {}\n",
            i + 1,
            hit.title,
            hit.url,
            truncate(&hit.snippet, 300)
        ));
    }
    out.push_str(&format!(
        "\nReturn at most {} URLs as a JSON array of strings.",
        max_keep
    ));
    out
}

pub fn page_summary_system() -> String {
    "You summarize a web page for a specific research question. Write a dense, \
     factual summary of at most 900 characters covering only material relevant \
     to the question. No preamble."
        .to_string()
}

pub fn page_summary_user(user_query: &str, title: &str, text: &str) -> String {
    format!(
        "Research question: {}\n\nPage title: {}\n\nPage text:\n{}",
        user_query,
        title,
        truncate(text, PAGE_TEXT_CAP)
    )
}

pub fn page_items_system() -> String {
    "You extract structured evidence items from a web page for a research \
     question. Reply with a JSON array; each element is \
     {\"type\": \"quote\"|\"data\"|\"definition\"|\"claim\"|\"case\", \
     \"content\": \"...\", \"location\": \"optional section hint\", \
     \"confidence\": 0.0-1.0}. At most 8 items, nothing but the JSON."
        .to_string()
}

pub fn page_items_user(user_query: &str, text: &str) -> String {
    format!(
        "Research question: {}\n\nPage text:\n{}",
        user_query,
        truncate(text, PAGE_TEXT_CAP)
    )
}

pub fn writer_system() -> String {
    "You write one section of a long research report. Each turn you take exactly \
     one action, emitted as a single tag:\n\
     <tool_call>{\"name\": \"retrieve\", \"arguments\": {\"query\": \"...\", \"top_k\": 5}}</tool_call> \
     or <tool_call>{\"name\": \"retrieve\", \"arguments\": {\"citation_ids\": [\"ev_0001\"]}}</tool_call> \
     to read evidence in full;\n\
     <write>...markdown...</write> to append prose to the section, citing evidence \
     inline as [^ev_0001] footnote references;\n\
     <terminate>reason</terminate> when the section is finished.\n\
     Use only the candidate evidence you are shown. Do not write headings for other \
     sections. Text outside the tag is ignored."
        .to_string()
}

#[allow(clippy::too_many_arguments)]
pub fn writer_user(
    user_query: &str,
    section_map: &str,
    path_titles: &[String],
    bullets: &[String],
    candidates: &[(String, String, String)],
    draft: &str,
    steps_left: u32,
    chars_left: usize,
    observation: Option<&str>,
) -> String {
    let mut out = String::new();
    out.push_str(&format!("Research question: {}\n\n", user_query));
    out.push_str("Full report outline (for orientation only):\n");
    out.push_str(section_map);
    out.push('\n');
    out.push_str(&format!("You are writing: {}\n", path_titles.join(" > ")));
    if !bullets.is_empty() {
        out.push_str("Planning notes for this section:\n");
        for bullet in bullets {
            out.push_str(&format!("- {}\n", bullet));
        }
    }
    out.push('\n');

    if candidates.is_empty() {
        out.push_str("No evidence is bound to this section.\n\n");
    } else {
        out.push_str("Candidate evidence (id | url | summary):\n");
        for (id, url, summary) in candidates {
            out.push_str(&format!("{} | {} | {}\n", id, url, truncate(summary, 200)));
        }
        out.push('\n');
    }

    if draft.is_empty() {
        out.push_str("Section draft is empty.\n\n");
    } else {
        out.push_str("Section draft so far:\n");
        out.push_str(draft);
        out.push_str("\n\n");
    }

    out.push_str(&format!(
        "Budget: {} steps and {} characters remain for this section.\n\n",
        steps_left, chars_left
    ));

    if let Some(observation) = observation {
        out.push_str(&format!("Observation: {}\n\n", observation));
    }

    out.push_str("Emit exactly one action.");
    out
}

/// One-shot prompt used when the section loop never produced a `<write>`.
pub fn fallback_section_user(
    user_query: &str,
    path_titles: &[String],
    bullets: &[String],
    evidence_blocks: &str,
) -> String {
    let mut out = format!(
        "Research question: {}\n\nWrite the complete body of the report section \
         \"{}\" in one reply. Markdown prose only, no section heading. Cite evidence \
         inline as [^ev_NNNN].\n",
        user_query,
        path_titles.join(" > ")
    );
    if !bullets.is_empty() {
        out.push_str("Planning notes:\n");
        for bullet in bullets {
            out.push_str(&format!("- {}\n", bullet));
        }
    }
    if !evidence_blocks.is_empty() {
        out.push_str("\nEvidence:\n");
        out.push_str(evidence_blocks);
    }
    out
}

pub fn judge_system() -> String {
    "You grade research report outlines. Reply with a JSON object keyed by \
     criterion name; each value is {\"rating\": 0-10, \"justification\": \"...\"}. \
     Grade exactly these criteria: InstructionFollowing, Depth, Balance, Breadth, \
     Support, Insightfulness. Nothing but the JSON."
        .to_string()
}

pub fn judge_user(user_query: &str, outline_md: &str) -> String {
    format!(
        "Research question: {}\n\nOutline:\n{}",
        user_query, outline_md
    )
}

//! Report outline: typed AST with citation bindings
//!
//! The outline is the contract between the planner and the writer. Its
//! external form is Markdown with `<citation>` spans; the in-memory form is
//! a tree of `OutlineNode`s with path-based identifiers (`sec_1_2`). The
//! two forms round-trip losslessly up to structural equality: citations
//! attached to bullets fold into the owning node's citation set.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::OnceLock;

/// One node of the outline tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutlineNode {
    /// Path-based identifier, stable across re-parses (`sec_1_2_3`).
    pub id: String,
    pub title: String,
    /// Heading level 1-6.
    pub level: u8,
    /// Short planning notes for the writer.
    pub bullets: Vec<String>,
    /// Evidence IDs bound to this node.
    pub citations: BTreeSet<String>,
    pub children: Vec<OutlineNode>,
}

impl OutlineNode {
    /// Citations of this node and every descendant.
    pub fn subtree_citations(&self) -> BTreeSet<String> {
        let mut out = self.citations.clone();
        for child in &self.children {
            out.extend(child.subtree_citations());
        }
        out
    }

    fn visit<'a>(&'a self, f: &mut impl FnMut(&'a OutlineNode)) {
        f(self);
        for child in &self.children {
            child.visit(f);
        }
    }
}

/// The outline tree. A document may have several top-level headings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Outline {
    pub roots: Vec<OutlineNode>,
}

/// Outline parse/validation errors.
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum OutlineError {
    #[error("outline has no headings")]
    Empty,
    #[error("heading level skips from {parent} to {found} at '{title}'")]
    LevelSkip { parent: u8, found: u8, title: String },
}

fn citation_span_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<citation>([^<]*)</citation>").unwrap())
}

fn heading_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(#{1,6})\s+(.*)$").unwrap())
}

fn bullet_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*[-*]\s+(.*)$").unwrap())
}

/// Strip `<citation>` spans from a line, collecting the IDs they carry.
fn extract_citations(line: &str) -> (String, BTreeSet<String>) {
    let mut ids = BTreeSet::new();
    for capture in citation_span_re().captures_iter(line) {
        ids.extend(crate::protocol::parse_citation_list(&capture[1]));
    }
    let cleaned = citation_span_re().replace_all(line, "");
    (cleaned.trim().to_string(), ids)
}

impl Outline {
    /// Parse Markdown-with-tags into the AST, assigning path IDs.
    pub fn parse(markdown: &str) -> Result<Outline, OutlineError> {
        // (level, node) stack of open headings; finished subtrees fold into
        // their parent as the stack pops.
        let mut stack: Vec<OutlineNode> = Vec::new();
        let mut roots: Vec<OutlineNode> = Vec::new();

        fn close_into(stack: &mut Vec<OutlineNode>, roots: &mut Vec<OutlineNode>, level: u8) {
            while stack.last().is_some_and(|n| n.level >= level) {
                let done = stack.pop().unwrap();
                match stack.last_mut() {
                    Some(parent) => parent.children.push(done),
                    None => roots.push(done),
                }
            }
        }

        for line in markdown.lines() {
            if let Some(capture) = heading_re().captures(line) {
                let level = capture[1].len() as u8;
                let (title, citations) = extract_citations(&capture[2]);
                close_into(&mut stack, &mut roots, level);
                if let Some(parent) = stack.last() {
                    if level != parent.level + 1 {
                        return Err(OutlineError::LevelSkip {
                            parent: parent.level,
                            found: level,
                            title,
                        });
                    }
                }
                stack.push(OutlineNode {
                    id: String::new(),
                    title,
                    level,
                    bullets: Vec::new(),
                    citations,
                    children: Vec::new(),
                });
            } else if let Some(capture) = bullet_re().captures(line) {
                if let Some(node) = stack.last_mut() {
                    let (text, citations) = extract_citations(&capture[1]);
                    node.citations.extend(citations);
                    if !text.is_empty() {
                        node.bullets.push(text);
                    }
                }
            }
            // Plain prose between tags is planning chatter; dropped.
        }
        close_into(&mut stack, &mut roots, 0);

        if roots.is_empty() {
            return Err(OutlineError::Empty);
        }

        let mut outline = Outline { roots };
        outline.assign_ids();
        Ok(outline)
    }

    fn assign_ids(&mut self) {
        fn assign(node: &mut OutlineNode, path: &[usize]) {
            node.id = format!(
                "sec_{}",
                path.iter()
                    .map(|i| i.to_string())
                    .collect::<Vec<_>>()
                    .join("_")
            );
            for (i, child) in node.children.iter_mut().enumerate() {
                let mut child_path = path.to_vec();
                child_path.push(i + 1);
                assign(child, &child_path);
            }
        }
        for (i, root) in self.roots.iter_mut().enumerate() {
            assign(root, &[i + 1]);
        }
    }

    /// Render back to Markdown-with-tags. Citations render on the heading
    /// line; bullets render plain.
    pub fn to_markdown(&self) -> String {
        fn render(node: &OutlineNode, out: &mut String) {
            out.push_str(&"#".repeat(node.level as usize));
            out.push(' ');
            out.push_str(&node.title);
            if !node.citations.is_empty() {
                out.push_str(&format!(
                    " <citation>{}</citation>",
                    node.citations.iter().cloned().collect::<Vec<_>>().join(",")
                ));
            }
            out.push('\n');
            for bullet in &node.bullets {
                out.push_str("- ");
                out.push_str(bullet);
                out.push('\n');
            }
            out.push('\n');
            for child in &node.children {
                render(child, out);
            }
        }
        let mut out = String::new();
        for root in &self.roots {
            render(root, &mut out);
        }
        out.trim_end().to_string() + "\n"
    }

    /// Compact titles-only map used in writer prompts, one line per node.
    pub fn section_map(&self) -> String {
        let mut out = String::new();
        for node in self.iter() {
            out.push_str(&"  ".repeat((node.level as usize).saturating_sub(1)));
            out.push_str(&node.title);
            out.push('\n');
        }
        out
    }

    /// Depth-first iterator over every node.
    pub fn iter(&self) -> Vec<&OutlineNode> {
        let mut out = Vec::new();
        for root in &self.roots {
            root.visit(&mut |n| out.push(n));
        }
        out
    }

    /// Nodes the writer targets: all nodes at `level`, depth-first. When
    /// the outline never reaches that level, the roots are the sections.
    pub fn write_targets(&self, level: u8) -> Vec<&OutlineNode> {
        let at_level: Vec<&OutlineNode> =
            self.iter().into_iter().filter(|n| n.level == level).collect();
        if at_level.is_empty() {
            self.roots.iter().collect()
        } else {
            at_level
        }
    }

    pub fn get(&self, id: &str) -> Option<&OutlineNode> {
        self.iter().into_iter().find(|n| n.id == id)
    }

    /// Root-to-node title path, for section prompts.
    pub fn path_titles(&self, id: &str) -> Vec<String> {
        fn walk(node: &OutlineNode, id: &str, trail: &mut Vec<String>) -> bool {
            trail.push(node.title.clone());
            if node.id == id {
                return true;
            }
            for child in &node.children {
                if walk(child, id, trail) {
                    return true;
                }
            }
            trail.pop();
            false
        }
        let mut trail = Vec::new();
        for root in &self.roots {
            if walk(root, id, &mut trail) {
                return trail;
            }
        }
        Vec::new()
    }

    /// Every citation bound anywhere in the outline.
    pub fn all_citations(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        for node in self.iter() {
            out.extend(node.citations.iter().cloned());
        }
        out
    }

    /// Whether every leaf node carries at least one citation.
    pub fn leaves_all_cited(&self) -> bool {
        self.iter()
            .into_iter()
            .filter(|n| n.children.is_empty())
            .all(|n| !n.citations.is_empty())
    }

    pub fn node_count(&self) -> usize {
        self.iter().len()
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    /// Single-section outline used when planning ends without a committed
    /// outline, so the run can still produce a report.
    pub fn fallback(user_query: &str) -> Outline {
        let mut outline = Outline {
            roots: vec![OutlineNode {
                id: String::new(),
                title: format!("Findings: {}", user_query),
                level: 1,
                bullets: vec!["Summarize what could be established.".to_string()],
                citations: BTreeSet::new(),
                children: Vec::new(),
            }],
        };
        outline.assign_ids();
        outline
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
# Quantum Networking <citation>ev_0001</citation>
- scope note

## Protocols <citation>ev_0002,ev_0003</citation>
- compare entanglement swapping approaches <citation>ev_0004</citation>
- throughput figures

### Repeater Chains
- loss budgets <citation>ev_0005</citation>

## Applications
- secure key distribution <citation>ev_0006</citation>
";

    #[test]
    fn test_parse_structure() {
        let outline = Outline::parse(SAMPLE).unwrap();
        assert_eq!(outline.roots.len(), 1);
        let root = &outline.roots[0];
        assert_eq!(root.id, "sec_1");
        assert_eq!(root.title, "Quantum Networking");
        assert_eq!(root.level, 1);
        assert_eq!(root.bullets, vec!["scope note"]);
        assert_eq!(root.children.len(), 2);

        let protocols = &root.children[0];
        assert_eq!(protocols.id, "sec_1_1");
        // Heading citations plus the bullet-attached one fold together.
        assert_eq!(
            protocols.citations,
            ["ev_0002", "ev_0003", "ev_0004"]
                .iter()
                .map(|s| s.to_string())
                .collect()
        );
        assert_eq!(protocols.children[0].id, "sec_1_1_1");
    }

    #[test]
    fn test_round_trip_structural_equality() {
        let outline = Outline::parse(SAMPLE).unwrap();
        let rendered = outline.to_markdown();
        let reparsed = Outline::parse(&rendered).unwrap();
        assert_eq!(outline, reparsed);
    }

    #[test]
    fn test_level_skip_rejected() {
        let bad = "# Top\n### Skipped\n";
        assert!(matches!(
            Outline::parse(bad),
            Err(OutlineError::LevelSkip { parent: 1, found: 3, .. })
        ));
    }

    #[test]
    fn test_empty_rejected() {
        assert_eq!(Outline::parse("just prose\n"), Err(OutlineError::Empty));
    }

    #[test]
    fn test_write_targets_default_level() {
        let outline = Outline::parse(SAMPLE).unwrap();
        let targets = outline.write_targets(2);
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0].title, "Protocols");
        assert_eq!(targets[1].title, "Applications");
    }

    #[test]
    fn test_write_targets_falls_back_to_roots() {
        let outline = Outline::parse("# Only Root\n- note\n").unwrap();
        let targets = outline.write_targets(2);
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].title, "Only Root");
    }

    #[test]
    fn test_subtree_citations() {
        let outline = Outline::parse(SAMPLE).unwrap();
        let protocols = outline.get("sec_1_1").unwrap();
        let subtree = protocols.subtree_citations();
        assert!(subtree.contains("ev_0002"));
        assert!(subtree.contains("ev_0005"));
        assert!(!subtree.contains("ev_0006"));
    }

    #[test]
    fn test_all_citations_and_leaves() {
        let outline = Outline::parse(SAMPLE).unwrap();
        assert_eq!(outline.all_citations().len(), 6);
        assert!(outline.leaves_all_cited());

        let sparse = Outline::parse("# A\n## Uncited\n").unwrap();
        assert!(!sparse.leaves_all_cited());
    }

    #[test]
    fn test_path_titles() {
        let outline = Outline::parse(SAMPLE).unwrap();
        assert_eq!(
            outline.path_titles("sec_1_1_1"),
            vec!["Quantum Networking", "Protocols", "Repeater Chains"]
        );
    }

    #[test]
    fn test_multiple_roots() {
        let outline = Outline::parse("# One\n# Two\n## Two Sub\n").unwrap();
        assert_eq!(outline.roots.len(), 2);
        assert_eq!(outline.roots[1].children[0].id, "sec_2_1");
    }

    #[test]
    fn test_section_map_has_no_citations() {
        let outline = Outline::parse(SAMPLE).unwrap();
        let map = outline.section_map();
        assert!(map.contains("Protocols"));
        assert!(!map.contains("ev_0002"));
        assert!(!map.contains("compare"));
    }

    #[test]
    fn test_fallback_outline() {
        let outline = Outline::fallback("test query");
        assert_eq!(outline.roots.len(), 1);
        assert_eq!(outline.roots[0].id, "sec_1");
        assert!(outline.write_targets(2).len() == 1);
    }
}

//! Outline quality judge
//!
//! External collaborator specified only by interface: given the user query
//! and the committed outline, it returns a rating and justification per
//! fixed criterion. A missing or malformed judgement never fails a run;
//! the orchestrator records `{"error": ...}` instead.

use crate::llm::{ChatProvider, ChatRequest, LlmError};
use crate::prompts;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The fixed criterion set.
pub const CRITERIA: [&str; 6] = [
    "InstructionFollowing",
    "Depth",
    "Balance",
    "Breadth",
    "Support",
    "Insightfulness",
];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CriterionJudgement {
    pub rating: u8,
    pub justification: String,
}

/// Criterion name to judgement.
pub type JudgementReport = BTreeMap<String, CriterionJudgement>;

#[derive(Debug, thiserror::Error)]
pub enum JudgeError {
    #[error(transparent)]
    Llm(#[from] LlmError),
    #[error("judgement parse error: {0}")]
    Parse(String),
}

#[async_trait]
pub trait OutlineJudge: Send + Sync {
    async fn judge(&self, user_query: &str, outline_md: &str)
        -> Result<JudgementReport, JudgeError>;
}

/// LLM-backed judge.
pub struct LlmOutlineJudge<'a> {
    pub llm: &'a dyn ChatProvider,
}

#[async_trait]
impl<'a> OutlineJudge for LlmOutlineJudge<'a> {
    async fn judge(
        &self,
        user_query: &str,
        outline_md: &str,
    ) -> Result<JudgementReport, JudgeError> {
        let request = ChatRequest::new(
            prompts::judge_system(),
            prompts::judge_user(user_query, outline_md),
        );
        let response = self.llm.complete(&request).await?;
        parse_judgement(&response.content)
    }
}

/// Parse a judgement out of free-form LLM output. Every criterion must be
/// present with a rating in 0-10.
pub fn parse_judgement(text: &str) -> Result<JudgementReport, JudgeError> {
    let start = text
        .find('{')
        .ok_or_else(|| JudgeError::Parse("no JSON object in response".into()))?;
    let end = text
        .rfind('}')
        .ok_or_else(|| JudgeError::Parse("no JSON object in response".into()))?;
    if end <= start {
        return Err(JudgeError::Parse("no JSON object in response".into()));
    }
    let value: serde_json::Value = serde_json::from_str(&text[start..=end])
        .map_err(|e| JudgeError::Parse(e.to_string()))?;

    let mut report = JudgementReport::new();
    for criterion in CRITERIA {
        let entry = value
            .get(criterion)
            .ok_or_else(|| JudgeError::Parse(format!("missing criterion '{}'", criterion)))?;
        let rating = entry
            .get("rating")
            .and_then(|r| r.as_u64())
            .filter(|r| *r <= 10)
            .ok_or_else(|| JudgeError::Parse(format!("invalid rating for '{}'", criterion)))?
            as u8;
        let justification = entry
            .get("justification")
            .and_then(|j| j.as_str())
            .unwrap_or("")
            .to_string();
        report.insert(
            criterion.to_string(),
            CriterionJudgement {
                rating,
                justification,
            },
        );
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_judgement_json() -> String {
        let mut obj = serde_json::Map::new();
        for (i, criterion) in CRITERIA.iter().enumerate() {
            obj.insert(
                criterion.to_string(),
                serde_json::json!({ "rating": i as u64, "justification": format!("reason {}", i) }),
            );
        }
        serde_json::Value::Object(obj).to_string()
    }

    #[test]
    fn test_parse_full_judgement() {
        let text = format!("Here is my assessment:\n{}\nDone.", full_judgement_json());
        let report = parse_judgement(&text).unwrap();
        assert_eq!(report.len(), 6);
        assert_eq!(report["Depth"].rating, 1);
        assert_eq!(report["Support"].justification, "reason 4");
    }

    #[test]
    fn test_missing_criterion_rejected() {
        let text = r#"{"Depth": {"rating": 5, "justification": "ok"}}"#;
        assert!(matches!(parse_judgement(text), Err(JudgeError::Parse(_))));
    }

    #[test]
    fn test_out_of_range_rating_rejected() {
        let mut value: serde_json::Value = serde_json::from_str(&full_judgement_json()).unwrap();
        value["Depth"]["rating"] = serde_json::json!(11);
        assert!(matches!(
            parse_judgement(&value.to_string()),
            Err(JudgeError::Parse(_))
        ));
    }

    #[test]
    fn test_no_json_rejected() {
        assert!(matches!(
            parse_judgement("I think it's fine."),
            Err(JudgeError::Parse(_))
        ));
    }
}

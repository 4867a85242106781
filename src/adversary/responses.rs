//! Reply shapes the orchestrator demands from the oracle. All parsing goes
//! through the lenient extractor; the planner additionally accepts a bare
//! array of step descriptions.

use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;

use crate::oracle::parse::{extract_array, lenient_from_str};

#[derive(Debug, Deserialize, JsonSchema)]
pub struct PlanReply {
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub recurring: bool,
    #[serde(default)]
    pub interval_minutes: Option<u32>,
    #[serde(default)]
    pub cycle_goal: Option<String>,
    #[serde(default)]
    pub completion_criteria: Option<String>,
    #[serde(default)]
    pub steps: Vec<PlanStepSpec>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct PlanStepSpec {
    pub description: String,
}

/// Parse a planning reply. Accepts the object form, or a bare array whose
/// items are strings or `{description}` objects.
pub fn parse_plan(reply: &str) -> Option<PlanReply> {
    if let Some(plan) = lenient_from_str::<PlanReply>(reply) {
        if !plan.steps.is_empty() {
            return Some(plan);
        }
    }
    let array = extract_array(reply)?;
    let steps: Vec<PlanStepSpec> = array
        .as_array()?
        .iter()
        .filter_map(|item| match item {
            Value::String(s) => Some(PlanStepSpec {
                description: s.clone(),
            }),
            Value::Object(_) => item
                .get("description")
                .and_then(Value::as_str)
                .map(|s| PlanStepSpec {
                    description: s.to_string(),
                }),
            _ => None,
        })
        .collect();
    if steps.is_empty() {
        return None;
    }
    Some(PlanReply {
        reasoning: String::new(),
        recurring: false,
        interval_minutes: None,
        cycle_goal: None,
        completion_criteria: None,
        steps,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, JsonSchema)]
pub enum Verdict {
    #[serde(rename = "PASS", alias = "pass", alias = "Pass")]
    Pass,
    #[serde(rename = "RETRY", alias = "retry", alias = "Retry")]
    Retry,
    #[serde(rename = "ESCALATE", alias = "escalate", alias = "Escalate")]
    Escalate,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct VerdictReply {
    pub verdict: Verdict,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub refined_instruction: Option<String>,
    #[serde(default)]
    pub escalation_question: Option<String>,
}

impl Default for VerdictReply {
    /// An unparseable verdict defaults to PASS so evaluation can never
    /// loop a step forever.
    fn default() -> Self {
        Self {
            verdict: Verdict::Pass,
            reasoning: "verdict unparseable; defaulting to PASS".to_string(),
            refined_instruction: None,
            escalation_question: None,
        }
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct AutoAnswerReply {
    pub can_answer: bool,
    #[serde(default)]
    pub answer: String,
    #[serde(default)]
    pub reasoning: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct RefineReply {
    pub needs_refinement: bool,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub refined_steps: Vec<RefinedStep>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct RefinedStep {
    pub order: usize,
    pub description: String,
}

/// Sentinel description marking a pending step as no longer needed.
pub const SKIP_SENTINEL: &str = "SKIP";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plan_object_form() {
        let reply = r#"{"reasoning": "two phases", "recurring": true, "interval_minutes": 5,
            "steps": [{"description": "profile"}, {"description": "fix N+1"}]}"#;
        let plan = parse_plan(reply).unwrap();
        assert_eq!(plan.steps.len(), 2);
        assert!(plan.recurring);
        assert_eq!(plan.interval_minutes, Some(5));
    }

    #[test]
    fn test_parse_plan_bare_string_array() {
        let plan = parse_plan(r#"["profile", "fix N+1"]"#).unwrap();
        assert_eq!(plan.steps[0].description, "profile");
        assert_eq!(plan.steps[1].description, "fix N+1");
        assert!(!plan.recurring);
    }

    #[test]
    fn test_parse_plan_fenced_object_array() {
        let reply = "```json\n[{\"description\": \"one\"}, {\"description\": \"two\"}]\n```";
        let plan = parse_plan(reply).unwrap();
        assert_eq!(plan.steps.len(), 2);
    }

    #[test]
    fn test_parse_plan_empty_steps_rejected() {
        assert!(parse_plan(r#"{"reasoning": "nothing to do", "steps": []}"#).is_none());
        assert!(parse_plan("I could not produce a plan.").is_none());
    }

    #[test]
    fn test_verdict_case_tolerance() {
        let reply: VerdictReply =
            crate::oracle::parse::lenient_from_str(r#"{"verdict": "pass"}"#).unwrap();
        assert_eq!(reply.verdict, Verdict::Pass);
        let reply: VerdictReply =
            crate::oracle::parse::lenient_from_str(r#"{"verdict": "RETRY", "refined_instruction": "re-check file X"}"#)
                .unwrap();
        assert_eq!(reply.verdict, Verdict::Retry);
        assert_eq!(reply.refined_instruction.as_deref(), Some("re-check file X"));
    }
}

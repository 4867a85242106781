//! Prompt templates for the orchestration loop. Each template names its
//! consumer: the recon worker, the planner, the instruction crafter, the
//! step evaluator, the auto-answerer, and the plan refiner.

use std::path::PathBuf;

use crate::goal::{AgentGoal, AgentPlan, PlanStep};
use crate::oracle::response_contract;
use crate::utils::clip_with_marker;

use super::responses::{AutoAnswerReply, PlanReply, RefineReply, VerdictReply};

/// Recon reports get clipped to roughly this many bytes before planning.
pub const RECON_CLIP_BYTES: usize = 3000;
/// Cap on each step result inside prior-context blocks.
const STEP_RESULT_CLIP_BYTES: usize = 1200;

pub fn recon_instruction(goal: &AgentGoal) -> String {
    format!(
        r#"Explore the working tree at {dir} to prepare for this goal: "{goal}"

Read enough to understand what the project is, how it is laid out, and what
state it is in. Produce a human-readable report, and end it with exactly this
structured block:

<recon_summary>
PROJECT_PATH: <path>
LANGUAGE: <primary language>
FRAMEWORK: <framework or "none">
KEY_FILES: <comma-separated files most relevant to the goal>
CURRENT_STATE: <one or two sentences>
IMPROVEMENT_OPPORTUNITIES: <one or two sentences>
</recon_summary>"#,
        dir = goal.working_directory.display(),
        goal = goal.description,
    )
}

pub fn planning_prompt(
    goal: &AgentGoal,
    agent_name: &str,
    workspace_roots: &[PathBuf],
    recon_report: Option<&str>,
    prior_results: &str,
    preference_context: &str,
) -> String {
    let constraints = if goal.constraints.is_empty() {
        "(none)".to_string()
    } else {
        goal.constraints
            .iter()
            .map(|c| format!("- {}", c))
            .collect::<Vec<_>>()
            .join("\n")
    };
    let recon = recon_report
        .map(|r| clip_with_marker(r, RECON_CLIP_BYTES))
        .unwrap_or_else(|| "(no reconnaissance available)".to_string());
    let roots = workspace_roots
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ");
    let prior = if prior_results.is_empty() {
        String::new()
    } else {
        format!(
            "\nResults from the previous attempt (plan around what already happened):\n{}\n",
            prior_results
        )
    };

    format!(
        r#"Plan the work for agent {agent_name} toward this goal: "{goal}"

Working directory: {dir}
Workspace roots: {roots}

Constraints:
{constraints}

Reconnaissance:
{recon}
{prior}
{preference_context}

Produce a short, linear plan of concrete steps a tool-equipped worker can
execute one at a time. Each step must be self-contained and verifiable. Mark
the plan recurring only if the goal is inherently periodic. Return ONLY JSON
matching this schema:
{contract}"#,
        agent_name = agent_name,
        goal = goal.description,
        dir = goal.working_directory.display(),
        roots = if roots.is_empty() { "(none)".to_string() } else { roots },
        constraints = constraints,
        recon = recon,
        prior = prior,
        preference_context = preference_context,
        contract = response_contract::<PlanReply>(),
    )
}

/// Render completed-step results for embedding in prompts and worker
/// prior-context blocks.
pub fn prior_context(plan: &AgentPlan) -> String {
    let lines: Vec<String> = plan
        .steps
        .iter()
        .filter(|s| s.result.is_some())
        .map(|s| {
            format!(
                "Step {} [{}] {}: {}",
                s.order + 1,
                s.status,
                s.description,
                clip_with_marker(s.result.as_deref().unwrap_or(""), STEP_RESULT_CLIP_BYTES),
            )
        })
        .collect();
    lines.join("\n")
}

pub fn craft_instruction_prompt(goal: &AgentGoal, step: &PlanStep, prior: &str) -> String {
    format!(
        r#"Write the instruction for a worker about to execute one plan step.

Goal: "{goal}"
Step: "{step}"

Results of completed steps (the worker has no memory of them):
{prior}

Write a single self-contained instruction that tells the worker exactly what
to do for this step, folding in whatever the prior results make relevant.
Reply with the instruction text only."#,
        goal = goal.description,
        step = step.description,
        prior = if prior.is_empty() { "(none)" } else { prior },
    )
}

pub fn resumed_instruction_prompt(
    goal: &AgentGoal,
    step: &PlanStep,
    question: &str,
    answer: &str,
) -> String {
    format!(
        r#"A worker paused on this plan step to ask a question, and the answer is
now known.

Goal: "{goal}"
Step: "{step}"
Worker's question: {question}
Answer: {answer}

Rewrite the step as one self-contained instruction that already incorporates
the answer. Do not append the answer as an afterthought; fold it into the
instruction so the worker never needs to ask again. Reply with the
instruction text only."#,
        goal = goal.description,
        step = step.description,
        question = question,
        answer = answer,
    )
}

pub fn evaluation_prompt(goal: &AgentGoal, step: &PlanStep, result: &str) -> String {
    let criteria = goal
        .constraints
        .iter()
        .map(|c| format!("- {}", c))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        r#"Judge whether a worker's output satisfies its plan step.

Goal: "{goal}"
Step: "{step}"

Worker output:
{result}

Constraints:
{criteria}

Verdicts: PASS when the step's intent is satisfied; RETRY when a better
instruction would likely succeed (include refined_instruction); ESCALATE when
only the operator can unblock it (include escalation_question). Return ONLY
JSON matching this schema:
{contract}"#,
        goal = goal.description,
        step = step.description,
        result = clip_with_marker(result, 6000),
        criteria = if criteria.is_empty() { "(none)".to_string() } else { criteria },
        contract = response_contract::<VerdictReply>(),
    )
}

pub fn auto_answer_prompt(
    goal: &AgentGoal,
    recon_report: Option<&str>,
    preference_context: &str,
    question: &str,
) -> String {
    let constraints = goal
        .constraints
        .iter()
        .map(|c| format!("- {}", c))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        r#"A worker asked a question while executing a step. Decide whether it can
be answered from what is already known, without involving the operator.

Goal: "{goal}"
Constraints:
{constraints}

Reconnaissance:
{recon}

{preference_context}

Question: {question}

Set can_answer true only when the goal, constraints, reconnaissance, or
preferences determine the answer; guessing is worse than escalating. Return
ONLY JSON matching this schema:
{contract}"#,
        goal = goal.description,
        constraints = if constraints.is_empty() { "(none)".to_string() } else { constraints },
        recon = recon_report
            .map(|r| clip_with_marker(r, RECON_CLIP_BYTES))
            .unwrap_or_else(|| "(none)".to_string()),
        preference_context = preference_context,
        question = question,
        contract = response_contract::<AutoAnswerReply>(),
    )
}

pub fn refinement_prompt(goal: &AgentGoal, plan: &AgentPlan) -> String {
    let done: Vec<String> = plan
        .steps
        .iter()
        .filter(|s| s.status.is_done())
        .map(|s| {
            format!(
                "Step {} (done): {} -> {}",
                s.order + 1,
                s.description,
                clip_with_marker(s.result.as_deref().unwrap_or("(no result)"), STEP_RESULT_CLIP_BYTES),
            )
        })
        .collect();
    let pending: Vec<String> = plan
        .steps
        .iter()
        .filter(|s| s.status == crate::goal::StepStatus::Pending)
        .map(|s| format!("Step {} (pending, order {}): {}", s.order + 1, s.order, s.description))
        .collect();

    format!(
        r#"A plan step just completed. Decide whether the remaining pending steps
should be rewritten in light of what was learned.

Goal: "{goal}"

Completed so far:
{done}

Still pending:
{pending}

If a pending step is already satisfied by work done so far, refine it to the
single word SKIP. Only refine when the learnings genuinely change what a step
should say. Return ONLY JSON matching this schema:
{contract}"#,
        goal = goal.description,
        done = done.join("\n"),
        pending = pending.join("\n"),
        contract = response_contract::<RefineReply>(),
    )
}

pub fn talk_prompt(
    agent_name: &str,
    goal: Option<&AgentGoal>,
    plan: Option<&AgentPlan>,
    activity_summary: Option<&str>,
    message: &str,
) -> String {
    let goal_line = goal
        .map(|g| format!("Current goal: \"{}\" ({})", g.description, g.status))
        .unwrap_or_else(|| "No goal is currently assigned.".to_string());
    let plan_lines = plan
        .map(|p| {
            p.steps
                .iter()
                .map(|s| format!("- [{}] {}", s.status, s.description))
                .collect::<Vec<_>>()
                .join("\n")
        })
        .filter(|s| !s.is_empty())
        .map(|steps| format!("Plan status:\n{}", steps))
        .unwrap_or_else(|| "No plan yet.".to_string());
    let summary = activity_summary
        .map(|s| format!("Recent activity: {}\n", s))
        .unwrap_or_default();

    format!(
        r#"You are {agent_name}, a working agent, chatting with your operator.

{goal_line}
{plan_lines}
{summary}
Operator says: {message}

Reply conversationally and concretely about your work. Do not invent
progress that has not happened."#,
        agent_name = agent_name,
        goal_line = goal_line,
        plan_lines = plan_lines,
        summary = summary,
        message = message,
    )
}

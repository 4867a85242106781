mod manager;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use manager::{GoalManager, PlanLifecycle, StepPatch};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GoalStatus {
    #[default]
    Active,
    Paused,
    Completed,
    Failed,
}

impl GoalStatus {
    pub fn allowed_transitions(&self) -> &'static [GoalStatus] {
        use GoalStatus::*;
        match self {
            Active => &[Paused, Completed, Failed],
            Paused => &[Active, Failed],
            Completed => &[],
            Failed => &[],
        }
    }

    pub fn can_transition_to(&self, target: GoalStatus) -> bool {
        self.allowed_transitions().contains(&target)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, GoalStatus::Completed | GoalStatus::Failed)
    }
}

impl std::fmt::Display for GoalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Paused => write!(f, "paused"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentGoal {
    pub id: String,
    pub agent_id: String,
    pub description: String,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub constraints: Vec<String>,
    pub working_directory: std::path::PathBuf,
    pub max_turns_per_step: u32,
    pub status: GoalStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AgentGoal {
    pub const DEFAULT_MAX_TURNS_PER_STEP: u32 = 30;

    pub fn new(
        agent_id: impl Into<String>,
        description: impl Into<String>,
        working_directory: impl Into<std::path::PathBuf>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            agent_id: agent_id.into(),
            description: description.into(),
            system_prompt: None,
            constraints: Vec::new(),
            working_directory: working_directory.into(),
            max_turns_per_step: Self::DEFAULT_MAX_TURNS_PER_STEP,
            status: GoalStatus::Active,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
    Blocked,
}

impl StepStatus {
    /// Terminal-for-the-plan states: the plan is finished when every step
    /// is one of these.
    pub fn is_done(&self) -> bool {
        matches!(self, StepStatus::Completed | StepStatus::Skipped)
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Skipped => write!(f, "skipped"),
            Self::Blocked => write!(f, "blocked"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    pub id: String,
    pub goal_id: String,
    /// 0-based, dense, unique within the plan.
    pub order: usize,
    pub description: String,
    pub status: StepStatus,
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub result: Option<String>,
    /// Set exactly while the step is blocked on the operator.
    #[serde(default)]
    pub question: Option<String>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl PlanStep {
    pub fn new(goal_id: impl Into<String>, order: usize, description: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            goal_id: goal_id.into(),
            order,
            description: description.into(),
            status: StepStatus::Pending,
            task_id: None,
            result: None,
            question: None,
            completed_at: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentPlan {
    pub id: String,
    pub goal_id: String,
    pub version: u32,
    pub reasoning: String,
    pub steps: Vec<PlanStep>,
    #[serde(default)]
    pub recurring: bool,
    #[serde(default)]
    pub interval_minutes: Option<u32>,
    #[serde(default)]
    pub cycle_goal: Option<String>,
    #[serde(default)]
    pub completion_criteria: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AgentPlan {
    pub fn is_finished(&self) -> bool {
        !self.steps.is_empty() && self.steps.iter().all(|s| s.status.is_done())
    }

    pub fn next_pending_step(&self) -> Option<&PlanStep> {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Pending)
            .min_by_key(|s| s.order)
    }

    pub fn blocked_step(&self) -> Option<&PlanStep> {
        self.steps.iter().find(|s| s.status == StepStatus::Blocked)
    }

    pub fn completed_steps(&self) -> Vec<&PlanStep> {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Manual,
    Interval,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentTrigger {
    pub id: String,
    pub agent_id: String,
    pub goal_id: String,
    pub trigger_type: TriggerType,
    #[serde(default)]
    pub interval_ms: Option<u64>,
    pub enabled: bool,
    #[serde(default)]
    pub last_fired_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub next_fire_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl AgentTrigger {
    pub fn interval(
        agent_id: impl Into<String>,
        goal_id: impl Into<String>,
        interval_ms: u64,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            agent_id: agent_id.into(),
            goal_id: goal_id.into(),
            trigger_type: TriggerType::Interval,
            interval_ms: Some(interval_ms),
            enabled: true,
            last_fired_at: None,
            next_fire_at: None,
            created_at: Utc::now(),
        }
    }

    pub fn manual(agent_id: impl Into<String>, goal_id: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            agent_id: agent_id.into(),
            goal_id: goal_id.into(),
            trigger_type: TriggerType::Manual,
            interval_ms: None,
            enabled: true,
            last_fired_at: None,
            next_fire_at: None,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_goal_transitions() {
        assert!(GoalStatus::Active.can_transition_to(GoalStatus::Paused));
        assert!(GoalStatus::Paused.can_transition_to(GoalStatus::Active));
        assert!(GoalStatus::Active.can_transition_to(GoalStatus::Completed));
        assert!(!GoalStatus::Completed.can_transition_to(GoalStatus::Active));
        assert!(!GoalStatus::Failed.can_transition_to(GoalStatus::Active));
    }

    #[test]
    fn test_plan_finished_requires_all_done() {
        let mut plan = AgentPlan {
            id: "p".into(),
            goal_id: "g".into(),
            version: 1,
            reasoning: String::new(),
            steps: vec![
                PlanStep::new("g", 0, "first"),
                PlanStep::new("g", 1, "second"),
            ],
            recurring: false,
            interval_minutes: None,
            cycle_goal: None,
            completion_criteria: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert!(!plan.is_finished());

        plan.steps[0].status = StepStatus::Completed;
        plan.steps[1].status = StepStatus::Skipped;
        assert!(plan.is_finished());
    }

    #[test]
    fn test_next_pending_is_lowest_order() {
        let mut steps = vec![
            PlanStep::new("g", 0, "a"),
            PlanStep::new("g", 1, "b"),
            PlanStep::new("g", 2, "c"),
        ];
        steps[0].status = StepStatus::Completed;
        let plan = AgentPlan {
            id: "p".into(),
            goal_id: "g".into(),
            version: 1,
            reasoning: String::new(),
            steps,
            recurring: false,
            interval_minutes: None,
            cycle_goal: None,
            completion_criteria: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert_eq!(plan.next_pending_step().unwrap().order, 1);
    }
}

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::agent::AgentState;
use crate::session::{SessionMessage, SessionStatus};

/// Topics a subscriber can register for. One topic per event variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    AgentHired,
    AgentFired,
    AgentStateChanged,
    TaskCreated,
    TaskStarted,
    TaskCompleted,
    TaskFailed,
    TaskLog,
    GoalCreated,
    GoalUpdated,
    PlanCreated,
    StepStarted,
    StepCompleted,
    StepFailed,
    SessionCreated,
    SessionStatusChanged,
    SessionMessage,
    SessionEnded,
    PermissionRequested,
    QuestionRaised,
    TriggerFired,
    PreferenceStored,
    OracleFailed,
}

/// Typed event payloads. Subscribers pattern-match on the variant instead of
/// digging through untyped maps.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusEvent {
    AgentHired {
        agent_id: String,
        name: String,
    },
    AgentFired {
        agent_id: String,
        name: String,
    },
    AgentStateChanged {
        agent_id: String,
        state: AgentState,
    },
    TaskCreated {
        task_id: String,
        agent_id: Option<String>,
        description: String,
    },
    TaskStarted {
        task_id: String,
    },
    TaskCompleted {
        task_id: String,
    },
    TaskFailed {
        task_id: String,
        error: String,
    },
    TaskLog {
        task_id: String,
        message: String,
    },
    GoalCreated {
        goal_id: String,
        agent_id: String,
        description: String,
    },
    GoalUpdated {
        goal_id: String,
        agent_id: String,
        status: String,
    },
    PlanCreated {
        goal_id: String,
        plan_id: String,
        version: u32,
        steps: usize,
    },
    StepStarted {
        goal_id: String,
        step_id: String,
        order: usize,
    },
    StepCompleted {
        goal_id: String,
        step_id: String,
        order: usize,
    },
    StepFailed {
        goal_id: String,
        step_id: String,
        order: usize,
        error: String,
    },
    SessionCreated {
        session_id: String,
        agent_id: String,
        task_id: String,
    },
    SessionStatusChanged {
        session_id: String,
        agent_id: String,
        status: SessionStatus,
    },
    SessionMessage {
        session_id: String,
        agent_id: String,
        message: SessionMessage,
    },
    SessionEnded {
        session_id: String,
        agent_id: String,
        task_id: String,
        status: SessionStatus,
        result: String,
        tokens_used: u64,
    },
    PermissionRequested {
        session_id: String,
        agent_id: String,
        tool_name: String,
        tool_input: Value,
    },
    QuestionRaised {
        goal_id: String,
        agent_id: String,
        step_id: String,
        question: String,
    },
    TriggerFired {
        trigger_id: String,
        goal_id: String,
        agent_id: String,
    },
    PreferenceStored {
        agent_id: String,
        key: String,
        confidence: String,
    },
    OracleFailed {
        context: String,
        error: String,
    },
}

impl BusEvent {
    pub fn topic(&self) -> Topic {
        match self {
            Self::AgentHired { .. } => Topic::AgentHired,
            Self::AgentFired { .. } => Topic::AgentFired,
            Self::AgentStateChanged { .. } => Topic::AgentStateChanged,
            Self::TaskCreated { .. } => Topic::TaskCreated,
            Self::TaskStarted { .. } => Topic::TaskStarted,
            Self::TaskCompleted { .. } => Topic::TaskCompleted,
            Self::TaskFailed { .. } => Topic::TaskFailed,
            Self::TaskLog { .. } => Topic::TaskLog,
            Self::GoalCreated { .. } => Topic::GoalCreated,
            Self::GoalUpdated { .. } => Topic::GoalUpdated,
            Self::PlanCreated { .. } => Topic::PlanCreated,
            Self::StepStarted { .. } => Topic::StepStarted,
            Self::StepCompleted { .. } => Topic::StepCompleted,
            Self::StepFailed { .. } => Topic::StepFailed,
            Self::SessionCreated { .. } => Topic::SessionCreated,
            Self::SessionStatusChanged { .. } => Topic::SessionStatusChanged,
            Self::SessionMessage { .. } => Topic::SessionMessage,
            Self::SessionEnded { .. } => Topic::SessionEnded,
            Self::PermissionRequested { .. } => Topic::PermissionRequested,
            Self::QuestionRaised { .. } => Topic::QuestionRaised,
            Self::TriggerFired { .. } => Topic::TriggerFired,
            Self::PreferenceStored { .. } => Topic::PreferenceStored,
            Self::OracleFailed { .. } => Topic::OracleFailed,
        }
    }

    /// Agent the event concerns, when there is one. Used to route events
    /// into per-agent observability logs.
    pub fn agent_id(&self) -> Option<&str> {
        match self {
            Self::AgentHired { agent_id, .. }
            | Self::AgentFired { agent_id, .. }
            | Self::AgentStateChanged { agent_id, .. }
            | Self::GoalCreated { agent_id, .. }
            | Self::GoalUpdated { agent_id, .. }
            | Self::SessionCreated { agent_id, .. }
            | Self::SessionStatusChanged { agent_id, .. }
            | Self::SessionMessage { agent_id, .. }
            | Self::SessionEnded { agent_id, .. }
            | Self::PermissionRequested { agent_id, .. }
            | Self::QuestionRaised { agent_id, .. }
            | Self::TriggerFired { agent_id, .. }
            | Self::PreferenceStored { agent_id, .. } => Some(agent_id),
            Self::TaskCreated { agent_id, .. } => agent_id.as_deref(),
            _ => None,
        }
    }
}

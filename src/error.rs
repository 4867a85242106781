use thiserror::Error;

#[derive(Error, Debug)]
pub enum FarmError {
    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    #[error("Agent name already taken: {0}")]
    AgentNameTaken(String),

    #[error("Agent is busy: {0}")]
    AgentBusy(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Goal not found: {0}")]
    GoalNotFound(String),

    #[error("No active goal for agent: {0}")]
    NoActiveGoal(String),

    #[error("Trigger not found: {0}")]
    TriggerNotFound(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("No active session for agent: {0}")]
    NoActiveSession(String),

    #[error("No step is waiting for input on goal: {0}")]
    NoBlockedStep(String),

    #[error("Invalid goal state: expected {expected}, got {actual}")]
    InvalidGoalState { expected: String, actual: String },

    #[error("Baseline tool cannot be removed: {0}")]
    BaselineTool(String),

    #[error("Oracle call failed: {0}")]
    Oracle(String),

    #[error("Worker spawn failed: {0}")]
    Spawn(String),

    #[error("Persistence failed: {0}")]
    Persistence(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, FarmError>;

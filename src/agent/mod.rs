mod manager;
mod names;

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use manager::AgentManager;
pub use names::next_name;

/// Tools every agent may always use; never removable.
pub const BASELINE_TOOLS: [&str; 3] = ["Read", "Glob", "Grep"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    #[default]
    Idle,
    Thinking,
    Working,
    /// Cosmetic front-end state; the core never sets it.
    Walking,
}

impl std::fmt::Display for AgentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Thinking => write!(f, "thinking"),
            Self::Working => write!(f, "working"),
            Self::Walking => write!(f, "walking"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub name: String,
    pub state: AgentState,
    pub approved_tools: BTreeSet<String>,
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub tasks_completed: u32,
    #[serde(default)]
    pub tokens_used: u64,
    pub hired_at: DateTime<Utc>,
    #[serde(default)]
    pub assigned_task_id: Option<String>,
    /// Front-end sprite position; purely cosmetic.
    #[serde(default)]
    pub position: Option<(i32, i32)>,
}

impl Agent {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            state: AgentState::Idle,
            approved_tools: BASELINE_TOOLS.iter().map(|t| t.to_string()).collect(),
            system_prompt: None,
            tasks_completed: 0,
            tokens_used: 0,
            hired_at: Utc::now(),
            assigned_task_id: None,
            position: None,
        }
    }
}

/// One remembered conversation turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationEntry {
    pub role: String,
    pub content: String,
    #[serde(default)]
    pub task_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Bounded FIFO of an agent's recent conversation turns.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentMemory {
    pub conversations: Vec<ConversationEntry>,
}

impl AgentMemory {
    pub const MAX_ENTRIES: usize = 50;

    pub fn push(&mut self, entry: ConversationEntry) {
        self.conversations.push(entry);
        if self.conversations.len() > Self::MAX_ENTRIES {
            let excess = self.conversations.len() - Self::MAX_ENTRIES;
            self.conversations.drain(..excess);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_agent_carries_baseline_tools() {
        let agent = Agent::new("Sam");
        for tool in BASELINE_TOOLS {
            assert!(agent.approved_tools.contains(tool));
        }
        assert_eq!(agent.state, AgentState::Idle);
    }

    #[test]
    fn test_memory_trims_to_most_recent() {
        let mut memory = AgentMemory::default();
        for i in 0..60 {
            memory.push(ConversationEntry {
                role: "user".into(),
                content: format!("message {}", i),
                task_id: None,
                timestamp: Utc::now(),
            });
        }
        assert_eq!(memory.conversations.len(), AgentMemory::MAX_ENTRIES);
        assert_eq!(memory.conversations[0].content, "message 10");
        assert_eq!(memory.conversations.last().unwrap().content, "message 59");
    }
}

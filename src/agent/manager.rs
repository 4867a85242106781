use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{info, warn};

use super::{next_name, Agent, AgentMemory, AgentState, ConversationEntry, BASELINE_TOOLS};
use crate::bus::{BusEvent, EventBus};
use crate::error::{FarmError, Result};
use crate::store::DataStore;

pub struct AgentManager {
    store: Arc<DataStore>,
    bus: Arc<EventBus>,
    agents: RwLock<HashMap<String, Agent>>,
    memory: RwLock<HashMap<String, AgentMemory>>,
}

impl AgentManager {
    pub async fn load(store: Arc<DataStore>, bus: Arc<EventBus>) -> Result<Self> {
        let agents: HashMap<String, Agent> = store
            .load_agents()
            .await?
            .into_iter()
            .map(|a| (a.id.clone(), a))
            .collect();
        let mut memory = HashMap::new();
        for id in agents.keys() {
            match store.load_agent_memory(id).await {
                Ok(m) => {
                    memory.insert(id.clone(), m);
                }
                Err(e) => warn!(agent_id = %id, error = %e, "Failed to load agent memory"),
            }
        }
        Ok(Self {
            store,
            bus,
            agents: RwLock::new(agents),
            memory: RwLock::new(memory),
        })
    }

    pub async fn hire(&self, name: Option<String>) -> Result<Agent> {
        let agent = {
            let mut agents = self.agents.write();
            let taken: HashSet<String> = agents.values().map(|a| a.name.clone()).collect();
            let name = match name {
                Some(name) => {
                    if taken.contains(&name) {
                        return Err(FarmError::AgentNameTaken(name));
                    }
                    name
                }
                None => next_name(&taken),
            };
            let agent = Agent::new(name);
            agents.insert(agent.id.clone(), agent.clone());
            agent
        };
        self.memory
            .write()
            .insert(agent.id.clone(), AgentMemory::default());
        info!(agent_id = %agent.id, name = %agent.name, "Hired agent");
        self.bus.publish(BusEvent::AgentHired {
            agent_id: agent.id.clone(),
            name: agent.name.clone(),
        });
        self.persist().await;
        Ok(agent)
    }

    /// Remove the agent and its memory. Cross-manager cascade (sessions,
    /// tasks, goals, preferences) is the Bridge's job.
    pub async fn fire(&self, id: &str) -> Result<Agent> {
        let agent = self
            .agents
            .write()
            .remove(id)
            .ok_or_else(|| FarmError::AgentNotFound(id.to_string()))?;
        self.memory.write().remove(id);
        if let Err(e) = self.store.delete_agent_memory(id).await {
            warn!(agent_id = %id, error = %e, "Failed to delete agent memory file");
        }
        info!(agent_id = %agent.id, name = %agent.name, "Fired agent");
        self.bus.publish(BusEvent::AgentFired {
            agent_id: agent.id.clone(),
            name: agent.name.clone(),
        });
        self.persist().await;
        Ok(agent)
    }

    pub fn get(&self, id: &str) -> Option<Agent> {
        self.agents.read().get(id).cloned()
    }

    /// Resolve an operator-typed reference: exact id, exact name, or
    /// case-insensitive name.
    pub fn find(&self, reference: &str) -> Option<Agent> {
        let agents = self.agents.read();
        if let Some(agent) = agents.get(reference) {
            return Some(agent.clone());
        }
        agents
            .values()
            .find(|a| a.name == reference)
            .or_else(|| {
                agents
                    .values()
                    .find(|a| a.name.eq_ignore_ascii_case(reference))
            })
            .cloned()
    }

    pub fn list(&self) -> Vec<Agent> {
        let mut agents: Vec<Agent> = self.agents.read().values().cloned().collect();
        agents.sort_by(|a, b| a.hired_at.cmp(&b.hired_at));
        agents
    }

    pub async fn update_state(&self, id: &str, state: AgentState) -> Result<()> {
        let changed = {
            let mut agents = self.agents.write();
            let agent = agents
                .get_mut(id)
                .ok_or_else(|| FarmError::AgentNotFound(id.to_string()))?;
            if agent.state == state {
                false
            } else {
                agent.state = state;
                true
            }
        };
        if changed {
            self.bus.publish(BusEvent::AgentStateChanged {
                agent_id: id.to_string(),
                state,
            });
            self.persist().await;
        }
        Ok(())
    }

    pub async fn update_position(&self, id: &str, x: i32, y: i32) -> Result<()> {
        self.update(id, |agent| agent.position = Some((x, y)))?;
        self.persist().await;
        Ok(())
    }

    pub async fn assign_task(&self, id: &str, task_id: &str) -> Result<()> {
        let task_id = task_id.to_string();
        self.update(id, |agent| agent.assigned_task_id = Some(task_id))?;
        self.persist().await;
        Ok(())
    }

    /// Release the agent from a finished task: back to idle, unassigned.
    /// Synchronous so a `session_ended` subscriber can settle the agent
    /// before anything re-dispatches it; the persist is queued. No-op when
    /// the agent is gone or already working on a newer task.
    pub fn release_task(self: &Arc<Self>, id: &str, task_id: &str) -> bool {
        let released = {
            let mut agents = self.agents.write();
            match agents.get_mut(id) {
                Some(agent) if agent.assigned_task_id.as_deref() == Some(task_id) => {
                    agent.state = AgentState::Idle;
                    agent.assigned_task_id = None;
                    true
                }
                _ => false,
            }
        };
        if released {
            self.bus.publish(BusEvent::AgentStateChanged {
                agent_id: id.to_string(),
                state: AgentState::Idle,
            });
            let manager = Arc::clone(self);
            tokio::spawn(async move { manager.persist().await });
        }
        released
    }

    pub async fn unassign_task(&self, id: &str) -> Result<()> {
        self.update(id, |agent| agent.assigned_task_id = None)?;
        self.persist().await;
        Ok(())
    }

    pub async fn increment_tasks_completed(&self, id: &str) -> Result<()> {
        self.update(id, |agent| agent.tasks_completed += 1)?;
        self.persist().await;
        Ok(())
    }

    pub async fn add_tokens_used(&self, id: &str, tokens: u64) -> Result<()> {
        self.update(id, |agent| agent.tokens_used += tokens)?;
        self.persist().await;
        Ok(())
    }

    pub async fn set_system_prompt(&self, id: &str, prompt: Option<String>) -> Result<()> {
        self.update(id, |agent| agent.system_prompt = prompt)?;
        self.persist().await;
        Ok(())
    }

    /// Returns whether the tool was newly added.
    pub async fn add_approved_tool(&self, id: &str, tool: &str) -> Result<bool> {
        let mut added = false;
        self.update(id, |agent| {
            added = agent.approved_tools.insert(tool.to_string());
        })?;
        if added {
            self.persist().await;
        }
        Ok(added)
    }

    pub async fn remove_approved_tool(&self, id: &str, tool: &str) -> Result<bool> {
        if BASELINE_TOOLS.iter().any(|t| t.eq_ignore_ascii_case(tool)) {
            return Err(FarmError::BaselineTool(tool.to_string()));
        }
        let mut removed = false;
        self.update(id, |agent| {
            removed = agent.approved_tools.remove(tool);
        })?;
        if removed {
            self.persist().await;
        }
        Ok(removed)
    }

    pub fn get_memory(&self, id: &str) -> AgentMemory {
        self.memory.read().get(id).cloned().unwrap_or_default()
    }

    pub async fn add_conversation(
        &self,
        id: &str,
        role: impl Into<String>,
        content: impl Into<String>,
        task_id: Option<String>,
    ) -> Result<()> {
        if !self.agents.read().contains_key(id) {
            return Err(FarmError::AgentNotFound(id.to_string()));
        }
        let snapshot = {
            let mut memory = self.memory.write();
            let entry = memory.entry(id.to_string()).or_default();
            entry.push(ConversationEntry {
                role: role.into(),
                content: content.into(),
                task_id,
                timestamp: chrono::Utc::now(),
            });
            entry.clone()
        };
        if let Err(e) = self.store.save_agent_memory(id, &snapshot).await {
            warn!(agent_id = %id, error = %e, "Failed to persist agent memory");
        }
        Ok(())
    }

    fn update(&self, id: &str, mutate: impl FnOnce(&mut Agent)) -> Result<()> {
        let mut agents = self.agents.write();
        let agent = agents
            .get_mut(id)
            .ok_or_else(|| FarmError::AgentNotFound(id.to_string()))?;
        mutate(agent);
        Ok(())
    }

    async fn persist(&self) {
        let snapshot = self.list();
        if let Err(e) = self.store.save_agents(&snapshot).await {
            warn!(error = %e, "Failed to persist agents");
        }
    }
}

//! JSON-file persistence: one file per entity family, JSONL logs per agent.
//!
//! Saves are last-writer-wins atomic writes (temp file, fsync, rename); no
//! cross-file atomicity. A failed save leaves the in-memory state
//! authoritative; callers log and continue.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::agent::{Agent, AgentMemory};
use crate::config::FarmConfig;
use crate::error::{FarmError, Result};
use crate::goal::{AgentGoal, AgentPlan, AgentTrigger};
use crate::preference::AgentPreference;
use crate::task::Task;

/// Goals and plans share one file; plan records carry a discriminator tag.
#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum GoalFileEntry {
    Plan(PlanRecord),
    Goal(AgentGoal),
}

#[derive(Debug, Serialize, Deserialize)]
struct PlanRecord {
    #[serde(rename = "_type")]
    tag: PlanTag,
    #[serde(flatten)]
    plan: AgentPlan,
}

#[derive(Debug, Serialize, Deserialize)]
enum PlanTag {
    #[serde(rename = "plan")]
    Plan,
}

pub struct DataStore {
    root: PathBuf,
}

impl DataStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Default data root under the operator's home directory.
    pub fn default_root() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join(".workfarm-data")
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn init(&self) -> Result<()> {
        for dir in ["memory", "preferences", "logs"] {
            fs::create_dir_all(self.root.join(dir)).await?;
        }
        self.recover_interrupted_writes().await;
        Ok(())
    }

    // ---- entity families ----

    pub async fn load_agents(&self) -> Result<Vec<Agent>> {
        self.load_collection(&self.root.join("agents.json")).await
    }

    pub async fn save_agents(&self, agents: &[Agent]) -> Result<()> {
        self.save_collection(&self.root.join("agents.json"), agents)
            .await
    }

    pub async fn load_tasks(&self) -> Result<Vec<Task>> {
        self.load_collection(&self.root.join("tasks.json")).await
    }

    pub async fn save_tasks(&self, tasks: &[Task]) -> Result<()> {
        self.save_collection(&self.root.join("tasks.json"), tasks)
            .await
    }

    pub async fn load_goals(&self) -> Result<(Vec<AgentGoal>, Vec<AgentPlan>)> {
        let entries: Vec<GoalFileEntry> =
            self.load_collection(&self.root.join("goals.json")).await?;
        let mut goals = Vec::new();
        let mut plans = Vec::new();
        for entry in entries {
            match entry {
                GoalFileEntry::Goal(goal) => goals.push(goal),
                GoalFileEntry::Plan(record) => plans.push(record.plan),
            }
        }
        Ok((goals, plans))
    }

    pub async fn save_goals(&self, goals: &[AgentGoal], plans: &[AgentPlan]) -> Result<()> {
        let entries: Vec<GoalFileEntry> = goals
            .iter()
            .cloned()
            .map(GoalFileEntry::Goal)
            .chain(plans.iter().cloned().map(|plan| {
                GoalFileEntry::Plan(PlanRecord {
                    tag: PlanTag::Plan,
                    plan,
                })
            }))
            .collect();
        self.save_collection(&self.root.join("goals.json"), &entries)
            .await
    }

    pub async fn load_triggers(&self) -> Result<Vec<AgentTrigger>> {
        self.load_collection(&self.root.join("triggers.json")).await
    }

    pub async fn save_triggers(&self, triggers: &[AgentTrigger]) -> Result<()> {
        self.save_collection(&self.root.join("triggers.json"), triggers)
            .await
    }

    pub async fn load_preferences(&self, agent_id: &str) -> Result<Vec<AgentPreference>> {
        self.load_collection(&self.preferences_path(agent_id)).await
    }

    pub async fn save_preferences(
        &self,
        agent_id: &str,
        preferences: &[AgentPreference],
    ) -> Result<()> {
        self.save_collection(&self.preferences_path(agent_id), preferences)
            .await
    }

    pub async fn delete_preferences(&self, agent_id: &str) -> Result<()> {
        remove_if_exists(&self.preferences_path(agent_id)).await
    }

    pub async fn load_agent_memory(&self, agent_id: &str) -> Result<AgentMemory> {
        let path = self.memory_path(agent_id);
        if !path.exists() {
            return Ok(AgentMemory::default());
        }
        let content = fs::read_to_string(&path).await?;
        Ok(serde_json::from_str(&content)?)
    }

    pub async fn save_agent_memory(&self, agent_id: &str, memory: &AgentMemory) -> Result<()> {
        let content = serde_json::to_string_pretty(memory)?;
        self.write_atomic(&self.memory_path(agent_id), &content)
            .await
    }

    pub async fn delete_agent_memory(&self, agent_id: &str) -> Result<()> {
        remove_if_exists(&self.memory_path(agent_id)).await
    }

    pub async fn load_config(&self) -> Result<FarmConfig> {
        let path = self.root.join("config.json");
        if !path.exists() {
            return Ok(FarmConfig::default());
        }
        let content = fs::read_to_string(&path).await?;
        Ok(serde_json::from_str(&content)?)
    }

    pub async fn save_config(&self, config: &FarmConfig) -> Result<()> {
        let content = serde_json::to_string_pretty(config)?;
        self.write_atomic(&self.root.join("config.json"), &content)
            .await
    }

    // ---- append-only per-agent log ----

    pub async fn append_log(&self, agent_id: &str, event: &Value) -> Result<()> {
        let path = self.log_path(agent_id);
        let mut line = serde_json::to_string(event)?;
        line.push('\n');
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        Ok(())
    }

    pub async fn read_logs(
        &self,
        agent_id: &str,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Result<Vec<Value>> {
        let path = self.log_path(agent_id);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&path).await?;
        let mut events = Vec::new();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let Ok(event) = serde_json::from_str::<Value>(line) else {
                continue;
            };
            let timestamp = event
                .get("timestamp")
                .and_then(Value::as_str)
                .and_then(|ts| ts.parse::<DateTime<Utc>>().ok());
            if let Some(since) = since {
                if !matches!(timestamp, Some(ts) if ts >= since) {
                    continue;
                }
            }
            if let Some(until) = until {
                if !matches!(timestamp, Some(ts) if ts <= until) {
                    continue;
                }
            }
            events.push(event);
        }
        Ok(events)
    }

    // ---- plumbing ----

    async fn load_collection<T: serde::de::DeserializeOwned>(&self, path: &Path) -> Result<Vec<T>> {
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(path).await?;
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&content).map_err(|e| {
            FarmError::Persistence(format!("corrupt collection {}: {}", path.display(), e))
        })
    }

    async fn save_collection<T: Serialize>(&self, path: &Path, items: &[T]) -> Result<()> {
        let content = serde_json::to_string_pretty(items)?;
        self.write_atomic(path, &content).await
    }

    /// Temp file, fsync, atomic rename.
    async fn write_atomic(&self, path: &Path, content: &str) -> Result<()> {
        let tmp_path = path.with_extension("json.tmp");
        fs::write(&tmp_path, content)
            .await
            .map_err(|e| FarmError::Persistence(format!("write {}: {}", tmp_path.display(), e)))?;

        let sync_path = tmp_path.clone();
        let synced = tokio::task::spawn_blocking(move || {
            std::fs::File::open(&sync_path).and_then(|file| file.sync_all())
        })
        .await;
        if let Ok(Err(e)) = synced {
            tracing::warn!(error = %e, "Failed to sync temp file to disk");
        }

        fs::rename(&tmp_path, path)
            .await
            .map_err(|e| FarmError::Persistence(format!("rename {}: {}", path.display(), e)))?;
        debug!(path = %path.display(), "Atomic write completed");
        Ok(())
    }

    async fn recover_interrupted_writes(&self) {
        for dir in [
            self.root.clone(),
            self.root.join("memory"),
            self.root.join("preferences"),
        ] {
            if let Ok(mut entries) = fs::read_dir(&dir).await {
                while let Ok(Some(entry)) = entries.next_entry().await {
                    let path = entry.path();
                    if path.extension().is_some_and(|ext| ext == "tmp") {
                        debug!(path = %path.display(), "Removing interrupted write");
                        let _ = fs::remove_file(&path).await;
                    }
                }
            }
        }
    }

    fn memory_path(&self, agent_id: &str) -> PathBuf {
        self.root.join("memory").join(format!("{}.json", agent_id))
    }

    fn preferences_path(&self, agent_id: &str) -> PathBuf {
        self.root
            .join("preferences")
            .join(format!("{}.json", agent_id))
    }

    fn log_path(&self, agent_id: &str) -> PathBuf {
        self.root.join("logs").join(format!("{}.jsonl", agent_id))
    }
}

async fn remove_if_exists(path: &Path) -> Result<()> {
    if path.exists() {
        fs::remove_file(path).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::goal::{GoalStatus, PlanStep, StepStatus};
    use tempfile::TempDir;

    async fn store() -> (TempDir, DataStore) {
        let dir = TempDir::new().unwrap();
        let store = DataStore::new(dir.path());
        store.init().await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_agents_round_trip() {
        let (_dir, store) = store().await;
        let agents = vec![Agent::new("Sam"), Agent::new("Alex")];
        store.save_agents(&agents).await.unwrap();

        let loaded = store.load_agents().await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].name, "Sam");
        assert_eq!(loaded[1].name, "Alex");
    }

    #[tokio::test]
    async fn test_missing_files_load_empty() {
        let (_dir, store) = store().await;
        assert!(store.load_agents().await.unwrap().is_empty());
        assert!(store.load_tasks().await.unwrap().is_empty());
        let (goals, plans) = store.load_goals().await.unwrap();
        assert!(goals.is_empty());
        assert!(plans.is_empty());
    }

    #[tokio::test]
    async fn test_goals_and_plans_share_one_file() {
        let (_dir, store) = store().await;
        let goal = AgentGoal::new("a-1", "optimize queries", "/tmp/project");
        let plan = AgentPlan {
            id: "p-1".into(),
            goal_id: goal.id.clone(),
            version: 2,
            reasoning: "because".into(),
            steps: vec![{
                let mut step = PlanStep::new(&goal.id, 0, "profile");
                step.status = StepStatus::Completed;
                step
            }],
            recurring: true,
            interval_minutes: Some(5),
            cycle_goal: None,
            completion_criteria: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        store
            .save_goals(std::slice::from_ref(&goal), std::slice::from_ref(&plan))
            .await
            .unwrap();

        // The raw file is a heterogeneous array with tagged plan records.
        let raw = std::fs::read_to_string(store.root().join("goals.json")).unwrap();
        assert!(raw.contains("\"_type\": \"plan\""));

        let (goals, plans) = store.load_goals().await.unwrap();
        assert_eq!(goals.len(), 1);
        assert_eq!(goals[0].status, GoalStatus::Active);
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].version, 2);
        assert!(plans[0].recurring);
    }

    #[tokio::test]
    async fn test_append_and_filter_logs() {
        let (_dir, store) = store().await;
        let early = serde_json::json!({"timestamp": "2026-01-01T00:00:00Z", "type": "agent_hired"});
        let late = serde_json::json!({"timestamp": "2026-06-01T00:00:00Z", "type": "agent_fired"});
        store.append_log("a-1", &early).await.unwrap();
        store.append_log("a-1", &late).await.unwrap();

        let all = store.read_logs("a-1", None, None).await.unwrap();
        assert_eq!(all.len(), 2);

        let since = "2026-03-01T00:00:00Z".parse().unwrap();
        let filtered = store.read_logs("a-1", Some(since), None).await.unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0]["type"], "agent_fired");
    }

    #[tokio::test]
    async fn test_interrupted_write_recovery() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("agents.json.tmp"), "partial").unwrap();
        let store = DataStore::new(dir.path());
        store.init().await.unwrap();
        assert!(!dir.path().join("agents.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_memory_round_trip_and_delete() {
        let (_dir, store) = store().await;
        let mut memory = AgentMemory::default();
        memory.push(crate::agent::ConversationEntry {
            role: "user".into(),
            content: "hello".into(),
            task_id: None,
            timestamp: Utc::now(),
        });
        store.save_agent_memory("a-1", &memory).await.unwrap();

        let loaded = store.load_agent_memory("a-1").await.unwrap();
        assert_eq!(loaded.conversations.len(), 1);

        store.delete_agent_memory("a-1").await.unwrap();
        assert!(store
            .load_agent_memory("a-1")
            .await
            .unwrap()
            .conversations
            .is_empty());
    }
}

//! Ephemeral task records: one per dispatched worker invocation.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::bus::{BusEvent, EventBus};
use crate::error::{FarmError, Result};
use crate::store::DataStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskLogEntry {
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub description: String,
    #[serde(default)]
    pub assigned_agent_id: Option<String>,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub logs: Vec<TaskLogEntry>,
}

impl Task {
    /// Logs are ring-buffered to the most recent entries.
    pub const MAX_LOGS: usize = 100;

    pub fn new(description: impl Into<String>, assigned_agent_id: Option<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            description: description.into(),
            assigned_agent_id,
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
            logs: Vec::new(),
        }
    }

    pub fn push_log(&mut self, message: impl Into<String>) {
        self.logs.push(TaskLogEntry {
            timestamp: Utc::now(),
            message: message.into(),
        });
        if self.logs.len() > Self::MAX_LOGS {
            let excess = self.logs.len() - Self::MAX_LOGS;
            self.logs.drain(..excess);
        }
    }
}

pub struct TaskManager {
    store: Arc<DataStore>,
    bus: Arc<EventBus>,
    tasks: RwLock<HashMap<String, Task>>,
}

impl TaskManager {
    pub async fn load(store: Arc<DataStore>, bus: Arc<EventBus>) -> Result<Self> {
        let tasks = store
            .load_tasks()
            .await?
            .into_iter()
            .map(|t| (t.id.clone(), t))
            .collect();
        Ok(Self {
            store,
            bus,
            tasks: RwLock::new(tasks),
        })
    }

    pub fn get(&self, id: &str) -> Option<Task> {
        self.tasks.read().get(id).cloned()
    }

    pub fn list(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self.tasks.read().values().cloned().collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        tasks
    }

    pub async fn create_task(
        &self,
        description: impl Into<String>,
        assigned_agent_id: Option<String>,
    ) -> Task {
        let task = Task::new(description, assigned_agent_id);
        self.tasks.write().insert(task.id.clone(), task.clone());
        self.bus.publish(BusEvent::TaskCreated {
            task_id: task.id.clone(),
            agent_id: task.assigned_agent_id.clone(),
            description: task.description.clone(),
        });
        self.persist().await;
        task
    }

    pub async fn start_task(&self, id: &str) -> Result<()> {
        self.update(id, |task| {
            task.status = TaskStatus::InProgress;
            task.started_at = Some(Utc::now());
        })?;
        self.bus.publish(BusEvent::TaskStarted {
            task_id: id.to_string(),
        });
        self.persist().await;
        Ok(())
    }

    pub async fn complete_task(&self, id: &str, result: impl Into<String>) -> Result<()> {
        let result = result.into();
        self.update(id, |task| {
            task.status = TaskStatus::Completed;
            task.completed_at = Some(Utc::now());
            task.result = Some(result.clone());
        })?;
        self.bus.publish(BusEvent::TaskCompleted {
            task_id: id.to_string(),
        });
        self.persist().await;
        Ok(())
    }

    pub async fn fail_task(&self, id: &str, error: impl Into<String>) -> Result<()> {
        let error = error.into();
        self.update(id, |task| {
            task.status = TaskStatus::Failed;
            task.completed_at = Some(Utc::now());
            task.result = Some(error.clone());
        })?;
        self.bus.publish(BusEvent::TaskFailed {
            task_id: id.to_string(),
            error,
        });
        self.persist().await;
        Ok(())
    }

    pub async fn add_log(&self, id: &str, message: impl Into<String>) -> Result<()> {
        let message = message.into();
        self.update(id, |task| task.push_log(message.clone()))?;
        self.bus.publish(BusEvent::TaskLog {
            task_id: id.to_string(),
            message,
        });
        self.persist().await;
        Ok(())
    }

    /// Tasks persisted as in-progress across a restart can never finish;
    /// the startup sweep fails them.
    pub async fn fail_interrupted(&self) -> Vec<String> {
        let interrupted: Vec<String> = self
            .tasks
            .read()
            .values()
            .filter(|t| t.status == TaskStatus::InProgress)
            .map(|t| t.id.clone())
            .collect();
        for id in &interrupted {
            let _ = self.fail_task(id, "interrupted by restart").await;
        }
        interrupted
    }

    pub async fn delete_agent_tasks(&self, agent_id: &str) {
        self.tasks
            .write()
            .retain(|_, task| task.assigned_agent_id.as_deref() != Some(agent_id));
        self.persist().await;
    }

    fn update(&self, id: &str, mutate: impl FnOnce(&mut Task)) -> Result<()> {
        let mut tasks = self.tasks.write();
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| FarmError::TaskNotFound(id.to_string()))?;
        mutate(task);
        Ok(())
    }

    async fn persist(&self) {
        let snapshot = self.list();
        if let Err(e) = self.store.save_tasks(&snapshot).await {
            warn!(error = %e, "Failed to persist tasks");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_ring_buffer() {
        let mut task = Task::new("test", None);
        for i in 0..150 {
            task.push_log(format!("log {}", i));
        }
        assert_eq!(task.logs.len(), Task::MAX_LOGS);
        assert_eq!(task.logs[0].message, "log 50");
        assert_eq!(task.logs.last().unwrap().message, "log 149");
    }
}

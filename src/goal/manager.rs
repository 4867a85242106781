use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use tracing::warn;

use super::{AgentGoal, AgentPlan, AgentTrigger, GoalStatus, PlanStep, StepStatus};
use crate::bus::{BusEvent, EventBus};
use crate::error::{FarmError, Result};
use crate::store::DataStore;

/// Optional plan-level lifecycle fields supplied by the planner.
#[derive(Debug, Clone, Default)]
pub struct PlanLifecycle {
    pub recurring: bool,
    pub interval_minutes: Option<u32>,
    pub cycle_goal: Option<String>,
    pub completion_criteria: Option<String>,
}

/// In-place mutation of one plan step.
#[derive(Debug, Clone, Default)]
pub struct StepPatch {
    pub status: Option<StepStatus>,
    pub description: Option<String>,
    pub task_id: Option<String>,
    pub result: Option<String>,
    pub question: Option<String>,
    pub clear_question: bool,
}

impl StepPatch {
    pub fn status(status: StepStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn with_task_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn with_result(mut self, result: impl Into<String>) -> Self {
        self.result = Some(result.into());
        self
    }

    pub fn with_question(mut self, question: impl Into<String>) -> Self {
        self.question = Some(question.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn clearing_question(mut self) -> Self {
        self.clear_question = true;
        self
    }
}

pub struct GoalManager {
    store: Arc<DataStore>,
    bus: Arc<EventBus>,
    goals: RwLock<HashMap<String, AgentGoal>>,
    /// Current plan per goal; replaced wholesale on re-plan.
    plans: RwLock<HashMap<String, AgentPlan>>,
    triggers: RwLock<HashMap<String, AgentTrigger>>,
}

impl GoalManager {
    pub async fn load(store: Arc<DataStore>, bus: Arc<EventBus>) -> Result<Self> {
        let (goals, plans) = store.load_goals().await?;
        let triggers = store.load_triggers().await?;
        Ok(Self {
            store,
            bus,
            goals: RwLock::new(goals.into_iter().map(|g| (g.id.clone(), g)).collect()),
            plans: RwLock::new(plans.into_iter().map(|p| (p.goal_id.clone(), p)).collect()),
            triggers: RwLock::new(triggers.into_iter().map(|t| (t.id.clone(), t)).collect()),
        })
    }

    // ---- goals ----

    pub async fn create_goal(&self, goal: AgentGoal) -> AgentGoal {
        self.goals.write().insert(goal.id.clone(), goal.clone());
        self.bus.publish(BusEvent::GoalCreated {
            goal_id: goal.id.clone(),
            agent_id: goal.agent_id.clone(),
            description: goal.description.clone(),
        });
        self.persist_goals().await;
        goal
    }

    pub fn get_goal(&self, goal_id: &str) -> Option<AgentGoal> {
        self.goals.read().get(goal_id).cloned()
    }

    pub fn list_goals(&self, agent_id: Option<&str>) -> Vec<AgentGoal> {
        let mut goals: Vec<AgentGoal> = self
            .goals
            .read()
            .values()
            .filter(|g| agent_id.is_none() || agent_id == Some(g.agent_id.as_str()))
            .cloned()
            .collect();
        goals.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        goals
    }

    /// The goal a bare agent reference resolves to: the newest active goal,
    /// else the newest paused one.
    pub fn find_goal_for_agent(&self, agent_id: &str) -> Option<AgentGoal> {
        let goals = self.list_goals(Some(agent_id));
        goals
            .iter()
            .rev()
            .find(|g| g.status == GoalStatus::Active)
            .or_else(|| goals.iter().rev().find(|g| g.status == GoalStatus::Paused))
            .cloned()
    }

    pub async fn update_goal_status(&self, goal_id: &str, status: GoalStatus) -> Result<()> {
        let (agent_id, applied) = {
            let mut goals = self.goals.write();
            let goal = goals
                .get_mut(goal_id)
                .ok_or_else(|| FarmError::GoalNotFound(goal_id.to_string()))?;
            if goal.status == status {
                (goal.agent_id.clone(), false)
            } else if goal.status.can_transition_to(status) {
                goal.status = status;
                goal.updated_at = Utc::now();
                (goal.agent_id.clone(), true)
            } else {
                return Err(FarmError::InvalidGoalState {
                    expected: goal
                        .status
                        .allowed_transitions()
                        .iter()
                        .map(|s| s.to_string())
                        .collect::<Vec<_>>()
                        .join("|"),
                    actual: status.to_string(),
                });
            }
        };
        if applied {
            self.bus.publish(BusEvent::GoalUpdated {
                goal_id: goal_id.to_string(),
                agent_id,
                status: status.to_string(),
            });
            self.persist_goals().await;
        }
        Ok(())
    }

    pub async fn add_constraint(&self, goal_id: &str, constraint: impl Into<String>) -> Result<()> {
        {
            let mut goals = self.goals.write();
            let goal = goals
                .get_mut(goal_id)
                .ok_or_else(|| FarmError::GoalNotFound(goal_id.to_string()))?;
            goal.constraints.push(constraint.into());
            goal.updated_at = Utc::now();
        }
        self.persist_goals().await;
        Ok(())
    }

    pub async fn set_working_directory(&self, goal_id: &str, dir: PathBuf) -> Result<()> {
        {
            let mut goals = self.goals.write();
            let goal = goals
                .get_mut(goal_id)
                .ok_or_else(|| FarmError::GoalNotFound(goal_id.to_string()))?;
            goal.working_directory = dir;
            goal.updated_at = Utc::now();
        }
        self.persist_goals().await;
        Ok(())
    }

    /// Remove everything owned by the agent. Returns the ids of removed
    /// triggers so live timers can be torn down.
    pub async fn delete_agent_goals(&self, agent_id: &str) -> Vec<String> {
        let goal_ids: Vec<String> = {
            let mut goals = self.goals.write();
            let ids: Vec<String> = goals
                .values()
                .filter(|g| g.agent_id == agent_id)
                .map(|g| g.id.clone())
                .collect();
            goals.retain(|_, g| g.agent_id != agent_id);
            ids
        };
        {
            let mut plans = self.plans.write();
            for goal_id in &goal_ids {
                plans.remove(goal_id);
            }
        }
        let trigger_ids: Vec<String> = {
            let mut triggers = self.triggers.write();
            let ids: Vec<String> = triggers
                .values()
                .filter(|t| t.agent_id == agent_id)
                .map(|t| t.id.clone())
                .collect();
            triggers.retain(|_, t| t.agent_id != agent_id);
            ids
        };
        self.persist_goals().await;
        self.persist_triggers().await;
        trigger_ids
    }

    // ---- plans ----

    pub async fn set_plan(
        &self,
        goal_id: &str,
        step_descriptions: Vec<String>,
        reasoning: impl Into<String>,
        lifecycle: Option<PlanLifecycle>,
    ) -> Result<AgentPlan> {
        if self.get_goal(goal_id).is_none() {
            return Err(FarmError::GoalNotFound(goal_id.to_string()));
        }
        let lifecycle = lifecycle.unwrap_or_default();
        let now = Utc::now();
        let plan = {
            let mut plans = self.plans.write();
            let version = plans.get(goal_id).map(|p| p.version + 1).unwrap_or(1);
            let plan = AgentPlan {
                id: uuid::Uuid::new_v4().to_string(),
                goal_id: goal_id.to_string(),
                version,
                reasoning: reasoning.into(),
                steps: step_descriptions
                    .into_iter()
                    .enumerate()
                    .map(|(order, description)| PlanStep::new(goal_id, order, description))
                    .collect(),
                recurring: lifecycle.recurring,
                interval_minutes: lifecycle.interval_minutes,
                cycle_goal: lifecycle.cycle_goal,
                completion_criteria: lifecycle.completion_criteria,
                created_at: now,
                updated_at: now,
            };
            plans.insert(goal_id.to_string(), plan.clone());
            plan
        };
        self.bus.publish(BusEvent::PlanCreated {
            goal_id: goal_id.to_string(),
            plan_id: plan.id.clone(),
            version: plan.version,
            steps: plan.steps.len(),
        });
        self.persist_goals().await;
        Ok(plan)
    }

    pub fn get_current_plan(&self, goal_id: &str) -> Option<AgentPlan> {
        self.plans.read().get(goal_id).cloned()
    }

    pub async fn update_plan_step(
        &self,
        goal_id: &str,
        step_id: &str,
        patch: StepPatch,
    ) -> Result<PlanStep> {
        let (step, status_changed) = {
            let mut plans = self.plans.write();
            let plan = plans
                .get_mut(goal_id)
                .ok_or_else(|| FarmError::GoalNotFound(goal_id.to_string()))?;
            let step = plan
                .steps
                .iter_mut()
                .find(|s| s.id == step_id)
                .ok_or_else(|| FarmError::Other(format!("step not found: {}", step_id)))?;

            let status_changed = patch.status.filter(|s| *s != step.status);
            if let Some(status) = patch.status {
                step.status = status;
                if status == StepStatus::Completed {
                    step.completed_at = Some(Utc::now());
                }
            }
            if let Some(description) = patch.description {
                step.description = description;
            }
            if let Some(task_id) = patch.task_id {
                step.task_id = Some(task_id);
            }
            if let Some(result) = patch.result {
                step.result = Some(result);
            }
            if patch.clear_question {
                step.question = None;
            } else if let Some(question) = patch.question {
                step.question = Some(question);
            }
            plan.updated_at = Utc::now();
            (step.clone(), status_changed)
        };

        match status_changed {
            Some(StepStatus::InProgress) => self.bus.publish(BusEvent::StepStarted {
                goal_id: goal_id.to_string(),
                step_id: step.id.clone(),
                order: step.order,
            }),
            Some(StepStatus::Completed) => self.bus.publish(BusEvent::StepCompleted {
                goal_id: goal_id.to_string(),
                step_id: step.id.clone(),
                order: step.order,
            }),
            Some(StepStatus::Failed) => self.bus.publish(BusEvent::StepFailed {
                goal_id: goal_id.to_string(),
                step_id: step.id.clone(),
                order: step.order,
                error: step.result.clone().unwrap_or_default(),
            }),
            _ => {}
        }
        self.persist_goals().await;
        Ok(step)
    }

    pub fn get_next_pending_step(&self, goal_id: &str) -> Option<PlanStep> {
        self.plans
            .read()
            .get(goal_id)
            .and_then(|p| p.next_pending_step().cloned())
    }

    pub fn get_blocked_step(&self, goal_id: &str) -> Option<PlanStep> {
        self.plans
            .read()
            .get(goal_id)
            .and_then(|p| p.blocked_step().cloned())
    }

    // ---- triggers ----

    pub async fn create_trigger(&self, trigger: AgentTrigger) -> AgentTrigger {
        self.triggers
            .write()
            .insert(trigger.id.clone(), trigger.clone());
        self.persist_triggers().await;
        trigger
    }

    pub fn get_trigger(&self, trigger_id: &str) -> Option<AgentTrigger> {
        self.triggers.read().get(trigger_id).cloned()
    }

    pub fn list_triggers(&self) -> Vec<AgentTrigger> {
        let mut triggers: Vec<AgentTrigger> = self.triggers.read().values().cloned().collect();
        triggers.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        triggers
    }

    pub fn triggers_for_goal(&self, goal_id: &str) -> Vec<AgentTrigger> {
        self.triggers
            .read()
            .values()
            .filter(|t| t.goal_id == goal_id)
            .cloned()
            .collect()
    }

    pub async fn remove_trigger(&self, trigger_id: &str) -> Result<AgentTrigger> {
        let removed = self
            .triggers
            .write()
            .remove(trigger_id)
            .ok_or_else(|| FarmError::TriggerNotFound(trigger_id.to_string()))?;
        self.persist_triggers().await;
        Ok(removed)
    }

    pub async fn set_trigger_next_fire(
        &self,
        trigger_id: &str,
        next_fire_at: chrono::DateTime<Utc>,
    ) -> Result<()> {
        {
            let mut triggers = self.triggers.write();
            let trigger = triggers
                .get_mut(trigger_id)
                .ok_or_else(|| FarmError::TriggerNotFound(trigger_id.to_string()))?;
            trigger.next_fire_at = Some(next_fire_at);
        }
        self.persist_triggers().await;
        Ok(())
    }

    pub async fn mark_trigger_fired(
        &self,
        trigger_id: &str,
        next_fire_at: Option<chrono::DateTime<Utc>>,
    ) -> Result<()> {
        {
            let mut triggers = self.triggers.write();
            let trigger = triggers
                .get_mut(trigger_id)
                .ok_or_else(|| FarmError::TriggerNotFound(trigger_id.to_string()))?;
            trigger.last_fired_at = Some(Utc::now());
            trigger.next_fire_at = next_fire_at;
        }
        self.persist_triggers().await;
        Ok(())
    }

    // ---- persistence ----

    async fn persist_goals(&self) {
        let goals: Vec<AgentGoal> = self.goals.read().values().cloned().collect();
        let plans: Vec<AgentPlan> = self.plans.read().values().cloned().collect();
        if let Err(e) = self.store.save_goals(&goals, &plans).await {
            warn!(error = %e, "Failed to persist goals");
        }
    }

    async fn persist_triggers(&self) {
        let triggers = self.list_triggers();
        if let Err(e) = self.store.save_triggers(&triggers).await {
            warn!(error = %e, "Failed to persist triggers");
        }
    }
}

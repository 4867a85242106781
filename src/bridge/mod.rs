//! Facade composing the managers behind one dispatch surface.
//!
//! The bridge enforces the per-agent single-flight rule, sweeps stale state
//! at startup, and settles the bookkeeping when a session ends: the
//! single-flight guard is released synchronously inside the bus callback
//! (later subscribers observe the agent as free), while transcript and
//! counter updates run as a spawned follow-up.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::agent::{AgentManager, AgentState};
use crate::bus::{BusEvent, EventBus, Topic};
use crate::error::{FarmError, Result};
use crate::goal::GoalManager;
use crate::preference::PreferenceManager;
use crate::session::{SessionManager, SessionStatus};
use crate::task::TaskManager;

/// Inputs to the worker prompt template.
#[derive(Debug, Default)]
pub struct WorkerPromptArgs<'a> {
    pub agent_name: &'a str,
    pub goal_description: &'a str,
    pub instruction: &'a str,
    pub prior_context: &'a str,
    pub working_dir: &'a str,
    pub workspace_roots: &'a [PathBuf],
    pub constraints: &'a [String],
    pub preference_context: &'a str,
}

pub struct Bridge {
    agents: Arc<AgentManager>,
    tasks: Arc<TaskManager>,
    sessions: Arc<SessionManager>,
    goals: Arc<GoalManager>,
    preferences: Arc<PreferenceManager>,
    bus: Arc<EventBus>,
    /// Per-agent single-flight guard against concurrent dispatch.
    active_executions: Arc<Mutex<HashSet<String>>>,
}

impl Bridge {
    pub fn new(
        agents: Arc<AgentManager>,
        tasks: Arc<TaskManager>,
        sessions: Arc<SessionManager>,
        goals: Arc<GoalManager>,
        preferences: Arc<PreferenceManager>,
        bus: Arc<EventBus>,
    ) -> Arc<Self> {
        Arc::new(Self {
            agents,
            tasks,
            sessions,
            goals,
            preferences,
            bus,
            active_executions: Arc::new(Mutex::new(HashSet::new())),
        })
    }

    pub fn agents(&self) -> &Arc<AgentManager> {
        &self.agents
    }

    pub fn tasks(&self) -> &Arc<TaskManager> {
        &self.tasks
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn goals(&self) -> &Arc<GoalManager> {
        &self.goals
    }

    pub fn preferences(&self) -> &Arc<PreferenceManager> {
        &self.preferences
    }

    /// Sweep state left over from a previous run and register the
    /// session-ended handler. Must be called before any other component
    /// subscribes to `session_ended`, so the guard release happens first.
    pub async fn initialize(self: &Arc<Self>) -> Result<()> {
        for agent in self.agents.list() {
            if matches!(agent.state, AgentState::Working | AgentState::Thinking) {
                self.agents.update_state(&agent.id, AgentState::Idle).await?;
            }
        }
        let interrupted = self.tasks.fail_interrupted().await;
        if !interrupted.is_empty() {
            info!(count = interrupted.len(), "Failed tasks interrupted by restart");
        }

        let bridge = Arc::downgrade(self);
        self.bus.subscribe(Topic::SessionEnded, move |envelope| {
            let Some(bridge) = bridge.upgrade() else {
                return;
            };
            if let BusEvent::SessionEnded {
                agent_id,
                task_id,
                status,
                result,
                tokens_used,
                ..
            } = &envelope.event
            {
                bridge.active_executions.lock().remove(agent_id);
                bridge.agents.release_task(agent_id, task_id);
                bridge.spawn_settlement(
                    agent_id.clone(),
                    task_id.clone(),
                    *status,
                    result.clone(),
                    *tokens_used,
                );
            }
        });
        Ok(())
    }

    pub fn is_agent_busy(&self, agent_id: &str) -> bool {
        self.active_executions.lock().contains(agent_id)
    }

    /// Start a worker session for the task, or fail fast when the agent is
    /// already executing.
    pub async fn dispatch_worker(
        &self,
        agent_id: &str,
        task_id: &str,
        max_turns: Option<u32>,
        working_dir: Option<PathBuf>,
        prompt: Option<String>,
    ) -> Result<String> {
        let agent = self
            .agents
            .get(agent_id)
            .ok_or_else(|| FarmError::AgentNotFound(agent_id.to_string()))?;
        let task = self
            .tasks
            .get(task_id)
            .ok_or_else(|| FarmError::TaskNotFound(task_id.to_string()))?;

        if !self.active_executions.lock().insert(agent_id.to_string()) {
            return Err(FarmError::AgentBusy(agent.name));
        }

        let working_dir =
            working_dir.unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| "/".into()));
        let prompt = prompt.unwrap_or_else(|| task.description.clone());

        let started = self
            .start_worker(&agent, task_id, &prompt, &working_dir, max_turns)
            .await;

        match started {
            Ok(session_id) => Ok(session_id),
            Err(e) => {
                self.active_executions.lock().remove(agent_id);
                let _ = self.agents.update_state(agent_id, AgentState::Idle).await;
                let _ = self.agents.unassign_task(agent_id).await;
                let _ = self
                    .tasks
                    .fail_task(task_id, format!("worker spawn failed: {}", e))
                    .await;
                Err(e)
            }
        }
    }

    async fn start_worker(
        &self,
        agent: &crate::agent::Agent,
        task_id: &str,
        prompt: &str,
        working_dir: &std::path::Path,
        max_turns: Option<u32>,
    ) -> Result<String> {
        self.agents
            .update_state(&agent.id, AgentState::Working)
            .await?;
        self.agents.assign_task(&agent.id, task_id).await?;
        self.tasks.start_task(task_id).await?;

        let allowed_tools: Vec<String> = agent.approved_tools.iter().cloned().collect();
        self.sessions
            .start_session(
                &agent.id,
                task_id,
                prompt,
                working_dir,
                agent.system_prompt.clone(),
                allowed_tools,
                max_turns,
                Vec::new(),
            )
            .await
    }

    /// Kill the agent's running session, if any. The terminal close event
    /// settles the rest.
    pub async fn cancel_execution(&self, agent_id: &str) -> Result<()> {
        let session = self
            .sessions
            .active_session_for_agent(agent_id)
            .ok_or_else(|| FarmError::NoActiveSession(agent_id.to_string()))?;
        self.sessions.stop_session(&session.id).await
    }

    /// Resolve a pending denial, grow the agent's approved set, and resume
    /// the session once nothing is pending.
    pub async fn approve_tool_permission(&self, agent_id: &str, tool: &str) -> Result<bool> {
        let session = self
            .sessions
            .active_session_for_agent(agent_id)
            .ok_or_else(|| FarmError::NoActiveSession(agent_id.to_string()))?;

        let resolution = self.sessions.approve_permission(&session.id, tool)?;
        if let Some(canonical) = &resolution.resolved {
            self.agents.add_approved_tool(agent_id, canonical).await?;
        }

        // Resume only when this approval cleared the last pending denial;
        // approving an already-approved tool is a no-op.
        if resolution.all_approved && resolution.resolved.is_some() {
            let agent = self
                .agents
                .get(agent_id)
                .ok_or_else(|| FarmError::AgentNotFound(agent_id.to_string()))?;
            let allowed_tools: Vec<String> = agent.approved_tools.iter().cloned().collect();
            self.sessions
                .resume_session(&session.id, allowed_tools, &session.working_dir)
                .await?;
        }
        Ok(resolution.all_approved)
    }

    pub fn deny_tool_permission(&self, agent_id: &str) -> Result<()> {
        let session = self
            .sessions
            .active_session_for_agent(agent_id)
            .ok_or_else(|| FarmError::NoActiveSession(agent_id.to_string()))?;
        self.sessions.deny_permission(&session.id)
    }

    /// Full fire cascade. Returns the removed trigger ids so live timers
    /// can be torn down by the scheduler's owner.
    pub async fn fire_agent(&self, agent_id: &str) -> Result<(String, Vec<String>)> {
        if self.sessions.active_session_for_agent(agent_id).is_some() {
            if let Err(e) = self.cancel_execution(agent_id).await {
                warn!(agent_id = %agent_id, error = %e, "Failed to cancel session during fire");
            }
        }
        self.active_executions.lock().remove(agent_id);
        self.tasks.delete_agent_tasks(agent_id).await;
        let removed_triggers = self.goals.delete_agent_goals(agent_id).await;
        self.preferences.clear_agent(agent_id).await;
        let agent = self.agents.fire(agent_id).await?;
        Ok((agent.name, removed_triggers))
    }

    /// Compose the prompt handed to a step worker. Worker sessions are
    /// stateless across steps, so everything needed must be inside.
    pub fn build_worker_prompt(&self, args: WorkerPromptArgs<'_>) -> String {
        let roots = if args.workspace_roots.is_empty() {
            "(none configured)".to_string()
        } else {
            args.workspace_roots
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        };
        let constraints = if args.constraints.is_empty() {
            "(none)".to_string()
        } else {
            args.constraints
                .iter()
                .map(|c| format!("- {}", c))
                .collect::<Vec<_>>()
                .join("\n")
        };
        let prior_context = if args.prior_context.is_empty() {
            "(no prior steps)"
        } else {
            args.prior_context
        };

        format!(
            r#"You are {agent_name}, working toward this goal: "{goal}"
Work the goal exactly as stated; do not reinterpret or expand it.

<prior_context>
{prior_context}
</prior_context>

<worker_instruction>
{instruction}
</worker_instruction>

Working directory: {working_dir}
Workspace roots: {roots}

Constraints:
{constraints}

{preference_context}

When you finish, end your message with a <step_summary> block recording what
you did and anything the next step needs to know. If you cannot proceed
without operator input, end your message with:
[NEEDS_INPUT]: <your question>"#,
            agent_name = args.agent_name,
            goal = args.goal_description,
            prior_context = prior_context,
            instruction = args.instruction,
            working_dir = args.working_dir,
            roots = roots,
            constraints = constraints,
            preference_context = args.preference_context,
        )
    }

    fn spawn_settlement(
        self: &Arc<Self>,
        agent_id: String,
        task_id: String,
        status: SessionStatus,
        result: String,
        tokens_used: u64,
    ) {
        let bridge = Arc::clone(self);
        tokio::spawn(async move {
            if tokens_used > 0 {
                let _ = bridge.agents.add_tokens_used(&agent_id, tokens_used).await;
            }

            let task_description = bridge
                .tasks
                .get(&task_id)
                .map(|t| t.description)
                .unwrap_or_default();
            let _ = bridge
                .tasks
                .add_log(&task_id, format!("session ended: {}", status))
                .await;
            let settled = match status {
                SessionStatus::Error => {
                    bridge
                        .tasks
                        .fail_task(&task_id, if result.is_empty() {
                            "worker session failed".to_string()
                        } else {
                            result.clone()
                        })
                        .await
                }
                _ => bridge.tasks.complete_task(&task_id, result.clone()).await,
            };
            if let Err(e) = settled {
                warn!(task_id = %task_id, error = %e, "Failed to settle task after session end");
            }

            let _ = bridge
                .agents
                .add_conversation(&agent_id, "user", task_description, Some(task_id.clone()))
                .await;
            let _ = bridge
                .agents
                .add_conversation(&agent_id, "assistant", result, Some(task_id))
                .await;
        });
    }
}

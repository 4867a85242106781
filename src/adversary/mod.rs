//! The orchestration brain: recon, planning, step execution, evaluation,
//! refinement, and escalation.
//!
//! All state transitions run on one driver task fed by a directive queue,
//! so steps for a goal execute strictly sequentially: a step settles before
//! the next is dispatched. Oracle calls are the loop's only long awaits.

mod prompts;
mod responses;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc::{self, UnboundedSender};
use tracing::{debug, info, warn};

use crate::bridge::{Bridge, WorkerPromptArgs};
use crate::bus::{BusEvent, EventBus, Topic};
use crate::config::ConfigManager;
use crate::error::{FarmError, Result};
use crate::goal::{AgentGoal, GoalStatus, PlanLifecycle, PlanStep, StepPatch, StepStatus};
use crate::oracle::{complete_structured, Oracle};
use crate::preference::{scan_usage_markers, ExtractionInput};
use crate::session::SessionStatus;

pub use responses::{parse_plan, Verdict};

use responses::{AutoAnswerReply, RefineReply, VerdictReply, SKIP_SENTINEL};

/// Attempts per step: the first execution plus two retries.
const MAX_RETRIES_PER_STEP: u32 = 2;

const NEEDS_INPUT_MARKER: &str = "[NEEDS_INPUT]:";

#[derive(Debug)]
enum Directive {
    Wake {
        goal_id: String,
    },
    Reply {
        goal_id: String,
        answer: String,
    },
    SessionEnded {
        task_id: String,
        status: SessionStatus,
        result: String,
    },
}

#[derive(Debug, Clone)]
struct StepRef {
    goal_id: String,
    step_id: String,
}

pub struct Adversary {
    inner: Arc<Inner>,
    directives: UnboundedSender<Directive>,
}

struct Inner {
    bridge: Arc<Bridge>,
    oracle: Arc<dyn Oracle>,
    config: Arc<ConfigManager>,
    bus: Arc<EventBus>,
    active_goals: Mutex<HashSet<String>>,
    step_tasks: Mutex<HashMap<String, StepRef>>,
    recon_tasks: Mutex<HashMap<String, String>>,
    recon_results: Mutex<HashMap<String, String>>,
    retries: Mutex<HashMap<String, u32>>,
}

impl Adversary {
    pub fn new(
        bridge: Arc<Bridge>,
        oracle: Arc<dyn Oracle>,
        config: Arc<ConfigManager>,
        bus: Arc<EventBus>,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            bridge,
            oracle,
            config,
            bus,
            active_goals: Mutex::new(HashSet::new()),
            step_tasks: Mutex::new(HashMap::new()),
            recon_tasks: Mutex::new(HashMap::new()),
            recon_results: Mutex::new(HashMap::new()),
            retries: Mutex::new(HashMap::new()),
        });
        let adversary = Arc::new(Self {
            inner: Arc::clone(&inner),
            directives: tx,
        });
        adversary.start(rx);
        adversary
    }

    /// Spawn the serial driver and register for session terminations. The
    /// Bridge must already have subscribed, so its single-flight guard is
    /// released before a directive is processed.
    fn start(self: &Arc<Self>, mut rx: mpsc::UnboundedReceiver<Directive>) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            while let Some(directive) = rx.recv().await {
                inner.handle(directive).await;
            }
        });

        let directives = self.directives.clone();
        self.inner.bus.subscribe(Topic::SessionEnded, move |envelope| {
            if let BusEvent::SessionEnded {
                task_id,
                status,
                result,
                ..
            } = &envelope.event
            {
                let _ = directives.send(Directive::SessionEnded {
                    task_id: task_id.clone(),
                    status: *status,
                    result: result.clone(),
                });
            }
        });
    }

    /// Begin (or continue) working a goal. Ignored when the goal is
    /// terminal, already being worked, or its agent is busy.
    pub fn wake(&self, goal_id: &str) {
        let _ = self.directives.send(Directive::Wake {
            goal_id: goal_id.to_string(),
        });
    }

    pub async fn pause(&self, goal_id: &str) -> Result<()> {
        let goal = self
            .inner
            .bridge
            .goals()
            .get_goal(goal_id)
            .ok_or_else(|| FarmError::GoalNotFound(goal_id.to_string()))?;
        if goal.status == GoalStatus::Active {
            self.inner
                .bridge
                .goals()
                .update_goal_status(goal_id, GoalStatus::Paused)
                .await?;
        }
        self.inner.active_goals.lock().remove(goal_id);
        Ok(())
    }

    /// Answer the blocked step's question. Valid only while a step is
    /// blocked.
    pub fn reply(&self, goal_id: &str, answer: &str) -> Result<()> {
        if self.inner.bridge.goals().get_blocked_step(goal_id).is_none() {
            return Err(FarmError::NoBlockedStep(goal_id.to_string()));
        }
        let _ = self.directives.send(Directive::Reply {
            goal_id: goal_id.to_string(),
            answer: answer.to_string(),
        });
        Ok(())
    }

    /// Out-of-band Q&A about an agent's work. No worker is involved.
    pub async fn talk(
        &self,
        agent_id: &str,
        message: &str,
        activity_summary: Option<&str>,
    ) -> Result<String> {
        let agent = self
            .inner
            .bridge
            .agents()
            .get(agent_id)
            .ok_or_else(|| FarmError::AgentNotFound(agent_id.to_string()))?;
        let goal = self.inner.bridge.goals().find_goal_for_agent(agent_id);
        let plan = goal
            .as_ref()
            .and_then(|g| self.inner.bridge.goals().get_current_plan(&g.id));

        let prompt = prompts::talk_prompt(
            &agent.name,
            goal.as_ref(),
            plan.as_ref(),
            activity_summary,
            message,
        );
        let reply = self
            .inner
            .oracle
            .complete(agent.system_prompt.as_deref(), &prompt)
            .await;
        match reply.error {
            Some(error) => Err(FarmError::Oracle(error)),
            None => Ok(reply.content),
        }
    }

    pub fn is_goal_active(&self, goal_id: &str) -> bool {
        self.inner.active_goals.lock().contains(goal_id)
    }
}

impl Inner {
    async fn handle(&self, directive: Directive) {
        match directive {
            Directive::Wake { goal_id } => self.handle_wake(&goal_id).await,
            Directive::Reply { goal_id, answer } => self.handle_reply(&goal_id, &answer).await,
            Directive::SessionEnded {
                task_id,
                status,
                result,
            } => self.handle_session_ended(&task_id, status, &result).await,
        }
    }

    async fn handle_wake(&self, goal_id: &str) {
        let Some(goal) = self.bridge.goals().get_goal(goal_id) else {
            return;
        };

        let goal = match goal.status {
            GoalStatus::Paused => {
                if let Err(e) = self
                    .bridge
                    .goals()
                    .update_goal_status(goal_id, GoalStatus::Active)
                    .await
                {
                    warn!(goal_id = %goal_id, error = %e, "Failed to resume paused goal");
                    return;
                }
                self.bridge.goals().get_goal(goal_id).unwrap_or(goal)
            }
            GoalStatus::Active => goal,
            GoalStatus::Completed | GoalStatus::Failed => return,
        };

        if self.active_goals.lock().contains(goal_id) {
            debug!(goal_id = %goal_id, "Wake ignored: goal already being worked");
            return;
        }
        if self.bridge.is_agent_busy(&goal.agent_id) {
            debug!(goal_id = %goal_id, "Wake ignored: agent busy");
            return;
        }
        self.active_goals.lock().insert(goal_id.to_string());
        info!(goal_id = %goal_id, agent_id = %goal.agent_id, "Waking goal");

        if self.bridge.goals().get_blocked_step(goal_id).is_some() {
            // Still waiting on the operator.
            return;
        }

        match self.bridge.goals().get_next_pending_step(goal_id) {
            Some(step) => self.execute_step(&goal, &step, None).await,
            None => self.run_recon(&goal).await,
        }
    }

    async fn handle_reply(&self, goal_id: &str, answer: &str) {
        let Some(goal) = self.bridge.goals().get_goal(goal_id) else {
            return;
        };
        let Some(step) = self.bridge.goals().get_blocked_step(goal_id) else {
            return;
        };
        let question = step.question.clone().unwrap_or_default();
        self.active_goals.lock().insert(goal_id.to_string());

        self.spawn_preference_extraction(&goal, &question, answer);

        if let Err(e) = self
            .bridge
            .goals()
            .update_plan_step(
                goal_id,
                &step.id,
                StepPatch::status(StepStatus::InProgress).clearing_question(),
            )
            .await
        {
            warn!(goal_id = %goal_id, error = %e, "Failed to unblock step");
            return;
        }

        let prompt = prompts::resumed_instruction_prompt(&goal, &step, &question, answer);
        let reply = self.oracle.complete(None, &prompt).await;
        if let Some(error) = reply.error {
            self.oracle_failure("resumed-step crafting", &error);
            self.fail_goal(goal_id).await;
            return;
        }
        self.dispatch_step(&goal, &step, reply.content).await;
    }

    async fn handle_session_ended(&self, task_id: &str, status: SessionStatus, result: &str) {
        let recon_goal = self.recon_tasks.lock().remove(task_id);
        if let Some(goal_id) = recon_goal {
            self.handle_recon_finished(&goal_id, status, result).await;
            return;
        }

        let step_ref = self.step_tasks.lock().remove(task_id);
        if let Some(step_ref) = step_ref {
            self.handle_step_finished(&step_ref, status, result).await;
            return;
        }

        // A one-off dispatch (operator `assign`); count it when it landed.
        if status == SessionStatus::Completed {
            if let Some(agent_id) = self
                .bridge
                .tasks()
                .get(task_id)
                .and_then(|t| t.assigned_agent_id)
            {
                let _ = self
                    .bridge
                    .agents()
                    .increment_tasks_completed(&agent_id)
                    .await;
            }
        }
    }

    async fn handle_recon_finished(&self, goal_id: &str, status: SessionStatus, result: &str) {
        let Some(goal) = self.bridge.goals().get_goal(goal_id) else {
            self.deactivate(goal_id);
            return;
        };
        if goal.status != GoalStatus::Active {
            self.deactivate(goal_id);
            return;
        }

        if status == SessionStatus::Completed && !result.trim().is_empty() {
            self.recon_results
                .lock()
                .insert(goal_id.to_string(), result.to_string());
        } else {
            // Degraded but valid: plan without a report.
            warn!(goal_id = %goal_id, "Recon failed; planning without a report");
        }
        self.run_planning(&goal).await;
    }

    async fn handle_step_finished(&self, step_ref: &StepRef, status: SessionStatus, result: &str) {
        let goal_id = &step_ref.goal_id;
        let Some(goal) = self.bridge.goals().get_goal(goal_id) else {
            self.deactivate(goal_id);
            return;
        };

        if goal.status != GoalStatus::Active {
            // A pause does not preempt a running step; record the outcome
            // and stand down.
            let final_status = if status == SessionStatus::Completed {
                StepStatus::Completed
            } else {
                StepStatus::Failed
            };
            let _ = self
                .bridge
                .goals()
                .update_plan_step(
                    goal_id,
                    &step_ref.step_id,
                    StepPatch::status(final_status).with_result(result),
                )
                .await;
            self.deactivate(goal_id);
            return;
        }

        let Some(step) = self
            .bridge
            .goals()
            .get_current_plan(goal_id)
            .and_then(|p| p.steps.into_iter().find(|s| s.id == step_ref.step_id))
        else {
            // The plan was replaced underneath the running step.
            self.continue_goal(goal_id).await;
            return;
        };

        if status != SessionStatus::Completed {
            let _ = self
                .bridge
                .goals()
                .update_plan_step(
                    goal_id,
                    &step.id,
                    StepPatch::status(StepStatus::Failed).with_result(if result.is_empty() {
                        "worker session failed"
                    } else {
                        result
                    }),
                )
                .await;
            self.continue_goal(goal_id).await;
            return;
        }

        if let Some(question) = parse_needs_input(result) {
            self.auto_answer_or_escalate(&goal, &step, &question).await;
            return;
        }

        for key in scan_usage_markers(result) {
            self.bridge
                .preferences()
                .increment_usage(&goal.agent_id, &key)
                .await;
        }

        self.evaluate_step(&goal, &step, result).await;
    }

    async fn evaluate_step(&self, goal: &AgentGoal, step: &PlanStep, result: &str) {
        let prompt = prompts::evaluation_prompt(goal, step, result);
        let verdict = match complete_structured::<VerdictReply>(self.oracle.as_ref(), None, &prompt)
            .await
        {
            Ok(verdict) => verdict,
            Err(e) => {
                // Evaluation must not wedge the loop; treat as PASS.
                self.oracle_failure("step evaluation", &e.to_string());
                VerdictReply::default()
            }
        };

        debug!(
            goal_id = %goal.id,
            step_order = step.order,
            verdict = ?verdict.verdict,
            reasoning = %verdict.reasoning,
            "Step evaluated"
        );

        match verdict.verdict {
            Verdict::Pass => {
                let _ = self
                    .bridge
                    .goals()
                    .update_plan_step(
                        &goal.id,
                        &step.id,
                        StepPatch::status(StepStatus::Completed).with_result(result),
                    )
                    .await;
                let _ = self
                    .bridge
                    .agents()
                    .increment_tasks_completed(&goal.agent_id)
                    .await;
                self.run_refinement(goal).await;
                self.continue_goal(&goal.id).await;
            }
            Verdict::Retry => {
                let attempts = {
                    let mut retries = self.retries.lock();
                    let count = retries.entry(step.id.clone()).or_insert(0);
                    if *count < MAX_RETRIES_PER_STEP {
                        *count += 1;
                        Some(*count)
                    } else {
                        None
                    }
                };
                match attempts {
                    Some(attempt) => {
                        info!(goal_id = %goal.id, step_order = step.order, attempt, "Retrying step");
                        let _ = self
                            .bridge
                            .goals()
                            .update_plan_step(
                                &goal.id,
                                &step.id,
                                StepPatch::status(StepStatus::Pending).with_result(result),
                            )
                            .await;
                        self.execute_step(goal, step, verdict.refined_instruction)
                            .await;
                    }
                    None => {
                        let question = verdict.escalation_question.unwrap_or_else(|| {
                            format!(
                                "Step \"{}\" keeps failing evaluation. How should I proceed?",
                                step.description
                            )
                        });
                        self.auto_answer_or_escalate(goal, step, &question).await;
                    }
                }
            }
            Verdict::Escalate => {
                let question = verdict.escalation_question.unwrap_or_else(|| {
                    format!(
                        "Step \"{}\" needs operator guidance to continue.",
                        step.description
                    )
                });
                self.auto_answer_or_escalate(goal, step, &question).await;
            }
        }
    }

    async fn auto_answer_or_escalate(&self, goal: &AgentGoal, step: &PlanStep, question: &str) {
        let preference_context = self
            .bridge
            .preferences()
            .build_preference_context(&goal.agent_id)
            .await;
        let recon = self.recon_results.lock().get(&goal.id).cloned();
        let prompt =
            prompts::auto_answer_prompt(goal, recon.as_deref(), &preference_context, question);
        let answer = complete_structured::<AutoAnswerReply>(self.oracle.as_ref(), None, &prompt)
            .await
            .ok()
            .filter(|a| a.can_answer && !a.answer.trim().is_empty())
            .map(|a| a.answer);

        match answer {
            Some(answer) => {
                info!(goal_id = %goal.id, step_order = step.order, "Auto-answered worker question");
                let craft = prompts::resumed_instruction_prompt(goal, step, question, &answer);
                let crafted = self.oracle.complete(None, &craft).await;
                if let Some(error) = crafted.error {
                    self.oracle_failure("resumed-step crafting", &error);
                    self.fail_goal(&goal.id).await;
                    return;
                }
                let _ = self
                    .bridge
                    .goals()
                    .update_plan_step(&goal.id, &step.id, StepPatch::status(StepStatus::InProgress))
                    .await;
                self.dispatch_step(goal, step, crafted.content).await;
            }
            None => {
                info!(goal_id = %goal.id, step_order = step.order, "Escalating to operator");
                let _ = self
                    .bridge
                    .goals()
                    .update_plan_step(
                        &goal.id,
                        &step.id,
                        StepPatch::status(StepStatus::Blocked).with_question(question),
                    )
                    .await;
                self.bus.publish(BusEvent::QuestionRaised {
                    goal_id: goal.id.clone(),
                    agent_id: goal.agent_id.clone(),
                    step_id: step.id.clone(),
                    question: question.to_string(),
                });
            }
        }
    }

    async fn run_recon(&self, goal: &AgentGoal) {
        let task = self
            .bridge
            .tasks()
            .create_task(
                format!("Survey the working tree for: {}", goal.description),
                Some(goal.agent_id.clone()),
            )
            .await;
        self.recon_tasks
            .lock()
            .insert(task.id.clone(), goal.id.clone());

        let prompt = prompts::recon_instruction(goal);
        if let Err(e) = self
            .bridge
            .dispatch_worker(
                &goal.agent_id,
                &task.id,
                Some(goal.max_turns_per_step),
                Some(goal.working_directory.clone()),
                Some(prompt),
            )
            .await
        {
            warn!(goal_id = %goal.id, error = %e, "Recon dispatch failed");
            self.recon_tasks.lock().remove(&task.id);
            self.deactivate(&goal.id);
        }
    }

    async fn run_planning(&self, goal: &AgentGoal) {
        let agent_name = self
            .bridge
            .agents()
            .get(&goal.agent_id)
            .map(|a| a.name)
            .unwrap_or_else(|| "the agent".to_string());
        let preference_context = self
            .bridge
            .preferences()
            .build_preference_context(&goal.agent_id)
            .await;
        let recon = self.recon_results.lock().get(&goal.id).cloned();
        let prior_results = self
            .bridge
            .goals()
            .get_current_plan(&goal.id)
            .map(|p| prompts::prior_context(&p))
            .unwrap_or_default();

        let prompt = prompts::planning_prompt(
            goal,
            &agent_name,
            &self.config.workspace_roots(),
            recon.as_deref(),
            &prior_results,
            &preference_context,
        );
        let reply = self.oracle.complete(None, &prompt).await;
        if let Some(error) = reply.error {
            self.oracle_failure("planning", &error);
            self.fail_goal(&goal.id).await;
            return;
        }

        let Some(plan) = parse_plan(&reply.content) else {
            warn!(goal_id = %goal.id, "Planner produced no usable plan; failing goal");
            self.fail_goal(&goal.id).await;
            return;
        };

        let lifecycle = PlanLifecycle {
            recurring: plan.recurring,
            interval_minutes: plan.interval_minutes,
            cycle_goal: plan.cycle_goal,
            completion_criteria: plan.completion_criteria,
        };
        let descriptions: Vec<String> = plan.steps.into_iter().map(|s| s.description).collect();
        let stored = match self
            .bridge
            .goals()
            .set_plan(&goal.id, descriptions, plan.reasoning, Some(lifecycle))
            .await
        {
            Ok(stored) => stored,
            Err(e) => {
                warn!(goal_id = %goal.id, error = %e, "Failed to store plan");
                self.fail_goal(&goal.id).await;
                return;
            }
        };
        info!(
            goal_id = %goal.id,
            version = stored.version,
            steps = stored.steps.len(),
            "Plan stored"
        );

        if let Some(step) = self.bridge.goals().get_next_pending_step(&goal.id) {
            self.execute_step(goal, &step, None).await;
        }
    }

    /// Craft (or take) the instruction and hand the step to a worker.
    async fn execute_step(
        &self,
        goal: &AgentGoal,
        step: &PlanStep,
        instruction_override: Option<String>,
    ) {
        let instruction = match instruction_override {
            Some(instruction) if !instruction.trim().is_empty() => instruction,
            _ => {
                let prior = self
                    .bridge
                    .goals()
                    .get_current_plan(&goal.id)
                    .map(|p| prompts::prior_context(&p))
                    .unwrap_or_default();
                let prompt = prompts::craft_instruction_prompt(goal, step, &prior);
                let reply = self.oracle.complete(None, &prompt).await;
                match reply.error {
                    None if !reply.content.trim().is_empty() => reply.content,
                    None => step.description.clone(),
                    Some(error) => {
                        self.oracle_failure("instruction crafting", &error);
                        self.fail_goal(&goal.id).await;
                        return;
                    }
                }
            }
        };
        self.dispatch_step(goal, step, instruction).await;
    }

    async fn dispatch_step(&self, goal: &AgentGoal, step: &PlanStep, instruction: String) {
        let agent = self.bridge.agents().get(&goal.agent_id);
        let agent_name = agent.map(|a| a.name).unwrap_or_else(|| "agent".to_string());
        let preference_context = self
            .bridge
            .preferences()
            .build_preference_context(&goal.agent_id)
            .await;
        let prior = self
            .bridge
            .goals()
            .get_current_plan(&goal.id)
            .map(|p| prompts::prior_context(&p))
            .unwrap_or_default();
        let workspace_roots = self.config.workspace_roots();

        let worker_prompt = self.bridge.build_worker_prompt(WorkerPromptArgs {
            agent_name: &agent_name,
            goal_description: &goal.description,
            instruction: &instruction,
            prior_context: &prior,
            working_dir: &goal.working_directory.display().to_string(),
            workspace_roots: &workspace_roots,
            constraints: &goal.constraints,
            preference_context: &preference_context,
        });

        let task = self
            .bridge
            .tasks()
            .create_task(step.description.clone(), Some(goal.agent_id.clone()))
            .await;
        self.step_tasks.lock().insert(
            task.id.clone(),
            StepRef {
                goal_id: goal.id.clone(),
                step_id: step.id.clone(),
            },
        );
        let _ = self
            .bridge
            .goals()
            .update_plan_step(
                &goal.id,
                &step.id,
                StepPatch::status(StepStatus::InProgress).with_task_id(&task.id),
            )
            .await;

        if let Err(e) = self
            .bridge
            .dispatch_worker(
                &goal.agent_id,
                &task.id,
                Some(goal.max_turns_per_step),
                Some(goal.working_directory.clone()),
                Some(worker_prompt),
            )
            .await
        {
            warn!(goal_id = %goal.id, step_order = step.order, error = %e, "Step dispatch failed");
            self.step_tasks.lock().remove(&task.id);
            let _ = self
                .bridge
                .goals()
                .update_plan_step(&goal.id, &step.id, StepPatch::status(StepStatus::Pending))
                .await;
            self.deactivate(&goal.id);
        }
    }

    /// After a PASS: rewrite pending steps the completed work made stale.
    async fn run_refinement(&self, goal: &AgentGoal) {
        let Some(plan) = self.bridge.goals().get_current_plan(&goal.id) else {
            return;
        };
        let has_completed = plan.steps.iter().any(|s| s.status == StepStatus::Completed);
        let has_pending = plan.steps.iter().any(|s| s.status == StepStatus::Pending);
        if !has_completed || !has_pending {
            return;
        }

        let prompt = prompts::refinement_prompt(goal, &plan);
        let Ok(refinement) =
            complete_structured::<RefineReply>(self.oracle.as_ref(), None, &prompt).await
        else {
            return;
        };
        if !refinement.needs_refinement {
            return;
        }

        for refined in refinement.refined_steps {
            let Some(step) = plan
                .steps
                .iter()
                .find(|s| s.order == refined.order && s.status == StepStatus::Pending)
            else {
                continue;
            };
            let patch = if refined.description.trim() == SKIP_SENTINEL {
                StepPatch::status(StepStatus::Skipped)
            } else {
                StepPatch::default().with_description(refined.description)
            };
            let _ = self
                .bridge
                .goals()
                .update_plan_step(&goal.id, &step.id, patch)
                .await;
        }
        debug!(goal_id = %goal.id, reasoning = %refinement.reasoning, "Plan refined");
    }

    /// Move the goal forward after a step settled: next step, wait on the
    /// operator, finish, or re-plan.
    async fn continue_goal(&self, goal_id: &str) {
        let Some(goal) = self.bridge.goals().get_goal(goal_id) else {
            self.deactivate(goal_id);
            return;
        };
        if goal.status != GoalStatus::Active {
            self.deactivate(goal_id);
            return;
        }
        if self.bridge.goals().get_blocked_step(goal_id).is_some() {
            return;
        }
        if let Some(step) = self.bridge.goals().get_next_pending_step(goal_id) {
            self.execute_step(&goal, &step, None).await;
            return;
        }

        let Some(plan) = self.bridge.goals().get_current_plan(goal_id) else {
            self.run_recon(&goal).await;
            return;
        };

        if plan.is_finished() {
            if plan.recurring {
                // Leave the goal active; the trigger wakes the next cycle.
                info!(goal_id = %goal_id, "Recurring plan cycle finished");
                self.deactivate(goal_id);
            } else {
                info!(goal_id = %goal_id, "Goal completed");
                let _ = self
                    .bridge
                    .goals()
                    .update_goal_status(goal_id, GoalStatus::Completed)
                    .await;
                self.deactivate(goal_id);
            }
            return;
        }

        // Steps failed and nothing is pending or blocked: plan again,
        // carrying forward what already happened.
        info!(goal_id = %goal_id, "Re-planning after failed steps");
        self.run_planning(&goal).await;
    }

    fn spawn_preference_extraction(&self, goal: &AgentGoal, question: &str, answer: &str) {
        let preferences = Arc::clone(self.bridge.preferences());
        let oracle = Arc::clone(&self.oracle);
        let bus = Arc::clone(&self.bus);
        let agent_id = goal.agent_id.clone();
        let context = goal.description.clone();
        let question = question.to_string();
        let answer = answer.to_string();

        tokio::spawn(async move {
            let prompt = preferences
                .build_extraction_prompt(
                    &agent_id,
                    ExtractionInput {
                        user_message: &answer,
                        agent_message: &question,
                        context: &context,
                    },
                )
                .await;
            let reply = oracle.complete(None, &prompt).await;
            match reply.error {
                Some(error) => bus.publish(BusEvent::OracleFailed {
                    context: "preference extraction".to_string(),
                    error,
                }),
                None => {
                    let stored = preferences
                        .parse_and_store_extraction(&agent_id, &reply.content, "reply")
                        .await;
                    if stored > 0 {
                        debug!(agent_id = %agent_id, stored, "Preferences extracted from reply");
                    }
                }
            }
        });
    }

    async fn fail_goal(&self, goal_id: &str) {
        if let Err(e) = self
            .bridge
            .goals()
            .update_goal_status(goal_id, GoalStatus::Failed)
            .await
        {
            warn!(goal_id = %goal_id, error = %e, "Failed to mark goal failed");
        }
        self.deactivate(goal_id);
    }

    fn deactivate(&self, goal_id: &str) {
        self.active_goals.lock().remove(goal_id);
    }

    fn oracle_failure(&self, context: &str, error: &str) {
        warn!(context = %context, error = %error, "Oracle call failed");
        self.bus.publish(BusEvent::OracleFailed {
            context: context.to_string(),
            error: error.to_string(),
        });
    }
}

/// The worker signals a question by ending its message with the marker; the
/// question is everything after the final marker.
fn parse_needs_input(result: &str) -> Option<String> {
    let trimmed = result.trim_end();
    let idx = trimmed.rfind(NEEDS_INPUT_MARKER)?;
    let question = trimmed[idx + NEEDS_INPUT_MARKER.len()..].trim();
    if question.is_empty() {
        None
    } else {
        Some(question.to_string())
    }
}

use console::style;

use crate::agent::Agent;
use crate::bus::{BusEvent, Envelope};
use crate::goal::{AgentGoal, AgentPlan, StepStatus};
use crate::preference::AgentPreference;
use crate::task::Task;

pub struct Display;

impl Display {
    pub fn new() -> Self {
        Self
    }

    pub fn print_error(&self, message: &str) {
        eprintln!("{} {}", style("error:").red().bold(), message);
    }

    pub fn print_info(&self, message: &str) {
        println!("{}", style(message).dim());
    }

    pub fn print_agents(&self, agents: &[Agent]) {
        if agents.is_empty() {
            self.print_info("No agents hired. Try: hire");
            return;
        }
        for agent in agents {
            println!(
                "{}  {}  tasks: {}  tokens: {}  tools: {}",
                style(format!("{:<10}", agent.name)).cyan().bold(),
                style(format!("{:<8}", agent.state.to_string())).yellow(),
                agent.tasks_completed,
                agent.tokens_used,
                agent
                    .approved_tools
                    .iter()
                    .cloned()
                    .collect::<Vec<_>>()
                    .join(","),
            );
        }
    }

    pub fn print_tasks(&self, tasks: &[Task]) {
        if tasks.is_empty() {
            self.print_info("No tasks yet.");
            return;
        }
        for task in tasks {
            let status = match task.status {
                crate::task::TaskStatus::Completed => style(task.status.to_string()).green(),
                crate::task::TaskStatus::Failed => style(task.status.to_string()).red(),
                _ => style(task.status.to_string()).yellow(),
            };
            println!(
                "{}  {}  {}",
                style(&task.id[..8.min(task.id.len())]).dim(),
                status,
                truncate_line(&task.description, 80),
            );
        }
    }

    pub fn print_goals(&self, goals: &[AgentGoal]) {
        if goals.is_empty() {
            self.print_info("No goals. Try: goal <agent> <description>");
            return;
        }
        for goal in goals {
            let status = match goal.status {
                crate::goal::GoalStatus::Completed => style(goal.status.to_string()).green(),
                crate::goal::GoalStatus::Failed => style(goal.status.to_string()).red(),
                crate::goal::GoalStatus::Paused => style(goal.status.to_string()).dim(),
                crate::goal::GoalStatus::Active => style(goal.status.to_string()).cyan(),
            };
            println!(
                "{}  {}  {}  ({})",
                style(&goal.id[..8.min(goal.id.len())]).dim(),
                status,
                truncate_line(&goal.description, 70),
                goal.working_directory.display(),
            );
        }
    }

    pub fn print_plan(&self, plan: &AgentPlan) {
        println!(
            "Plan v{} ({} steps){}",
            style(plan.version).bold(),
            plan.steps.len(),
            if plan.recurring {
                style(" [recurring]").magenta().to_string()
            } else {
                String::new()
            },
        );
        if !plan.reasoning.is_empty() {
            println!("{}", style(truncate_line(&plan.reasoning, 100)).dim());
        }
        let mut steps = plan.steps.clone();
        steps.sort_by_key(|s| s.order);
        for step in &steps {
            let marker = match step.status {
                StepStatus::Completed => style("✓").green(),
                StepStatus::Failed => style("✗").red(),
                StepStatus::InProgress => style("▶").cyan(),
                StepStatus::Blocked => style("?").yellow().bold(),
                StepStatus::Skipped => style("-").dim(),
                StepStatus::Pending => style("·").dim(),
            };
            println!(
                "  {} {} {}",
                marker,
                style(format!("{}.", step.order + 1)).dim(),
                step.description,
            );
            if let Some(question) = &step.question {
                println!("      {}", style(format!("waiting: {}", question)).yellow());
            }
        }
    }

    pub fn print_preferences(&self, prefs: &[AgentPreference]) {
        if prefs.is_empty() {
            self.print_info("No preferences learned yet.");
            return;
        }
        for pref in prefs {
            println!(
                "[{}] {} = {}  ({}, used {}x)",
                pref.category,
                style(&pref.key).cyan().bold(),
                pref.value,
                pref.confidence,
                pref.used_count,
            );
        }
    }

    /// One observability line per event. Noisy per-message traffic is
    /// kept quiet except where the operator must act.
    pub fn print_event(&self, envelope: &Envelope, agent_name: &str) {
        let line = match &envelope.event {
            BusEvent::AgentHired { name, .. } => {
                Some(format!("{} joined the farm", style(name).cyan().bold()))
            }
            BusEvent::AgentFired { name, .. } => Some(format!("{} was let go", style(name).dim())),
            BusEvent::TaskStarted { .. } => Some(format!("{} started working", agent_name)),
            BusEvent::TaskCompleted { .. } => {
                Some(format!("{} finished a task", style(agent_name).green()))
            }
            BusEvent::TaskFailed { error, .. } => Some(format!(
                "{} task failed: {}",
                style(agent_name).red(),
                truncate_line(error, 80),
            )),
            BusEvent::PlanCreated { version, steps, .. } => Some(format!(
                "{} drafted plan v{} with {} steps",
                agent_name, version, steps
            )),
            BusEvent::StepStarted { order, .. } => {
                Some(format!("{} began step {}", agent_name, order + 1))
            }
            BusEvent::StepCompleted { order, .. } => Some(format!(
                "{} {} step {}",
                agent_name,
                style("completed").green(),
                order + 1
            )),
            BusEvent::StepFailed { order, .. } => Some(format!(
                "{} {} step {}",
                agent_name,
                style("failed").red(),
                order + 1
            )),
            BusEvent::GoalUpdated { status, .. } => {
                Some(format!("{} goal is now {}", agent_name, style(status).bold()))
            }
            BusEvent::QuestionRaised { question, .. } => Some(format!(
                "{} {} {}\n  answer with: reply {} <answer>",
                style(agent_name).yellow().bold(),
                style("needs input:").yellow().bold(),
                question,
                agent_name,
            )),
            BusEvent::PermissionRequested { tool_name, .. } => Some(format!(
                "{} {} {}\n  grant with: approve {} {}  (or: deny {})",
                style(agent_name).yellow().bold(),
                style("wants to use").yellow(),
                style(tool_name).bold(),
                agent_name,
                tool_name,
                agent_name,
            )),
            BusEvent::TriggerFired { .. } => Some(format!("{} woke on schedule", agent_name)),
            BusEvent::OracleFailed { context, error } => Some(format!(
                "{} oracle failed during {}: {}",
                style("!").red(),
                context,
                truncate_line(error, 80),
            )),
            _ => None,
        };
        if let Some(line) = line {
            println!("{} {}", style("●").dim(), line);
        }
    }
}

impl Default for Display {
    fn default() -> Self {
        Self::new()
    }
}

fn truncate_line(s: &str, max_chars: usize) -> String {
    let flattened = s.replace('\n', " ");
    if flattened.chars().count() <= max_chars {
        return flattened;
    }
    let cut: String = flattened.chars().take(max_chars.saturating_sub(3)).collect();
    format!("{}...", cut)
}

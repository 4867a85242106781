//! The operator's control surface: a line-oriented REPL over the core.

use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

use console::style;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};

use super::Display;
use crate::adversary::Adversary;
use crate::agent::Agent;
use crate::bridge::Bridge;
use crate::bus::EventBus;
use crate::config::ConfigManager;
use crate::error::{FarmError, Result};
use crate::goal::AgentGoal;
use crate::scheduler::TriggerScheduler;
use crate::store::DataStore;

const HELP: &str = r#"Commands:
  hire [name]                     Hire a new agent
  fire <agent>                    Fire an agent (cancels its work)
  agents / tasks / goals [agent]  Listings
  plan <agent>                    Show the agent's current plan
  prefs <agent>                   Show learned preferences
  assign <agent> <description>    One-off task dispatch
  goal <agent> [--dir <path>] <description>
  constrain <agent> <text>        Append a constraint to the active goal
  chdir <agent> <path>            Change the active goal's working directory
  wake <agent> / pause <agent>    Start or pause autonomous work
  reply <agent> <answer>          Answer a blocked step
  talk <agent> <message>          Chat without dispatching a worker
  approve <agent> <tool>          Grant a requested tool
  deny <agent>                    Refuse the requested tools
  schedule <agent> <minutes>      Recurring wake-up
  unschedule <agent>              Remove recurring wake-ups
  prompt <agent> <text>           Set the agent's system prompt
  forget <agent> <key>            Drop a learned preference
  workspace [add|remove|list] [path]
  log <agent> [n]                 Recent observability events
  quit / exit"#;

pub struct Repl {
    bridge: Arc<Bridge>,
    adversary: Arc<Adversary>,
    scheduler: Arc<TriggerScheduler>,
    config: Arc<ConfigManager>,
    store: Arc<DataStore>,
    bus: Arc<EventBus>,
    display: Display,
}

impl Repl {
    pub fn new(
        bridge: Arc<Bridge>,
        adversary: Arc<Adversary>,
        scheduler: Arc<TriggerScheduler>,
        config: Arc<ConfigManager>,
        store: Arc<DataStore>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            bridge,
            adversary,
            scheduler,
            config,
            store,
            bus,
            display: Display::new(),
        }
    }

    pub async fn run(&self) -> Result<()> {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        self.ensure_workspace_root(&mut lines).await?;
        self.install_event_sink();

        println!(
            "{} type {} for commands",
            style("workfarm ready:").bold(),
            style("help").cyan()
        );

        loop {
            print!("{} ", style("workfarm>").bold());
            let _ = std::io::stdout().flush();

            let Some(line) = lines.next_line().await? else {
                break;
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let tokens: Vec<&str> = line.split_whitespace().collect();
            match tokens[0] {
                "quit" | "exit" => break,
                "help" => println!("{}", HELP),
                _ => {
                    if let Err(e) = self.dispatch(&tokens).await {
                        self.display.print_error(&e.to_string());
                    }
                }
            }
        }

        self.scheduler.stop();
        Ok(())
    }

    async fn dispatch(&self, tokens: &[&str]) -> Result<()> {
        match tokens[0] {
            "hire" => self.cmd_hire(tokens.get(1).map(|s| s.to_string())).await,
            "fire" => self.cmd_fire(arg(tokens, 1)?).await,
            "agents" => {
                self.display.print_agents(&self.bridge.agents().list());
                Ok(())
            }
            "tasks" => {
                self.display.print_tasks(&self.bridge.tasks().list());
                Ok(())
            }
            "goals" => {
                let agent_id = match tokens.get(1) {
                    Some(reference) => Some(self.resolve_agent(reference)?.id),
                    None => None,
                };
                self.display
                    .print_goals(&self.bridge.goals().list_goals(agent_id.as_deref()));
                Ok(())
            }
            "plan" => self.cmd_plan(arg(tokens, 1)?),
            "prefs" => self.cmd_prefs(arg(tokens, 1)?).await,
            "assign" => self.cmd_assign(arg(tokens, 1)?, rest(tokens, 2)?).await,
            "goal" => self.cmd_goal(arg(tokens, 1)?, &tokens[2..]).await,
            "constrain" => self.cmd_constrain(arg(tokens, 1)?, rest(tokens, 2)?).await,
            "chdir" => self.cmd_chdir(arg(tokens, 1)?, arg(tokens, 2)?).await,
            "wake" => self.cmd_wake(arg(tokens, 1)?),
            "pause" => self.cmd_pause(arg(tokens, 1)?).await,
            "reply" => self.cmd_reply(arg(tokens, 1)?, rest(tokens, 2)?),
            "talk" => self.cmd_talk(arg(tokens, 1)?, rest(tokens, 2)?).await,
            "approve" => self.cmd_approve(arg(tokens, 1)?, arg(tokens, 2)?).await,
            "deny" => self.cmd_deny(arg(tokens, 1)?),
            "schedule" => self.cmd_schedule(arg(tokens, 1)?, arg(tokens, 2)?).await,
            "unschedule" => self.cmd_unschedule(arg(tokens, 1)?).await,
            "prompt" => self.cmd_prompt(arg(tokens, 1)?, rest(tokens, 2)?).await,
            "forget" => self.cmd_forget(arg(tokens, 1)?, arg(tokens, 2)?).await,
            "workspace" => self.cmd_workspace(tokens.get(1).copied(), tokens.get(2)).await,
            "log" => self.cmd_log(arg(tokens, 1)?, tokens.get(2)).await,
            other => Err(FarmError::Other(format!(
                "unknown command: {} (try: help)",
                other
            ))),
        }
    }

    // ---- commands ----

    async fn cmd_hire(&self, name: Option<String>) -> Result<()> {
        let agent = self.bridge.agents().hire(name).await?;
        println!("Hired {}", style(&agent.name).cyan().bold());
        Ok(())
    }

    async fn cmd_fire(&self, reference: &str) -> Result<()> {
        let agent = self.resolve_agent(reference)?;
        let (name, removed_triggers) = self.bridge.fire_agent(&agent.id).await?;
        self.scheduler.drop_timers(&removed_triggers);
        println!("Fired {}", style(name).dim());
        Ok(())
    }

    fn cmd_plan(&self, reference: &str) -> Result<()> {
        let agent = self.resolve_agent(reference)?;
        let goal = self.resolve_goal(&agent)?;
        match self.bridge.goals().get_current_plan(&goal.id) {
            Some(plan) => self.display.print_plan(&plan),
            None => self.display.print_info("No plan yet. Try: wake"),
        }
        Ok(())
    }

    async fn cmd_prefs(&self, reference: &str) -> Result<()> {
        let agent = self.resolve_agent(reference)?;
        let prefs = self.bridge.preferences().list(&agent.id).await;
        self.display.print_preferences(&prefs);
        Ok(())
    }

    async fn cmd_assign(&self, reference: &str, description: String) -> Result<()> {
        let agent = self.resolve_agent(reference)?;
        let task = self
            .bridge
            .tasks()
            .create_task(description, Some(agent.id.clone()))
            .await;
        let working_dir = self.config.workspace_roots().first().cloned();
        self.bridge
            .dispatch_worker(&agent.id, &task.id, None, working_dir, None)
            .await?;
        println!("Assigned to {}", style(&agent.name).cyan());
        Ok(())
    }

    async fn cmd_goal(&self, reference: &str, args: &[&str]) -> Result<()> {
        let agent = self.resolve_agent(reference)?;
        let (dir, description_tokens) = match args {
            ["--dir", path, rest @ ..] => (PathBuf::from(*path), rest),
            rest => (
                self.config
                    .workspace_roots()
                    .first()
                    .cloned()
                    .unwrap_or_else(|| PathBuf::from(".")),
                rest,
            ),
        };
        if description_tokens.is_empty() {
            return Err(FarmError::Other("goal needs a description".into()));
        }
        self.bridge
            .goals()
            .create_goal(AgentGoal::new(
                &agent.id,
                description_tokens.join(" "),
                dir,
            ))
            .await;
        println!(
            "Goal set for {}. Start it with: wake {}",
            style(&agent.name).cyan(),
            agent.name
        );
        Ok(())
    }

    async fn cmd_constrain(&self, reference: &str, text: String) -> Result<()> {
        let agent = self.resolve_agent(reference)?;
        let goal = self.resolve_goal(&agent)?;
        self.bridge.goals().add_constraint(&goal.id, text).await?;
        println!("Constraint added.");
        Ok(())
    }

    async fn cmd_chdir(&self, reference: &str, path: &str) -> Result<()> {
        let agent = self.resolve_agent(reference)?;
        let goal = self.resolve_goal(&agent)?;
        self.bridge
            .goals()
            .set_working_directory(&goal.id, PathBuf::from(path))
            .await?;
        println!("Working directory set to {}", path);
        Ok(())
    }

    fn cmd_wake(&self, reference: &str) -> Result<()> {
        let agent = self.resolve_agent(reference)?;
        let goal = self.resolve_goal(&agent)?;
        self.adversary.wake(&goal.id);
        println!("{} is waking up...", style(&agent.name).cyan());
        Ok(())
    }

    async fn cmd_pause(&self, reference: &str) -> Result<()> {
        let agent = self.resolve_agent(reference)?;
        let goal = self.resolve_goal(&agent)?;
        self.adversary.pause(&goal.id).await?;
        println!("{} paused.", style(&agent.name).dim());
        Ok(())
    }

    fn cmd_reply(&self, reference: &str, answer: String) -> Result<()> {
        let agent = self.resolve_agent(reference)?;
        let goal = self.resolve_goal(&agent)?;
        self.adversary.reply(&goal.id, &answer)?;
        println!("Answer delivered to {}.", style(&agent.name).cyan());
        Ok(())
    }

    async fn cmd_talk(&self, reference: &str, message: String) -> Result<()> {
        let agent = self.resolve_agent(reference)?;
        let reply = self.adversary.talk(&agent.id, &message, None).await?;
        println!("{}: {}", style(&agent.name).cyan().bold(), reply);
        Ok(())
    }

    async fn cmd_approve(&self, reference: &str, tool: &str) -> Result<()> {
        let agent = self.resolve_agent(reference)?;
        let all_approved = self.bridge.approve_tool_permission(&agent.id, tool).await?;
        if all_approved {
            println!("{} is continuing.", style(&agent.name).cyan());
        } else {
            println!("Approved {}; more approvals pending.", tool);
        }
        Ok(())
    }

    fn cmd_deny(&self, reference: &str) -> Result<()> {
        let agent = self.resolve_agent(reference)?;
        self.bridge.deny_tool_permission(&agent.id)?;
        println!("Denied; {} will wrap up without it.", agent.name);
        Ok(())
    }

    async fn cmd_schedule(&self, reference: &str, minutes: &str) -> Result<()> {
        let agent = self.resolve_agent(reference)?;
        let goal = self.resolve_goal(&agent)?;
        let minutes: u64 = minutes
            .parse()
            .map_err(|_| FarmError::Other(format!("not a number of minutes: {}", minutes)))?;
        if minutes == 0 {
            return Err(FarmError::Other("interval must be at least 1 minute".into()));
        }
        self.scheduler
            .add_interval_trigger(&agent.id, &goal.id, minutes * 60_000)
            .await?;
        println!(
            "{} will wake every {} minute(s).",
            style(&agent.name).cyan(),
            minutes
        );
        Ok(())
    }

    async fn cmd_unschedule(&self, reference: &str) -> Result<()> {
        let agent = self.resolve_agent(reference)?;
        let mut removed = 0;
        for goal in self.bridge.goals().list_goals(Some(&agent.id)) {
            for trigger in self.bridge.goals().triggers_for_goal(&goal.id) {
                self.scheduler.remove_trigger(&trigger.id).await?;
                removed += 1;
            }
        }
        if removed == 0 {
            self.display.print_info("Nothing was scheduled.");
        } else {
            println!("Removed {} schedule(s).", removed);
        }
        Ok(())
    }

    async fn cmd_prompt(&self, reference: &str, text: String) -> Result<()> {
        let agent = self.resolve_agent(reference)?;
        self.bridge
            .agents()
            .set_system_prompt(&agent.id, Some(text))
            .await?;
        println!("System prompt set for {}.", style(&agent.name).cyan());
        Ok(())
    }

    async fn cmd_forget(&self, reference: &str, key: &str) -> Result<()> {
        let agent = self.resolve_agent(reference)?;
        if self.bridge.preferences().remove_preference(&agent.id, key).await {
            println!("Forgot {}.", style(key).dim());
        } else {
            self.display.print_info("No such preference.");
        }
        Ok(())
    }

    async fn cmd_workspace(&self, action: Option<&str>, path: Option<&&str>) -> Result<()> {
        match (action, path) {
            (Some("add"), Some(path)) => {
                if self.config.add_workspace_root(PathBuf::from(*path)).await {
                    println!("Added workspace root {}", path);
                } else {
                    self.display.print_info("Already a workspace root.");
                }
            }
            (Some("remove"), Some(path)) => {
                if self
                    .config
                    .remove_workspace_root(&PathBuf::from(*path))
                    .await
                {
                    println!("Removed workspace root {}", path);
                } else {
                    self.display.print_info("Not a workspace root.");
                }
            }
            (Some("list"), _) | (None, _) => {
                let roots = self.config.workspace_roots();
                if roots.is_empty() {
                    self.display.print_info("No workspace roots configured.");
                }
                for root in roots {
                    println!("  {}", root.display());
                }
            }
            _ => {
                return Err(FarmError::Other(
                    "usage: workspace [add|remove|list] [path]".into(),
                ))
            }
        }
        Ok(())
    }

    async fn cmd_log(&self, reference: &str, count: Option<&&str>) -> Result<()> {
        let agent = self.resolve_agent(reference)?;
        let count: usize = count.and_then(|c| c.parse().ok()).unwrap_or(20);
        let events = self.store.read_logs(&agent.id, None, None).await?;
        for event in events.iter().rev().take(count).rev() {
            let timestamp = event
                .get("timestamp")
                .and_then(|t| t.as_str())
                .unwrap_or("");
            let kind = event.get("type").and_then(|t| t.as_str()).unwrap_or("?");
            println!("{}  {}", style(timestamp).dim(), kind);
        }
        Ok(())
    }

    // ---- plumbing ----

    async fn ensure_workspace_root(&self, lines: &mut Lines<BufReader<Stdin>>) -> Result<()> {
        while self.config.workspace_roots().is_empty() {
            println!(
                "{}",
                style("No workspace roots configured. Where do your projects live?").bold()
            );
            print!("path> ");
            let _ = std::io::stdout().flush();
            let Some(line) = lines.next_line().await? else {
                return Err(FarmError::Config("a workspace root is required".into()));
            };
            let path = PathBuf::from(line.trim());
            if line.trim().is_empty() || !path.is_dir() {
                self.display.print_error("not a directory; try again");
                continue;
            }
            self.config.add_workspace_root(path).await;
        }
        Ok(())
    }

    /// Print observability lines and append each agent-scoped event to its
    /// JSONL log.
    fn install_event_sink(&self) {
        let agents = Arc::clone(self.bridge.agents());
        let store = Arc::clone(&self.store);
        self.bus.subscribe_all(move |envelope| {
            let agent_id = envelope.event.agent_id().map(str::to_string);
            let agent_name = agent_id
                .as_deref()
                .and_then(|id| agents.get(id))
                .map(|a| a.name)
                .unwrap_or_else(|| "agent".to_string());

            Display::new().print_event(envelope, &agent_name);

            if let (Some(agent_id), Ok(record)) = (agent_id, serde_json::to_value(envelope)) {
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    if let Err(e) = store.append_log(&agent_id, &record).await {
                        tracing::warn!(error = %e, "Failed to append observability log");
                    }
                });
            }
        });
    }

    fn resolve_agent(&self, reference: &str) -> Result<Agent> {
        self.bridge
            .agents()
            .find(reference)
            .ok_or_else(|| FarmError::AgentNotFound(reference.to_string()))
    }

    fn resolve_goal(&self, agent: &Agent) -> Result<AgentGoal> {
        self.bridge
            .goals()
            .find_goal_for_agent(&agent.id)
            .ok_or_else(|| FarmError::NoActiveGoal(agent.name.clone()))
    }
}

fn arg<'a>(tokens: &[&'a str], index: usize) -> Result<&'a str> {
    tokens
        .get(index)
        .copied()
        .ok_or_else(|| FarmError::Other(format!("{} needs more arguments (try: help)", tokens[0])))
}

fn rest(tokens: &[&str], from: usize) -> Result<String> {
    if tokens.len() <= from {
        return Err(FarmError::Other(format!(
            "{} needs more arguments (try: help)",
            tokens[0]
        )));
    }
    Ok(tokens[from..].join(" "))
}

//! Worker subprocess lifecycle: spawn, stream, resume, kill.
//!
//! Workers speak a line-delimited JSON protocol on stdout. Every spawn for a
//! session records a monotonically increasing generation; pump tasks bail
//! out once their generation is superseded, so a resumed session never sees
//! stdout from the process it replaced.

mod stream;

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::process::Command;
use tokio::sync::{mpsc::UnboundedSender, oneshot};
use tracing::{debug, warn};

use crate::error::{FarmError, Result};

pub use stream::parse_line;

/// One parsed protocol event from a worker's stdout or stderr.
#[derive(Debug, Clone)]
pub struct WorkerStreamEvent {
    pub session_id: String,
    pub payload: Value,
}

/// Everything needed to launch one worker invocation.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub session_id: String,
    pub working_dir: PathBuf,
    pub prompt: String,
    pub system_prompt: Option<String>,
    pub allowed_tools: Vec<String>,
    pub max_turns: Option<u32>,
    pub additional_dirs: Vec<PathBuf>,
}

impl SpawnSpec {
    pub fn new(
        session_id: impl Into<String>,
        working_dir: impl Into<PathBuf>,
        prompt: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            working_dir: working_dir.into(),
            prompt: prompt.into(),
            system_prompt: None,
            allowed_tools: Vec::new(),
            max_turns: None,
            additional_dirs: Vec::new(),
        }
    }

    pub fn with_system_prompt(mut self, system_prompt: Option<String>) -> Self {
        self.system_prompt = system_prompt;
        self
    }

    pub fn with_allowed_tools(mut self, tools: Vec<String>) -> Self {
        self.allowed_tools = tools;
        self
    }

    pub fn with_max_turns(mut self, max_turns: Option<u32>) -> Self {
        self.max_turns = max_turns;
        self
    }

    pub fn with_additional_dirs(mut self, dirs: Vec<PathBuf>) -> Self {
        self.additional_dirs = dirs;
        self
    }
}

#[async_trait]
pub trait WorkerRuntime: Send + Sync {
    /// Launch a fresh worker for the session.
    async fn spawn(&self, spec: SpawnSpec) -> Result<()>;

    /// Kill the session's current worker (if any) and launch a replacement
    /// that resumes the same conversation.
    async fn resume(&self, spec: SpawnSpec) -> Result<()>;

    /// Kill the session's worker. The terminal close event still flows.
    async fn kill(&self, session_id: &str) -> Result<()>;
}

/// Subprocess-backed runtime driving the configured worker command.
pub struct CliRuntime {
    command: String,
    events: UnboundedSender<WorkerStreamEvent>,
    generations: Arc<Mutex<HashMap<String, u64>>>,
    kills: Mutex<HashMap<String, oneshot::Sender<()>>>,
}

impl CliRuntime {
    pub fn new(command: impl Into<String>, events: UnboundedSender<WorkerStreamEvent>) -> Self {
        Self {
            command: command.into(),
            events,
            generations: Arc::new(Mutex::new(HashMap::new())),
            kills: Mutex::new(HashMap::new()),
        }
    }

    /// Bump the session's generation, supersede any live process, and spawn.
    async fn launch(&self, spec: SpawnSpec, resume: bool) -> Result<()> {
        let generation = {
            let mut generations = self.generations.lock();
            let entry = generations.entry(spec.session_id.clone()).or_insert(0);
            *entry += 1;
            *entry
        };

        // The superseded process's pumps go quiet the moment the generation
        // moved; the kill just reclaims it promptly.
        if let Some(prior) = self.kills.lock().remove(&spec.session_id) {
            let _ = prior.send(());
        }

        let args = build_args(&spec, resume);
        debug!(
            session_id = %spec.session_id,
            generation,
            resume,
            "Spawning worker"
        );

        let mut child = Command::new(&self.command)
            .args(&args)
            .current_dir(&spec.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| FarmError::Spawn(format!("{}: {}", self.command, e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| FarmError::Spawn("worker stdout not captured".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| FarmError::Spawn("worker stderr not captured".into()))?;

        let (kill_tx, mut kill_rx) = oneshot::channel();
        self.kills.lock().insert(spec.session_id.clone(), kill_tx);

        let session_id = spec.session_id.clone();
        let generations = Arc::clone(&self.generations);
        let events = self.events.clone();

        {
            let session_id = session_id.clone();
            let generations = Arc::clone(&generations);
            let events = events.clone();
            tokio::spawn(async move {
                stream::pump_stderr(stderr, &session_id, generation, &generations, &events).await;
            });
        }

        tokio::spawn(async move {
            let pump = stream::pump_lines(stdout, &session_id, generation, &generations, &events);
            tokio::pin!(pump);

            let killed = tokio::select! {
                _ = &mut pump => false,
                _ = &mut kill_rx => {
                    let _ = child.start_kill();
                    true
                }
            };
            if killed {
                // Drain whatever the dying process managed to write.
                pump.await;
            }

            let status = child.wait().await;
            if !stream::is_current(&generations, &session_id, generation) {
                debug!(session_id = %session_id, generation, "Suppressing terminal event from superseded worker");
                return;
            }

            let (subtype, exit_code) = match status {
                Ok(status) if status.success() => ("close", status.code()),
                Ok(status) => ("error", status.code()),
                Err(e) => {
                    warn!(session_id = %session_id, error = %e, "Worker wait failed");
                    ("error", None)
                }
            };
            let _ = events.send(WorkerStreamEvent {
                session_id: session_id.clone(),
                payload: json!({
                    "type": "result",
                    "subtype": subtype,
                    "exit_code": exit_code,
                }),
            });
        });

        Ok(())
    }
}

#[async_trait]
impl WorkerRuntime for CliRuntime {
    async fn spawn(&self, spec: SpawnSpec) -> Result<()> {
        self.launch(spec, false).await
    }

    async fn resume(&self, spec: SpawnSpec) -> Result<()> {
        self.launch(spec, true).await
    }

    async fn kill(&self, session_id: &str) -> Result<()> {
        let kill_tx = self.kills.lock().remove(session_id);
        match kill_tx {
            Some(tx) => {
                let _ = tx.send(());
                Ok(())
            }
            None => Ok(()),
        }
    }
}

/// Assemble the worker command line. The prompt always follows a `--`
/// terminator so it can never be read as a flag.
fn build_args(spec: &SpawnSpec, resume: bool) -> Vec<String> {
    let mut args: Vec<String> = [
        "--print",
        "--verbose",
        "--output-format",
        "stream-json",
        "--include-partial-messages",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();

    if resume {
        args.push("--resume".into());
    } else {
        args.push("--session-id".into());
    }
    args.push(spec.session_id.clone());

    if let Some(system_prompt) = &spec.system_prompt {
        args.push("--append-system-prompt".into());
        args.push(system_prompt.clone());
    }
    if !spec.allowed_tools.is_empty() {
        args.push("--allowedTools".into());
        args.push(spec.allowed_tools.join(","));
    }
    if let Some(max_turns) = spec.max_turns {
        args.push("--max-turns".into());
        args.push(max_turns.to_string());
    }
    for dir in &spec.additional_dirs {
        args.push("--add-dir".into());
        args.push(dir.display().to_string());
    }

    args.push("--".into());
    args.push(spec.prompt.clone());
    args
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> SpawnSpec {
        SpawnSpec::new("s-1", "/tmp/work", "do the thing")
            .with_system_prompt(Some("be careful".into()))
            .with_allowed_tools(vec!["Read".into(), "Bash".into()])
            .with_max_turns(Some(25))
    }

    #[test]
    fn test_build_args_spawn() {
        let args = build_args(&spec(), false);

        let session_flag = args.iter().position(|a| a == "--session-id").unwrap();
        assert_eq!(args[session_flag + 1], "s-1");
        assert!(args.contains(&"--include-partial-messages".to_string()));
        assert!(args.contains(&"Read,Bash".to_string()));
        assert!(args.contains(&"25".to_string()));
    }

    #[test]
    fn test_build_args_resume() {
        let args = build_args(&spec(), true);
        let resume_flag = args.iter().position(|a| a == "--resume").unwrap();
        assert_eq!(args[resume_flag + 1], "s-1");
        assert!(!args.contains(&"--session-id".to_string()));
    }

    #[test]
    fn test_prompt_follows_terminator() {
        let mut spec = spec();
        spec.prompt = "--not-a-flag".into();
        let args = build_args(&spec, false);

        let last = args.len() - 1;
        assert_eq!(args[last - 1], "--");
        assert_eq!(args[last], "--not-a-flag");
    }

    #[test]
    fn test_empty_tool_list_omits_flag() {
        let mut spec = spec();
        spec.allowed_tools.clear();
        spec.max_turns = None;
        spec.system_prompt = None;
        let args = build_args(&spec, false);

        assert!(!args.contains(&"--allowedTools".to_string()));
        assert!(!args.contains(&"--max-turns".to_string()));
        assert!(!args.contains(&"--append-system-prompt".to_string()));
    }
}

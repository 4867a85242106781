//! Scripted worker runtime: each spawn whose prompt matches a key replays
//! the next scripted event sequence into the session manager's pump. Tests
//! can also emit events by hand to drive permission and resume flows.

use std::collections::VecDeque;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::{json, Value};
use tokio::sync::mpsc::UnboundedSender;

use workfarm::error::Result;
use workfarm::runtime::{SpawnSpec, WorkerRuntime, WorkerStreamEvent};

pub struct FakeRuntime {
    events: UnboundedSender<WorkerStreamEvent>,
    scripts: RwLock<Vec<(String, VecDeque<Vec<Value>>)>>,
    spawns: RwLock<Vec<SpawnSpec>>,
    resumes: RwLock<Vec<SpawnSpec>>,
    kills: RwLock<Vec<String>>,
}

impl FakeRuntime {
    pub fn new(events: UnboundedSender<WorkerStreamEvent>) -> Self {
        Self {
            events,
            scripts: RwLock::new(Vec::new()),
            spawns: RwLock::new(Vec::new()),
            resumes: RwLock::new(Vec::new()),
            kills: RwLock::new(Vec::new()),
        }
    }

    /// Queue a raw event sequence for the next spawn whose prompt contains
    /// `key`. Sequences cycle once the queue runs dry.
    pub fn script(&self, key: &str, events: Vec<Value>) {
        let mut scripts = self.scripts.write();
        if let Some((_, queue)) = scripts.iter_mut().find(|(k, _)| k == key) {
            queue.push_back(events);
        } else {
            scripts.push((key.to_string(), VecDeque::from([events])));
        }
    }

    /// A worker that streams one assistant message and closes cleanly.
    pub fn script_completed(&self, key: &str, text: &str) {
        self.script(
            key,
            vec![
                json!({"type": "assistant", "message": {"content": text}}),
                json!({"type": "result", "subtype": "success"}),
            ],
        );
    }

    /// A worker whose subprocess fails.
    pub fn script_failed(&self, key: &str, text: &str) {
        self.script(
            key,
            vec![
                json!({"type": "system", "subtype": "stderr", "content": text}),
                json!({"type": "result", "subtype": "error", "exit_code": 1}),
            ],
        );
    }

    /// A worker that closes while reporting denied tools.
    pub fn script_denials(&self, key: &str, tools: &[&str]) {
        let denials: Vec<Value> = tools
            .iter()
            .map(|tool| json!({"tool_name": tool, "tool_input": {}}))
            .collect();
        self.script(
            key,
            vec![json!({
                "type": "result",
                "subtype": "success",
                "result": "stopped on permissions",
                "permission_denials": denials,
            })],
        );
    }

    /// A worker that produces nothing until the test emits by hand.
    pub fn script_silent(&self, key: &str) {
        self.script(key, Vec::new());
    }

    pub fn emit(&self, session_id: &str, payload: Value) {
        let _ = self.events.send(WorkerStreamEvent {
            session_id: session_id.to_string(),
            payload,
        });
    }

    pub fn spawns(&self) -> Vec<SpawnSpec> {
        self.spawns.read().clone()
    }

    pub fn last_spawn(&self) -> Option<SpawnSpec> {
        self.spawns.read().last().cloned()
    }

    pub fn resumes(&self) -> Vec<SpawnSpec> {
        self.resumes.read().clone()
    }

    pub fn kills(&self) -> Vec<String> {
        self.kills.read().clone()
    }

    fn replay_for(&self, spec: &SpawnSpec) -> Option<Vec<Value>> {
        let mut scripts = self.scripts.write();
        let (_, queue) = scripts
            .iter_mut()
            .find(|(key, _)| spec.prompt.contains(key.as_str()))?;
        let events = queue.pop_front()?;
        if queue.is_empty() {
            queue.push_back(events.clone());
        }
        Some(events)
    }

    fn replay(&self, spec: &SpawnSpec, default_close: bool) {
        match self.replay_for(spec) {
            Some(events) => {
                for payload in events {
                    self.emit(&spec.session_id, payload);
                }
            }
            None if default_close => {
                self.emit(
                    &spec.session_id,
                    json!({"type": "assistant", "message": {"content": "OK"}}),
                );
                self.emit(
                    &spec.session_id,
                    json!({"type": "result", "subtype": "success"}),
                );
            }
            None => {}
        }
    }
}

#[async_trait]
impl WorkerRuntime for FakeRuntime {
    async fn spawn(&self, spec: SpawnSpec) -> Result<()> {
        self.spawns.write().push(spec.clone());
        self.replay(&spec, true);
        Ok(())
    }

    async fn resume(&self, spec: SpawnSpec) -> Result<()> {
        self.resumes.write().push(spec.clone());
        // Resumed workers stay quiet unless scripted; tests drive them.
        self.replay(&spec, false);
        Ok(())
    }

    async fn kill(&self, session_id: &str) -> Result<()> {
        self.kills.write().push(session_id.to_string());
        self.emit(
            session_id,
            json!({"type": "result", "subtype": "error", "exit_code": 137}),
        );
        Ok(())
    }
}

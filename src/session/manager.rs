use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde_json::{json, Value};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info, warn};

use super::{
    AgentSession, MessageKind, PendingPermission, SessionMessage, SessionStatus,
};
use crate::bus::{BusEvent, EventBus};
use crate::error::{FarmError, Result};
use crate::runtime::{SpawnSpec, WorkerRuntime, WorkerStreamEvent};

/// Canned continuation sent when the operator grants a tool.
const PERMISSION_GRANTED_MESSAGE: &str = "Permission granted. Continue your task.";

/// Outcome of one permission approval.
#[derive(Debug, Clone)]
pub struct PermissionResolution {
    /// Canonically-cased tool name when the approval matched a pending
    /// denial.
    pub resolved: Option<String>,
    /// True once no denials remain pending.
    pub all_approved: bool,
}

pub struct SessionManager {
    runtime: Arc<dyn WorkerRuntime>,
    bus: Arc<EventBus>,
    sessions: RwLock<HashMap<String, AgentSession>>,
    by_agent: RwLock<HashMap<String, String>>,
}

impl SessionManager {
    pub fn new(runtime: Arc<dyn WorkerRuntime>, bus: Arc<EventBus>) -> Self {
        Self {
            runtime,
            bus,
            sessions: RwLock::new(HashMap::new()),
            by_agent: RwLock::new(HashMap::new()),
        }
    }

    /// Consume the runtime's event stream for the life of the process.
    pub fn start_event_pump(self: &Arc<Self>, mut events: UnboundedReceiver<WorkerStreamEvent>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                manager.handle_stream_event(event);
            }
        });
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn start_session(
        &self,
        agent_id: &str,
        task_id: &str,
        prompt: &str,
        working_dir: &Path,
        system_prompt: Option<String>,
        allowed_tools: Vec<String>,
        max_turns: Option<u32>,
        additional_dirs: Vec<PathBuf>,
    ) -> Result<String> {
        let mut session = AgentSession::new(agent_id, task_id, working_dir);
        session
            .messages
            .push(SessionMessage::new(MessageKind::User, prompt));
        let session_id = session.id.clone();

        self.sessions
            .write()
            .insert(session_id.clone(), session.clone());
        self.by_agent
            .write()
            .insert(agent_id.to_string(), session_id.clone());

        self.bus.publish(BusEvent::SessionCreated {
            session_id: session_id.clone(),
            agent_id: agent_id.to_string(),
            task_id: task_id.to_string(),
        });
        self.publish_status(&session_id, agent_id, SessionStatus::Starting);

        let spec = SpawnSpec::new(&session_id, working_dir, prompt)
            .with_system_prompt(system_prompt)
            .with_allowed_tools(allowed_tools)
            .with_max_turns(max_turns)
            .with_additional_dirs(additional_dirs);

        if let Err(e) = self.runtime.spawn(spec).await {
            self.sessions.write().remove(&session_id);
            self.by_agent.write().remove(agent_id);
            return Err(e);
        }

        self.set_status(&session_id, SessionStatus::Active);
        info!(session_id = %session_id, agent_id = %agent_id, "Session started");
        Ok(session_id)
    }

    /// Append an operator message and resume the worker with it.
    pub async fn send_message(
        &self,
        session_id: &str,
        message: &str,
        working_dir: &Path,
        allowed_tools: Vec<String>,
    ) -> Result<()> {
        self.append_message(session_id, SessionMessage::new(MessageKind::User, message))?;
        let spec = SpawnSpec::new(session_id, working_dir, message).with_allowed_tools(allowed_tools);
        self.runtime.resume(spec).await?;
        self.set_status(session_id, SessionStatus::Active);
        Ok(())
    }

    /// Kill the subprocess; the terminal close event then ends the session
    /// in error.
    pub async fn stop_session(&self, session_id: &str) -> Result<()> {
        if self.get(session_id).is_none() {
            return Err(FarmError::SessionNotFound(session_id.to_string()));
        }
        self.runtime.kill(session_id).await
    }

    pub fn get(&self, session_id: &str) -> Option<AgentSession> {
        self.sessions.read().get(session_id).cloned()
    }

    /// The agent's session in a live state, if any.
    pub fn active_session_for_agent(&self, agent_id: &str) -> Option<AgentSession> {
        let session_id = self.by_agent.read().get(agent_id).cloned()?;
        self.get(&session_id).filter(|s| s.status.is_live())
    }

    /// Case-insensitive match against pending denials. Idempotent: approving
    /// a tool that is not pending reports the remaining state unchanged.
    pub fn approve_permission(&self, session_id: &str, tool: &str) -> Result<PermissionResolution> {
        let mut sessions = self.sessions.write();
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| FarmError::SessionNotFound(session_id.to_string()))?;

        let resolved = session
            .pending_permissions
            .iter()
            .position(|p| p.tool_name.eq_ignore_ascii_case(tool))
            .map(|idx| session.pending_permissions.remove(idx).tool_name);

        Ok(PermissionResolution {
            resolved,
            all_approved: session.pending_permissions.is_empty(),
        })
    }

    /// The operator refused; the session ends as completed with whatever
    /// the worker produced before the denial.
    pub fn deny_permission(&self, session_id: &str) -> Result<()> {
        let events = {
            let mut sessions = self.sessions.write();
            let session = sessions
                .get_mut(session_id)
                .ok_or_else(|| FarmError::SessionNotFound(session_id.to_string()))?;
            if session.status.is_terminal() {
                return Ok(());
            }
            session.pending_permissions.clear();
            end_session(session, SessionStatus::Completed, 0)
        };
        self.cleanup_after_end(session_id);
        for event in events {
            self.bus.publish(event);
        }
        Ok(())
    }

    /// Continue a session that was waiting on permissions, with the grown
    /// tool list.
    pub async fn resume_session(
        &self,
        session_id: &str,
        allowed_tools: Vec<String>,
        working_dir: &Path,
    ) -> Result<()> {
        self.send_message(
            session_id,
            PERMISSION_GRANTED_MESSAGE,
            working_dir,
            allowed_tools,
        )
        .await
    }

    // ---- stream event handling ----

    fn handle_stream_event(&self, event: WorkerStreamEvent) {
        let WorkerStreamEvent {
            session_id,
            payload,
        } = event;

        if payload.get("type").and_then(Value::as_str) == Some("result") {
            self.handle_terminal(&session_id, &payload);
            return;
        }

        let Some(messages) = map_event(&payload) else {
            return;
        };
        for message in messages {
            if let Err(e) = self.append_message(&session_id, message) {
                debug!(session_id = %session_id, error = %e, "Dropping stream event for unknown session");
            }
        }
    }

    fn handle_terminal(&self, session_id: &str, payload: &Value) {
        let events = {
            let mut sessions = self.sessions.write();
            let Some(session) = sessions.get_mut(session_id) else {
                return;
            };

            // Double-end protection: a session only ends once, and a session
            // parked on permissions is not ended by trailing closes.
            if session.status.is_terminal() || session.status == SessionStatus::WaitingInput {
                return;
            }

            let denials = extract_denials(payload);
            if !denials.is_empty() {
                session.pending_permissions = denials.clone();
                session.status = SessionStatus::WaitingInput;
                session.last_activity_at = Utc::now();
                let mut events = vec![BusEvent::SessionStatusChanged {
                    session_id: session.id.clone(),
                    agent_id: session.agent_id.clone(),
                    status: SessionStatus::WaitingInput,
                }];
                events.extend(denials.into_iter().map(|denial| {
                    BusEvent::PermissionRequested {
                        session_id: session.id.clone(),
                        agent_id: session.agent_id.clone(),
                        tool_name: denial.tool_name,
                        tool_input: denial.tool_input,
                    }
                }));
                events
            } else {
                // Preserve terminal result text that never streamed as an
                // assistant message.
                if let Some(result_text) = payload.get("result").and_then(Value::as_str) {
                    if !result_text.is_empty() && !session.has_assistant_message() {
                        session
                            .messages
                            .push(SessionMessage::new(MessageKind::Assistant, result_text));
                    }
                }
                let status = match payload.get("subtype").and_then(Value::as_str) {
                    Some("error") => SessionStatus::Error,
                    _ => SessionStatus::Completed,
                };
                end_session(session, status, extract_tokens(payload))
            }
        };

        if !events.is_empty() {
            if events
                .iter()
                .any(|e| matches!(e, BusEvent::SessionEnded { .. }))
            {
                self.cleanup_after_end(session_id);
            }
            for event in events {
                self.bus.publish(event);
            }
        }
    }

    fn append_message(&self, session_id: &str, message: SessionMessage) -> Result<()> {
        let (agent_id, message) = {
            let mut sessions = self.sessions.write();
            let session = sessions
                .get_mut(session_id)
                .ok_or_else(|| FarmError::SessionNotFound(session_id.to_string()))?;
            session.last_activity_at = Utc::now();
            session.messages.push(message.clone());
            (session.agent_id.clone(), message)
        };
        self.bus.publish(BusEvent::SessionMessage {
            session_id: session_id.to_string(),
            agent_id,
            message,
        });
        Ok(())
    }

    fn set_status(&self, session_id: &str, status: SessionStatus) {
        let agent_id = {
            let mut sessions = self.sessions.write();
            match sessions.get_mut(session_id) {
                // A terminal session stays terminal; a fast worker may close
                // before the spawn path gets here.
                Some(session) if session.status != status && !session.status.is_terminal() => {
                    session.status = status;
                    session.last_activity_at = Utc::now();
                    Some(session.agent_id.clone())
                }
                _ => None,
            }
        };
        if let Some(agent_id) = agent_id {
            self.publish_status(session_id, &agent_id, status);
        }
    }

    fn publish_status(&self, session_id: &str, agent_id: &str, status: SessionStatus) {
        self.bus.publish(BusEvent::SessionStatusChanged {
            session_id: session_id.to_string(),
            agent_id: agent_id.to_string(),
            status,
        });
    }

    fn cleanup_after_end(&self, session_id: &str) {
        let mut by_agent = self.by_agent.write();
        by_agent.retain(|_, sid| sid != session_id);
    }
}

/// Flip the session to a terminal status and produce the events to publish
/// once locks are released.
fn end_session(
    session: &mut AgentSession,
    status: SessionStatus,
    tokens_used: u64,
) -> Vec<BusEvent> {
    session.status = status;
    session.last_activity_at = Utc::now();
    warn_if_empty(session);
    vec![
        BusEvent::SessionStatusChanged {
            session_id: session.id.clone(),
            agent_id: session.agent_id.clone(),
            status,
        },
        BusEvent::SessionEnded {
            session_id: session.id.clone(),
            agent_id: session.agent_id.clone(),
            task_id: session.task_id.clone(),
            status,
            result: session.assistant_transcript(),
            tokens_used,
        },
    ]
}

/// Token usage from a worker's own terminal result event, when present.
fn extract_tokens(payload: &Value) -> u64 {
    let Some(usage) = payload.get("usage") else {
        return 0;
    };
    let input = usage
        .get("input_tokens")
        .and_then(Value::as_u64)
        .unwrap_or(0);
    let output = usage
        .get("output_tokens")
        .and_then(Value::as_u64)
        .unwrap_or(0);
    input + output
}

fn warn_if_empty(session: &AgentSession) {
    if !session.has_assistant_message() {
        warn!(session_id = %session.id, "Session ended without assistant output");
    }
}

/// Unique permission denials from a terminal event, deduplicated
/// case-insensitively by tool name.
fn extract_denials(payload: &Value) -> Vec<PendingPermission> {
    let Some(denials) = payload.get("permission_denials").and_then(Value::as_array) else {
        return Vec::new();
    };
    let mut seen = Vec::new();
    let mut out = Vec::new();
    for denial in denials {
        let Some(tool_name) = denial.get("tool_name").and_then(Value::as_str) else {
            continue;
        };
        let lowered = tool_name.to_ascii_lowercase();
        if seen.contains(&lowered) {
            continue;
        }
        seen.push(lowered);
        out.push(PendingPermission {
            tool_name: tool_name.to_string(),
            tool_input: denial.get("tool_input").cloned().unwrap_or(Value::Null),
        });
    }
    out
}

/// Map one raw protocol event into session messages. `None` means the event
/// produces nothing (partial JSON noise, unknown shapes).
fn map_event(payload: &Value) -> Option<Vec<SessionMessage>> {
    let event_type = payload.get("type").and_then(Value::as_str)?;
    match event_type {
        "assistant" => {
            let content = payload.get("message")?.get("content")?;
            if let Some(text) = content.as_str() {
                return Some(vec![SessionMessage::new(MessageKind::Assistant, text)]);
            }
            let blocks = content.as_array()?;
            let messages: Vec<SessionMessage> = blocks
                .iter()
                .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|b| b.get("text").and_then(Value::as_str))
                .map(|text| SessionMessage::new(MessageKind::Assistant, text))
                .collect();
            if messages.is_empty() {
                None
            } else {
                Some(messages)
            }
        }
        "content_block_start" => {
            let block = payload.get("content_block")?;
            match block.get("type").and_then(Value::as_str)? {
                "thinking" => {
                    let thinking = block.get("thinking").and_then(Value::as_str)?;
                    Some(vec![SessionMessage::new(MessageKind::Thinking, thinking)])
                }
                "tool_use" => {
                    let name = block.get("name").and_then(Value::as_str).unwrap_or("");
                    let metadata = json!({
                        "toolName": name,
                        "toolId": block.get("id").cloned().unwrap_or(Value::Null),
                        "input": block.get("input").cloned().unwrap_or(Value::Null),
                    });
                    Some(vec![
                        SessionMessage::new(MessageKind::ToolUse, name).with_metadata(metadata)
                    ])
                }
                "text" => {
                    let text = block.get("text").and_then(Value::as_str)?;
                    Some(vec![SessionMessage::new(MessageKind::Assistant, text)])
                }
                _ => None,
            }
        }
        "content_block_delta" => {
            let delta = payload.get("delta")?;
            match delta.get("type").and_then(Value::as_str)? {
                "thinking_delta" => {
                    let thinking = delta.get("thinking").and_then(Value::as_str)?;
                    Some(vec![SessionMessage::new(MessageKind::Thinking, thinking)])
                }
                "text_delta" => {
                    let text = delta.get("text").and_then(Value::as_str)?;
                    Some(vec![SessionMessage::new(MessageKind::Assistant, text)])
                }
                // Partial tool-input JSON is noise.
                _ => None,
            }
        }
        "tool_result" => Some(vec![SessionMessage::new(
            MessageKind::ToolResult,
            content_text(payload),
        )]),
        "system" => {
            if payload.get("subtype").and_then(Value::as_str) == Some("tool_result") {
                Some(vec![SessionMessage::new(
                    MessageKind::ToolResult,
                    content_text(payload),
                )])
            } else {
                Some(vec![SessionMessage::new(
                    MessageKind::System,
                    content_text(payload),
                )])
            }
        }
        _ => None,
    }
}

fn content_text(payload: &Value) -> String {
    match payload.get("content") {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => payload.to_string(),
    }
}

//! Session lifecycle, permission negotiation, and dispatch guard behavior.

mod fixtures;

use fixtures::{wait_for, Harness};
use serde_json::json;
use workfarm::bus::BusEvent;
use workfarm::session::SessionStatus;
use workfarm::task::TaskStatus;

async fn dispatch_silent(h: &Harness, agent_id: &str, description: &str) -> (String, String) {
    h.runtime.script_silent(description);
    let task = h
        .tasks
        .create_task(description, Some(agent_id.to_string()))
        .await;
    let session_id = h
        .bridge
        .dispatch_worker(agent_id, &task.id, None, None, None)
        .await
        .unwrap();
    (task.id.clone(), session_id)
}

#[tokio::test]
async fn test_permission_denial_waits_then_approval_resumes() {
    let h = Harness::new().await;
    let agent = h.hire("Sam").await;
    let (task_id, session_id) = dispatch_silent(&h, &agent.id, "install dependencies").await;

    // The worker stops, reporting a denied tool.
    h.runtime.emit(
        &session_id,
        json!({
            "type": "result",
            "subtype": "success",
            "result": "blocked on tooling",
            "permission_denials": [
                {"tool_name": "Bash", "tool_input": {"command": "npm install"}},
                {"tool_name": "bash"},
            ],
        }),
    );

    wait_for("session waiting for input", || {
        h.sessions
            .get(&session_id)
            .is_some_and(|s| s.status == SessionStatus::WaitingInput)
    })
    .await;

    // Denials dedupe case-insensitively: one request for Bash.
    let requests = h.captured(|e| {
        matches!(&e.event, BusEvent::PermissionRequested { tool_name, .. } if tool_name == "Bash")
    });
    assert_eq!(requests.len(), 1);
    assert!(h
        .captured(
            |e| matches!(&e.event, BusEvent::SessionEnded { session_id: sid, .. } if *sid == session_id)
        )
        .is_empty());

    // Trailing closes from the dead process must not end the parked session.
    h.runtime
        .emit(&session_id, json!({"type": "result", "subtype": "close"}));
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(
        h.sessions.get(&session_id).unwrap().status,
        SessionStatus::WaitingInput
    );

    // Approval is case-insensitive and resolves to the canonical name.
    let all_approved = h
        .bridge
        .approve_tool_permission(&agent.id, "bash")
        .await
        .unwrap();
    assert!(all_approved);
    assert!(h
        .agents
        .get(&agent.id)
        .unwrap()
        .approved_tools
        .contains("Bash"));

    wait_for("session resumed", || {
        h.sessions
            .get(&session_id)
            .is_some_and(|s| s.status == SessionStatus::Active)
    })
    .await;
    let resumes = h.runtime.resumes();
    assert_eq!(resumes.len(), 1);
    assert_eq!(resumes[0].prompt, "Permission granted. Continue your task.");
    assert!(resumes[0].allowed_tools.iter().any(|t| t == "Bash"));

    // A clean close now ends the session normally.
    h.runtime.emit(
        &session_id,
        json!({"type": "assistant", "message": {"content": "installed"}}),
    );
    h.runtime
        .emit(&session_id, json!({"type": "result", "subtype": "success"}));

    wait_for("session completed", || {
        h.sessions
            .get(&session_id)
            .is_some_and(|s| s.status == SessionStatus::Completed)
    })
    .await;
    wait_for("task settled", || {
        h.tasks
            .get(&task_id)
            .is_some_and(|t| t.status == TaskStatus::Completed)
    })
    .await;
}

#[tokio::test]
async fn test_approval_is_idempotent_once_cleared() {
    let h = Harness::new().await;
    let agent = h.hire("Sam").await;
    let (_task_id, session_id) = dispatch_silent(&h, &agent.id, "touch a file").await;

    h.runtime.emit(
        &session_id,
        json!({
            "type": "result",
            "subtype": "success",
            "permission_denials": [{"tool_name": "Write"}],
        }),
    );
    wait_for("waiting for input", || {
        h.sessions
            .get(&session_id)
            .is_some_and(|s| s.status == SessionStatus::WaitingInput)
    })
    .await;

    let first = h.sessions.approve_permission(&session_id, "write").unwrap();
    assert_eq!(first.resolved.as_deref(), Some("Write"));
    assert!(first.all_approved);

    let second = h.sessions.approve_permission(&session_id, "write").unwrap();
    assert!(second.resolved.is_none());
    assert!(second.all_approved);

    // Approving through the bridge after the list cleared resumes nothing new.
    h.bridge
        .approve_tool_permission(&agent.id, "write")
        .await
        .unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert!(h.runtime.resumes().is_empty());
}

#[tokio::test]
async fn test_deny_ends_session_completed() {
    let h = Harness::new().await;
    let agent = h.hire("Sam").await;
    let (task_id, session_id) = dispatch_silent(&h, &agent.id, "risky change").await;

    h.runtime.emit(
        &session_id,
        json!({
            "type": "assistant",
            "message": {"content": "partial work done"},
        }),
    );
    h.runtime.emit(
        &session_id,
        json!({
            "type": "result",
            "subtype": "success",
            "permission_denials": [{"tool_name": "Bash"}],
        }),
    );
    wait_for("waiting for input", || {
        h.sessions
            .get(&session_id)
            .is_some_and(|s| s.status == SessionStatus::WaitingInput)
    })
    .await;

    h.bridge.deny_tool_permission(&agent.id).unwrap();

    assert_eq!(
        h.sessions.get(&session_id).unwrap().status,
        SessionStatus::Completed
    );
    wait_for("task settled with partial result", || {
        h.tasks
            .get(&task_id)
            .is_some_and(|t| t.status == TaskStatus::Completed)
    })
    .await;
    assert_eq!(
        h.tasks.get(&task_id).unwrap().result.as_deref(),
        Some("partial work done")
    );
}

#[tokio::test]
async fn test_double_end_protection() {
    let h = Harness::new().await;
    let agent = h.hire("Sam").await;
    let (_task_id, session_id) = dispatch_silent(&h, &agent.id, "quick job").await;

    h.runtime.emit(
        &session_id,
        json!({"type": "assistant", "message": {"content": "done"}}),
    );
    h.runtime
        .emit(&session_id, json!({"type": "result", "subtype": "success"}));

    wait_for("session completed", || {
        h.sessions
            .get(&session_id)
            .is_some_and(|s| s.status == SessionStatus::Completed)
    })
    .await;

    // The runtime's own synthetic close arrives after the protocol result.
    h.runtime
        .emit(&session_id, json!({"type": "result", "subtype": "close"}));
    h.runtime
        .emit(&session_id, json!({"type": "result", "subtype": "error"}));
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    assert_eq!(
        h.sessions.get(&session_id).unwrap().status,
        SessionStatus::Completed
    );
    let ended = h.captured(
        |e| matches!(&e.event, BusEvent::SessionEnded { session_id: sid, .. } if *sid == session_id),
    );
    assert_eq!(ended.len(), 1);
}

#[tokio::test]
async fn test_single_flight_guard_per_agent() {
    let h = Harness::new().await;
    let agent = h.hire("Sam").await;
    let (_task_id, session_id) = dispatch_silent(&h, &agent.id, "long running job").await;

    assert!(h.bridge.is_agent_busy(&agent.id));

    let second = h
        .tasks
        .create_task("another job", Some(agent.id.clone()))
        .await;
    let result = h
        .bridge
        .dispatch_worker(&agent.id, &second.id, None, None, None)
        .await;
    assert!(result.is_err());

    // Settling the first session frees the agent.
    h.runtime
        .emit(&session_id, json!({"type": "result", "subtype": "success"}));
    wait_for("guard released", || !h.bridge.is_agent_busy(&agent.id)).await;
}

#[tokio::test]
async fn test_cancel_execution_fails_task() {
    let h = Harness::new().await;
    let agent = h.hire("Sam").await;
    let (task_id, session_id) = dispatch_silent(&h, &agent.id, "doomed job").await;

    h.bridge.cancel_execution(&agent.id).await.unwrap();

    assert_eq!(h.runtime.kills(), vec![session_id.clone()]);
    wait_for("session errored", || {
        h.sessions
            .get(&session_id)
            .is_some_and(|s| s.status == SessionStatus::Error)
    })
    .await;
    wait_for("task failed", || {
        h.tasks
            .get(&task_id)
            .is_some_and(|t| t.status == TaskStatus::Failed)
    })
    .await;
}

#[tokio::test]
async fn test_terminal_result_text_becomes_assistant_message() {
    let h = Harness::new().await;
    let agent = h.hire("Sam").await;
    let (task_id, session_id) = dispatch_silent(&h, &agent.id, "summarize something").await;

    // No assistant messages streamed; only the terminal result carries text.
    h.runtime.emit(
        &session_id,
        json!({"type": "result", "subtype": "success", "result": "the summary"}),
    );

    wait_for("task carries the result text", || {
        h.tasks
            .get(&task_id)
            .is_some_and(|t| t.result.as_deref() == Some("the summary"))
    })
    .await;
}

#[tokio::test]
async fn test_one_off_completion_counts_for_agent() {
    let h = Harness::new().await;
    let agent = h.hire("Sam").await;
    let (_task_id, session_id) = dispatch_silent(&h, &agent.id, "odd job").await;

    h.runtime.emit(
        &session_id,
        json!({"type": "assistant", "message": {"content": "done"}}),
    );
    h.runtime
        .emit(&session_id, json!({"type": "result", "subtype": "success"}));

    wait_for("one-off counted", || {
        h.agents.get(&agent.id).unwrap().tasks_completed == 1
    })
    .await;
}

//! End-to-end orchestration flows over scripted oracle and worker fakes.

mod fixtures;

use fixtures::{wait_for, Harness};
use workfarm::bus::BusEvent;
use workfarm::goal::{GoalStatus, StepStatus};

const TWO_STEP_PLAN: &str = r#"{
    "reasoning": "profile first, then fix what profiling finds",
    "recurring": false,
    "steps": [{"description": "profile"}, {"description": "fix N+1"}]
}"#;

const RECON_REPORT: &str = "A small web app.\n<recon_summary>\nPROJECT_PATH: /srv/app\nLANGUAGE: Rust\nFRAMEWORK: none\nKEY_FILES: src/db.rs\nCURRENT_STATE: queries unindexed\nIMPROVEMENT_OPPORTUNITIES: add indexes\n</recon_summary>";

#[tokio::test]
async fn test_happy_path_two_steps_to_completion() {
    let h = Harness::new().await;
    let agent = h.hire("Sam").await;
    let goal = h.goal_for(&agent, "optimize queries").await;

    h.oracle.on_static("Plan the work", TWO_STEP_PLAN);
    h.oracle.on_static("Write the instruction", "carry out the step");
    h.oracle
        .on_static("Judge whether", r#"{"verdict": "PASS", "reasoning": "looks right"}"#);
    h.oracle
        .on_static("A plan step just completed", r#"{"needs_refinement": false}"#);

    h.runtime
        .script_completed("Explore the working tree", RECON_REPORT);
    h.runtime
        .script_completed("<worker_instruction>", "profiled\n<step_summary>found N+1</step_summary>");
    h.runtime
        .script_completed("<worker_instruction>", "patched\n<step_summary>index added</step_summary>");

    h.adversary.wake(&goal.id);

    wait_for("goal completed", || {
        h.goals.get_goal(&goal.id).unwrap().status == GoalStatus::Completed
    })
    .await;

    let plan = h.goals.get_current_plan(&goal.id).unwrap();
    assert_eq!(plan.version, 1);
    assert_eq!(plan.steps.len(), 2);
    let orders: Vec<usize> = plan.steps.iter().map(|s| s.order).collect();
    assert_eq!(orders, vec![0, 1]);
    assert!(plan.steps.iter().all(|s| s.status == StepStatus::Completed));
    assert!(plan.steps.iter().all(|s| s.result.is_some()));

    wait_for("two steps counted", || {
        h.agents.get(&agent.id).unwrap().tasks_completed == 2
    })
    .await;
    assert!(!h.adversary.is_goal_active(&goal.id));
}

#[tokio::test]
async fn test_retry_then_pass_reuses_step() {
    let h = Harness::new().await;
    let agent = h.hire("Sam").await;
    let goal = h.goal_for(&agent, "profile the hot path").await;

    h.oracle.on_static(
        "Plan the work",
        r#"{"reasoning": "one step", "steps": [{"description": "profile"}]}"#,
    );
    h.oracle.on_static("Write the instruction", "profile it");
    h.oracle.on_sequence(
        "Judge whether",
        vec![
            r#"{"verdict": "RETRY", "reasoning": "shallow", "refined_instruction": "re-check file X"}"#,
            r#"{"verdict": "PASS", "reasoning": "thorough now"}"#,
        ],
    );

    h.runtime
        .script_completed("Explore the working tree", RECON_REPORT);
    h.runtime
        .script_completed("<worker_instruction>", "shallow results");
    h.runtime
        .script_completed("<worker_instruction>", "deep results");

    h.adversary.wake(&goal.id);

    wait_for("goal completed after retry", || {
        h.goals.get_goal(&goal.id).unwrap().status == GoalStatus::Completed
    })
    .await;

    let plan = h.goals.get_current_plan(&goal.id).unwrap();
    assert_eq!(plan.steps.len(), 1);
    assert_eq!(plan.steps[0].status, StepStatus::Completed);

    // One extra task under the same step: two dispatches of "profile".
    let step_tasks: Vec<_> = h
        .tasks
        .list()
        .into_iter()
        .filter(|t| t.description == "profile")
        .collect();
    assert_eq!(step_tasks.len(), 2);

    // The retry used the evaluator's refined instruction; crafting ran once.
    h.oracle.assert_called("Write the instruction", 1);
    let retry_spawn = h.runtime.last_spawn().unwrap();
    assert!(retry_spawn.prompt.contains("re-check file X"));
}

#[tokio::test]
async fn test_needs_input_blocks_then_reply_redispatches() {
    let h = Harness::new().await;
    let agent = h.hire("Sam").await;
    let goal = h.goal_for(&agent, "wire up persistence").await;

    h.oracle.on_static(
        "Plan the work",
        r#"{"reasoning": "one step", "steps": [{"description": "configure the database"}]}"#,
    );
    h.oracle.on_static("Write the instruction", "configure it");
    h.oracle.on_static(
        "A worker asked a question",
        r#"{"can_answer": false, "answer": "", "reasoning": "operator choice"}"#,
    );
    h.oracle.on_static(
        "Extract durable user preferences",
        r#"{"preferences": [{"category": "infra", "key": "db_driver", "value": "Postgres", "confidence": "explicit"}]}"#,
    );
    h.oracle.on_static(
        "A worker paused on this plan step",
        "Configure the database using the Postgres driver.",
    );
    h.oracle
        .on_static("Judge whether", r#"{"verdict": "PASS", "reasoning": "done"}"#);

    h.runtime
        .script_completed("Explore the working tree", RECON_REPORT);
    h.runtime.script_completed(
        "<worker_instruction>",
        "I set up the scaffolding.\n[NEEDS_INPUT]: Which DB driver?",
    );
    h.runtime
        .script_completed("<worker_instruction>", "configured with Postgres");

    h.adversary.wake(&goal.id);

    wait_for("step blocked on the operator", || {
        h.goals.get_blocked_step(&goal.id).is_some()
    })
    .await;

    let blocked = h.goals.get_blocked_step(&goal.id).unwrap();
    assert_eq!(blocked.question.as_deref(), Some("Which DB driver?"));
    let raised = h.captured(|e| matches!(e.event, BusEvent::QuestionRaised { .. }));
    assert_eq!(raised.len(), 1);

    h.adversary.reply(&goal.id, "Postgres").unwrap();

    wait_for("goal completed after reply", || {
        h.goals.get_goal(&goal.id).unwrap().status == GoalStatus::Completed
    })
    .await;

    // The resumed instruction was rewritten to embed the answer.
    let resumed_spawn = h.runtime.last_spawn().unwrap();
    assert!(resumed_spawn.prompt.contains("Postgres"));

    // Preference extraction fired and stored the stated choice.
    wait_for("preference extracted", || h.oracle.call_count("Extract durable user preferences") > 0)
        .await;
    wait_for("preference stored", || {
        h.events.lock().iter().any(|e| {
            matches!(&e.event, BusEvent::PreferenceStored { key, .. } if key == "db_driver")
        })
    })
    .await;
    let pref = h.preferences.get(&agent.id, "db_driver").await.unwrap();
    assert_eq!(pref.value, "Postgres");
}

#[tokio::test]
async fn test_failed_step_triggers_replanning() {
    let h = Harness::new().await;
    let agent = h.hire("Sam").await;
    let goal = h.goal_for(&agent, "stabilize the build").await;

    h.oracle.on_sequence(
        "Plan the work",
        vec![
            r#"{"reasoning": "first try", "steps": [{"description": "run the suite"}]}"#,
            r#"{"reasoning": "second try", "steps": [{"description": "run the suite serially"}]}"#,
        ],
    );
    h.oracle.on_static("Write the instruction", "run it");
    h.oracle
        .on_static("Judge whether", r#"{"verdict": "PASS", "reasoning": "green"}"#);

    h.runtime
        .script_completed("Explore the working tree", RECON_REPORT);
    h.runtime.script_failed("<worker_instruction>", "OOM killed");
    h.runtime
        .script_completed("<worker_instruction>", "suite green");

    h.adversary.wake(&goal.id);

    wait_for("goal completed on plan v2", || {
        let goal = h.goals.get_goal(&goal.id).unwrap();
        goal.status == GoalStatus::Completed
    })
    .await;

    let plan = h.goals.get_current_plan(&goal.id).unwrap();
    assert_eq!(plan.version, 2);
    assert_eq!(plan.steps[0].description, "run the suite serially");
    assert_eq!(plan.steps[0].status, StepStatus::Completed);
}

#[tokio::test]
async fn test_refinement_can_skip_pending_steps() {
    let h = Harness::new().await;
    let agent = h.hire("Sam").await;
    let goal = h.goal_for(&agent, "tidy the workspace").await;

    h.oracle.on_static(
        "Plan the work",
        r#"{"reasoning": "two steps", "steps": [{"description": "sweep"}, {"description": "mop"}]}"#,
    );
    h.oracle.on_static("Write the instruction", "do it");
    h.oracle
        .on_static("Judge whether", r#"{"verdict": "PASS", "reasoning": "ok"}"#);
    h.oracle.on_static(
        "A plan step just completed",
        r#"{"needs_refinement": true, "reasoning": "sweeping covered it", "refined_steps": [{"order": 1, "description": "SKIP"}]}"#,
    );

    h.runtime
        .script_completed("Explore the working tree", RECON_REPORT);
    h.runtime
        .script_completed("<worker_instruction>", "swept everything");

    h.adversary.wake(&goal.id);

    wait_for("goal completed with a skip", || {
        h.goals.get_goal(&goal.id).unwrap().status == GoalStatus::Completed
    })
    .await;

    let plan = h.goals.get_current_plan(&goal.id).unwrap();
    assert_eq!(plan.steps[0].status, StepStatus::Completed);
    assert_eq!(plan.steps[1].status, StepStatus::Skipped);

    // Only the first step dispatched a worker.
    let step_spawns = h
        .runtime
        .spawns()
        .into_iter()
        .filter(|s| s.prompt.contains("<worker_instruction>"))
        .count();
    assert_eq!(step_spawns, 1);
}

#[tokio::test]
async fn test_recurring_trigger_starts_new_cycle() {
    let h = Harness::new().await;
    let agent = h.hire("Sam").await;
    let goal = h.goal_for(&agent, "keep dependencies fresh").await;

    h.oracle.on_static(
        "Plan the work",
        r#"{"reasoning": "periodic", "recurring": true, "interval_minutes": 1, "steps": [{"description": "check for updates"}]}"#,
    );
    h.oracle.on_static("Write the instruction", "check now");
    h.oracle
        .on_static("Judge whether", r#"{"verdict": "PASS", "reasoning": "done"}"#);

    h.runtime
        .script_completed("Explore the working tree", RECON_REPORT);
    h.runtime
        .script_completed("<worker_instruction>", "all current");

    h.adversary.wake(&goal.id);

    wait_for("first cycle finished", || {
        h.goals
            .get_current_plan(&goal.id)
            .is_some_and(|p| p.version == 1 && p.is_finished())
    })
    .await;
    assert_eq!(h.goals.get_goal(&goal.id).unwrap().status, GoalStatus::Active);

    h.scheduler
        .add_interval_trigger(&agent.id, &goal.id, 50)
        .await
        .unwrap();

    wait_for("second planning cycle", || {
        h.goals
            .get_current_plan(&goal.id)
            .is_some_and(|p| p.version >= 2)
    })
    .await;

    assert!(!h
        .captured(|e| matches!(e.event, BusEvent::TriggerFired { .. }))
        .is_empty());
    assert_eq!(h.goals.get_goal(&goal.id).unwrap().status, GoalStatus::Active);

    h.scheduler.stop();
}

#[tokio::test]
async fn test_unparseable_plan_fails_goal() {
    let h = Harness::new().await;
    let _agent = h.hire("Sam").await;
    let goal = h.goal_for(&_agent, "do something").await;

    h.oracle
        .on_static("Plan the work", "I am sorry, I cannot plan this.");
    h.runtime
        .script_completed("Explore the working tree", RECON_REPORT);

    h.adversary.wake(&goal.id);

    wait_for("goal failed", || {
        h.goals.get_goal(&goal.id).unwrap().status == GoalStatus::Failed
    })
    .await;
    assert!(!h.adversary.is_goal_active(&goal.id));
}

#[tokio::test]
async fn test_reply_without_blocked_step_is_rejected() {
    let h = Harness::new().await;
    let _agent = h.hire("Sam").await;
    let goal = h.goal_for(&_agent, "anything").await;

    assert!(h.adversary.reply(&goal.id, "some answer").is_err());
}

#[tokio::test]
async fn test_talk_answers_without_dispatching_workers() {
    let h = Harness::new().await;
    let agent = h.hire("Sam").await;
    let _goal = h.goal_for(&agent, "optimize queries").await;

    h.oracle
        .on_static("chatting with your operator", "Still profiling the slow queries.");

    let reply = h
        .adversary
        .talk(&agent.id, "how is it going?", None)
        .await
        .unwrap();
    assert_eq!(reply, "Still profiling the slow queries.");
    assert!(h.runtime.spawns().is_empty());
}

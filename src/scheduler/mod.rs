//! Interval-based wake of recurring goals.
//!
//! One timer task per enabled interval trigger. A firing short-circuits when
//! the goal is gone, paused, terminal, or already being worked; a timer
//! whose trigger disappears tears itself down.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::adversary::Adversary;
use crate::bus::{BusEvent, EventBus};
use crate::error::{FarmError, Result};
use crate::goal::{AgentTrigger, GoalManager, GoalStatus, TriggerType};

pub struct TriggerScheduler {
    goals: Arc<GoalManager>,
    adversary: Arc<Adversary>,
    bus: Arc<EventBus>,
    timers: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl TriggerScheduler {
    pub fn new(
        goals: Arc<GoalManager>,
        adversary: Arc<Adversary>,
        bus: Arc<EventBus>,
    ) -> Arc<Self> {
        Arc::new(Self {
            goals,
            adversary,
            bus,
            timers: Mutex::new(HashMap::new()),
        })
    }

    /// Arm a timer for every enabled interval trigger in the store.
    pub fn start(self: &Arc<Self>) {
        for trigger in self.goals.list_triggers() {
            if trigger.enabled && trigger.trigger_type == TriggerType::Interval {
                self.arm(&trigger);
            }
        }
        info!(count = self.timers.lock().len(), "Trigger scheduler started");
    }

    pub async fn add_interval_trigger(
        self: &Arc<Self>,
        agent_id: &str,
        goal_id: &str,
        interval_ms: u64,
    ) -> Result<AgentTrigger> {
        if self.goals.get_goal(goal_id).is_none() {
            return Err(FarmError::GoalNotFound(goal_id.to_string()));
        }
        let trigger = self
            .goals
            .create_trigger(AgentTrigger::interval(agent_id, goal_id, interval_ms))
            .await;
        self.arm(&trigger);
        Ok(trigger)
    }

    pub async fn remove_trigger(&self, trigger_id: &str) -> Result<()> {
        self.drop_timer(trigger_id);
        self.goals.remove_trigger(trigger_id).await?;
        Ok(())
    }

    /// Tear down live timers without touching the store (fire cascade: the
    /// records are already gone).
    pub fn drop_timers(&self, trigger_ids: &[String]) {
        for trigger_id in trigger_ids {
            self.drop_timer(trigger_id);
        }
    }

    /// Run the firing path once, for a manual trigger or on demand.
    pub async fn fire_manual(&self, trigger_id: &str) -> Result<()> {
        let trigger = self
            .goals
            .get_trigger(trigger_id)
            .ok_or_else(|| FarmError::TriggerNotFound(trigger_id.to_string()))?;
        fire(&self.goals, &self.adversary, &self.bus, &trigger).await;
        Ok(())
    }

    pub fn stop(&self) {
        let mut timers = self.timers.lock();
        for (_, handle) in timers.drain() {
            handle.abort();
        }
    }

    fn arm(self: &Arc<Self>, trigger: &AgentTrigger) {
        let Some(interval_ms) = trigger.interval_ms.filter(|ms| *ms > 0) else {
            warn!(trigger_id = %trigger.id, "Interval trigger without an interval; not arming");
            return;
        };
        self.drop_timer(&trigger.id);

        let scheduler = Arc::clone(self);
        let trigger_id = trigger.id.clone();
        let period = Duration::from_millis(interval_ms);

        let handle = tokio::spawn({
            let trigger_id = trigger_id.clone();
            async move {
                let _ = scheduler
                    .goals
                    .set_trigger_next_fire(&trigger_id, Utc::now() + chrono::Duration::milliseconds(interval_ms as i64))
                    .await;
                let mut ticker = time::interval_at(time::Instant::now() + period, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    let Some(trigger) = scheduler.goals.get_trigger(&trigger_id) else {
                        debug!(trigger_id = %trigger_id, "Trigger removed; stopping timer");
                        return;
                    };
                    if !trigger.enabled {
                        continue;
                    }
                    fire(&scheduler.goals, &scheduler.adversary, &scheduler.bus, &trigger).await;
                }
            }
        });
        self.timers.lock().insert(trigger_id, handle);
    }

    fn drop_timer(&self, trigger_id: &str) {
        if let Some(handle) = self.timers.lock().remove(trigger_id) {
            handle.abort();
        }
    }
}

async fn fire(
    goals: &Arc<GoalManager>,
    adversary: &Arc<Adversary>,
    bus: &Arc<EventBus>,
    trigger: &AgentTrigger,
) {
    let Some(goal) = goals.get_goal(&trigger.goal_id) else {
        return;
    };
    if goal.status == GoalStatus::Paused || goal.status.is_terminal() {
        debug!(goal_id = %goal.id, status = %goal.status, "Trigger fire skipped");
        return;
    }
    if adversary.is_goal_active(&goal.id) {
        debug!(goal_id = %goal.id, "Trigger fire skipped: goal already being worked");
        return;
    }

    let next_fire_at = trigger
        .interval_ms
        .map(|ms| Utc::now() + chrono::Duration::milliseconds(ms as i64));
    if let Err(e) = goals.mark_trigger_fired(&trigger.id, next_fire_at).await {
        warn!(trigger_id = %trigger.id, error = %e, "Failed to record trigger fire");
    }

    bus.publish(BusEvent::TriggerFired {
        trigger_id: trigger.id.clone(),
        goal_id: goal.id.clone(),
        agent_id: trigger.agent_id.clone(),
    });
    adversary.wake(&goal.id);
}

//! Full component graph wired the way the binary wires it, with scripted
//! fakes in place of the oracle and the worker runtime.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tempfile::TempDir;
use tokio::sync::mpsc;

use workfarm::adversary::Adversary;
use workfarm::agent::{Agent, AgentManager};
use workfarm::bridge::Bridge;
use workfarm::bus::{Envelope, EventBus};
use workfarm::config::ConfigManager;
use workfarm::goal::{AgentGoal, GoalManager};
use workfarm::preference::PreferenceManager;
use workfarm::scheduler::TriggerScheduler;
use workfarm::session::SessionManager;
use workfarm::store::DataStore;
use workfarm::task::TaskManager;

use super::{FakeOracle, FakeRuntime};

pub struct Harness {
    pub data_dir: TempDir,
    pub store: Arc<DataStore>,
    pub bus: Arc<EventBus>,
    pub agents: Arc<AgentManager>,
    pub tasks: Arc<TaskManager>,
    pub goals: Arc<GoalManager>,
    pub preferences: Arc<PreferenceManager>,
    pub sessions: Arc<SessionManager>,
    pub bridge: Arc<Bridge>,
    pub adversary: Arc<Adversary>,
    pub scheduler: Arc<TriggerScheduler>,
    pub config: Arc<ConfigManager>,
    pub oracle: Arc<FakeOracle>,
    pub runtime: Arc<FakeRuntime>,
    pub events: Arc<Mutex<Vec<Envelope>>>,
}

impl Harness {
    pub async fn new() -> Self {
        let data_dir = TempDir::new().expect("temp data dir");
        let store = Arc::new(DataStore::new(data_dir.path()));
        store.init().await.expect("store init");

        let bus = Arc::new(EventBus::new());
        let config = Arc::new(ConfigManager::load(Arc::clone(&store)).await.unwrap());
        config.add_workspace_root(data_dir.path().to_path_buf()).await;

        let agents = Arc::new(
            AgentManager::load(Arc::clone(&store), Arc::clone(&bus))
                .await
                .unwrap(),
        );
        let tasks = Arc::new(
            TaskManager::load(Arc::clone(&store), Arc::clone(&bus))
                .await
                .unwrap(),
        );
        let goals = Arc::new(
            GoalManager::load(Arc::clone(&store), Arc::clone(&bus))
                .await
                .unwrap(),
        );
        let preferences = Arc::new(PreferenceManager::new(Arc::clone(&store), Arc::clone(&bus)));

        let (runtime_tx, runtime_rx) = mpsc::unbounded_channel();
        let runtime = Arc::new(FakeRuntime::new(runtime_tx));
        let runtime_dyn: Arc<dyn workfarm::runtime::WorkerRuntime> = Arc::clone(&runtime) as _;
        let sessions = Arc::new(SessionManager::new(runtime_dyn, Arc::clone(&bus)));
        sessions.start_event_pump(runtime_rx);

        let bridge = Bridge::new(
            Arc::clone(&agents),
            Arc::clone(&tasks),
            Arc::clone(&sessions),
            Arc::clone(&goals),
            Arc::clone(&preferences),
            Arc::clone(&bus),
        );
        bridge.initialize().await.unwrap();

        let oracle = Arc::new(FakeOracle::new());
        let oracle_dyn: Arc<dyn workfarm::oracle::Oracle> = Arc::clone(&oracle) as _;
        let adversary = Adversary::new(
            Arc::clone(&bridge),
            oracle_dyn,
            Arc::clone(&config),
            Arc::clone(&bus),
        );
        let scheduler =
            TriggerScheduler::new(Arc::clone(&goals), Arc::clone(&adversary), Arc::clone(&bus));

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        bus.subscribe_all(move |envelope| sink.lock().push(envelope.clone()));

        Self {
            data_dir,
            store,
            bus,
            agents,
            tasks,
            goals,
            preferences,
            sessions,
            bridge,
            adversary,
            scheduler,
            config,
            oracle,
            runtime,
            events,
        }
    }

    pub async fn hire(&self, name: &str) -> Agent {
        self.agents.hire(Some(name.to_string())).await.unwrap()
    }

    pub async fn goal_for(&self, agent: &Agent, description: &str) -> AgentGoal {
        self.goals
            .create_goal(AgentGoal::new(
                &agent.id,
                description,
                self.data_dir.path(),
            ))
            .await
    }

    pub fn captured<F>(&self, mut predicate: F) -> Vec<Envelope>
    where
        F: FnMut(&Envelope) -> bool,
    {
        self.events
            .lock()
            .iter()
            .filter(|e| predicate(e))
            .cloned()
            .collect()
    }
}

/// Poll until the condition holds, panicking after five seconds.
pub async fn wait_for<F>(what: &str, mut condition: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if condition() {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for: {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub mod adversary;
pub mod agent;
pub mod bridge;
pub mod bus;
pub mod cli;
pub mod config;
pub mod error;
pub mod goal;
pub mod oracle;
pub mod preference;
pub mod runtime;
pub mod scheduler;
pub mod session;
pub mod store;
pub mod task;
pub mod utils;

pub use adversary::Adversary;
pub use agent::{Agent, AgentManager, AgentState};
pub use bridge::Bridge;
pub use bus::{BusEvent, EventBus, Topic};
pub use config::{ConfigManager, FarmConfig};
pub use error::{FarmError, Result};
pub use goal::{AgentGoal, AgentPlan, GoalManager, GoalStatus, PlanStep, StepStatus};
pub use oracle::{CliOracle, Oracle, OracleReply};
pub use preference::{Confidence, PreferenceManager};
pub use runtime::{CliRuntime, SpawnSpec, WorkerRuntime, WorkerStreamEvent};
pub use scheduler::TriggerScheduler;
pub use session::{AgentSession, SessionManager, SessionStatus};
pub use store::DataStore;
pub use task::{Task, TaskManager, TaskStatus};

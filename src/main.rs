use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::mpsc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use workfarm::adversary::Adversary;
use workfarm::agent::AgentManager;
use workfarm::bridge::Bridge;
use workfarm::bus::EventBus;
use workfarm::cli::{Display, Repl};
use workfarm::config::ConfigManager;
use workfarm::error::Result;
use workfarm::goal::GoalManager;
use workfarm::oracle::{CliOracle, OracleConfig};
use workfarm::preference::PreferenceManager;
use workfarm::runtime::CliRuntime;
use workfarm::scheduler::TriggerScheduler;
use workfarm::session::SessionManager;
use workfarm::store::DataStore;
use workfarm::task::TaskManager;

#[derive(Parser)]
#[command(name = "workfarm", about = "Hire agents, give them goals, watch them work")]
struct Cli {
    /// Data directory (default: ~/.workfarm-data)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Worker command driving both workers and the oracle
    #[arg(long, default_value = "claude")]
    worker_cmd: String,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    init_logging(cli.verbose);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            Display::new().print_error(&e.to_string());
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("workfarm=debug")
    } else {
        EnvFilter::new("workfarm=warn")
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).without_time())
        .with(filter)
        .init();
}

async fn run(cli: Cli) -> Result<()> {
    let store = Arc::new(DataStore::new(
        cli.data_dir.unwrap_or_else(DataStore::default_root),
    ));
    store.init().await?;

    let bus = Arc::new(EventBus::new());
    let config = Arc::new(ConfigManager::load(Arc::clone(&store)).await?);

    let agents = Arc::new(AgentManager::load(Arc::clone(&store), Arc::clone(&bus)).await?);
    let tasks = Arc::new(TaskManager::load(Arc::clone(&store), Arc::clone(&bus)).await?);
    let goals = Arc::new(GoalManager::load(Arc::clone(&store), Arc::clone(&bus)).await?);
    let preferences = Arc::new(PreferenceManager::new(Arc::clone(&store), Arc::clone(&bus)));

    let (runtime_tx, runtime_rx) = mpsc::unbounded_channel();
    let runtime = Arc::new(CliRuntime::new(cli.worker_cmd.clone(), runtime_tx));
    let sessions = Arc::new(SessionManager::new(runtime, Arc::clone(&bus)));
    sessions.start_event_pump(runtime_rx);

    let bridge = Bridge::new(
        Arc::clone(&agents),
        Arc::clone(&tasks),
        Arc::clone(&sessions),
        Arc::clone(&goals),
        Arc::clone(&preferences),
        Arc::clone(&bus),
    );
    // The bridge subscribes to session_ended before the adversary: its
    // single-flight guard must release before evaluation runs.
    bridge.initialize().await?;

    let oracle = Arc::new(CliOracle::new(OracleConfig {
        command: cli.worker_cmd,
        working_dir: store.root().to_path_buf(),
        ..OracleConfig::default()
    }));
    let adversary = Adversary::new(
        Arc::clone(&bridge),
        oracle,
        Arc::clone(&config),
        Arc::clone(&bus),
    );

    let scheduler = TriggerScheduler::new(Arc::clone(&goals), Arc::clone(&adversary), Arc::clone(&bus));
    scheduler.start();

    Repl::new(bridge, adversary, scheduler, config, store, bus)
        .run()
        .await
}

//! Storage provisioner agent for silo.
//!
//! This binary runs one storage provisioner worker against a local
//! in-process model, using the state-backed accessor adapters. It is the
//! agent entry point while the remote accessor surface is still being
//! built: the wiring (scope resolution, provider registry, worker
//! lifetime) is exactly what a deployed agent uses.

use clap::Parser;
use silo::accessor::state::{
    StateEnviron, StateFilesystems, StateLifecycle, StateMachines, StateVolumes,
};
use silo::{
    EnvironConfig, PoolConfig, ProvisionerConfig, Registry, State, StorageProvisioner,
};

#[derive(Debug, Parser)]
#[command(
    name = "silo-provisioner",
    about = "Run a storage provisioner worker for an environment or machine"
)]
struct Cli {
    /// Machine whose storage to manage (for example `0` or `0/lxc/1`).
    /// The agent manages environment-scoped storage when absent.
    #[arg(long, value_name = "MACHINE", env = "SILO_MACHINE")]
    machine: Option<String>,
    /// Directory managed filesystem mounts live under.
    #[arg(long, value_name = "DIR")]
    storage_dir: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), String> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let mut config = ProvisionerConfig::load_from_sources().map_err(|err| err.to_string())?;
    if cli.machine.is_some() {
        config.machine = cli.machine;
    }
    if let Some(storage_dir) = cli.storage_dir {
        config.storage_dir = storage_dir;
    }
    config.validate().map_err(|err| err.to_string())?;
    let scope = config.scope().map_err(|err| err.to_string())?;

    let registry = Registry::global().clone();
    let state = State::new(
        registry.clone(),
        vec![
            PoolConfig::new("rootfs", "rootfs"),
            PoolConfig::new("loop", "loop"),
        ],
        EnvironConfig::new(config.environ.clone(), Default::default()),
    );

    let mut worker = StorageProvisioner::new(
        scope.clone(),
        config.storage_dir(),
        registry,
        Box::new(StateVolumes::new(state.clone(), scope.clone())),
        Box::new(StateFilesystems::new(state.clone(), scope)),
        Box::new(StateLifecycle::new(state.clone())),
        Box::new(StateEnviron::new(state.clone())),
        Box::new(StateMachines::new(state)),
    );

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.map_err(|err| err.to_string())?;
            worker.kill();
        }
        result = worker.wait() => return result.map_err(|err| err.to_string()),
    }
    worker.wait().await.map_err(|err| err.to_string())
}

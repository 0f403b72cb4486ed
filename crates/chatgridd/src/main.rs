use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use chatgrid_broker::MemoryBroker;
use chatgrid_core::ClusterConfig;
use chatgrid_state::ClusterStore;
use chatgridd::client::LoopbackClient;
use chatgridd::supervisor::{ClientFactory, Supervisor};

#[derive(Parser)]
#[command(name = "chatgridd", about = "ChatGrid supervisor daemon")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a supervisor replica until interrupted.
    Run {
        /// Path to a TOML config file. Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Path of the cluster state database.
        #[arg(long, default_value = "chatgrid.redb")]
        db: PathBuf,
    },
    /// Print the default configuration as TOML.
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match Cli::parse().command {
        Commands::Run { config, db } => run(config, db).await,
        Commands::Config => {
            print!("{}", ClusterConfig::default().to_toml_string()?);
            Ok(())
        }
    }
}

async fn run(config_path: Option<PathBuf>, db: PathBuf) -> anyhow::Result<()> {
    let config = match config_path {
        Some(path) => Arc::new(ClusterConfig::from_file(&path)?),
        None => Arc::new(ClusterConfig::default()),
    };

    let store = ClusterStore::open(&db)?;
    let broker = MemoryBroker::new();
    let factory: ClientFactory<LoopbackClient> = Arc::new(LoopbackClient::new);

    let supervisor = Supervisor::spawn(config, store, broker, factory).await?;
    info!(supervisor = %supervisor.id(), "running, press ctrl-c to stop");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = shutdown_tx.send(true);
        }
    });

    supervisor.run(shutdown_rx).await;
    Ok(())
}

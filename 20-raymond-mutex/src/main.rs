use anyhow::Result;
use clap::Parser;
use tokio::io::BufReader;
use tracing::{info, warn};

use raymond_mutex::cli::Cli;
use raymond_mutex::cluster::Cluster;
use raymond_mutex::console::Console;
use raymond_mutex::protocol::USAGE;

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = cli.cluster_config();
    info!(?config, "starting cluster");

    let mut console = Console::new(Cluster::new(config), tokio::io::stdout());
    if let Some(script) = &cli.script {
        console.source(script).await?;
    } else {
        println!("{USAGE}");
    }

    let stdin = BufReader::new(tokio::io::stdin());
    tokio::select! {
        result = console.run(stdin) => result?,
        ctrl_c = tokio::signal::ctrl_c() => {
            if let Err(error) = ctrl_c {
                warn!(?error, "ctrl-c handler failed");
            }
        }
    }

    let (cluster, _) = console.into_parts();
    cluster.shutdown().await
}

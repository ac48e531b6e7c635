//! hostpool - provision a pool, check every host answers, destroy it.
//!
//! Configuration comes from `HOSTPOOL_*` environment variables.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hostpool_harness::{logging, pool_summary, HarnessConfig, HostPool, OsFamily, Topology};
use hostpool_infra::RestInfraClient;
use hostpool_remote::{OpenSshConnector, RunOptions};
use tracing::{error, info};

/// Ephemeral host pools for integration tests.
#[derive(Debug, Parser)]
#[command(name = "hostpool")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create a pool, run a command on every host and destroy the pool.
    Smoke {
        /// Pool shape: single, three-node or full.
        #[arg(long, default_value = "single")]
        topology: String,

        /// Correlation id for the run; prefixes the infra namespace.
        #[arg(long, env = "HOSTPOOL_RUN_ID", default_value = "smoke")]
        run_id: String,

        /// SSH connect timeout in seconds.
        #[arg(long, default_value_t = 10)]
        connect_timeout: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = HarnessConfig::from_env()?;
    logging::init(config.log_json)?;

    match cli.command {
        Commands::Smoke {
            topology,
            run_id,
            connect_timeout,
        } => smoke(config, &topology, &run_id, Duration::from_secs(connect_timeout)).await,
    }
}

async fn smoke(config: HarnessConfig, topology: &str, run_id: &str, connect_timeout: Duration) -> Result<()> {
    let topology: Topology = topology.parse()?;
    let infra = Arc::new(RestInfraClient::new(&config.infra).context("creating infra client")?);
    let connector =
        Arc::new(OpenSshConnector::new(connect_timeout).context("creating ssh control directory")?);

    let mut pool = HostPool::new(run_id, &topology, &config, infra, connector)?;
    pool.start().await?;

    let mut passed = true;
    for host in pool.hosts() {
        let command = match host.spec().os {
            OsFamily::Linux => "uname -a",
            OsFamily::Windows => "hostname",
        };
        match host.run_command(command, &RunOptions::new()).await {
            Ok(output) => info!(host = %host.name(), output = %output.stdout.trim(), "Host answered"),
            Err(e) => {
                error!(host = %host.name(), error = %e, "Host did not answer");
                passed = false;
            }
        }
    }

    info!("\n{}", pool_summary(&pool));

    let report = pool.destroy(passed).await?;
    info!(report = ?report, passed, "Smoke run finished");

    if !passed {
        anyhow::bail!("smoke run failed");
    }
    Ok(())
}

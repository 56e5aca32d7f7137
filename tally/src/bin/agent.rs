use std::path::Path;
use std::time::Duration;

use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use tally::agent::{self, Agent};
use tally::config::{self, AgentConfig};
use tokio::{runtime::Builder, signal, task::JoinSet};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, util::SubscriberInitExt};

#[derive(thiserror::Error, Debug)]
enum Error {
    #[error("Failed to load configuration: {0}")]
    Config(#[from] config::Error),
    #[error("Agent returned an error: {0}")]
    Agent(#[from] agent::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

fn default_config_path() -> String {
    "/etc/tally/agent.yaml".to_string()
}

#[derive(Parser)]
#[clap(version, about, long_about = None)]
struct Args {
    /// path on disk to the configuration file
    #[clap(long, default_value_t = default_config_path())]
    config_path: String,
}

async fn inner_main(config: AgentConfig) -> Result<(), Error> {
    let (shutdown_watcher, shutdown_broadcast) = tally_signal::signal();

    if let Some(addr) = config.telemetry_address {
        let builder = PrometheusBuilder::new().with_http_listener(addr);
        tokio::spawn(async move {
            builder
                .install()
                .expect("failed to install prometheus recorder");
        });
    }

    let mut agent_joinset = JoinSet::new();
    agent_joinset.spawn(Agent::new(config).run(shutdown_watcher));

    let res = tokio::select! {
        _ = signal::ctrl_c() => {
            info!("received ctrl-c");
            Ok(())
        }
        Some(res) = agent_joinset.join_next() => {
            match res {
                Ok(Ok(())) => Ok(()),
                Ok(Err(err)) => {
                    error!("Agent shut down unexpectedly: {err}");
                    Err(Error::Agent(err))
                }
                Err(err) => {
                    error!("Could not join the spawned agent task: {err}");
                    Ok(())
                }
            }
        }
    };

    shutdown_broadcast.signal_and_wait().await;
    res
}

fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_ansi(false)
        .finish()
        .init();

    let version = env!("CARGO_PKG_VERSION");
    info!("Starting tally-agent {version}.");

    let args = Args::parse();
    let config: AgentConfig = config::load(Path::new(&args.config_path))?;

    let runtime = Builder::new_multi_thread()
        .enable_io()
        .enable_time()
        .build()?;
    let res = runtime.block_on(inner_main(config));
    runtime.shutdown_timeout(Duration::from_secs(10));
    info!("Bye. :)");
    res
}

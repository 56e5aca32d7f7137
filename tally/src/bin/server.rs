use std::path::Path;
use std::time::Duration;

use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use tally::config::{self, ServerConfig};
use tally::server::{self, Server};
use tokio::{runtime::Builder, signal, task::JoinSet};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, util::SubscriberInitExt};

#[derive(thiserror::Error, Debug)]
enum Error {
    #[error("Failed to load configuration: {0}")]
    Config(#[from] config::Error),
    #[error("Server returned an error: {0}")]
    Server(#[from] server::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

fn default_config_path() -> String {
    "/etc/tally/server.yaml".to_string()
}

#[derive(Parser)]
#[clap(version, about, long_about = None)]
struct Args {
    /// path on disk to the configuration file
    #[clap(long, default_value_t = default_config_path())]
    config_path: String,
}

async fn inner_main(config: ServerConfig) -> Result<(), Error> {
    let (shutdown_watcher, shutdown_broadcast) = tally_signal::signal();

    if let Some(addr) = config.telemetry_address {
        let builder = PrometheusBuilder::new().with_http_listener(addr);
        tokio::spawn(async move {
            builder
                .install()
                .expect("failed to install prometheus recorder");
        });
    }

    let mut server_joinset = JoinSet::new();
    server_joinset.spawn(Server::new(config).run(shutdown_watcher));

    let res = tokio::select! {
        _ = signal::ctrl_c() => {
            info!("received ctrl-c");
            Ok(())
        }
        Some(res) = server_joinset.join_next() => {
            match res {
                Ok(Ok(())) => Ok(()),
                Ok(Err(err)) => {
                    error!("Server shut down unexpectedly: {err}");
                    Err(Error::Server(err))
                }
                Err(err) => {
                    error!("Could not join the spawned server task: {err}");
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
    info!("Starting tally-server {version}.");

    let args = Args::parse();
    let config: ServerConfig = config::load(Path::new(&args.config_path))?;

    let runtime = Builder::new_multi_thread()
        .enable_io()
        .enable_time()
        .build()?;
    let res = runtime.block_on(inner_main(config));
    runtime.shutdown_timeout(Duration::from_secs(10));
    info!("Bye. :)");
    res
}

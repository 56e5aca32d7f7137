//! Host telemetry collection agent
//!
//! Two independent clocks drive the agent: a poll interval that samples the
//! host and accumulates readings in a local store, and a report interval
//! that ships the accumulation through the delivery pipeline. Gauges
//! overwrite on every poll. Counters accumulate between reports; under
//! per-item delivery a fully delivered report resets them so the next tick
//! ships pure deltas, under bulk reload the accumulation is the durable
//! running total and is never reset.

pub mod pipeline;
pub(crate) mod retry;
pub mod sampler;

use std::time::Duration;

use rustc_hash::FxHashMap;
use tally_signal::Watcher;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::agent::pipeline::Pipeline;
use crate::config::AgentConfig;
use crate::storage::{MemoryStore, Repository};

#[derive(thiserror::Error, Debug)]
/// Errors produced by [`Agent`]
pub enum Error {
    /// Key material could not be read
    #[error("unreadable key material: {0}")]
    Io(#[from] std::io::Error),
    /// The delivery pipeline could not be built
    #[error(transparent)]
    Pipeline(#[from] pipeline::Error),
    /// The local accumulation failed, stale state cannot be reported safely
    #[error("local metric state: {0}")]
    Storage(#[from] crate::storage::Error),
}

#[derive(Debug)]
/// The collection agent.
pub struct Agent {
    config: AgentConfig,
}

impl Agent {
    /// Create an agent from configuration. Nothing runs until [`run`].
    ///
    /// [`run`]: Agent::run
    #[must_use]
    pub fn new(config: AgentConfig) -> Self {
        Self { config }
    }

    /// Run the poll and report loops until the shutdown signal fires.
    ///
    /// # Errors
    ///
    /// Function will error if key material or the configured endpoint is
    /// unusable at startup, or if the local accumulation becomes unusable
    /// while running.
    pub async fn run(self, shutdown: Watcher) -> Result<(), Error> {
        let config = self.config;

        let public_key_pem = match &config.crypto_key_path {
            Some(path) => Some(tokio::fs::read_to_string(path).await?),
            None => None,
        };

        let store = MemoryStore::new();
        let pipeline = Pipeline::new(&config, public_key_pem.as_deref(), shutdown.clone())?;
        // Per-item delivery adds deltas server-side; any other granularity
        // replaces the server population with the accumulation wholesale.
        let additive_delivery = config.batch_size == 1;

        let target = config
            .grpc_address
            .clone()
            .unwrap_or_else(|| config.server_address.clone());
        info!(
            "Starting agent against {target}, polling every {poll}s, reporting every {report}s",
            poll = config.poll_interval_seconds,
            report = config.report_interval_seconds,
        );

        let mut poll = interval(Duration::from_secs(config.poll_interval_seconds.max(1)));
        let mut report = interval(Duration::from_secs(config.report_interval_seconds.max(1)));

        let shutdown_fut = shutdown.recv();
        tokio::pin!(shutdown_fut);
        loop {
            tokio::select! {
                () = &mut shutdown_fut => {
                    info!("Shutdown signal received, stopping agent.");
                    return Ok(());
                }
                _ = poll.tick() => {
                    poll_once(&store).await?;
                }
                _ = report.tick() => {
                    let summary = pipeline.report(&store).await;
                    if summary.failed > 0 {
                        warn!(
                            "report tick partially delivered: {ok} ok, {failed} failed",
                            ok = summary.delivered,
                            failed = summary.failed,
                        );
                    }
                    if additive_delivery && summary.delivered > 0 && summary.fully_delivered() {
                        store.replace_counters(FxHashMap::default()).await?;
                        debug!("deltas delivered, local counter accumulation reset");
                    }
                }
            }
        }
    }
}

/// Apply one sample to the local accumulation: gauges overwrite, the poll
/// counter advances by one. A failed sample skips the tick without touching
/// prior readings.
async fn poll_once(store: &MemoryStore) -> Result<(), Error> {
    let sample = match sampler::sample().await {
        Ok(sample) => sample,
        Err(err) => {
            warn!("sample failed, skipping poll tick: {err}");
            return Ok(());
        }
    };
    for (name, value) in &sample.gauges {
        store.update_gauge(name, *value).await?;
    }
    store.update_counter(sampler::POLL_COUNT, 1).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::Arc;

    use tally_metric::Kind;
    use tokio::task::JoinHandle;

    use super::*;
    use crate::server::guard::Guard;
    use crate::server::http::{self, Handler};
    use crate::service::Ingest;
    use crate::storage::Storage;

    #[tokio::test]
    async fn poll_applies_sample_to_local_accumulation() {
        let store = MemoryStore::new();
        poll_once(&store).await.expect("poll");
        poll_once(&store).await.expect("poll");

        let polls = store.counter(sampler::POLL_COUNT).await.expect("counter");
        assert_eq!(polls, Some(2));
        let gauges = store.all_gauges().await.expect("gauges");
        assert!(gauges.contains_key(sampler::RANDOM_VALUE));
        assert!(gauges.len() > 20, "expected a full sample, got {gauges:?}");
    }

    /// Bind an aggregation server on an ephemeral loopback port.
    async fn serve() -> (
        SocketAddr,
        Arc<Ingest>,
        tally_signal::Broadcaster,
        JoinHandle<()>,
    ) {
        let service = Arc::new(Ingest::new(Storage::Memory(MemoryStore::new()), false));
        let guard = Guard::new(None, None, None).expect("guard without checks");
        let handler = Handler::new(guard, Arc::clone(&service), &[]);
        let (watcher, broadcaster) = tally_signal::signal();
        let (bound, task) = http::run_server(
            "127.0.0.1:0".parse().expect("loopback"),
            4,
            handler,
            watcher,
        )
        .await
        .expect("bind test server");
        (bound, service, broadcaster, task)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn bulk_reports_mirror_the_accumulation() {
        let (bound, service, stop, task) = serve().await;

        let store = MemoryStore::new();
        store
            .update_gauge("alloc_bytes", 6_649_272.0)
            .await
            .expect("gauge write");
        store.update_counter(sampler::POLL_COUNT, 1).await.expect("counter write");
        store.update_counter(sampler::POLL_COUNT, 1).await.expect("counter write");

        let config = AgentConfig {
            server_address: bound.to_string(),
            ..AgentConfig::default()
        };
        let (watcher, _stop) = tally_signal::signal();
        let pipeline = Pipeline::new(&config, None, watcher).expect("pipeline");

        let first = pipeline.report(&store).await;
        assert_eq!(first.delivered, 1);
        assert!(first.fully_delivered());

        // Bulk reload never resets the local accumulation; the next tick
        // replaces the server population with the new running total.
        store.update_counter(sampler::POLL_COUNT, 1).await.expect("counter write");
        let second = pipeline.report(&store).await;
        assert!(second.fully_delivered());

        let polls = service
            .typed_value(Kind::Counter, sampler::POLL_COUNT)
            .await
            .expect("counter readable");
        assert_eq!(polls.counter_delta().expect("total"), 3);
        let alloc = service
            .typed_value(Kind::Gauge, "alloc_bytes")
            .await
            .expect("gauge readable");
        assert!((alloc.gauge_value().expect("value") - 6_649_272.0).abs() < f64::EPSILON);

        stop.signal();
        task.await.expect("server task");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn per_item_delivery_adds_deltas_server_side() {
        let (bound, service, stop, task) = serve().await;

        let store = MemoryStore::new();
        store
            .update_gauge("Alloc", 6_649_272.0)
            .await
            .expect("gauge write");
        store.update_counter("PollCount", 1).await.expect("counter write");

        let config = AgentConfig {
            server_address: bound.to_string(),
            batch_size: 1,
            ..AgentConfig::default()
        };
        let (watcher, _stop) = tally_signal::signal();
        let pipeline = Pipeline::new(&config, None, watcher).expect("pipeline");

        let first = pipeline.report(&store).await;
        assert_eq!(first.delivered, 2);
        assert!(first.fully_delivered());

        // The delivered deltas are reset locally; only what arrives between
        // ticks ships next time, and the server keeps the running sum.
        store
            .replace_counters(FxHashMap::default())
            .await
            .expect("reset");
        store.update_counter("PollCount", 1).await.expect("counter write");
        let second = pipeline.report(&store).await;
        assert!(second.fully_delivered());

        let groups = service.all_rendered().await.expect("rendered");
        assert_eq!(groups["gauge"]["Alloc"], "6649272");
        assert_eq!(groups["counter"]["PollCount"], "2");

        stop.signal();
        task.await.expect("server task");
    }
}

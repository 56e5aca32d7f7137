//! Delivery of collected readings to the aggregation server.
//!
//! One pipeline serves both granularities: a batch size of one ships each
//! reading in its own additive update, any other value ships the whole
//! snapshot as one bulk reload. Bulk reload replaces the server population
//! atomically, so a snapshot is never split across requests. Requests fan
//! out through a bounded sender pool and each request passes through the
//! security envelope and the retry schedule before its outcome is counted.
//!
//! ## Metrics
//!
//! `requests_sent`: Total number of requests sent, retries included
//! `request_ok`: Requests the server accepted
//! `request_failure`: Loads abandoned after their terminal error
//! `retries_attempted`: Re-sends triggered by transient connectivity loss

use std::net::IpAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, combinators::BoxBody};
use hyper::header::{CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE};
use hyper::{Method, Request, StatusCode};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use metrics::counter;
use tally_metric::Metric;
use tally_metric::proto::metrics_client::MetricsClient;
use tally_metric::proto::{MetricBatchRequest, MetricRequest};
use tally_seal::Sealer;
use tally_signal::Watcher;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tonic::metadata::MetadataValue;
use tonic::transport::{Channel, Endpoint};
use tracing::{debug, error, warn};

use crate::agent::retry::{self, RealClock};
use crate::codec;
use crate::config::AgentConfig;
use crate::server::grpc::TAG_METADATA;
use crate::server::http::{REAL_IP_HEADER, TAG_HEADER};
use crate::storage::MemoryStore;

#[derive(thiserror::Error, Debug)]
/// Errors produced by [`Pipeline`] construction
pub enum Error {
    /// Wrapper for [`tally_seal::Error`]
    #[error(transparent)]
    Seal(#[from] tally_seal::Error),
    /// The configured server address does not form a valid endpoint
    #[error("bad server endpoint: {0}")]
    Endpoint(#[from] tonic::transport::Error),
}

/// Per-request failures, classified by [`retry::is_transient`] for another
/// attempt or surfaced as the load's terminal error.
#[derive(thiserror::Error, Debug)]
enum SendError {
    /// Wrapper for [`hyper_util::client::legacy::Error`]
    #[error("client error: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),
    /// Wrapper for [`hyper::Error`]
    #[error("Hyper error: {0}")]
    Body(#[from] hyper::Error),
    /// Wrapper for [`hyper::http::Error`]
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::http::Error),
    /// Wrapper for [`tonic::Status`]
    #[error("grpc error: {0}")]
    Grpc(#[from] tonic::Status),
    /// Wrapper for [`tally_seal::Error`]
    #[error(transparent)]
    Seal(#[from] tally_seal::Error),
    /// Wrapper for [`serde_json::Error`]
    #[error("payload serialization: {0}")]
    Serialize(#[from] serde_json::Error),
    /// Wrapper for [`std::io::Error`]
    #[error("Io error: {0}")]
    Io(#[from] std::io::Error),
    /// Metadata values must be visible ascii
    #[error("metadata encoding: {0}")]
    Metadata(#[from] tonic::metadata::errors::InvalidMetadataValue),
    /// The server answered with a non-success status
    #[error("rejected by server: {status}: {body}")]
    Rejected {
        /// The response status.
        status: StatusCode,
        /// The response body text.
        body: String,
    },
}

/// One unit of outbound work, per the batch-size policy.
#[derive(Debug, Clone, PartialEq)]
enum Load {
    Single(Metric),
    Batch(Vec<Metric>),
}

/// Project the snapshot into wire loads. Only a batch size of exactly one
/// selects per-item delivery; a bulk reload is all-or-nothing server-side
/// and therefore never split into partial batches.
fn shape(batch_size: usize, metrics: Vec<Metric>) -> Vec<Load> {
    if batch_size == 1 {
        metrics.into_iter().map(Load::Single).collect()
    } else {
        vec![Load::Batch(metrics)]
    }
}

/// Discover which local address routes toward the server, for the
/// `x-real-ip` marker. Connecting a UDP socket only selects a route, no
/// packet leaves the host.
fn local_source_address(server: &str) -> Option<IpAddr> {
    let socket = std::net::UdpSocket::bind(("0.0.0.0", 0)).ok()?;
    socket.connect(server).ok()?;
    let local = socket.local_addr().ok()?;
    Some(local.ip())
}

/// How one report tick went, in terms of loads rather than requests: a
/// load that exhausted its retry schedule counts once.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TickSummary {
    /// Loads the server accepted.
    pub(crate) delivered: usize,
    /// Loads abandoned on a terminal error or never dispatched.
    pub(crate) failed: usize,
}

impl TickSummary {
    /// True when nothing in the tick was lost, the signal for the agent to
    /// reset its local counters.
    pub(crate) fn fully_delivered(&self) -> bool {
        self.failed == 0
    }
}

/// The transport a [`Pipeline`] speaks.
#[derive(Debug, Clone)]
enum Transport {
    /// POSTs against the server's HTTP surface.
    Http {
        client: Client<HttpConnector, BoxBody<Bytes, hyper::Error>>,
        base: String,
    },
    /// The binary RPC surface.
    Grpc { client: MetricsClient<Channel> },
}

/// Everything one sender task needs, cloned per dispatched load.
#[derive(Debug, Clone)]
struct Sender {
    transport: Transport,
    sealer: Sealer,
    encrypting: bool,
    source_address: Option<IpAddr>,
    labels: Vec<(String, String)>,
}

/// Agent-side delivery pipeline with bounded concurrency.
#[derive(Debug)]
pub(crate) struct Pipeline {
    sender: Sender,
    batch_size: usize,
    permits: Arc<Semaphore>,
    labels: Vec<(String, String)>,
    shutdown: Watcher,
}

impl Pipeline {
    /// Create a pipeline from the agent configuration. `public_key_pem` is
    /// the already-read contents of the configured key file, if any.
    ///
    /// # Errors
    ///
    /// Function will error if key material does not parse or the configured
    /// gRPC address does not form a valid endpoint.
    pub(crate) fn new(
        config: &AgentConfig,
        public_key_pem: Option<&str>,
        shutdown: Watcher,
    ) -> Result<Self, Error> {
        let sealer = Sealer::new(config.secret_key.as_deref(), public_key_pem)?;
        let rate_limit = config.rate_limit.max(1);

        let (transport, route_target) = match &config.grpc_address {
            Some(addr) => {
                let endpoint = Endpoint::from_shared(format!("http://{addr}"))?;
                let transport = Transport::Grpc {
                    client: MetricsClient::new(endpoint.connect_lazy()),
                };
                (transport, addr.as_str())
            }
            None => {
                let client = Client::builder(TokioExecutor::new())
                    .pool_max_idle_per_host(rate_limit)
                    .retry_canceled_requests(false)
                    .build_http();
                let transport = Transport::Http {
                    client,
                    base: format!("http://{addr}", addr = config.server_address),
                };
                (transport, config.server_address.as_str())
            }
        };

        let labels = vec![("component".to_string(), "agent".to_string())];
        let sender = Sender {
            transport,
            sealer,
            encrypting: public_key_pem.is_some(),
            source_address: local_source_address(route_target),
            labels: labels.clone(),
        };

        Ok(Self {
            sender,
            batch_size: config.batch_size,
            permits: Arc::new(Semaphore::new(rate_limit)),
            labels,
            shutdown,
        })
    }

    /// Ship everything `store` currently holds and wait for every dispatched
    /// load to finish, success or terminal failure. Per-load delivery
    /// failures are counted in the returned summary, not escalated.
    pub(crate) async fn report(&self, store: &MemoryStore) -> TickSummary {
        let snapshot = store.snapshot();
        if snapshot.is_empty() {
            debug!("nothing collected yet, skipping report tick");
            return TickSummary::default();
        }

        let mut metrics = snapshot.metrics();
        // Stable order keeps chunk boundaries and logs deterministic.
        metrics.sort_by(|a, b| a.id.cmp(&b.id));
        let loads = shape(self.batch_size, metrics);
        let total = loads.len();

        let mut join_set = JoinSet::new();
        let mut dispatched = 0_usize;
        for load in loads {
            if self.shutdown.is_signaled() {
                warn!(
                    "shutdown signaled, halting dispatch with {remaining} loads undelivered",
                    remaining = total - dispatched
                );
                break;
            }
            let permit = Arc::clone(&self.permits)
                .acquire_owned()
                .await
                .expect("sender pool semaphore closed");
            let sender = self.sender.clone();
            join_set.spawn(async move {
                let result = sender.deliver(&load).await;
                drop(permit);
                result
            });
            dispatched += 1;
        }

        let mut summary = TickSummary::default();
        while let Some(result) = join_set.join_next().await {
            match result {
                Ok(Ok(())) => summary.delivered += 1,
                Ok(Err(err)) => {
                    summary.failed += 1;
                    counter!("request_failure", &self.labels).increment(1);
                    error!("delivery failed: {err}");
                }
                Err(join_err) => {
                    summary.failed += 1;
                    counter!("request_failure", &self.labels).increment(1);
                    error!("sender task panicked: {join_err}");
                }
            }
        }
        summary.failed += total - dispatched;
        summary
    }
}

impl Sender {
    /// Drive one load through the retry schedule.
    async fn deliver(&self, load: &Load) -> Result<(), SendError> {
        retry::send_with_retries(&RealClock, || self.attempt(load)).await
    }

    async fn attempt(&self, load: &Load) -> Result<(), SendError> {
        counter!("requests_sent", &self.labels).increment(1);
        match &self.transport {
            Transport::Http { client, base } => self.attempt_http(client, base, load).await,
            Transport::Grpc { client } => self.attempt_grpc(client, load).await,
        }
    }

    async fn attempt_http(
        &self,
        client: &Client<HttpConnector, BoxBody<Bytes, hyper::Error>>,
        base: &str,
        load: &Load,
    ) -> Result<(), SendError> {
        let (path, plaintext) = match load {
            Load::Single(metric) => ("/update", serde_json::to_vec(metric)?),
            Load::Batch(metrics) => ("/updates", serde_json::to_vec(metrics)?),
        };
        let sealed = self.sealer.seal(&plaintext)?;

        let mut builder = Request::builder()
            .method(Method::POST)
            .uri(format!("{base}{path}"))
            .header(CONTENT_TYPE, "application/json");
        if let Some(tag) = &sealed.tag {
            builder = builder.header(TAG_HEADER, tag);
        }
        if let Some(source) = self.source_address {
            builder = builder.header(REAL_IP_HEADER, source.to_string());
        }
        // Ciphertext does not compress, plaintext does.
        let body = if self.encrypting {
            sealed.body
        } else {
            builder = builder.header(CONTENT_ENCODING, "gzip");
            codec::gzip(&sealed.body)?
        };
        let request = builder
            .header(CONTENT_LENGTH, body.len())
            .body(crate::full(body))?;

        let response = client.request(request).await?;
        let status = response.status();
        if status.is_success() {
            counter!("request_ok", &self.labels).increment(1);
            return Ok(());
        }
        let body = response.into_body().collect().await?.to_bytes();
        Err(SendError::Rejected {
            status,
            body: String::from_utf8_lossy(&body).into_owned(),
        })
    }

    async fn attempt_grpc(
        &self,
        client: &MetricsClient<Channel>,
        load: &Load,
    ) -> Result<(), SendError> {
        let mut client = client.clone();
        match load {
            Load::Single(metric) => {
                let plaintext = serde_json::to_vec(metric)?;
                let sealed = self.sealer.seal(&plaintext)?;
                let mut request = tonic::Request::new(MetricRequest {
                    metric: Some(metric.into()),
                    raw_body: self.raw_body(&sealed),
                });
                self.attach_metadata(&mut request, sealed.tag.as_deref())?;
                client.add_metric(request).await?;
            }
            Load::Batch(metrics) => {
                let plaintext = serde_json::to_vec(metrics)?;
                let sealed = self.sealer.seal(&plaintext)?;
                let mut request = tonic::Request::new(MetricBatchRequest {
                    metrics: metrics.iter().map(Into::into).collect(),
                    raw_body: self.raw_body(&sealed),
                });
                self.attach_metadata(&mut request, sealed.tag.as_deref())?;
                client.add_metric_batch(request).await?;
            }
        }
        counter!("request_ok", &self.labels).increment(1);
        Ok(())
    }

    /// The byte-exact enveloped payload, carried in parallel with the typed
    /// fields whenever either envelope layer is active. The typed fields
    /// alone cannot reproduce what the tag was computed over.
    fn raw_body(&self, sealed: &tally_seal::Sealed) -> Vec<u8> {
        if self.encrypting || sealed.tag.is_some() {
            sealed.body.clone()
        } else {
            Vec::new()
        }
    }

    fn attach_metadata<T>(
        &self,
        request: &mut tonic::Request<T>,
        tag: Option<&str>,
    ) -> Result<(), SendError> {
        if let Some(source) = self.source_address {
            request
                .metadata_mut()
                .insert(REAL_IP_HEADER, MetadataValue::try_from(source.to_string())?);
        }
        if let Some(tag) = tag {
            request
                .metadata_mut()
                .insert(TAG_METADATA, MetadataValue::try_from(tag)?);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn readings(n: usize) -> Vec<Metric> {
        (0..n).map(|i| Metric::counter(format!("c{i}"), 1)).collect()
    }

    #[test]
    fn batch_size_one_ships_each_reading_alone() {
        let loads = shape(1, readings(3));
        assert_eq!(loads.len(), 3);
        assert!(loads.iter().all(|l| matches!(l, Load::Single(_))));
    }

    #[test]
    fn any_other_batch_size_ships_one_bulk_reload() {
        for batch_size in [0, 2, 100] {
            let loads = shape(batch_size, readings(5));
            assert_eq!(loads.len(), 1);
            assert!(matches!(&loads[0], Load::Batch(metrics) if metrics.len() == 5));
        }
    }

    #[test]
    fn source_address_discovery_picks_a_route() {
        // Loopback is always routable, even with no network up.
        let source = local_source_address("127.0.0.1:9").expect("loopback route");
        assert!(source.is_loopback());
    }
}

//! gRPC implementation of the ingest surface
//!
//! Same admission pipeline as HTTP: source gate from request metadata, then
//! the envelope. Requests carry the serialized payload in `raw_body` when an
//! envelope is in force, since the typed fields alone cannot reproduce the
//! byte-exact payload the integrity tag was computed over. Without an
//! envelope the typed fields are used directly.

use std::net::SocketAddr;
use std::sync::Arc;

use metrics::counter;
use tally_metric::proto::{
    MetricBatchRequest, MetricBatchResponse, MetricRequest, MetricResponse, PingRequest,
    PingResponse,
    metrics_server::{Metrics, MetricsServer},
};
use tally_metric::{Metric, proto};
use tally_signal::Watcher;
use tokio::task::JoinHandle;
use tonic::{Request as TonicRequest, Response as TonicResponse, Status};
use tracing::{error, info, warn};

use crate::server::guard::{self, Guard};
use crate::server::http::REAL_IP_HEADER;
use crate::service::{self, Ingest};

/// Metadata key carrying the hex integrity tag. Metadata keys must be
/// lowercase, unlike HTTP headers.
pub(crate) const TAG_METADATA: &str = "hashsha256";

/// Run the gRPC ingest server until shutdown.
pub(crate) fn run_server(
    addr: SocketAddr,
    concurrency_limit: usize,
    guard: Guard,
    service: Arc<Ingest>,
    base_labels: &[(String, String)],
    shutdown: Watcher,
) -> JoinHandle<()> {
    let mut labels = Vec::with_capacity(base_labels.len() + 1);
    labels.push(("protocol".to_string(), "grpc".to_string()));
    labels.extend_from_slice(base_labels);

    let ingest = IngestGrpc {
        guard,
        service,
        labels,
    };

    info!("Starting gRPC ingest service on {addr}");
    let router = tonic::transport::Server::builder()
        .concurrency_limit_per_connection(concurrency_limit)
        .add_service(MetricsServer::new(ingest));

    tokio::spawn(async move {
        if let Err(e) = router.serve_with_shutdown(addr, shutdown.recv()).await {
            error!("gRPC server error: {e}");
        }
    })
}

/// Metrics service implementation
#[derive(Debug)]
struct IngestGrpc {
    guard: Guard,
    service: Arc<Ingest>,
    labels: Vec<(String, String)>,
}

impl IngestGrpc {
    /// Source gate from request metadata, before the payload is examined.
    fn admit(&self, metadata: &tonic::metadata::MetadataMap) -> Result<(), Status> {
        let declared = metadata
            .get(REAL_IP_HEADER)
            .and_then(|v| v.to_str().ok());
        self.guard.check_source(declared).map_err(|err| {
            counter!("requests_rejected", &self.labels).increment(1);
            warn!("rejected request from untrusted source: {err}");
            Status::permission_denied("source address not permitted")
        })
    }

    /// Open a raw payload against the envelope using the tag from request
    /// metadata.
    fn open(&self, metadata: &tonic::metadata::MetadataMap, raw: &[u8]) -> Result<Vec<u8>, Status> {
        let tag = metadata.get(TAG_METADATA).and_then(|v| v.to_str().ok());
        self.guard.open(raw, tag).map_err(|err| {
            counter!("requests_rejected", &self.labels).increment(1);
            warn!("rejected request with bad envelope: {err}");
            status_for_guard(&err)
        })
    }
}

fn status_for_guard(err: &guard::Error) -> Status {
    match err {
        guard::Error::Seal(tally_seal::Error::TagMissing | tally_seal::Error::TagMismatch) => {
            Status::unauthenticated(err.to_string())
        }
        _ => Status::invalid_argument(err.to_string()),
    }
}

fn status_for_service(err: &service::Error) -> Status {
    match err {
        service::Error::Validation(_) => Status::invalid_argument(err.to_string()),
        service::Error::NotFound { .. } => Status::not_found(err.to_string()),
        service::Error::Storage(_) => {
            // Backend detail stays in the log, not the status message.
            error!("storage failure: {err}");
            Status::internal("internal error")
        }
    }
}

#[tonic::async_trait]
impl Metrics for IngestGrpc {
    async fn add_metric(
        &self,
        request: TonicRequest<MetricRequest>,
    ) -> Result<TonicResponse<MetricResponse>, Status> {
        counter!("requests_received", &self.labels).increment(1);
        self.admit(request.metadata())?;

        let metric: Metric = {
            let raw = &request.get_ref().raw_body;
            if raw.is_empty() {
                let typed = request
                    .get_ref()
                    .metric
                    .clone()
                    .ok_or_else(|| Status::invalid_argument("metric field required"))?;
                Metric::try_from(typed).map_err(|err| Status::invalid_argument(err.to_string()))?
            } else {
                counter!("bytes_received", &self.labels).increment(raw.len() as u64);
                let plain = self.open(request.metadata(), raw)?;
                serde_json::from_slice(&plain).map_err(|err| {
                    Status::invalid_argument(format!("malformed metric payload: {err}"))
                })?
            }
        };

        match self.service.update_typed(metric).await {
            Ok(updated) => {
                counter!("updates_applied", &self.labels).increment(1);
                Ok(TonicResponse::new(MetricResponse {
                    metric: Some(proto::Metric::from(&updated)),
                }))
            }
            Err(err) => Err(status_for_service(&err)),
        }
    }

    async fn add_metric_batch(
        &self,
        request: TonicRequest<MetricBatchRequest>,
    ) -> Result<TonicResponse<MetricBatchResponse>, Status> {
        counter!("requests_received", &self.labels).increment(1);
        self.admit(request.metadata())?;

        let metrics: Vec<Metric> = {
            let raw = &request.get_ref().raw_body;
            if raw.is_empty() {
                request
                    .get_ref()
                    .metrics
                    .iter()
                    .cloned()
                    .map(Metric::try_from)
                    .collect::<Result<_, _>>()
                    .map_err(|err| Status::invalid_argument(err.to_string()))?
            } else {
                counter!("bytes_received", &self.labels).increment(raw.len() as u64);
                let plain = self.open(request.metadata(), raw)?;
                serde_json::from_slice(&plain).map_err(|err| {
                    Status::invalid_argument(format!("malformed metric payload: {err}"))
                })?
            }
        };

        match self.service.update_typed_batch(&metrics).await {
            Ok(accepted) => {
                counter!("updates_applied", &self.labels).increment(accepted);
                Ok(TonicResponse::new(MetricBatchResponse { accepted }))
            }
            Err(err) => Err(status_for_service(&err)),
        }
    }

    async fn ping(
        &self,
        request: TonicRequest<PingRequest>,
    ) -> Result<TonicResponse<PingResponse>, Status> {
        self.admit(request.metadata())?;
        let healthy = match self.service.ping().await {
            Ok(()) => true,
            Err(err) => {
                error!("storage ping failed: {err}");
                false
            }
        };
        Ok(TonicResponse::new(PingResponse { healthy }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryStore, Storage};
    use tonic::Code;

    fn ingest(guard: Guard) -> IngestGrpc {
        IngestGrpc {
            guard,
            service: Arc::new(Ingest::new(Storage::Memory(MemoryStore::new()), false)),
            labels: Vec::new(),
        }
    }

    fn open_guard() -> Guard {
        Guard::new(None, None, None).expect("guard")
    }

    #[tokio::test]
    async fn typed_field_path_applies_update() {
        let ingest = ingest(open_guard());

        let request = TonicRequest::new(MetricRequest {
            metric: Some(proto::Metric::from(&Metric::counter("PollCount", 2))),
            raw_body: Vec::new(),
        });
        let response = ingest.add_metric(request).await.expect("accepted");
        let updated = response.into_inner().metric.expect("metric present");
        assert_eq!(updated.delta, 2);

        let request = TonicRequest::new(MetricRequest {
            metric: Some(proto::Metric::from(&Metric::counter("PollCount", 3))),
            raw_body: Vec::new(),
        });
        let response = ingest.add_metric(request).await.expect("accepted");
        assert_eq!(response.into_inner().metric.expect("metric present").delta, 5);
    }

    #[tokio::test]
    async fn raw_body_path_opens_the_envelope() {
        let ingest = ingest(Guard::new(None, Some("secret"), None).expect("guard"));

        let payload = serde_json::to_vec(&Metric::gauge("Alloc", 1.5)).expect("serialize");
        let tag = tally_seal::sign(b"secret", &payload).expect("sign");

        let mut request = TonicRequest::new(MetricRequest {
            metric: None,
            raw_body: payload,
        });
        request
            .metadata_mut()
            .insert(TAG_METADATA, tag.parse().expect("tag is ascii"));

        let response = ingest.add_metric(request).await.expect("accepted");
        let updated = response.into_inner().metric.expect("metric present");
        assert_eq!(updated.kind, "gauge");
        assert_eq!(updated.value, 1.5);
    }

    #[tokio::test]
    async fn absent_tag_with_secret_is_unauthenticated() {
        let ingest = ingest(Guard::new(None, Some("secret"), None).expect("guard"));

        let payload = serde_json::to_vec(&Metric::gauge("Alloc", 1.5)).expect("serialize");
        let request = TonicRequest::new(MetricRequest {
            metric: None,
            raw_body: payload,
        });

        let status = ingest.add_metric(request).await.expect_err("must reject");
        assert_eq!(status.code(), Code::Unauthenticated);
    }

    #[tokio::test]
    async fn untrusted_source_is_permission_denied() {
        let ingest = ingest(Guard::new(Some("10.0.0.0/8"), None, None).expect("guard"));

        let mut request = TonicRequest::new(MetricRequest {
            metric: Some(proto::Metric::from(&Metric::counter("PollCount", 1))),
            raw_body: Vec::new(),
        });
        request
            .metadata_mut()
            .insert(REAL_IP_HEADER, "192.168.0.9".parse().expect("ascii"));

        let status = ingest.add_metric(request).await.expect_err("must reject");
        assert_eq!(status.code(), Code::PermissionDenied);

        // No declared source at all is also a rejection.
        let request = TonicRequest::new(MetricRequest {
            metric: Some(proto::Metric::from(&Metric::counter("PollCount", 1))),
            raw_body: Vec::new(),
        });
        let status = ingest.add_metric(request).await.expect_err("must reject");
        assert_eq!(status.code(), Code::PermissionDenied);
    }

    #[tokio::test]
    async fn batch_replaces_the_population() {
        let ingest = ingest(open_guard());

        let seed = TonicRequest::new(MetricRequest {
            metric: Some(proto::Metric::from(&Metric::gauge("doomed", 9.9))),
            raw_body: Vec::new(),
        });
        ingest.add_metric(seed).await.expect("accepted");

        let batch = TonicRequest::new(MetricBatchRequest {
            metrics: vec![
                proto::Metric::from(&Metric::gauge("Alloc", 1.25)),
                proto::Metric::from(&Metric::counter("PollCount", 7)),
            ],
            raw_body: Vec::new(),
        });
        let response = ingest.add_metric_batch(batch).await.expect("accepted");
        assert_eq!(response.into_inner().accepted, 2);

        assert!(matches!(
            ingest.service.metric_value("gauge", "doomed").await,
            Err(service::Error::NotFound { .. })
        ));
        assert_eq!(
            ingest
                .service
                .metric_value("counter", "PollCount")
                .await
                .expect("read"),
            "7"
        );
    }

    #[tokio::test]
    async fn unknown_kind_is_invalid_argument() {
        let ingest = ingest(open_guard());

        let request = TonicRequest::new(MetricRequest {
            metric: Some(proto::Metric {
                id: "x".to_string(),
                kind: "histogram".to_string(),
                delta: 0,
                value: 0.0,
            }),
            raw_body: Vec::new(),
        });
        let status = ingest.add_metric(request).await.expect_err("must reject");
        assert_eq!(status.code(), Code::InvalidArgument);
    }

    #[tokio::test]
    async fn ping_reports_healthy_backend() {
        let ingest = ingest(open_guard());
        let response = ingest
            .ping(TonicRequest::new(PingRequest {}))
            .await
            .expect("ping");
        assert!(response.into_inner().healthy);
    }
}

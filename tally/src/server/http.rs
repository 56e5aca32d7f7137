//! HTTP implementation of the ingest surface
//!
//! Routes are matched by hand on path segments. The source gate runs before
//! any body is read, sealed routes then collect the body, reverse
//! content-encoding and open the envelope before JSON parsing. Responses
//! carry an integrity tag when a shared secret is configured and are
//! compressed when the caller accepts gzip.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http::StatusCode;
use http_body_util::{BodyExt, combinators::BoxBody};
use hyper::{Request, Response};
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto,
};
use metrics::{counter, gauge};
use tally_metric::Metric;
use tally_signal::Watcher;
use tokio::{
    net::TcpListener,
    pin,
    sync::{Semaphore, TryAcquireError},
    task::{JoinHandle, JoinSet},
};
use tracing::{debug, error, info, warn};

use crate::server::guard::{self, Guard};
use crate::service::{self, Ingest};

/// Request header naming the original client address.
pub(crate) const REAL_IP_HEADER: &str = "x-real-ip";
/// Header carrying the hex integrity tag, both directions.
pub(crate) const TAG_HEADER: &str = "HashSHA256";

const TEXT_PLAIN: &str = "text/plain; charset=utf-8";
const TEXT_HTML: &str = "text/html; charset=utf-8";
const APPLICATION_JSON: &str = "application/json";

#[derive(thiserror::Error, Debug)]
/// Errors produced by the HTTP server
pub enum Error {
    /// Wrapper for [`std::io::Error`].
    #[error("IO error: {0}")]
    Io(std::io::Error),
}

/// Bind the HTTP ingest server and run it until shutdown. Returns the
/// bound address, which differs from `addr` when port zero was requested.
///
/// # Errors
///
/// Function will error if the address cannot be bound.
pub(crate) async fn run_server(
    addr: SocketAddr,
    concurrency_limit: usize,
    handler: Handler,
    shutdown: Watcher,
) -> Result<(SocketAddr, JoinHandle<()>), Error> {
    let listener = TcpListener::bind(addr).await.map_err(Error::Io)?;
    let bound = listener.local_addr().map_err(Error::Io)?;
    info!("Starting HTTP ingest server on {bound}");
    let handle = tokio::spawn(accept_loop(listener, concurrency_limit, handler, shutdown));
    Ok((bound, handle))
}

async fn accept_loop(
    listener: TcpListener,
    concurrency_limit: usize,
    handler: Handler,
    shutdown: Watcher,
) {
    let sem = Arc::new(Semaphore::new(concurrency_limit));
    let mut join_set = JoinSet::new();
    let labels = handler.labels.clone();

    gauge!("connection.limit", &labels).set(concurrency_limit as f64);

    let shutdown_fut = shutdown.clone().recv();
    pin!(shutdown_fut);
    loop {
        let claimed_permits = concurrency_limit - sem.available_permits();
        gauge!("connection.current", &labels).set(claimed_permits as f64);

        tokio::select! {
            () = &mut shutdown_fut => {
                info!("Shutdown signal received, stopping accept loop.");
                break;
            }

            incoming = listener.accept() => {
                let (stream, peer) = match incoming {
                    Ok(sa) => sa,
                    Err(e) => {
                        error!("Error accepting connection: {e}");
                        continue;
                    }
                };
                debug!("Accepted connection from {peer}");

                let sem = Arc::clone(&sem);
                let handler = handler.clone();
                let conn_shutdown = shutdown.clone();

                join_set.spawn(async move {
                    let permit = match sem.try_acquire() {
                        Ok(p) => p,
                        Err(TryAcquireError::Closed) => {
                            error!("Semaphore closed");
                            return;
                        }
                        Err(TryAcquireError::NoPermits) => {
                            warn!("httpd over connection capacity, load shedding");
                            drop(stream);
                            return;
                        }
                    };

                    let builder = auto::Builder::new(TokioExecutor::new());
                    let service = hyper::service::service_fn(move |req| {
                        let request_handler = handler.clone();
                        request_handler.handle_request(req)
                    });
                    let conn =
                        builder.serve_connection_with_upgrades(TokioIo::new(stream), service);
                    pin!(conn);
                    let conn_shutdown_fut = conn_shutdown.recv();
                    pin!(conn_shutdown_fut);

                    // Idle keep-alive connections would otherwise pend until
                    // the peer hangs up, stalling the drain below.
                    tokio::select! {
                        res = conn.as_mut() => {
                            if let Err(e) = res {
                                error!("Error serving {peer}: {e}");
                            }
                        }
                        () = &mut conn_shutdown_fut => {
                            conn.as_mut().graceful_shutdown();
                            if let Err(e) = conn.as_mut().await {
                                error!("Error serving {peer}: {e}");
                            }
                        }
                    }
                    drop(permit);
                });
            }
        }
    }

    drop(listener);
    while join_set.join_next().await.is_some() {}
}

#[derive(Clone, Debug)]
/// Handler for ingest HTTP requests, cloned per request.
pub(crate) struct Handler {
    guard: Guard,
    service: Arc<Ingest>,
    labels: Vec<(String, String)>,
}

impl Handler {
    pub(crate) fn new(guard: Guard, service: Arc<Ingest>, labels: &[(String, String)]) -> Self {
        Self {
            guard,
            service,
            labels: labels.to_vec(),
        }
    }

    async fn handle_request(
        self,
        req: Request<hyper::body::Incoming>,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
        counter!("requests_received", &self.labels).increment(1);

        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let real_ip = req
            .headers()
            .get(REAL_IP_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        // The source gate runs before the body is touched so untrusted
        // callers never cost a body read.
        if let Err(err) = self.guard.check_source(real_ip.as_deref()) {
            counter!("requests_rejected", &self.labels).increment(1);
            return Ok(self.rejection(&err));
        }

        let accept_gzip = req
            .headers()
            .get(hyper::header::ACCEPT_ENCODING)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|accept| accept.contains("gzip"));

        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

        match (method.as_str(), segments.as_slice()) {
            ("GET", []) => self.index(accept_gzip).await,
            ("GET", ["ping"]) => self.ping().await,
            ("POST", ["update", kind, name, value]) => {
                self.text_update(kind, name, value).await
            }
            ("GET", ["value", kind, name]) => self.text_value(kind, name, accept_gzip).await,
            ("POST", ["update"]) => {
                let plain = match self.sealed_body(req).await? {
                    Ok(plain) => plain,
                    Err(response) => return Ok(*response),
                };
                self.typed_update(&plain, accept_gzip).await
            }
            ("POST", ["updates"]) => {
                let plain = match self.sealed_body(req).await? {
                    Ok(plain) => plain,
                    Err(response) => return Ok(*response),
                };
                self.typed_batch(&plain, accept_gzip).await
            }
            ("POST", ["value"]) => {
                let plain = match self.sealed_body(req).await? {
                    Ok(plain) => plain,
                    Err(response) => return Ok(*response),
                };
                self.typed_value(&plain, accept_gzip).await
            }
            _ => {
                static NOT_FOUND: &[u8] = b"Not found";
                Ok(Response::builder()
                    .status(StatusCode::NOT_FOUND)
                    .body(crate::full(Bytes::from_static(NOT_FOUND)))
                    .expect("Creating HTTP response should not fail"))
            }
        }
    }

    /// Collect the request body, reverse content-encoding and open the
    /// payload envelope. An `Err` carries the response to send instead.
    async fn sealed_body(
        &self,
        req: Request<hyper::body::Incoming>,
    ) -> Result<Result<Vec<u8>, Box<Response<BoxBody<Bytes, hyper::Error>>>>, hyper::Error> {
        let content_encoding = req.headers().get(hyper::header::CONTENT_ENCODING).cloned();
        let tag = req
            .headers()
            .get(TAG_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let body_bytes = req.into_body().collect().await?.to_bytes();
        counter!("bytes_received", &self.labels).increment(body_bytes.len() as u64);

        let decoded = match crate::codec::decode(content_encoding.as_ref(), body_bytes) {
            Ok(decoded) => decoded,
            Err(response) => return Ok(Err(response)),
        };

        match self.guard.open(&decoded, tag.as_deref()) {
            Ok(plain) => Ok(Ok(plain)),
            Err(err) => {
                counter!("requests_rejected", &self.labels).increment(1);
                Ok(Err(Box::new(self.rejection(&err))))
            }
        }
    }

    async fn index(
        self,
        accept_gzip: bool,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
        match self.service.all_rendered().await {
            Ok(groups) => {
                let html = render_index(&groups);
                Ok(self.finish(StatusCode::OK, TEXT_HTML, html.into_bytes(), accept_gzip))
            }
            Err(err) => Ok(self.failure(&err)),
        }
    }

    async fn ping(self) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
        match self.service.ping().await {
            Ok(()) => Ok(self.finish(StatusCode::OK, TEXT_PLAIN, Vec::new(), false)),
            Err(err) => Ok(self.failure(&err)),
        }
    }

    async fn text_update(
        self,
        kind: &str,
        name: &str,
        value: &str,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
        match self.service.update_metric(kind, name, value).await {
            Ok(_) => {
                counter!("updates_applied", &self.labels).increment(1);
                Ok(self.finish(StatusCode::OK, TEXT_PLAIN, Vec::new(), false))
            }
            Err(err) => Ok(self.failure(&err)),
        }
    }

    async fn text_value(
        self,
        kind: &str,
        name: &str,
        accept_gzip: bool,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
        match self.service.metric_value(kind, name).await {
            Ok(value) => {
                Ok(self.finish(StatusCode::OK, TEXT_PLAIN, value.into_bytes(), accept_gzip))
            }
            Err(err) => Ok(self.failure(&err)),
        }
    }

    async fn typed_update(
        self,
        plain: &[u8],
        accept_gzip: bool,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
        let metric: Metric = match serde_json::from_slice(plain) {
            Ok(metric) => metric,
            Err(err) => return Ok(self.malformed(&err)),
        };
        match self.service.update_typed(metric).await {
            Ok(updated) => {
                counter!("updates_applied", &self.labels).increment(1);
                let body = serde_json::to_vec(&updated)
                    .expect("metric serialization should not fail");
                Ok(self.finish(StatusCode::OK, APPLICATION_JSON, body, accept_gzip))
            }
            Err(err) => Ok(self.failure(&err)),
        }
    }

    async fn typed_batch(
        self,
        plain: &[u8],
        accept_gzip: bool,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
        let metrics: Vec<Metric> = match serde_json::from_slice(plain) {
            Ok(metrics) => metrics,
            Err(err) => return Ok(self.malformed(&err)),
        };
        match self.service.update_typed_batch(&metrics).await {
            Ok(accepted) => {
                counter!("updates_applied", &self.labels).increment(accepted);
                let body = serde_json::to_vec(&accepted)
                    .expect("count serialization should not fail");
                Ok(self.finish(StatusCode::OK, APPLICATION_JSON, body, accept_gzip))
            }
            Err(err) => Ok(self.failure(&err)),
        }
    }

    async fn typed_value(
        self,
        plain: &[u8],
        accept_gzip: bool,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
        let query: Metric = match serde_json::from_slice(plain) {
            Ok(query) => query,
            Err(err) => return Ok(self.malformed(&err)),
        };
        match self.service.typed_value(query.kind, &query.id).await {
            Ok(metric) => {
                let body = serde_json::to_vec(&metric)
                    .expect("metric serialization should not fail");
                Ok(self.finish(StatusCode::OK, APPLICATION_JSON, body, accept_gzip))
            }
            Err(err) => Ok(self.failure(&err)),
        }
    }

    fn malformed(&self, err: &serde_json::Error) -> Response<BoxBody<Bytes, hyper::Error>> {
        self.finish(
            StatusCode::BAD_REQUEST,
            TEXT_PLAIN,
            format!("malformed metric payload: {err}").into_bytes(),
            false,
        )
    }

    fn rejection(&self, err: &guard::Error) -> Response<BoxBody<Bytes, hyper::Error>> {
        if err.is_source_error() {
            warn!("rejected request from untrusted source: {err}");
            self.finish(
                StatusCode::FORBIDDEN,
                TEXT_PLAIN,
                b"forbidden".to_vec(),
                false,
            )
        } else {
            warn!("rejected request with bad envelope: {err}");
            self.finish(
                StatusCode::BAD_REQUEST,
                TEXT_PLAIN,
                err.to_string().into_bytes(),
                false,
            )
        }
    }

    fn failure(&self, err: &service::Error) -> Response<BoxBody<Bytes, hyper::Error>> {
        let (status, body) = match err {
            service::Error::Validation(_) => {
                (StatusCode::BAD_REQUEST, err.to_string().into_bytes())
            }
            service::Error::NotFound { .. } => {
                (StatusCode::NOT_FOUND, err.to_string().into_bytes())
            }
            service::Error::Storage(_) => {
                // Backend detail stays in the log, not the response.
                error!("storage failure: {err}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    b"internal error".to_vec(),
                )
            }
        };
        self.finish(status, TEXT_PLAIN, body, false)
    }

    /// Assemble the response: integrity tag over the plaintext body, then
    /// optional gzip.
    fn finish(
        &self,
        status: StatusCode,
        content_type: &'static str,
        body: Vec<u8>,
        accept_gzip: bool,
    ) -> Response<BoxBody<Bytes, hyper::Error>> {
        let tag = match self.guard.response_tag(&body) {
            Ok(tag) => tag,
            Err(err) => {
                warn!("response tag computation failed: {err}");
                None
            }
        };

        let mut compressed = None;
        if accept_gzip && !body.is_empty() {
            match crate::codec::gzip(&body) {
                Ok(encoded) => compressed = Some(encoded),
                Err(err) => warn!("response compression failed, sending identity: {err}"),
            }
        }

        let mut response = Response::builder()
            .status(status)
            .header(hyper::header::CONTENT_TYPE, content_type);
        if let Some(tag) = tag {
            response = response.header(TAG_HEADER, tag);
        }
        let body = match compressed {
            Some(encoded) => {
                response = response.header(hyper::header::CONTENT_ENCODING, "gzip");
                encoded
            }
            None => body,
        };
        response
            .body(crate::full(body))
            .expect("Creating HTTP response should not fail")
    }
}

/// Render the index page: every stored metric grouped by kind, names in
/// sorted order.
fn render_index(groups: &BTreeMap<&'static str, BTreeMap<String, String>>) -> String {
    let mut html = String::with_capacity(256);
    html.push_str("<!DOCTYPE html><html><head><title>tally</title></head><body>");
    for (kind, entries) in groups {
        html.push_str(&format!("<h2>{kind}</h2><table>"));
        for (name, value) in entries {
            html.push_str(&format!("<tr><td>{name}</td><td>{value}</td></tr>"));
        }
        html.push_str("</table>");
    }
    html.push_str("</body></html>");
    html
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_page_lists_metrics_in_sorted_order() {
        let mut gauges = BTreeMap::new();
        gauges.insert("zeta".to_string(), "1.5".to_string());
        gauges.insert("alpha".to_string(), "2".to_string());
        let mut groups = BTreeMap::new();
        groups.insert("gauge", gauges);
        groups.insert("counter", BTreeMap::new());

        let html = render_index(&groups);
        assert!(html.starts_with("<!DOCTYPE html>"));
        let alpha = html.find("alpha").expect("alpha rendered");
        let zeta = html.find("zeta").expect("zeta rendered");
        assert!(alpha < zeta);
        assert!(html.contains("<td>1.5</td>"));
        assert!(html.contains("<h2>counter</h2>"));
    }
}

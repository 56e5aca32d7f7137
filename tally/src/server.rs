//! Aggregation server runtime
//!
//! Selects the storage backend, restores any snapshot, builds the shared
//! ingestion service and admission guard, then runs the HTTP and optional
//! gRPC front ends until shutdown. Snapshot policy lives here: a store
//! interval of zero saves synchronously after every mutation, a positive
//! interval saves on a timer, and a final save runs at shutdown.

pub(crate) mod grpc;
pub mod guard;
pub(crate) mod http;

use std::sync::Arc;
use std::time::Duration;

use tally_signal::Watcher;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{error, info, warn};

use crate::config::ServerConfig;
use crate::server::guard::Guard;
use crate::service::{self, Ingest};
use crate::storage::{self, FileStore, MemoryStore, PostgresStore, Storage};

#[derive(thiserror::Error, Debug)]
/// Errors produced by [`Server`]
pub enum Error {
    /// Admission guard configuration is unusable
    #[error(transparent)]
    Guard(#[from] guard::Error),
    /// The storage backend failed to initialize or restore
    #[error(transparent)]
    Storage(#[from] storage::Error),
    /// Key material could not be read
    #[error("unreadable key material: {0}")]
    Io(#[from] std::io::Error),
    /// The HTTP front end could not bind its address
    #[error(transparent)]
    Http(#[from] http::Error),
    /// The ingestion service failed
    #[error(transparent)]
    Service(#[from] service::Error),
}

#[derive(Debug)]
/// The aggregation server.
pub struct Server {
    config: ServerConfig,
}

impl Server {
    /// Create a server from configuration. Nothing binds until [`run`].
    ///
    /// [`run`]: Server::run
    #[must_use]
    pub fn new(config: ServerConfig) -> Self {
        Self { config }
    }

    /// Run the server until the shutdown signal fires. State is saved one
    /// final time on the way out.
    ///
    /// # Errors
    ///
    /// Function will error if storage, key material or guard configuration
    /// is unusable at startup.
    pub async fn run(self, shutdown: Watcher) -> Result<(), Error> {
        let config = self.config;

        let storage = match (&config.database_dsn, &config.file_storage_path) {
            (Some(dsn), path) => {
                if path.is_some() {
                    warn!("database_dsn set, file_storage_path ignored");
                }
                Storage::Postgres(PostgresStore::connect(dsn).await?)
            }
            (None, Some(path)) => Storage::File(FileStore::new(path.clone())),
            (None, None) => Storage::Memory(MemoryStore::new()),
        };

        if config.restore {
            let loaded = storage.restore().await?;
            if loaded > 0 {
                info!("restored {loaded} metrics from snapshot");
            }
        }

        // A zero interval means write-through: snapshot after every
        // successful mutation instead of on a timer.
        let sync_save = config.store_interval_seconds == 0;
        let service = Arc::new(Ingest::new(storage, sync_save));

        let private_key_pem = match &config.crypto_key_path {
            Some(path) => Some(tokio::fs::read_to_string(path).await?),
            None => None,
        };
        let guard = Guard::new(
            config.trusted_subnet.as_deref(),
            config.secret_key.as_deref(),
            private_key_pem.as_deref(),
        )?;

        let labels = vec![("component".to_string(), "server".to_string())];
        let mut tasks = Vec::new();

        let handler = http::Handler::new(guard.clone(), Arc::clone(&service), &labels);
        let (_, http_task) = http::run_server(
            config.address,
            config.concurrent_requests_max,
            handler,
            shutdown.clone(),
        )
        .await?;
        tasks.push(http_task);

        if let Some(grpc_addr) = config.grpc_address {
            tasks.push(grpc::run_server(
                grpc_addr,
                config.concurrent_requests_max,
                guard.clone(),
                Arc::clone(&service),
                &labels,
                shutdown.clone(),
            ));
        }

        if config.store_interval_seconds > 0 {
            tasks.push(spawn_save_loop(
                Arc::clone(&service),
                Duration::from_secs(config.store_interval_seconds),
                shutdown.clone(),
            ));
        }

        shutdown.recv().await;
        info!("Shutdown signal received, stopping server.");

        for task in tasks {
            if let Err(err) = task.await {
                error!("server task panicked: {err}");
            }
        }

        // Final save so a clean shutdown never loses accepted updates.
        service.save().await?;
        Ok(())
    }
}

fn spawn_save_loop(service: Arc<Ingest>, every: Duration, shutdown: Watcher) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(every);
        let shutdown_fut = shutdown.recv();
        tokio::pin!(shutdown_fut);
        loop {
            tokio::select! {
                () = &mut shutdown_fut => break,
                _ = ticker.tick() => {
                    if let Err(err) = service.save().await {
                        warn!("periodic snapshot save failed: {err}");
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
    use rsa::rand_core::OsRng;
    use rsa::{RsaPrivateKey, RsaPublicKey};
    use tally_metric::Metric;
    use tally_seal::Sealer;

    use super::http::{self, Handler};
    use super::*;

    fn key_pair_pem() -> (String, String) {
        let mut rng = OsRng;
        let private = RsaPrivateKey::new(&mut rng, 2048).expect("generate key");
        let public = RsaPublicKey::from(&private);
        let private_pem = private
            .to_pkcs8_pem(LineEnding::LF)
            .expect("encode private key")
            .to_string();
        let public_pem = public
            .to_public_key_pem(LineEnding::LF)
            .expect("encode public key");
        (private_pem, public_pem)
    }

    async fn serve(
        guard: Guard,
    ) -> (String, Arc<Ingest>, tally_signal::Broadcaster, JoinHandle<()>) {
        let service = Arc::new(Ingest::new(Storage::Memory(MemoryStore::new()), false));
        let handler = Handler::new(guard, Arc::clone(&service), &[]);
        let (watcher, broadcaster) = tally_signal::signal();
        let (bound, task) = http::run_server(
            "127.0.0.1:0".parse().expect("loopback"),
            8,
            handler,
            watcher,
        )
        .await
        .expect("bind test server");
        (format!("http://{bound}"), service, broadcaster, task)
    }

    fn open_guard() -> Guard {
        Guard::new(None, None, None).expect("guard without checks")
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn text_updates_round_trip_and_bad_values_do_not_clobber() {
        let (base, _service, stop, task) = serve(open_guard()).await;
        let client = reqwest::Client::new();

        let response = client
            .post(format!("{base}/update/gauge/someMetric/1.1"))
            .send()
            .await
            .expect("update");
        assert_eq!(response.status(), reqwest::StatusCode::OK);

        let response = client
            .get(format!("{base}/value/gauge/someMetric"))
            .send()
            .await
            .expect("value");
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        assert_eq!(response.text().await.expect("body"), "1.1");

        let response = client
            .post(format!("{base}/update/gauge/someMetric/bad"))
            .send()
            .await
            .expect("update");
        assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);

        // The failed update left the stored value alone.
        let body = client
            .get(format!("{base}/value/gauge/someMetric"))
            .send()
            .await
            .expect("value")
            .text()
            .await
            .expect("body");
        assert_eq!(body, "1.1");

        stop.signal();
        task.await.expect("server task");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unknown_text_reads_are_not_found() {
        let (base, _service, stop, task) = serve(open_guard()).await;
        let client = reqwest::Client::new();

        let response = client
            .get(format!("{base}/value/counter/missing"))
            .send()
            .await
            .expect("value");
        assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);

        let response = client
            .get(format!("{base}/no/such/route"))
            .send()
            .await
            .expect("request");
        assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);

        let response = client
            .get(format!("{base}/ping"))
            .send()
            .await
            .expect("ping");
        assert_eq!(response.status(), reqwest::StatusCode::OK);

        stop.signal();
        task.await.expect("server task");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn bulk_reload_replaces_the_population() {
        let (base, _service, stop, task) = serve(open_guard()).await;
        let client = reqwest::Client::new();

        let response = client
            .post(format!("{base}/update/counter/visits/7"))
            .send()
            .await
            .expect("update");
        assert_eq!(response.status(), reqwest::StatusCode::OK);

        let batch = vec![Metric::gauge("cpu", 0.5), Metric::counter("beats", 3)];
        let response = client
            .post(format!("{base}/updates"))
            .json(&batch)
            .send()
            .await
            .expect("batch");
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        assert_eq!(response.text().await.expect("count"), "2");

        // The prior population is fully superseded.
        let response = client
            .get(format!("{base}/value/counter/visits"))
            .send()
            .await
            .expect("value");
        assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);

        let body = client
            .get(format!("{base}/value/counter/beats"))
            .send()
            .await
            .expect("value")
            .text()
            .await
            .expect("body");
        assert_eq!(body, "3");

        stop.signal();
        task.await.expect("server task");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn untrusted_sources_never_reach_storage() {
        let guard = Guard::new(Some("10.0.0.0/8"), None, None).expect("subnet guard");
        let (base, service, stop, task) = serve(guard).await;
        let client = reqwest::Client::new();

        let payload = Metric::gauge("cpu", 0.5);
        let response = client
            .post(format!("{base}/update"))
            .header(http::REAL_IP_HEADER, "192.168.1.20")
            .json(&payload)
            .send()
            .await
            .expect("update");
        assert_eq!(response.status(), reqwest::StatusCode::FORBIDDEN);

        let response = client
            .post(format!("{base}/update"))
            .json(&payload)
            .send()
            .await
            .expect("update");
        assert_eq!(response.status(), reqwest::StatusCode::FORBIDDEN);

        let groups = service.all_rendered().await.expect("rendered");
        assert!(groups["gauge"].is_empty());
        assert!(groups["counter"].is_empty());

        // The same request from inside the subnet is accepted.
        let response = client
            .post(format!("{base}/update"))
            .header(http::REAL_IP_HEADER, "10.1.2.3")
            .json(&payload)
            .send()
            .await
            .expect("update");
        assert_eq!(response.status(), reqwest::StatusCode::OK);

        stop.signal();
        task.await.expect("server task");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn tagged_requests_verify_and_responses_carry_a_tag() {
        let guard = Guard::new(None, Some("hunter2"), None).expect("secret guard");
        let (base, _service, stop, task) = serve(guard).await;
        let client = reqwest::Client::new();

        let sealer = Sealer::new(Some("hunter2"), None).expect("sealer");
        let payload = serde_json::to_vec(&Metric::counter("beats", 5)).expect("serialize");
        let sealed = sealer.seal(&payload).expect("seal");
        let tag = sealed.tag.expect("tag configured");

        let response = client
            .post(format!("{base}/update"))
            .header(http::TAG_HEADER, &tag)
            .body(sealed.body)
            .send()
            .await
            .expect("update");
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        assert!(response.headers().get(http::TAG_HEADER).is_some());

        // Any mutation of the tagged body invalidates it.
        let mut tampered = payload.clone();
        tampered[0] ^= 0x01;
        let response = client
            .post(format!("{base}/update"))
            .header(http::TAG_HEADER, &tag)
            .body(tampered)
            .send()
            .await
            .expect("update");
        assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);

        // So does omitting the tag while the secret is configured.
        let response = client
            .post(format!("{base}/update"))
            .body(payload)
            .send()
            .await
            .expect("update");
        assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);

        stop.signal();
        task.await.expect("server task");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn encrypted_updates_decrypt_before_storage() {
        let (private_pem, public_pem) = key_pair_pem();
        let guard =
            Guard::new(None, Some("hunter2"), Some(&private_pem)).expect("decrypting guard");
        let (base, _service, stop, task) = serve(guard).await;
        let client = reqwest::Client::new();

        let sealer = Sealer::new(Some("hunter2"), Some(&public_pem)).expect("sealer");
        let batch = vec![Metric::gauge("cpu", 0.5), Metric::counter("beats", 5)];
        let payload = serde_json::to_vec(&batch).expect("serialize");
        let sealed = sealer.seal(&payload).expect("seal");
        let tag = sealed.tag.expect("tag configured");
        assert_ne!(sealed.body, payload);

        let response = client
            .post(format!("{base}/updates"))
            .header(http::TAG_HEADER, &tag)
            .body(sealed.body.clone())
            .send()
            .await
            .expect("updates");
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        assert_eq!(response.text().await.expect("count"), "2");

        let body = client
            .get(format!("{base}/value/counter/beats"))
            .send()
            .await
            .expect("value")
            .text()
            .await
            .expect("body");
        assert_eq!(body, "5");

        // Ciphertext that does not divide into whole blocks is rejected
        // before the tag is even consulted.
        let truncated = sealed.body[..sealed.body.len() - 1].to_vec();
        let response = client
            .post(format!("{base}/updates"))
            .header(http::TAG_HEADER, &tag)
            .body(truncated)
            .send()
            .await
            .expect("updates");
        assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);

        stop.signal();
        task.await.expect("server task");
    }
}

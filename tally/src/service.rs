//! Ingestion service shared by both transports
//!
//! [`Ingest`] owns the configured [`Storage`] behind an async mutex and
//! exposes one method per ingestion operation. The HTTP and gRPC front ends
//! are thin shells over this type, every semantic decision lives here:
//! validation before mutation, post-update read-back, snapshot-after-write
//! policy and the unknown-name behavior of each read form.

use std::collections::BTreeMap;

use tally_metric::{Kind, Metric, ValidationError};
use tokio::sync::Mutex;
use tracing::warn;

use crate::storage::{self, Repository, Storage};

#[derive(thiserror::Error, Debug)]
/// Errors produced by [`Ingest`] operations
pub enum Error {
    /// Request data failed validation
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// Named metric does not exist
    #[error("no {kind} named {id}")]
    NotFound {
        /// The kind that was asked for.
        kind: Kind,
        /// The name that was asked for.
        id: String,
    },
    /// The storage backend failed
    #[error(transparent)]
    Storage(storage::Error),
}

impl From<storage::Error> for Error {
    fn from(err: storage::Error) -> Self {
        // Validation failures inside a backend are the client's fault and
        // keep their taxonomy, everything else is a backend fault.
        match err {
            storage::Error::Metric(err) => Error::Validation(err),
            other => Error::Storage(other),
        }
    }
}

#[derive(Debug)]
/// The ingestion core: storage plus write-through policy.
pub struct Ingest {
    storage: Mutex<Storage>,
    sync_save: bool,
}

impl Ingest {
    /// Create a service over `storage`. When `sync_save` is set every
    /// successful mutation is followed by a snapshot save.
    #[must_use]
    pub fn new(storage: Storage, sync_save: bool) -> Self {
        Self {
            storage: Mutex::new(storage),
            sync_save,
        }
    }

    /// Apply one update given in path text form. Returns the metric's
    /// post-update state.
    ///
    /// # Errors
    ///
    /// Function will error if `kind` is unknown, `raw` does not parse or
    /// the backend fails.
    pub async fn update_metric(&self, kind: &str, id: &str, raw: &str) -> Result<Metric, Error> {
        let metric = Metric::from_text(kind, id, raw)?;
        self.update_typed(metric).await
    }

    /// Apply one typed update. Returns the metric's post-update state, for
    /// counters the new cumulative total.
    ///
    /// # Errors
    ///
    /// Function will error if the metric's payload does not match its kind
    /// or the backend fails.
    pub async fn update_typed(&self, metric: Metric) -> Result<Metric, Error> {
        let storage = self.storage.lock().await;
        let updated = match metric.kind {
            Kind::Gauge => {
                let value = metric.gauge_value()?;
                let stored = storage.update_gauge(&metric.id, value).await?;
                Metric::gauge(metric.id, stored)
            }
            Kind::Counter => {
                let delta = metric.counter_delta()?;
                let total = storage.update_counter(&metric.id, delta).await?;
                Metric::counter(metric.id, total)
            }
        };
        self.save_after_write(&storage).await;
        Ok(updated)
    }

    /// Atomically replace the whole stored population with `metrics`.
    /// Returns the backend-reported count of affected rows.
    ///
    /// # Errors
    ///
    /// Function will error if any entry fails validation, in which case
    /// nothing commits, or if the backend fails.
    pub async fn update_typed_batch(&self, metrics: &[Metric]) -> Result<u64, Error> {
        let storage = self.storage.lock().await;
        let accepted = storage.replace_all(metrics).await?;
        self.save_after_write(&storage).await;
        Ok(accepted)
    }

    /// Read one metric in bare text form. Unknown names are an error here,
    /// the path form distinguishes absent from zero.
    ///
    /// # Errors
    ///
    /// Function will error if `kind` is unknown, the name was never written
    /// or the backend fails.
    pub async fn metric_value(&self, kind: &str, id: &str) -> Result<String, Error> {
        let kind: Kind = kind.parse()?;
        let storage = self.storage.lock().await;
        let stored = match kind {
            Kind::Gauge => storage.gauge(id).await?.map(|value| Metric::gauge(id, value)),
            Kind::Counter => storage
                .counter(id)
                .await?
                .map(|total| Metric::counter(id, total)),
        };
        match stored {
            Some(metric) => Ok(metric.render_value()?),
            None => Err(Error::NotFound {
                kind,
                id: id.to_string(),
            }),
        }
    }

    /// Read one metric in typed form. Unknown names read as the kind's zero
    /// so a reporter can probe before its first write.
    ///
    /// # Errors
    ///
    /// Function will error if the backend fails.
    pub async fn typed_value(&self, kind: Kind, id: &str) -> Result<Metric, Error> {
        let storage = self.storage.lock().await;
        let metric = match kind {
            Kind::Gauge => Metric::gauge(id, storage.gauge(id).await?.unwrap_or_default()),
            Kind::Counter => Metric::counter(id, storage.counter(id).await?.unwrap_or_default()),
        };
        Ok(metric)
    }

    /// Every stored metric rendered to text, grouped by kind and sorted by
    /// name. Both populations are read under one lock so the view is
    /// consistent.
    ///
    /// # Errors
    ///
    /// Function will error if the backend fails.
    pub async fn all_rendered(&self) -> Result<BTreeMap<&'static str, BTreeMap<String, String>>, Error> {
        let storage = self.storage.lock().await;
        let gauges = storage.all_gauges().await?;
        let counters = storage.all_counters().await?;
        drop(storage);

        let mut out = BTreeMap::new();
        out.insert(
            Kind::Gauge.as_str(),
            gauges
                .into_iter()
                .map(|(name, value)| (name, value.to_string()))
                .collect(),
        );
        out.insert(
            Kind::Counter.as_str(),
            counters
                .into_iter()
                .map(|(name, total)| (name, total.to_string()))
                .collect(),
        );
        Ok(out)
    }

    /// Probe liveness through to the backend.
    ///
    /// # Errors
    ///
    /// Function will error if the backend is unreachable.
    pub async fn ping(&self) -> Result<(), Error> {
        let storage = self.storage.lock().await;
        storage.ping().await?;
        Ok(())
    }

    /// Snapshot current state to the backend's file, if it has one.
    ///
    /// # Errors
    ///
    /// Function will error if the snapshot cannot be written.
    pub async fn save(&self) -> Result<(), Error> {
        let storage = self.storage.lock().await;
        storage.save().await?;
        Ok(())
    }

    /// Load state from the backend's snapshot file, if it has one. Returns
    /// the number of metrics loaded.
    ///
    /// # Errors
    ///
    /// Function will error if the snapshot exists but cannot be read.
    pub async fn restore(&self) -> Result<u64, Error> {
        let storage = self.storage.lock().await;
        Ok(storage.restore().await?)
    }

    /// Write-through after a successful mutation. The update has already
    /// committed, a failed snapshot is logged rather than surfaced.
    async fn save_after_write(&self, storage: &Storage) {
        if !self.sync_save {
            return;
        }
        if let Err(err) = storage.save().await {
            warn!("snapshot save failed after update: {err}");
        }
    }
}

//! Snapshot-to-file backend
//!
//! Wraps [`MemoryStore`] and adds whole-state serialization to a JSON
//! snapshot file. When saves happen is the caller's policy, this module only
//! knows how to write the current state out and read it back in.

use std::io::ErrorKind;
use std::path::PathBuf;

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tally_metric::{Metric, Snapshot};

use super::{Error, MemoryStore, Repository};

#[derive(Debug)]
/// Backend keeping live state in memory and snapshots on disk.
pub struct FileStore {
    inner: MemoryStore,
    path: PathBuf,
}

impl FileStore {
    /// Create an empty store that snapshots to `path`.
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self {
            inner: MemoryStore::new(),
            path,
        }
    }

    /// Serialize the whole current state to the snapshot file, replacing
    /// any prior contents.
    ///
    /// # Errors
    ///
    /// Function will error if serialization or the write fails.
    pub async fn save(&self) -> Result<(), Error> {
        let snapshot = self.inner.snapshot();
        let serialized = serde_json::to_vec(&snapshot)?;
        tokio::fs::write(&self.path, serialized).await?;
        Ok(())
    }

    /// Replace current state with the snapshot file's contents. A missing
    /// file is not an error, the store simply starts empty. Returns the
    /// number of metrics loaded.
    ///
    /// # Errors
    ///
    /// Function will error if the file exists but cannot be read or parsed.
    pub async fn restore(&self) -> Result<u64, Error> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(err.into()),
        };
        let snapshot: Snapshot = serde_json::from_slice(&raw)?;
        self.inner.replace_all(&snapshot.metrics()).await
    }
}

#[async_trait]
impl Repository for FileStore {
    async fn update_gauge(&self, name: &str, value: f64) -> Result<f64, Error> {
        self.inner.update_gauge(name, value).await
    }

    async fn update_counter(&self, name: &str, delta: i64) -> Result<i64, Error> {
        self.inner.update_counter(name, delta).await
    }

    async fn gauge(&self, name: &str) -> Result<Option<f64>, Error> {
        self.inner.gauge(name).await
    }

    async fn counter(&self, name: &str) -> Result<Option<i64>, Error> {
        self.inner.counter(name).await
    }

    async fn all_gauges(&self) -> Result<FxHashMap<String, f64>, Error> {
        self.inner.all_gauges().await
    }

    async fn all_counters(&self) -> Result<FxHashMap<String, i64>, Error> {
        self.inner.all_counters().await
    }

    async fn gauge_count(&self) -> Result<usize, Error> {
        self.inner.gauge_count().await
    }

    async fn counter_count(&self) -> Result<usize, Error> {
        self.inner.counter_count().await
    }

    async fn replace_gauges(&self, gauges: FxHashMap<String, f64>) -> Result<(), Error> {
        self.inner.replace_gauges(gauges).await
    }

    async fn replace_counters(&self, counters: FxHashMap<String, i64>) -> Result<(), Error> {
        self.inner.replace_counters(counters).await
    }

    async fn replace_all(&self, metrics: &[Metric]) -> Result<u64, Error> {
        self.inner.replace_all(metrics).await
    }

    async fn ping(&self) -> Result<(), Error> {
        self.inner.ping().await
    }
}

//! Storage capability and its interchangeable backends
//!
//! Every backend implements the same [`Repository`] surface: point updates
//! with merge semantics per kind, point and bulk reads, and the atomic
//! replace-all used by bulk reload. Selection happens once at startup, the
//! ingestion service above depends only on [`Storage`].

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tally_metric::{Metric, ValidationError};

pub mod file;
pub mod memory;
pub mod postgres;

pub use file::FileStore;
pub use memory::MemoryStore;
pub use postgres::PostgresStore;

#[derive(thiserror::Error, Debug)]
/// Errors produced by storage backends
pub enum Error {
    /// An entry in a reload batch failed validation
    #[error(transparent)]
    Metric(#[from] ValidationError),
    /// Wrapper for [`std::io::Error`] from snapshot file handling
    #[error("snapshot io: {0}")]
    Io(#[from] std::io::Error),
    /// Snapshot file contents did not parse
    #[error("snapshot parse: {0}")]
    Parse(#[from] serde_json::Error),
    /// Wrapper for [`sqlx::Error`]
    #[error("database: {0}")]
    Database(#[from] sqlx::Error),
}

impl Error {
    /// True if the error is a client data problem rather than a backend
    /// fault. Data errors are permanent and surface as a client error,
    /// everything else is a server fault.
    #[must_use]
    pub fn is_data_error(&self) -> bool {
        matches!(self, Error::Metric(_))
    }
}

/// The capability surface implemented identically by every backend.
#[async_trait]
pub trait Repository {
    /// Store `value` for the gauge `name`, replacing any prior value.
    /// Returns the value just stored.
    async fn update_gauge(&self, name: &str, value: f64) -> Result<f64, Error>;

    /// Add `delta` to the counter `name`, creating it at zero first if
    /// absent. Returns the post-update cumulative value.
    async fn update_counter(&self, name: &str, delta: i64) -> Result<i64, Error>;

    /// Current value of the gauge `name`, `None` if never written.
    async fn gauge(&self, name: &str) -> Result<Option<f64>, Error>;

    /// Current total of the counter `name`, `None` if never written.
    async fn counter(&self, name: &str) -> Result<Option<i64>, Error>;

    /// All gauges, name to current value.
    async fn all_gauges(&self) -> Result<FxHashMap<String, f64>, Error>;

    /// All counters, name to accumulated total.
    async fn all_counters(&self) -> Result<FxHashMap<String, i64>, Error>;

    /// Number of distinct gauges.
    async fn gauge_count(&self) -> Result<usize, Error>;

    /// Number of distinct counters.
    async fn counter_count(&self) -> Result<usize, Error>;

    /// Replace the whole gauge population with `gauges`.
    async fn replace_gauges(&self, gauges: FxHashMap<String, f64>) -> Result<(), Error>;

    /// Replace the whole counter population with `counters`.
    async fn replace_counters(&self, counters: FxHashMap<String, i64>) -> Result<(), Error>;

    /// Atomically replace both populations with the candidate set. Either
    /// every entry commits and prior state is fully superseded, or none do
    /// and prior state is untouched. Returns the backend-reported count of
    /// affected rows.
    async fn replace_all(&self, metrics: &[Metric]) -> Result<u64, Error>;

    /// Liveness probe through to the backend.
    async fn ping(&self) -> Result<(), Error>;
}

#[derive(Debug)]
/// The configured backend, selected once at startup.
pub enum Storage {
    /// Volatile in-memory maps, no persistence.
    Memory(MemoryStore),
    /// In-memory maps with snapshot-to-file persistence.
    File(FileStore),
    /// Relational store, every update is its own transaction.
    Postgres(PostgresStore),
}

impl Storage {
    /// Serialize current state to the snapshot file. A no-op for backends
    /// without one.
    ///
    /// # Errors
    ///
    /// Function will error if the snapshot cannot be written.
    pub async fn save(&self) -> Result<(), Error> {
        match self {
            Storage::File(store) => store.save().await,
            Storage::Memory(_) | Storage::Postgres(_) => Ok(()),
        }
    }

    /// Load state from the snapshot file, replacing current state. A no-op
    /// for backends without one, a missing file is an empty initial state.
    /// Returns the number of metrics loaded.
    ///
    /// # Errors
    ///
    /// Function will error if the snapshot file exists but cannot be read or
    /// parsed.
    pub async fn restore(&self) -> Result<u64, Error> {
        match self {
            Storage::File(store) => store.restore().await,
            Storage::Memory(_) | Storage::Postgres(_) => Ok(0),
        }
    }
}

#[async_trait]
impl Repository for Storage {
    async fn update_gauge(&self, name: &str, value: f64) -> Result<f64, Error> {
        match self {
            Storage::Memory(store) => store.update_gauge(name, value).await,
            Storage::File(store) => store.update_gauge(name, value).await,
            Storage::Postgres(store) => store.update_gauge(name, value).await,
        }
    }

    async fn update_counter(&self, name: &str, delta: i64) -> Result<i64, Error> {
        match self {
            Storage::Memory(store) => store.update_counter(name, delta).await,
            Storage::File(store) => store.update_counter(name, delta).await,
            Storage::Postgres(store) => store.update_counter(name, delta).await,
        }
    }

    async fn gauge(&self, name: &str) -> Result<Option<f64>, Error> {
        match self {
            Storage::Memory(store) => store.gauge(name).await,
            Storage::File(store) => store.gauge(name).await,
            Storage::Postgres(store) => store.gauge(name).await,
        }
    }

    async fn counter(&self, name: &str) -> Result<Option<i64>, Error> {
        match self {
            Storage::Memory(store) => store.counter(name).await,
            Storage::File(store) => store.counter(name).await,
            Storage::Postgres(store) => store.counter(name).await,
        }
    }

    async fn all_gauges(&self) -> Result<FxHashMap<String, f64>, Error> {
        match self {
            Storage::Memory(store) => store.all_gauges().await,
            Storage::File(store) => store.all_gauges().await,
            Storage::Postgres(store) => store.all_gauges().await,
        }
    }

    async fn all_counters(&self) -> Result<FxHashMap<String, i64>, Error> {
        match self {
            Storage::Memory(store) => store.all_counters().await,
            Storage::File(store) => store.all_counters().await,
            Storage::Postgres(store) => store.all_counters().await,
        }
    }

    async fn gauge_count(&self) -> Result<usize, Error> {
        match self {
            Storage::Memory(store) => store.gauge_count().await,
            Storage::File(store) => store.gauge_count().await,
            Storage::Postgres(store) => store.gauge_count().await,
        }
    }

    async fn counter_count(&self) -> Result<usize, Error> {
        match self {
            Storage::Memory(store) => store.counter_count().await,
            Storage::File(store) => store.counter_count().await,
            Storage::Postgres(store) => store.counter_count().await,
        }
    }

    async fn replace_gauges(&self, gauges: FxHashMap<String, f64>) -> Result<(), Error> {
        match self {
            Storage::Memory(store) => store.replace_gauges(gauges).await,
            Storage::File(store) => store.replace_gauges(gauges).await,
            Storage::Postgres(store) => store.replace_gauges(gauges).await,
        }
    }

    async fn replace_counters(&self, counters: FxHashMap<String, i64>) -> Result<(), Error> {
        match self {
            Storage::Memory(store) => store.replace_counters(counters).await,
            Storage::File(store) => store.replace_counters(counters).await,
            Storage::Postgres(store) => store.replace_counters(counters).await,
        }
    }

    async fn replace_all(&self, metrics: &[Metric]) -> Result<u64, Error> {
        match self {
            Storage::Memory(store) => store.replace_all(metrics).await,
            Storage::File(store) => store.replace_all(metrics).await,
            Storage::Postgres(store) => store.replace_all(metrics).await,
        }
    }

    async fn ping(&self) -> Result<(), Error> {
        match self {
            Storage::Memory(store) => store.ping().await,
            Storage::File(store) => store.ping().await,
            Storage::Postgres(store) => store.ping().await,
        }
    }
}

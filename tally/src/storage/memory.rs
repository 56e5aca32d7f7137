//! Volatile in-memory backend
//!
//! Two hash maps behind a [`std::sync::Mutex`]. The lock is never held
//! across an await point, every operation takes it, works on plain maps and
//! releases it before returning.

use std::sync::Mutex;

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tally_metric::{Kind, Metric, Snapshot};

use super::{Error, Repository};

#[derive(Debug, Default)]
struct State {
    gauges: FxHashMap<String, f64>,
    counters: FxHashMap<String, i64>,
}

#[derive(Debug, Default)]
/// Backend keeping all state in process memory.
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy out both populations as a [`Snapshot`] stamped with the current
    /// time.
    pub fn snapshot(&self) -> Snapshot {
        let state = self.state.lock().expect("metrics state lock poisoned");
        Snapshot::new(state.gauges.clone(), state.counters.clone())
    }

    /// Validate every entry of a candidate set before anything commits.
    /// Within one batch duplicate counters accumulate and duplicate gauges
    /// keep the last value, matching the relational backend's upserts.
    fn stage(metrics: &[Metric]) -> Result<State, Error> {
        let mut staged = State::default();
        for metric in metrics {
            match metric.kind {
                Kind::Gauge => {
                    let value = metric.gauge_value()?;
                    staged.gauges.insert(metric.id.clone(), value);
                }
                Kind::Counter => {
                    let delta = metric.counter_delta()?;
                    *staged.counters.entry(metric.id.clone()).or_insert(0) += delta;
                }
            }
        }
        Ok(staged)
    }
}

#[async_trait]
impl Repository for MemoryStore {
    async fn update_gauge(&self, name: &str, value: f64) -> Result<f64, Error> {
        let mut state = self.state.lock().expect("metrics state lock poisoned");
        state.gauges.insert(name.to_string(), value);
        Ok(value)
    }

    async fn update_counter(&self, name: &str, delta: i64) -> Result<i64, Error> {
        let mut state = self.state.lock().expect("metrics state lock poisoned");
        let total = state.counters.entry(name.to_string()).or_insert(0);
        *total += delta;
        Ok(*total)
    }

    async fn gauge(&self, name: &str) -> Result<Option<f64>, Error> {
        let state = self.state.lock().expect("metrics state lock poisoned");
        Ok(state.gauges.get(name).copied())
    }

    async fn counter(&self, name: &str) -> Result<Option<i64>, Error> {
        let state = self.state.lock().expect("metrics state lock poisoned");
        Ok(state.counters.get(name).copied())
    }

    async fn all_gauges(&self) -> Result<FxHashMap<String, f64>, Error> {
        let state = self.state.lock().expect("metrics state lock poisoned");
        Ok(state.gauges.clone())
    }

    async fn all_counters(&self) -> Result<FxHashMap<String, i64>, Error> {
        let state = self.state.lock().expect("metrics state lock poisoned");
        Ok(state.counters.clone())
    }

    async fn gauge_count(&self) -> Result<usize, Error> {
        let state = self.state.lock().expect("metrics state lock poisoned");
        Ok(state.gauges.len())
    }

    async fn counter_count(&self) -> Result<usize, Error> {
        let state = self.state.lock().expect("metrics state lock poisoned");
        Ok(state.counters.len())
    }

    async fn replace_gauges(&self, gauges: FxHashMap<String, f64>) -> Result<(), Error> {
        let mut state = self.state.lock().expect("metrics state lock poisoned");
        state.gauges = gauges;
        Ok(())
    }

    async fn replace_counters(&self, counters: FxHashMap<String, i64>) -> Result<(), Error> {
        let mut state = self.state.lock().expect("metrics state lock poisoned");
        state.counters = counters;
        Ok(())
    }

    async fn replace_all(&self, metrics: &[Metric]) -> Result<u64, Error> {
        let staged = Self::stage(metrics)?;
        let mut state = self.state.lock().expect("metrics state lock poisoned");
        *state = staged;
        Ok(metrics.len() as u64)
    }

    async fn ping(&self) -> Result<(), Error> {
        Ok(())
    }
}

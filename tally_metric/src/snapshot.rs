//! Full-state export of the metric store
//!
//! A [`Snapshot`] is the unit of file persistence and bulk reload: the whole
//! gauge and counter population captured at one instant, stamped with the
//! capture time.

use chrono::Utc;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::metric::Metric;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
/// A point-in-time export of every stored metric.
pub struct Snapshot {
    /// All gauges, name to current value.
    #[serde(rename = "Gauge")]
    pub gauges: FxHashMap<String, f64>,
    /// All counters, name to accumulated total.
    #[serde(rename = "Counter")]
    pub counters: FxHashMap<String, i64>,
    /// RFC 3339 capture time.
    #[serde(rename = "Date")]
    pub date: String,
}

impl Snapshot {
    /// Capture a snapshot of the given maps, stamped now.
    #[must_use]
    pub fn new(gauges: FxHashMap<String, f64>, counters: FxHashMap<String, i64>) -> Self {
        Self {
            gauges,
            counters,
            date: Utc::now().to_rfc3339(),
        }
    }

    /// An empty snapshot, stamped now.
    #[must_use]
    pub fn empty() -> Self {
        Self::new(FxHashMap::default(), FxHashMap::default())
    }

    /// Total number of metrics across both kinds.
    #[must_use]
    pub fn len(&self) -> usize {
        self.gauges.len() + self.counters.len()
    }

    /// True if no metric of either kind is present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.gauges.is_empty() && self.counters.is_empty()
    }

    /// Project the snapshot into wire metrics, gauges first.
    #[must_use]
    pub fn metrics(&self) -> Vec<Metric> {
        let mut out = Vec::with_capacity(self.len());
        for (id, value) in &self.gauges {
            out.push(Metric::gauge(id.clone(), *value));
        }
        for (id, delta) in &self.counters {
            out.push(Metric::counter(id.clone(), *delta));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::Kind;

    #[test]
    fn serialized_form_uses_exported_keys() {
        let mut gauges = FxHashMap::default();
        gauges.insert("Alloc".to_string(), 6_649_272.0);
        let mut counters = FxHashMap::default();
        counters.insert("PollCount".to_string(), 2);

        let snapshot = Snapshot::new(gauges, counters);
        let json = serde_json::to_string(&snapshot).expect("serialization should succeed");
        assert!(json.contains("\"Gauge\""));
        assert!(json.contains("\"Counter\""));
        assert!(json.contains("\"Date\""));

        let back: Snapshot = serde_json::from_str(&json).expect("deserialization should succeed");
        assert_eq!(back, snapshot);
    }

    #[test]
    fn projection_covers_both_kinds() {
        let mut gauges = FxHashMap::default();
        gauges.insert("mem_free".to_string(), 1024.0);
        gauges.insert("mem_total".to_string(), 4096.0);
        let mut counters = FxHashMap::default();
        counters.insert("poll_count".to_string(), 7);

        let snapshot = Snapshot::new(gauges, counters);
        let metrics = snapshot.metrics();
        assert_eq!(metrics.len(), 3);
        assert_eq!(
            metrics.iter().filter(|m| m.kind == Kind::Gauge).count(),
            2
        );
        let poll = metrics
            .iter()
            .find(|m| m.id == "poll_count")
            .expect("counter present");
        assert_eq!(poll.counter_delta().expect("delta"), 7);
    }

    #[test]
    fn empty_snapshot_is_empty() {
        let snapshot = Snapshot::empty();
        assert!(snapshot.is_empty());
        assert_eq!(snapshot.len(), 0);
        assert!(snapshot.metrics().is_empty());
    }
}

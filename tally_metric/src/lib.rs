//! Shared metric model for the tally agent and server.
//!
//! Everything that crosses a process boundary lives here: the metric kinds,
//! the transport-neutral wire projection, the full-state snapshot used for
//! file persistence and bulk reload, and the protobuf schema for the gRPC
//! binding.

#![deny(clippy::all)]
#![deny(clippy::cargo)]
#![deny(clippy::perf)]
#![deny(clippy::suspicious)]
#![deny(clippy::complexity)]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]

pub mod metric;
pub mod snapshot;

pub use metric::{Kind, Metric, ValidationError};
pub use snapshot::Snapshot;

#[allow(missing_docs)]
#[allow(clippy::derive_partial_eq_without_eq)]
/// Structs generated from `proto/tally/v1/metrics.proto`.
pub mod proto {
    tonic::include_proto!("tally.v1");
}

impl TryFrom<proto::Metric> for Metric {
    type Error = ValidationError;

    fn try_from(pb: proto::Metric) -> Result<Self, Self::Error> {
        let kind: Kind = pb.kind.parse()?;
        let metric = match kind {
            Kind::Counter => Metric::counter(pb.id, pb.delta),
            Kind::Gauge => Metric::gauge(pb.id, pb.value),
        };
        Ok(metric)
    }
}

impl From<&Metric> for proto::Metric {
    fn from(metric: &Metric) -> Self {
        proto::Metric {
            id: metric.id.clone(),
            kind: metric.kind.to_string(),
            delta: metric.delta.unwrap_or_default(),
            value: metric.value.unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proto_round_trip_preserves_kind_and_value() {
        let counter = Metric::counter("poll_count", 3);
        let pb: proto::Metric = (&counter).into();
        assert_eq!(pb.kind, "counter");
        let back = Metric::try_from(pb).expect("valid proto metric");
        assert_eq!(back, counter);

        let gauge = Metric::gauge("mem_free", 1024.5);
        let pb: proto::Metric = (&gauge).into();
        assert_eq!(pb.kind, "gauge");
        let back = Metric::try_from(pb).expect("valid proto metric");
        assert_eq!(back, gauge);
    }

    #[test]
    fn proto_with_unknown_kind_is_rejected() {
        let pb = proto::Metric {
            id: "x".to_string(),
            kind: "histogram".to_string(),
            delta: 0,
            value: 0.0,
        };
        assert!(Metric::try_from(pb).is_err());
    }
}

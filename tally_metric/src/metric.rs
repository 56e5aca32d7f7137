//! Canonical representation of a single metric update
//!
//! This module defines the core data structures for one metric observation
//! as it travels from agent to server. The structures are format-agnostic
//! and shared by the JSON and protobuf transports.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
/// The kinds of metrics carried by a [`Metric`].
pub enum Kind {
    /// An additive signed integer. Updates accumulate.
    Counter,
    /// A point-at-time float. Updates replace.
    Gauge,
}

impl Kind {
    /// The wire spelling of this kind.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Kind::Counter => "counter",
            Kind::Gauge => "gauge",
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Kind {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "counter" => Ok(Kind::Counter),
            "gauge" => Ok(Kind::Gauge),
            other => Err(ValidationError::UnknownKind(other.to_string())),
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
/// Errors produced by functions in this module
pub enum ValidationError {
    /// Metric kind is neither `counter` nor `gauge`
    #[error("unknown metric kind: {0}")]
    UnknownKind(String),
    /// Counter update arrived without a delta
    #[error("counter {0} carries no delta")]
    MissingDelta(String),
    /// Gauge update arrived without a value
    #[error("gauge {0} carries no value")]
    MissingValue(String),
    /// Numeric payload could not be parsed from its text form
    #[error("unparsable {kind} value: {raw}")]
    BadNumber {
        /// The kind the value was declared as.
        kind: Kind,
        /// The raw text that failed to parse.
        raw: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
/// The transport-neutral projection of one metric update.
///
/// Exactly one of `delta`/`value` is meaningful for a given `kind`; the
/// other is absent on the wire. Deserialization is deliberately loose,
/// [`Metric::counter_delta`] and [`Metric::gauge_value`] enforce the pairing
/// at the point of use.
pub struct Metric {
    /// The name of the metric.
    pub id: String,
    #[serde(rename = "type")]
    /// The kind of the metric, `counter` or `gauge` on the wire.
    pub kind: Kind,
    /// Additive step for counters.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delta: Option<i64>,
    /// Replacement value for gauges.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
}

impl Metric {
    /// Construct a counter update.
    #[must_use]
    pub fn counter<S: Into<String>>(id: S, delta: i64) -> Self {
        Self {
            id: id.into(),
            kind: Kind::Counter,
            delta: Some(delta),
            value: None,
        }
    }

    /// Construct a gauge update.
    #[must_use]
    pub fn gauge<S: Into<String>>(id: S, value: f64) -> Self {
        Self {
            id: id.into(),
            kind: Kind::Gauge,
            delta: None,
            value: Some(value),
        }
    }

    /// Construct a metric from the path-style text form, `kind`, `id` and a
    /// raw numeric string.
    ///
    /// # Errors
    ///
    /// Function will error if `kind` is unknown or `raw` does not parse as
    /// the numeric type `kind` demands.
    pub fn from_text(kind: &str, id: &str, raw: &str) -> Result<Self, ValidationError> {
        let kind: Kind = kind.parse()?;
        match kind {
            Kind::Counter => {
                let delta: i64 = raw.parse().map_err(|_| ValidationError::BadNumber {
                    kind,
                    raw: raw.to_string(),
                })?;
                Ok(Metric::counter(id, delta))
            }
            Kind::Gauge => {
                let value: f64 = raw.parse().map_err(|_| ValidationError::BadNumber {
                    kind,
                    raw: raw.to_string(),
                })?;
                Ok(Metric::gauge(id, value))
            }
        }
    }

    /// The delta carried by a counter update.
    ///
    /// # Errors
    ///
    /// Function will error if the metric is not a counter or carries no
    /// delta.
    pub fn counter_delta(&self) -> Result<i64, ValidationError> {
        if self.kind != Kind::Counter {
            return Err(ValidationError::MissingDelta(self.id.clone()));
        }
        self.delta
            .ok_or_else(|| ValidationError::MissingDelta(self.id.clone()))
    }

    /// The value carried by a gauge update.
    ///
    /// # Errors
    ///
    /// Function will error if the metric is not a gauge or carries no value.
    pub fn gauge_value(&self) -> Result<f64, ValidationError> {
        if self.kind != Kind::Gauge {
            return Err(ValidationError::MissingValue(self.id.clone()));
        }
        self.value
            .ok_or_else(|| ValidationError::MissingValue(self.id.clone()))
    }

    /// The stored value rendered as the bare text form returned by value
    /// lookups, shortest decimal representation for gauges.
    ///
    /// # Errors
    ///
    /// Function will error if the required numeric field for the kind is
    /// absent.
    pub fn render_value(&self) -> Result<String, ValidationError> {
        match self.kind {
            Kind::Counter => Ok(self.counter_delta()?.to_string()),
            Kind::Gauge => Ok(self.gauge_value()?.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::relative_eq;
    use proptest::prelude::*;

    #[test]
    fn wire_form_uses_type_key_and_omits_absent_field() {
        let counter = Metric::counter("PollCount", 2);
        let json = serde_json::to_string(&counter).expect("serialization should succeed");
        assert!(json.contains("\"type\":\"counter\""));
        assert!(json.contains("\"delta\":2"));
        assert!(!json.contains("value"));

        let gauge = Metric::gauge("Alloc", 6_649_272.0);
        let json = serde_json::to_string(&gauge).expect("serialization should succeed");
        assert!(json.contains("\"type\":\"gauge\""));
        assert!(json.contains("\"value\":6649272"));
        assert!(!json.contains("delta"));
    }

    #[test]
    fn text_form_parses_by_declared_kind() {
        let metric = Metric::from_text("gauge", "someMetric", "1.1").expect("valid gauge");
        assert_eq!(metric.gauge_value().expect("gauge value"), 1.1);

        let metric = Metric::from_text("counter", "hits", "-3").expect("valid counter");
        assert_eq!(metric.counter_delta().expect("counter delta"), -3);

        assert!(matches!(
            Metric::from_text("histogram", "x", "1"),
            Err(ValidationError::UnknownKind(_))
        ));
        assert!(matches!(
            Metric::from_text("gauge", "someMetric", "bad"),
            Err(ValidationError::BadNumber { .. })
        ));
        // Counters are integers, a float delta does not parse.
        assert!(matches!(
            Metric::from_text("counter", "hits", "1.5"),
            Err(ValidationError::BadNumber { .. })
        ));
    }

    #[test]
    fn mismatched_payload_is_rejected_at_access() {
        let loose: Metric =
            serde_json::from_str(r#"{"id":"x","type":"counter"}"#).expect("loose wire form");
        assert!(matches!(
            loose.counter_delta(),
            Err(ValidationError::MissingDelta(_))
        ));

        let crossed: Metric = serde_json::from_str(r#"{"id":"x","type":"gauge","delta":1}"#)
            .expect("loose wire form");
        assert!(matches!(
            crossed.gauge_value(),
            Err(ValidationError::MissingValue(_))
        ));
    }

    #[test]
    fn gauge_renders_shortest_decimal() {
        let metric = Metric::gauge("Alloc", 6_649_272.0);
        assert_eq!(metric.render_value().expect("render"), "6649272");
        let metric = Metric::gauge("someMetric", 1.1);
        assert_eq!(metric.render_value().expect("render"), "1.1");
    }

    proptest! {
        #[test]
        fn serialize_deserialize_isomorphism(
            id in "[A-Za-z][A-Za-z0-9_]*",
            counter_delta in any::<i64>(),
            gauge_value in any::<f64>().prop_filter("must be finite", |f| f.is_finite()),
            kind in prop_oneof![Just(Kind::Counter), Just(Kind::Gauge)],
        ) {
            let metric = match kind {
                Kind::Counter => Metric::counter(id, counter_delta),
                Kind::Gauge => Metric::gauge(id, gauge_value),
            };

            let serialized = serde_json::to_string(&metric)
                .expect("serialization should succeed");
            let deserialized: Metric = serde_json::from_str(&serialized)
                .expect("deserialization should succeed");

            prop_assert_eq!(&metric.id, &deserialized.id);
            prop_assert_eq!(metric.kind, deserialized.kind);
            match kind {
                Kind::Counter => prop_assert_eq!(metric.delta, deserialized.delta),
                Kind::Gauge => {
                    let (a, b) = (metric.value.expect("gauge value"), deserialized.value.expect("gauge value"));
                    // JSON's decimal representation can shave precision off
                    // extreme floats. Compare relatively, tolerance chosen for
                    // f64 binary<->decimal conversion.
                    prop_assert!(relative_eq!(a, b, max_relative = 1e-12),
                        "floats not approximately equal: {a} vs {b}");
                }
            }
        }
    }
}

//! Metrics and metric frames.
//!
//! An input fire produces raw records; the frame builder projects them
//! into a [`MetricFrame`] of [`Metric`]s sharing one timestamp and a
//! task-derived name prefix. Transforms mutate metrics in place; outputs
//! only ever see a shared reference.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Attribute key carrying the flattened record path a metric value was
/// projected from.
pub const METRIC_FIELD_NAME: &str = "metric_field_name";

/// A single metric measurement.
///
/// The value is absent only for tasks that explicitly select no metric
/// fields (`metrics: null` with `allow_none_metric` enabled).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl MetricValue {
    /// Convert a JSON scalar into a metric value, rejecting kinds that
    /// are not permitted as measurements (strings, arrays, maps, null).
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Some(Self::Int(i))
                } else {
                    n.as_f64().map(Self::Float)
                }
            }
            Value::Bool(b) => Some(Self::Bool(*b)),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            Self::Bool(_) => None,
        }
    }
}

impl std::fmt::Display for MetricValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::Bool(b) => write!(f, "{b}"),
        }
    }
}

/// One named value with its attribute map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    /// Task name suffixed with the leaf of the metric field path.
    pub name: String,
    pub value: Option<MetricValue>,
    /// Scalar attributes; ordered for deterministic output.
    pub attributes: BTreeMap<String, Value>,
}

impl Metric {
    pub fn new(name: impl Into<String>, value: Option<MetricValue>) -> Self {
        Self {
            name: name.into(),
            value,
            attributes: BTreeMap::new(),
        }
    }

    /// The flattened record path this metric was projected from, if any.
    pub fn field_name(&self) -> Option<&str> {
        self.attributes.get(METRIC_FIELD_NAME).and_then(Value::as_str)
    }
}

/// An ordered group of metrics sharing a timestamp and task name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricFrame {
    task: String,
    timestamp: DateTime<Utc>,
    metrics: Vec<Metric>,
}

impl MetricFrame {
    pub fn new(task: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            task: task.into(),
            timestamp,
            metrics: Vec::new(),
        }
    }

    /// Name of the task that produced this frame.
    pub fn task_name(&self) -> &str {
        &self.task
    }

    /// The shared timestamp, after modifier application.
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn set_timestamp(&mut self, ts: DateTime<Utc>) {
        self.timestamp = ts;
    }

    pub fn push(&mut self, metric: Metric) {
        self.metrics.push(metric);
    }

    pub fn metrics(&self) -> &[Metric] {
        &self.metrics
    }

    /// Mutable access for transforms. The slice is fixed-length: a
    /// transform may reshape metrics but never add or remove them.
    pub fn metrics_mut(&mut self) -> &mut [Metric] {
        &mut self.metrics
    }

    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Metric> {
        self.metrics.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ts() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    #[test]
    fn metric_value_from_json_scalars() {
        assert_eq!(MetricValue::from_json(&json!(4)), Some(MetricValue::Int(4)));
        assert_eq!(
            MetricValue::from_json(&json!(2.5)),
            Some(MetricValue::Float(2.5))
        );
        assert_eq!(
            MetricValue::from_json(&json!(true)),
            Some(MetricValue::Bool(true))
        );
    }

    #[test]
    fn metric_value_rejects_non_scalars() {
        assert_eq!(MetricValue::from_json(&json!("text")), None);
        assert_eq!(MetricValue::from_json(&json!([1, 2])), None);
        assert_eq!(MetricValue::from_json(&json!({"a": 1})), None);
        assert_eq!(MetricValue::from_json(&Value::Null), None);
    }

    #[test]
    fn frame_shares_timestamp_and_task() {
        let mut frame = MetricFrame::new("db_rows", ts());
        frame.push(Metric::new("db_rows_count", Some(MetricValue::Int(10))));
        frame.push(Metric::new("db_rows_size", Some(MetricValue::Int(20))));

        assert_eq!(frame.len(), 2);
        assert_eq!(frame.task_name(), "db_rows");
        assert_eq!(frame.timestamp(), ts());
    }

    #[test]
    fn field_name_reads_attribute() {
        let mut m = Metric::new("t_a", Some(MetricValue::Int(1)));
        m.attributes
            .insert(METRIC_FIELD_NAME.into(), json!("_source.a"));
        assert_eq!(m.field_name(), Some("_source.a"));
    }

    #[test]
    fn metric_roundtrips_through_json() {
        let mut m = Metric::new("t_a", Some(MetricValue::Float(1.5)));
        m.attributes.insert("host".into(), json!("db01"));
        let encoded = serde_json::to_string(&m).unwrap();
        let back: Metric = serde_json::from_str(&encoded).unwrap();
        assert_eq!(m, back);
    }
}

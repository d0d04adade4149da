//! Shared data model for the Streamlet pipeline engine.

pub mod duration;
pub mod error;
pub mod metric;

pub use duration::{parse_seconds, seconds_from_value};
pub use error::{FireError, FlowError};
pub use metric::{Metric, MetricFrame, MetricValue, METRIC_FIELD_NAME};

/// A raw record produced by an input: a string-keyed map of JSON values.
pub type Record = serde_json::Map<String, serde_json::Value>;

/// The result of one input invocation: one record or several.
#[derive(Debug, Clone)]
pub enum Records {
    One(Record),
    Many(Vec<Record>),
}

impl Records {
    /// Iterate over the contained records in order.
    pub fn iter(&self) -> impl Iterator<Item = &Record> {
        match self {
            Self::One(r) => std::slice::from_ref(r).iter(),
            Self::Many(rs) => rs.iter(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::One(_) => 1,
            Self::Many(rs) => rs.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Many(rs) if rs.is_empty())
    }
}

impl From<Record> for Records {
    fn from(r: Record) -> Self {
        Self::One(r)
    }
}

impl From<Vec<Record>> for Records {
    fn from(rs: Vec<Record>) -> Self {
        Self::Many(rs)
    }
}

//! Frame building: projecting raw records into metric frames.
//!
//! Records are flattened on the configured separator, the task's
//! metric and attribute selectors are expanded over the flattened
//! keys, and one metric is emitted per resolved metric field. All
//! metrics of a frame share the fire timestamp after modifier
//! application.

use chrono::{DateTime, Utc};
use serde_json::Value;

use streamlet_types::error::FireError;
use streamlet_types::{Metric, MetricFrame, MetricValue, Record, Records, METRIC_FIELD_NAME};

use crate::config::model::{Modifiers, TaskConfig};
use crate::glob;

/// Frame-builder knobs resolved from settings.
#[derive(Debug, Clone)]
pub struct FrameOptions {
    pub separator: String,
    pub allow_none_metric: bool,
}

impl Default for FrameOptions {
    fn default() -> Self {
        Self {
            separator: ".".to_string(),
            allow_none_metric: false,
        }
    }
}

/// Apply `time_modulus` (floor to the nearest multiple from epoch),
/// then `time_offset` (signed add).
pub fn apply_modifiers(base: DateTime<Utc>, modifiers: &Modifiers) -> DateTime<Utc> {
    let mut millis = base.timestamp_millis();

    let modulus = (modifiers.time_modulus * 1000.0).round() as i64;
    if modulus > 0 {
        millis -= millis.rem_euclid(modulus);
    }
    millis += (modifiers.time_offset * 1000.0).round() as i64;

    DateTime::from_timestamp_millis(millis).unwrap_or(base)
}

/// Build the frame for one fire of a task.
pub fn build_frame(
    task: &TaskConfig,
    records: &Records,
    fired_at: DateTime<Utc>,
    opts: &FrameOptions,
) -> Result<MetricFrame, FireError> {
    let timestamp = apply_modifiers(fired_at, &task.modifiers);
    let mut frame = MetricFrame::new(&task.name, timestamp);

    for record in records.iter() {
        project_record(task, record, opts, &mut frame)?;
    }

    Ok(frame)
}

/// Flatten nested maps and lists into dotted leaf paths.
fn flatten(record: &Record, sep: &str) -> Vec<(String, Value)> {
    fn walk(prefix: &str, value: &Value, sep: &str, out: &mut Vec<(String, Value)>) {
        match value {
            Value::Object(map) => {
                for (key, child) in map {
                    let path = if prefix.is_empty() {
                        key.clone()
                    } else {
                        format!("{prefix}{sep}{key}")
                    };
                    walk(&path, child, sep, out);
                }
            }
            Value::Array(items) => {
                for (index, child) in items.iter().enumerate() {
                    let path = if prefix.is_empty() {
                        index.to_string()
                    } else {
                        format!("{prefix}{sep}{index}")
                    };
                    walk(&path, child, sep, out);
                }
            }
            leaf => out.push((prefix.to_string(), leaf.clone())),
        }
    }

    let mut out = Vec::new();
    walk("", &Value::Object(record.clone()), sep, &mut out);
    out
}

/// Expand one selector entry over the remaining keys, removing every
/// match so later patterns cannot claim it again.
fn drain_matches(selector: &str, remaining: &mut Vec<(String, Value)>) -> Vec<(String, Value)> {
    if glob::is_pattern(selector) {
        let mut matched = Vec::new();
        let mut index = 0;
        while index < remaining.len() {
            if glob::glob_match(selector, &remaining[index].0) {
                matched.push(remaining.remove(index));
            } else {
                index += 1;
            }
        }
        matched
    } else {
        match remaining.iter().position(|(key, _)| key == selector) {
            Some(index) => vec![remaining.remove(index)],
            None => Vec::new(),
        }
    }
}

fn project_record(
    task: &TaskConfig,
    record: &Record,
    opts: &FrameOptions,
    frame: &mut MetricFrame,
) -> Result<(), FireError> {
    let sep = opts.separator.as_str();
    let mut remaining = flatten(record, sep);

    let metric_entries: Vec<(String, Value)> = match &task.result.metrics {
        Some(selectors) => selectors
            .iter()
            .flat_map(|sel| drain_matches(sel, &mut remaining))
            .collect(),
        // Explicit `metrics: null`: everything becomes attributes.
        None => Vec::new(),
    };

    let attributes: Vec<(String, Value)> = match &task.result.attributes {
        None => remaining,
        Some(selectors) => selectors
            .iter()
            .flat_map(|sel| drain_matches(sel, &mut remaining))
            .collect(),
    };

    if metric_entries.is_empty() {
        if !opts.allow_none_metric {
            return Err(FireError::FrameBuild {
                task: task.name.clone(),
                path: task
                    .result
                    .metrics
                    .as_ref()
                    .map(|s| s.join(","))
                    .unwrap_or_else(|| "null".to_string()),
                message: "no metric fields selected and value-less metrics are not allowed \
                          (see `allow_none_metric`)"
                    .to_string(),
            });
        }

        let mut metric = Metric::new(&task.name, None);
        fill_attributes(&mut metric, &attributes, task);
        frame.push(metric);
        return Ok(());
    }

    for (path, value) in &metric_entries {
        let Some(metric_value) = MetricValue::from_json(value) else {
            return Err(FireError::FrameBuild {
                task: task.name.clone(),
                path: path.clone(),
                message: format!(
                    "metric field must be an integer, float or bool, got `{value}`"
                ),
            });
        };

        let leaf = path.rsplit(sep).next().unwrap_or(path);
        let mut metric = Metric::new(format!("{}_{}", task.name, leaf), Some(metric_value));
        fill_attributes(&mut metric, &attributes, task);
        metric
            .attributes
            .insert(METRIC_FIELD_NAME.to_string(), Value::String(path.clone()));
        frame.push(metric);
    }

    Ok(())
}

/// Record-derived attributes first, then static attributes (static wins
/// on key collisions).
fn fill_attributes(metric: &mut Metric, attributes: &[(String, Value)], task: &TaskConfig) {
    for (key, value) in attributes {
        metric.attributes.insert(key.clone(), value.clone());
    }
    for (key, value) in &task.static_attributes {
        metric.attributes.insert(key.clone(), value.clone());
    }
}

//! Built-in modules.
//!
//! These cover wiring checks, local development, and the test suite.
//! Production connectors (databases, search indexes, HTTP endpoints,
//! message brokers) live outside the engine and register themselves the
//! same way.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock, Mutex};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde_json::Value;

use streamlet_types::error::TransformError;
use streamlet_types::{Metric, MetricFrame, MetricValue, Record, Records};

use crate::modules::{Input, Lifecycle, Output, Transform};
use crate::registry::{ModuleCtx, ModuleHandle, ModuleKind, ModuleSpec, Registry};
use crate::schema::{Field, Schema};

/// Register every built-in module type.
pub fn register(registry: &mut Registry) -> Result<()> {
    registry.register(
        "static",
        ModuleSpec::new(ModuleKind::Input, |_ctx| {
            Ok(ModuleHandle::Input(Arc::new(StaticInput)))
        })
        .with_params_schema(Schema::Map(vec![Field::optional(
            "payload",
            Schema::Any,
            Value::Null,
        )])),
    )?;

    registry.register(
        "scale",
        ModuleSpec::new(ModuleKind::Transform, |ctx| {
            let module = ScaleTransform::from_params(&ctx.params)?;
            Ok(ModuleHandle::Transform(Arc::new(module)))
        })
        .with_params_schema(Schema::Map(vec![Field::required("factor", Schema::Float)])),
    )?;

    registry.register(
        "log",
        ModuleSpec::new(ModuleKind::Output, |ctx| {
            Ok(ModuleHandle::Output(Arc::new(LogOutput { name: ctx.name })))
        }),
    )?;

    registry.register(
        "memory",
        ModuleSpec::new(ModuleKind::Output, |ctx| {
            Ok(ModuleHandle::Output(Arc::new(MemoryOutput {
                name: ctx.name,
            })))
        }),
    )?;

    Ok(())
}

// ---------------------------------------------------------------------------
// static — input returning its configured payload
// ---------------------------------------------------------------------------

/// Input that yields the record(s) configured under the task parameter
/// `payload` (one map, or a list of maps).
pub struct StaticInput;

#[async_trait]
impl Lifecycle for StaticInput {}

#[async_trait]
impl Input for StaticInput {
    async fn fetch(&self, params: &Record) -> Result<Records> {
        match params.get("payload") {
            None | Some(Value::Null) => Ok(Records::Many(Vec::new())),
            Some(Value::Object(obj)) => Ok(Records::One(obj.clone())),
            Some(Value::Array(items)) => {
                let mut records = Vec::with_capacity(items.len());
                for (i, item) in items.iter().enumerate() {
                    match item {
                        Value::Object(obj) => records.push(obj.clone()),
                        other => bail!("payload[{i}] is not a map: {other}"),
                    }
                }
                Ok(Records::Many(records))
            }
            Some(other) => bail!("payload must be a map or a list of maps, got {other}"),
        }
    }
}

// ---------------------------------------------------------------------------
// scale — transform multiplying numeric metric values
// ---------------------------------------------------------------------------

/// Transform multiplying every numeric metric value by `factor`.
/// Booleans and value-less metrics pass through untouched.
pub struct ScaleTransform {
    factor: f64,
}

impl ScaleTransform {
    fn from_params(params: &Record) -> Result<Self> {
        let factor = params
            .get("factor")
            .and_then(Value::as_f64)
            .context("scale transform requires a numeric `factor` parameter")?;
        Ok(Self { factor })
    }

    fn scaled(&self, value: MetricValue) -> MetricValue {
        match value {
            MetricValue::Int(i) if self.factor.fract() == 0.0 => {
                MetricValue::Int(i * self.factor as i64)
            }
            MetricValue::Int(i) => MetricValue::Float(i as f64 * self.factor),
            MetricValue::Float(f) => MetricValue::Float(f * self.factor),
            MetricValue::Bool(b) => MetricValue::Bool(b),
        }
    }
}

#[async_trait]
impl Lifecycle for ScaleTransform {}

#[async_trait]
impl Transform for ScaleTransform {
    async fn apply(&self, frame: &mut MetricFrame) -> Result<(), TransformError> {
        for metric in frame.metrics_mut() {
            if let Some(value) = metric.value {
                metric.value = Some(self.scaled(value));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// log — output writing frames to the log
// ---------------------------------------------------------------------------

/// Output that logs one line per frame.
pub struct LogOutput {
    name: String,
}

#[async_trait]
impl Lifecycle for LogOutput {}

#[async_trait]
impl Output for LogOutput {
    async fn emit(&self, frame: &MetricFrame) -> Result<()> {
        tracing::info!(
            output = self.name,
            task = frame.task_name(),
            metrics = frame.len(),
            timestamp = %frame.timestamp(),
            "Emitting frame"
        );
        for metric in frame.iter() {
            tracing::debug!(
                output = self.name,
                name = metric.name,
                value = metric.value.map(|v| v.to_string()).as_deref().unwrap_or("-"),
                "metric"
            );
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// memory — output collecting frames for inspection
// ---------------------------------------------------------------------------

static SINKS: LazyLock<Mutex<HashMap<String, Vec<MetricFrame>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// Output appending frames to a process-wide sink, keyed by module
/// name. Integration tests and local dry runs read them back with
/// [`MemoryOutput::take`].
pub struct MemoryOutput {
    name: String,
}

impl MemoryOutput {
    /// Drain every frame collected under the given module name.
    pub fn take(name: &str) -> Vec<MetricFrame> {
        SINKS
            .lock()
            .expect("memory sink lock")
            .remove(name)
            .unwrap_or_default()
    }

    /// Snapshot of the frames collected under the given module name.
    pub fn frames(name: &str) -> Vec<MetricFrame> {
        SINKS
            .lock()
            .expect("memory sink lock")
            .get(name)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl Lifecycle for MemoryOutput {}

#[async_trait]
impl Output for MemoryOutput {
    async fn emit(&self, frame: &MetricFrame) -> Result<()> {
        SINKS
            .lock()
            .expect("memory sink lock")
            .entry(self.name.clone())
            .or_default()
            .push(frame.clone());
        Ok(())
    }
}

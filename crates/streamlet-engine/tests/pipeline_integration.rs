//! End-to-end flows through the public engine API: configuration in,
//! frames out of a memory sink.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::bail;
use async_trait::async_trait;
use serde_json::{json, Value};
use tempfile::TempDir;

use streamlet_engine::modules::builtin::MemoryOutput;
use streamlet_engine::modules::{Input, Lifecycle, Output, Transform};
use streamlet_engine::registry::{ModuleHandle, ModuleKind, ModuleSpec};
use streamlet_engine::{Flow, Registry, Settings};
use streamlet_types::error::TransformError;
use streamlet_types::{FlowError, MetricFrame, MetricValue, Record, Records};

fn write_config(dir: &TempDir, name: &str, contents: &str) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, contents).unwrap();
    path
}

/// Settings for a one-shot serial run of the given configuration.
fn one_shot_settings(path: &Path, extra: &[(&'static str, Value)]) -> Settings {
    let mut settings = Settings::new();
    let mut pairs = vec![
        ("config", json!([path.to_string_lossy()])),
        ("run_once", json!(true)),
        ("pool", json!("serial")),
    ];
    pairs.extend(extra.iter().cloned());
    settings.apply_cli(pairs).unwrap();
    settings
}

// ---------------------------------------------------------------------------
// Test modules
// ---------------------------------------------------------------------------

/// Input that fails until `succeed_after` attempts have happened,
/// recording the instant of every attempt.
struct FlakyInput {
    attempts: Arc<Mutex<Vec<Instant>>>,
    succeed_after: usize,
}

#[async_trait]
impl Lifecycle for FlakyInput {}

#[async_trait]
impl Input for FlakyInput {
    async fn fetch(&self, _params: &Record) -> anyhow::Result<Records> {
        let attempt = {
            let mut attempts = self.attempts.lock().unwrap();
            attempts.push(Instant::now());
            attempts.len()
        };
        if attempt > self.succeed_after {
            let mut record = Record::new();
            record.insert("metric".to_string(), json!(1));
            Ok(Records::One(record))
        } else {
            bail!("upstream unavailable")
        }
    }
}

fn register_flaky(
    registry: &mut Registry,
    succeed_after: usize,
) -> Arc<Mutex<Vec<Instant>>> {
    let attempts = Arc::new(Mutex::new(Vec::new()));
    let handle = attempts.clone();
    registry
        .register(
            "flaky",
            ModuleSpec::new(ModuleKind::Input, move |_ctx| {
                Ok(ModuleHandle::Input(Arc::new(FlakyInput {
                    attempts: handle.clone(),
                    succeed_after,
                })))
            }),
        )
        .unwrap();
    attempts
}

/// Transform failing with a configurable severity.
struct FailingTransform {
    terminal: bool,
}

#[async_trait]
impl Lifecycle for FailingTransform {}

#[async_trait]
impl Transform for FailingTransform {
    async fn apply(&self, _frame: &mut MetricFrame) -> Result<(), TransformError> {
        if self.terminal {
            Err(TransformError::terminal(anyhow::anyhow!("cannot continue")))
        } else {
            Err(TransformError::soft(anyhow::anyhow!("stage hiccup")))
        }
    }
}

fn register_failing_transform(registry: &mut Registry, type_name: &str, terminal: bool) {
    registry
        .register(
            type_name,
            ModuleSpec::new(ModuleKind::Transform, move |_ctx| {
                Ok(ModuleHandle::Transform(Arc::new(FailingTransform {
                    terminal,
                })))
            }),
        )
        .unwrap();
}

/// Module recording lifecycle hook invocations.
struct Probe {
    label: String,
    events: Arc<Mutex<Vec<String>>>,
    fail_connect: bool,
}

impl Probe {
    fn record(&self, hook: &str) {
        self.events
            .lock()
            .unwrap()
            .push(format!("{}:{}", self.label, hook));
    }
}

#[async_trait]
impl Lifecycle for Probe {
    async fn on_connect(&self) -> anyhow::Result<()> {
        self.record("connect");
        if self.fail_connect {
            bail!("refusing to connect")
        }
        Ok(())
    }

    async fn on_pre_shutdown(&self) -> anyhow::Result<()> {
        self.record("pre_shutdown");
        Ok(())
    }

    async fn on_shutdown(&self) -> anyhow::Result<()> {
        self.record("shutdown");
        Ok(())
    }
}

#[async_trait]
impl Input for Probe {
    async fn fetch(&self, _params: &Record) -> anyhow::Result<Records> {
        Ok(Records::Many(Vec::new()))
    }
}

#[async_trait]
impl Output for Probe {
    async fn emit(&self, _frame: &MetricFrame) -> anyhow::Result<()> {
        Ok(())
    }
}

fn register_probes(
    registry: &mut Registry,
    fail_connect: bool,
) -> Arc<Mutex<Vec<String>>> {
    let events = Arc::new(Mutex::new(Vec::new()));

    let input_events = events.clone();
    registry
        .register(
            "probe_in",
            ModuleSpec::new(ModuleKind::Input, move |ctx| {
                Ok(ModuleHandle::Input(Arc::new(Probe {
                    label: ctx.name,
                    events: input_events.clone(),
                    fail_connect: false,
                })))
            }),
        )
        .unwrap();

    let output_events = events.clone();
    registry
        .register(
            "probe_out",
            ModuleSpec::new(ModuleKind::Output, move |ctx| {
                Ok(ModuleHandle::Output(Arc::new(Probe {
                    label: ctx.name,
                    events: output_events.clone(),
                    fail_connect,
                })))
            }),
        )
        .unwrap();

    events
}

// ---------------------------------------------------------------------------
// Validation scenarios
// ---------------------------------------------------------------------------

#[test]
fn typo_in_task_key_suggests_cron() {
    let dir = TempDir::new().unwrap();
    let path = write_config(
        &dir,
        "flow.yaml",
        r#"
flow:
  version: v1
input:
  - type: static
    name: src
    tasks:
      - name: t1
        cronn: "0 0 * * *"
output:
  - type: log
    name: sink
"#,
    );

    let err = Flow::build(one_shot_settings(&path, &[]), &Registry::builtin()).unwrap_err();
    match err {
        FlowError::ConfigInvalid {
            path, suggestion, ..
        } => {
            assert_eq!(path, "[input][0][tasks][0]");
            assert_eq!(suggestion.as_deref(), Some("cron"));
        }
        other => panic!("expected ConfigInvalid, got {other}"),
    }
}

#[test]
fn unknown_module_type_lists_known_types() {
    let dir = TempDir::new().unwrap();
    let path = write_config(
        &dir,
        "flow.yaml",
        r#"
flow:
  version: v1
input:
  - type: no_such_source
    tasks: []
"#,
    );

    let err = Flow::build(one_shot_settings(&path, &[]), &Registry::builtin()).unwrap_err();
    let msg = err.to_string();
    assert!(msg.contains("[input][0][type]"), "got: {msg}");
    assert!(msg.contains("no_such_source"), "got: {msg}");
    assert!(msg.contains("static"), "got: {msg}");
}

#[test]
fn duplicate_task_names_rejected() {
    let dir = TempDir::new().unwrap();
    let path = write_config(
        &dir,
        "flow.yaml",
        r#"
flow:
  version: v1
input:
  - type: static
    name: a
    tasks:
      - {name: same, cron: "0 0 * * *"}
  - type: static
    name: b
    tasks:
      - {name: same, cron: "0 0 * * *"}
"#,
    );

    let err = Flow::build(one_shot_settings(&path, &[]), &Registry::builtin()).unwrap_err();
    assert!(err.to_string().contains("`same`"), "got: {err}");
}

#[test]
fn duplicate_module_names_rejected_within_variant() {
    let dir = TempDir::new().unwrap();
    let path = write_config(
        &dir,
        "flow.yaml",
        r#"
flow:
  version: v1
input:
  - {type: static, name: twice, tasks: []}
  - {type: static, name: twice, tasks: []}
"#,
    );

    let err = Flow::build(one_shot_settings(&path, &[]), &Registry::builtin()).unwrap_err();
    assert!(err.to_string().contains("`twice`"), "got: {err}");
}

#[test]
fn include_and_exclude_of_same_kind_conflict() {
    let dir = TempDir::new().unwrap();
    let path = write_config(
        &dir,
        "flow.yaml",
        r#"
flow:
  version: v1
input:
  - {type: static, name: src, tasks: []}
output:
  - type: log
    name: sink
    include_tasks: [a]
    exclude_tasks: [b]
"#,
    );

    let err = Flow::build(one_shot_settings(&path, &[]), &Registry::builtin()).unwrap_err();
    assert!(
        err.to_string().contains("only one of"),
        "got: {err}"
    );
}

#[test]
fn none_metrics_requires_allow_none_metric() {
    let dir = TempDir::new().unwrap();
    let config = r#"
flow:
  version: v1
input:
  - type: static
    name: src
    tasks:
      - name: t1
        cron: "0 0 * * *"
        result:
          metrics: null
"#;
    let path = write_config(&dir, "flow.yaml", config);

    let err = Flow::build(one_shot_settings(&path, &[]), &Registry::builtin()).unwrap_err();
    assert!(err.to_string().contains("allow_none_metric"), "got: {err}");

    let settings = one_shot_settings(&path, &[("allow_none_metric", json!(true))]);
    assert!(Flow::build(settings, &Registry::builtin()).is_ok());
}

#[test]
fn repeat_for_expands_tasks() {
    let dir = TempDir::new().unwrap();
    let path = write_config(
        &dir,
        "flow.yaml",
        r#"
flow:
  version: v1
input:
  - type: static
    name: src
    tasks:
      - name: t_$i
        cron: "$minute * * * *"
        params:
          payload: {metric: 1, table: $table}
        repeat_for:
          table: [a, b, c]
          minute: [0, 20, 40]
output:
  - {type: log, name: sink}
"#,
    );

    let flow = Flow::build(one_shot_settings(&path, &[]), &Registry::builtin()).unwrap();
    let tasks = &flow.runtime().config.inputs[0].tasks;

    assert_eq!(tasks.len(), 3);
    let names: Vec<&str> = tasks.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, vec!["t_0", "t_1", "t_2"]);
    let crons: Vec<&str> = tasks.iter().map(|t| t.cron.as_str()).collect();
    assert_eq!(crons, vec!["0 * * * *", "20 * * * *", "40 * * * *"]);
    let tables: Vec<&Value> = tasks
        .iter()
        .map(|t| &t.params["payload"]["table"])
        .collect();
    assert_eq!(tables, vec![&json!("a"), &json!("b"), &json!("c")]);
}

#[test]
fn priority_override_from_extension_reorders_chain() {
    let dir = TempDir::new().unwrap();
    let ext = write_config(
        &dir,
        "ext.yaml",
        r#"
transform:
  - name: b
    priority: 10
"#,
    );
    let root = write_config(
        &dir,
        "flow.yaml",
        &format!(
            r#"
flow:
  version: v1
  extends: ["{}"]
input:
  - type: static
    name: src
    tasks:
      - {{name: t1, cron: "0 0 * * *"}}
transform:
  - {{type: scale, name: a, params: {{factor: 1}}}}
  - {{type: scale, name: b, params: {{factor: 1}}}}
output:
  - {{type: log, name: sink}}
"#,
            ext.display()
        ),
    );

    let flow = Flow::build(one_shot_settings(&root, &[]), &Registry::builtin()).unwrap();
    let runtime = flow.runtime();
    let chain = &runtime.chains[0];
    let order: Vec<&str> = chain
        .transforms
        .iter()
        .map(|&i| runtime.config.transforms[i].name.as_deref().unwrap())
        .collect();
    assert_eq!(order, vec!["b", "a"]);
}

// ---------------------------------------------------------------------------
// Dispatch scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn selector_expansion_delivers_expected_metrics() {
    let dir = TempDir::new().unwrap();
    let path = write_config(
        &dir,
        "flow.yaml",
        r#"
flow:
  version: v1
input:
  - type: static
    name: src
    tasks:
      - name: sel_task
        cron: "0 0 * * *"
        result:
          metrics: [a, b]
          attributes: [c, d]
        params:
          payload: {a: 4, b: 9, c: 3, d: 6, e: 1}
output:
  - {type: memory, name: sink_selector}
"#,
    );

    let flow = Flow::build(one_shot_settings(&path, &[]), &Registry::builtin()).unwrap();
    flow.run().await.unwrap();

    let frames = MemoryOutput::take("sink_selector");
    assert_eq!(frames.len(), 1);
    let frame = &frames[0];
    assert_eq!(frame.len(), 2);

    let first = &frame.metrics()[0];
    assert_eq!(first.value, Some(MetricValue::Int(4)));
    assert_eq!(first.attributes["c"], json!(3));
    assert_eq!(first.attributes["d"], json!(6));
    assert_eq!(first.field_name(), Some("a"));
    assert!(!first.attributes.contains_key("e"));

    let second = &frame.metrics()[1];
    assert_eq!(second.value, Some(MetricValue::Int(9)));
    assert_eq!(second.field_name(), Some("b"));
}

#[tokio::test]
async fn nested_pattern_selects_flattened_fields() {
    let dir = TempDir::new().unwrap();
    let path = write_config(
        &dir,
        "flow.yaml",
        r#"
flow:
  version: v1
input:
  - type: static
    name: src
    tasks:
      - name: nested_task
        cron: "0 0 * * *"
        result:
          metrics: "_source.*"
        params:
          payload: {_source: {x: 1, y: 2}, other: 9}
output:
  - {type: memory, name: sink_nested}
"#,
    );

    let flow = Flow::build(one_shot_settings(&path, &[]), &Registry::builtin()).unwrap();
    flow.run().await.unwrap();

    let frames = MemoryOutput::take("sink_nested");
    assert_eq!(frames.len(), 1);
    let frame = &frames[0];
    assert_eq!(frame.len(), 2);

    let fields: Vec<&str> = frame.iter().map(|m| m.field_name().unwrap()).collect();
    assert_eq!(fields, vec!["_source.x", "_source.y"]);
    for metric in frame.iter() {
        assert_eq!(metric.attributes["other"], json!(9));
    }
}

#[tokio::test]
async fn transforms_and_modifiers_shape_the_frame() {
    let dir = TempDir::new().unwrap();
    let path = write_config(
        &dir,
        "flow.yaml",
        r#"
flow:
  version: v1
input:
  - type: static
    name: src
    tasks:
      - name: shaped_task
        cron: "0 0 * * *"
        static_attributes:
          cluster: main
        modifiers:
          time_modulus: 60
          time_offset: -30
        params:
          payload: {metric: 10}
transform:
  - {type: scale, name: doubler, params: {factor: 2}}
output:
  - {type: memory, name: sink_shaped}
"#,
    );

    let flow = Flow::build(one_shot_settings(&path, &[]), &Registry::builtin()).unwrap();
    flow.run().await.unwrap();

    let frames = MemoryOutput::take("sink_shaped");
    assert_eq!(frames.len(), 1);
    let frame = &frames[0];

    assert_eq!(frame.metrics()[0].value, Some(MetricValue::Int(20)));
    assert_eq!(frame.metrics()[0].attributes["cluster"], json!("main"));
    // Floored to the minute, then shifted back 30 seconds.
    assert_eq!(frame.timestamp().timestamp().rem_euclid(60), 30);
}

#[tokio::test]
async fn retry_exhaustion_drops_the_fire() {
    let dir = TempDir::new().unwrap();
    let path = write_config(
        &dir,
        "flow.yaml",
        r#"
flow:
  version: v1
input:
  - type: flaky
    name: src
    tasks:
      - name: retry_task
        cron: "0 0 * * *"
        max_retries: 2
        retry_delay: 30ms
output:
  - {type: memory, name: sink_retry}
"#,
    );

    let mut registry = Registry::builtin();
    let attempts = register_flaky(&mut registry, usize::MAX);

    let flow = Flow::build(one_shot_settings(&path, &[]), &registry).unwrap();
    flow.run().await.unwrap();

    let attempts = attempts.lock().unwrap();
    assert_eq!(attempts.len(), 3, "initial attempt plus two retries");
    for pair in attempts.windows(2) {
        let gap = pair[1].duration_since(pair[0]);
        assert!(
            gap.as_millis() >= 30,
            "retry delay not honored: {gap:?}"
        );
    }
    assert!(MemoryOutput::take("sink_retry").is_empty());
}

#[tokio::test]
async fn retries_below_the_limit_still_deliver() {
    let dir = TempDir::new().unwrap();
    let path = write_config(
        &dir,
        "flow.yaml",
        r#"
flow:
  version: v1
input:
  - type: flaky
    name: src
    tasks:
      - name: flaky_task
        cron: "0 0 * * *"
        max_retries: 2
        retry_delay: 10ms
output:
  - {type: memory, name: sink_flaky_ok}
"#,
    );

    let mut registry = Registry::builtin();
    let attempts = register_flaky(&mut registry, 2);

    let flow = Flow::build(one_shot_settings(&path, &[]), &registry).unwrap();
    flow.run().await.unwrap();

    assert_eq!(attempts.lock().unwrap().len(), 3);
    let frames = MemoryOutput::take("sink_flaky_ok");
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].metrics()[0].value, Some(MetricValue::Int(1)));
}

#[tokio::test]
async fn terminal_transform_skips_outputs() {
    let dir = TempDir::new().unwrap();
    let path = write_config(
        &dir,
        "flow.yaml",
        r#"
flow:
  version: v1
input:
  - type: static
    name: src
    tasks:
      - name: terminal_task
        cron: "0 0 * * *"
        params:
          payload: {metric: 1}
transform:
  - {type: fatal, name: fuse, params: {}}
output:
  - {type: memory, name: sink_terminal}
"#,
    );

    let mut registry = Registry::builtin();
    register_failing_transform(&mut registry, "fatal", true);

    let flow = Flow::build(one_shot_settings(&path, &[]), &registry).unwrap();
    flow.run().await.unwrap();

    assert!(MemoryOutput::take("sink_terminal").is_empty());
}

#[tokio::test]
async fn soft_transform_failure_continues_the_chain() {
    let dir = TempDir::new().unwrap();
    let path = write_config(
        &dir,
        "flow.yaml",
        r#"
flow:
  version: v1
input:
  - type: static
    name: src
    tasks:
      - name: soft_task
        cron: "0 0 * * *"
        params:
          payload: {metric: 1}
transform:
  - {type: glitchy, name: hiccup, params: {}}
output:
  - {type: memory, name: sink_soft}
"#,
    );

    let mut registry = Registry::builtin();
    register_failing_transform(&mut registry, "glitchy", false);

    let flow = Flow::build(one_shot_settings(&path, &[]), &registry).unwrap();
    flow.run().await.unwrap();

    let frames = MemoryOutput::take("sink_soft");
    assert_eq!(frames.len(), 1);
}

#[tokio::test]
async fn disable_outputs_suppresses_delivery() {
    let dir = TempDir::new().unwrap();
    let path = write_config(
        &dir,
        "flow.yaml",
        r#"
flow:
  version: v1
input:
  - type: static
    name: src
    tasks:
      - name: muted_task
        cron: "0 0 * * *"
        params:
          payload: {metric: 1}
output:
  - {type: memory, name: sink_muted}
"#,
    );

    let settings = one_shot_settings(&path, &[("disable_outputs", json!(true))]);
    let flow = Flow::build(settings, &Registry::builtin()).unwrap();
    flow.run().await.unwrap();

    assert!(MemoryOutput::take("sink_muted").is_empty());
}

#[tokio::test]
async fn routing_filters_pick_outputs_per_task() {
    let dir = TempDir::new().unwrap();
    let path = write_config(
        &dir,
        "flow.yaml",
        r#"
flow:
  version: v1
input:
  - type: static
    name: src
    tasks:
      - name: db_rows
        cron: "0 0 * * *"
        params:
          payload: {metric: 1}
      - name: http_latency
        cron: "0 0 * * *"
        params:
          payload: {metric: 2}
output:
  - type: memory
    name: sink_db_only
    include_tasks: ["db_*"]
  - type: memory
    name: sink_everything
"#,
    );

    let flow = Flow::build(one_shot_settings(&path, &[]), &Registry::builtin()).unwrap();
    flow.run().await.unwrap();

    assert_eq!(MemoryOutput::take("sink_db_only").len(), 1);
    assert_eq!(MemoryOutput::take("sink_everything").len(), 2);
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn lifecycle_hooks_run_in_order() {
    let dir = TempDir::new().unwrap();
    let path = write_config(
        &dir,
        "flow.yaml",
        r#"
flow:
  version: v1
input:
  - type: probe_in
    name: reader
    tasks:
      - {name: probe_task, cron: "0 0 * * *"}
output:
  - {type: probe_out, name: writer, params: {}}
"#,
    );

    let mut registry = Registry::builtin();
    let events = register_probes(&mut registry, false);

    let flow = Flow::build(one_shot_settings(&path, &[]), &registry).unwrap();
    flow.run().await.unwrap();

    let events = events.lock().unwrap();
    assert_eq!(
        *events,
        vec![
            "reader:connect",
            "writer:connect",
            "reader:pre_shutdown",
            "writer:pre_shutdown",
            "writer:shutdown",
            "reader:shutdown",
        ]
    );
}

#[tokio::test]
async fn failing_connect_hook_aborts_startup() {
    let dir = TempDir::new().unwrap();
    let path = write_config(
        &dir,
        "flow.yaml",
        r#"
flow:
  version: v1
input:
  - type: probe_in
    name: reader
    tasks:
      - {name: probe_task, cron: "0 0 * * *"}
output:
  - {type: probe_out, name: writer, params: {}}
"#,
    );

    let mut registry = Registry::builtin();
    let _events = register_probes(&mut registry, true);

    let flow = Flow::build(one_shot_settings(&path, &[]), &registry).unwrap();
    let err = flow.run().await.unwrap_err();
    assert!(
        matches!(err, FlowError::StartupHook { ref module, .. } if module == "writer"),
        "got: {err}"
    );
}

// ---------------------------------------------------------------------------
// Chain rendering
// ---------------------------------------------------------------------------

#[test]
fn render_chains_lists_tasks_and_stages() {
    let dir = TempDir::new().unwrap();
    let path = write_config(
        &dir,
        "flow.yaml",
        r#"
flow:
  version: v1
input:
  - type: static
    name: src
    tasks:
      - {name: render_task, cron: "0 0 * * *"}
      - {name: off_task, cron: "0 0 * * *", enabled: false}
transform:
  - {type: scale, name: doubler, params: {factor: 2}}
output:
  - {type: log, name: sink}
"#,
    );

    let flow = Flow::build(one_shot_settings(&path, &[]), &Registry::builtin()).unwrap();
    let rendered = flow.render_chains();

    assert!(rendered.contains("render_task"), "got:\n{rendered}");
    assert!(rendered.contains("[IN]src"), "got:\n{rendered}");
    assert!(rendered.contains("[TR]doubler"), "got:\n{rendered}");
    assert!(rendered.contains("[OUT]sink"), "got:\n{rendered}");
    assert!(rendered.contains("[>disabled<]"), "got:\n{rendered}");
}

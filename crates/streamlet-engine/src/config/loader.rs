//! Configuration loading.
//!
//! The pipeline is: read YAML documents, overlay the root onto its
//! extensions (by-`name` merging for module and task lists), expand
//! `repeat_for` clones, export the `env:` block, substitute `${VAR}`
//! references, then validate strictly and decode. The early steps are
//! tolerant; only the final validation is strict.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};

use streamlet_types::FlowError;

use super::model::{FlowConfig, ModuleConfig};
use super::schema_def::{document_schema, module_schema, SchemaOptions};
use crate::registry::{ModuleKind, Registry};
use crate::schema::{validate, ConfigPath, SchemaError};
use crate::settings::Settings;

/// `$name` / `${name}` references for repeat expansion.
static VAR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$(?:\{([A-Za-z_][A-Za-z0-9_]*)\}|([A-Za-z_][A-Za-z0-9_]*))")
        .expect("valid repeat var regex")
});

/// `${NAME}` environment references.
static ENV_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid env var regex"));

const SUPPORTED_VERSION: &str = "v1";

/// Load, compose, and validate the configuration named by
/// `settings.config`, applying `flow.settings` onto `settings` along
/// the way.
pub fn load(registry: &Registry, settings: &mut Settings) -> Result<FlowConfig, FlowError> {
    let paths = settings.config.clone();
    let (root_path, extra_extensions) = paths
        .split_first()
        .ok_or_else(|| FlowError::config("--config", "no configuration path provided"))?;

    let mut document = read_document(root_path)?;

    // Extension paths: flow.extends first, extra --config paths after.
    // Earlier extensions sit closer to the root and win against later
    // ones; the root always wins against all of them.
    let mut extension_paths: Vec<String> = list_of_strings(
        document
            .get("flow")
            .and_then(|f| f.get("extends"))
            .unwrap_or(&Value::Null),
    );
    extension_paths.extend(
        extra_extensions
            .iter()
            .map(|p| p.to_string_lossy().into_owned()),
    );

    for raw_path in &extension_paths {
        let path = expand_env_str(raw_path)
            .map_err(|missing| missing_env_error(&missing))?;
        tracing::debug!(extension = path, "Loading extension");
        let extension = read_document(Path::new(&path))?;
        document = overlay(extension, document);
    }

    expand_repeats(&mut document)?;

    export_env_block(&document)?;
    substitute_env(&mut document)?;

    // Settings travel with the composed document and must land before
    // strict validation: several defaults depend on them.
    if let Some(Value::Object(map)) = document.get("flow").and_then(|f| f.get("settings")) {
        let map = map.clone();
        settings.apply_config(&map)?;
    }

    let normalized = validate_document(document, registry, settings)?;
    decode(normalized, settings)
}

fn read_document(path: &Path) -> Result<Value, FlowError> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        FlowError::config("<root>", format!("cannot read `{}`: {e}", path.display()))
    })?;
    let value: Value = serde_yaml::from_str(&content).map_err(|e| {
        FlowError::config("<root>", format!("invalid YAML in `{}`: {e}", path.display()))
    })?;
    match value {
        Value::Object(_) => Ok(value),
        Value::Null => Ok(Value::Object(Map::new())),
        _ => Err(FlowError::config(
            "<root>",
            format!("`{}` must contain a YAML mapping", path.display()),
        )),
    }
}

fn list_of_strings(value: &Value) -> Vec<String> {
    match value {
        Value::String(s) => vec![s.clone()],
        Value::Array(items) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

/// Overlay `over` onto `base`: `over` wins on conflicts and determines
/// order; unmatched `base` entries are appended. Lists of maps merge
/// entries by `name`.
pub fn overlay(base: Value, over: Value) -> Value {
    match (base, over) {
        (Value::Object(base_map), Value::Object(over_map)) => {
            let mut result = base_map;
            for (key, over_value) in over_map {
                let merged = match result.remove(&key) {
                    Some(base_value) => overlay(base_value, over_value),
                    None => over_value,
                };
                result.insert(key, merged);
            }
            Value::Object(result)
        }
        (Value::Array(mut base_items), Value::Array(over_items)) => {
            let mut result = Vec::with_capacity(base_items.len() + over_items.len());
            for item in over_items {
                let name = item.get("name").and_then(Value::as_str).map(str::to_string);
                let matched = name.as_deref().and_then(|n| {
                    base_items
                        .iter()
                        .position(|b| b.get("name").and_then(Value::as_str) == Some(n))
                });
                match matched {
                    Some(pos) => {
                        let base_item = base_items.remove(pos);
                        result.push(overlay(base_item, item));
                    }
                    None => result.push(item),
                }
            }
            result.append(&mut base_items);
            Value::Array(result)
        }
        (_, over) => over,
    }
}

/// Expand `repeat_for` on every task of every input. Tolerant of shape
/// problems; those surface later during strict validation.
fn expand_repeats(document: &mut Value) -> Result<(), FlowError> {
    let Some(inputs) = document.get_mut("input").and_then(Value::as_array_mut) else {
        return Ok(());
    };

    for (input_index, input) in inputs.iter_mut().enumerate() {
        let Some(tasks) = input.get_mut("tasks").and_then(Value::as_array_mut) else {
            continue;
        };

        let original = std::mem::take(tasks);
        for (task_index, mut task) in original.into_iter().enumerate() {
            let repeat = match task.as_object_mut() {
                Some(obj) => obj.remove("repeat_for"),
                None => None,
            };
            match repeat {
                None | Some(Value::Null) => tasks.push(task),
                Some(Value::Object(vars)) => {
                    let path = ConfigPath::root()
                        .key("input")
                        .index(input_index)
                        .key("tasks")
                        .index(task_index)
                        .key("repeat_for");
                    let expanded = repeat_values(&vars, &path)?;
                    let count = expanded
                        .first()
                        .map(|(_, values)| values.len())
                        .unwrap_or(0);

                    for i in 0..count {
                        let mut clone = task.clone();
                        let mut params: Vec<(&str, &str)> = expanded
                            .iter()
                            .map(|(k, values)| (k.as_str(), values[i].as_str()))
                            .collect();
                        let index_str = i.to_string();
                        params.push(("i", &index_str));
                        substitute_vars(&mut clone, &params);
                        tasks.push(clone);
                    }
                }
                Some(other) => {
                    return Err(FlowError::config(
                        ConfigPath::root()
                            .key("input")
                            .index(input_index)
                            .key("tasks")
                            .index(task_index)
                            .key("repeat_for")
                            .to_string(),
                        format!("expected map, got {other}"),
                    ))
                }
            }
        }
    }

    Ok(())
}

/// Coerce `repeat_for` values to equal-length string lists.
fn repeat_values(
    vars: &Map<String, Value>,
    path: &ConfigPath,
) -> Result<Vec<(String, Vec<String>)>, FlowError> {
    let mut result: Vec<(String, Vec<String>)> = Vec::with_capacity(vars.len());

    for (key, value) in vars {
        let items = match value {
            Value::Array(items) => items.clone(),
            other => vec![other.clone()],
        };
        let mut strings = Vec::with_capacity(items.len());
        for item in items {
            match item {
                Value::String(s) => strings.push(s),
                Value::Number(n) => strings.push(n.to_string()),
                Value::Bool(b) => strings.push(b.to_string()),
                other => {
                    return Err(FlowError::config(
                        path.key(key).to_string(),
                        format!("repeat values must be scalars, got {other}"),
                    ))
                }
            }
        }
        if let Some((first_key, first)) = result.first() {
            if first.len() != strings.len() {
                return Err(FlowError::config(
                    path.key(key).to_string(),
                    format!(
                        "length of `{key}` ({}) is unequal to `{first_key}` ({})",
                        strings.len(),
                        first.len()
                    ),
                ));
            }
        }
        result.push((key.clone(), strings));
    }

    Ok(result)
}

/// Replace `$var` / `${var}` in every string value. Unknown names are
/// left untouched (they may be environment references).
fn substitute_vars(value: &mut Value, params: &[(&str, &str)]) {
    match value {
        Value::String(s) => {
            let replaced = VAR_RE.replace_all(s, |caps: &regex::Captures<'_>| {
                let name = caps
                    .get(1)
                    .or_else(|| caps.get(2))
                    .map(|m| m.as_str())
                    .unwrap_or_default();
                match params.iter().find(|(k, _)| *k == name) {
                    Some((_, v)) => (*v).to_string(),
                    None => caps[0].to_string(),
                }
            });
            if let std::borrow::Cow::Owned(new) = replaced {
                *s = new;
            }
        }
        Value::Array(items) => {
            for item in items {
                substitute_vars(item, params);
            }
        }
        Value::Object(map) => {
            for (_, item) in map.iter_mut() {
                substitute_vars(item, params);
            }
        }
        _ => {}
    }
}

/// Export the document's `env:` block into the process environment.
fn export_env_block(document: &Value) -> Result<(), FlowError> {
    let Some(Value::Object(pairs)) = document.get("env") else {
        return Ok(());
    };

    let mut exported = 0usize;
    for (key, value) in pairs {
        let Some(raw) = value.as_str() else {
            // Non-string values are rejected by strict validation later.
            continue;
        };
        let expanded = expand_env_str(raw).map_err(|missing| missing_env_error(&missing))?;
        std::env::set_var(key, expanded);
        exported += 1;
    }
    if exported > 0 {
        tracing::debug!(count = exported, "Exported environment variables from configuration");
    }
    Ok(())
}

/// Expand `${VAR}` in one string, recursing while the value itself
/// contains references. Returns the sorted set of missing names on
/// failure.
fn expand_env_str(input: &str) -> Result<String, Vec<String>> {
    let mut current = input.to_string();

    for _ in 0..16 {
        let mut missing = BTreeSet::new();
        let replaced = ENV_RE.replace_all(&current, |caps: &regex::Captures<'_>| {
            let name = &caps[1];
            match std::env::var(name) {
                Ok(value) => value,
                Err(_) => {
                    missing.insert(name.to_string());
                    caps[0].to_string()
                }
            }
        });
        if !missing.is_empty() {
            return Err(missing.into_iter().collect());
        }
        if let std::borrow::Cow::Owned(new) = replaced {
            current = new;
        } else {
            return Ok(current);
        }
    }

    Ok(current)
}

fn missing_env_error(missing: &[String]) -> FlowError {
    FlowError::config(
        "<root>",
        format!("missing environment variable(s): {}", missing.join(", ")),
    )
}

/// Expand `${VAR}` through every string scalar of the document,
/// collecting all missing names before failing.
fn substitute_env(document: &mut Value) -> Result<(), FlowError> {
    let mut missing = BTreeSet::new();
    walk_env(document, &mut missing);
    if missing.is_empty() {
        Ok(())
    } else {
        let names: Vec<String> = missing.into_iter().collect();
        Err(missing_env_error(&names))
    }
}

fn walk_env(value: &mut Value, missing: &mut BTreeSet<String>) {
    match value {
        Value::String(s) => match expand_env_str(s) {
            Ok(expanded) => *s = expanded,
            Err(names) => missing.extend(names),
        },
        Value::Array(items) => {
            for item in items {
                walk_env(item, missing);
            }
        }
        Value::Object(map) => {
            for (_, item) in map.iter_mut() {
                walk_env(item, missing);
            }
        }
        _ => {}
    }
}

/// Strict validation: root shape, then one schema per module entry
/// assembled from the registry. Returns the normalized document.
fn validate_document(
    document: Value,
    registry: &Registry,
    settings: &Settings,
) -> Result<Value, FlowError> {
    let opts = SchemaOptions {
        disable_default: settings.disable_default,
        run_once: settings.run_once,
    };

    let mut normalized = validate(&document, &document_schema(), &ConfigPath::root())
        .map_err(schema_errors_to_flow)?;

    let version = normalized["flow"]["version"].as_str().unwrap_or_default();
    if version != SUPPORTED_VERSION {
        return Err(FlowError::config(
            "[flow][version]",
            format!("unsupported flow version `{version}`, expected `{SUPPORTED_VERSION}`"),
        ));
    }

    let mut errors: Vec<SchemaError> = Vec::new();

    for (key, kind) in [
        ("input", ModuleKind::Input),
        ("transform", ModuleKind::Transform),
        ("output", ModuleKind::Output),
    ] {
        let Some(entries) = normalized.get_mut(key).and_then(Value::as_array_mut) else {
            continue;
        };
        for (index, entry) in entries.iter_mut().enumerate() {
            let path = ConfigPath::root().key(key).index(index);
            match validate_module_entry(entry, kind, &path, registry, settings, &opts) {
                Ok(validated) => *entry = validated,
                Err(mut errs) => errors.append(&mut errs),
            }
        }
    }

    if errors.is_empty() {
        Ok(normalized)
    } else {
        Err(schema_errors_to_flow(errors))
    }
}

fn validate_module_entry(
    entry: &Value,
    kind: ModuleKind,
    path: &ConfigPath,
    registry: &Registry,
    settings: &Settings,
    opts: &SchemaOptions,
) -> Result<Value, Vec<SchemaError>> {
    let Some(obj) = entry.as_object() else {
        return Err(vec![SchemaError {
            path: path.clone(),
            message: format!("expected map, got {}", entry),
            suggestion: None,
        }]);
    };

    let type_name = match obj.get("type").and_then(Value::as_str) {
        Some(t) => t.to_lowercase(),
        None => {
            return Err(vec![SchemaError {
                path: path.clone(),
                message: "required key `type` not provided".to_string(),
                suggestion: None,
            }])
        }
    };

    let Some(spec) = registry.get(kind, &type_name) else {
        let known = registry.known_types(kind).join(", ");
        return Err(vec![SchemaError {
            path: path.key("type"),
            message: format!("{kind} type `{type_name}` is unknown (known types: {known})"),
            suggestion: None,
        }]);
    };

    let enabled = obj
        .get("enabled")
        .and_then(Value::as_bool)
        .unwrap_or(!settings.disable_default);

    // Disabled entries may skip their type-specific schemas entirely.
    if settings.skip_disabled_validation && !enabled {
        let mut kept = obj.clone();
        kept.entry("name").or_insert(Value::Null);
        kept.insert("enabled".to_string(), Value::Bool(false));
        return Ok(Value::Object(kept));
    }

    let schema = module_schema(spec, opts);
    let validated = validate(entry, &schema, path)?;

    let mut errors = Vec::new();

    if kind == ModuleKind::Transform {
        if let Some(priority) = validated.get("priority").and_then(Value::as_i64) {
            if !(-256..=256).contains(&priority) {
                errors.push(SchemaError {
                    path: path.key("priority"),
                    message: format!("priority {priority} is outside [-256, 256]"),
                    suggestion: None,
                });
            }
        }
    }

    if matches!(kind, ModuleKind::Transform | ModuleKind::Output) {
        for (include, exclude) in [
            ("include_tasks", "exclude_tasks"),
            ("include_inputs", "exclude_inputs"),
        ] {
            let has = |k: &str| !validated.get(k).map_or(true, Value::is_null);
            if has(include) && has(exclude) {
                errors.push(SchemaError {
                    path: path.clone(),
                    message: format!("only one of `{include}` and `{exclude}` may be present"),
                    suggestion: None,
                });
            }
        }
    }

    if errors.is_empty() {
        Ok(validated)
    } else {
        Err(errors)
    }
}

fn schema_errors_to_flow(errors: Vec<SchemaError>) -> FlowError {
    debug_assert!(!errors.is_empty());
    // Prefer an error carrying a key suggestion: a typo usually causes a
    // missing-required error as well, and the typo is the actionable one.
    let lead = errors
        .iter()
        .find(|e| e.suggestion.is_some())
        .unwrap_or(&errors[0]);
    let message = if errors.len() == 1 {
        lead.message.clone()
    } else {
        let lines: Vec<String> = errors.iter().map(|e| format!("  - {e}")).collect();
        format!("{} problem(s) found:\n{}", errors.len(), lines.join("\n"))
    };
    FlowError::ConfigInvalid {
        path: lead.path.to_string(),
        message,
        suggestion: lead.suggestion.clone(),
    }
}

/// Decode the normalized document into typed configuration, resolving
/// generated names and enforcing the uniqueness invariants.
fn decode(normalized: Value, settings: &Settings) -> Result<FlowConfig, FlowError> {
    let version = normalized["flow"]["version"]
        .as_str()
        .unwrap_or_default()
        .to_string();

    let mut config = FlowConfig {
        version,
        inputs: Vec::new(),
        transforms: Vec::new(),
        outputs: Vec::new(),
    };

    for (key, kind) in [
        ("input", ModuleKind::Input),
        ("transform", ModuleKind::Transform),
        ("output", ModuleKind::Output),
    ] {
        let Some(entries) = normalized.get(key).and_then(Value::as_array) else {
            continue;
        };
        let mut seen = BTreeSet::new();
        for (index, entry) in entries.iter().enumerate() {
            let path = ConfigPath::root().key(key).index(index);
            let mut module: ModuleConfig = serde_json::from_value(entry.clone())
                .map_err(|e| FlowError::config(path.to_string(), e.to_string()))?;
            let name = module.resolved_name(entry);
            if !seen.insert(name.clone()) {
                return Err(FlowError::config(
                    path.key("name").to_string(),
                    format!("{kind} module name `{name}` is used more than once"),
                ));
            }
            module.name = Some(name);
            for task in &mut module.tasks {
                task.name = format!("{}{}", settings.task_name_prefix, task.name);
            }
            match kind {
                ModuleKind::Input => config.inputs.push(module),
                ModuleKind::Transform => config.transforms.push(module),
                ModuleKind::Output => config.outputs.push(module),
            }
        }
    }

    // Task names are globally unique across all inputs.
    let mut task_names = BTreeSet::new();
    for (input_index, input) in config.inputs.iter().enumerate() {
        for (task_index, task) in input.tasks.iter().enumerate() {
            if !task_names.insert(task.name.clone()) {
                return Err(FlowError::config(
                    ConfigPath::root()
                        .key("input")
                        .index(input_index)
                        .key("tasks")
                        .index(task_index)
                        .key("name")
                        .to_string(),
                    format!("task name `{}` is used more than once", task.name),
                ));
            }
        }
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // ── overlay ─────────────────────────────────────────────────────

    #[test]
    fn overlay_scalars_prefer_over() {
        assert_eq!(overlay(json!(1), json!(2)), json!(2));
        assert_eq!(overlay(json!({"a": 1}), json!({"a": 2})), json!({"a": 2}));
    }

    #[test]
    fn overlay_merges_named_list_entries() {
        let base = json!([
            {"name": "t1", "cron": "*/2", "params": {"a": 1}},
            {"name": "t3", "cron": "0 0 * * *"},
        ]);
        let over = json!([
            {"name": "t1", "cron": "* * * * *"},
            {"name": "t2", "cron": "1 * * * *"},
        ]);
        let merged = overlay(base, over);
        let entries = merged.as_array().unwrap();

        assert_eq!(entries.len(), 3);
        // Over's order first, then unmatched base entries.
        assert_eq!(entries[0]["name"], json!("t1"));
        assert_eq!(entries[0]["cron"], json!("* * * * *"));
        assert_eq!(entries[0]["params"], json!({"a": 1}));
        assert_eq!(entries[1]["name"], json!("t2"));
        assert_eq!(entries[2]["name"], json!("t3"));
    }

    #[test]
    fn overlay_appends_unnamed_entries() {
        let base = json!([{"cron": "a"}]);
        let over = json!([{"cron": "b"}]);
        let merged = overlay(base, over);
        assert_eq!(merged.as_array().unwrap().len(), 2);
    }

    #[test]
    fn overlay_is_order_independent_for_disjoint_names() {
        let root = json!({"input": [{"name": "a", "x": 1}]});
        let e1 = json!({"input": [{"name": "b", "x": 2}]});
        let e2 = json!({"input": [{"name": "c", "x": 3}]});

        // root > e1 > e2, applied in both extension orders
        let left = overlay(e2.clone(), overlay(e1.clone(), root.clone()));
        let right = overlay(e1, overlay(e2, root));

        let names = |v: &Value| -> BTreeSet<String> {
            v["input"]
                .as_array()
                .unwrap()
                .iter()
                .map(|m| m["name"].as_str().unwrap().to_string())
                .collect()
        };
        assert_eq!(names(&left), names(&right));
    }

    // ── repeat expansion ────────────────────────────────────────────

    #[test]
    fn repeat_for_clones_and_substitutes() {
        let mut doc = json!({
            "input": [{
                "type": "static",
                "tasks": [{
                    "name": "t_$i",
                    "cron": "$minute * * * *",
                    "params": {"table": "$table"},
                    "repeat_for": {"table": ["a", "b", "c"], "minute": [0, 20, 40]},
                }],
            }],
        });
        expand_repeats(&mut doc).unwrap();

        let tasks = doc["input"][0]["tasks"].as_array().unwrap();
        assert_eq!(tasks.len(), 3);
        assert_eq!(tasks[0]["name"], json!("t_0"));
        assert_eq!(tasks[1]["name"], json!("t_1"));
        assert_eq!(tasks[2]["name"], json!("t_2"));
        assert_eq!(tasks[0]["cron"], json!("0 * * * *"));
        assert_eq!(tasks[1]["cron"], json!("20 * * * *"));
        assert_eq!(tasks[2]["cron"], json!("40 * * * *"));
        assert_eq!(tasks[0]["params"]["table"], json!("a"));
        assert_eq!(tasks[2]["params"]["table"], json!("c"));
        assert!(tasks[0].get("repeat_for").is_none());
    }

    #[test]
    fn repeat_for_unequal_lengths_error() {
        let mut doc = json!({
            "input": [{
                "tasks": [{
                    "name": "t_$i",
                    "cron": "* * * * *",
                    "repeat_for": {"table": ["a", "b"], "minute": [0]},
                }],
            }],
        });
        let err = expand_repeats(&mut doc).unwrap_err().to_string();
        assert!(err.contains("unequal"));
        assert!(err.contains("[repeat_for]"));
    }

    #[test]
    fn repeat_vars_leave_unknown_references() {
        let mut value = json!({"cmd": "$table and ${STREAMLET_UNSET_XYZ}"});
        substitute_vars(&mut value, &[("table", "users")]);
        assert_eq!(value["cmd"], json!("users and ${STREAMLET_UNSET_XYZ}"));
    }

    // ── env substitution ────────────────────────────────────────────

    #[test]
    fn env_expansion_replaces_and_recurses() {
        std::env::set_var("SL_TEST_OUTER", "${SL_TEST_INNER}/x");
        std::env::set_var("SL_TEST_INNER", "deep");
        let out = expand_env_str("${SL_TEST_OUTER}").unwrap();
        assert_eq!(out, "deep/x");
        std::env::remove_var("SL_TEST_OUTER");
        std::env::remove_var("SL_TEST_INNER");
    }

    #[test]
    fn env_expansion_reports_all_missing() {
        let mut doc = json!({"a": "${SL_MISSING_ONE}", "b": "${SL_MISSING_TWO}"});
        let err = substitute_env(&mut doc).unwrap_err().to_string();
        assert!(err.contains("SL_MISSING_ONE"));
        assert!(err.contains("SL_MISSING_TWO"));
    }
}

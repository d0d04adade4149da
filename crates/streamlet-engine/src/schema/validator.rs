//! Recursive schema validation with path-tracked error reporting.
//!
//! The validator walks the configuration and the schema in lockstep and
//! accumulates every error it finds, so one run reports all problems.
//! Validation also normalizes: defaults are filled in, bare scalars are
//! coerced into one-element lists, and names are lowercased. Running the
//! validator over its own output is a no-op.

use serde_json::Value;

use streamlet_types::duration;

use super::suggest;
use super::{ConfigPath, Field, Schema};
use crate::cron_expr::parse_cron;

/// A single validation failure.
#[derive(Debug, Clone)]
pub struct SchemaError {
    pub path: ConfigPath,
    pub message: String,
    /// Closest expected key, for unknown-key errors.
    pub suggestion: Option<String>,
}

impl SchemaError {
    fn new(path: &ConfigPath, message: impl Into<String>) -> Self {
        Self {
            path: path.clone(),
            message: message.into(),
            suggestion: None,
        }
    }
}

impl std::fmt::Display for SchemaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

/// Validate `value` against `schema`, rooted at `path`.
///
/// Returns the normalized document, or every error found.
pub fn validate(
    value: &Value,
    schema: &Schema,
    path: &ConfigPath,
) -> Result<Value, Vec<SchemaError>> {
    let mut errors = Vec::new();
    let out = walk(value, schema, path, &mut errors);
    match out {
        Some(v) if errors.is_empty() => Ok(v),
        _ => Err(errors),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "map",
    }
}

fn type_error(
    path: &ConfigPath,
    expected: &str,
    found: &Value,
    errors: &mut Vec<SchemaError>,
) -> Option<Value> {
    errors.push(SchemaError::new(
        path,
        format!("expected {expected}, got {}", json_kind(found)),
    ));
    None
}

fn walk(
    value: &Value,
    schema: &Schema,
    path: &ConfigPath,
    errors: &mut Vec<SchemaError>,
) -> Option<Value> {
    match schema {
        Schema::Any => Some(value.clone()),

        Schema::Str => match value {
            Value::String(_) => Some(value.clone()),
            other => type_error(path, "string", other, errors),
        },

        Schema::Int => match value {
            Value::Number(n) if n.as_i64().is_some() => Some(value.clone()),
            other => type_error(path, "integer", other, errors),
        },

        Schema::Float => match value {
            Value::Number(_) => Some(value.clone()),
            other => type_error(path, "number", other, errors),
        },

        Schema::Bool => match value {
            Value::Bool(_) => Some(value.clone()),
            other => type_error(path, "bool", other, errors),
        },

        Schema::Duration => match duration::seconds_from_value(value) {
            Ok(_) => Some(value.clone()),
            Err(e) => {
                errors.push(SchemaError::new(path, e.to_string()));
                None
            }
        },

        Schema::Cron => match value {
            Value::String(s) => match parse_cron(s) {
                Ok(_) => Some(value.clone()),
                Err(e) => {
                    errors.push(SchemaError::new(path, e));
                    None
                }
            },
            other => type_error(path, "cron string", other, errors),
        },

        Schema::Name => match value {
            Value::String(s) => {
                let lowered = s.to_lowercase();
                let ok = lowered
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || "_-.+".contains(c));
                if ok && !lowered.is_empty() {
                    Some(Value::String(lowered))
                } else {
                    errors.push(SchemaError::new(
                        path,
                        format!("name `{s}` may only contain letters, digits and `_-.+`"),
                    ));
                    None
                }
            }
            other => type_error(path, "name string", other, errors),
        },

        Schema::Nullable(inner) => match value {
            Value::Null => Some(Value::Null),
            other => walk(other, inner, path, errors),
        },

        Schema::List(inner) => match value {
            Value::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                let mut ok = true;
                for (i, item) in items.iter().enumerate() {
                    match walk(item, inner, &path.index(i), errors) {
                        Some(v) => out.push(v),
                        None => ok = false,
                    }
                }
                ok.then_some(Value::Array(out))
            }
            // Bare scalars become one-element lists.
            other => walk(other, inner, path, errors).map(|v| Value::Array(vec![v])),
        },

        Schema::MapOf(inner) => match value {
            Value::Object(obj) => {
                let mut out = serde_json::Map::new();
                let mut ok = true;
                for (k, v) in obj {
                    match walk(v, inner, &path.key(k), errors) {
                        Some(v) => {
                            out.insert(k.clone(), v);
                        }
                        None => ok = false,
                    }
                }
                ok.then_some(Value::Object(out))
            }
            other => type_error(path, "map", other, errors),
        },

        Schema::Map(fields) => walk_map(value, fields, path, errors),

        Schema::Union(branches) => walk_union(value, branches, path, errors),
    }
}

fn walk_map(
    value: &Value,
    fields: &[Field],
    path: &ConfigPath,
    errors: &mut Vec<SchemaError>,
) -> Option<Value> {
    let obj = match value {
        Value::Object(obj) => obj,
        other => return type_error(path, "map", other, errors),
    };

    let mut out = serde_json::Map::new();
    let mut ok = true;

    for field in fields {
        match obj.get(&field.key) {
            Some(v) => match walk(v, &field.schema, &path.key(&field.key), errors) {
                Some(v) => {
                    out.insert(field.key.clone(), v);
                }
                None => ok = false,
            },
            None => match field.absent_value() {
                Some(default) => {
                    out.insert(field.key.clone(), default);
                }
                None => {
                    errors.push(SchemaError::new(
                        path,
                        format!("required key `{}` not provided", field.key),
                    ));
                    ok = false;
                }
            },
        }
    }

    for key in obj.keys() {
        if fields.iter().any(|f| &f.key == key) {
            continue;
        }
        ok = false;
        let candidates = fields.iter().map(|f| f.key.as_str());
        match suggest::closest(key, candidates) {
            Some(best) => {
                let example = fields
                    .iter()
                    .find(|f| f.key == best)
                    .map(|f| f.schema.example())
                    .unwrap_or_else(|| "<value>".into());
                errors.push(SchemaError {
                    path: path.clone(),
                    message: format!(
                        "unknown key `{key}`. Did you mean `{best}`? e.g. `{best}: {example}`"
                    ),
                    suggestion: Some(best.to_string()),
                });
            }
            None => errors.push(SchemaError::new(
                path,
                format!("unknown key `{key}`, no close match among expected keys"),
            )),
        }
    }

    ok.then_some(Value::Object(out))
}

fn walk_union(
    value: &Value,
    branches: &[Schema],
    path: &ConfigPath,
    errors: &mut Vec<SchemaError>,
) -> Option<Value> {
    // Map branches are scored by how many of their required keys the
    // value carries; the highest score is tried first.
    let mut order: Vec<usize> = (0..branches.len()).collect();
    if let Value::Object(obj) = value {
        let score = |schema: &Schema| -> usize {
            match schema {
                Schema::Map(fields) => fields
                    .iter()
                    .filter(|f| f.required && obj.contains_key(&f.key))
                    .count(),
                _ => 0,
            }
        };
        order.sort_by_key(|&i| std::cmp::Reverse(score(&branches[i])));
    }

    let mut attempts: Vec<(usize, Vec<SchemaError>)> = Vec::new();
    for &i in &order {
        let mut branch_errors = Vec::new();
        if let Some(v) = walk(value, &branches[i], path, &mut branch_errors) {
            if branch_errors.is_empty() {
                return Some(v);
            }
        }
        attempts.push((i, branch_errors));
    }

    // Nothing matched: report each branch's first mismatch.
    let mut parts = Vec::new();
    for (i, branch_errors) in &attempts {
        let first = branch_errors
            .first()
            .map(|e| e.message.clone())
            .unwrap_or_else(|| "did not match".into());
        parts.push(format!("(variant {i}) {first}"));
    }
    errors.push(SchemaError::new(
        path,
        format!("no union variant matched: {}", parts.join("; ")),
    ));
    None
}

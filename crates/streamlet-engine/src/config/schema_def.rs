//! Schema definitions for the configuration document.
//!
//! The document is validated in two phases: a fixed root shape, then one
//! schema per module entry, assembled from the registry's connection and
//! parameter schemas for the entry's `type`.

use serde_json::json;

use crate::registry::{ModuleKind, ModuleSpec};
use crate::schema::{Field, Schema};

/// Defaults that settings inject into the schemas.
#[derive(Debug, Clone, Copy, Default)]
pub struct SchemaOptions {
    /// Flip every `enabled` default to `false`.
    pub disable_default: bool,
    /// One-shot mode: retries default off.
    pub run_once: bool,
}

impl SchemaOptions {
    fn enabled_default(&self) -> serde_json::Value {
        json!(!self.disable_default)
    }
}

/// Strict root shape. Module entries validate as `Any` here; phase two
/// applies the per-type schemas.
pub fn document_schema() -> Schema {
    Schema::Map(vec![
        Field::required(
            "flow",
            Schema::Map(vec![
                Field::required("version", Schema::Str),
                Field::optional("extends", Schema::List(Box::new(Schema::Str)), json!([])),
                Field::optional("settings", Schema::MapOf(Box::new(Schema::Any)), json!({})),
            ]),
        ),
        Field::optional("env", Schema::MapOf(Box::new(Schema::Str)), json!({})),
        Field::required("input", Schema::List(Box::new(Schema::Any))),
        Field::optional("transform", Schema::List(Box::new(Schema::Any)), json!([])),
        Field::optional("output", Schema::List(Box::new(Schema::Any)), json!([])),
    ])
}

/// Base fields shared by every module entry; used alone when a disabled
/// entry skips its type-specific schemas.
pub fn module_base_fields(opts: &SchemaOptions) -> Vec<Field> {
    vec![
        Field::required("type", Schema::Name),
        Field::optional(
            "name",
            Schema::Nullable(Box::new(Schema::Name)),
            serde_json::Value::Null,
        ),
        Field::optional("enabled", Schema::Bool, opts.enabled_default()),
    ]
}

fn nullable_pattern_list(key: &str) -> Field {
    Field::optional(
        key,
        Schema::Nullable(Box::new(Schema::List(Box::new(Schema::Str)))),
        serde_json::Value::Null,
    )
}

/// Full schema for one module entry of the given type.
pub fn module_schema(spec: &ModuleSpec, opts: &SchemaOptions) -> Schema {
    let mut fields = module_base_fields(opts);
    fields.push(Field::required(
        "connection",
        spec.connection_schema.clone(),
    ));

    match spec.kind {
        ModuleKind::Input => {
            fields.push(Field::optional(
                "tasks",
                Schema::List(Box::new(task_schema(&spec.params_schema, opts))),
                json!([]),
            ));
        }
        ModuleKind::Transform | ModuleKind::Output => {
            fields.push(Field::required("params", spec.params_schema.clone()));
            fields.push(nullable_pattern_list("include_tasks"));
            fields.push(nullable_pattern_list("exclude_tasks"));
            fields.push(nullable_pattern_list("include_inputs"));
            fields.push(nullable_pattern_list("exclude_inputs"));
            if spec.kind == ModuleKind::Transform {
                fields.push(Field::optional("priority", Schema::Int, json!(0)));
            }
        }
    }

    Schema::Map(fields)
}

/// Schema for a task entry, parameterized by the owning input's
/// task-parameter schema. `repeat_for` never reaches validation: the
/// loader expands it first.
pub fn task_schema(params_schema: &Schema, opts: &SchemaOptions) -> Schema {
    let retries_default = if opts.run_once { json!(0) } else { json!(2) };
    let delay_default = if opts.run_once { json!(0) } else { json!(10) };

    Schema::Map(vec![
        Field::required("name", Schema::Name),
        Field::required("cron", Schema::Cron),
        Field::optional("enabled", Schema::Bool, opts.enabled_default()),
        Field::optional_default(
            "result",
            Schema::Map(vec![
                Field::optional(
                    "metrics",
                    Schema::Nullable(Box::new(Schema::List(Box::new(Schema::Str)))),
                    json!(["metric"]),
                ),
                Field::optional(
                    "attributes",
                    Schema::Nullable(Box::new(Schema::List(Box::new(Schema::Str)))),
                    serde_json::Value::Null,
                ),
            ]),
        ),
        Field::optional(
            "static_attributes",
            Schema::MapOf(Box::new(Schema::Any)),
            json!({}),
        ),
        Field::optional("max_retries", Schema::Int, retries_default),
        Field::optional("retry_delay", Schema::Duration, delay_default),
        Field::optional_default(
            "modifiers",
            Schema::Map(vec![
                Field::optional("time_modulus", Schema::Duration, json!(0)),
                Field::optional("time_offset", Schema::Duration, json!(0)),
            ]),
        ),
        Field::required("params", params_schema.clone()),
    ])
}

//! Declarative configuration schemas.
//!
//! A schema is a tree of [`Schema`] nodes interpreted by the validator
//! in [`validator`]. Defaults travel with the schema: an optional field
//! carries its default value, and a map whose fields are all optional
//! can be synthesized entirely from defaults when omitted.

pub mod suggest;
pub mod validator;

use serde_json::Value;

pub use validator::{validate, SchemaError};

/// A schema node.
#[derive(Debug, Clone)]
pub enum Schema {
    /// Any UTF-8 string.
    Str,
    /// Integer number.
    Int,
    /// Any number.
    Float,
    Bool,
    /// Seconds as a number, or a duration string (`"90s"`, `"-1h:30m"`).
    Duration,
    /// Five-field crontab expression.
    Cron,
    /// Module/task name: letters, digits, `_-.+`; normalized to lowercase.
    Name,
    /// Accepts anything unchanged.
    Any,
    /// `null`, or the inner schema.
    Nullable(Box<Schema>),
    /// Homogeneous list. A bare element is coerced to a one-element list.
    List(Box<Schema>),
    /// Free-form map from string keys to values of the inner schema.
    MapOf(Box<Schema>),
    /// Map with a fixed key set.
    Map(Vec<Field>),
    /// First branch that validates wins; map branches are scored by how
    /// many of their required keys are present.
    Union(Vec<Schema>),
}

/// One key of a [`Schema::Map`].
#[derive(Debug, Clone)]
pub struct Field {
    pub key: String,
    pub required: bool,
    /// Inserted when an optional key is absent. An absent default on an
    /// optional field falls back to the node's synthesized default, or
    /// `null`.
    pub default: Option<Value>,
    pub schema: Schema,
}

impl Field {
    pub fn required(key: impl Into<String>, schema: Schema) -> Self {
        Self {
            key: key.into(),
            required: true,
            default: None,
            schema,
        }
    }

    pub fn optional(key: impl Into<String>, schema: Schema, default: Value) -> Self {
        Self {
            key: key.into(),
            required: false,
            default: Some(default),
            schema,
        }
    }

    /// Optional key whose default is synthesized from the schema itself
    /// (all-optional maps), or `null`.
    pub fn optional_default(key: impl Into<String>, schema: Schema) -> Self {
        Self {
            key: key.into(),
            required: false,
            default: None,
            schema,
        }
    }

    /// The value used when this field is absent, if the field may be
    /// absent at all.
    pub fn absent_value(&self) -> Option<Value> {
        if let Some(d) = &self.default {
            return Some(d.clone());
        }
        if let Some(d) = self.schema.synthesized_default() {
            return Some(d);
        }
        if self.required {
            None
        } else {
            Some(Value::Null)
        }
    }
}

impl Schema {
    /// Shorthand for an empty fixed map (modules without connection or
    /// parameter settings).
    pub fn empty_map() -> Self {
        Self::Map(Vec::new())
    }

    /// The default value a node can produce without any input: a map all
    /// of whose fields are optional, or the first such branch of a
    /// union.
    pub fn synthesized_default(&self) -> Option<Value> {
        match self {
            Self::Map(fields) => {
                let mut obj = serde_json::Map::new();
                for f in fields {
                    if f.required {
                        return None;
                    }
                    obj.insert(f.key.clone(), f.absent_value()?);
                }
                Some(Value::Object(obj))
            }
            Self::Union(branches) => branches.iter().find_map(Schema::synthesized_default),
            Self::Nullable(_) => Some(Value::Null),
            _ => None,
        }
    }

    /// An example value for diagnostics, drawn from defaults where
    /// available.
    pub fn example(&self) -> String {
        match self.synthesized_default() {
            Some(v) => v.to_string(),
            None => match self {
                Self::Str | Self::Name => "<string>".into(),
                Self::Int => "<int>".into(),
                Self::Float => "<number>".into(),
                Self::Bool => "<bool>".into(),
                Self::Duration => "<duration>".into(),
                Self::Cron => "\"* * * * *\"".into(),
                Self::List(inner) => format!("[{}]", inner.example()),
                _ => "<value>".into(),
            },
        }
    }
}

/// One step into the configuration tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSeg {
    Key(String),
    Index(usize),
}

/// Dotted/indexed location of a configuration element, rendered as
/// `[input][2][tasks][1]`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigPath(Vec<PathSeg>);

impl ConfigPath {
    pub fn root() -> Self {
        Self::default()
    }

    pub fn key(&self, k: impl Into<String>) -> Self {
        let mut segs = self.0.clone();
        segs.push(PathSeg::Key(k.into()));
        Self(segs)
    }

    pub fn index(&self, i: usize) -> Self {
        let mut segs = self.0.clone();
        segs.push(PathSeg::Index(i));
        Self(segs)
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn segments(&self) -> &[PathSeg] {
        &self.0
    }
}

impl std::fmt::Display for ConfigPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0.is_empty() {
            return f.write_str("<root>");
        }
        for seg in &self.0 {
            match seg {
                PathSeg::Key(k) => write!(f, "[{k}]")?,
                PathSeg::Index(i) => write!(f, "[{i}]")?,
            }
        }
        Ok(())
    }
}

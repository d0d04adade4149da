//! Module type registry.
//!
//! Resolves a configuration `type` string to a factory plus the schemas
//! that govern its `connection` block and its parameters (task
//! parameters for inputs, module parameters for transforms and
//! outputs). Registration is explicit; duplicate type names within a
//! variant are rejected.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{bail, Result};
use serde_json::Value;

use crate::modules::{Input, Output, Transform};
use crate::schema::Schema;
use streamlet_types::Record;

/// The three module variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ModuleKind {
    Input,
    Transform,
    Output,
}

impl std::fmt::Display for ModuleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Input => "input",
            Self::Transform => "transform",
            Self::Output => "output",
        })
    }
}

/// Everything a factory gets to build a module instance.
#[derive(Debug, Clone)]
pub struct ModuleCtx {
    /// Resolved (possibly generated) module name.
    pub name: String,
    /// Validated `connection` block.
    pub connection: Value,
    /// Validated module parameters. Empty for inputs, whose parameters
    /// live on their tasks.
    pub params: Record,
}

/// A constructed module instance.
pub enum ModuleHandle {
    Input(Arc<dyn Input>),
    Transform(Arc<dyn Transform>),
    Output(Arc<dyn Output>),
}

impl ModuleHandle {
    pub fn kind(&self) -> ModuleKind {
        match self {
            Self::Input(_) => ModuleKind::Input,
            Self::Transform(_) => ModuleKind::Transform,
            Self::Output(_) => ModuleKind::Output,
        }
    }
}

type Factory = Arc<dyn Fn(ModuleCtx) -> Result<ModuleHandle> + Send + Sync>;

/// Registered description of one module type.
#[derive(Clone)]
pub struct ModuleSpec {
    pub kind: ModuleKind,
    /// Shape of the `connection` block.
    pub connection_schema: Schema,
    /// Task-parameter schema for inputs; module-parameter schema for
    /// transforms and outputs.
    pub params_schema: Schema,
    pub factory: Factory,
}

impl ModuleSpec {
    pub fn new<F>(kind: ModuleKind, factory: F) -> Self
    where
        F: Fn(ModuleCtx) -> Result<ModuleHandle> + Send + Sync + 'static,
    {
        Self {
            kind,
            connection_schema: Schema::empty_map(),
            params_schema: Schema::empty_map(),
            factory: Arc::new(factory),
        }
    }

    pub fn with_connection_schema(mut self, schema: Schema) -> Self {
        self.connection_schema = schema;
        self
    }

    pub fn with_params_schema(mut self, schema: Schema) -> Self {
        self.params_schema = schema;
        self
    }
}

/// Table of known module types, keyed by variant and `type` name.
#[derive(Default, Clone)]
pub struct Registry {
    entries: BTreeMap<(ModuleKind, String), ModuleSpec>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with the built-in modules.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        crate::modules::builtin::register(&mut registry)
            .expect("built-in module registration is conflict-free");
        registry
    }

    /// Register a module type. Fails on duplicate names within the
    /// variant.
    pub fn register(&mut self, type_name: impl Into<String>, spec: ModuleSpec) -> Result<()> {
        let type_name = type_name.into();
        let key = (spec.kind, type_name.clone());
        if self.entries.contains_key(&key) {
            bail!(
                "{} module type `{type_name}` is already registered",
                spec.kind
            );
        }
        self.entries.insert(key, spec);
        Ok(())
    }

    pub fn get(&self, kind: ModuleKind, type_name: &str) -> Option<&ModuleSpec> {
        self.entries.get(&(kind, type_name.to_string()))
    }

    /// Known type names of one variant, for diagnostics.
    pub fn known_types(&self, kind: ModuleKind) -> Vec<&str> {
        self.entries
            .keys()
            .filter(|(k, _)| *k == kind)
            .map(|(_, name)| name.as_str())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

//! Typed view of a validated configuration document.
//!
//! The loader normalizes the raw document first (defaults filled,
//! selectors coerced to lists, names lowercased); these structs decode
//! that normalized form. Absent module names are generated here from a
//! hash of the module's configuration.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use streamlet_types::duration::seconds_from_value;
use streamlet_types::Record;

/// The whole composed configuration.
#[derive(Debug, Clone, Serialize)]
pub struct FlowConfig {
    pub version: String,
    pub inputs: Vec<ModuleConfig>,
    pub transforms: Vec<ModuleConfig>,
    pub outputs: Vec<ModuleConfig>,
}

/// One module entry of any variant. Variant-specific fields are `None`
/// or empty where they do not apply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleConfig {
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default)]
    pub name: Option<String>,
    pub enabled: bool,
    #[serde(default)]
    pub connection: Value,
    /// Module parameters (transforms and outputs).
    #[serde(default)]
    pub params: Record,
    /// Transform ordering within the chain; ties keep declaration order.
    #[serde(default)]
    pub priority: i64,
    #[serde(flatten)]
    pub filters: Filters,
    /// Owned tasks (inputs only).
    #[serde(default)]
    pub tasks: Vec<TaskConfig>,
}

impl ModuleConfig {
    /// The configured name, or a deterministic `<type>_<hash8>` derived
    /// from the entry itself.
    pub fn resolved_name(&self, raw: &Value) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => {
                let mut hasher = DefaultHasher::new();
                raw.to_string().hash(&mut hasher);
                format!("{}_{:08x}", self.type_name, hasher.finish() as u32)
            }
        }
    }
}

/// Routing filters on transforms and outputs. Include and exclude of
/// the same kind never coexist (enforced during validation).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Filters {
    #[serde(default)]
    pub include_tasks: Option<Vec<String>>,
    #[serde(default)]
    pub exclude_tasks: Option<Vec<String>>,
    #[serde(default)]
    pub include_inputs: Option<Vec<String>>,
    #[serde(default)]
    pub exclude_inputs: Option<Vec<String>>,
}

impl Filters {
    /// Whether a (task, input) pair passes every configured filter.
    /// Filter entries are glob patterns; a missing filter admits all.
    pub fn admits(&self, task_name: &str, input_name: &str) -> bool {
        let matches_any =
            |patterns: &[String], text: &str| patterns.iter().any(|p| crate::glob::glob_match(p, text));

        if let Some(include) = &self.include_inputs {
            if !matches_any(include, input_name) {
                return false;
            }
        }
        if let Some(exclude) = &self.exclude_inputs {
            if matches_any(exclude, input_name) {
                return false;
            }
        }
        if let Some(include) = &self.include_tasks {
            if !matches_any(include, task_name) {
                return false;
            }
        }
        if let Some(exclude) = &self.exclude_tasks {
            if matches_any(exclude, task_name) {
                return false;
            }
        }
        true
    }

    /// All configured patterns, paired with the filter kind they belong
    /// to. Used for the startup sanity warnings.
    pub fn patterns(&self) -> impl Iterator<Item = (&'static str, &str)> + '_ {
        let pairs = [
            ("include_tasks", &self.include_tasks),
            ("exclude_tasks", &self.exclude_tasks),
            ("include_inputs", &self.include_inputs),
            ("exclude_inputs", &self.exclude_inputs),
        ];
        pairs
            .into_iter()
            .filter_map(|(kind, list)| list.as_ref().map(|l| (kind, l)))
            .flat_map(|(kind, list)| list.iter().map(move |p| (kind, p.as_str())))
    }
}

/// A scheduled unit owned by one input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    pub name: String,
    pub cron: String,
    pub enabled: bool,
    pub result: ResultSelector,
    #[serde(default)]
    pub static_attributes: Record,
    pub max_retries: u32,
    /// Seconds between input retry attempts.
    #[serde(deserialize_with = "de_seconds")]
    pub retry_delay: f64,
    pub modifiers: Modifiers,
    #[serde(default)]
    pub params: Record,
}

/// Field selection for projecting records into metrics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultSelector {
    /// `None` means an explicit `metrics: null` — value-less metrics,
    /// gated by `allow_none_metric`.
    pub metrics: Option<Vec<String>>,
    /// `None` means: all flattened keys not consumed as metrics.
    pub attributes: Option<Vec<String>>,
}

impl Default for ResultSelector {
    fn default() -> Self {
        Self {
            metrics: Some(vec!["metric".to_string()]),
            attributes: None,
        }
    }
}

/// Timestamp adjustments, both in seconds. A modulus of zero is the
/// identity.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Modifiers {
    #[serde(deserialize_with = "de_seconds")]
    pub time_modulus: f64,
    #[serde(deserialize_with = "de_seconds")]
    pub time_offset: f64,
}

fn de_seconds<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    seconds_from_value(&value).map_err(serde::de::Error::custom)
}

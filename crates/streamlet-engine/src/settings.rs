//! Typed runtime settings with source precedence.
//!
//! Settings come from three places. Command-line flags win and are
//! pinned; `STREAMLET_<NAME>` environment variables come second;
//! `flow.settings` in the configuration supplies the rest. Because
//! modules and schemas are constructed before the configuration is
//! read, anything gating that construction (the configuration path
//! itself, most notably) must arrive via flag or environment.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono_tz::Tz;
use serde_json::Value;

use streamlet_types::duration::seconds_from_value;
use streamlet_types::FlowError;

use crate::schema::suggest;

/// Fire execution policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PoolMode {
    /// Fires run concurrently; distinct fires of one task may overlap.
    #[default]
    Parallel,
    /// One fire at a time across the whole flow. Debugging aid.
    Serial,
}

impl std::str::FromStr for PoolMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "parallel" => Ok(Self::Parallel),
            "serial" => Ok(Self::Serial),
            other => Err(format!("`{other}` is not a pool mode (parallel|serial)")),
        }
    }
}

/// Where a value came from; later sources never override earlier ones
/// of higher rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Source {
    Default,
    Config,
    Env,
    Cli,
}

#[derive(Debug, Clone, Copy)]
enum Kind {
    Bool,
    Int,
    Str,
    Duration,
}

/// Every recognized setting and the type its values must carry.
const KNOWN: &[(&str, Kind)] = &[
    ("config", Kind::Str),
    ("log_level", Kind::Int),
    ("only_validate", Kind::Bool),
    ("run_once", Kind::Bool),
    ("print_config", Kind::Bool),
    ("print_traceback", Kind::Bool),
    ("disable_outputs", Kind::Bool),
    ("disable_default", Kind::Bool),
    ("pool", Kind::Str),
    ("disable_readiness_probe", Kind::Bool),
    ("skip_disabled_validation", Kind::Bool),
    ("allow_none_metric", Kind::Bool),
    ("nested_attr_seperator", Kind::Str),
    ("timezone", Kind::Str),
    ("task_name_prefix", Kind::Str),
    ("shutdown_grace", Kind::Duration),
];

/// Resolved settings. Read-only once the flow is built.
#[derive(Debug, Clone)]
pub struct Settings {
    pub config: Vec<PathBuf>,
    /// 0 = off, 1 = error, 2 = warn, 3 = info, 4 = debug, 5 = trace.
    pub log_level: u8,
    pub only_validate: bool,
    pub run_once: bool,
    pub print_config: bool,
    pub print_traceback: bool,
    pub disable_outputs: bool,
    pub disable_default: bool,
    pub pool: PoolMode,
    pub disable_readiness_probe: bool,
    pub skip_disabled_validation: bool,
    pub allow_none_metric: bool,
    pub nested_attr_seperator: String,
    pub timezone: Tz,
    pub task_name_prefix: String,
    /// Seconds in-flight fires get to finish on shutdown.
    pub shutdown_grace: f64,

    sources: HashMap<String, Source>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            config: vec![PathBuf::from("/etc/streamlet/flow.yaml")],
            log_level: 3,
            only_validate: false,
            run_once: false,
            print_config: false,
            print_traceback: false,
            disable_outputs: false,
            disable_default: false,
            pool: PoolMode::Parallel,
            disable_readiness_probe: false,
            skip_disabled_validation: false,
            allow_none_metric: false,
            nested_attr_seperator: ".".to_string(),
            timezone: chrono_tz::UTC,
            task_name_prefix: String::new(),
            shutdown_grace: 30.0,
            sources: HashMap::new(),
        }
    }
}

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    /// `RUST_LOG`-style filter for the configured level.
    pub fn log_filter(&self) -> &'static str {
        match self.log_level {
            0 => "off",
            1 => "error",
            2 => "warn",
            3 => "info",
            4 => "debug",
            _ => "trace",
        }
    }

    fn kind_of(key: &str) -> Option<Kind> {
        KNOWN
            .iter()
            .find(|(name, _)| *name == key)
            .map(|(_, kind)| *kind)
    }

    /// Apply one value. Lower-ranked sources silently lose to values
    /// already pinned by a higher-ranked one.
    fn set(&mut self, key: &str, value: &Value, source: Source) -> Result<(), String> {
        let Some(kind) = Self::kind_of(key) else {
            let known = KNOWN.iter().map(|(name, _)| *name);
            return Err(match suggest::closest(key, known) {
                Some(best) => format!("unknown setting `{key}`. Did you mean `{best}`?"),
                None => format!("unknown setting `{key}`"),
            });
        };

        if let Some(existing) = self.sources.get(key) {
            if *existing >= source {
                tracing::debug!(setting = key, "Skipping overridden setting source");
                return Ok(());
            }
        }

        match kind {
            Kind::Bool => {
                let Some(b) = value.as_bool() else {
                    return Err(format!("setting `{key}` expects a bool"));
                };
                match key {
                    "only_validate" => self.only_validate = b,
                    "run_once" => self.run_once = b,
                    "print_config" => self.print_config = b,
                    "print_traceback" => self.print_traceback = b,
                    "disable_outputs" => self.disable_outputs = b,
                    "disable_default" => self.disable_default = b,
                    "disable_readiness_probe" => self.disable_readiness_probe = b,
                    "skip_disabled_validation" => self.skip_disabled_validation = b,
                    "allow_none_metric" => self.allow_none_metric = b,
                    _ => unreachable!("bool setting table drift: {key}"),
                }
            }
            Kind::Int => {
                let Some(i) = value.as_i64() else {
                    return Err(format!("setting `{key}` expects an integer"));
                };
                match key {
                    "log_level" => {
                        if !(0..=5).contains(&i) {
                            return Err("setting `log_level` expects 0..=5".to_string());
                        }
                        self.log_level = i as u8;
                    }
                    _ => unreachable!("int setting table drift: {key}"),
                }
            }
            Kind::Duration => {
                let secs = seconds_from_value(value)
                    .map_err(|e| format!("setting `{key}`: {e}"))?;
                match key {
                    "shutdown_grace" => {
                        if secs < 0.0 {
                            return Err("setting `shutdown_grace` must not be negative".into());
                        }
                        self.shutdown_grace = secs;
                    }
                    _ => unreachable!("duration setting table drift: {key}"),
                }
            }
            Kind::Str => match key {
                "config" => match value {
                    Value::String(s) => self.config = vec![PathBuf::from(s)],
                    Value::Array(items) => {
                        let mut paths = Vec::with_capacity(items.len());
                        for item in items {
                            match item.as_str() {
                                Some(s) => paths.push(PathBuf::from(s)),
                                None => return Err("setting `config` expects path strings".into()),
                            }
                        }
                        if paths.is_empty() {
                            return Err("setting `config` expects at least one path".into());
                        }
                        self.config = paths;
                    }
                    _ => return Err("setting `config` expects a path string".into()),
                },
                _ => {
                    let Some(s) = value.as_str() else {
                        return Err(format!("setting `{key}` expects a string"));
                    };
                    match key {
                        "pool" => self.pool = s.parse()?,
                        "nested_attr_seperator" => {
                            if s.is_empty() {
                                return Err(
                                    "setting `nested_attr_seperator` must not be empty".into()
                                );
                            }
                            self.nested_attr_seperator = s.to_string();
                        }
                        "timezone" => {
                            self.timezone = s
                                .parse::<Tz>()
                                .map_err(|_| format!("`{s}` is not an IANA timezone name"))?;
                        }
                        "task_name_prefix" => self.task_name_prefix = s.to_string(),
                        _ => unreachable!("string setting table drift: {key}"),
                    }
                }
            },
        }

        self.sources.insert(key.to_string(), source);
        Ok(())
    }

    /// Apply command-line values. These are pinned: nothing applied
    /// later can overwrite them.
    pub fn apply_cli<'a, I>(&mut self, pairs: I) -> Result<(), FlowError>
    where
        I: IntoIterator<Item = (&'a str, Value)>,
    {
        for (key, value) in pairs {
            self.set(key, &value, Source::Cli)
                .map_err(|msg| FlowError::config(format!("--{}", key.replace('_', "-")), msg))?;
        }
        Ok(())
    }

    /// Read `STREAMLET_<NAME>` for every known setting.
    pub fn apply_env(&mut self) -> Result<(), FlowError> {
        for (key, kind) in KNOWN {
            let var = format!("STREAMLET_{}", key.to_uppercase());
            let Ok(raw) = std::env::var(&var) else {
                continue;
            };
            let value = env_value(*kind, &raw)
                .map_err(|msg| FlowError::config(var.clone(), msg))?;
            self.set(key, &value, Source::Env)
                .map_err(|msg| FlowError::config(var.clone(), msg))?;
        }
        Ok(())
    }

    /// Apply `flow.settings` from the configuration document.
    pub fn apply_config(&mut self, map: &serde_json::Map<String, Value>) -> Result<(), FlowError> {
        for (key, value) in map {
            self.set(key, value, Source::Config).map_err(|msg| {
                let suggestion = msg
                    .contains("Did you mean")
                    .then(|| suggest::closest(key, KNOWN.iter().map(|(n, _)| *n)))
                    .flatten()
                    .map(str::to_string);
                FlowError::ConfigInvalid {
                    path: format!("[flow][settings][{key}]"),
                    message: msg,
                    suggestion,
                }
            })?;
        }
        Ok(())
    }
}

fn env_value(kind: Kind, raw: &str) -> Result<Value, String> {
    match kind {
        Kind::Bool => match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Value::Bool(true)),
            "0" | "false" | "no" | "off" => Ok(Value::Bool(false)),
            other => Err(format!("`{other}` is not a bool")),
        },
        Kind::Int => raw
            .parse::<i64>()
            .map(Value::from)
            .map_err(|_| format!("`{raw}` is not an integer")),
        Kind::Str | Kind::Duration => Ok(Value::String(raw.to_string())),
    }
}

//! Flow assembly and lifecycle.
//!
//! A [`Flow`] owns the registry-built module instances, the compiled
//! task chains, and the resolved settings. Construction performs the
//! whole startup sequence short of scheduling: load and validate the
//! configuration, instantiate enabled modules, compile chains, and run
//! the filter sanity pass. [`Flow::run`] then drives lifecycle hooks
//! and the scheduler.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::broadcast;

use streamlet_types::FlowError;

use crate::chain::{self, TaskChain};
use crate::config::model::{FlowConfig, ModuleConfig, TaskConfig};
use crate::config::{self};
use crate::cron_expr::parse_cron;
use crate::frame::FrameOptions;
use crate::glob;
use crate::modules::{Input, Output, Transform};
use crate::registry::{ModuleCtx, ModuleHandle, ModuleKind, Registry};
use crate::scheduler;
use crate::schema::ConfigPath;
use crate::settings::Settings;

/// Everything the scheduler needs, immutable after startup. Module
/// slots are `None` for disabled entries, which are never instantiated.
pub struct FlowRuntime {
    pub settings: Settings,
    pub config: FlowConfig,
    pub inputs: Vec<Option<Arc<dyn Input>>>,
    pub transforms: Vec<Option<Arc<dyn Transform>>>,
    pub outputs: Vec<Option<Arc<dyn Output>>>,
    pub chains: Vec<TaskChain>,
}

impl FlowRuntime {
    pub fn frame_options(&self) -> FrameOptions {
        FrameOptions {
            separator: self.settings.nested_attr_seperator.clone(),
            allow_none_metric: self.settings.allow_none_metric,
        }
    }

    pub fn task(&self, chain: &TaskChain) -> &TaskConfig {
        &self.config.inputs[chain.input_index].tasks[chain.task_index]
    }

    pub fn input_config(&self, chain: &TaskChain) -> &ModuleConfig {
        &self.config.inputs[chain.input_index]
    }

    /// A task fires only when both it and its owning input are enabled.
    pub fn task_enabled(&self, chain: &TaskChain) -> bool {
        self.task(chain).enabled && self.input_config(chain).enabled
    }
}

/// The top-level application instance.
pub struct Flow {
    runtime: Arc<FlowRuntime>,
    shutdown: broadcast::Sender<()>,
}

impl std::fmt::Debug for Flow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Flow").finish_non_exhaustive()
    }
}

impl Flow {
    /// Load the configuration named by `settings.config` and assemble
    /// the flow. Any configuration problem fails here.
    pub fn build(mut settings: Settings, registry: &Registry) -> Result<Self, FlowError> {
        let config = config::load(registry, &mut settings)?;

        check_none_metric_gate(&config, &settings)?;

        let inputs = instantiate(&config.inputs, ModuleKind::Input, registry, |h| match h {
            ModuleHandle::Input(m) => Some(m),
            _ => None,
        })?;
        let transforms =
            instantiate(&config.transforms, ModuleKind::Transform, registry, |h| {
                match h {
                    ModuleHandle::Transform(m) => Some(m),
                    _ => None,
                }
            })?;
        let outputs = instantiate(&config.outputs, ModuleKind::Output, registry, |h| match h {
            ModuleHandle::Output(m) => Some(m),
            _ => None,
        })?;

        let order = chain::transform_order(&config.transforms);
        let mut chains = Vec::new();
        for (input_index, input) in config.inputs.iter().enumerate() {
            let input_name = input.name.clone().unwrap_or_default();
            for (task_index, task) in input.tasks.iter().enumerate() {
                chains.push(chain::compile(
                    input_index,
                    task_index,
                    task,
                    &input_name,
                    &config.transforms,
                    &order,
                    &config.outputs,
                    settings.disable_outputs,
                ));
            }
        }

        let runtime = FlowRuntime {
            settings,
            config,
            inputs,
            transforms,
            outputs,
            chains,
        };
        warn_unmatched_filters(&runtime);

        tracing::info!(
            inputs = runtime.config.inputs.len(),
            transforms = runtime.config.transforms.len(),
            outputs = runtime.config.outputs.len(),
            tasks = runtime.chains.len(),
            "Configured flow"
        );

        let (shutdown, _) = broadcast::channel(4);
        Ok(Self {
            runtime: Arc::new(runtime),
            shutdown,
        })
    }

    pub fn runtime(&self) -> &Arc<FlowRuntime> {
        &self.runtime
    }

    pub fn settings(&self) -> &Settings {
        &self.runtime.settings
    }

    /// Handle for requesting shutdown from outside (tests, embedders).
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown.clone()
    }

    /// One line per task: next fire estimate, task name, and the
    /// compiled chain.
    pub fn render_chains(&self) -> String {
        let runtime = &self.runtime;
        let now = Utc::now().with_timezone(&runtime.settings.timezone);

        let mut rows: Vec<(String, String, String)> = Vec::new();
        for chain in &runtime.chains {
            let task = runtime.task(chain);
            let input = runtime.input_config(chain);

            let eta = if runtime.task_enabled(chain) {
                match parse_cron(&task.cron)
                    .ok()
                    .and_then(|s| s.after(&now).next())
                {
                    Some(next) => {
                        let secs = (next - now).num_seconds().max(0);
                        format!("[in {}]", format_eta(secs))
                    }
                    None => "[never]".to_string(),
                }
            } else {
                "[>disabled<]".to_string()
            };

            let mut stages = vec![format!("[IN]{}", input.name.as_deref().unwrap_or("?"))];
            for &i in &chain.transforms {
                let name = runtime.config.transforms[i].name.as_deref().unwrap_or("?");
                stages.push(format!("[TR]{name}"));
            }
            for &i in &chain.outputs {
                let name = runtime.config.outputs[i].name.as_deref().unwrap_or("?");
                stages.push(format!("[OUT]{name}"));
            }

            rows.push((eta, task.name.clone(), stages.join(" -> ")));
        }
        rows.sort_by(|a, b| a.1.cmp(&b.1));

        let eta_width = rows.iter().map(|r| r.0.len()).max().unwrap_or(0);
        let name_width = rows.iter().map(|r| r.1.len()).max().unwrap_or(0);
        rows.iter()
            .map(|(eta, name, chain)| {
                format!("  {eta:>eta_width$} {name:<name_width$} : {chain}")
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Run `on_connect` for every enabled module, in registration order
    /// (inputs, then transforms, then outputs). The first failure
    /// aborts startup.
    pub async fn connect_all(&self) -> Result<(), FlowError> {
        for (name, module) in self.lifecycle_modules() {
            module.on_connect().await.map_err(|error| {
                FlowError::StartupHook {
                    module: name.clone(),
                    error,
                }
            })?;
            tracing::debug!(module = name, "Connected module");
        }
        tracing::info!("Flow modules are ready");
        Ok(())
    }

    /// Flush-stage shutdown hooks, forward order. Failures are logged
    /// and do not block.
    pub async fn pre_shutdown_all(&self) {
        for (name, module) in self.lifecycle_modules() {
            if let Err(e) = module.on_pre_shutdown().await {
                tracing::error!(module = name, error = %e, "Pre-shutdown hook failed");
            }
        }
    }

    /// Close-stage shutdown hooks, reverse order. Failures are logged
    /// and do not block.
    pub async fn shutdown_all(&self) {
        for (name, module) in self.lifecycle_modules().into_iter().rev() {
            if let Err(e) = module.on_shutdown().await {
                tracing::error!(module = name, error = %e, "Shutdown hook failed");
            }
        }
    }

    /// Full run: connect hooks, scheduler until completion or shutdown
    /// signal, then the shutdown hooks.
    pub async fn run(&self) -> Result<(), FlowError> {
        self.connect_all().await?;

        let signal_tx = self.shutdown.clone();
        let signals = tokio::spawn(async move {
            wait_for_signal().await;
            tracing::info!("Shutdown signal received");
            let _ = signal_tx.send(());
        });

        let result = scheduler::run(self.runtime.clone(), self.shutdown.clone()).await;
        signals.abort();

        tracing::info!("Cleaning up and flushing modules");
        self.pre_shutdown_all().await;
        tracing::info!("Shutting down flow modules");
        self.shutdown_all().await;

        result
    }

    /// Enabled modules with their names, in registration order.
    fn lifecycle_modules(&self) -> Vec<(String, Arc<dyn crate::modules::Lifecycle>)> {
        let runtime = &self.runtime;
        let mut modules: Vec<(String, Arc<dyn crate::modules::Lifecycle>)> = Vec::new();

        for (config, handle) in runtime.config.inputs.iter().zip(&runtime.inputs) {
            if let Some(h) = handle {
                let lifecycle: Arc<dyn crate::modules::Lifecycle> = h.clone();
                modules.push((config.name.clone().unwrap_or_default(), lifecycle));
            }
        }
        for (config, handle) in runtime.config.transforms.iter().zip(&runtime.transforms) {
            if let Some(h) = handle {
                let lifecycle: Arc<dyn crate::modules::Lifecycle> = h.clone();
                modules.push((config.name.clone().unwrap_or_default(), lifecycle));
            }
        }
        for (config, handle) in runtime.config.outputs.iter().zip(&runtime.outputs) {
            if let Some(h) = handle {
                let lifecycle: Arc<dyn crate::modules::Lifecycle> = h.clone();
                modules.push((config.name.clone().unwrap_or_default(), lifecycle));
            }
        }
        modules
    }
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(e) => {
                tracing::warn!(error = %e, "Cannot listen for SIGTERM, falling back to ctrl-c");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// Tasks selecting `metrics: null` need `allow_none_metric`.
fn check_none_metric_gate(config: &FlowConfig, settings: &Settings) -> Result<(), FlowError> {
    if settings.allow_none_metric {
        return Ok(());
    }
    for (input_index, input) in config.inputs.iter().enumerate() {
        for (task_index, task) in input.tasks.iter().enumerate() {
            if task.result.metrics.is_none() {
                return Err(FlowError::config(
                    ConfigPath::root()
                        .key("input")
                        .index(input_index)
                        .key("tasks")
                        .index(task_index)
                        .key("result")
                        .key("metrics")
                        .to_string(),
                    "`metrics: null` requires the `allow_none_metric` setting",
                ));
            }
        }
    }
    Ok(())
}

fn instantiate<T: ?Sized>(
    configs: &[ModuleConfig],
    kind: ModuleKind,
    registry: &Registry,
    extract: impl Fn(ModuleHandle) -> Option<Arc<T>>,
) -> Result<Vec<Option<Arc<T>>>, FlowError> {
    let mut handles = Vec::with_capacity(configs.len());
    for (index, config) in configs.iter().enumerate() {
        if !config.enabled {
            tracing::debug!(
                module = config.name.as_deref().unwrap_or("?"),
                "Module is disabled, skipping construction"
            );
            handles.push(None);
            continue;
        }

        let path = ConfigPath::root().key(kind.to_string()).index(index);
        let spec = registry.get(kind, &config.type_name).ok_or_else(|| {
            FlowError::config(
                path.key("type").to_string(),
                format!("{kind} type `{}` is unknown", config.type_name),
            )
        })?;

        let ctx = ModuleCtx {
            name: config.name.clone().unwrap_or_default(),
            connection: config.connection.clone(),
            params: config.params.clone(),
        };
        let handle = (spec.factory)(ctx).map_err(|e| {
            FlowError::config(path.to_string(), format!("module construction failed: {e:#}"))
        })?;
        let extracted = extract(handle).ok_or_else(|| {
            FlowError::config(
                path.to_string(),
                format!("factory for `{}` returned the wrong module variant", config.type_name),
            )
        })?;
        handles.push(Some(extracted));
    }
    Ok(handles)
}

/// Warn about routing filter patterns that match nothing.
fn warn_unmatched_filters(runtime: &FlowRuntime) {
    let input_names: Vec<&str> = runtime
        .config
        .inputs
        .iter()
        .filter_map(|m| m.name.as_deref())
        .collect();
    let task_names: Vec<&str> = runtime
        .config
        .inputs
        .iter()
        .flat_map(|m| m.tasks.iter().map(|t| t.name.as_str()))
        .collect();

    let modules = runtime
        .config
        .transforms
        .iter()
        .chain(runtime.config.outputs.iter());
    for module in modules {
        for (kind, pattern) in module.filters.patterns() {
            let pool: &[&str] = if kind.ends_with("inputs") {
                &input_names
            } else {
                &task_names
            };
            if !pool.iter().any(|name| glob::glob_match(pattern, name)) {
                tracing::warn!(
                    module = module.name.as_deref().unwrap_or("?"),
                    filter = kind,
                    pattern,
                    "Filter pattern does not match any configured name"
                );
            }
        }
    }
}

fn format_eta(total_secs: i64) -> String {
    let days = total_secs / 86_400;
    let hours = (total_secs % 86_400) / 3600;
    let minutes = (total_secs % 3600) / 60;
    let secs = total_secs % 60;
    if days > 0 {
        format!("{days}d {hours:02}:{minutes:02}:{secs:02}")
    } else {
        format!("{hours:02}:{minutes:02}:{secs:02}")
    }
}

mod logging;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use serde_json::{json, Value};

use streamlet_engine::{Flow, Registry, Settings};
use streamlet_types::FlowError;

/// Configurable metric pipeline engine.
///
/// Every setting is also readable from `STREAMLET_<NAME>` environment
/// variables and from `flow.settings` in the configuration; flags given
/// here win.
#[derive(Parser)]
#[command(name = "streamlet", version, about = "Configurable metric pipeline engine")]
struct Cli {
    /// Configuration file. Repeat to append extension documents.
    #[arg(long)]
    config: Vec<PathBuf>,

    /// Validate the configuration, print the compiled chains, and exit.
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    only_validate: Option<bool>,

    /// Log level: 0=off, 1=error, 2=warn, 3=info, 4=debug, 5=trace.
    #[arg(long)]
    log_level: Option<i64>,

    /// Fire each task once after startup, then exit.
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    run_once: Option<bool>,

    /// Print the composed configuration after validation.
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    print_config: Option<bool>,

    /// Include error chains and debug detail in error logs.
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    print_traceback: Option<bool>,

    /// Skip the output stage of every chain.
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    disable_outputs: Option<bool>,

    /// Default every module and task to disabled.
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    disable_default: Option<bool>,

    /// Fire execution policy: parallel or serial.
    #[arg(long)]
    pool: Option<String>,

    /// Do not announce a readiness endpoint.
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    disable_readiness_probe: Option<bool>,

    /// Skip module parameter schemas on disabled entries.
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    skip_disabled_validation: Option<bool>,

    /// Permit tasks that produce value-less metrics.
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    allow_none_metric: Option<bool>,

    /// Separator for flattened nested record keys.
    #[arg(long)]
    nested_attr_seperator: Option<String>,

    /// IANA timezone for cron evaluation and frame timestamps.
    #[arg(long)]
    timezone: Option<String>,

    /// Prefix prepended to every task name.
    #[arg(long)]
    task_name_prefix: Option<String>,

    /// How long in-flight fires may finish on shutdown.
    #[arg(long)]
    shutdown_grace: Option<String>,
}

impl Cli {
    fn setting_pairs(&self) -> Vec<(&'static str, Value)> {
        let mut pairs: Vec<(&'static str, Value)> = Vec::new();

        if !self.config.is_empty() {
            let paths: Vec<String> = self
                .config
                .iter()
                .map(|p| p.to_string_lossy().into_owned())
                .collect();
            pairs.push(("config", json!(paths)));
        }

        let bools = [
            ("only_validate", &self.only_validate),
            ("run_once", &self.run_once),
            ("print_config", &self.print_config),
            ("print_traceback", &self.print_traceback),
            ("disable_outputs", &self.disable_outputs),
            ("disable_default", &self.disable_default),
            ("disable_readiness_probe", &self.disable_readiness_probe),
            ("skip_disabled_validation", &self.skip_disabled_validation),
            ("allow_none_metric", &self.allow_none_metric),
        ];
        for (key, value) in bools {
            if let Some(b) = value {
                pairs.push((key, json!(b)));
            }
        }

        if let Some(level) = self.log_level {
            pairs.push(("log_level", json!(level)));
        }
        let strings = [
            ("pool", &self.pool),
            ("nested_attr_seperator", &self.nested_attr_seperator),
            ("timezone", &self.timezone),
            ("task_name_prefix", &self.task_name_prefix),
            ("shutdown_grace", &self.shutdown_grace),
        ];
        for (key, value) in strings {
            if let Some(s) = value {
                pairs.push((key, json!(s)));
            }
        }

        pairs
    }
}

fn report(error: &FlowError) {
    eprintln!("error: {error}");
    if let FlowError::ConfigInvalid {
        suggestion: Some(suggestion),
        ..
    } = error
    {
        eprintln!("hint: did you mean `{suggestion}`?");
    }
    eprintln!("Please check your configuration or the documentation for details.");
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut settings = Settings::new();
    if let Err(e) = settings.apply_env() {
        report(&e);
        return ExitCode::from(2);
    }
    if let Err(e) = settings.apply_cli(cli.setting_pairs()) {
        report(&e);
        return ExitCode::from(2);
    }

    logging::init(settings.log_filter());
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting streamlet");

    let registry = Registry::builtin();
    let flow = match Flow::build(settings, &registry) {
        Ok(flow) => flow,
        Err(e) => {
            report(&e);
            return ExitCode::from(2);
        }
    };

    if flow.settings().print_config {
        match serde_json::to_string_pretty(&flow.runtime().config) {
            Ok(rendered) => println!("{rendered}"),
            Err(e) => tracing::warn!(error = %e, "Cannot render configuration"),
        }
    }

    if flow.settings().only_validate {
        println!("Configured task chains:");
        println!("{}", flow.render_chains());
        println!("Validation of flow successful.");
        return ExitCode::SUCCESS;
    }

    match flow.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            report(&e);
            ExitCode::from(1)
        }
    }
}

//! Periodic scheduling and fire dispatch.
//!
//! One trigger loop per enabled task turns its cron expression into a
//! stream of fire instants and enqueues a payload per instant onto the
//! broker. The consumer side executes fires: parallel mode spawns one
//! task per fire, serial mode awaits each fire before taking the next.
//! Trigger emission never blocks on fire execution.
//!
//! Within a fire the steps run sequentially, each its own failure
//! boundary: invoke the input (the only retried step), build the frame,
//! walk the transform chain, walk the output chain. Every failure is
//! isolated to its fire; the schedule keeps going.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio::time::Instant;

use streamlet_types::error::FireError;
use streamlet_types::Records;

use crate::broker::{Broker, FirePayload, MemoryBroker};
use crate::cron_expr::parse_cron;
use crate::flow::FlowRuntime;
use crate::frame;
use crate::settings::PoolMode;

/// Outcome of one fire, for the completion log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FireOutcome {
    Finished,
    /// Empty frame; transforms and outputs were not invoked.
    Skipped,
    /// Retries exhausted or a non-retryable step failed.
    Dropped,
}

/// Run the scheduler until `run_once` completes or shutdown fires.
pub async fn run(
    runtime: Arc<FlowRuntime>,
    shutdown: broadcast::Sender<()>,
) -> Result<(), streamlet_types::FlowError> {
    let broker = Arc::new(MemoryBroker::new());
    let dispatcher = Arc::new(Dispatcher::new(runtime.clone()));

    let mut triggers = JoinSet::new();

    if runtime.settings.run_once {
        tracing::info!("Running in one-time mode, exiting after tasks are done");
        let fired_at = Utc::now();
        for chain in &runtime.chains {
            if !runtime.task_enabled(chain) {
                continue;
            }
            let payload = FirePayload {
                task: runtime.task(chain).name.clone(),
                fired_at,
            };
            broker
                .enqueue(payload)
                .await
                .map_err(streamlet_types::FlowError::Infrastructure)?;
        }
        broker.close();
    } else {
        for chain in &runtime.chains {
            if !runtime.task_enabled(chain) {
                tracing::info!(
                    task = runtime.task(chain).name,
                    "Task is disabled, skipping registration"
                );
                continue;
            }
            triggers.spawn(trigger_loop(
                runtime.clone(),
                runtime.task(chain).name.clone(),
                runtime.task(chain).cron.clone(),
                broker.clone(),
                shutdown.subscribe(),
            ));
        }
        tracing::info!(count = triggers.len(), "Registered task triggers");
    }

    let mut fires: JoinSet<()> = JoinSet::new();
    let mut shutdown_rx = shutdown.subscribe();

    loop {
        tokio::select! {
            payload = broker.recv() => {
                let Some(payload) = payload else { break };
                match runtime.settings.pool {
                    PoolMode::Parallel => {
                        let dispatcher = dispatcher.clone();
                        fires.spawn(async move { dispatcher.execute(payload).await });
                    }
                    PoolMode::Serial => dispatcher.execute(payload).await,
                }
            }
            _ = shutdown_rx.recv() => {
                broker.close();
                break;
            }
            // Reap finished fires so the set does not grow unbounded.
            Some(_) = fires.join_next(), if !fires.is_empty() => {}
        }
    }

    // Stop emitting, then give in-flight fires the grace period.
    triggers.shutdown().await;

    let grace = Duration::from_secs_f64(runtime.settings.shutdown_grace);
    let deadline = Instant::now() + grace;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match tokio::time::timeout(remaining, fires.join_next()).await {
            Ok(Some(_)) => continue,
            Ok(None) => break,
            Err(_) => {
                tracing::warn!(
                    in_flight = fires.len(),
                    "Shutdown grace period expired, aborting in-flight fires"
                );
                fires.shutdown().await;
                break;
            }
        }
    }

    Ok(())
}

/// Cron loop for one task: sleep to the next fire instant, enqueue,
/// repeat. Ends on shutdown.
async fn trigger_loop(
    runtime: Arc<FlowRuntime>,
    task_name: String,
    cron: String,
    broker: Arc<MemoryBroker>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let schedule = match parse_cron(&cron) {
        Ok(s) => s,
        // Validated during config loading; a failure here is a bug.
        Err(e) => {
            tracing::error!(task = task_name, error = e, "Unschedulable cron expression");
            return;
        }
    };
    let tz = runtime.settings.timezone;

    loop {
        let now = Utc::now().with_timezone(&tz);
        let Some(next) = schedule.after(&now).next() else {
            tracing::warn!(task = task_name, "Cron schedule has no future fire instants");
            return;
        };
        let wait = (next - now).to_std().unwrap_or(Duration::ZERO);

        tokio::select! {
            _ = tokio::time::sleep(wait) => {
                let payload = FirePayload {
                    task: task_name.clone(),
                    fired_at: next.with_timezone(&Utc),
                };
                if broker.enqueue(payload).await.is_err() {
                    return;
                }
            }
            _ = shutdown.recv() => return,
        }
    }
}

/// Executes fires against the compiled chains.
pub(crate) struct Dispatcher {
    runtime: Arc<FlowRuntime>,
    chain_index: HashMap<String, usize>,
}

impl Dispatcher {
    pub(crate) fn new(runtime: Arc<FlowRuntime>) -> Self {
        let chain_index = runtime
            .chains
            .iter()
            .enumerate()
            .map(|(i, chain)| (runtime.task(chain).name.clone(), i))
            .collect();
        Self {
            runtime,
            chain_index,
        }
    }

    pub(crate) async fn execute(&self, payload: FirePayload) {
        let Some(&chain_index) = self.chain_index.get(&payload.task) else {
            tracing::error!(task = payload.task, "Fire for unknown task dropped");
            return;
        };

        let started = Instant::now();
        tracing::debug!(task = payload.task, "Running task");

        let outcome = self.execute_chain(chain_index, &payload).await;

        let elapsed = started.elapsed().as_secs_f64();
        match outcome {
            FireOutcome::Finished => {
                tracing::info!(task = payload.task, "Task finished in {elapsed:.3}s");
            }
            FireOutcome::Skipped => {
                tracing::info!(task = payload.task, "Task skipped after {elapsed:.3}s");
            }
            FireOutcome::Dropped => {
                tracing::error!(task = payload.task, "Task dropped after {elapsed:.3}s");
            }
        }
    }

    async fn execute_chain(&self, chain_index: usize, payload: &FirePayload) -> FireOutcome {
        let runtime = &self.runtime;
        let chain = &runtime.chains[chain_index];
        let task = runtime.task(chain);
        let input_config = runtime.input_config(chain);
        let input_name = input_config.name.as_deref().unwrap_or("?");

        let Some(input) = runtime.inputs[chain.input_index].as_ref() else {
            tracing::error!(task = task.name, "Owning input is not constructed");
            return FireOutcome::Dropped;
        };

        // Step 1: invoke the input, the only retry-eligible step.
        let Some(records) = self
            .fetch_with_retries(input.as_ref(), task, input_name)
            .await
        else {
            return FireOutcome::Dropped;
        };

        // Step 2: build the frame. Failures are configuration-level.
        let options = runtime.frame_options();
        let mut frame = match frame::build_frame(task, &records, payload.fired_at, &options) {
            Ok(frame) => frame,
            Err(e) => {
                self.log_fire_error(&e, input_name);
                return FireOutcome::Dropped;
            }
        };
        drop(records);

        if frame.is_empty() {
            return FireOutcome::Skipped;
        }

        // Step 3: transform chain. Soft failures skip one stage only.
        for &index in &chain.transforms {
            let Some(transform) = runtime.transforms[index].as_ref() else {
                continue;
            };
            let name = runtime.config.transforms[index]
                .name
                .clone()
                .unwrap_or_default();
            tracing::debug!(
                task = task.name,
                transform = name,
                metrics = frame.len(),
                "Passing frame to transform"
            );
            if let Err(e) = transform.apply(&mut frame).await {
                let terminal = e.is_terminal();
                let error = FireError::Transform {
                    task: task.name.clone(),
                    module: name,
                    terminal,
                    error: e.into_inner(),
                };
                self.log_fire_error(&error, input_name);
                if terminal {
                    tracing::error!(
                        task = task.name,
                        "Transform signalled terminal failure, skipping outputs"
                    );
                    return FireOutcome::Dropped;
                }
            }
        }

        // Step 4: output chain, read-only. Failures never abort siblings.
        let frame = frame;
        for &index in &chain.outputs {
            let Some(output) = runtime.outputs[index].as_ref() else {
                continue;
            };
            let name = runtime.config.outputs[index]
                .name
                .clone()
                .unwrap_or_default();
            tracing::debug!(
                task = task.name,
                output = name,
                metrics = frame.len(),
                "Passing frame to output"
            );
            if let Err(source) = output.emit(&frame).await {
                let error = FireError::Output {
                    task: task.name.clone(),
                    module: name,
                    error: source,
                };
                self.log_fire_error(&error, input_name);
            }
        }

        FireOutcome::Finished
    }

    /// `max_retries` additional attempts with a fixed delay between
    /// them.
    async fn fetch_with_retries(
        &self,
        input: &dyn crate::modules::Input,
        task: &crate::config::model::TaskConfig,
        input_name: &str,
    ) -> Option<Records> {
        let mut attempt: u32 = 0;
        loop {
            match input.fetch(&task.params).await {
                Ok(records) => return Some(records),
                Err(source) => {
                    if attempt >= task.max_retries {
                        let error = FireError::Input {
                            task: task.name.clone(),
                            module: input_name.to_string(),
                            error: source,
                        };
                        self.log_fire_error(&error, input_name);
                        tracing::error!(
                            task = task.name,
                            attempts = attempt + 1,
                            "Exhausted input retries, dropping fire"
                        );
                        return None;
                    }
                    attempt += 1;
                    tracing::warn!(
                        task = task.name,
                        module = input_name,
                        error = %source,
                        "Input failed, retrying {attempt}/{max}",
                        max = task.max_retries,
                    );
                    tokio::time::sleep(Duration::from_secs_f64(task.retry_delay)).await;
                }
            }
        }
    }

    fn log_fire_error(&self, error: &FireError, input_name: &str) {
        if self.runtime.settings.print_traceback {
            tracing::error!(input = input_name, "{error:#}: {error:?}");
        } else {
            tracing::error!(input = input_name, "{error:#}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fire_outcomes_are_distinct() {
        assert_ne!(FireOutcome::Finished, FireOutcome::Skipped);
        assert_ne!(FireOutcome::Skipped, FireOutcome::Dropped);
    }
}

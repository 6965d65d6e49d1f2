/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::{
    config::PipelineProcess,
    datareceivers::DataReceiver,
    datasenders::SendFailure,
    errors::{ErrorCategory, ScenarioError},
    load_generator::{self, LoadError, LoadLimit, LoadOptions, LoadStats},
    metrics_logger::{self, bare_metal::SysinfoProbe, ResourceProbe, SamplerOptions, StopHandle},
    pipeline_config::{self, PipelineConfig},
    process_control::{self, available_port, ManagedProcess},
    reconciler::{self, ReconcileOptions},
    results::ResultsSink,
    scenario::{PerformanceResult, Scenario},
};
use chrono::Utc;
use colored::*;
use nanoid::nanoid;
use std::{
    fmt,
    future::Future,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::{task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Slack added on top of the expected load and reconciliation time when no deadline is set.
const DEADLINE_SLACK: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub reconcile: ReconcileOptions,
    pub sampler: SamplerOptions,
    /// Governs load and reconciliation together. Estimated from the load when `None`.
    pub deadline: Option<Duration>,
    /// How long each activity gets to exit once cancelled before it is aborted.
    pub grace_period: Duration,
    /// Time the pipeline gets to bind its ports before load starts.
    pub startup_delay: Duration,
    pub pipeline_metrics: bool,
}
impl Default for RunOptions {
    fn default() -> Self {
        Self {
            reconcile: ReconcileOptions::default(),
            sampler: SamplerOptions::default(),
            deadline: None,
            grace_period: Duration::from_secs(5),
            startup_delay: Duration::from_secs(1),
            pipeline_metrics: true,
        }
    }
}
impl RunOptions {
    fn deadline_for(&self, load: &LoadOptions) -> Duration {
        self.deadline.unwrap_or_else(|| {
            let load_time = match load.limit {
                LoadLimit::Duration(duration) => duration,
                LoadLimit::Count(count) => {
                    Duration::from_secs_f64(count as f64 / load.items_per_second.max(1) as f64)
                }
            };
            load_time + self.reconcile.timeout + DEADLINE_SLACK
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Init,
    ConfigBuilt,
    ProcessesStarted,
    LoadRunning,
    Reconciling,
    Evaluating,
    Done { passed: bool },
}
impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunState::Done { passed: true } => write!(f, "Done(Pass)"),
            RunState::Done { passed: false } => write!(f, "Done(Fail)"),
            state => write!(f, "{state:?}"),
        }
    }
}

/// A scenario waiting in a suite. Entries that could not be built still produce a result.
pub enum PendingScenario {
    Ready(Scenario),
    Invalid { name: String, error: ScenarioError },
}
impl From<Scenario> for PendingScenario {
    fn from(scenario: Scenario) -> Self {
        PendingScenario::Ready(scenario)
    }
}

pub type ProbeFactory = Arc<dyn Fn() -> Box<dyn ResourceProbe> + Send + Sync>;

/// Everything a run acquires and teardown has to release.
struct Acquired {
    receiver: Box<dyn DataReceiver>,
    receiver_started: bool,
    config_path: Option<PathBuf>,
    process: Option<ManagedProcess>,
    sampler: Option<StopHandle>,
    generator: Option<JoinHandle<Result<LoadStats, LoadError>>>,
}

/// What has been measured so far, kept outside the phases so a failed run still reports it.
#[derive(Default)]
struct Progress {
    state: Option<RunState>,
    items_sent: u64,
    items_received: u64,
    usage: Option<metrics_logger::UsageReport>,
}

pub struct ScenarioRunner {
    pipeline: Option<PipelineProcess>,
    options: RunOptions,
    work_dir: PathBuf,
    run_id: String,
    probe_factory: ProbeFactory,
}
impl ScenarioRunner {
    /// # Arguments
    ///
    /// * `pipeline` - The pipeline under test, `None` to run senders straight into receivers
    /// * `options` - Timing of a run
    /// * `work_dir` - Where rendered configs and pipeline logs are written
    pub fn new(pipeline: Option<PipelineProcess>, options: RunOptions, work_dir: &Path) -> Self {
        Self {
            pipeline,
            options,
            work_dir: work_dir.to_path_buf(),
            run_id: nanoid!(5, &nanoid::alphabet::SAFE),
            probe_factory: Arc::new(|| Box::new(SysinfoProbe::new()) as Box<dyn ResourceProbe>),
        }
    }

    /// Replaces the probe used to sample the pipeline, each run gets a fresh one.
    pub fn with_probe<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> Box<dyn ResourceProbe> + Send + Sync + 'static,
    {
        self.probe_factory = Arc::new(factory);
        self
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Runs every scenario in turn and records each result into every sink.
    ///
    /// A failing scenario never stops the suite. Cancelling `token` tears down the current
    /// scenario and skips the rest.
    pub async fn run_suite(
        &self,
        scenarios: impl IntoIterator<Item = PendingScenario>,
        sinks: &mut [Box<dyn ResultsSink>],
        token: &CancellationToken,
    ) -> Vec<PerformanceResult> {
        let mut results = vec![];

        for pending in scenarios {
            if token.is_cancelled() {
                warn!("Suite cancelled, skipping remaining scenarios");
                break;
            }

            let result = match pending {
                PendingScenario::Ready(scenario) => {
                    println!("> running scenario {}", scenario.name.green());
                    self.run(scenario, token).await
                }
                PendingScenario::Invalid { name, error } => {
                    error!("Scenario {} is invalid: {}", name, error);
                    PerformanceResult::failed(&self.run_id, &name, Utc::now(), error)
                }
            };

            for sink in sinks.iter_mut() {
                if let Err(err) = sink.record(&result).await {
                    warn!("Failed to record result of {}: {:#}", result.scenario_name, err);
                }
            }
            results.push(result);
        }

        for sink in sinks.iter_mut() {
            if let Err(err) = sink.finish(&results).await {
                warn!("Failed to finish results summary: {:#}", err);
            }
        }

        results
    }

    /// Runs a single scenario and returns exactly one result, whatever happens. Every resource
    /// the run acquires is released before this returns.
    pub async fn run(&self, scenario: Scenario, token: &CancellationToken) -> PerformanceResult {
        let token = token.child_token();
        let started_at = Utc::now();
        let clock = Instant::now();

        let Scenario {
            name,
            sender,
            receiver,
            resource_spec,
            processors,
            extensions,
            delivery,
            load,
        } = scenario;

        let mut progress = Progress::default();
        transition(&name, &mut progress, RunState::Init);

        let mut acquired = Acquired {
            receiver,
            receiver_started: false,
            config_path: None,
            process: None,
            sampler: None,
            generator: None,
        };

        let outcome = async {
            load.validate()?;

            // ---- ConfigBuilt ----
            // the exporter fragment names the port the receiver actually listens on
            acquired
                .receiver
                .start()
                .await
                .map_err(|err| {
                    ScenarioError::process_start(acquired.receiver.name(), format!("{err:#}"))
                })?;
            acquired.receiver_started = true;

            let metrics_port = match self.options.pipeline_metrics && self.pipeline.is_some() {
                true => Some(
                    available_port().map_err(|err| ScenarioError::config(format!("{err:#}")))?,
                ),
                false => None,
            };
            let doc = pipeline_config::render(&PipelineConfig {
                pipeline_type: sender.pipeline_type(),
                receiver: &sender.receiver_config_fragment(),
                exporter: &acquired.receiver.exporter_config_fragment(),
                processors: &processors,
                extensions: &extensions,
                metrics_port,
            })?;
            let config_path = self.write_config(&name, &doc).await?;
            let config_path = acquired.config_path.insert(config_path);
            transition(&name, &mut progress, RunState::ConfigBuilt);

            // ---- ProcessesStarted ----
            let mut pids = vec![];
            if let Some(pipeline) = &self.pipeline {
                let process = process_control::run_process(pipeline, config_path, &self.work_dir)
                    .map_err(|err| {
                        ScenarioError::process_start(&pipeline.name, format!("{err:#}"))
                    })?;
                let process = acquired.process.insert(process);
                pids.push(process.pid());

                tokio::select! {
                    _ = token.cancelled() => {
                        return Err(cancelled("starting the pipeline", self.options.startup_delay));
                    }
                    _ = tokio::time::sleep(self.options.startup_delay) => {}
                }
                if !process.is_running() {
                    return Err(ScenarioError::process_start(
                        &pipeline.name,
                        "exited during startup",
                    ));
                }
            }
            transition(&name, &mut progress, RunState::ProcessesStarted);

            // ---- LoadRunning ----
            let sampler = acquired.sampler.insert(metrics_logger::start_logging(
                pids,
                (self.probe_factory)(),
                self.options.sampler.clone(),
                token.child_token(),
            ));
            let generator = acquired.generator.insert(load_generator::start_load(
                sender,
                load.clone(),
                token.child_token(),
            ));
            transition(&name, &mut progress, RunState::LoadRunning);

            let deadline_after = self.options.deadline_for(&load);
            let deadline = Instant::now() + deadline_after;

            let generating = async {
                match generator.await {
                    Ok(Ok(stats)) => Ok(stats),
                    Ok(Err(err)) => Err(err),
                    Err(err) => Err(LoadError {
                        operation: "generator",
                        attempts: 0,
                        items_sent: 0,
                        failure: SendFailure::Fatal(err.to_string()),
                    }),
                }
            };
            let stats =
                supervise(deadline, deadline_after, "generating load", sampler, &token, generating)
                    .await;
            // a finished handle must not be awaited again by teardown
            if stats.is_ok() {
                acquired.generator = None;
            }
            let stats = match stats? {
                Ok(stats) => stats,
                Err(err) => {
                    progress.items_sent = err.items_sent;
                    return Err(err.into());
                }
            };
            progress.items_sent = stats.items_sent;
            if stats.cancelled {
                return Err(cancelled("generating load", deadline_after));
            }
            info!(
                "[{}] sent {} item(s) in {:.2}s ({:.1} items/s)",
                name,
                stats.items_sent,
                stats.elapsed.as_secs_f64(),
                stats.throughput()
            );

            // ---- Reconciling ----
            transition(&name, &mut progress, RunState::Reconciling);
            let receiver: &dyn DataReceiver = acquired.receiver.as_ref();
            let reconciling =
                reconciler::reconcile(receiver, stats.items_sent, delivery, &self.options.reconcile);
            let reconciled =
                supervise(deadline, deadline_after, "reconciling", sampler, &token, reconciling)
                    .await?;
            match reconciled {
                Ok(reconciliation) => progress.items_received = reconciliation.items_received,
                Err(err) => {
                    progress.items_received = err.items_received().unwrap_or_default();
                    return Err(err.into());
                }
            }

            // ---- Evaluating ----
            transition(&name, &mut progress, RunState::Evaluating);
            if let Some(sampler) = acquired.sampler.take() {
                let usage = sampler
                    .stop_within(self.options.grace_period)
                    .await
                    .map_err(|err| ScenarioError::ResourceSample {
                        message: err.to_string(),
                    })?;
                progress.usage = Some(usage);
            }
            if let Some(usage) = &progress.usage {
                resource_spec.check(usage)?;
            }
            Ok::<_, ScenarioError>(())
        }
        .await;

        self.teardown(&name, acquired, &mut progress, &token).await;

        let passed = outcome.is_ok();
        transition(&name, &mut progress, RunState::Done { passed });

        let usage = progress.usage.unwrap_or_default();
        let result = PerformanceResult {
            run_id: self.run_id.clone(),
            scenario_name: name,
            started_at,
            items_sent: progress.items_sent,
            items_received: progress.items_received,
            elapsed: clock.elapsed(),
            observed_max_cpu: usage.max_cpu(),
            observed_avg_cpu: usage.aggregate().avg_cpu(),
            observed_max_ram: usage.max_ram(),
            observed_avg_ram: usage.aggregate().avg_ram(),
            passed,
            failure_reason: outcome.err(),
        };

        match &result.failure_reason {
            None => println!("\t{}", "✓".green()),
            Some(reason) => {
                if reason.category() == ErrorCategory::Infrastructure {
                    error!("[{}] aborted: {}", result.scenario_name, reason);
                } else {
                    warn!("[{}] failed: {}", result.scenario_name, reason);
                }
                println!("\t{} {}", "✗".red(), reason.to_string().red());
            }
        }
        result
    }

    async fn write_config(&self, name: &str, doc: &str) -> Result<PathBuf, ScenarioError> {
        let path = self
            .work_dir
            .join(format!("{}-{}.yaml", name, self.run_id));

        tokio::fs::create_dir_all(&self.work_dir)
            .await
            .map_err(|err| {
                ScenarioError::config(format!("error creating {}: {err}", self.work_dir.display()))
            })?;
        tokio::fs::write(&path, doc)
            .await
            .map_err(|err| {
                ScenarioError::config(format!("error writing {}: {err}", path.display()))
            })?;

        debug!("Rendered pipeline config to {}", path.display());
        Ok(path)
    }

    /// Releases everything the run acquired, in reverse order of acquisition. Never fails, problems
    /// are logged so they cannot mask the outcome of the run.
    async fn teardown(
        &self,
        name: &str,
        acquired: Acquired,
        progress: &mut Progress,
        token: &CancellationToken,
    ) {
        debug!("[{}] tearing down", name);
        token.cancel();
        let grace = self.options.grace_period;

        let Acquired {
            mut receiver,
            receiver_started,
            config_path,
            process,
            sampler,
            generator,
        } = acquired;

        if let Some(mut generator) = generator {
            match tokio::time::timeout(grace, &mut generator).await {
                Ok(Ok(Ok(stats))) => progress.items_sent = stats.items_sent,
                Ok(Ok(Err(err))) => progress.items_sent = err.items_sent,
                Ok(Err(err)) => warn!("[{}] load generator failed: {}", name, err),
                Err(_) => {
                    warn!(
                        "[{}] load generator did not stop within {:?}, aborting it",
                        name, grace
                    );
                    generator.abort();
                }
            }
        }

        if let Some(sampler) = sampler {
            match sampler.stop_within(grace).await {
                Ok(usage) => {
                    progress.usage.get_or_insert(usage);
                }
                Err(err) => warn!("[{}] sampler stopped with an error: {}", name, err),
            }
        }

        if let Some(mut process) = process {
            let res = tokio::task::spawn_blocking(move || {
                process_control::shutdown_process(&mut process, grace)
            })
            .await;
            match res {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!("[{}] failed to stop the pipeline: {:#}", name, err),
                Err(err) => warn!("[{}] pipeline shutdown task failed: {}", name, err),
            }
        }

        if receiver_started {
            // a run cut short while reconciling still reports what arrived
            match receiver.received_count() {
                Ok(count) => progress.items_received = progress.items_received.max(count),
                Err(fault) => debug!("[{}] no final count from the receiver: {}", name, fault),
            }
            receiver.stop().await;
        }

        if let Some(config_path) = config_path {
            if let Err(err) = tokio::fs::remove_file(&config_path).await {
                warn!("[{}] failed to remove {}: {}", name, config_path.display(), err);
            }
        }
    }
}

fn transition(name: &str, progress: &mut Progress, next: RunState) {
    match progress.state {
        Some(prev) => info!("[{}] {} -> {}", name, prev, next),
        None => info!("[{}] {}", name, next),
    }
    progress.state = Some(next);
}

fn cancelled(phase: &str, deadline: Duration) -> ScenarioError {
    ScenarioError::Timeout {
        deadline_secs: deadline.as_secs_f64(),
        phase: format!("{phase} (cancelled)"),
    }
}

/// Drives `work` until it completes, the deadline passes, the sampler escalates or the scenario is
/// cancelled, whichever comes first.
async fn supervise<T>(
    deadline: Instant,
    deadline_after: Duration,
    phase: &str,
    sampler: &mut StopHandle,
    token: &CancellationToken,
    work: impl Future<Output = T>,
) -> Result<T, ScenarioError> {
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(cancelled(phase, deadline_after)),
        fault = sampler.fault() => Err(ScenarioError::ResourceSample {
            message: fault.to_string(),
        }),
        res = tokio::time::timeout_at(deadline, work) => res.map_err(|_| ScenarioError::Timeout {
            deadline_secs: deadline_after.as_secs_f64(),
            phase: phase.to_string(),
        }),
    }
}

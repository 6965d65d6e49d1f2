/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::{
    checkpoint::CheckpointStorage,
    datareceivers::{loopback::loopback_pair, tcp_lines::TcpLineReceiver, DataReceiver},
    datasenders::{file_log::FileLogWriter, tcp_lines::TcpLineSender, DataSender},
    errors::ScenarioError,
    load_generator::{LoadLimit, LoadOptions},
    metrics_logger::SamplerOptions,
    process_control::available_port,
    reconciler::{DeliveryGuarantee, ReconcileOptions},
    scenario::{ResourceSpec, Scenario},
    scenario_runner::RunOptions,
};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs::{self, File},
    io::{Read, Write},
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tracing::warn;

static EXAMPLE_CONFIG: &str = include_str!("templates/testbed.toml");

// ******** ******** ********
// **    CONFIGURATION     **
// ******** ******** ********
#[derive(Debug, Deserialize, Serialize)]
pub struct Config {
    /// The pipeline under test. Without one, scenarios run sender to receiver directly, which
    /// only makes sense with loopback scenarios.
    pub pipeline: Option<PipelineProcess>,
    #[serde(default)]
    pub run: RunSettings,
    #[serde(default)]
    pub load: LoadSettings,
    /// Where results and checkpoints are stored. Falls back to `DATABASE_URL`.
    pub database_url: Option<String>,
    #[serde(default)]
    pub processors: BTreeMap<String, String>,
    #[serde(default)]
    pub extensions: BTreeMap<String, String>,
    #[serde(rename(serialize = "scenario", deserialize = "scenario"), default)]
    pub scenarios: Vec<ScenarioConfig>,
}
impl Config {
    pub fn write_example_to_file(path: &Path) -> anyhow::Result<File> {
        let mut file = File::create_new(path)
            .context(format!("Error creating config file {}", path.display()))?;
        file.write_all(EXAMPLE_CONFIG.as_bytes())?;
        Ok(file)
    }

    pub fn try_from_path(path: &Path) -> anyhow::Result<Config> {
        let mut config_str = String::new();
        fs::File::open(path)
            .context(format!("Error opening config file {}", path.display()))?
            .read_to_string(&mut config_str)?;
        Config::try_from_str(&config_str)
    }

    pub fn try_from_str(conf_str: &str) -> anyhow::Result<Config> {
        toml::from_str::<Config>(conf_str).map_err(|e| anyhow::anyhow!("TOML parsing error: {}", e))
    }

    pub fn find_scenario(&self, scenario_name: &str) -> anyhow::Result<&ScenarioConfig> {
        self.scenarios
            .iter()
            .find(|scenario| scenario.name == scenario_name)
            .context(format!(
                "Unable to find scenario with name {}",
                scenario_name
            ))
    }

    /// The scenarios to run, in config order. With no names every enabled scenario runs; named
    /// scenarios run even when disabled.
    pub fn scenarios_to_run(&self, names: &[String]) -> anyhow::Result<Vec<&ScenarioConfig>> {
        if names.is_empty() {
            return Ok(self
                .scenarios
                .iter()
                .filter(|scenario| scenario.enabled)
                .collect());
        }

        let mut scenarios = vec![];
        for name in names {
            let scenario = self.find_scenario(name)?;
            if !scenario.enabled {
                warn!("Running disabled scenario {} because it was named", name);
            }
            scenarios.push(scenario);
        }
        Ok(scenarios)
    }

    pub fn database_url(&self) -> Option<String> {
        self.database_url
            .clone()
            .or_else(|| std::env::var("DATABASE_URL").ok())
    }

    /// Turns a scenario entry into a runnable `Scenario`, allocating any ports it needs.
    pub fn build_scenario(
        &self,
        entry: &ScenarioConfig,
        ctx: &BuildContext,
    ) -> Result<Scenario, ScenarioError> {
        let resource_spec = ResourceSpec::new(entry.resources.max_cpu, entry.resources.max_ram)?;
        let load = self.load.merged(entry.load.as_ref()).to_options()?;
        let processors = select(&self.processors, entry.processors.as_deref(), "processor")?;
        let extensions = select(&self.extensions, entry.extensions.as_deref(), "extension")?;
        let (sender, receiver) = entry.build_endpoints(ctx)?;

        Ok(Scenario::new(&entry.name, sender, receiver, resource_spec)
            .with_processors(processors)
            .with_extensions(extensions)
            .with_delivery(entry.delivery)
            .with_load(load))
    }
}

/// Components chosen by name from the globally declared ones. `None` selects all of them.
fn select(
    declared: &BTreeMap<String, String>,
    names: Option<&[String]>,
    kind: &str,
) -> Result<BTreeMap<String, String>, ScenarioError> {
    let Some(names) = names else {
        return Ok(declared.clone());
    };

    names
        .iter()
        .map(|name| {
            declared
                .get(name)
                .map(|fragment| (name.clone(), fragment.clone()))
                .ok_or_else(|| ScenarioError::config(format!("unknown {kind} `{name}`")))
        })
        .collect()
}

/// Shared state handed to every scenario built from the config.
pub struct BuildContext {
    pub work_dir: PathBuf,
    pub storage: Option<Arc<dyn CheckpointStorage>>,
}

#[derive(Debug, Deserialize, PartialEq, Clone, Copy, Serialize, Default)]
#[serde(tag = "to", rename_all = "lowercase")]
pub enum Redirect {
    Null,
    Parent,
    #[default]
    File,
}

#[derive(Debug, Deserialize, PartialEq, Serialize, Clone)]
pub struct PipelineProcess {
    pub name: String,
    /// `{config}` is replaced with the path of the rendered pipeline config.
    pub up: String,
    /// `{pid}` is replaced with the pid of the running pipeline.
    pub down: Option<String>,
    pub redirect: Option<Redirect>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, PartialEq, Serialize, Clone)]
#[serde(default)]
pub struct RunSettings {
    pub work_dir: PathBuf,
    /// Expose the pipeline's own metrics on a free port.
    pub pipeline_metrics: bool,
    pub startup_delay_ms: u64,
    /// Overall deadline for load and reconciliation. Estimated from the load when absent.
    pub deadline_secs: Option<f64>,
    pub grace_period_ms: u64,
    pub reconcile_timeout_secs: f64,
    pub poll_interval_ms: u64,
    pub sample_interval_ms: u64,
    pub max_consecutive_sample_failures: u32,
}
impl Default for RunSettings {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from(".testbed"),
            pipeline_metrics: true,
            startup_delay_ms: 1000,
            deadline_secs: None,
            grace_period_ms: 5000,
            reconcile_timeout_secs: 30.0,
            poll_interval_ms: 200,
            sample_interval_ms: 1000,
            max_consecutive_sample_failures: 5,
        }
    }
}
impl RunSettings {
    pub fn to_options(&self) -> Result<RunOptions, ScenarioError> {
        let secs = |name: &str, secs: f64| {
            Duration::try_from_secs_f64(secs)
                .map_err(|err| ScenarioError::config(format!("invalid {name}: {err}")))
        };

        Ok(RunOptions {
            reconcile: ReconcileOptions {
                poll_interval: Duration::from_millis(self.poll_interval_ms.max(1)),
                timeout: secs("reconcile_timeout_secs", self.reconcile_timeout_secs)?,
            },
            sampler: SamplerOptions {
                interval: Duration::from_millis(self.sample_interval_ms.max(1)),
                max_consecutive_failures: self.max_consecutive_sample_failures.max(1),
            },
            deadline: self
                .deadline_secs
                .map(|deadline| secs("deadline_secs", deadline))
                .transpose()?,
            grace_period: Duration::from_millis(self.grace_period_ms),
            startup_delay: Duration::from_millis(self.startup_delay_ms),
            pipeline_metrics: self.pipeline_metrics,
        })
    }
}

/// Load settings. Every field is optional so a scenario can override only part of the global
/// `[load]` table.
#[derive(Debug, Deserialize, PartialEq, Serialize, Clone, Default)]
#[serde(default)]
pub struct LoadSettings {
    pub items_per_second: Option<u64>,
    pub items_per_batch: Option<u64>,
    pub duration_secs: Option<f64>,
    pub count: Option<u64>,
    pub max_retries: Option<u32>,
    pub retry_backoff_ms: Option<u64>,
    pub send_timeout_ms: Option<u64>,
}
impl LoadSettings {
    /// `over` wins wherever it sets a value. Setting either limit in `over` replaces both limits.
    pub fn merged(&self, over: Option<&LoadSettings>) -> LoadSettings {
        let Some(over) = over else {
            return self.clone();
        };

        let limit_overridden = over.duration_secs.is_some() || over.count.is_some();
        LoadSettings {
            items_per_second: over.items_per_second.or(self.items_per_second),
            items_per_batch: over.items_per_batch.or(self.items_per_batch),
            duration_secs: if limit_overridden {
                over.duration_secs
            } else {
                self.duration_secs
            },
            count: if limit_overridden {
                over.count
            } else {
                self.count
            },
            max_retries: over.max_retries.or(self.max_retries),
            retry_backoff_ms: over.retry_backoff_ms.or(self.retry_backoff_ms),
            send_timeout_ms: over.send_timeout_ms.or(self.send_timeout_ms),
        }
    }

    pub fn to_options(&self) -> Result<LoadOptions, ScenarioError> {
        let defaults = LoadOptions::default();

        let limit = match (self.duration_secs, self.count) {
            (Some(_), Some(_)) => {
                return Err(ScenarioError::config(
                    "set either duration_secs or count, not both",
                ))
            }
            (Some(secs), None) => LoadLimit::Duration(
                Duration::try_from_secs_f64(secs)
                    .map_err(|err| ScenarioError::config(format!("invalid duration_secs: {err}")))?,
            ),
            (None, Some(count)) => LoadLimit::Count(count),
            (None, None) => defaults.limit,
        };

        let options = LoadOptions {
            items_per_second: self.items_per_second.unwrap_or(defaults.items_per_second),
            items_per_batch: self.items_per_batch.unwrap_or(defaults.items_per_batch),
            limit,
            max_retries: self.max_retries.unwrap_or(defaults.max_retries),
            retry_backoff: self
                .retry_backoff_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry_backoff),
            send_timeout: self
                .send_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.send_timeout),
        };
        options.validate()?;
        Ok(options)
    }
}

#[derive(Debug, Deserialize, PartialEq, Serialize, Clone, Default)]
pub struct ResourcesConfig {
    #[serde(default)]
    pub max_cpu: f64,
    #[serde(default)]
    pub max_ram: f64,
}

fn localhost() -> String {
    "127.0.0.1".to_string()
}

#[derive(Debug, Deserialize, PartialEq, Serialize, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SenderConfig {
    FileLog {
        /// Defaults to `<work_dir>/<scenario>.log`.
        path: Option<PathBuf>,
        #[serde(default)]
        checkpoint: bool,
    },
    TcpLines {
        #[serde(default = "localhost")]
        host: String,
        /// Allocated per scenario when absent.
        port: Option<u16>,
    },
    Loopback {
        /// Items past this many are dropped, simulating data loss.
        deliver_at_most: Option<u64>,
    },
}

#[derive(Debug, Deserialize, PartialEq, Serialize, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReceiverConfig {
    TcpLines {
        #[serde(default = "localhost")]
        host: String,
        /// Allocated per scenario when absent.
        port: Option<u16>,
        /// Exporter section for the pipeline, `{host}` and `{port}` are filled in.
        exporter: Option<String>,
    },
    Loopback,
}

#[derive(Debug, Deserialize, PartialEq, Serialize, Clone)]
pub struct ScenarioConfig {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub sender: SenderConfig,
    pub receiver: ReceiverConfig,
    #[serde(default)]
    pub resources: ResourcesConfig,
    /// Names of globally declared processors, all of them when absent.
    pub processors: Option<Vec<String>>,
    /// Names of globally declared extensions, all of them when absent.
    pub extensions: Option<Vec<String>>,
    #[serde(default)]
    pub delivery: DeliveryGuarantee,
    pub load: Option<LoadSettings>,
}
impl ScenarioConfig {
    fn build_endpoints(
        &self,
        ctx: &BuildContext,
    ) -> Result<(Box<dyn DataSender>, Box<dyn DataReceiver>), ScenarioError> {
        if let (SenderConfig::Loopback { deliver_at_most }, ReceiverConfig::Loopback) =
            (&self.sender, &self.receiver)
        {
            let (sender, receiver) = loopback_pair();
            let sender = match deliver_at_most {
                Some(limit) => sender.with_delivery_cap(*limit),
                None => sender,
            };
            return Ok((Box::new(sender), Box::new(receiver)));
        }

        let unpaired = || {
            ScenarioError::config(format!(
                "scenario {}: loopback senders and receivers only work as a pair",
                self.name
            ))
        };

        let receiver: Box<dyn DataReceiver> = match &self.receiver {
            ReceiverConfig::TcpLines {
                host,
                port,
                exporter,
            } => {
                let receiver = TcpLineReceiver::new(host, allocate(*port)?);
                match exporter {
                    Some(exporter) => Box::new(receiver.with_exporter_template(exporter)),
                    None => Box::new(receiver),
                }
            }
            ReceiverConfig::Loopback => return Err(unpaired()),
        };

        let sender: Box<dyn DataSender> = match &self.sender {
            SenderConfig::FileLog { path, checkpoint } => {
                let path = path
                    .clone()
                    .unwrap_or_else(|| ctx.work_dir.join(format!("{}.log", self.name)));
                let writer = FileLogWriter::new(path).with_name(&self.name);
                writer.discard_previous_log().map_err(|err| {
                    ScenarioError::config(format!("scenario {}: stale log file: {err}", self.name))
                })?;
                if *checkpoint {
                    let storage = ctx.storage.clone().ok_or_else(|| {
                        ScenarioError::config(format!(
                            "scenario {} checkpoints but no checkpoint storage is configured",
                            self.name
                        ))
                    })?;
                    Box::new(writer.with_checkpoint_storage(storage))
                } else {
                    Box::new(writer)
                }
            }
            SenderConfig::TcpLines { host, port } => {
                Box::new(TcpLineSender::new(host, allocate(*port)?))
            }
            SenderConfig::Loopback { .. } => return Err(unpaired()),
        };

        Ok((sender, receiver))
    }
}

fn allocate(port: Option<u16>) -> Result<u16, ScenarioError> {
    match port {
        Some(port) => Ok(port),
        None => available_port().map_err(|err| ScenarioError::config(format!("{err:#}"))),
    }
}

/// Writes the example config to `path` and reports the outcome to the user.
pub fn init_config(path: &Path) {
    use colored::Colorize;

    match Config::write_example_to_file(path) {
        Ok(_) => println!("{} {}", path.display().to_string().green(), "created!".green()),
        Err(err) => println!("{}\n{:#}", "Error creating config.".red(), err),
    }
}

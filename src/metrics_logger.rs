/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

pub mod bare_metal;

use std::{collections::BTreeMap, future::pending, time::Duration};
use thiserror::Error;
use tokio::{sync::oneshot, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SampleError {
    #[error("process with id {0} not found")]
    ProcessNotFound(u32),

    #[error("{0}")]
    Probe(String),

    #[error("gave up sampling pid {pid} after {failures} consecutive failures: {last}")]
    Escalated { pid: u32, failures: u32, last: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ResourceSample {
    /// Percent of a single core, so a process saturating two cores reports 200.
    pub cpu_percent: f64,
    pub ram_mib: f64,
}

/// Reads the resource usage of a process. `refresh` is called once per tick, before the
/// processes are sampled.
pub trait ResourceProbe: Send {
    fn refresh(&mut self);

    fn sample(&mut self, pid: u32) -> Result<ResourceSample, SampleError>;
}

#[derive(Debug, Clone)]
pub struct SamplerOptions {
    pub interval: Duration,
    pub max_consecutive_failures: u32,
}
impl Default for SamplerOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            max_consecutive_failures: 5,
        }
    }
}

/// Running maximum and mean of a stream of samples.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct UsageStats {
    max_cpu: f64,
    max_ram: f64,
    total_cpu: f64,
    total_ram: f64,
    samples: u64,
}
impl UsageStats {
    pub fn observe(&mut self, sample: ResourceSample) {
        self.max_cpu = self.max_cpu.max(sample.cpu_percent);
        self.max_ram = self.max_ram.max(sample.ram_mib);
        self.total_cpu += sample.cpu_percent;
        self.total_ram += sample.ram_mib;
        self.samples += 1;
    }

    pub fn max_cpu(&self) -> f64 {
        self.max_cpu
    }

    pub fn max_ram(&self) -> f64 {
        self.max_ram
    }

    pub fn avg_cpu(&self) -> f64 {
        if self.samples == 0 {
            0.0
        } else {
            self.total_cpu / self.samples as f64
        }
    }

    pub fn avg_ram(&self) -> f64 {
        if self.samples == 0 {
            0.0
        } else {
            self.total_ram / self.samples as f64
        }
    }

    pub fn samples(&self) -> u64 {
        self.samples
    }
}

/// Usage observed over a sampling session. The aggregate treats all monitored processes as one:
/// each tick's samples are summed before being folded into the running maximum and mean.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct UsageReport {
    per_process: BTreeMap<u32, UsageStats>,
    aggregate: UsageStats,
    ticks: u64,
    core_count: usize,
}
impl UsageReport {
    pub fn new(core_count: usize) -> Self {
        Self {
            core_count,
            ..Default::default()
        }
    }

    pub fn observe_tick(&mut self, samples: &[(u32, ResourceSample)]) {
        self.ticks += 1;
        if samples.is_empty() {
            return;
        }

        let mut total = ResourceSample::default();
        for (pid, sample) in samples {
            self.per_process.entry(*pid).or_default().observe(*sample);
            total.cpu_percent += sample.cpu_percent;
            total.ram_mib += sample.ram_mib;
        }
        self.aggregate.observe(total);
    }

    pub fn aggregate(&self) -> &UsageStats {
        &self.aggregate
    }

    pub fn process(&self, pid: u32) -> Option<&UsageStats> {
        self.per_process.get(&pid)
    }

    pub fn max_cpu(&self) -> f64 {
        self.aggregate.max_cpu()
    }

    pub fn max_ram(&self) -> f64 {
        self.aggregate.max_ram()
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn core_count(&self) -> usize {
        self.core_count
    }
}

pub struct StopHandle {
    token: CancellationToken,
    handle: JoinHandle<Result<UsageReport, SampleError>>,
    fault: Option<oneshot::Receiver<SampleError>>,
}
impl StopHandle {
    /// Resolves as soon as the sampler gives up on a process. Never resolves for a healthy
    /// sampler, which makes it suitable as a branch of `tokio::select!`.
    pub async fn fault(&mut self) -> SampleError {
        let Some(rx) = self.fault.as_mut() else {
            return pending().await;
        };

        let res = rx.await;
        self.fault = None;
        match res {
            Ok(err) => err,
            Err(_) => pending().await,
        }
    }

    pub async fn stop(self) -> Result<UsageReport, SampleError> {
        self.token.cancel();
        self.handle
            .await
            .map_err(|err| SampleError::Probe(format!("sampler task failed: {err}")))?
    }

    /// Like `stop`, but aborts the sampler if it has not exited within `grace`.
    pub async fn stop_within(mut self, grace: Duration) -> Result<UsageReport, SampleError> {
        self.token.cancel();
        match tokio::time::timeout(grace, &mut self.handle).await {
            Ok(res) => {
                res.map_err(|err| SampleError::Probe(format!("sampler task failed: {err}")))?
            }
            Err(_) => {
                warn!("Sampler did not stop within {:?}, aborting it", grace);
                self.handle.abort();
                Err(SampleError::Probe(
                    "sampler did not stop within the grace period".to_string(),
                ))
            }
        }
    }
}

/// Starts sampling the given processes on a background task.
///
/// Sampling continues until `token` is cancelled or the returned handle is stopped. A process that
/// fails to be sampled is skipped for that tick; once it has failed
/// `options.max_consecutive_failures` ticks in a row the sampler stops and reports the failure
/// through `StopHandle::fault`.
///
/// # Arguments
///
/// * `pids` - The processes to observe
/// * `probe` - Reads the usage of a single process
/// * `options` - Sampling cadence and failure tolerance
/// * `token` - Cancels the sampler, usually a child of the scenario's token
pub fn start_logging(
    pids: Vec<u32>,
    probe: Box<dyn ResourceProbe>,
    options: SamplerOptions,
    token: CancellationToken,
) -> StopHandle {
    let (fault_tx, fault_rx) = oneshot::channel();
    let handle = tokio::spawn(bare_metal::keep_logging(
        pids,
        probe,
        options,
        token.clone(),
        fault_tx,
    ));

    StopHandle {
        token,
        handle,
        fault: Some(fault_rx),
    }
}

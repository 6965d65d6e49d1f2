/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use super::{ResourceProbe, ResourceSample, SampleError, SamplerOptions, UsageReport};
use sysinfo::{Pid, System};
use tokio::{sync::oneshot, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

/// Samples processes running on this machine using `sysinfo`.
pub struct SysinfoProbe {
    system: System,
}
impl SysinfoProbe {
    pub fn new() -> Self {
        let mut system = System::new_all();
        system.refresh_all();
        Self { system }
    }
}
impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}
impl ResourceProbe for SysinfoProbe {
    fn refresh(&mut self) {
        self.system.refresh_all();
    }

    fn sample(&mut self, pid: u32) -> Result<ResourceSample, SampleError> {
        let process = self
            .system
            .process(Pid::from_u32(pid))
            .ok_or(SampleError::ProcessNotFound(pid))?;

        let cpu_percent = process.cpu_usage() as f64;
        let ram_mib = process.memory() as f64 / 1024.0 / 1024.0;
        trace!(
            "[PID {}] cpu_usage: {:.2}%, memory: {:.2}MiB",
            pid,
            cpu_percent,
            ram_mib
        );

        Ok(ResourceSample {
            cpu_percent,
            ram_mib,
        })
    }
}

/// Samples every process once per interval until cancelled. Intended to be spawned by
/// `metrics_logger::start_logging`.
///
/// A tick in which a process cannot be sampled is skipped for that process. When one process
/// fails `max_consecutive_failures` ticks in a row the failure is sent on `fault` and returned.
pub(super) async fn keep_logging(
    pids: Vec<u32>,
    mut probe: Box<dyn ResourceProbe>,
    options: SamplerOptions,
    token: CancellationToken,
    fault: oneshot::Sender<SampleError>,
) -> Result<UsageReport, SampleError> {
    let mut report = UsageReport::new(num_cpus::get_physical());
    let mut failures = vec![0_u32; pids.len()];

    let mut interval = tokio::time::interval(options.interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = interval.tick() => {}
        }

        probe.refresh();
        let mut tick = Vec::with_capacity(pids.len());
        for (pid, failed) in pids.iter().zip(failures.iter_mut()) {
            match probe.sample(*pid) {
                Ok(sample) => {
                    *failed = 0;
                    tick.push((*pid, sample));
                }

                Err(err) => {
                    *failed += 1;
                    warn!(
                        "Skipping sample for pid {} ({} in a row): {}",
                        pid, failed, err
                    );

                    if *failed >= options.max_consecutive_failures {
                        let err = SampleError::Escalated {
                            pid: *pid,
                            failures: *failed,
                            last: err.to_string(),
                        };
                        // nobody listening is fine, the error is also returned on stop
                        let _ = fault.send(err.clone());
                        return Err(err);
                    }
                }
            }
        }

        report.observe_tick(&tick);
    }

    Ok(report)
}

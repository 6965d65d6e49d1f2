/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::{
    datareceivers::DataReceiver,
    datasenders::DataSender,
    errors::{ErrorCategory, Resource, ScenarioError},
    load_generator::LoadOptions,
    metrics_logger::UsageReport,
    reconciler::DeliveryGuarantee,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, time::Duration};

/// The most CPU (percent of one core) and RAM (MiB) a pipeline may use during a scenario.
/// A limit of `0` leaves that dimension unchecked.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceSpec {
    expected_max_cpu: f64,
    expected_max_ram: f64,
}
impl ResourceSpec {
    pub fn new(expected_max_cpu: f64, expected_max_ram: f64) -> Result<Self, ScenarioError> {
        for (name, limit) in [("CPU", expected_max_cpu), ("RAM", expected_max_ram)] {
            if !limit.is_finite() || limit < 0.0 {
                return Err(ScenarioError::config(format!(
                    "{name} limit must be a non-negative number, got {limit}"
                )));
            }
        }

        Ok(Self {
            expected_max_cpu,
            expected_max_ram,
        })
    }

    /// A spec that checks nothing.
    pub fn unchecked() -> Self {
        Self {
            expected_max_cpu: 0.0,
            expected_max_ram: 0.0,
        }
    }

    pub fn expected_max_cpu(&self) -> f64 {
        self.expected_max_cpu
    }

    pub fn expected_max_ram(&self) -> f64 {
        self.expected_max_ram
    }

    /// Compares the observed maxima with the limits, CPU first.
    pub fn check(&self, usage: &UsageReport) -> Result<(), ScenarioError> {
        let dimensions = [
            (Resource::Cpu, usage.max_cpu(), self.expected_max_cpu),
            (Resource::Ram, usage.max_ram(), self.expected_max_ram),
        ];

        for (metric, observed, limit) in dimensions {
            if limit > 0.0 && observed > limit {
                return Err(ScenarioError::ResourceBudgetExceeded {
                    metric,
                    observed,
                    limit,
                });
            }
        }
        Ok(())
    }
}

/// One combination of sender, receiver, budget and pipeline extras. A scenario is consumed by the
/// run that executes it, so its sender and receiver are never shared between runs.
pub struct Scenario {
    pub(crate) name: String,
    pub(crate) sender: Box<dyn DataSender>,
    pub(crate) receiver: Box<dyn DataReceiver>,
    pub(crate) resource_spec: ResourceSpec,
    pub(crate) processors: BTreeMap<String, String>,
    pub(crate) extensions: BTreeMap<String, String>,
    pub(crate) delivery: DeliveryGuarantee,
    pub(crate) load: LoadOptions,
}
impl Scenario {
    pub fn new(
        name: &str,
        sender: Box<dyn DataSender>,
        receiver: Box<dyn DataReceiver>,
        resource_spec: ResourceSpec,
    ) -> Self {
        Self {
            name: name.to_string(),
            sender,
            receiver,
            resource_spec,
            processors: BTreeMap::new(),
            extensions: BTreeMap::new(),
            delivery: DeliveryGuarantee::default(),
            load: LoadOptions::default(),
        }
    }

    pub fn with_processors(mut self, processors: BTreeMap<String, String>) -> Self {
        self.processors = processors;
        self
    }

    pub fn with_extensions(mut self, extensions: BTreeMap<String, String>) -> Self {
        self.extensions = extensions;
        self
    }

    pub fn with_delivery(mut self, delivery: DeliveryGuarantee) -> Self {
        self.delivery = delivery;
        self
    }

    pub fn with_load(mut self, load: LoadOptions) -> Self {
        self.load = load;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn resource_spec(&self) -> &ResourceSpec {
        &self.resource_spec
    }

    pub fn processors(&self) -> &BTreeMap<String, String> {
        &self.processors
    }

    pub fn extensions(&self) -> &BTreeMap<String, String> {
        &self.extensions
    }

    pub fn delivery(&self) -> DeliveryGuarantee {
        self.delivery
    }

    pub fn load(&self) -> &LoadOptions {
        &self.load
    }
}
impl fmt::Debug for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scenario")
            .field("name", &self.name)
            .field("sender", &self.sender.name())
            .field("receiver", &self.receiver.name())
            .field("resource_spec", &self.resource_spec)
            .field("processors", &self.processors.keys())
            .field("extensions", &self.extensions.keys())
            .field("delivery", &self.delivery)
            .field("load", &self.load)
            .finish()
    }
}

/// The outcome of one scenario run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceResult {
    pub run_id: String,
    pub scenario_name: String,
    pub started_at: DateTime<Utc>,
    pub items_sent: u64,
    pub items_received: u64,
    pub elapsed: Duration,
    pub observed_max_cpu: f64,
    pub observed_avg_cpu: f64,
    pub observed_max_ram: f64,
    pub observed_avg_ram: f64,
    pub passed: bool,
    pub failure_reason: Option<ScenarioError>,
}
impl PerformanceResult {
    /// A result for a scenario that failed before anything was measured.
    pub fn failed(
        run_id: &str,
        scenario_name: &str,
        started_at: DateTime<Utc>,
        reason: ScenarioError,
    ) -> Self {
        Self {
            run_id: run_id.to_string(),
            scenario_name: scenario_name.to_string(),
            started_at,
            items_sent: 0,
            items_received: 0,
            elapsed: Duration::ZERO,
            observed_max_cpu: 0.0,
            observed_avg_cpu: 0.0,
            observed_max_ram: 0.0,
            observed_avg_ram: 0.0,
            passed: false,
            failure_reason: Some(reason),
        }
    }

    pub fn failure_category(&self) -> Option<ErrorCategory> {
        self.failure_reason.as_ref().map(ScenarioError::category)
    }
}

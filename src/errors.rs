/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Separates faults in the testbed itself from regressions in the pipeline under test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCategory {
    Infrastructure,
    Assertion,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Resource {
    #[serde(rename = "CPU")]
    Cpu,
    #[serde(rename = "RAM")]
    Ram,
}
impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resource::Cpu => write!(f, "CPU"),
            Resource::Ram => write!(f, "RAM"),
        }
    }
}

/// Everything that can make a scenario fail. Carried inside `PerformanceResult`, so it must be
/// cheap to clone and serializable.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScenarioError {
    #[error("ConfigError: {message}")]
    Config { message: String },

    #[error("ProcessStartError: failed to start {process}: {message}")]
    ProcessStart { process: String, message: String },

    #[error("SendError: gave up after {attempts} attempt(s): {message}")]
    Send { attempts: u32, message: String },

    #[error("ResourceSampleError: {message}")]
    ResourceSample { message: String },

    #[error("CountMismatchError: expected {expected} item(s), received {actual}")]
    CountMismatch { expected: u64, actual: u64 },

    #[error("ReceiverError: {message}")]
    ReceiverFault { message: String },

    #[error("ResourceBudgetExceededError: {metric} observed {observed:.1}, limit {limit:.1}")]
    ResourceBudgetExceeded {
        metric: Resource,
        observed: f64,
        limit: f64,
    },

    #[error("TimeoutError: deadline of {deadline_secs:.1}s exceeded while {phase}")]
    Timeout { deadline_secs: f64, phase: String },
}

impl ScenarioError {
    pub fn config(message: impl fmt::Display) -> Self {
        ScenarioError::Config {
            message: message.to_string(),
        }
    }

    pub fn process_start(process: &str, message: impl fmt::Display) -> Self {
        ScenarioError::ProcessStart {
            process: process.to_string(),
            message: message.to_string(),
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            ScenarioError::Config { .. }
            | ScenarioError::ProcessStart { .. }
            | ScenarioError::ResourceSample { .. } => ErrorCategory::Infrastructure,

            ScenarioError::Send { .. }
            | ScenarioError::CountMismatch { .. }
            | ScenarioError::ReceiverFault { .. }
            | ScenarioError::ResourceBudgetExceeded { .. }
            | ScenarioError::Timeout { .. } => ErrorCategory::Assertion,
        }
    }

    /// Short name used in summaries and the results database.
    pub fn kind(&self) -> &'static str {
        match self {
            ScenarioError::Config { .. } => "ConfigError",
            ScenarioError::ProcessStart { .. } => "ProcessStartError",
            ScenarioError::Send { .. } => "SendError",
            ScenarioError::ResourceSample { .. } => "ResourceSampleError",
            ScenarioError::CountMismatch { .. } => "CountMismatchError",
            ScenarioError::ReceiverFault { .. } => "ReceiverError",
            ScenarioError::ResourceBudgetExceeded { .. } => "ResourceBudgetExceededError",
            ScenarioError::Timeout { .. } => "TimeoutError",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infrastructure_and_assertion_failures_are_told_apart() {
        assert_eq!(
            ScenarioError::config("bad fragment").category(),
            ErrorCategory::Infrastructure
        );
        assert_eq!(
            ScenarioError::process_start("otelcol", "no such file").category(),
            ErrorCategory::Infrastructure
        );
        assert_eq!(
            ScenarioError::CountMismatch {
                expected: 10,
                actual: 9
            }
            .category(),
            ErrorCategory::Assertion
        );
        assert_eq!(
            ScenarioError::Timeout {
                deadline_secs: 1.0,
                phase: "reconciling".to_string()
            }
            .category(),
            ErrorCategory::Assertion
        );
    }

    #[test]
    fn budget_error_names_metric_observed_and_limit() {
        let err = ScenarioError::ResourceBudgetExceeded {
            metric: Resource::Ram,
            observed: 162.0,
            limit: 150.0,
        };
        assert_eq!(
            err.to_string(),
            "ResourceBudgetExceededError: RAM observed 162.0, limit 150.0"
        );
        assert_eq!(err.kind(), "ResourceBudgetExceededError");
    }

    #[test]
    fn serializes_with_kind_tag() -> anyhow::Result<()> {
        let err = ScenarioError::CountMismatch {
            expected: 150000,
            actual: 149000,
        };
        let json = serde_json::to_value(&err)?;
        assert_eq!(json["kind"], "count_mismatch");
        assert_eq!(json["actual"], 149000);
        Ok(())
    }
}

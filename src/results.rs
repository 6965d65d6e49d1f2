/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

pub mod console;
pub mod database;
pub mod markdown;

use crate::scenario::PerformanceResult;
use async_trait::async_trait;

/// Somewhere results are reported. `record` is called once per scenario as soon as its result is
/// known, `finish` once after the whole suite with every result in run order.
#[async_trait]
pub trait ResultsSink: Send {
    async fn record(&mut self, result: &PerformanceResult) -> anyhow::Result<()>;

    async fn finish(&mut self, _results: &[PerformanceResult]) -> anyhow::Result<()> {
        Ok(())
    }
}

/// `PASS` or `FAIL`.
pub fn verdict(result: &PerformanceResult) -> &'static str {
    if result.passed {
        "PASS"
    } else {
        "FAIL"
    }
}

/// The failure reason as a single line, empty for a passing result.
pub fn failure_summary(result: &PerformanceResult) -> String {
    result
        .failure_reason
        .as_ref()
        .map(|reason| reason.to_string().replace('\n', " "))
        .unwrap_or_default()
}

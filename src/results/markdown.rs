/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use super::{failure_summary, verdict, ResultsSink};
use crate::scenario::PerformanceResult;
use anyhow::Context;
use async_trait::async_trait;
use chrono::Local;
use std::{
    fs::{self, File},
    io::Write,
    path::{Path, PathBuf},
    time::Instant,
};
use tracing::debug;

pub const RESULTS_FILE: &str = "TESTRESULTS.md";

const HEADER: &str = "\
Test                                    |Result|Duration|CPU Avg%|CPU Max%|RAM Avg MiB|RAM Max MiB|Sent Items|Received Items|
----------------------------------------|------|-------:|-------:|-------:|----------:|----------:|---------:|-------------:|
";

/// Writes a markdown table with one row per scenario to `<dir>/TESTRESULTS.md`. Rows are
/// written as results arrive, so an interrupted suite still leaves a readable file.
#[derive(Debug)]
pub struct MarkdownSummary {
    path: PathBuf,
    file: File,
    started: Instant,
}
impl MarkdownSummary {
    /// Creates `dir` if needed and truncates any previous results file in it.
    pub fn create(dir: &Path) -> anyhow::Result<Self> {
        fs::create_dir_all(dir)
            .context(format!("Error creating results directory {}", dir.display()))?;

        let path = dir.join(RESULTS_FILE);
        let mut file =
            File::create(&path).context(format!("Error creating {}", path.display()))?;
        write!(
            file,
            "# Test PerformanceResults\nStarted: {}\n\n{}",
            Local::now().format("%a, %d %b %Y %H:%M:%S %z"),
            HEADER
        )?;
        debug!("Writing results to {}", path.display());

        Ok(Self {
            path,
            file,
            started: Instant::now(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ResultsSink for MarkdownSummary {
    async fn record(&mut self, result: &PerformanceResult) -> anyhow::Result<()> {
        self.file
            .write_all(format_row(result).as_bytes())
            .context(format!("Error writing to {}", self.path.display()))?;
        Ok(self.file.flush()?)
    }

    async fn finish(&mut self, _results: &[PerformanceResult]) -> anyhow::Result<()> {
        writeln!(
            self.file,
            "\nTotal duration: {:.0}s",
            self.started.elapsed().as_secs_f64()
        )?;
        self.file.sync_all()?;
        Ok(())
    }
}

fn format_row(result: &PerformanceResult) -> String {
    format!(
        "{:<40}|{:<6}|{:>7.0}s|{:>8.1}|{:>8.1}|{:>11}|{:>11}|{:>10}|{:>14}|{}\n",
        result.scenario_name,
        verdict(result),
        result.elapsed.as_secs_f64(),
        result.observed_avg_cpu,
        result.observed_max_cpu,
        result.observed_avg_ram as u64,
        result.observed_max_ram as u64,
        result.items_sent,
        result.items_received,
        failure_summary(result)
    )
}

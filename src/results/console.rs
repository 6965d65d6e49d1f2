/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use super::{failure_summary, verdict, ResultsSink};
use crate::scenario::PerformanceResult;
use async_trait::async_trait;
use colored::*;
use term_table::{row, row::Row, rows, table_cell::*, Table, TableStyle};

/// Prints a table of the suite to stdout once it is finished.
#[derive(Debug, Default)]
pub struct ConsoleSummary;

#[async_trait]
impl ResultsSink for ConsoleSummary {
    async fn record(&mut self, _result: &PerformanceResult) -> anyhow::Result<()> {
        Ok(())
    }

    async fn finish(&mut self, results: &[PerformanceResult]) -> anyhow::Result<()> {
        if results.is_empty() {
            println!("\n{}", "No scenarios were run".yellow());
            return Ok(());
        }

        println!("\n{}", " Summary ".reversed().green());
        println!("{}", render_table(results));

        let failed = results.iter().filter(|result| !result.passed).count();
        match failed {
            0 => println!("{}", format!("All {} scenario(s) passed", results.len()).green()),
            n => println!(
                "{}",
                format!("{} of {} scenario(s) failed", n, results.len()).red()
            ),
        }
        Ok(())
    }
}

fn render_table(results: &[PerformanceResult]) -> String {
    let mut rows = rows![row![
        TableCell::builder("Scenario".bold()).build(),
        TableCell::builder("Result".bold()).build(),
        TableCell::builder("Duration (s)".bold()).build(),
        TableCell::builder("CPU Avg/Max (%)".bold()).build(),
        TableCell::builder("RAM Avg/Max (MiB)".bold()).build(),
        TableCell::builder("Sent / Received".bold()).build(),
        TableCell::builder("Reason".bold()).build()
    ]];

    for result in results {
        let verdict = match result.passed {
            true => verdict(result).green(),
            false => verdict(result).red(),
        };
        rows.push(row![
            TableCell::new(&result.scenario_name),
            TableCell::new(verdict),
            TableCell::new(format!("{:.1}", result.elapsed.as_secs_f64())),
            TableCell::new(format!(
                "{:.1} / {:.1}",
                result.observed_avg_cpu, result.observed_max_cpu
            )),
            TableCell::new(format!(
                "{:.0} / {:.0}",
                result.observed_avg_ram, result.observed_max_ram
            )),
            TableCell::new(format!("{} / {}", result.items_sent, result.items_received)),
            TableCell::new(failure_summary(result).bright_black())
        ]);
    }

    Table::builder()
        .rows(rows)
        .style(TableStyle::rounded())
        .build()
        .render()
}

/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

pub mod checkpoint;
pub mod clap_args;
pub mod config;
pub mod datareceivers;
pub mod datasenders;
pub mod entities;
pub mod errors;
pub mod load_generator;
pub mod metrics_logger;
pub mod migrations;
pub mod pipeline_config;
pub mod process_control;
pub mod reconciler;
pub mod results;
pub mod scenario;
pub mod scenario_runner;

use anyhow::Context;
use checkpoint::CheckpointStorage;
use config::{BuildContext, Config};
use migrations::{Migrator, MigratorTrait};
use results::ResultsSink;
use scenario::PerformanceResult;
use scenario_runner::{PendingScenario, ScenarioRunner};
use sea_orm::{ConnectOptions, Database, DatabaseConnection};
use std::{fs, path::Path, sync::Arc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Connects to the testbed database. For file backed SQLite urls the file is created if it
/// doesn't exist yet.
pub async fn db_connect(database_url: &str) -> anyhow::Result<DatabaseConnection> {
    let in_memory = database_url.contains(":memory:") || database_url.contains("mode=memory");

    if !in_memory {
        if let Some(path) = sqlite_path(database_url) {
            if !path.exists() {
                debug!("Creating database file {}", path.display());
                let parent = path.parent().filter(|parent| !parent.as_os_str().is_empty());
                if let Some(parent) = parent {
                    fs::create_dir_all(parent)?;
                }
                fs::File::create(path).context("Error creating database file")?;
            }
        }
    }

    let mut options = ConnectOptions::new(database_url);
    options.sqlx_logging(false);
    if in_memory {
        // every connection to an in-memory database gets a fresh database
        options.max_connections(1);
    }

    Database::connect(options)
        .await
        .context(format!("Error connecting to {}", database_url))
}

pub async fn db_migrate(db: &DatabaseConnection) -> anyhow::Result<()> {
    Migrator::up(db, None)
        .await
        .context("Error migrating database")
}

fn sqlite_path(database_url: &str) -> Option<&Path> {
    let path = database_url
        .strip_prefix("sqlite://")
        .or_else(|| database_url.strip_prefix("sqlite:"))?;
    let path = path.split('?').next().unwrap_or(path);
    (!path.is_empty()).then(|| Path::new(path))
}

/// Runs the scenarios named in `names` (every enabled scenario when empty) against the pipeline
/// described by `config`.
///
/// Scenarios are built one at a time right before they run, so ports are allocated as late as
/// possible. A scenario that fails to build is reported as failed and the suite carries on.
///
/// # Arguments
///
/// * `config` - The testbed configuration
/// * `names` - Scenarios to run
/// * `sinks` - Where results are reported
/// * `storage` - Checkpoint storage for senders that resume from a checkpoint
/// * `token` - Cancels the suite
pub async fn run(
    config: &Config,
    names: &[String],
    sinks: &mut [Box<dyn ResultsSink>],
    storage: Option<Arc<dyn CheckpointStorage>>,
    token: &CancellationToken,
) -> anyhow::Result<Vec<PerformanceResult>> {
    let options = config.run.to_options()?;
    let entries = config.scenarios_to_run(names)?;
    let ctx = BuildContext {
        work_dir: config.run.work_dir.clone(),
        storage,
    };

    let runner = ScenarioRunner::new(config.pipeline.clone(), options, &config.run.work_dir);
    info!(
        "Starting run {} with {} scenario(s)",
        runner.run_id(),
        entries.len()
    );

    let pending = entries
        .into_iter()
        .map(|entry| match config.build_scenario(entry, &ctx) {
            Ok(scenario) => PendingScenario::Ready(scenario),
            Err(error) => PendingScenario::Invalid {
                name: entry.name.clone(),
                error,
            },
        });

    Ok(runner.run_suite(pending, sinks, token).await)
}

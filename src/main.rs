/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use anyhow::Context;
use colored::*;
use dotenvy::dotenv;
use std::{path::Path, process::ExitCode, sync::Arc};
use testbed::{
    checkpoint::{database::DatabaseStorage, CheckpointStorage},
    clap_args::{self, Commands},
    config::{self, Config},
    db_connect, db_migrate,
    results::{
        console::ConsoleSummary, database::DatabaseSink, markdown::MarkdownSummary, ResultsSink,
    },
};
use tokio_util::sync::CancellationToken;
use tracing::{info, subscriber::set_global_default, warn, Subscriber};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    // read .env file if it exists
    dotenv().ok();

    let args = clap_args::parse();

    let level = if args.verbose { "debug" } else { "warn" };
    set_global_default(get_subscriber(level)).context("Error setting tracing subscriber")?;

    match args.command {
        Commands::Init => {
            config::init_config(&args.file);
            Ok(ExitCode::SUCCESS)
        }

        Commands::List => {
            let config = load_config(&args.file)?;
            println!("{}", " Scenarios ".reversed().green());
            for scenario in &config.scenarios {
                let state = match scenario.enabled {
                    true => "enabled".green(),
                    false => "disabled".bright_black(),
                };
                println!("  {} ({})", scenario.name, state);
            }
            Ok(ExitCode::SUCCESS)
        }

        Commands::Run {
            scenarios,
            results_dir,
        } => {
            let config = load_config(&args.file)?;

            let mut sinks: Vec<Box<dyn ResultsSink>> = vec![
                Box::new(ConsoleSummary),
                Box::new(MarkdownSummary::create(&results_dir)?),
            ];
            let mut storage: Option<Arc<dyn CheckpointStorage>> = None;
            if let Some(database_url) = config.database_url() {
                let db = db_connect(&database_url).await?;
                db_migrate(&db).await?;
                storage = Some(Arc::new(DatabaseStorage::new(db.clone())));
                sinks.push(Box::new(DatabaseSink::new(db)));
            } else {
                info!("No database configured, results are not persisted");
            }

            let token = CancellationToken::new();
            tokio::spawn({
                let token = token.clone();
                async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        warn!("Interrupted, stopping the current scenario");
                        println!("\n{}", "Interrupted, tearing down".yellow());
                        token.cancel();
                    }
                }
            });

            let results = testbed::run(&config, &scenarios, &mut sinks, storage, &token).await?;
            match results.iter().all(|result| result.passed) && !token.is_cancelled() {
                true => Ok(ExitCode::SUCCESS),
                false => Ok(ExitCode::FAILURE),
            }
        }
    }
}

fn load_config(path: &Path) -> anyhow::Result<Config> {
    Config::try_from_path(path).context(format!(
        "Unable to load {}, run `testbed init` to create one",
        path.display()
    ))
}

fn get_subscriber(level: &str) -> impl Subscriber + Sync + Send {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .finish()
}

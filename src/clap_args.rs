/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author = "Oliver Winks (@ohuu), William Kimbell (@seal)", version, about, long_about = None)]
pub struct Args {
    /// Verbose mode (-v, --verbose)
    #[arg(short, long)]
    pub verbose: bool,

    /// Path to the testbed config
    #[arg(short, long, default_value = "testbed.toml")]
    pub file: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Write an example config
    Init,

    /// List the scenarios in the config
    List,

    /// Run scenarios against the pipeline
    Run {
        /// Scenarios to run, every enabled scenario when omitted
        #[arg(short, long = "scenario")]
        scenarios: Vec<String>,

        /// Directory the results summary is written to
        #[arg(long, default_value = "results")]
        results_dir: PathBuf,
    },
}

pub fn parse() -> Args {
    Args::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_accepts_repeated_scenarios() -> anyhow::Result<()> {
        let args = Args::try_parse_from(["testbed", "-v", "run", "-s", "filelog", "-s", "tcplog"])?;

        assert!(args.verbose);
        assert_eq!(args.file, PathBuf::from("testbed.toml"));
        match args.command {
            Commands::Run {
                scenarios,
                results_dir,
            } => {
                assert_eq!(scenarios, vec!["filelog", "tcplog"]);
                assert_eq!(results_dir, PathBuf::from("results"));
            }
            other => panic!("expected run, got {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn config_path_can_be_overridden() -> anyhow::Result<()> {
        let args = Args::try_parse_from(["testbed", "--file", "perf.toml", "list"])?;
        assert_eq!(args.file, PathBuf::from("perf.toml"));
        assert!(matches!(args.command, Commands::List));
        Ok(())
    }
}

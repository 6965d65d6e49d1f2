/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::config::{PipelineProcess, Redirect};
use anyhow::{anyhow, Context};
use colored::*;
use std::{
    fs::{self, OpenOptions},
    net::TcpListener,
    path::Path,
    process::Command,
    time::Duration,
};
use subprocess::{Exec, NullFile, Popen, Redirection};
use tracing::{debug, warn};

/// A process started by the testbed. The process is killed when this handle is dropped, so a
/// scenario can never leak the pipeline it started.
#[derive(Debug)]
pub struct ManagedProcess {
    name: String,
    pid: u32,
    popen: Popen,
    down: Option<String>,
}
impl ManagedProcess {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn is_running(&mut self) -> bool {
        self.popen.poll().is_none()
    }
}
impl Drop for ManagedProcess {
    fn drop(&mut self) {
        if self.is_running() {
            warn!("Killing {} (pid {}) on drop", self.name, self.pid);
            let _ = self.popen.kill();
            let _ = self.popen.wait_timeout(Duration::from_millis(500));
        }
    }
}

/// Runs the given command as a detached process. This function does not block because the
/// process is managed by the OS and running separately from this thread.
fn run_command_detached(
    name: &str,
    command: &str,
    redirect: Redirect,
    log_dir: &Path,
) -> anyhow::Result<Popen> {
    // break command string into POSIX words
    let words = shlex::split(command)
        .ok_or_else(|| anyhow!("Command string is not POSIX compliant: {command}"))?;

    // split command string into command and args
    let [program, args @ ..] = &words[..] else {
        return Err(anyhow!("Command for {name} is empty"));
    };

    let exec = Exec::cmd(program).args(args);
    let exec = match redirect {
        Redirect::Null => exec.stdout(NullFile).stderr(NullFile),
        Redirect::Parent => exec,
        Redirect::File => {
            fs::create_dir_all(log_dir)
                .context(format!("Error creating log directory {}", log_dir.display()))?;
            let out_file = OpenOptions::new()
                .append(true)
                .create(true)
                .open(log_dir.join(format!("{name}.stdout")))?;
            let err_file = OpenOptions::new()
                .append(true)
                .create(true)
                .open(log_dir.join(format!("{name}.stderr")))?;
            exec.stdout(Redirection::File(out_file))
                .stderr(Redirection::File(err_file))
        }
    };

    exec.detached()
        .popen()
        .context(format!("Failed to spawn detached process, command: {command}"))
}

/// Starts the pipeline under test.
///
/// # Arguments
///
/// * `process` - How to start and stop the pipeline. `{config}` in its `up` command is replaced
///   with `config_path`.
/// * `config_path` - The rendered pipeline config
/// * `log_dir` - Where stdout and stderr go when the process redirects to files
pub fn run_process(
    process: &PipelineProcess,
    config_path: &Path,
    log_dir: &Path,
) -> anyhow::Result<ManagedProcess> {
    let up = process
        .up
        .replace("{config}", &config_path.to_string_lossy());
    debug!("Running command {} in detached mode", up);

    let mut popen = run_command_detached(
        &process.name,
        &up,
        process.redirect.unwrap_or_default(),
        log_dir,
    )?;
    let Some(pid) = popen.pid() else {
        let _ = popen.kill();
        return Err(anyhow!("Process {} should have a PID", process.name));
    };

    Ok(ManagedProcess {
        name: process.name.clone(),
        pid,
        popen,
        down: process
            .down
            .as_ref()
            .map(|down| down.replace("{pid}", &pid.to_string())),
    })
}

/// Stops a managed process, first with its `down` command (or SIGTERM when it has none) and, if
/// it is still running after `grace`, by killing it.
///
/// Blocks while waiting for the process to exit, so call it from `spawn_blocking` in async code.
pub fn shutdown_process(process: &mut ManagedProcess, grace: Duration) -> anyhow::Result<()> {
    if !process.is_running() {
        debug!("{} already exited", process.name);
        return Ok(());
    }

    print!("> stopping process {}", process.name.green());
    let res = match &process.down {
        Some(down) => {
            let words = shlex::split(down)
                .ok_or_else(|| anyhow!("Command string is not POSIX compliant: {down}"))?;
            match &words[..] {
                [command, args @ ..] => Command::new(command)
                    .args(args)
                    .output()
                    .map(|_| ())
                    .map_err(anyhow::Error::from),
                _ => Err(anyhow!("Down command for {} is empty", process.name)),
            }
        }
        None => process.popen.terminate().map_err(anyhow::Error::from),
    };
    if let Err(err) = &res {
        warn!("Failed to stop {} gracefully: {}", process.name, err);
    }

    let exited = process
        .popen
        .wait_timeout(grace)
        .context(format!("Error waiting for {} to exit", process.name))?;
    if exited.is_none() {
        warn!(
            "{} did not exit within {:?}, killing it",
            process.name, grace
        );
        process.popen.kill()?;
        process.popen.wait_timeout(grace)?;
    }

    println!("\t{}", "✓".green());
    if let Some(down) = &process.down {
        println!("\t{}", format!("- {}", down).bright_black());
    }
    Ok(())
}

/// Asks the OS for a free localhost port.
pub fn available_port() -> anyhow::Result<u16> {
    let listener =
        TcpListener::bind("127.0.0.1:0").context("Error binding to an ephemeral port")?;
    Ok(listener.local_addr()?.port())
}

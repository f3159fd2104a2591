// SPDX-FileCopyrightText: © 2024 Christopher Woods <Christopher.Woods@bristol.ac.uk>
// SPDX-License-Identifier: MIT

use clusterstats::Error;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use subprocess::{Exec, NullFile, Popen, Redirection};

/// Commands slower than this are logged as a warning
const SLOW_COMMAND: Duration = Duration::from_secs(5);

///
/// The slurm commands to run, and how long to wait for each.
/// Each command may be a composite, e.g. "docker exec slurmctld sacct"
///
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SlurmConfig {
    sacct: String,
    scontrol: String,
    sinfo: String,
    timeout_secs: u64,
}

impl Default for SlurmConfig {
    fn default() -> Self {
        SlurmConfig {
            sacct: "sacct".to_string(),
            scontrol: "scontrol".to_string(),
            sinfo: "sinfo".to_string(),
            timeout_secs: 120,
        }
    }
}

impl SlurmConfig {
    /// Use `binary` in place of the default for `cmd`
    pub fn with_command(mut self, cmd: SlurmCommand, binary: &str) -> Self {
        match cmd {
            SlurmCommand::Sacct => self.sacct = binary.to_string(),
            SlurmCommand::Scontrol => self.scontrol = binary.to_string(),
            SlurmCommand::Sinfo => self.sinfo = binary.to_string(),
        }
        self
    }

    pub fn with_timeout_secs(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlurmCommand {
    Sacct,
    Scontrol,
    Sinfo,
}

#[derive(Debug, Clone)]
pub struct SlurmRunner {
    config: SlurmConfig,
}

fn kill(process: &mut Popen, cmd: &[String]) {
    if let Err(e) = process.kill() {
        tracing::warn!("Could not kill command {:?}: {}", cmd, e);
    }

    if let Err(e) = process.wait_timeout(Duration::from_secs(1)) {
        tracing::warn!("Could not reap command {:?}: {}", cmd, e);
    }
}

impl SlurmRunner {
    pub fn new(config: &SlurmConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.config.timeout_secs)
    }

    ///
    /// Build a command from a vector of arguments. The configured
    /// binary is split with shell rules so that composite commands
    /// work, and empty arguments are removed.
    ///
    pub fn build_command(&self, cmd: SlurmCommand, args: &[String]) -> Result<Vec<String>, Error> {
        let binary_str = match cmd {
            SlurmCommand::Sacct => &self.config.sacct,
            SlurmCommand::Scontrol => &self.config.scontrol,
            SlurmCommand::Sinfo => &self.config.sinfo,
        };

        let mut command = match shlex::split(binary_str) {
            Some(parts) if !parts.is_empty() => parts,
            _ => {
                return Err(Error::Call(format!(
                    "Could not parse command binary: {}",
                    binary_str
                )));
            }
        };

        command.extend(args.iter().cloned());

        // remove any empty arguments
        command.retain(|arg| !arg.trim().is_empty());

        Ok(command)
    }

    ///
    /// Run the command, returning its standard output. The timeout
    /// covers reading the output as well as waiting for the exit, so
    /// a background process that keeps the pipes open cannot hold
    /// up the call.
    ///
    pub fn run(&self, cmd: &[String]) -> Result<String, Error> {
        let (program, args) = cmd
            .split_first()
            .ok_or_else(|| Error::Call("Empty command vector".to_string()))?;

        tracing::debug!("Running command: {:?}", cmd);

        let start_time = Instant::now();
        let timeout = self.timeout();

        let mut process = Exec::cmd(program)
            .args(args)
            .stdin(NullFile)
            .stdout(Redirection::Pipe)
            .stderr(Redirection::Pipe)
            .popen()
            .map_err(|e| {
                tracing::error!("Could not run command {:?}: {}", cmd, e);
                Error::Call(format!("Could not run command {:?}: {}", cmd, e))
            })?;

        // drain both pipes together so a chatty command cannot block
        let output = process
            .communicate_start(None)
            .limit_time(timeout)
            .read();

        let (stdout, stderr) = match output {
            Ok((stdout, stderr)) => (stdout.unwrap_or_default(), stderr.unwrap_or_default()),
            Err(e) if e.error.kind() == std::io::ErrorKind::TimedOut => {
                kill(&mut process, cmd);
                tracing::error!(
                    "Command {:?} timed out after {:?} seconds",
                    cmd,
                    timeout.as_secs()
                );
                return Err(Error::Timeout(format!("Command {:?} timed out", cmd)));
            }
            Err(e) => {
                kill(&mut process, cmd);
                tracing::error!("Could not read output of {:?}: {}", cmd, e.error);
                return Err(Error::Call(format!(
                    "Could not read output of {:?}: {}",
                    cmd, e.error
                )));
            }
        };

        // the pipes are closed, but the command itself may not have exited
        let remaining = timeout.saturating_sub(start_time.elapsed());

        let status = process.wait_timeout(remaining).map_err(|e| {
            tracing::error!("Could not wait for command {:?}: {}", cmd, e);
            Error::Call(format!("Could not wait for command {:?}: {}", cmd, e))
        })?;

        let status = match status {
            Some(status) => status,
            None => {
                kill(&mut process, cmd);
                tracing::error!(
                    "Command {:?} timed out after {:?} seconds",
                    cmd,
                    timeout.as_secs()
                );
                return Err(Error::Timeout(format!("Command {:?} timed out", cmd)));
            }
        };

        let duration = start_time.elapsed();

        if duration > SLOW_COMMAND {
            tracing::warn!(
                "Running command {:?} took {} seconds",
                cmd,
                duration.as_secs_f64()
            );
        }

        if status.success() {
            String::from_utf8(stdout).map_err(|e| {
                tracing::error!("Could not parse output of {:?}: {}", cmd, e);
                Error::Call(format!("Could not parse output of {:?}", cmd))
            })
        } else {
            let stderr = String::from_utf8_lossy(&stderr);
            tracing::error!("Command {:?} failed: {}", cmd, stderr.trim());
            Err(Error::Call(format!(
                "Command {:?} failed ({:?}): {}",
                cmd,
                status,
                stderr.trim()
            )))
        }
    }

    /// Build and run a slurm command
    pub fn call(&self, cmd: SlurmCommand, args: &[String]) -> Result<String, Error> {
        let command = self.build_command(cmd, args)?;
        self.run(&command)
    }
}

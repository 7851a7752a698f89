// Copyright 2024, The Android Open Source Project
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Invocation of the external tools the pipeline drives: the backing store, veritysetup and
//! cryptsetup. Everything goes through [`CommandRunner`] so that the pipeline can be exercised
//! without touching the kernel.

use crate::error::MountError;
use anyhow::{anyhow, Context, Result};
use log::{debug, info};
use std::ffi::{OsStr, OsString};
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use zeroize::{Zeroize, Zeroizing};

/// A program and its arguments.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ToolCommand {
    program: PathBuf,
    args: Vec<OsString>,
}

impl ToolCommand {
    pub fn new<P: AsRef<Path>>(program: P) -> Self {
        ToolCommand { program: program.as_ref().to_path_buf(), args: Vec::new() }
    }

    pub fn arg<S: AsRef<OsStr>>(mut self, arg: S) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args.extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn get_args(&self) -> &[OsString] {
        &self.args
    }

    /// Value following `flag`, if there is one.
    pub fn flag_value(&self, flag: &str) -> Option<&OsStr> {
        let pos = self.args.iter().position(|a| a == flag)?;
        self.args.get(pos + 1).map(|a| a.as_os_str())
    }

    fn to_command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        command
    }
}

impl fmt::Display for ToolCommand {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

/// Runs external programs.
pub trait CommandRunner {
    /// Runs `command` to completion and returns what it printed.
    fn run(&self, command: &ToolCommand) -> Result<Output>;

    /// Starts `command` in the background and returns immediately. The process is never waited
    /// on.
    fn spawn(&self, command: &ToolCommand) -> Result<()>;
}

/// Runs programs as child processes of this one.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, command: &ToolCommand) -> Result<Output> {
        debug!("Running {}", command);
        command
            .to_command()
            .stdin(Stdio::null())
            .output()
            .with_context(|| format!("Failed to execute {}", command.program().display()))
    }

    fn spawn(&self, command: &ToolCommand) -> Result<()> {
        debug!("Starting {}", command);
        let child = command
            .to_command()
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("{} failed to start", command.program().display()))?;
        info!("{} running with pid {}", command.program().display(), child.id());
        Ok(())
    }
}

/// Runs `command` and turns a non-zero exit into [`MountError::ToolFailed`] carrying the
/// combined output of the tool.
pub fn run_checked(runner: &dyn CommandRunner, command: &ToolCommand) -> Result<String> {
    let output = checked_output(runner, command)?;
    Ok(combined_output(&output))
}

/// Like [`run_checked`], but returns only what the tool printed on stdout. The output may carry
/// key material, so it is wiped when dropped.
pub fn run_for_stdout(
    runner: &dyn CommandRunner,
    command: &ToolCommand,
) -> Result<Zeroizing<String>> {
    let output = checked_output(runner, command)?;
    let stdout = String::from_utf8(output.stdout).map_err(|e| {
        e.into_bytes().zeroize();
        anyhow!("{} printed invalid UTF-8", command.program().display())
    })?;
    Ok(Zeroizing::new(stdout))
}

fn checked_output(runner: &dyn CommandRunner, command: &ToolCommand) -> Result<Output> {
    let output = runner.run(command)?;
    if !output.status.success() {
        return Err(MountError::ToolFailed {
            tool: command.program().display().to_string(),
            status: output.status,
            output: combined_output(&output),
        }
        .into());
    }
    Ok(output)
}

fn combined_output(output: &Output) -> String {
    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));
    combined.trim().to_owned()
}

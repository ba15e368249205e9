//! Subprocess execution for compilers, signers and helper tools

use crate::error::{Error, Result};
use async_trait::async_trait;
use std::process::Stdio;
use std::sync::{Mutex, PoisonError};
use tokio::process::{Child, Command};

/// Runs external toolchain programs
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    /// Run to completion; a non-zero exit is a build error
    async fn run(&self, program: &str, args: &[String]) -> Result<()>;

    /// Run to completion and capture stdout
    async fn output(&self, program: &str, args: &[String]) -> Result<Vec<u8>>;

    /// Start a long-running helper in the background
    async fn spawn(&self, program: &str, args: &[String]) -> Result<()>;
}

pub(crate) fn command_line(program: &str, args: &[String]) -> String {
    if args.is_empty() {
        program.to_string()
    } else {
        format!("{} {}", program, args.join(" "))
    }
}

/// Runs programs on the local machine with tokio
///
/// Background helpers are killed when the runner is dropped.
#[derive(Default)]
pub struct SystemRunner {
    background: Mutex<Vec<Child>>,
}

impl SystemRunner {
    pub fn new() -> Self {
        Self::default()
    }

    fn command(program: &str, args: &[String]) -> Command {
        let mut cmd = Command::new(program);
        cmd.args(args).stdin(Stdio::null()).kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl ProcessRunner for SystemRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<()> {
        let line = command_line(program, args);
        log::debug!("{}", line);

        let mut cmd = Self::command(program, args);
        if !log::log_enabled!(log::Level::Debug) {
            cmd.stdout(Stdio::null()).stderr(Stdio::null());
        }
        let status = cmd.status().await?;
        if !status.success() {
            return Err(Error::ProcessFailed {
                command: line,
                code: status.code().unwrap_or(-1),
            });
        }
        Ok(())
    }

    async fn output(&self, program: &str, args: &[String]) -> Result<Vec<u8>> {
        let line = command_line(program, args);
        log::debug!("{}", line);

        let output = Self::command(program, args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;
        if !output.status.success() {
            log::debug!("{} stderr: {}", program, String::from_utf8_lossy(&output.stderr));
            return Err(Error::ProcessFailed {
                command: line,
                code: output.status.code().unwrap_or(-1),
            });
        }
        Ok(output.stdout)
    }

    async fn spawn(&self, program: &str, args: &[String]) -> Result<()> {
        log::debug!("{} &", command_line(program, args));

        let child = Self::command(program, args)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;
        self.background
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(child);
        Ok(())
    }
}

//! Local command execution (`!cmd` lines).
//!
//! The command runs under `/bin/sh -c` in the process working directory and
//! inherits the operator's terminal. The caller must make sure nothing else
//! reads the terminal meanwhile.

use std::io;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;

use tokio::process::{Child, Command};

/// How a local command ended.
#[derive(Debug)]
pub enum LocalOutcome {
    Success,
    Exited(i32),
    Signaled(i32),
    Failed(io::Error),
}

impl LocalOutcome {
    fn from_status(status: ExitStatus) -> Self {
        match (status.code(), status.signal()) {
            (Some(0), _) => LocalOutcome::Success,
            (Some(code), _) => LocalOutcome::Exited(code),
            (None, Some(signal)) => LocalOutcome::Signaled(signal),
            (None, None) => LocalOutcome::Success,
        }
    }

    /// Line to show the operator, if any. Success is silent.
    pub fn message(&self) -> Option<String> {
        match self {
            LocalOutcome::Success => None,
            LocalOutcome::Exited(code) => Some(format!("Child returned {code}")),
            LocalOutcome::Signaled(signal) => {
                Some(format!("Child was terminated by signal {signal}"))
            }
            LocalOutcome::Failed(e) => Some(e.to_string()),
        }
    }
}

/// Start `command`. It shares the operator's terminal, so Ctrl-C reaches it
/// directly.
pub fn spawn(command: &str) -> io::Result<Child> {
    tracing::debug!(command, "running local command");
    Command::new("/bin/sh").arg("-c").arg(command).spawn()
}

/// Wait for a child started by [`spawn`]. Cancel safe.
pub async fn wait(child: &mut Child) -> LocalOutcome {
    match child.wait().await {
        Ok(status) => LocalOutcome::from_status(status),
        Err(e) => LocalOutcome::Failed(e),
    }
}

use std::fmt;

use crate::pty::ChildExit;

/// Stable identity of a session, independent of its display name.
///
/// Renames keep the id; a reconnect creates a new one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Spawned, no prompt seen yet.
    Connecting,
    /// At the prompt, waiting for input.
    Idle,
    /// A command was sent and the prompt has not come back.
    Running,
    /// Alive but excluded from broadcast until re-enabled.
    Disabled,
    /// The child is gone; nothing is left open.
    Dead,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Connecting => "connecting",
            SessionState::Idle => "idle",
            SessionState::Running => "running",
            SessionState::Disabled => "disabled",
            SessionState::Dead => "dead",
        }
    }

    /// States that keep the aggregate prompt in `waiting`.
    pub fn is_busy(self) -> bool {
        matches!(self, SessionState::Connecting | SessionState::Running)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a session ended up dead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationCause {
    Exited(i32),
    Signaled(i32),
    SpawnFailed(String),
    /// The pty closed but the child could not be reaped.
    Unknown,
}

impl TerminationCause {
    /// Shell-style exit status: the code itself, or 128 + signal.
    pub fn exit_status(&self) -> i32 {
        match self {
            TerminationCause::Exited(code) => *code,
            TerminationCause::Signaled(signal) => 128 + signal,
            TerminationCause::SpawnFailed(_) => 255,
            TerminationCause::Unknown => 0,
        }
    }
}

impl From<ChildExit> for TerminationCause {
    fn from(exit: ChildExit) -> Self {
        match exit {
            ChildExit::Code(code) => TerminationCause::Exited(code),
            ChildExit::Signal(signal) => TerminationCause::Signaled(signal),
        }
    }
}

impl fmt::Display for TerminationCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminationCause::Exited(code) => write!(f, "exit code {code}"),
            TerminationCause::Signaled(signal) => write!(f, "signal {signal}"),
            TerminationCause::SpawnFailed(reason) => f.write_str(reason),
            TerminationCause::Unknown => f.write_str("terminated"),
        }
    }
}

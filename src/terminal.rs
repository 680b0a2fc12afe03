use std::io::IsTerminal;
use std::os::fd::{AsRawFd, RawFd};

use crossterm::terminal::size;
use thiserror::Error;

/// Size used when the operator's terminal cannot be queried.
pub const FALLBACK_SIZE: (u16, u16) = (24, 80);

#[derive(Error, Debug)]
pub enum TerminalError {
    #[error("failed to read terminal attributes: {0}")]
    GetAttributes(#[source] std::io::Error),

    #[error("failed to set terminal attributes: {0}")]
    SetAttributes(#[source] std::io::Error),
}

/// RAII guard that turns off local echo on a terminal.
///
/// Used while the operator types a line that must not show on screen (after
/// `:hide_password`). The previous attributes are restored on drop, even on
/// panic. Canonical mode stays on, so the line is still edited by the tty.
pub struct EchoGuard {
    fd: RawFd,
    saved: libc::termios,
}

impl EchoGuard {
    /// Disable echo on `input`. Returns `Ok(None)` when it is not a terminal.
    pub fn new<T: AsRawFd + IsTerminal>(input: &T) -> Result<Option<Self>, TerminalError> {
        if !input.is_terminal() {
            return Ok(None);
        }
        let fd = input.as_raw_fd();
        let mut saved: libc::termios = unsafe { std::mem::zeroed() };
        if unsafe { libc::tcgetattr(fd, &mut saved) } != 0 {
            return Err(TerminalError::GetAttributes(std::io::Error::last_os_error()));
        }
        let mut quiet = saved;
        quiet.c_lflag &= !(libc::ECHO | libc::ECHONL);
        if unsafe { libc::tcsetattr(fd, libc::TCSANOW, &quiet) } != 0 {
            return Err(TerminalError::SetAttributes(std::io::Error::last_os_error()));
        }
        Ok(Some(Self { fd, saved }))
    }
}

impl Drop for EchoGuard {
    fn drop(&mut self) {
        unsafe {
            libc::tcsetattr(self.fd, libc::TCSANOW, &self.saved);
        }
    }
}

/// Get the current terminal size.
///
/// Returns (rows, cols) to match PtySize convention.
/// Note: crossterm::terminal::size() returns (cols, rows), so we swap them.
pub fn terminal_size() -> anyhow::Result<(u16, u16)> {
    let (cols, rows) = size()?;
    Ok((rows, cols))
}

/// Size for remote ptys: the operator terminal minus the width taken by
/// the `name : ` prefix, never narrower than a few columns.
pub fn session_size(prefix_width: usize) -> (u16, u16) {
    let (rows, cols) = terminal_size()
        .ok()
        .filter(|(rows, cols)| *rows > 0 && *cols > 0)
        .unwrap_or(FALLBACK_SIZE);
    let prefix = u16::try_from(prefix_width).unwrap_or(u16::MAX);
    (rows, cols.saturating_sub(prefix).max(10))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_size_leaves_room_for_prefix() {
        let (rows, cols) = session_size(12);
        assert!(rows > 0);
        let (_, full_cols) = terminal_size()
            .ok()
            .filter(|(r, c)| *r > 0 && *c > 0)
            .unwrap_or(FALLBACK_SIZE);
        assert_eq!(cols, full_cols.saturating_sub(12).max(10));
    }

    #[test]
    fn huge_prefix_keeps_minimum_width() {
        let (_, cols) = session_size(10_000);
        assert_eq!(cols, 10);
    }

    #[test]
    fn echo_guard_skips_non_terminals() {
        let file = tempfile::tempfile().unwrap();
        assert!(EchoGuard::new(&file).unwrap().is_none());
    }
}

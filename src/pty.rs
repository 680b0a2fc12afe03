//! PTY plumbing for remote sessions.
//!
//! Every session runs its remote-login command under `/bin/sh -c` on the
//! slave side of a fresh pty. The master descriptor is switched to
//! non-blocking mode and registered with the tokio reactor, so the dispatch
//! loop can poll all sessions from one task without a reader thread per pty.

use std::collections::VecDeque;
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::task::{ready, Context, Poll};
use std::time::Duration;

use bytes::BytesMut;
use portable_pty::{native_pty_system, CommandBuilder, MasterPty, PtySize};
use thiserror::Error;
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;

/// Remote-login command used when neither the config file nor the CLI
/// override it.
pub const DEFAULT_TEMPLATE: &str = "exec ssh -oLogLevel=Quiet -t {host}";

/// Placeholder replaced by the target host in a command template.
const HOST_PLACEHOLDER: &str = "{host}";

const READ_CHUNK: usize = 4096;

#[derive(Error, Debug)]
pub enum PtyError {
    #[error("failed to open pty: {0}")]
    OpenPty(#[source] anyhow::Error),

    #[error("failed to spawn command: {0}")]
    SpawnCommand(#[source] anyhow::Error),

    #[error("pty master exposes no file descriptor")]
    NoDescriptor,

    #[error("failed to configure pty descriptor: {0}")]
    Configure(#[from] io::Error),

    #[error("failed to resize pty: {0}")]
    Resize(#[source] anyhow::Error),
}

/// How a reaped child process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildExit {
    Code(i32),
    Signal(i32),
}

/// Outcome of draining the readable side of a pty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// The descriptor has no more data for now.
    Open,
    /// EOF or EIO: every process holding the slave side is gone.
    Closed,
}

/// The command template sessions are spawned through.
#[derive(Debug, Clone)]
pub struct SpawnTemplate {
    template: String,
    user: Option<String>,
}

impl Default for SpawnTemplate {
    fn default() -> Self {
        Self::new(DEFAULT_TEMPLATE, None)
    }
}

impl SpawnTemplate {
    pub fn new(template: impl Into<String>, user: Option<String>) -> Self {
        Self {
            template: template.into(),
            user,
        }
    }

    /// Build the shell command line for `host`.
    ///
    /// `{host}` is replaced by the target (prefixed with `user@` when a user
    /// is configured). A template without the placeholder gets the target
    /// appended after a space.
    pub fn render(&self, host: &str) -> String {
        let target = match &self.user {
            Some(user) => format!("{user}@{host}"),
            None => host.to_string(),
        };
        if self.template.contains(HOST_PLACEHOLDER) {
            self.template.replace(HOST_PLACEHOLDER, &target)
        } else {
            format!("{} {}", self.template, target)
        }
    }
}

/// Build a `PtySize` with no pixel dimensions.
pub fn pty_size(rows: u16, cols: u16) -> PtySize {
    PtySize {
        rows,
        cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

/// The master side of a pty plus the pid of the process spawned on it.
pub struct PtyProcess {
    master: Box<dyn MasterPty + Send>,
    fd: RawFd,
    pid: Option<u32>,
}

impl AsRawFd for PtyProcess {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl PtyProcess {
    /// Spawn `command_line` through `/bin/sh -c` on a new pty.
    ///
    /// The child inherits the environment and the current working directory
    /// of this process. The slave side is closed in the parent so that the
    /// master reports EIO once the child (and anything it started on the
    /// terminal) is gone.
    pub fn spawn(command_line: &str, size: PtySize) -> Result<Self, PtyError> {
        let pty_system = native_pty_system();
        let pair = pty_system.openpty(size).map_err(PtyError::OpenPty)?;

        let mut cmd = CommandBuilder::new("/bin/sh");
        cmd.arg("-c");
        cmd.arg(command_line);
        cmd.env(
            "TERM",
            std::env::var("TERM").unwrap_or_else(|_| "xterm-256color".to_string()),
        );
        if let Ok(cwd) = std::env::current_dir() {
            cmd.cwd(cwd);
        }

        let child = pair.slave.spawn_command(cmd).map_err(PtyError::SpawnCommand)?;
        let pid = child.process_id();
        // Reaping happens by pid in `reap`, the handle is not needed.
        drop(child);
        drop(pair.slave);

        let fd = pair.master.as_raw_fd().ok_or(PtyError::NoDescriptor)?;
        set_nonblocking(fd)?;

        Ok(Self {
            master: pair.master,
            fd,
            pid,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }
}

/// A spawned pty registered with the reactor, plus its pending input.
///
/// Writes that would block are kept in `outbox` and retried when the
/// descriptor becomes writable, so a full pty buffer never stalls other
/// sessions.
pub struct PtyChannel {
    fd: AsyncFd<PtyProcess>,
    outbox: VecDeque<u8>,
}

impl std::fmt::Debug for PtyChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtyChannel")
            .field("fd", &self.fd.get_ref().fd)
            .field("pid", &self.fd.get_ref().pid)
            .field("queued", &self.outbox.len())
            .finish()
    }
}

impl PtyChannel {
    /// Spawn `command_line` and register the master with the current tokio
    /// runtime.
    pub fn open(command_line: &str, size: PtySize) -> Result<Self, PtyError> {
        let process = PtyProcess::spawn(command_line, size)?;
        let fd = AsyncFd::with_interest(process, Interest::READABLE | Interest::WRITABLE)?;
        Ok(Self {
            fd,
            outbox: VecDeque::new(),
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.fd.get_ref().pid()
    }

    /// Ready once the master has data (or has hung up).
    ///
    /// Readiness is left set; `read_available` clears it when the descriptor
    /// runs dry.
    pub fn poll_readable(&self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let _guard = ready!(self.fd.poll_read_ready(cx))?;
        Poll::Ready(Ok(()))
    }

    /// Append whatever the master has buffered to `out`, stopping after
    /// roughly `limit` bytes so one chatty session cannot starve the rest.
    pub fn read_available(&self, out: &mut BytesMut, limit: usize) -> io::Result<ReadStatus> {
        let mut chunk = [0u8; READ_CHUNK];
        let mut total = 0;
        loop {
            let result = self
                .fd
                .try_io(Interest::READABLE, |process| read_fd(process.fd, &mut chunk));
            match result {
                Ok(0) => return Ok(ReadStatus::Closed),
                Ok(n) => {
                    out.extend_from_slice(&chunk[..n]);
                    total += n;
                    if total >= limit {
                        return Ok(ReadStatus::Open);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(ReadStatus::Open),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.raw_os_error() == Some(libc::EIO) => return Ok(ReadStatus::Closed),
                Err(e) => return Err(e),
            }
        }
    }

    /// Queue `data` for the child and write as much of it as the pty
    /// accepts right now.
    pub fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.outbox.extend(data);
        self.flush_now()
    }

    pub fn has_pending_writes(&self) -> bool {
        !self.outbox.is_empty()
    }

    /// Write queued bytes until the queue is empty or the pty is full.
    fn flush_now(&mut self) -> io::Result<()> {
        while !self.outbox.is_empty() {
            let (head, _) = self.outbox.as_slices();
            match write_fd(self.fd.get_ref().fd, head) {
                Ok(n) => {
                    self.outbox.drain(..n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Drive queued writes; ready when the queue is empty.
    pub fn poll_flush(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while !self.outbox.is_empty() {
            let mut guard = ready!(self.fd.poll_write_ready(cx))?;
            let (head, _) = self.outbox.as_slices();
            match guard.try_io(|fd| write_fd(fd.get_ref().fd, head)) {
                Ok(Ok(n)) => {
                    self.outbox.drain(..n);
                }
                Ok(Err(e)) if e.kind() == io::ErrorKind::Interrupted => continue,
                Ok(Err(e)) => return Poll::Ready(Err(e)),
                Err(_would_block) => continue,
            }
        }
        Poll::Ready(Ok(()))
    }

    pub fn resize(&self, size: PtySize) -> Result<(), PtyError> {
        self.fd
            .get_ref()
            .master
            .resize(size)
            .map_err(PtyError::Resize)
    }

    /// Send SIGHUP to the child's process group.
    ///
    /// portable-pty starts the child in its own session, so the negative pid
    /// reaches everything the remote-login tool started on the terminal.
    pub fn hangup(&self) {
        if let Some(pid) = self.pid() {
            signal_group(pid, libc::SIGHUP);
        }
    }

    /// Close the master and reap the child.
    ///
    /// A child that is still around once its pty is gone gets SIGHUP, then
    /// SIGKILL if it has not exited shortly after.
    pub fn close(self) -> Option<ChildExit> {
        let pid = self.pid();
        drop(self);
        let pid = pid?;
        if let Some(exit) = reap(pid, false) {
            return Some(exit);
        }
        signal_group(pid, libc::SIGHUP);
        for _ in 0..20 {
            std::thread::sleep(Duration::from_millis(10));
            if let Some(exit) = reap(pid, false) {
                return Some(exit);
            }
        }
        tracing::warn!(pid, "child ignored SIGHUP, sending SIGKILL");
        signal_group(pid, libc::SIGKILL);
        reap(pid, true)
    }
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags == -1 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn read_fd(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

fn write_fd(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    let n = unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

fn signal_group(pid: u32, signal: libc::c_int) {
    if pid == 0 || pid > i32::MAX as u32 {
        tracing::warn!(pid, "PID is 0 or exceeds i32::MAX, cannot send signal");
        return;
    }
    unsafe {
        libc::kill(-(pid as i32), signal);
    }
}

/// Collect the exit status of `pid`, if it has terminated.
///
/// With `block` unset this never waits. Returns `None` while the child runs
/// or when it was already reaped elsewhere.
pub fn reap(pid: u32, block: bool) -> Option<ChildExit> {
    let flags = if block { 0 } else { libc::WNOHANG };
    let mut status: libc::c_int = 0;
    loop {
        let rc = unsafe { libc::waitpid(pid as libc::pid_t, &mut status, flags) };
        if rc == -1 && io::Error::last_os_error().kind() == io::ErrorKind::Interrupted {
            continue;
        }
        if rc <= 0 {
            return None;
        }
        if libc::WIFEXITED(status) {
            return Some(ChildExit::Code(libc::WEXITSTATUS(status)));
        }
        if libc::WIFSIGNALED(status) {
            return Some(ChildExit::Signal(libc::WTERMSIG(status)));
        }
        // Stopped or continued: not a termination, keep waiting only if asked.
        if !block {
            return None;
        }
    }
}

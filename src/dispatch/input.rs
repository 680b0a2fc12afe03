//! Operator input.
//!
//! Lines are read from stdin on a dedicated thread and delivered to the
//! engine through a channel, together with forwarded signals. After each
//! line the reader waits for the engine to resume it, so a local command can
//! use the terminal without the reader competing for it, and so the next
//! line can be read with echo off after `:hide_password`.

use std::io::{BufRead, IsTerminal, Write};
use std::sync::mpsc as std_mpsc;

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;

use crate::terminal::EchoGuard;

const CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperatorEvent {
    /// A submitted line, without its terminator.
    Line(String),
    /// Ctrl-D on an interactive terminal.
    Eof,
    /// Input is exhausted for good (stdin was not a terminal).
    Closed,
    /// SIGINT.
    Interrupt,
    /// SIGWINCH.
    Resize,
}

/// How the reader should read the next line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    Normal,
    /// Local echo off.
    Secret,
}

pub struct OperatorInput {
    rx: mpsc::Receiver<OperatorEvent>,
    resume: Option<std_mpsc::Sender<ReadMode>>,
    interactive: bool,
    open: bool,
}

impl OperatorInput {
    /// An input fed by hand through the returned sender. Lines are never
    /// throttled.
    pub fn channel() -> (mpsc::Sender<OperatorEvent>, Self) {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let input = Self {
            rx,
            resume: None,
            interactive: true,
            open: true,
        };
        (tx, input)
    }

    /// Read lines from stdin (unless `read_lines` is false) and forward
    /// SIGINT and SIGWINCH. Must be called within a tokio runtime.
    pub fn stdin(read_lines: bool) -> Self {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        forward_signal(tx.clone(), SignalKind::interrupt(), OperatorEvent::Interrupt);
        forward_signal(tx.clone(), SignalKind::window_change(), OperatorEvent::Resize);

        let interactive = std::io::stdin().is_terminal();
        let mut resume = None;
        if read_lines {
            let (resume_tx, resume_rx) = std_mpsc::channel();
            let spawned = std::thread::Builder::new()
                .name("hostmux-stdin".into())
                .spawn(move || read_stdin(tx, resume_rx, interactive));
            match spawned {
                Ok(_) => resume = Some(resume_tx),
                Err(e) => tracing::error!(error = %e, "failed to start stdin reader"),
            }
        }
        Self {
            rx,
            resume,
            interactive,
            open: read_lines,
        }
    }

    pub async fn recv(&mut self) -> Option<OperatorEvent> {
        let event = self.rx.recv().await;
        if matches!(event, None | Some(OperatorEvent::Closed)) {
            self.open = false;
        }
        event
    }

    /// False once input has been exhausted.
    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn is_interactive(&self) -> bool {
        self.interactive
    }

    /// Let the reader go on to the next line.
    pub fn resume(&self, mode: ReadMode) {
        if let Some(resume) = &self.resume {
            let _ = resume.send(mode);
        }
    }
}

fn forward_signal(tx: mpsc::Sender<OperatorEvent>, kind: SignalKind, event: OperatorEvent) {
    let mut stream = match signal(kind) {
        Ok(stream) => stream,
        Err(e) => {
            tracing::warn!(error = %e, "failed to install signal handler");
            return;
        }
    };
    tokio::spawn(async move {
        while stream.recv().await.is_some() {
            if tx.send(event.clone()).await.is_err() {
                break;
            }
        }
    });
}

fn read_stdin(
    tx: mpsc::Sender<OperatorEvent>,
    resume: std_mpsc::Receiver<ReadMode>,
    interactive: bool,
) {
    let stdin = std::io::stdin();
    let mut mode = match resume.recv() {
        Ok(mode) => mode,
        Err(_) => return,
    };
    loop {
        let guard = match mode {
            ReadMode::Secret => EchoGuard::new(&stdin).unwrap_or_else(|e| {
                tracing::warn!(error = %e, "could not disable echo");
                None
            }),
            ReadMode::Normal => None,
        };
        let mut line = String::new();
        let read = stdin.lock().read_line(&mut line);
        if guard.is_some() {
            drop(guard);
            let mut stdout = std::io::stdout();
            let _ = stdout.write_all(b"\n");
            let _ = stdout.flush();
        }
        match read {
            Ok(0) if interactive => {
                if tx.blocking_send(OperatorEvent::Eof).is_err() {
                    return;
                }
                continue;
            }
            Ok(0) => {
                let _ = tx.blocking_send(OperatorEvent::Closed);
                return;
            }
            Ok(_) => {
                let trimmed = line.trim_end_matches(['\n', '\r']).to_string();
                if tx.blocking_send(OperatorEvent::Line(trimmed)).is_err() {
                    return;
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to read operator input");
                let _ = tx.blocking_send(OperatorEvent::Closed);
                return;
            }
        }
        mode = match resume.recv() {
            Ok(mode) => mode,
            Err(_) => return,
        };
    }
}

//! The session dispatch engine.
//!
//! One [`Engine`] owns every session and runs on a single task. Each loop
//! iteration waits until the operator sent something or at least one pty is
//! ready, handles that, then renders everything the sessions reported and
//! redraws the aggregate prompt. Nothing runs concurrently with anything
//! else, so session state needs no locking.

pub mod input;
pub mod render;

use std::future::poll_fn;
use std::task::{Context, Poll};
use std::time::Duration;

use thiserror::Error;

use crate::completion::{self, Completion, CompletionContext, SessionEntry, WordHistory};
use crate::control;
use crate::local::{self, LocalOutcome};
use crate::prompt::{self, PromptDetector, PromptError, TriggerAction, TriggerHit, Triggers};
use crate::pty::{pty_size, SpawnTemplate};
use crate::session::{RemoteSession, SessionEvent, SessionId, SessionSet, SessionState};
use crate::sink::Toggles;
use crate::terminal;

pub use input::{OperatorEvent, OperatorInput, ReadMode};
pub use render::{plain_prefix, Console, Status};

const CTRL_C: u8 = 0x03;
const CTRL_D: u8 = 0x04;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Prompt(#[from] PromptError),

    #[error("{name}: session ended before becoming ready ({cause})")]
    SessionFailed { name: String, cause: String },
}

/// Settings fixed for the lifetime of an engine.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub template: SpawnTemplate,
    /// Custom prompt regex; `None` installs the marker prompt.
    pub prompt_regex: Option<String>,
    pub abort_errors: bool,
    /// Run this once every session is ready, then exit.
    pub command: Option<String>,
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outcome {
    /// Process exit status: 0, or in command mode the worst session status.
    pub exit_code: i32,
}

pub struct Engine {
    pub(crate) sessions: SessionSet,
    pub(crate) detector: PromptDetector,
    pub(crate) triggers: Triggers,
    pub(crate) toggles: Toggles,
    pub(crate) console: Console,
    pub(crate) history: WordHistory,
    template: SpawnTemplate,
    abort_errors: bool,
    command: Option<String>,
    command_sent: bool,
    quit: bool,
    failure: Option<EngineError>,
    input_open: bool,
    resume_due: Option<ReadMode>,
    /// A `!` command the loop waits on before doing anything else.
    local: Option<tokio::process::Child>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("sessions", &self.sessions.len())
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl Engine {
    pub fn new(config: EngineConfig, console: Console) -> Result<Self, EngineError> {
        let prefix = prompt::marker_prefix();
        let detector = match &config.prompt_regex {
            Some(pattern) => PromptDetector::custom(pattern)?,
            None => PromptDetector::with_marker(&prefix),
        };
        Ok(Self {
            sessions: SessionSet::new(),
            detector,
            triggers: Triggers::new(prefix),
            toggles: Toggles::new(),
            console,
            history: WordHistory::new(),
            template: config.template,
            abort_errors: config.abort_errors,
            command: config.command,
            command_sent: false,
            quit: false,
            failure: None,
            input_open: true,
            resume_due: Some(ReadMode::Normal),
            local: None,
        })
    }

    // ── Session management ─────────────────────────────────────────

    /// Spawn a session for `hostname`. Must be called within a tokio
    /// runtime.
    pub fn add_host(&mut self, hostname: &str) -> SessionId {
        let command_line = self.template.render(hostname);
        let size = self.pty_size_for(hostname);
        self.sessions.add_with(hostname, |id, name, color| {
            RemoteSession::spawn(id, hostname, name, color, &command_line, size)
        })
    }

    pub fn add_hosts<S: AsRef<str>>(&mut self, hosts: &[S]) {
        for host in hosts {
            self.add_host(host.as_ref());
        }
    }

    /// Replace a dead session with a fresh one under the same name.
    pub(crate) fn respawn(&mut self, id: SessionId) -> Option<SessionId> {
        let hostname = self.sessions.get(id)?.hostname().to_string();
        let command_line = self.template.render(&hostname);
        let size = self.pty_size_for(&hostname);
        self.triggers.forget_session(id);
        self.sessions.replace_with(id, |new_id, name, color| {
            RemoteSession::spawn(new_id, &hostname, name, color, &command_line, size)
        })
    }

    fn pty_size_for(&self, hostname: &str) -> portable_pty::PtySize {
        let width = self.sessions.max_name_len().max(hostname.chars().count());
        let (rows, cols) = terminal::session_size(plain_prefix("", width).len());
        pty_size(rows, cols)
    }

    fn resize_all(&mut self) {
        let (rows, cols) =
            terminal::session_size(plain_prefix("", self.sessions.max_name_len()).len());
        for session in self.sessions.iter() {
            session.resize(pty_size(rows, cols));
        }
    }

    pub fn sessions(&self) -> &SessionSet {
        &self.sessions
    }

    pub fn toggles(&self) -> &Toggles {
        &self.toggles
    }

    pub fn toggles_mut(&mut self) -> &mut Toggles {
        &mut self.toggles
    }

    pub fn status(&self) -> Status {
        let enabled = self.sessions.enabled_count();
        match self.sessions.running_count() {
            0 => Status::Ready(enabled),
            running => Status::Waiting { running, enabled },
        }
    }

    /// True while a `!` command runs.
    pub fn local_running(&self) -> bool {
        self.local.is_some()
    }

    pub(crate) fn request_quit(&mut self) {
        self.quit = true;
    }

    /// Print a message line (never logged).
    pub(crate) fn message(&mut self, text: &str) {
        self.console.line(text);
    }

    /// Completion candidates for `line`, computed from the current state.
    pub fn complete(&self, line: &str) -> Completion {
        let context = CompletionContext {
            sessions: self
                .sessions
                .iter()
                .map(|s| SessionEntry {
                    name: s.name(),
                    enabled: s.enabled(),
                    alive: s.is_alive(),
                })
                .collect(),
            commands: control::command_table(),
            history: &self.history,
            cwd: std::env::current_dir().unwrap_or_default(),
        };
        completion::complete(line, &context)
    }

    // ── Operator lines ─────────────────────────────────────────────

    /// Handle one submitted line: a control command, a local command, or a
    /// broadcast to every enabled session.
    pub fn submit_line(&mut self, line: &str) {
        let hidden = self.toggles.is_hiding();
        self.log(&format!("> {line}"));
        if !hidden {
            self.history.add_line(line);
        }

        if let Some(command) = line.strip_prefix(':') {
            control::execute(self, command);
        } else if let Some(command) = line.strip_prefix('!') {
            match local::spawn(command) {
                Ok(child) => self.local = Some(child),
                Err(e) => self.message(&e.to_string()),
            }
        } else {
            self.broadcast(line);
        }

        if hidden {
            self.flush_events();
            self.toggles.line_submitted();
        }
    }

    /// Send `line` to every enabled, live session.
    pub fn broadcast(&mut self, line: &str) {
        let mut data = Vec::with_capacity(line.len() + 1);
        data.extend_from_slice(line.as_bytes());
        data.push(b'\n');
        for session in self.sessions.iter_mut() {
            session.dispatch_command(&data);
        }
    }

    /// Send a raw control byte to enabled sessions that are busy.
    fn send_to_running(&mut self, byte: u8) {
        for session in self.sessions.iter_mut() {
            if session.is_active() && session.state().is_busy() {
                session.send(&[byte]);
            }
        }
    }

    fn log(&mut self, line: &str) {
        if let Err(e) = self.toggles.log(line) {
            self.console.line(&e.to_string());
            self.console.line("Logging disabled");
        }
    }

    fn handle_operator(&mut self, event: OperatorEvent, input: &OperatorInput) {
        match event {
            OperatorEvent::Line(line) => {
                self.console.prompt_consumed();
                if self.command.is_none() {
                    self.submit_line(&line);
                }
                let mode = if self.toggles.is_hiding() {
                    ReadMode::Secret
                } else {
                    ReadMode::Normal
                };
                self.resume_due = Some(mode);
            }
            OperatorEvent::Eof => {
                self.console.prompt_consumed();
                if self.sessions.running_count() > 0 {
                    self.send_to_running(CTRL_D);
                } else {
                    self.quit = true;
                }
            }
            OperatorEvent::Closed => self.input_open = false,
            OperatorEvent::Interrupt => self.send_to_running(CTRL_C),
            OperatorEvent::Resize => self.resize_all(),
        }
        if !input.is_open() {
            self.input_open = false;
        }
    }

    // ── Session events ─────────────────────────────────────────────

    /// Render and act on everything the sessions reported since last time.
    pub(crate) fn flush_events(&mut self) {
        loop {
            let batch: Vec<(SessionId, Vec<SessionEvent>)> = self
                .sessions
                .iter_mut()
                .map(|s| (s.id(), s.drain_events()))
                .filter(|(_, events)| !events.is_empty())
                .collect();
            if batch.is_empty() {
                return;
            }
            for (id, events) in batch {
                for event in events {
                    self.render_event(id, event);
                }
            }
        }
    }

    fn render_event(&mut self, id: SessionId, event: SessionEvent) {
        let Some(session) = self.sessions.get(id) else {
            return;
        };
        let name = session.name().to_string();
        let color = session.color();
        let debug = self.toggles.debug();
        match event {
            SessionEvent::Output(text) => {
                let prefix = plain_prefix(&name, self.sessions.max_name_len());
                self.console.session_line(&prefix, color, &text);
                self.history.add_line(&text);
                self.log(&format!("{prefix}{text}"));
            }
            SessionEvent::Trigger(hit) => self.trigger_fired(hit),
            SessionEvent::StateChanged { from, to } => {
                if debug {
                    self.console.line(&format!("[dbg] {name}[{from}]: state => {to}"));
                }
                if to == SessionState::Dead {
                    self.session_died(id);
                }
            }
            SessionEvent::Sent { state, data } if debug => {
                for line in debug_lines(&data) {
                    self.console.line(&format!("[dbg] {name}[{state}]: <== {line}"));
                }
            }
            SessionEvent::Received { state, data } if debug => {
                for line in debug_lines(&data) {
                    self.console.line(&format!("[dbg] {name}[{state}]: ==> {line}"));
                }
            }
            SessionEvent::Sent { .. } | SessionEvent::Received { .. } => {}
        }
    }

    fn trigger_fired(&mut self, hit: TriggerHit) {
        match hit.action {
            TriggerAction::Rename(id) => {
                let name = String::from_utf8_lossy(&hit.payload).into_owned();
                let renamed = self.sessions.rename(id, Some(&name));
                tracing::debug!(session = %id, name = ?renamed, "renamed");
            }
        }
    }

    fn session_died(&mut self, id: SessionId) {
        self.triggers.forget_session(id);
        let Some(session) = self.sessions.get(id) else {
            return;
        };
        if self.abort_errors && !session.reached_idle() && self.failure.is_none() {
            let cause = session
                .cause()
                .map(ToString::to_string)
                .unwrap_or_default();
            self.failure = Some(EngineError::SessionFailed {
                name: session.name().to_string(),
                cause,
            });
        }
    }

    // ── Main loop ──────────────────────────────────────────────────

    /// Everything that happens between two waits: render, run the
    /// non-interactive command when due, resume the reader, draw the prompt.
    fn settle(&mut self, input: &OperatorInput) {
        self.flush_events();

        let running = self.sessions.running_count();
        if let Some(command) = &self.command {
            if !self.command_sent && running == 0 && self.sessions.enabled_count() > 0 {
                let command = command.clone();
                self.command_sent = true;
                self.broadcast(&command);
                self.broadcast("exit");
                self.flush_events();
            }
        }

        if self.local.is_some() {
            return;
        }
        if let Some(mode) = self.resume_due {
            if input.is_interactive() || self.sessions.running_count() == 0 {
                input.resume(mode);
                self.resume_due = None;
            }
        }

        let prompt = format!("{}> ", self.status());
        self.console.show_prompt(&prompt);
    }

    fn finished(&mut self) -> Option<Result<Outcome, EngineError>> {
        if let Some(failure) = self.failure.take() {
            return Some(Err(failure));
        }
        if self.quit {
            return Some(Ok(Outcome { exit_code: 0 }));
        }
        let any_alive = self.sessions.iter().any(RemoteSession::is_alive);
        if !any_alive {
            let exit_code = if self.command.is_some() {
                self.sessions
                    .iter()
                    .filter_map(RemoteSession::cause)
                    .map(|cause| cause.exit_status())
                    .max()
                    .unwrap_or(0)
            } else {
                0
            };
            return Some(Ok(Outcome { exit_code }));
        }
        if self.command.is_none() && !self.input_open && self.sessions.running_count() == 0 {
            return Some(Ok(Outcome { exit_code: 0 }));
        }
        None
    }

    /// Wait for the next operator event or pty readiness and handle it.
    ///
    /// While a `!` command runs, sessions are left alone and only the child
    /// and operator input are watched.
    async fn step(&mut self, input: &mut OperatorInput) {
        enum Wake {
            Operator(Option<OperatorEvent>),
            Sessions(Vec<SessionId>),
            Local(LocalOutcome),
        }

        let listen = self.input_open && input.is_open();
        let wake = if let Some(child) = self.local.as_mut() {
            tokio::select! {
                outcome = local::wait(child) => Wake::Local(outcome),
                event = input.recv(), if listen => Wake::Operator(event),
            }
        } else {
            let sessions = &mut self.sessions;
            tokio::select! {
                event = input.recv(), if listen => Wake::Operator(event),
                ready = poll_fn(|cx| poll_sessions(sessions, cx)) => Wake::Sessions(ready),
            }
        };

        match wake {
            Wake::Local(outcome) => {
                self.local = None;
                if let Some(message) = outcome.message() {
                    self.message(&message);
                }
            }
            // The local command got the terminal's SIGINT itself.
            Wake::Operator(Some(OperatorEvent::Interrupt)) if self.local.is_some() => {
                tracing::debug!("interrupt left to the local command");
            }
            Wake::Operator(Some(event)) => self.handle_operator(event, input),
            Wake::Operator(None) => self.input_open = false,
            Wake::Sessions(ready) => {
                for id in ready {
                    if let Some(session) = self.sessions.get_mut(id) {
                        session.pump(&self.detector, &mut self.triggers);
                    }
                }
            }
        }
    }

    /// Run until the operator quits, input ends with every session idle,
    /// every session is dead, or a session failure aborts the run.
    pub async fn run(&mut self, input: &mut OperatorInput) -> Result<Outcome, EngineError> {
        tracing::debug!(sessions = self.sessions.len(), "dispatch loop starting");
        let outcome = loop {
            self.settle(input);
            if let Some(outcome) = self.finished() {
                break outcome;
            }
            self.step(input).await;
        };
        self.shutdown();
        outcome
    }

    /// Like [`Self::run`], but also stops (without shutting sessions down)
    /// as soon as `done` holds or `limit` elapses. Returns whether `done`
    /// was reached.
    pub async fn run_until<F>(
        &mut self,
        input: &mut OperatorInput,
        limit: Duration,
        done: F,
    ) -> bool
    where
        F: Fn(&Engine) -> bool,
    {
        let work = async {
            loop {
                self.settle(input);
                if done(self) {
                    return true;
                }
                if self.finished().is_some() {
                    return done(self);
                }
                self.step(input).await;
            }
        };
        tokio::time::timeout(limit, work).await.unwrap_or(false)
    }

    /// Hang up every session and reap what is left.
    pub fn shutdown(&mut self) {
        for session in self.sessions.iter() {
            session.hangup();
        }
        for session in self.sessions.iter_mut() {
            session.terminate();
        }
        self.flush_events();
        self.console.prompt_consumed();
        self.console.flush();
    }
}

fn poll_sessions(sessions: &mut SessionSet, cx: &mut Context<'_>) -> Poll<Vec<SessionId>> {
    let ready: Vec<SessionId> = sessions
        .iter_mut()
        .filter_map(|s| s.poll_ready(cx).is_ready().then(|| s.id()))
        .collect();
    if ready.is_empty() {
        Poll::Pending
    } else {
        Poll::Ready(ready)
    }
}

fn debug_lines(data: &[u8]) -> Vec<String> {
    data.split(|&b| b == b'\n' || b == b'\r')
        .filter(|line| !line.is_empty())
        .map(|line| String::from_utf8_lossy(line).into_owned())
        .collect()
}

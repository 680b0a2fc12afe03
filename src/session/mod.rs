//! Remote sessions.
//!
//! A [`RemoteSession`] owns one child process on a pty, frames its output
//! into lines, and moves through [`SessionState`] as prompts appear. It never
//! prints anything itself: everything the dispatcher needs to render or act
//! on is queued as a [`SessionEvent`] and drained after each operation.

mod set;
mod state;

pub use set::{Selection, SessionSet, PALETTE};
pub use state::{SessionId, SessionState, TerminationCause};

use std::task::{Context, Poll};

use bytes::BytesMut;
use portable_pty::PtySize;

use crate::prompt::{PromptDetector, TriggerHit, Triggers};
use crate::pty::{PtyChannel, ReadStatus};

/// Upper bound on bytes pulled from one session per loop iteration.
const READ_LIMIT: usize = 64 * 1024;

/// An unterminated tail longer than this is printed as a line of its own.
const MAX_PENDING: usize = 64 * 1024;

/// Something a session did that the dispatcher has to render or act on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A completed output line, ready to be printed with the name prefix.
    Output(String),
    /// A registered marker showed up in the output.
    Trigger(TriggerHit),
    StateChanged {
        from: SessionState,
        to: SessionState,
    },
    /// Bytes written to the child, with the state at the time.
    Sent { state: SessionState, data: Vec<u8> },
    /// Bytes read from the child, before framing.
    Received { state: SessionState, data: Vec<u8> },
}

pub struct RemoteSession {
    id: SessionId,
    hostname: String,
    name: String,
    color: u8,
    state: SessionState,
    enabled: bool,
    reached_idle: bool,
    io: Option<PtyChannel>,
    pending: BytesMut,
    /// Prefix of `pending` already searched for a line terminator.
    scanned: usize,
    transcript: Vec<u8>,
    probe_sent: bool,
    last_line: String,
    cause: Option<TerminationCause>,
    events: Vec<SessionEvent>,
}

impl std::fmt::Debug for RemoteSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteSession")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state)
            .field("enabled", &self.enabled)
            .finish_non_exhaustive()
    }
}

impl RemoteSession {
    fn blank(id: SessionId, hostname: &str, name: String, color: u8) -> Self {
        Self {
            id,
            hostname: hostname.to_string(),
            name,
            color,
            state: SessionState::Connecting,
            enabled: true,
            reached_idle: false,
            io: None,
            pending: BytesMut::new(),
            scanned: 0,
            transcript: Vec::new(),
            probe_sent: false,
            last_line: String::new(),
            cause: None,
            events: Vec::new(),
        }
    }

    /// Start `command_line` on a new pty.
    ///
    /// Spawn failures do not surface as errors: the session is created dead
    /// with the failure as its cause, so `list` shows it and `reconnect` can
    /// retry it.
    pub fn spawn(
        id: SessionId,
        hostname: &str,
        name: String,
        color: u8,
        command_line: &str,
        size: PtySize,
    ) -> Self {
        let mut session = Self::blank(id, hostname, name, color);
        match PtyChannel::open(command_line, size) {
            Ok(channel) => {
                tracing::debug!(session = %session.name, pid = ?channel.pid(), "spawned");
                session.io = Some(channel);
            }
            Err(e) => {
                tracing::warn!(session = %session.name, error = %e, "spawn failed");
                session.mark_dead(TerminationCause::SpawnFailed(e.to_string()));
            }
        }
        session
    }

    /// A session with no process behind it, for exercising the framing.
    #[cfg(test)]
    pub(crate) fn detached(id: SessionId, hostname: &str, name: &str, color: u8) -> Self {
        Self::blank(id, hostname, name.to_string(), color)
    }

    // ── Accessors ──────────────────────────────────────────────────

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// The host this session was created for; rename never changes it.
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn set_name(&mut self, name: String) {
        self.name = name;
    }

    pub fn color(&self) -> u8 {
        self.color
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_alive(&self) -> bool {
        self.state != SessionState::Dead
    }

    /// Enabled and alive: counted in the aggregate prompt.
    pub fn is_active(&self) -> bool {
        self.enabled && self.is_alive()
    }

    pub fn reached_idle(&self) -> bool {
        self.reached_idle
    }

    pub fn cause(&self) -> Option<&TerminationCause> {
        self.cause.as_ref()
    }

    pub fn last_line(&self) -> &str {
        &self.last_line
    }

    pub fn pid(&self) -> Option<u32> {
        self.io.as_ref().and_then(PtyChannel::pid)
    }

    pub fn drain_events(&mut self) -> Vec<SessionEvent> {
        std::mem::take(&mut self.events)
    }

    // ── State machine ──────────────────────────────────────────────

    fn set_state(&mut self, to: SessionState) {
        if self.state == to {
            return;
        }
        let from = self.state;
        self.state = to;
        if to == SessionState::Idle {
            self.reached_idle = true;
        }
        self.events.push(SessionEvent::StateChanged { from, to });
    }

    fn mark_dead(&mut self, cause: TerminationCause) {
        self.cause = Some(cause);
        self.enabled = false;
        self.set_state(SessionState::Dead);
    }

    fn prompt_seen(&mut self) {
        match self.state {
            SessionState::Connecting | SessionState::Running if !self.enabled => {
                self.set_state(SessionState::Disabled)
            }
            SessionState::Connecting | SessionState::Running => self.set_state(SessionState::Idle),
            SessionState::Idle | SessionState::Disabled | SessionState::Dead => {}
        }
    }

    /// Clear `enabled`; a session sitting at a prompt or running a command
    /// also leaves the readiness accounting.
    pub fn disable(&mut self) {
        match self.state {
            SessionState::Dead => {}
            SessionState::Idle | SessionState::Running => {
                self.enabled = false;
                self.set_state(SessionState::Disabled);
            }
            SessionState::Connecting | SessionState::Disabled => self.enabled = false,
        }
    }

    /// Re-admit the session. Its activity is unknown after being left
    /// alone, so a fresh probe decides when it is idle again.
    pub fn enable(&mut self, detector: &PromptDetector) {
        match self.state {
            SessionState::Dead => {}
            SessionState::Disabled => {
                self.enabled = true;
                self.set_state(SessionState::Running);
                self.send(detector.probe());
            }
            SessionState::Connecting | SessionState::Idle | SessionState::Running => {
                self.enabled = true
            }
        }
    }

    /// Send the probe again and rescan what is already buffered.
    pub fn reset_prompt(&mut self, detector: &PromptDetector, triggers: &mut Triggers) {
        if !self.is_alive() {
            return;
        }
        if self.state == SessionState::Idle {
            self.set_state(SessionState::Running);
        }
        self.send(detector.probe());
        self.frame(detector, triggers);
    }

    // ── Output ─────────────────────────────────────────────────────

    /// Write raw bytes to the child. No state change.
    pub fn send(&mut self, data: &[u8]) {
        let Some(io) = self.io.as_mut() else {
            return;
        };
        if let Err(e) = io.write(data) {
            tracing::warn!(session = %self.name, error = %e, "write to pty failed");
        }
        self.events.push(SessionEvent::Sent {
            state: self.state,
            data: data.to_vec(),
        });
    }

    /// Send a command line. Only enabled, live sessions accept it; an idle
    /// one starts running. Returns whether the line was sent.
    pub fn dispatch_command(&mut self, line: &[u8]) -> bool {
        if !self.is_active() {
            return false;
        }
        if self.state == SessionState::Idle {
            self.set_state(SessionState::Running);
        }
        self.send(line);
        true
    }

    pub fn resize(&self, size: PtySize) {
        if let Some(io) = &self.io {
            if let Err(e) = io.resize(size) {
                tracing::debug!(session = %self.name, error = %e, "resize failed");
            }
        }
    }

    pub fn hangup(&self) {
        if let Some(io) = &self.io {
            io.hangup();
        }
    }

    // ── Input ──────────────────────────────────────────────────────

    /// Ready when the pty has something to read, or when queued writes
    /// made progress and more may be pending.
    pub fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        let Some(io) = self.io.as_mut() else {
            return Poll::Pending;
        };
        if io.has_pending_writes() {
            if let Poll::Ready(Err(e)) = io.poll_flush(cx) {
                tracing::debug!(session = %self.name, error = %e, "flush failed");
                return Poll::Ready(());
            }
        }
        match io.poll_readable(cx) {
            Poll::Ready(_) => Poll::Ready(()),
            Poll::Pending => Poll::Pending,
        }
    }

    /// Read whatever the pty has and process it. A closed pty makes the
    /// session dead.
    pub fn pump(&mut self, detector: &PromptDetector, triggers: &mut Triggers) {
        let Some(io) = self.io.as_ref() else {
            return;
        };
        let mut incoming = BytesMut::new();
        let closed = match io.read_available(&mut incoming, READ_LIMIT) {
            Ok(ReadStatus::Open) => false,
            Ok(ReadStatus::Closed) => true,
            Err(e) => {
                tracing::warn!(session = %self.name, error = %e, "read from pty failed");
                true
            }
        };
        if !incoming.is_empty() {
            self.feed(&incoming, detector, triggers);
        }
        if closed {
            self.terminate();
        }
    }

    /// Process bytes received from the child.
    pub fn feed(&mut self, data: &[u8], detector: &PromptDetector, triggers: &mut Triggers) {
        self.events.push(SessionEvent::Received {
            state: self.state,
            data: data.to_vec(),
        });
        self.pending.extend_from_slice(data);
        if self.state == SessionState::Connecting && !self.probe_sent {
            self.probe_sent = true;
            self.send(detector.probe());
        }
        self.frame(detector, triggers);
    }

    fn frame(&mut self, detector: &PromptDetector, triggers: &mut Triggers) {
        loop {
            let from = self.scanned.min(self.pending.len());
            let Some(offset) = self.pending[from..]
                .iter()
                .position(|&b| b == b'\n' || b == b'\r')
            else {
                break;
            };
            let end = from + offset;
            let line = self.pending.split_to(end + 1);
            self.scanned = 0;
            self.process_line(&line[..end], detector, triggers);
        }
        if self.pending.is_empty() {
            self.scanned = 0;
            return;
        }

        // New bytes, plus enough of the old tail to finish a split prompt.
        let start = self.scanned.saturating_sub(detector.window());
        if let Some(found) = detector.find(&self.pending[start..]) {
            let head = self.pending.split_to(start + found.end);
            if start + found.start > 0 {
                self.emit(&head[..start + found.start]);
            }
            self.prompt_seen();
        }

        if self.pending.len() > MAX_PENDING {
            let keep = detector.window().min(self.pending.len());
            let head = self.pending.split_to(self.pending.len() - keep);
            self.emit(&head);
        }
        self.scanned = self.pending.len();
    }

    fn process_line(&mut self, line: &[u8], detector: &PromptDetector, triggers: &mut Triggers) {
        if line.is_empty() {
            return;
        }
        if triggers.any_in(line) {
            if let Some(hit) = triggers.process(line) {
                self.events.push(SessionEvent::Trigger(hit));
                return;
            }
        }
        if let Some(found) = detector.find(line) {
            if found.start > 0 {
                self.emit(&line[..found.start]);
            }
            self.prompt_seen();
            if found.end < line.len() {
                self.emit(&line[found.end..]);
            }
            return;
        }
        if detector.is_probe_echo(line) {
            return;
        }
        self.emit(line);
    }

    fn emit(&mut self, line: &[u8]) {
        if self.state == SessionState::Connecting {
            self.transcript.extend_from_slice(line);
            self.transcript.push(b'\n');
            return;
        }
        let text = String::from_utf8_lossy(line).into_owned();
        self.last_line.clone_from(&text);
        self.events.push(SessionEvent::Output(text));
    }

    /// Hand over everything not yet printed: the connect transcript and the
    /// unterminated tail. Both are cleared.
    pub fn take_read_buffer(&mut self) -> Vec<u8> {
        let mut data = std::mem::take(&mut self.transcript);
        data.extend_from_slice(&self.pending);
        self.pending.clear();
        self.scanned = 0;
        data
    }

    /// Close the pty, reap the child and record why it ended.
    pub fn terminate(&mut self) {
        let Some(io) = self.io.take() else {
            return;
        };
        if !self.pending.is_empty() {
            let tail = self.pending.split();
            self.scanned = 0;
            self.emit(&tail);
        }
        let cause = io
            .close()
            .map(TerminationCause::from)
            .unwrap_or(TerminationCause::Unknown);
        tracing::debug!(session = %self.name, %cause, "session ended");
        self.mark_dead(cause);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prompt::TriggerAction;

    const PREFIX: &str = "hostmux-7-0badcafe:";

    fn fixture() -> (RemoteSession, PromptDetector, Triggers) {
        (
            RemoteSession::detached(SessionId(0), "web1", "web1", 36),
            PromptDetector::with_marker(PREFIX),
            Triggers::new(PREFIX),
        )
    }

    fn prompt() -> Vec<u8> {
        format!("{PREFIX}prompt/\n").into_bytes()
    }

    fn outputs(session: &mut RemoteSession) -> Vec<String> {
        session
            .drain_events()
            .into_iter()
            .filter_map(|e| match e {
                SessionEvent::Output(text) => Some(text),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn banner_is_withheld_until_first_prompt() {
        let (mut session, detector, mut triggers) = fixture();
        session.feed(b"Welcome to web1\r\n", &detector, &mut triggers);
        assert!(outputs(&mut session).is_empty());
        assert_eq!(session.state(), SessionState::Connecting);

        session.feed(&prompt(), &detector, &mut triggers);
        assert_eq!(session.state(), SessionState::Idle);
        assert!(session.reached_idle());
        assert_eq!(session.take_read_buffer(), b"Welcome to web1\n");
    }

    #[test]
    fn command_cycle_runs_and_returns_to_idle() {
        let (mut session, detector, mut triggers) = fixture();
        session.feed(&prompt(), &detector, &mut triggers);
        session.drain_events();

        assert!(session.dispatch_command(b"uname\n"));
        assert_eq!(session.state(), SessionState::Running);

        session.feed(b"Linux\n", &detector, &mut triggers);
        session.feed(&prompt(), &detector, &mut triggers);
        let events = session.drain_events();
        assert!(events.contains(&SessionEvent::Output("Linux".into())));
        assert!(events.contains(&SessionEvent::StateChanged {
            from: SessionState::Running,
            to: SessionState::Idle,
        }));
        assert_eq!(session.last_line(), "Linux");
    }

    #[test]
    fn text_before_prompt_on_same_line_is_output() {
        let (mut session, detector, mut triggers) = fixture();
        session.feed(&prompt(), &detector, &mut triggers);
        session.dispatch_command(b"printf done\n");
        session.drain_events();

        session.feed(format!("done{PREFIX}prompt/").as_bytes(), &detector, &mut triggers);
        assert_eq!(outputs(&mut session), vec!["done".to_string()]);
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[test]
    fn prompt_split_across_reads_is_detected() {
        let (mut session, detector, mut triggers) = fixture();
        let marker = prompt();
        let (a, b) = marker.split_at(7);
        session.feed(a, &detector, &mut triggers);
        assert_eq!(session.state(), SessionState::Connecting);
        session.feed(b, &detector, &mut triggers);
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[test]
    fn endless_line_is_flushed_in_bounded_pieces() {
        let (mut session, detector, mut triggers) = fixture();
        session.feed(&prompt(), &detector, &mut triggers);
        session.dispatch_command(b"base64 -w0 image.bin\n");
        session.drain_events();

        let chunk = vec![b'y'; 16 * 1024];
        let mut printed = 0;
        for _ in 0..256 {
            session.feed(&chunk, &detector, &mut triggers);
            assert!(session.pending.len() <= MAX_PENDING);
            assert_eq!(session.scanned, session.pending.len());
            printed += outputs(&mut session).iter().map(String::len).sum::<usize>();
        }
        assert_eq!(session.state(), SessionState::Running);

        let marker = prompt();
        let (a, b) = marker.split_at(10);
        session.feed(a, &detector, &mut triggers);
        session.feed(b, &detector, &mut triggers);
        printed += outputs(&mut session).iter().map(String::len).sum::<usize>();
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(printed, 256 * chunk.len());
    }

    #[test]
    fn terminator_search_resumes_after_scanned_bytes() {
        let (mut session, detector, mut triggers) = fixture();
        session.feed(&prompt(), &detector, &mut triggers);
        session.dispatch_command(b"x\n");
        session.drain_events();

        session.feed(b"par", &detector, &mut triggers);
        assert_eq!(session.scanned, 3);
        session.feed(b"tial\nnext", &detector, &mut triggers);
        assert_eq!(outputs(&mut session), vec!["partial".to_string()]);
        assert_eq!(session.scanned, 4);
        assert_eq!(session.take_read_buffer(), b"next");
        assert_eq!(session.scanned, 0);
    }

    #[test]
    fn carriage_returns_and_empty_lines_are_dropped() {
        let (mut session, detector, mut triggers) = fixture();
        session.feed(&prompt(), &detector, &mut triggers);
        session.dispatch_command(b"x\n");
        session.drain_events();
        session.feed(b"one\r\n\r\ntwo\r\n", &detector, &mut triggers);
        assert_eq!(outputs(&mut session), vec!["one".to_string(), "two".to_string()]);
    }

    #[test]
    fn unterminated_tail_waits_for_more_data() {
        let (mut session, detector, mut triggers) = fixture();
        session.feed(&prompt(), &detector, &mut triggers);
        session.dispatch_command(b"cat\n");
        session.drain_events();
        session.feed(b"Password: ", &detector, &mut triggers);
        assert!(outputs(&mut session).is_empty());
        assert_eq!(session.take_read_buffer(), b"Password: ");
        assert!(session.take_read_buffer().is_empty());
    }

    #[test]
    fn disable_and_enable_follow_readiness_rules() {
        let (mut session, detector, mut triggers) = fixture();

        session.disable();
        assert_eq!(session.state(), SessionState::Connecting);
        assert!(!session.enabled());
        session.feed(&prompt(), &detector, &mut triggers);
        assert_eq!(session.state(), SessionState::Disabled);

        session.enable(&detector);
        assert!(session.enabled());
        assert_eq!(session.state(), SessionState::Running);
        session.feed(&prompt(), &detector, &mut triggers);
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[test]
    fn disabled_session_ignores_commands() {
        let (mut session, detector, mut triggers) = fixture();
        session.feed(&prompt(), &detector, &mut triggers);
        session.disable();
        assert!(!session.dispatch_command(b"ls\n"));
        assert_eq!(session.state(), SessionState::Disabled);
    }

    #[test]
    fn registered_trigger_line_is_consumed() {
        let (mut session, detector, mut triggers) = fixture();
        session.feed(&prompt(), &detector, &mut triggers);
        session.dispatch_command(b"/bin/echo\n");
        session.drain_events();

        let (first, second) = triggers.register("rename", TriggerAction::Rename(session.id()));
        session.feed(format!("{first}{second}db1\n").as_bytes(), &detector, &mut triggers);
        let events = session.drain_events();
        assert!(events.iter().any(|e| matches!(
            e,
            SessionEvent::Trigger(hit) if hit.payload == b"db1"
        )));
        assert!(!events.iter().any(|e| matches!(e, SessionEvent::Output(_))));
    }

    #[test]
    fn probe_echo_is_not_printed() {
        let (mut session, detector, mut triggers) = fixture();
        session.feed(&prompt(), &detector, &mut triggers);
        session.dispatch_command(b"x\n");
        session.drain_events();
        session.feed(detector.probe(), &detector, &mut triggers);
        assert!(outputs(&mut session).is_empty());
    }

    #[test]
    fn reset_prompt_puts_idle_session_back_to_running() {
        let (mut session, detector, mut triggers) = fixture();
        session.feed(&prompt(), &detector, &mut triggers);
        session.reset_prompt(&detector, &mut triggers);
        assert_eq!(session.state(), SessionState::Running);
        session.feed(&prompt(), &detector, &mut triggers);
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[test]
    fn custom_prompt_pattern_drives_the_state_machine() {
        let detector = PromptDetector::custom(r"^\S+\$ $").unwrap();
        let mut triggers = Triggers::new(PREFIX);
        let mut session = RemoteSession::detached(SessionId(1), "db", "db", 35);
        session.feed(b"last login: today\nbox$ ", &detector, &mut triggers);
        assert_eq!(session.state(), SessionState::Idle);
    }
}

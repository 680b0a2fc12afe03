//! Prompt detection and marker triggers.
//!
//! Remote shells are told to print a marker as their prompt. The marker is a
//! per-process random prefix followed by a name, and is always sent split in
//! two quoted halves so that the shell's echo of the command that installs it
//! never contains the marker itself. Seeing the joined marker in the output
//! therefore means the shell really printed it.
//!
//! The same mechanism carries [`Triggers`]: one-shot markers whose line
//! payload is handed back to the dispatcher (used to evaluate rename
//! expressions on the remote side).

use std::collections::HashMap;
use std::ops::Range;

use rand::Rng;
use regex::bytes::Regex;
use thiserror::Error;

use crate::session::SessionId;

#[derive(Error, Debug)]
pub enum PromptError {
    #[error("invalid prompt pattern: {0}")]
    InvalidPattern(#[from] regex::Error),
}

/// Shell preamble making the remote terminal predictable: no echo, no
/// `\r\n` translation, no line editor tricks.
const CONFIGURE_TTY: &str = "unsetopt zle 2> /dev/null;stty -echo -onlcr -ctlecho;\
bind \"set enable-bracketed-paste off\" 2> /dev/null;";

/// Resets everything that would decorate or follow the prompt.
const RESET_PROMPT_ENV: &str = "PS2=;RPS1=;RPROMPT=;PROMPT_COMMAND=;TERM=ansi;\
unset precmd_functions;unset HISTFILE;";

/// How much already-scanned output a custom prompt pattern is rematched
/// against when more bytes arrive.
pub const CUSTOM_PROMPT_WINDOW: usize = 4096;

/// Build the random marker prefix shared by the prompt and all triggers.
pub fn marker_prefix() -> String {
    let salt: u32 = rand::thread_rng().gen();
    format!("hostmux-{}-{:08x}:", std::process::id(), salt)
}

/// Split `marker` so that neither half contains the whole prefix.
fn split_marker(marker: &str, prefix_len: usize) -> (String, String) {
    let cut = (prefix_len / 2).max(1).min(marker.len());
    (marker[..cut].to_string(), marker[cut..].to_string())
}

/// Recognises the remote prompt in session output.
///
/// A single compiled pattern; matching is a pure function of the bytes it is
/// given.
#[derive(Debug, Clone)]
pub struct PromptDetector {
    pattern: Regex,
    probe: Vec<u8>,
    window: usize,
}

impl PromptDetector {
    /// Detector for the marker prompt installed by [`Self::probe`].
    pub fn with_marker(prefix: &str) -> Self {
        let marker = format!("{prefix}prompt/");
        let (first, second) = split_marker(&marker, prefix.len());
        let probe = format!("{CONFIGURE_TTY}{RESET_PROMPT_ENV}PS1=\"{first}\"\"{second}\\n\"\n");
        // Shells that do not expand `\n` in PS1 print it literally.
        let pattern = Regex::new(&format!(r"{}(?:\\n)?", regex::escape(&marker)))
            .unwrap_or_else(|_| unreachable!("escaped literal is always a valid regex"));
        Self {
            pattern,
            probe: probe.into_bytes(),
            window: marker.len() + r"\n".len(),
        }
    }

    /// Detector for a deployment-specific prompt pattern.
    ///
    /// The shell is left untouched; the probe is a bare newline, which makes
    /// any interactive shell print its prompt again.
    pub fn custom(pattern: &str) -> Result<Self, PromptError> {
        Ok(Self {
            pattern: Regex::new(pattern)?,
            probe: b"\n".to_vec(),
            window: CUSTOM_PROMPT_WINDOW,
        })
    }

    /// Locate the prompt in `text`.
    pub fn find(&self, text: &[u8]) -> Option<Range<usize>> {
        self.pattern.find(text).map(|m| m.range())
    }

    /// Bytes of earlier output that must be searched again with new data so
    /// that a prompt split across reads is still found.
    pub fn window(&self) -> usize {
        self.window
    }

    /// What to send to a shell to make it (re)print a recognisable prompt.
    pub fn probe(&self) -> &[u8] {
        &self.probe
    }

    /// True for the terminal's echo of the probe, which is never output.
    ///
    /// The echo may follow whatever prompt the shell printed before the
    /// probe took effect, so only the tail is compared.
    pub fn is_probe_echo(&self, line: &[u8]) -> bool {
        let probe = self.probe.strip_suffix(b"\n").unwrap_or(&self.probe);
        !probe.is_empty() && line.ends_with(probe)
    }
}

/// What the dispatcher should do when a trigger fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerAction {
    /// Rename the session to the payload (original name if empty).
    Rename(SessionId),
}

/// A fired trigger and the text that followed its marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerHit {
    pub action: TriggerAction,
    pub payload: Vec<u8>,
}

/// Registry of marker strings waiting to show up in session output.
#[derive(Debug)]
pub struct Triggers {
    prefix: String,
    next: u64,
    table: HashMap<Vec<u8>, TriggerAction>,
}

impl Triggers {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            next: 0,
            table: HashMap::new(),
        }
    }

    /// Register a marker and return it split in two halves, ready to be
    /// written as `"<first>""<second>"` in a shell command.
    pub fn register(&mut self, name: &str, action: TriggerAction) -> (String, String) {
        let marker = format!("{}{}:{}/", self.prefix, name, self.next);
        self.next += 1;
        self.table.insert(marker.clone().into_bytes(), action);
        split_marker(&marker, self.prefix.len())
    }

    /// True if `data` carries anything that looks like one of our markers.
    pub fn any_in(&self, data: &[u8]) -> bool {
        find_bytes(data, self.prefix.as_bytes()).is_some()
    }

    /// Consume (unregister) a marker found in `line`.
    ///
    /// Returns `None` when the line holds no marker we know about, in which
    /// case it is ordinary output.
    pub fn process(&mut self, line: &[u8]) -> Option<TriggerHit> {
        let start = find_bytes(line, self.prefix.as_bytes())?;
        let end = start + line[start..].iter().position(|&b| b == b'/')? + 1;
        let action = self.table.remove(&line[start..end])?;
        Some(TriggerHit {
            action,
            payload: trim_ascii(&line[end..]).to_vec(),
        })
    }

    /// Forget every trigger that would act on `session`.
    pub fn forget_session(&mut self, session: SessionId) {
        self.table.retain(|_, action| match action {
            TriggerAction::Rename(id) => *id != session,
        });
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

pub(crate) fn find_bytes(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || needle.len() > haystack.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

pub(crate) fn trim_ascii(data: &[u8]) -> &[u8] {
    let start = data
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(data.len());
    let end = data
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |i| i + 1);
    &data[start..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    const PREFIX: &str = "hostmux-1-deadbeef:";

    #[test]
    fn probe_never_contains_the_joined_marker() {
        let detector = PromptDetector::with_marker(PREFIX);
        assert!(detector.find(detector.probe()).is_none());
        let probe = String::from_utf8_lossy(detector.probe()).to_string();
        assert!(probe.starts_with("unsetopt zle"));
        assert!(probe.contains("PS1=\""));
        assert!(probe.ends_with("\\n\"\n"));
    }

    #[test]
    fn marker_prompt_is_found_mid_line() {
        let detector = PromptDetector::with_marker(PREFIX);
        let line = format!("partial{PREFIX}prompt/");
        let range = detector.find(line.as_bytes()).expect("prompt should match");
        assert_eq!(range.start, "partial".len());
        assert_eq!(range.end, line.len());
    }

    #[test]
    fn literal_backslash_n_is_part_of_the_prompt() {
        let detector = PromptDetector::with_marker(PREFIX);
        let tail = format!("{PREFIX}prompt/\\n");
        assert_eq!(detector.find(tail.as_bytes()), Some(0..tail.len()));
        let plain = format!("{PREFIX}prompt/");
        assert_eq!(detector.find(plain.as_bytes()), Some(0..plain.len()));
    }

    #[test]
    fn window_covers_the_longest_marker_prompt() {
        let detector = PromptDetector::with_marker(PREFIX);
        assert_eq!(detector.window(), format!("{PREFIX}prompt/\\n").len());
        let custom = PromptDetector::custom(r"\$ $").unwrap();
        assert_eq!(custom.window(), CUSTOM_PROMPT_WINDOW);
    }

    #[test]
    fn probe_echo_is_recognised() {
        let detector = PromptDetector::with_marker(PREFIX);
        let echo = detector.probe().strip_suffix(b"\n").unwrap().to_vec();
        assert!(detector.is_probe_echo(&echo));
        let mut after_prompt = b"$ ".to_vec();
        after_prompt.extend_from_slice(&echo);
        assert!(detector.is_probe_echo(&after_prompt));
        assert!(!detector.is_probe_echo(b"ls -l"));
    }

    #[test]
    fn custom_pattern_matches_tail() {
        let detector = PromptDetector::custom(r"\$ $").unwrap();
        assert_eq!(detector.find(b"user@box:~$ "), Some(10..12));
        assert!(detector.find(b"cost is $5").is_none());
        assert_eq!(detector.probe(), b"\n");
        assert!(!detector.is_probe_echo(b""));
    }

    #[test]
    fn custom_pattern_rejects_bad_regex() {
        assert!(matches!(
            PromptDetector::custom("(unclosed"),
            Err(PromptError::InvalidPattern(_))
        ));
    }

    #[test]
    fn one_shot_trigger_fires_once() {
        let mut triggers = Triggers::new(PREFIX);
        let (first, second) = triggers.register("rename", TriggerAction::Rename(SessionId(3)));
        assert!(!first.contains(PREFIX) && !second.contains(PREFIX));

        let line = format!("{first}{second}newname\n");
        let hit = triggers.process(line.as_bytes()).expect("trigger should fire");
        assert_eq!(hit.action, TriggerAction::Rename(SessionId(3)));
        assert_eq!(hit.payload, b"newname");
        assert!(triggers.process(line.as_bytes()).is_none());
        assert!(triggers.is_empty());
    }

    #[test]
    fn unknown_marker_is_plain_output() {
        let mut triggers = Triggers::new(PREFIX);
        let line = format!("{PREFIX}rename:99/x");
        assert!(triggers.any_in(line.as_bytes()));
        assert!(triggers.process(line.as_bytes()).is_none());
    }

    #[test]
    fn forget_session_drops_its_triggers() {
        let mut triggers = Triggers::new(PREFIX);
        triggers.register("rename", TriggerAction::Rename(SessionId(1)));
        triggers.register("rename", TriggerAction::Rename(SessionId(2)));
        triggers.forget_session(SessionId(1));
        assert_eq!(triggers.len(), 1);
    }

    #[test]
    fn trim_ascii_strips_both_ends() {
        assert_eq!(trim_ascii(b"  a b \n"), b"a b");
        assert_eq!(trim_ascii(b"   "), b"");
    }
}

//! Control commands: `:`-prefixed operator lines that manage the session
//! set instead of being sent to the remote shells.
//!
//! Command names may be abbreviated to any unambiguous prefix. Errors never
//! change anything; their `Display` text is what the operator sees.

mod handlers;

use thiserror::Error;

use crate::completion::ArgKind;
use crate::dispatch::Engine;
use crate::hosts::HostsError;

#[derive(Error, Debug)]
pub enum ControlError {
    #[error("Unknown control command: {0}")]
    Unknown(String),

    #[error("Ambiguous control command: {prefix} ({candidates})")]
    Ambiguous { prefix: String, candidates: String },

    #[error("{0} not found")]
    NotFound(String),

    #[error("Expected at least a letter")]
    MissingLetter,

    #[error("Expected a single letter, got: {0}")]
    NotSingleLetter(String),

    #[error("Invalid control letter: {0}")]
    InvalidLetter(String),

    #[error("Expected 'y' or 'n', got: {0}")]
    NotYesNo(String),

    #[error(transparent)]
    Hosts(#[from] HostsError),

    #[error("{source}: '{path}'")]
    ChangeDir {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Every control command, sorted, with what its arguments complete to.
const COMMANDS: &[(&str, ArgKind)] = &[
    ("add", ArgKind::None),
    ("chdir", ArgKind::Path),
    ("disable", ArgKind::EnabledSessions),
    ("enable", ArgKind::DisabledSessions),
    ("export_vars", ArgKind::None),
    ("hide_password", ArgKind::None),
    ("list", ArgKind::Sessions),
    ("purge", ArgKind::None),
    ("quit", ArgKind::None),
    ("reconnect", ArgKind::DeadSessions),
    ("rename", ArgKind::None),
    ("reset_prompt", ArgKind::Sessions),
    ("send_ctrl", ArgKind::Sessions),
    ("set_debug", ArgKind::YesNo),
    ("set_log", ArgKind::Path),
    ("show_read_buffer", ArgKind::Sessions),
];

pub fn command_table() -> &'static [(&'static str, ArgKind)] {
    COMMANDS
}

/// What the arguments of `command` resolve against.
pub(crate) fn arg_kind(command: &str) -> ArgKind {
    COMMANDS
        .iter()
        .find(|(name, _)| *name == command)
        .map_or(ArgKind::None, |(_, kind)| *kind)
}

/// Resolve a possibly abbreviated command name.
pub fn resolve(name: &str) -> Result<&'static str, ControlError> {
    if let Some((exact, _)) = COMMANDS.iter().find(|(command, _)| *command == name) {
        return Ok(*exact);
    }
    let candidates: Vec<&'static str> = COMMANDS
        .iter()
        .map(|(command, _)| *command)
        .filter(|command| command.starts_with(name))
        .collect();
    match candidates.as_slice() {
        [] => Err(ControlError::Unknown(name.to_string())),
        [single] => Ok(*single),
        many => Err(ControlError::Ambiguous {
            prefix: name.to_string(),
            candidates: many.join(" "),
        }),
    }
}

/// A parsed control line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation<'a> {
    pub command: &'static str,
    /// Whitespace-separated arguments.
    pub args: Vec<&'a str>,
    /// Everything after the command name, trimmed.
    pub rest: &'a str,
}

/// Parse the text after `:`. `Ok(None)` for a blank line.
pub fn parse(line: &str) -> Result<Option<Invocation<'_>>, ControlError> {
    let line = line.trim_start();
    let Some(name) = line.split_whitespace().next() else {
        return Ok(None);
    };
    let command = resolve(name)?;
    let rest = line[name.len()..].trim();
    Ok(Some(Invocation {
        command,
        args: rest.split_whitespace().collect(),
        rest,
    }))
}

/// Run the control line `line` (without its `:`) against `engine`.
/// Errors are reported on the console.
pub fn execute(engine: &mut Engine, line: &str) {
    let result = parse(line).and_then(|parsed| match parsed {
        Some(invocation) => handlers::run(engine, &invocation),
        None => Ok(()),
    });
    if let Err(e) = result {
        tracing::debug!(error = %e, "control command failed");
        engine.message(&e.to_string());
    }
}

use super::{ControlError, Invocation};
use crate::completion::{expand_tilde, ArgKind};
use crate::dispatch::{plain_prefix, Engine};
use crate::hosts;
use crate::prompt::TriggerAction;
use crate::session::{SessionId, SessionState};

pub(super) fn run(engine: &mut Engine, invocation: &Invocation<'_>) -> Result<(), ControlError> {
    let args = invocation.args.as_slice();
    let kind = super::arg_kind(invocation.command);
    match invocation.command {
        "add" => add(engine, args),
        "chdir" => chdir(invocation.rest),
        "disable" => disable(engine, args, kind),
        "enable" => enable(engine, args, kind),
        "export_vars" => export_vars(engine),
        "hide_password" => hide_password(engine),
        "list" => list(engine, args, kind),
        "purge" => purge(engine),
        "quit" => {
            engine.request_quit();
            Ok(())
        }
        "reconnect" => reconnect(engine, args, kind),
        "rename" => rename(engine, invocation.rest),
        "reset_prompt" => reset_prompt(engine, args, kind),
        "send_ctrl" => send_ctrl(engine, args, kind),
        "set_debug" => set_debug(engine, args),
        "set_log" => set_log(engine, invocation.rest),
        "show_read_buffer" => show_read_buffer(engine, args, kind),
        other => Err(ControlError::Unknown(other.to_string())),
    }
}

/// Resolve patterns, reporting each one that matched nothing. Abbreviated
/// names complete among the sessions `kind` admits.
fn select(
    engine: &mut Engine,
    patterns: &[&str],
    kind: ArgKind,
) -> Result<Vec<SessionId>, ControlError> {
    let selection = engine.sessions.select(patterns, kind)?;
    for pattern in selection.unmatched {
        engine.message(&ControlError::NotFound(pattern).to_string());
    }
    Ok(selection.ids)
}

fn add(engine: &mut Engine, tokens: &[&str]) -> Result<(), ControlError> {
    let mut names = Vec::new();
    for token in tokens {
        names.extend(hosts::expand(token)?);
    }
    for host in &names {
        engine.add_host(host);
    }
    Ok(())
}

fn chdir(path: &str) -> Result<(), ControlError> {
    let target = if path.is_empty() {
        dirs::home_dir().unwrap_or_else(|| "/".into())
    } else {
        expand_tilde(path)
    };
    std::env::set_current_dir(&target).map_err(|source| ControlError::ChangeDir {
        path: target.display().to_string(),
        source,
    })
}

fn disable(engine: &mut Engine, patterns: &[&str], kind: ArgKind) -> Result<(), ControlError> {
    for id in select(engine, patterns, kind)? {
        if let Some(session) = engine.sessions.get_mut(id) {
            session.disable();
        }
    }
    Ok(())
}

fn enable(engine: &mut Engine, patterns: &[&str], kind: ArgKind) -> Result<(), ControlError> {
    for id in select(engine, patterns, kind)? {
        if let Some(session) = engine.sessions.get_mut(id) {
            session.enable(&engine.detector);
        }
    }
    Ok(())
}

fn export_vars(engine: &mut Engine) -> Result<(), ControlError> {
    let total = engine.sessions.enabled_count();
    let mut rank = 0;
    for session in engine.sessions.iter_mut().filter(|s| s.is_active()) {
        let line = format!(
            "export HOSTMUX_RANK={} HOSTMUX_NAME={} HOSTMUX_DISPLAY_NAME={} HOSTMUX_NR_SHELLS={}\n",
            shell_quote(&rank.to_string()),
            shell_quote(session.hostname()),
            shell_quote(session.name()),
            shell_quote(&total.to_string()),
        );
        session.dispatch_command(line.as_bytes());
        rank += 1;
    }
    Ok(())
}

fn hide_password(engine: &mut Engine) -> Result<(), ControlError> {
    let hidden = engine.toggles.hide_next_line();
    if hidden.debug {
        engine.message("Debugging disabled to avoid displaying passwords");
    }
    if hidden.log {
        engine.message("Logging disabled to avoid writing passwords");
    }
    Ok(())
}

fn list(engine: &mut Engine, patterns: &[&str], kind: ArgKind) -> Result<(), ControlError> {
    let ids = select(engine, patterns, kind)?;
    let rows: Vec<(String, &'static str, SessionState, String)> = ids
        .iter()
        .filter_map(|id| engine.sessions.get(*id))
        .map(|s| {
            let detail = match s.cause() {
                Some(cause) if s.state() == SessionState::Dead => cause.to_string(),
                _ => s.last_line().to_string(),
            };
            let enabled = if s.enabled() { "enabled" } else { "disabled" };
            (s.name().to_string(), enabled, s.state(), detail)
        })
        .collect();
    let width = rows.iter().map(|(name, ..)| name.chars().count()).max().unwrap_or(0);
    for (name, enabled, state, detail) in rows {
        engine.message(&format!("{name:<width$} {enabled} {state}: {detail}"));
    }
    Ok(())
}

fn purge(engine: &mut Engine) -> Result<(), ControlError> {
    let dead: Vec<SessionId> = engine
        .sessions
        .iter()
        .filter(|s| !s.is_alive())
        .map(|s| s.id())
        .collect();
    for id in &dead {
        engine.triggers.forget_session(*id);
    }
    let removed = engine.sessions.purge();
    tracing::debug!(removed, "purged dead sessions");
    Ok(())
}

fn reconnect(engine: &mut Engine, patterns: &[&str], kind: ArgKind) -> Result<(), ControlError> {
    for id in select(engine, patterns, kind)? {
        let dead = engine.sessions.get(id).is_some_and(|s| !s.is_alive());
        if dead {
            engine.respawn(id);
        }
    }
    Ok(())
}

fn rename(engine: &mut Engine, expression: &str) -> Result<(), ControlError> {
    let targets: Vec<SessionId> = engine
        .sessions
        .iter()
        .filter(|s| s.is_active())
        .map(|s| s.id())
        .collect();
    for id in targets {
        if expression.is_empty() {
            engine.sessions.rename(id, None);
            continue;
        }
        let (first, second) = engine
            .triggers
            .register("rename", TriggerAction::Rename(id));
        let command = format!("/bin/echo \"{first}\"\"{second}\"{expression}\n");
        if let Some(session) = engine.sessions.get_mut(id) {
            session.dispatch_command(command.as_bytes());
        }
    }
    Ok(())
}

fn reset_prompt(
    engine: &mut Engine,
    patterns: &[&str],
    kind: ArgKind,
) -> Result<(), ControlError> {
    for id in select(engine, patterns, kind)? {
        if let Some(session) = engine.sessions.get_mut(id) {
            session.reset_prompt(&engine.detector, &mut engine.triggers);
        }
    }
    Ok(())
}

/// Map a control-character token (`c`, `D`, `[`, `?`) to its byte.
pub(super) fn control_byte(token: &str) -> Result<u8, ControlError> {
    let mut chars = token.chars();
    let (Some(letter), None) = (chars.next(), chars.next()) else {
        return Err(ControlError::NotSingleLetter(token.to_string()));
    };
    match letter {
        'a'..='z' | 'A'..='Z' => Ok(letter.to_ascii_uppercase() as u8 & 0x1f),
        '@' | '[' | '\\' | ']' | '^' | '_' => Ok(letter as u8 & 0x1f),
        '?' => Ok(0x7f),
        _ => Err(ControlError::InvalidLetter(token.to_string())),
    }
}

fn send_ctrl(engine: &mut Engine, args: &[&str], kind: ArgKind) -> Result<(), ControlError> {
    let Some((token, patterns)) = args.split_first() else {
        return Err(ControlError::MissingLetter);
    };
    let byte = control_byte(token)?;
    for id in select(engine, patterns, kind)? {
        if let Some(session) = engine.sessions.get_mut(id) {
            if session.is_active() {
                session.send(&[byte]);
            }
        }
    }
    Ok(())
}

fn set_debug(engine: &mut Engine, args: &[&str]) -> Result<(), ControlError> {
    let Some(flag) = args.first() else {
        return Err(ControlError::MissingLetter);
    };
    match flag.to_ascii_lowercase().as_str() {
        "y" => engine.toggles.set_debug(true),
        "n" => engine.toggles.set_debug(false),
        _ => return Err(ControlError::NotYesNo(flag.to_string())),
    }
    Ok(())
}

fn set_log(engine: &mut Engine, path: &str) -> Result<(), ControlError> {
    let path = (!path.is_empty()).then(|| expand_tilde(path));
    if let Err(e) = engine.toggles.set_log(path.as_deref()) {
        engine.message(&e.to_string());
        engine.message("Logging disabled");
    }
    Ok(())
}

fn show_read_buffer(
    engine: &mut Engine,
    patterns: &[&str],
    kind: ArgKind,
) -> Result<(), ControlError> {
    let width = engine.sessions.max_name_len();
    for id in select(engine, patterns, kind)? {
        let Some(session) = engine.sessions.get_mut(id) else {
            continue;
        };
        let data = session.take_read_buffer();
        let prefix = plain_prefix(session.name(), width);
        let color = session.color();
        for line in data.split(|&b| b == b'\n' || b == b'\r') {
            if !line.is_empty() {
                engine
                    .console
                    .session_line(&prefix, color, &String::from_utf8_lossy(line));
            }
        }
    }
    Ok(())
}

/// Single-quote `value` for a POSIX shell.
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

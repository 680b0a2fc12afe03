//! Best-effort completion of the operator's input line.
//!
//! Candidates are computed from scratch on every call from whatever the
//! caller passes in: current session names, the control command table, the
//! local filesystem and words seen in session output. Nothing here touches
//! session state.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

/// Longest string every word starts with. `None` when there are no words.
pub fn longest_common_prefix<'a, I>(words: I) -> Option<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut words = words.into_iter();
    let mut prefix: &str = words.next()?;
    for word in words {
        let common = prefix
            .char_indices()
            .zip(word.chars())
            .find(|((_, a), b)| a != b)
            .map_or_else(|| prefix.len().min(word.len()), |((i, _), _)| i);
        prefix = &prefix[..common];
    }
    Some(prefix.to_string())
}

/// What kind of argument a control command takes, for completion and for
/// resolving abbreviated session names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    None,
    /// Any session name.
    Sessions,
    /// Names of sessions that are currently enabled.
    EnabledSessions,
    /// Names of live sessions that are currently disabled.
    DisabledSessions,
    /// Names of sessions whose process has ended.
    DeadSessions,
    /// `y` or `n`.
    YesNo,
    /// A local path.
    Path,
}

impl ArgKind {
    /// Whether a session in this state is a candidate for the argument.
    pub fn admits(self, enabled: bool, alive: bool) -> bool {
        match self {
            ArgKind::Sessions => true,
            ArgKind::EnabledSessions => enabled && alive,
            ArgKind::DisabledSessions => alive && !enabled,
            ArgKind::DeadSessions => !alive,
            ArgKind::None | ArgKind::YesNo | ArgKind::Path => false,
        }
    }
}

/// A session as completion sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionEntry<'a> {
    pub name: &'a str,
    pub enabled: bool,
    pub alive: bool,
}

const HISTORY_LIMIT: usize = 10_000;

/// Words seen in printed session output.
#[derive(Debug, Default)]
pub struct WordHistory {
    words: BTreeSet<String>,
}

impl WordHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_line(&mut self, line: &str) {
        for word in line.split(|c: char| c.is_whitespace() || "\"'`;|&()<>=".contains(c)) {
            if self.words.len() >= HISTORY_LIMIT {
                return;
            }
            if word.chars().count() > 1 {
                self.words.insert(word.to_string());
            }
        }
    }

    fn starting_with<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = &'a String> + 'a {
        self.words
            .range(prefix.to_string()..)
            .take_while(move |w| w.starts_with(prefix))
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }
}

/// Everything completion looks at, borrowed for one call.
pub struct CompletionContext<'a> {
    /// Every session, in display order.
    pub sessions: Vec<SessionEntry<'a>>,
    /// Control command names and their argument kinds.
    pub commands: &'a [(&'static str, ArgKind)],
    pub history: &'a WordHistory,
    /// Directory relative paths are resolved against.
    pub cwd: PathBuf,
}

/// Candidates for the word under the cursor (the end of `line`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    /// Byte offset in the line where the completed word starts.
    pub start: usize,
    /// Full replacement words, sorted and deduplicated.
    pub candidates: Vec<String>,
}

impl Completion {
    /// The longest extension shared by every candidate.
    pub fn common_prefix(&self) -> Option<String> {
        longest_common_prefix(self.candidates.iter().map(String::as_str))
    }
}

pub fn complete(line: &str, ctx: &CompletionContext<'_>) -> Completion {
    let start = line
        .rfind(char::is_whitespace)
        .map_or(0, |i| i + line[i..].chars().next().map_or(1, char::len_utf8));
    let word = &line[start..];
    let before = &line[..start];

    let mut candidates: BTreeSet<String> = BTreeSet::new();
    if let Some(rest) = line.strip_prefix(':') {
        complete_control(rest, before, word, ctx, &mut candidates);
    } else {
        let (lead, word) = match word.strip_prefix('!') {
            Some(rest) if start == 0 => ("!", rest),
            _ => ("", word),
        };
        let first_word = before.trim_start_matches('!').trim().is_empty();
        let mut found = BTreeSet::new();
        if looks_like_path(word) {
            complete_path(word, &ctx.cwd, &mut found);
        } else if first_word {
            complete_executable(word, &mut found);
            found.extend(ctx.history.starting_with(word).cloned());
        } else {
            found.extend(ctx.history.starting_with(word).cloned());
            complete_path(word, &ctx.cwd, &mut found);
        }
        candidates.extend(found.into_iter().map(|c| format!("{lead}{c}")));
    }
    Completion {
        start,
        candidates: candidates.into_iter().collect(),
    }
}

fn complete_control(
    rest: &str,
    before: &str,
    word: &str,
    ctx: &CompletionContext<'_>,
    out: &mut BTreeSet<String>,
) {
    if before.is_empty() {
        let typed = rest;
        for (name, _) in ctx.commands {
            if name.starts_with(typed) {
                out.insert(format!(":{name}"));
            }
        }
        return;
    }
    let command = rest.split_whitespace().next().unwrap_or_default();
    let kind = ctx
        .commands
        .iter()
        .find(|(name, _)| *name == command)
        .map_or(ArgKind::None, |(_, kind)| *kind);
    match kind {
        ArgKind::None => {}
        ArgKind::Sessions
        | ArgKind::EnabledSessions
        | ArgKind::DisabledSessions
        | ArgKind::DeadSessions => {
            out.extend(
                ctx.sessions
                    .iter()
                    .filter(|s| kind.admits(s.enabled, s.alive) && s.name.starts_with(word))
                    .map(|s| s.name.to_string()),
            );
        }
        ArgKind::YesNo => {
            out.extend(["y", "n"].iter().filter(|c| c.starts_with(word)).map(|c| c.to_string()));
        }
        ArgKind::Path => complete_path(word, &ctx.cwd, out),
    }
}

fn looks_like_path(word: &str) -> bool {
    word.contains('/') || word.starts_with('~') || word.starts_with('.')
}

/// Expand a leading `~` to the home directory.
pub fn expand_tilde(path: &str) -> PathBuf {
    match path.strip_prefix('~') {
        Some(rest) if rest.is_empty() || rest.starts_with('/') => match dirs::home_dir() {
            Some(home) => home.join(rest.trim_start_matches('/')),
            None => PathBuf::from(path),
        },
        _ => PathBuf::from(path),
    }
}

fn complete_path(word: &str, cwd: &Path, out: &mut BTreeSet<String>) {
    let (dir_part, file_part) = match word.rfind('/') {
        Some(i) => (&word[..=i], &word[i + 1..]),
        None => ("", word),
    };
    let dir = if dir_part.is_empty() {
        cwd.to_path_buf()
    } else {
        let expanded = expand_tilde(dir_part);
        if expanded.is_absolute() {
            expanded
        } else {
            cwd.join(expanded)
        }
    };
    let Ok(entries) = std::fs::read_dir(&dir) else {
        return;
    };
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.starts_with(file_part) || (name.starts_with('.') && !file_part.starts_with('.')) {
            continue;
        }
        let is_dir = entry.path().is_dir();
        let suffix = if is_dir { "/" } else { "" };
        out.insert(format!("{dir_part}{name}{suffix}"));
    }
}

fn complete_executable(word: &str, out: &mut BTreeSet<String>) {
    if word.is_empty() {
        return;
    }
    let Some(path) = std::env::var_os("PATH") else {
        return;
    };
    for dir in std::env::split_paths(&path) {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(word) && is_executable(&entry.path()) {
                out.insert(name);
            }
        }
    }
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

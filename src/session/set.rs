use globset::Glob;

use super::{RemoteSession, SessionId};
use crate::completion::{longest_common_prefix, ArgKind};
use crate::hosts::{expand, HostsError};

/// ANSI colour codes handed out to sessions in creation order.
pub const PALETTE: [u8; 6] = [36, 35, 34, 33, 32, 31];

/// Sessions matched by a list of patterns.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Selection {
    /// Matched sessions, in display order, without duplicates.
    pub ids: Vec<SessionId>,
    /// Patterns that matched nothing.
    pub unmatched: Vec<String>,
}

/// The ordered set of live and dead sessions.
///
/// Display names are unique at all times; collisions get a `#n` suffix.
#[derive(Debug, Default)]
pub struct SessionSet {
    sessions: Vec<RemoteSession>,
    next_id: u64,
    colors_assigned: usize,
}

impl SessionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate an id, a unique display name and a colour for `hostname`,
    /// build the session with `make` and append it.
    pub fn add_with(
        &mut self,
        hostname: &str,
        make: impl FnOnce(SessionId, String, u8) -> RemoteSession,
    ) -> SessionId {
        let id = self.allocate_id();
        let name = self.unique_name(hostname, None);
        let color = PALETTE[self.colors_assigned % PALETTE.len()];
        self.colors_assigned += 1;
        self.sessions.push(make(id, name, color));
        id
    }

    /// Swap the session `old` for a fresh one in the same slot, keeping its
    /// display name and colour.
    pub fn replace_with(
        &mut self,
        old: SessionId,
        make: impl FnOnce(SessionId, String, u8) -> RemoteSession,
    ) -> Option<SessionId> {
        let index = self.index_of(old)?;
        let id = self.allocate_id();
        let name = self.sessions[index].name().to_string();
        let color = self.sessions[index].color();
        self.sessions[index] = make(id, name, color);
        Some(id)
    }

    fn allocate_id(&mut self) -> SessionId {
        let id = SessionId(self.next_id);
        self.next_id += 1;
        id
    }

    fn index_of(&self, id: SessionId) -> Option<usize> {
        self.sessions.iter().position(|s| s.id() == id)
    }

    /// `base`, or `base#n` with the smallest free `n`. The session `except`
    /// does not count as a collision (it is the one being renamed).
    fn unique_name(&self, base: &str, except: Option<SessionId>) -> String {
        let taken = |candidate: &str| {
            self.sessions
                .iter()
                .any(|s| Some(s.id()) != except && s.name() == candidate)
        };
        if !taken(base) {
            return base.to_string();
        }
        (1..)
            .map(|n| format!("{base}#{n}"))
            .find(|candidate| !taken(candidate))
            .unwrap_or_else(|| base.to_string())
    }

    /// Rename a session; `None` restores its host name. Returns the name
    /// actually assigned.
    pub fn rename(&mut self, id: SessionId, name: Option<&str>) -> Option<String> {
        let index = self.index_of(id)?;
        let base = match name {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => self.sessions[index].hostname().to_string(),
        };
        let unique = self.unique_name(&base, Some(id));
        self.sessions[index].set_name(unique.clone());
        Some(unique)
    }

    pub fn get(&self, id: SessionId) -> Option<&RemoteSession> {
        self.sessions.iter().find(|s| s.id() == id)
    }

    pub fn get_mut(&mut self, id: SessionId) -> Option<&mut RemoteSession> {
        self.sessions.iter_mut().find(|s| s.id() == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &RemoteSession> {
        self.sessions.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut RemoteSession> {
        self.sessions.iter_mut()
    }

    pub fn ids(&self) -> Vec<SessionId> {
        self.sessions.iter().map(RemoteSession::id).collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.sessions.iter().map(|s| s.name().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Sessions that are enabled and alive.
    pub fn enabled_count(&self) -> usize {
        self.sessions.iter().filter(|s| s.is_active()).count()
    }

    /// Enabled, alive sessions still connecting or running a command.
    pub fn running_count(&self) -> usize {
        self.sessions
            .iter()
            .filter(|s| s.is_active() && s.state().is_busy())
            .count()
    }

    /// Width of the name column.
    pub fn max_name_len(&self) -> usize {
        self.sessions
            .iter()
            .map(|s| s.name().chars().count())
            .max()
            .unwrap_or(0)
    }

    /// Remove every dead session. Returns how many went away.
    pub fn purge(&mut self) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(RemoteSession::is_alive);
        before - self.sessions.len()
    }

    /// Resolve session patterns.
    ///
    /// Range groups (`web<1-3>`) are expanded first. Patterns with glob
    /// metacharacters are matched with shell glob rules. A plain word
    /// selects the session with that exact name, or else the name it
    /// completes to unambiguously among the sessions `kind` admits. No
    /// patterns selects everything.
    pub fn select<S: AsRef<str>>(
        &self,
        patterns: &[S],
        kind: ArgKind,
    ) -> Result<Selection, HostsError> {
        if patterns.is_empty() {
            return Ok(Selection {
                ids: self.ids(),
                unmatched: Vec::new(),
            });
        }
        let mut selection = Selection::default();
        for pattern in patterns {
            let pattern = pattern.as_ref();
            let matched: Vec<SessionId> = expand(pattern)?
                .iter()
                .flat_map(|p| self.match_pattern(p, kind))
                .collect();
            if matched.is_empty() {
                selection.unmatched.push(pattern.to_string());
            }
            for id in matched {
                if !selection.ids.contains(&id) {
                    selection.ids.push(id);
                }
            }
        }
        let order = self.ids();
        selection
            .ids
            .sort_by_key(|id| order.iter().position(|o| o == id));
        Ok(selection)
    }

    fn match_pattern(&self, pattern: &str, kind: ArgKind) -> Vec<SessionId> {
        if has_glob_meta(pattern) {
            if let Ok(glob) = Glob::new(pattern) {
                let matcher = glob.compile_matcher();
                return self
                    .sessions
                    .iter()
                    .filter(|s| matcher.is_match(s.name()))
                    .map(RemoteSession::id)
                    .collect();
            }
        }
        if let Some(exact) = self.sessions.iter().find(|s| s.name() == pattern) {
            return vec![exact.id()];
        }
        let completed = longest_common_prefix(
            self.sessions
                .iter()
                .filter(|s| kind.admits(s.enabled(), s.is_alive()))
                .map(RemoteSession::name)
                .filter(|n| n.starts_with(pattern)),
        );
        match completed {
            Some(name) => self
                .sessions
                .iter()
                .filter(|s| s.name() == name)
                .map(RemoteSession::id)
                .collect(),
            None => Vec::new(),
        }
    }
}

fn has_glob_meta(pattern: &str) -> bool {
    pattern.contains(['*', '?', '[', '{'])
}

//! Host list handling: numeric range expansion and hosts files.
//!
//! `web<1-3>` expands to `web1 web2 web3`; `db<08-10,15>` to
//! `db08 db09 db10 db15`. The same syntax is accepted in session patterns.

use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum HostsError {
    #[error("failed to read hosts file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Range too large: {0}")]
    RangeTooLarge(String),
}

/// Upper bound on the names a single token may expand to.
pub const MAX_EXPANSION: usize = 10_000;

/// The token would expand to more than [`MAX_EXPANSION`] names.
#[derive(Debug)]
struct TooLarge;

/// Expand every `<...>` range group in `token`.
///
/// A group that is not a list of numbers or `a-b` ranges is kept verbatim.
pub fn expand(token: &str) -> Result<Vec<String>, HostsError> {
    expand_bounded(token).map_err(|TooLarge| HostsError::RangeTooLarge(token.to_string()))
}

fn expand_bounded(token: &str) -> Result<Vec<String>, TooLarge> {
    let Some(open) = token.find('<') else {
        return Ok(vec![token.to_string()]);
    };
    let Some(close) = token[open..].find('>').map(|i| open + i) else {
        return Ok(vec![token.to_string()]);
    };
    let head = &token[..open];
    let tail = &token[close + 1..];
    let Some(values) = parse_group(&token[open + 1..close])? else {
        // Not a range; keep the group and expand what follows it.
        let literal = &token[..=close];
        return Ok(expand_bounded(tail)?
            .into_iter()
            .map(|rest| format!("{literal}{rest}"))
            .collect());
    };
    let rests = expand_bounded(tail)?;
    if values.len().saturating_mul(rests.len()) > MAX_EXPANSION {
        return Err(TooLarge);
    }
    let mut out = Vec::with_capacity(values.len() * rests.len());
    for value in &values {
        for rest in &rests {
            out.push(format!("{head}{value}{rest}"));
        }
    }
    Ok(out)
}

fn parse_group(group: &str) -> Result<Option<Vec<String>>, TooLarge> {
    let mut values = Vec::new();
    for item in group.split(',') {
        let (start, end) = match item.split_once('-') {
            Some((a, b)) => (a, b),
            None => (item, item),
        };
        let numeric = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
        if !numeric(start) || !numeric(end) {
            return Ok(None);
        }
        let (Ok(first), Ok(last)) = (start.parse::<u64>(), end.parse::<u64>()) else {
            return Err(TooLarge);
        };
        let width = if start.len() > 1 && start.starts_with('0') {
            start.len()
        } else {
            0
        };
        let (low, high) = if first <= last { (first, last) } else { (last, first) };
        let count = (high - low).saturating_add(1);
        if count.saturating_add(values.len() as u64) > MAX_EXPANSION as u64 {
            return Err(TooLarge);
        }
        values.extend((low..=high).map(|n| format!("{n:0width$}")));
    }
    Ok(Some(values))
}

/// Hosts listed in a file, one per line. Blank lines and `#` comments are
/// skipped; range syntax is expanded.
pub fn read_hosts_file(path: &Path) -> Result<Vec<String>, HostsError> {
    let content = std::fs::read_to_string(path).map_err(|source| HostsError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let mut hosts = Vec::new();
    for line in content.lines() {
        let line = line.split('#').next().unwrap_or_default();
        for token in line.split_whitespace() {
            hosts.extend(expand(token)?);
        }
    }
    Ok(hosts)
}

/// Positional hosts followed by the hosts file, all expanded.
pub fn collect(positional: &[String], file: Option<&Path>) -> Result<Vec<String>, HostsError> {
    let mut hosts = Vec::new();
    for token in positional {
        hosts.extend(expand(token)?);
    }
    if let Some(path) = file {
        hosts.extend(read_hosts_file(path)?);
    }
    Ok(hosts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_host_is_unchanged() {
        assert_eq!(expand("db1.example.com").unwrap(), vec!["db1.example.com"]);
    }

    #[test]
    fn zero_padded_range() {
        assert_eq!(expand("web<01-03>").unwrap(), vec!["web01", "web02", "web03"]);
    }

    #[test]
    fn list_and_multiple_groups() {
        assert_eq!(
            expand("r<1,3>n<8-9>").unwrap(),
            vec!["r1n8", "r1n9", "r3n8", "r3n9"]
        );
    }

    #[test]
    fn reversed_range_is_normalised() {
        assert_eq!(expand("h<3-1>").unwrap(), vec!["h1", "h2", "h3"]);
    }

    #[test]
    fn non_numeric_group_is_literal() {
        assert_eq!(expand("a<b>c").unwrap(), vec!["a<b>c"]);
        assert_eq!(expand("a<b><1-2>").unwrap(), vec!["a<b>1", "a<b>2"]);
        assert_eq!(expand("open<1-2").unwrap(), vec!["open<1-2"]);
    }

    #[test]
    fn huge_ranges_are_refused() {
        let err = expand("x<1-99999999999>").unwrap_err();
        assert_eq!(err.to_string(), "Range too large: x<1-99999999999>");
        assert!(expand("x<1-100>y<1-101>").is_err());
        assert!(expand("x<1-99999999999999999999999>").is_err());
        assert_eq!(expand("n<1-10000>").unwrap().len(), MAX_EXPANSION);
    }

    #[test]
    fn hosts_file_skips_comments_and_blanks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hosts");
        std::fs::write(&path, "# fleet\nweb<1-2>\n\n db1  # primary\n").unwrap();
        let hosts = collect(&["lb".to_string()], Some(&path)).unwrap();
        assert_eq!(hosts, vec!["lb", "web1", "web2", "db1"]);
    }

    #[test]
    fn missing_hosts_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = read_hosts_file(&dir.path().join("nope")).unwrap_err();
        assert!(err.to_string().starts_with("failed to read hosts file"));
    }
}

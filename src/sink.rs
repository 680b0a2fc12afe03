//! Process-wide output toggles: the transcript log, debug tracing and
//! password hiding.
//!
//! The dispatcher owns one [`Toggles`] and consults it for every line it
//! prints or receives. Nothing here is global; the state is passed around
//! by reference.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("{source}: '{}'", .path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Exception while writing log: {}\n{source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// An append-mode transcript file. Every line goes straight to the file.
#[derive(Debug)]
pub struct LogSink {
    path: PathBuf,
    file: File,
}

impl LogSink {
    pub fn open(path: &Path) -> Result<Self, SinkError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|source| SinkError::Open {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write_line(&mut self, line: &str) -> Result<(), SinkError> {
        let mut record = String::with_capacity(line.len() + 1);
        record.push_str(line);
        record.push('\n');
        self.file
            .write_all(record.as_bytes())
            .map_err(|source| SinkError::Write {
                path: self.path.clone(),
                source,
            })
    }
}

/// What `hide_password` switched off, so it can be reported and restored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Hidden {
    pub debug: bool,
    pub log: bool,
}

#[derive(Debug, Default)]
pub struct Toggles {
    debug: bool,
    log: Option<LogSink>,
    hidden: Option<Hidden>,
}

impl Toggles {
    pub fn new() -> Self {
        Self::default()
    }

    /// Debug tracing as currently in effect.
    pub fn debug(&self) -> bool {
        self.debug && self.hidden.is_none()
    }

    pub fn set_debug(&mut self, on: bool) {
        self.debug = on;
    }

    pub fn log_path(&self) -> Option<&Path> {
        self.log.as_ref().map(LogSink::path)
    }

    /// Replace the log sink. `None` disables logging. On failure logging is
    /// left disabled.
    pub fn set_log(&mut self, path: Option<&Path>) -> Result<(), SinkError> {
        self.log = None;
        if let Some(path) = path {
            self.log = Some(LogSink::open(path)?);
            tracing::debug!(path = %path.display(), "log sink opened");
        }
        Ok(())
    }

    /// Append a transcript line. A failed write disables the sink.
    pub fn log(&mut self, line: &str) -> Result<(), SinkError> {
        if self.hidden.is_some() {
            return Ok(());
        }
        let Some(sink) = self.log.as_mut() else {
            return Ok(());
        };
        if let Err(e) = sink.write_line(line) {
            tracing::warn!(error = %e, "log sink write failed");
            self.log = None;
            return Err(e);
        }
        Ok(())
    }

    /// Suspend logging and debug tracing until [`Self::line_submitted`].
    /// Returns which of them were on.
    pub fn hide_next_line(&mut self) -> Hidden {
        let hidden = Hidden {
            debug: self.debug,
            log: self.log.is_some(),
        };
        self.hidden = Some(hidden);
        hidden
    }

    pub fn is_hiding(&self) -> bool {
        self.hidden.is_some()
    }

    /// The hidden line has been handled; resume normal tracing.
    pub fn line_submitted(&mut self) {
        self.hidden = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lines_are_appended_to_the_log() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transcript.log");
        std::fs::write(&path, "earlier\n").unwrap();

        let mut toggles = Toggles::new();
        toggles.set_log(Some(&path)).unwrap();
        toggles.log("> uptime").unwrap();
        toggles.log("web1 : up 3 days").unwrap();
        toggles.set_log(None).unwrap();
        toggles.log("not logged").unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "earlier\n> uptime\nweb1 : up 3 days\n");
    }

    #[test]
    fn unopenable_path_reports_error_and_stays_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("x.log");
        let mut toggles = Toggles::new();
        let err = toggles.set_log(Some(&path)).unwrap_err();
        assert!(err.to_string().ends_with(&format!(": '{}'", path.display())));
        assert!(err.to_string().starts_with("No such file or directory"));
        assert!(toggles.log_path().is_none());
    }

    #[test]
    fn hiding_suspends_log_and_debug_for_one_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.log");
        let mut toggles = Toggles::new();
        toggles.set_debug(true);
        toggles.set_log(Some(&path)).unwrap();

        let hidden = toggles.hide_next_line();
        assert_eq!(hidden, Hidden { debug: true, log: true });
        assert!(!toggles.debug());
        toggles.log("> s3cret").unwrap();
        toggles.line_submitted();

        assert!(toggles.debug());
        toggles.log("> next").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "> next\n");
    }

    #[test]
    fn write_failure_disables_the_sink() {
        let full = Path::new("/dev/full");
        let mut toggles = Toggles::new();
        if !full.exists() || toggles.set_log(Some(full)).is_err() {
            return;
        }
        let err = toggles.log("> x").unwrap_err();
        assert!(err.to_string().starts_with("Exception while writing log: /dev/full\n"));
        assert!(toggles.log_path().is_none());
    }
}

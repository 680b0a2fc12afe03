//! Console output: prefixed session lines, messages and the aggregate
//! prompt.

use std::fmt;
use std::io::{self, IsTerminal, Write};

use crossterm::cursor::MoveToColumn;
use crossterm::queue;
use crossterm::terminal::{Clear, ClearType};

/// Aggregate state shown in the prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Every enabled session is at its prompt.
    Ready(usize),
    Waiting { running: usize, enabled: usize },
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Ready(enabled) => write!(f, "ready ({enabled})"),
            Status::Waiting { running, enabled } => write!(f, "waiting ({running}/{enabled})"),
        }
    }
}

/// `name : ` padded so that every session's text starts in the same column.
pub fn plain_prefix(name: &str, width: usize) -> String {
    format!("{name:<width$} : ")
}

pub struct Console {
    out: Box<dyn Write + Send>,
    color: bool,
    /// Whether `out` is a terminal that understands cursor control.
    decorate: bool,
    prompt: Option<String>,
}

impl Console {
    pub fn new(out: Box<dyn Write + Send>, color: bool, decorate: bool) -> Self {
        Self {
            out,
            color,
            decorate,
            prompt: None,
        }
    }

    /// Console on stdout. Colour is only used on a terminal.
    pub fn stdout(color: bool) -> Self {
        let tty = io::stdout().is_terminal();
        Self::new(Box::new(io::stdout()), color && tty, tty)
    }

    /// Print one line of session output.
    pub fn session_line(&mut self, prefix: &str, color: u8, text: &str) {
        self.clear_prompt();
        let line = if self.color {
            format!("\x1b[1;{color}m{prefix}\x1b[1;m{text}\n")
        } else {
            format!("{prefix}{text}\n")
        };
        self.write(line.as_bytes());
    }

    /// Print a message from hostmux itself.
    pub fn line(&mut self, text: &str) {
        self.clear_prompt();
        let mut line = String::with_capacity(text.len() + 1);
        line.push_str(text);
        line.push('\n');
        self.write(line.as_bytes());
    }

    /// Show `prompt` unless it is already on screen.
    pub fn show_prompt(&mut self, prompt: &str) {
        if self.prompt.as_deref() == Some(prompt) {
            return;
        }
        self.clear_prompt();
        self.write(prompt.as_bytes());
        self.flush();
        self.prompt = Some(prompt.to_string());
    }

    /// The operator finished a line; the prompt scrolled up with it.
    pub fn prompt_consumed(&mut self) {
        self.prompt = None;
    }

    fn clear_prompt(&mut self) {
        if self.prompt.take().is_none() {
            return;
        }
        if self.decorate {
            if let Err(e) = queue!(self.out, MoveToColumn(0), Clear(ClearType::CurrentLine)) {
                tracing::debug!(error = %e, "failed to clear prompt");
            }
        } else {
            self.write(b"\n");
        }
    }

    fn write(&mut self, data: &[u8]) {
        if let Err(e) = self.out.write_all(data) {
            tracing::debug!(error = %e, "console write failed");
        }
    }

    pub fn flush(&mut self) {
        let _ = self.out.flush();
    }
}

impl fmt::Debug for Console {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Console")
            .field("color", &self.color)
            .field("decorate", &self.decorate)
            .field("prompt", &self.prompt)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct Buffer(Arc<Mutex<Vec<u8>>>);

    impl Write for Buffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Buffer {
        fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.lock()).into_owned()
        }
    }

    #[test]
    fn status_renders_like_the_prompt() {
        assert_eq!(Status::Ready(3).to_string(), "ready (3)");
        assert_eq!(
            Status::Waiting { running: 1, enabled: 3 }.to_string(),
            "waiting (1/3)"
        );
    }

    #[test]
    fn prefix_is_padded_to_width() {
        assert_eq!(plain_prefix("2h", 4), "2h   : ");
        assert_eq!(plain_prefix("localhost", 9), "localhost : ");
    }

    #[test]
    fn colored_line_wraps_prefix() {
        let buffer = Buffer::default();
        let mut console = Console::new(Box::new(buffer.clone()), true, false);
        console.session_line("localhost : ", 36, "test");
        assert_eq!(buffer.text(), "\x1b[1;36mlocalhost : \x1b[1;mtest\n");
    }

    #[test]
    fn prompt_is_not_repeated_and_is_cleared_before_output() {
        let buffer = Buffer::default();
        let mut console = Console::new(Box::new(buffer.clone()), false, false);
        console.show_prompt("ready (1)> ");
        console.show_prompt("ready (1)> ");
        console.line("Logging disabled");
        console.show_prompt("ready (1)> ");
        assert_eq!(
            buffer.text(),
            "ready (1)> \nLogging disabled\nready (1)> "
        );
    }

    #[test]
    fn decorated_console_clears_the_prompt_line() {
        let buffer = Buffer::default();
        let mut console = Console::new(Box::new(buffer.clone()), false, true);
        console.show_prompt("waiting (1/2)> ");
        console.session_line("a : ", 36, "x");
        let text = buffer.text();
        assert!(text.starts_with("waiting (1/2)> \x1b["));
        assert!(text.ends_with("a : x\n"));
    }
}

#![allow(dead_code)]

use hostmux::dispatch::{Console, Engine, EngineConfig, OperatorEvent, OperatorInput, Status};
use hostmux::pty::SpawnTemplate;
use parking_lot::Mutex;
use std::io::{self, Write};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Runs a local shell instead of logging in anywhere. The host only shows up
/// in the environment so every session still gets its own command line.
pub const LOCAL_SHELL: &str = "HOSTMUX_TEST_HOST={host} exec /bin/sh";

/// Upper bound for anything a test waits on.
pub const WAIT: Duration = Duration::from_secs(10);

/// In-memory console output shared between the engine and the test.
#[derive(Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl SharedBuffer {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.text().contains(needle)
    }

    pub fn clear(&self) {
        self.0.lock().clear();
    }
}

/// An engine over local shells, fed through a channel instead of stdin.
pub struct Harness {
    pub engine: Engine,
    pub input: OperatorInput,
    pub tx: mpsc::Sender<OperatorEvent>,
    pub out: SharedBuffer,
}

pub fn local_config() -> EngineConfig {
    EngineConfig {
        template: SpawnTemplate::new(LOCAL_SHELL, None),
        ..EngineConfig::default()
    }
}

impl Harness {
    pub fn new(hosts: &[&str]) -> Self {
        Self::with_config(hosts, local_config())
    }

    pub fn with_config(hosts: &[&str], config: EngineConfig) -> Self {
        let out = SharedBuffer::default();
        let console = Console::new(Box::new(out.clone()), false, false);
        let mut engine = Engine::new(config, console).expect("engine should build");
        engine.add_hosts(hosts);
        let (tx, input) = OperatorInput::channel();
        Self {
            engine,
            input,
            tx,
            out,
        }
    }

    /// Drive the engine until `done` holds. Returns false on timeout.
    pub async fn wait_until(&mut self, done: impl Fn(&Engine) -> bool) -> bool {
        self.engine.run_until(&mut self.input, WAIT, done).await
    }

    /// Wait until every enabled session is at its prompt and `enabled`
    /// sessions are counted.
    pub async fn wait_ready(&mut self, enabled: usize) -> bool {
        self.wait_until(move |e| e.status() == Status::Ready(enabled))
            .await
    }

    /// Wait until the console shows `needle`.
    pub async fn wait_for_output(&mut self, needle: &str) -> bool {
        let out = self.out.clone();
        let needle = needle.to_string();
        self.wait_until(move |_| out.contains(&needle)).await
    }

    /// Submit an operator line and wait until no enabled session is busy
    /// and no local command runs.
    pub async fn submit(&mut self, line: &str) {
        self.engine.submit_line(line);
        let settled = self
            .wait_until(|e| matches!(e.status(), Status::Ready(_)) && !e.local_running())
            .await;
        assert!(settled, "sessions did not settle after {line:?}:\n{}", self.out.text());
    }

    pub fn names(&self) -> Vec<String> {
        self.engine.sessions().names()
    }
}

//! hostmux - many remote shells, one prompt
//!
//! Spawns one login session per host on its own pty and multiplexes them:
//! every line typed at the aggregate prompt is broadcast to the enabled
//! sessions, their output is printed prefixed with the session name, and
//! `:`-prefixed lines control the session set.

use clap::Parser as ClapParser;
use hostmux::{
    config::{Config, ConfigError},
    dispatch::{Console, Engine, EngineConfig, EngineError, OperatorInput},
    hosts::{self, HostsError},
    pty::{SpawnTemplate, DEFAULT_TEMPLATE},
};
use std::path::PathBuf;
use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// hostmux - many remote shells, one prompt
///
/// Opens a shell on every host and sends each typed line to all of them.
/// Lines starting with `:` are control commands, lines starting with `!`
/// run locally.
#[derive(ClapParser, Debug)]
#[command(name = "hostmux", version, about, long_about = None)]
struct Cli {
    /// Hosts to connect to; `web<1-3>` expands to web1 web2 web3
    hosts: Vec<String>,

    /// Read more hosts from a file, one per line
    #[arg(long)]
    hosts_file: Option<PathBuf>,

    /// Remote-login command template; `{host}` is replaced by the target
    #[arg(long, env = "HOSTMUX_SSH")]
    ssh: Option<String>,

    /// Remote user, connected to as user@host
    #[arg(long)]
    user: Option<String>,

    /// Append every printed line and every typed line to this file
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Print everything sent to and read from each session
    #[arg(long)]
    debug: bool,

    /// Recognise the remote prompt with this regex instead of setting one
    #[arg(long)]
    prompt_regex: Option<String>,

    /// Do not colour the session names
    #[arg(long)]
    no_color: bool,

    /// Exit when a session dies before it ever became ready
    #[arg(long)]
    abort_errors: bool,

    /// Run this command on every host, then exit
    #[arg(long)]
    command: Option<String>,

    /// Configuration file (default: ~/.config/hostmux/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Error, Debug)]
enum HostmuxError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("{0}")]
    Hosts(#[from] HostsError),

    #[error("{0}")]
    Engine(#[from] EngineError),

    #[error("no hosts given")]
    NoHosts,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "hostmux=warn".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), HostmuxError> {
    let cli = Cli::parse();
    init_tracing();

    let config = Config::discover(cli.config.as_deref())?;
    let hosts = hosts::collect(&cli.hosts, cli.hosts_file.as_deref())?;
    if hosts.is_empty() {
        return Err(HostmuxError::NoHosts);
    }

    let template = cli
        .ssh
        .or(config.ssh)
        .unwrap_or_else(|| DEFAULT_TEMPLATE.to_string());
    let read_lines = cli.command.is_none();
    let engine_config = EngineConfig {
        template: SpawnTemplate::new(template, cli.user.or(config.user)),
        prompt_regex: cli.prompt_regex.or(config.prompt_regex),
        abort_errors: cli.abort_errors || config.abort_errors.unwrap_or(false),
        command: cli.command,
    };
    let color = !cli.no_color && config.color.unwrap_or(true);
    let mut engine = Engine::new(engine_config, Console::stdout(color))?;

    engine
        .toggles_mut()
        .set_debug(cli.debug || config.debug.unwrap_or(false));
    if let Some(path) = cli.log_file.or(config.log_file) {
        if let Err(e) = engine.toggles_mut().set_log(Some(&path)) {
            println!("{e}");
            println!("Logging disabled");
        }
    }

    tracing::debug!(hosts = hosts.len(), "starting sessions");
    engine.add_hosts(&hosts);
    let mut input = OperatorInput::stdin(read_lines);
    let outcome = engine.run(&mut input).await?;

    if outcome.exit_code != 0 {
        std::process::exit(outcome.exit_code);
    }
    Ok(())
}

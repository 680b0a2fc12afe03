//! hostmux: run one interactive shell per host and drive them all from a
//! single prompt.

pub mod completion;
pub mod config;
pub mod control;
pub mod dispatch;
pub mod hosts;
pub mod local;
pub mod prompt;
pub mod pty;
pub mod session;
pub mod sink;
pub mod terminal;

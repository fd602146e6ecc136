use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "profiler",
    version,
    about = "Frontend host for a call-level sampling profiler: accepts collector sessions, \
             aggregates call records, and resolves symbols."
)]
pub struct Opt {
    #[command(subcommand)]
    pub action: Option<Action>,

    /// Path to a TOML configuration file. Its absence is not an error; CLI
    /// flags always override values it sets.
    #[arg(long, global = true)]
    pub config_path: Option<PathBuf>,

    /// Print debug-level logging, independently of `RUST_LOG`.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Port the session acceptor listens on. `0` picks an OS-assigned port.
    #[arg(long, global = true)]
    pub port: Option<u16>,
}

#[derive(Debug, Subcommand, Default, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Accept collector sessions and host the call-record store and symbol
    /// resolver (default action when none is given).
    #[default]
    Run,

    /// Register this build as the platform's profiling collector.
    Register,

    /// Remove a previous `register` registration.
    Unregister,
}

impl Opt {
    pub fn action(&self) -> Action {
        self.action.unwrap_or_default()
    }
}

// Warden - daemon lifecycle supervisor
// Main entry point

use std::path::PathBuf;
use std::process;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tracing::{debug, error, info};

use warden::daemon::{DaemonSupervisor, DEFAULT_OUTPUT};

#[derive(Parser, Debug)]
#[command(name = "warden")]
#[command(about = "Start, stop, or restart a tracked background daemon", version)]
struct Args {
    /// Lifecycle action to perform
    #[arg(value_enum, ignore_case = true)]
    action: Action,

    /// Pidfile path tracking the daemon process
    #[arg(short = 'p', long = "pid")]
    pid: PathBuf,

    /// File receiving the daemon's stdout and stderr
    #[arg(short = 'o', long = "stdout", default_value = DEFAULT_OUTPUT)]
    output: PathBuf,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Action {
    Start,
    Stop,
    Restart,
}

fn main() {
    init_tracing();

    let args = Args::parse();
    if let Err(e) = run(args) {
        error!("{:#}", e);
        process::exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    let supervisor = DaemonSupervisor::new(&args.pid)
        .output(&args.output)
        .work(run_forever);

    match args.action {
        Action::Start => supervisor.start().context("start failed")?,
        Action::Stop => supervisor.stop().context("stop failed")?,
        Action::Restart => supervisor.restart().context("restart failed")?,
    }
    Ok(())
}

/// Daemon body for the standalone binary: stays alive until stopped,
/// with a heartbeat so the output file shows liveness. Library users
/// supply their own closure instead.
fn run_forever() {
    info!(pid = process::id(), "daemon running");
    loop {
        thread::sleep(Duration::from_secs(60));
        debug!("heartbeat");
    }
}

/// Route diagnostics to stderr; RUST_LOG overrides the default level.
fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();
}

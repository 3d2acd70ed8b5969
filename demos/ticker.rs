//! A ticking daemon driven from the command line.
//!
//! ```text
//! cargo run --example ticker -- --pidfile /tmp/ticker.pid start
//! cargo run --example ticker -- --pidfile /tmp/ticker.pid status
//! cargo run --example ticker -- --pidfile /tmp/ticker.pid stop
//! ```
//!
//! Ticks go to `ticker.log` and diagnostics to `ticker.err`, both next to the
//! pid file.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use daemon_launcher::{Action, Controller, DaemonSpec, Signal, SignalAction};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "ticker", about = "Start, stop or query the ticker daemon")]
struct Args {
    /// Pid file identifying the daemon.
    #[arg(long, default_value = "/tmp/ticker.pid")]
    pidfile: PathBuf,

    /// Seconds between ticks.
    #[arg(long, default_value_t = 3)]
    interval: u64,

    /// One of start, stop, status, restart.
    action: String,
}

fn open_log(path: &Path) -> anyhow::Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("opening {}", path.display()))
}

fn ticker_spec(args: &Args) -> anyhow::Result<DaemonSpec> {
    let dir = args
        .pidfile
        .parent()
        .context("pid file has no parent directory")?;
    let stop = Arc::new(AtomicBool::new(false));
    let stopping = Arc::clone(&stop);
    let interval = Duration::from_secs(args.interval.max(1));

    let spec = DaemonSpec::new("ticker", move || {
        let mut tick = 0u64;
        while !stopping.load(Ordering::SeqCst) {
            println!("tick #{tick}");
            tick += 1;
            thread::sleep(interval);
        }
        println!("ticker stopping after {tick} ticks");
        Ok(())
    })
    .termination_flag_from(stop)
    .working_directory(dir)
    .stdout(open_log(&dir.join("ticker.log"))?)
    .stderr(open_log(&dir.join("ticker.err"))?)
    .signal(
        Signal::Hup,
        SignalAction::callback(|| info!("SIGHUP received, nothing to reload")),
    )
    .setup_logging(|| {
        info!(pid = std::process::id(), "ticker daemon logging to its stderr file");
        Ok(())
    });
    Ok(spec)
}

fn run(args: &Args) -> anyhow::Result<ExitCode> {
    let action: Action = args.action.parse()?;
    let mut controller = Controller::bind(&args.pidfile, ticker_spec(args)?)?;
    let outcome = controller.act(action)?;
    println!("ticker {action}: {outcome}");
    let code = u8::try_from(outcome.exit_code()).unwrap_or(1);
    Ok(ExitCode::from(code))
}

fn main() -> ExitCode {
    // The daemon inherits this subscriber; its stderr is the error log by then.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_ansi(false)
        .init();

    let args = Args::parse();
    match run(&args) {
        Ok(code) => code,
        Err(error) => {
            eprintln!("ticker: {error:#}");
            ExitCode::FAILURE
        }
    }
}

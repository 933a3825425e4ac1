//! fswatcher - editor companion process for watching directory trees.
//!
//! Protocol runs over stdin/stdout; diagnostics go to stderr only.

use clap::Parser;
use std::process::ExitCode;
use tokio::io::BufReader;
use tracing::{error, info};
use watcher::{InotifyBackend, Output, ProcMounts, WatcherLoop};

mod logging;

#[derive(Parser)]
#[command(name = "fswatcher")]
#[command(version)]
#[command(about = "Companion process that watches directory trees and reports changes to its parent")]
#[command(after_help = "\
PROTOCOL:
  Reads commands from stdin (ROOTS <paths...> #, EXIT) and writes
  notifications to stdout (CREATE/CHANGE/DELETE/STATS, UNWATCHABLE,
  MESSAGE, RESET, GIVEUP). Intended to be spawned by an editor, not
  run by hand.

LOGGING:
  Diagnostics go to stderr. Set FSWATCHER_LOG to one of
  off, error, warn, info, debug, trace (default: warn);
  RUST_LOG directives take precedence.")]
struct Cli {}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
  let _cli = Cli::parse();
  logging::init();
  info!(version = env!("CARGO_PKG_VERSION"), "started");

  let backend = match InotifyBackend::new() {
    Ok(backend) => backend,
    Err(err) => {
      error!(error = %err, "cannot initialize the notification backend");
      let mut out = Output::new(tokio::io::stdout());
      let _ = out.giveup().await;
      return ExitCode::from(2);
    }
  };

  let mut watcher = WatcherLoop::new(backend, ProcMounts);
  let input = BufReader::new(tokio::io::stdin());
  let code = match watcher.run(input, tokio::io::stdout()).await {
    Ok(()) => ExitCode::SUCCESS,
    Err(err) => {
      error!(error = %err, "control loop failed");
      ExitCode::from(3)
    }
  };
  info!("finished");
  code
}

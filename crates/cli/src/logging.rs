//! Logging setup. stdout carries the protocol, so everything goes to stderr.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;

const LOG_ENV: &str = "FSWATCHER_LOG";

/// Parse log level from the environment string
fn parse_log_level(level: &str) -> LevelFilter {
  match level.to_lowercase().as_str() {
    "off" => LevelFilter::OFF,
    "error" => LevelFilter::ERROR,
    "warn" | "warning" => LevelFilter::WARN,
    "info" => LevelFilter::INFO,
    "debug" => LevelFilter::DEBUG,
    "trace" => LevelFilter::TRACE,
    _ => LevelFilter::WARN,
  }
}

/// Initialize stderr logging; `FSWATCHER_LOG` picks the default level and
/// `RUST_LOG` directives override it.
pub fn init() {
  let default = std::env::var(LOG_ENV)
    .map(|level| parse_log_level(&level))
    .unwrap_or(LevelFilter::WARN);

  let filter = EnvFilter::builder().with_default_directive(default.into()).from_env_lossy();

  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(std::io::stderr)
    .with_ansi(false)
    .init();
}

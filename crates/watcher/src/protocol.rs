//! Protocol Handler - the line-oriented control protocol and the loop that
//! drives everything.
//!
//! Commands arrive on the control input (`ROOTS` ... `#`, `EXIT`, or EOF);
//! notifications, unwatchable reports, advisories, `RESET` and `GIVEUP` go
//! out on the control output, one line at a time, flushed per message.
//!
//! The loop is single-threaded and cooperative: each iteration races the
//! next control line against backend readiness with a bounded wait, and runs
//! the missing-root monitor when neither side is ready in time. Registry
//! mutation only ever happens inside the loop body, in response to exactly
//! one trigger at a time.

use std::collections::BTreeSet;
use std::io;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, Lines};
use tracing::{debug, info, warn};

use crate::backend::{BackendError, LimitKind, NotificationBackend};
use crate::events::{self, ChangeKind};
use crate::mounts::MountTable;
use crate::paths::sanitize_line;
use crate::registry::{ReconcileError, RootRegistry};

/// How long to wait for input or events before checking missing roots.
const MISSING_ROOT_RETRY: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum LoopError {
  #[error("control channel failed: {0}")]
  Io(#[from] io::Error),
  #[error(transparent)]
  Backend(#[from] BackendError),
  #[error(transparent)]
  Reconcile(#[from] ReconcileError),
}

/// Writer half of the control protocol.
pub struct Output<W> {
  writer: W,
}

impl<W: AsyncWrite + Unpin> Output<W> {
  pub fn new(writer: W) -> Self {
    Self { writer }
  }

  async fn line(&mut self, line: &str) -> io::Result<()> {
    self.writer.write_all(line.as_bytes()).await?;
    self.writer.write_all(b"\n").await?;
    self.writer.flush().await
  }

  /// One change notification: the kind line, then the sanitized path line.
  pub async fn event(&mut self, kind: ChangeKind, path: &str) -> io::Result<()> {
    debug!(%kind, path, "reporting event");
    self.writer.write_all(kind.to_string().as_bytes()).await?;
    self.writer.write_all(b"\n").await?;
    self.writer.write_all(sanitize_line(path).as_bytes()).await?;
    self.writer.write_all(b"\n").await?;
    self.writer.flush().await
  }

  /// The `UNWATCHABLE` block closing a reconciliation cycle.
  pub async fn unwatchable(&mut self, paths: &[String]) -> io::Result<()> {
    self.writer.write_all(b"UNWATCHABLE\n").await?;
    for path in paths {
      info!(path, "unwatchable");
      self.writer.write_all(sanitize_line(path).as_bytes()).await?;
      self.writer.write_all(b"\n").await?;
    }
    self.writer.write_all(b"#\n").await?;
    self.writer.flush().await
  }

  /// A resource-limit advisory for the user.
  pub async fn message(&mut self, kind: LimitKind) -> io::Result<()> {
    self.writer.write_all(b"MESSAGE\n").await?;
    self.writer.write_all(kind.advisory().as_bytes()).await?;
    self.writer.write_all(b"\n").await?;
    self.writer.flush().await
  }

  pub async fn reset(&mut self) -> io::Result<()> {
    debug!("reporting reset");
    self.line("RESET").await
  }

  pub async fn giveup(&mut self) -> io::Result<()> {
    self.line("GIVEUP").await
  }
}

/// What a serviced control command means for the loop.
enum Flow {
  Continue,
  Exit,
}

/// Which source woke the loop up.
enum Wake {
  Line(Option<String>),
  Events,
  Tick,
}

/// The watcher process state: registry, backend, mount-table source.
pub struct WatcherLoop<B, M> {
  registry: RootRegistry,
  backend: B,
  mounts: M,
}

impl<B, M> WatcherLoop<B, M>
where
  B: NotificationBackend,
  M: MountTable,
{
  pub fn new(backend: B, mounts: M) -> Self {
    Self {
      registry: RootRegistry::new(),
      backend,
      mounts,
    }
  }

  /// Run the control loop until `EXIT`, end-of-input, or a fatal error.
  ///
  /// Every active watch is released before returning, on both paths.
  pub async fn run<R, W>(&mut self, input: R, output: W) -> Result<(), LoopError>
  where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
  {
    let mut lines = input.lines();
    let mut out = Output::new(output);
    let result = self.drive(&mut lines, &mut out).await;
    self.registry.release_all(&mut self.backend);
    result
  }

  async fn drive<R, W>(&mut self, lines: &mut Lines<R>, out: &mut Output<W>) -> Result<(), LoopError>
  where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
  {
    loop {
      let wake = tokio::select! {
        line = lines.next_line() => Wake::Line(line?),
        ready = self.backend.ready() => {
          ready?;
          Wake::Events
        }
        _ = tokio::time::sleep(MISSING_ROOT_RETRY) => Wake::Tick,
      };

      match wake {
        Wake::Line(None) => {
          info!("control input closed, exiting");
          return Ok(());
        }
        Wake::Line(Some(line)) => {
          let command = line.trim_end_matches('\r');
          debug!(command, "control input");
          match command {
            "EXIT" => {
              info!("exit requested");
              return Ok(());
            }
            "ROOTS" => {
              if let Flow::Exit = self.handle_roots(lines, out).await? {
                return Ok(());
              }
            }
            other => warn!(command = other, "unrecognized command"),
          }
        }
        Wake::Events => {
          for event in self.backend.drain_events()? {
            for msg in events::dispatch(event, &mut self.registry, &mut self.backend) {
              match msg {
                events::OutputMsg::Event(kind, path) => out.event(kind, &path).await?,
                events::OutputMsg::Reset => out.reset().await?,
              }
            }
          }
        }
        Wake::Tick => {
          for path in self.registry.retry_missing(&mut self.backend) {
            out.event(ChangeKind::Create, &path).await?;
            out.event(ChangeKind::Change, &path).await?;
          }
        }
      }
    }
  }

  /// Read the root list terminated by `#` and run one reconciliation.
  async fn handle_roots<R, W>(&mut self, lines: &mut Lines<R>, out: &mut Output<W>) -> Result<Flow, LoopError>
  where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
  {
    let mut requested = BTreeSet::new();
    loop {
      let Some(line) = lines.next_line().await? else {
        // Input went away mid-list; shut down cleanly.
        return Ok(Flow::Exit);
      };
      let line = line.trim_end_matches('\r');
      debug!(line, "control input");
      if line.is_empty() {
        return Ok(Flow::Exit);
      }
      if line == "#" {
        break;
      }
      let path = if line.len() > 1 {
        line.strip_suffix('/').unwrap_or(line)
      } else {
        line
      };
      requested.insert(path.to_string());
    }

    let report = self.registry.reconcile(requested, &self.mounts, &mut self.backend)?;
    for kind in &report.advisories {
      out.message(*kind).await?;
    }
    out.unwatchable(&report.unwatchable).await?;
    Ok(Flow::Continue)
  }

  /// The authoritative root set, mainly for inspection in tests.
  pub fn registry(&self) -> &RootRegistry {
    &self.registry
  }
}

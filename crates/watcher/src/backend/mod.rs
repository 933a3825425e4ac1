//! Notification Backend - the contract over the OS change-notification
//! primitive.
//!
//! The registry talks to the backend through [`NotificationBackend`] only.
//! Event delivery is pull-based: the control loop awaits [`ready`], then
//! calls [`drain_events`] to collect whatever is pending. That keeps the
//! scheduling model in the loop where it is visible, and lets tests fake the
//! backend by enqueuing synthetic events.
//!
//! [`ready`]: NotificationBackend::ready
//! [`drain_events`]: NotificationBackend::drain_events

use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[cfg(target_os = "linux")]
pub mod inotify;

/// Identifier of one installed root watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchId(pub u32);

/// Which kernel resource limit an installation ran into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitKind {
  /// Too many concurrent watch sessions (inotify instances).
  Instances,
  /// Too many individual watched paths.
  Watches,
}

impl LimitKind {
  /// Human-readable advisory for the `MESSAGE` protocol output.
  pub fn advisory(self) -> &'static str {
    match self {
      LimitKind::Instances => {
        "The inotify instance limit has been reached; raise fs.inotify.max_user_instances and restart the watcher."
      }
      LimitKind::Watches => {
        "The inotify watch limit is too low; raise fs.inotify.max_user_watches to watch directories this large."
      }
    }
  }
}

/// Result of installing a watch for one root.
#[derive(Debug)]
pub enum InstallOutcome {
  /// The watch is live.
  Watching(WatchId),
  /// The path does not currently exist; retry later.
  Missing,
  /// Nothing to do (e.g. the root is not a directory); success, no entry.
  Ignored,
  /// A resource limit was hit; the root cannot be watched right now.
  Limit(LimitKind),
  /// The root exists but cannot be watched.
  Unsupported,
  /// The backend is unusable; the whole cycle must be aborted.
  Fatal(BackendError),
}

/// What happened, as reported by the OS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendEventKind {
  /// Content created in, or moved into, a watched directory.
  Created,
  /// Content modified.
  Modified,
  /// Metadata (permissions, timestamps) changed.
  MetadataChanged,
  /// Content deleted from, or moved out of, a watched directory.
  Removed,
  /// A watched directory itself was deleted or moved.
  SelfRemoved,
  /// The filesystem containing a watch was unmounted.
  Unmounted,
}

/// One drained notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendEvent {
  pub path: PathBuf,
  pub kind: BackendEventKind,
}

impl BackendEvent {
  pub fn new(path: impl Into<PathBuf>, kind: BackendEventKind) -> Self {
    Self { path: path.into(), kind }
  }
}

#[derive(Debug, Error)]
pub enum BackendError {
  #[error("cannot initialize the notification backend: {0}")]
  Init(#[source] io::Error),
  #[error("readiness wait failed: {0}")]
  Wait(#[source] io::Error),
  #[error("cannot read change notifications: {0}")]
  Read(#[source] io::Error),
}

/// Contract over the OS change-notification primitive.
///
/// All methods are non-blocking from the control loop's perspective except
/// `ready`, which is the multiplexable readiness source and must be
/// cancel-safe (the loop races it against control input and a timeout).
#[async_trait::async_trait]
pub trait NotificationBackend {
  /// Install a watch covering `root`, excluding the given subtrees.
  ///
  /// `root` is always a de-escaped absolute path; exclusions are mount
  /// points nested somewhere below it.
  fn install(&mut self, root: &Path, excluded: &[PathBuf]) -> InstallOutcome;

  /// Release a previously installed watch. Safe to call once per id.
  fn remove(&mut self, id: WatchId);

  /// Resolve when notifications are pending.
  async fn ready(&mut self) -> Result<(), BackendError>;

  /// Collect every pending notification without blocking.
  fn drain_events(&mut self) -> Result<Vec<BackendEvent>, BackendError>;

  /// Drop all watch bookkeeping after an unmount invalidated the watch
  /// table. Surviving OS handles are released best-effort.
  fn reset(&mut self);
}

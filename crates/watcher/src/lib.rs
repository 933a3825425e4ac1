//! Watch-state engine for the fswatcher companion process.
//!
//! The editor spawns one watcher process, sends it root sets over stdin and
//! reads change notifications from stdout. This crate is everything between
//! those two streams: mount classification, the root registry and its
//! reconciliation, the notification backend contract (with the Linux inotify
//! implementation), event translation, and the control loop itself.

pub mod backend;
pub mod events;
pub mod mounts;
pub mod paths;
pub mod protocol;
pub mod registry;

pub use backend::{
  BackendError, BackendEvent, BackendEventKind, InstallOutcome, LimitKind, NotificationBackend, WatchId,
};
#[cfg(target_os = "linux")]
pub use backend::inotify::InotifyBackend;
pub use mounts::{MountEntry, MountError, MountTable, ProcMounts, StaticMounts};
pub use protocol::{LoopError, Output, WatcherLoop};
pub use registry::{ReconcileReport, RootRegistry, RootState};

//! Event Dispatcher - translates backend notifications into the protocol's
//! vocabulary and keeps the registry honest while doing so.
//!
//! The translation itself is fixed: a creation implies a change (two lines),
//! a modification is a change, a metadata change is a stats line, a removal
//! is a delete. Two kinds carry side effects: self-removal of a watched root
//! parks that root as missing, and an unmount invalidates the whole watch
//! table, clearing everything and signalling `RESET`.

use std::fmt;

use crate::backend::{BackendEvent, BackendEventKind, NotificationBackend};
use crate::registry::RootRegistry;

/// Protocol names for change notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
  Create,
  Change,
  Delete,
  Stats,
}

impl fmt::Display for ChangeKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      ChangeKind::Create => "CREATE",
      ChangeKind::Change => "CHANGE",
      ChangeKind::Delete => "DELETE",
      ChangeKind::Stats => "STATS",
    };
    f.write_str(name)
  }
}

/// One protocol message produced by dispatching a backend event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputMsg {
  Event(ChangeKind, String),
  Reset,
}

/// Translate one backend event, applying root bookkeeping as needed.
pub fn dispatch<B>(event: BackendEvent, registry: &mut RootRegistry, backend: &mut B) -> Vec<OutputMsg>
where
  B: NotificationBackend,
{
  let path = event.path.to_string_lossy().into_owned();
  match event.kind {
    BackendEventKind::Created => vec![
      OutputMsg::Event(ChangeKind::Create, path.clone()),
      OutputMsg::Event(ChangeKind::Change, path),
    ],
    BackendEventKind::Modified => vec![OutputMsg::Event(ChangeKind::Change, path)],
    BackendEventKind::MetadataChanged => vec![OutputMsg::Event(ChangeKind::Stats, path)],
    BackendEventKind::Removed => vec![OutputMsg::Event(ChangeKind::Delete, path)],
    BackendEventKind::SelfRemoved => registry
      .mark_removed(&path, backend)
      .into_iter()
      .map(|_| OutputMsg::Event(ChangeKind::Delete, path.clone()))
      .collect(),
    BackendEventKind::Unmounted => {
      registry.clear();
      backend.reset();
      vec![OutputMsg::Reset]
    }
  }
}

//! Root Registry - owns the authoritative set of watched roots.
//!
//! The registry maps each stored root path (possibly carrying the flattening
//! marker) to its state: `Active` with a live backend watch, or `Missing`
//! while the path is absent from the filesystem. Unwatchable roots are
//! reported to the caller but never stored, so after every reconciliation
//! the registry holds exactly the accepted subset of the requested set.
//!
//! All mutation happens through `reconcile`, `retry_missing`, `mark_removed`
//! and `clear`/`release_all`; there is no partially-updated state observable
//! between those calls.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{info, warn};

use crate::backend::{BackendError, InstallOutcome, LimitKind, NotificationBackend, WatchId};
use crate::mounts::{MountError, MountTable};
use crate::paths::{is_parent_path, unflatten};

/// State of one watched root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootState {
  /// Watch installed; the id is owned by the backend on our behalf.
  Active(WatchId),
  /// Path absent; the missing-root monitor retries it.
  Missing,
}

/// What one reconciliation cycle produced, to be surfaced as one unit.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReconcileReport {
  /// Every path that ended up unwatchable: refused roots and excluded
  /// mount subtrees carved out of partial watches.
  pub unwatchable: Vec<String>,
  /// Resource-limit advisories to relay to the caller.
  pub advisories: Vec<LimitKind>,
}

#[derive(Debug, Error)]
pub enum ReconcileError {
  #[error(transparent)]
  Mounts(#[from] MountError),
  #[error("notification backend failed: {0}")]
  Backend(BackendError),
}

#[derive(Debug, Default)]
pub struct RootRegistry {
  roots: BTreeMap<String, RootState>,
}

impl RootRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn len(&self) -> usize {
    self.roots.len()
  }

  pub fn is_empty(&self) -> bool {
    self.roots.is_empty()
  }

  /// Stored paths, in set order.
  pub fn paths(&self) -> impl Iterator<Item = &str> {
    self.roots.keys().map(String::as_str)
  }

  pub fn state(&self, path: &str) -> Option<RootState> {
    self.roots.get(path).copied()
  }

  /// Bring the watch set in line with `requested`.
  ///
  /// Unchanged roots are not touched, removed roots release their backend
  /// handles, and added roots are classified against the mount table before
  /// installation. A request of exactly `/` is refused outright: everything
  /// is released and `/` is reported unwatchable without consulting the
  /// mount table.
  pub fn reconcile<M, B>(
    &mut self,
    requested: BTreeSet<String>,
    mounts: &M,
    backend: &mut B,
  ) -> Result<ReconcileReport, ReconcileError>
  where
    M: MountTable,
    B: NotificationBackend,
  {
    info!(current = self.roots.len(), requested = requested.len(), "updating roots");
    let mut report = ReconcileReport::default();

    if requested.len() == 1 && requested.contains("/") {
      self.release_all(backend);
      info!("refusing to watch the filesystem root");
      report.unwatchable.push("/".to_string());
      return Ok(report);
    }

    let unwatchable_mounts = mounts.unwatchable_mounts()?;

    let to_remove: Vec<String> = self
      .roots
      .keys()
      .filter(|path| !requested.contains(*path))
      .cloned()
      .collect();
    for path in to_remove {
      if let Some(RootState::Active(id)) = self.roots.remove(&path) {
        backend.remove(id);
      }
      info!(root = %path, "unregistered root");
    }

    for path in requested {
      if self.roots.contains_key(&path) {
        continue;
      }
      self.register(path, &unwatchable_mounts, backend, &mut report)?;
    }

    Ok(report)
  }

  fn register<B>(
    &mut self,
    path: String,
    unwatchable_mounts: &[crate::mounts::MountEntry],
    backend: &mut B,
    report: &mut ReconcileReport,
  ) -> Result<(), ReconcileError>
  where
    B: NotificationBackend,
  {
    let os_path = unflatten(&path).to_string();
    info!(root = %path, "registering root");

    if !os_path.starts_with('/') {
      warn!(root = %path, "invalid root, not an absolute path");
      return Ok(());
    }

    let mut excluded = Vec::new();
    for mount in unwatchable_mounts {
      if is_parent_path(&mount.path, &os_path) {
        info!(root = %os_path, mount = %mount.path, fs_type = %mount.fs_type, "root is under an unwatchable mount");
        report.unwatchable.push(os_path);
        return Ok(());
      }
      if is_parent_path(&os_path, &mount.path) {
        info!(root = %os_path, mount = %mount.path, fs_type = %mount.fs_type, "root contains an unwatchable mount, partial watch");
        report.unwatchable.push(mount.path.clone());
        excluded.push(PathBuf::from(&mount.path));
      }
    }

    match backend.install(Path::new(&os_path), &excluded) {
      InstallOutcome::Watching(id) => {
        self.roots.insert(path, RootState::Active(id));
      }
      InstallOutcome::Missing => {
        self.roots.insert(path, RootState::Missing);
      }
      InstallOutcome::Ignored => {}
      InstallOutcome::Limit(kind) => {
        warn!(root = %os_path, ?kind, "resource limit prevents watching root");
        report.advisories.push(kind);
        report.unwatchable.push(os_path);
      }
      InstallOutcome::Unsupported => {
        warn!(root = %os_path, "root cannot be watched");
        report.unwatchable.push(os_path);
      }
      InstallOutcome::Fatal(err) => return Err(ReconcileError::Backend(err)),
    }
    Ok(())
  }

  /// Missing-root monitor tick: re-install roots whose paths have come back.
  ///
  /// Returns the de-escaped path of every recovered root so the caller can
  /// synthesize creation notifications. Failures leave the root missing for
  /// the next tick.
  pub fn retry_missing<B>(&mut self, backend: &mut B) -> Vec<String>
  where
    B: NotificationBackend,
  {
    let mut recovered = Vec::new();
    for (path, state) in self.roots.iter_mut() {
      if *state != RootState::Missing {
        continue;
      }
      let os_path = unflatten(path);
      if !Path::new(os_path).exists() {
        continue;
      }
      if let InstallOutcome::Watching(id) = backend.install(Path::new(os_path), &[]) {
        info!(root = %path, "root restored");
        *state = RootState::Active(id);
        recovered.push(os_path.to_string());
      }
    }
    recovered
  }

  /// Handle self-deletion or self-move of a watched directory.
  ///
  /// Every active root whose de-escaped path equals `os_path` releases its
  /// watch and becomes missing. Returns the affected stored paths.
  pub fn mark_removed<B>(&mut self, os_path: &str, backend: &mut B) -> Vec<String>
  where
    B: NotificationBackend,
  {
    let mut affected = Vec::new();
    for (path, state) in self.roots.iter_mut() {
      if let RootState::Active(id) = *state {
        if unflatten(path) == os_path {
          backend.remove(id);
          *state = RootState::Missing;
          info!(root = %path, "root deleted");
          affected.push(path.clone());
        }
      }
    }
    affected
  }

  /// Forget every root without touching backend handles. Used after an
  /// unmount, when the backend's watch table is already invalid.
  pub fn clear(&mut self) {
    self.roots.clear();
  }

  /// Release every active watch and forget all roots.
  pub fn release_all<B>(&mut self, backend: &mut B)
  where
    B: NotificationBackend,
  {
    for (path, state) in std::mem::take(&mut self.roots) {
      if let RootState::Active(id) = state {
        backend.remove(id);
      }
      info!(root = %path, "unregistered root");
    }
  }
}

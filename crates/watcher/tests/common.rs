//! Shared fixtures for the protocol integration tests: a cloneable fake
//! backend the test can inspect while the loop owns its other clone.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use watcher::{BackendError, BackendEvent, InstallOutcome, NotificationBackend, WatchId};

#[derive(Default)]
pub struct FakeState {
  pub next_id: u32,
  pub script: VecDeque<InstallOutcome>,
  pub installs: Vec<(PathBuf, Vec<PathBuf>)>,
  pub removed: Vec<WatchId>,
  pub queued: VecDeque<BackendEvent>,
  pub resets: usize,
}

/// Backend whose state lives behind an `Arc`, so the test keeps a handle
/// after moving a clone into the loop. Installs follow an optional script,
/// otherwise succeed with fresh ids; events are whatever the test queued.
#[derive(Clone, Default)]
pub struct FakeBackend(Arc<Mutex<FakeState>>);

impl FakeBackend {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn state(&self) -> MutexGuard<'_, FakeState> {
    self.0.lock().unwrap()
  }

  pub fn script(&self, outcome: InstallOutcome) {
    self.state().script.push_back(outcome);
  }

  pub fn push_event(&self, event: BackendEvent) {
    self.state().queued.push_back(event);
  }
}

#[async_trait::async_trait]
impl NotificationBackend for FakeBackend {
  fn install(&mut self, root: &Path, excluded: &[PathBuf]) -> InstallOutcome {
    let mut state = self.state();
    state.installs.push((root.to_path_buf(), excluded.to_vec()));
    if let Some(outcome) = state.script.pop_front() {
      return outcome;
    }
    let id = WatchId(state.next_id);
    state.next_id += 1;
    InstallOutcome::Watching(id)
  }

  fn remove(&mut self, id: WatchId) {
    self.state().removed.push(id);
  }

  async fn ready(&mut self) -> Result<(), BackendError> {
    loop {
      if !self.state().queued.is_empty() {
        return Ok(());
      }
      tokio::time::sleep(Duration::from_millis(5)).await;
    }
  }

  fn drain_events(&mut self) -> Result<Vec<BackendEvent>, BackendError> {
    Ok(self.state().queued.drain(..).collect())
  }

  fn reset(&mut self) {
    let mut state = self.state();
    state.resets += 1;
    state.queued.clear();
  }
}

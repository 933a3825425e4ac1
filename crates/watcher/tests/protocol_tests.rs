//! End-to-end protocol tests: drive a full `WatcherLoop` over in-memory
//! pipes and assert on the exact wire output.

mod common;

use std::time::Duration;

use common::FakeBackend;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use watcher::{
  BackendEvent, BackendEventKind, InstallOutcome, LimitKind, LoopError, MountEntry, StaticMounts, WatcherLoop,
};

struct Harness {
  input: DuplexStream,
  output: Lines<BufReader<DuplexStream>>,
  backend: FakeBackend,
  task: JoinHandle<Result<(), LoopError>>,
}

impl Harness {
  fn start(mounts: Vec<MountEntry>) -> Self {
    Self::with_backend(FakeBackend::new(), mounts)
  }

  fn with_backend(backend: FakeBackend, mounts: Vec<MountEntry>) -> Self {
    let (input, loop_input) = tokio::io::duplex(4096);
    let (loop_output, output) = tokio::io::duplex(4096);
    let loop_backend = backend.clone();
    let task = tokio::spawn(async move {
      let mut watcher = WatcherLoop::new(loop_backend, StaticMounts(mounts));
      watcher.run(BufReader::new(loop_input), loop_output).await
    });
    Self {
      input,
      output: BufReader::new(output).lines(),
      backend,
      task,
    }
  }

  async fn send(&mut self, text: &str) {
    self.input.write_all(text.as_bytes()).await.unwrap();
  }

  async fn line(&mut self) -> String {
    timeout(Duration::from_secs(5), self.output.next_line())
      .await
      .expect("timed out waiting for output")
      .unwrap()
      .expect("output closed unexpectedly")
  }

  async fn expect(&mut self, lines: &[&str]) {
    for expected in lines {
      assert_eq!(self.line().await, *expected);
    }
  }

  async fn shutdown(mut self) -> FakeBackend {
    self.send("EXIT\n").await;
    timeout(Duration::from_secs(5), self.task).await.unwrap().unwrap().unwrap();
    self.backend
  }
}

fn nfs_mount(path: &str) -> MountEntry {
  MountEntry {
    path: path.to_string(),
    fs_type: "nfs".to_string(),
  }
}

#[tokio::test]
async fn filesystem_root_request_is_refused() {
  let mut h = Harness::start(Vec::new());

  h.send("ROOTS\n/\n#\n").await;
  h.expect(&["UNWATCHABLE", "/", "#"]).await;

  let backend = h.shutdown().await;
  assert!(backend.state().installs.is_empty());
}

#[tokio::test]
async fn roots_under_unwatchable_mounts_are_reported() {
  let mut h = Harness::start(vec![nfs_mount("/mnt/nfs")]);

  h.send("ROOTS\n/home/dev\n/mnt/nfs/project\n#\n").await;
  h.expect(&["UNWATCHABLE", "/mnt/nfs/project", "#"]).await;

  let backend = h.shutdown().await;
  let state = backend.state();
  assert_eq!(state.installs.len(), 1);
  assert_eq!(state.installs[0].0.to_str(), Some("/home/dev"));
}

#[tokio::test]
async fn nested_unwatchable_mount_is_carved_out() {
  let mut h = Harness::start(vec![nfs_mount("/data/mnt/nfs")]);

  h.send("ROOTS\n/data/\n#\n").await;
  h.expect(&["UNWATCHABLE", "/data/mnt/nfs", "#"]).await;

  let backend = h.shutdown().await;
  let state = backend.state();
  assert_eq!(state.installs.len(), 1);
  assert_eq!(state.installs[0].0.to_str(), Some("/data"));
  assert_eq!(state.installs[0].1, vec![std::path::PathBuf::from("/data/mnt/nfs")]);
}

#[tokio::test]
async fn change_notifications_flow_through() {
  let mut h = Harness::start(Vec::new());

  h.send("ROOTS\n/a\n#\n").await;
  h.expect(&["UNWATCHABLE", "#"]).await;

  h.backend.push_event(BackendEvent::new("/a/file.txt", BackendEventKind::Modified));
  h.expect(&["CHANGE", "/a/file.txt"]).await;

  h.backend.push_event(BackendEvent::new("/a/new", BackendEventKind::Created));
  h.expect(&["CREATE", "/a/new", "CHANGE", "/a/new"]).await;

  h.backend.push_event(BackendEvent::new("/a/file.txt", BackendEventKind::MetadataChanged));
  h.expect(&["STATS", "/a/file.txt"]).await;

  let backend = h.shutdown().await;
  assert_eq!(backend.state().removed.len(), 1);
}

#[tokio::test]
async fn limit_advisory_precedes_the_unwatchable_block() {
  let backend = FakeBackend::new();
  backend.script(InstallOutcome::Limit(LimitKind::Watches));
  let mut h = Harness::with_backend(backend, Vec::new());

  h.send("ROOTS\n/big\n#\n").await;
  assert_eq!(h.line().await, "MESSAGE");
  assert!(h.line().await.contains("max_user_watches"));
  h.expect(&["UNWATCHABLE", "/big", "#"]).await;

  h.shutdown().await;
}

#[tokio::test]
async fn unmount_resets_and_allows_reregistration() {
  let mut h = Harness::start(Vec::new());

  h.send("ROOTS\n/a\n/b\n#\n").await;
  h.expect(&["UNWATCHABLE", "#"]).await;

  h.backend.push_event(BackendEvent::new("/a", BackendEventKind::Unmounted));
  h.expect(&["RESET"]).await;
  {
    let state = h.backend.state();
    assert_eq!(state.resets, 1);
    // Registry was cleared wholesale, no per-root removal
    assert!(state.removed.is_empty());
  }

  h.send("ROOTS\n/a\n#\n").await;
  h.expect(&["UNWATCHABLE", "#"]).await;

  let backend = h.shutdown().await;
  assert_eq!(backend.state().installs.len(), 3);
}

#[tokio::test]
async fn deleted_root_reports_delete_and_recovers() {
  let dir = tempfile::TempDir::new().unwrap();
  let root = dir.path().to_string_lossy().into_owned();

  let mut h = Harness::start(Vec::new());
  h.send(&format!("ROOTS\n{root}\n#\n")).await;
  h.expect(&["UNWATCHABLE", "#"]).await;

  h.backend.push_event(BackendEvent::new(dir.path(), BackendEventKind::SelfRemoved));
  h.expect(&["DELETE", &root]).await;

  // The directory still exists, so the retry tick restores the watch and
  // synthesizes a creation pair.
  h.expect(&["CREATE", &root, "CHANGE", &root]).await;

  let backend = h.shutdown().await;
  assert_eq!(backend.state().installs.len(), 2);
}

#[tokio::test]
async fn embedded_newlines_are_stripped_on_the_wire() {
  let mut h = Harness::start(Vec::new());

  h.send("ROOTS\n/a\n#\n").await;
  h.expect(&["UNWATCHABLE", "#"]).await;

  h.backend.push_event(BackendEvent::new("/a/odd\nname", BackendEventKind::Modified));
  h.expect(&["CHANGE", "/a/oddname"]).await;

  h.shutdown().await;
}

#[tokio::test]
async fn unknown_commands_are_ignored() {
  let mut h = Harness::start(Vec::new());

  h.send("PING\nROOTS\n/a\n#\n").await;
  h.expect(&["UNWATCHABLE", "#"]).await;

  h.shutdown().await;
}

#[tokio::test]
async fn closed_input_shuts_down_and_releases_watches() {
  let mut h = Harness::start(Vec::new());

  h.send("ROOTS\n/a\n#\n").await;
  h.expect(&["UNWATCHABLE", "#"]).await;

  drop(h.input);
  timeout(Duration::from_secs(5), h.task).await.unwrap().unwrap().unwrap();
  assert_eq!(h.backend.state().removed.len(), 1);
}

#[tokio::test]
async fn empty_line_inside_a_root_list_shuts_down() {
  let mut h = Harness::start(Vec::new());

  h.send("ROOTS\n/a\n\n").await;
  timeout(Duration::from_secs(5), h.task).await.unwrap().unwrap().unwrap();
  assert!(h.backend.state().installs.is_empty());
}

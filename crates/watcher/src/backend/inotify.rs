//! Linux inotify backend.
//!
//! inotify is not recursive, so one root watch is a *session*: a descriptor
//! for every directory in the subtree, minus excluded mount subtrees.
//! Directories created (or moved in) later are added to their session while
//! events are drained; `IN_IGNORED` retires descriptors the kernel has
//! already dropped.
//!
//! Readiness is exposed through `AsyncFd` so the control loop can race the
//! inotify descriptor against control input without a dedicated thread.

use std::collections::{HashMap, HashSet};
use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use inotify::{EventMask, Inotify, WatchDescriptor, WatchMask, Watches};
use tokio::io::unix::AsyncFd;
use tracing::{debug, warn};

use super::{BackendError, BackendEvent, BackendEventKind, InstallOutcome, LimitKind, NotificationBackend, WatchId};

const EVENT_BUFFER_SIZE: usize = 4096;

fn watch_mask() -> WatchMask {
  WatchMask::MODIFY
    | WatchMask::ATTRIB
    | WatchMask::CREATE
    | WatchMask::DELETE
    | WatchMask::MOVED_FROM
    | WatchMask::MOVED_TO
    | WatchMask::DELETE_SELF
    | WatchMask::MOVE_SELF
}

fn classify_limit(err: &io::Error) -> Option<LimitKind> {
  match err.raw_os_error() {
    Some(libc::ENOSPC) => Some(LimitKind::Watches),
    Some(libc::EMFILE) | Some(libc::ENFILE) => Some(LimitKind::Instances),
    _ => None,
  }
}

/// Descriptors installed for one root.
struct Session {
  excluded: Vec<PathBuf>,
  wds: HashSet<WatchDescriptor>,
}

struct DescriptorEntry {
  session: WatchId,
  path: PathBuf,
}

/// An event as pulled off the kernel queue, before translation.
struct RawEvent {
  wd: WatchDescriptor,
  mask: EventMask,
  name: Option<OsString>,
}

pub struct InotifyBackend {
  fd: AsyncFd<Inotify>,
  watches: Watches,
  buffer: Box<[u8]>,
  sessions: HashMap<WatchId, Session>,
  descriptors: HashMap<WatchDescriptor, DescriptorEntry>,
  next_id: u32,
}

impl InotifyBackend {
  pub fn new() -> Result<Self, BackendError> {
    let inotify = Inotify::init().map_err(BackendError::Init)?;
    let watches = inotify.watches();
    let fd = AsyncFd::new(inotify).map_err(BackendError::Init)?;
    Ok(Self {
      fd,
      watches,
      buffer: vec![0u8; EVENT_BUFFER_SIZE].into_boxed_slice(),
      sessions: HashMap::new(),
      descriptors: HashMap::new(),
      next_id: 0,
    })
  }

  /// Install descriptors for `dir` and every directory below it that is not
  /// excluded. `is_root` marks the session's root directory, whose failures
  /// decide the outcome of the whole installation.
  fn watch_tree(&mut self, id: WatchId, session: &mut Session, dir: PathBuf, is_root: bool) -> Result<(), InstallOutcome> {
    let mut stack = vec![dir];
    let mut at_root = is_root;
    while let Some(dir) = stack.pop() {
      match self.watches.add(&dir, watch_mask()) {
        Ok(wd) => {
          // An overlapping session may already own this descriptor; events
          // resolve through the existing entry either way.
          self
            .descriptors
            .entry(wd.clone())
            .or_insert_with(|| DescriptorEntry { session: id, path: dir.clone() });
          session.wds.insert(wd);
        }
        Err(err) => {
          if let Some(limit) = classify_limit(&err) {
            warn!(dir = %dir.display(), ?limit, "watch limit hit while installing session");
            return Err(InstallOutcome::Limit(limit));
          }
          if at_root {
            return Err(if err.kind() == io::ErrorKind::NotFound {
              InstallOutcome::Missing
            } else {
              warn!(dir = %dir.display(), error = %err, "cannot watch root directory");
              InstallOutcome::Unsupported
            });
          }
          debug!(dir = %dir.display(), error = %err, "skipping unwatchable subdirectory");
          continue;
        }
      }
      at_root = false;

      let entries = match fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(err) => {
          debug!(dir = %dir.display(), error = %err, "cannot enumerate directory");
          continue;
        }
      };
      for entry in entries.flatten() {
        // Symlinks are not followed; flattened roots arrive pre-resolved.
        if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
          continue;
        }
        let child = entry.path();
        if session.excluded.iter().any(|mount| child.starts_with(mount)) {
          debug!(dir = %child.display(), "subtree excluded from watch session");
          continue;
        }
        stack.push(child);
      }
    }
    Ok(())
  }

  /// Release descriptors of a session that failed to install completely.
  fn rollback(&mut self, session: &Session) {
    for wd in &session.wds {
      let shared = self.sessions.values().any(|s| s.wds.contains(wd));
      if !shared {
        let _ = self.watches.remove(wd.clone());
        self.descriptors.remove(wd);
      }
    }
  }

  /// Grow a session to cover a directory created inside it.
  fn extend_session(&mut self, id: WatchId, dir: PathBuf) {
    let Some(mut session) = self.sessions.remove(&id) else {
      return;
    };
    if !session.excluded.iter().any(|mount| dir.starts_with(mount)) {
      if let Err(outcome) = self.watch_tree(id, &mut session, dir, false) {
        // Keep whatever was installed; a limit here only degrades coverage.
        debug!(?outcome, "could not extend watch session");
      }
    }
    self.sessions.insert(id, session);
  }

  /// Forget a descriptor the kernel has retired.
  fn retire(&mut self, wd: &WatchDescriptor) {
    self.descriptors.remove(wd);
    for session in self.sessions.values_mut() {
      session.wds.remove(wd);
    }
  }

  fn translate(&mut self, event: RawEvent, out: &mut Vec<BackendEvent>) {
    if event.mask.contains(EventMask::Q_OVERFLOW) {
      warn!("inotify event queue overflowed; some notifications were lost");
      return;
    }
    if event.mask.contains(EventMask::IGNORED) {
      self.retire(&event.wd);
      return;
    }
    let Some(entry) = self.descriptors.get(&event.wd) else {
      return;
    };
    let dir = entry.path.clone();
    let session = entry.session;
    let path = match &event.name {
      Some(name) => dir.join(name),
      None => dir.clone(),
    };

    if event.mask.intersects(EventMask::CREATE | EventMask::MOVED_TO) {
      if event.mask.contains(EventMask::ISDIR) {
        self.extend_session(session, path.clone());
      }
      out.push(BackendEvent::new(path, BackendEventKind::Created));
    } else if event.mask.contains(EventMask::MODIFY) {
      out.push(BackendEvent::new(path, BackendEventKind::Modified));
    } else if event.mask.contains(EventMask::ATTRIB) {
      out.push(BackendEvent::new(path, BackendEventKind::MetadataChanged));
    } else if event.mask.intersects(EventMask::DELETE | EventMask::MOVED_FROM) {
      out.push(BackendEvent::new(path, BackendEventKind::Removed));
    }

    if event.mask.intersects(EventMask::DELETE_SELF | EventMask::MOVE_SELF) {
      out.push(BackendEvent::new(dir, BackendEventKind::SelfRemoved));
    } else if event.mask.contains(EventMask::UNMOUNT) {
      out.push(BackendEvent::new(dir, BackendEventKind::Unmounted));
    }
  }
}

#[async_trait::async_trait]
impl NotificationBackend for InotifyBackend {
  fn install(&mut self, root: &Path, excluded: &[PathBuf]) -> InstallOutcome {
    let meta = match fs::metadata(root) {
      Ok(meta) => meta,
      Err(err) if err.kind() == io::ErrorKind::NotFound => return InstallOutcome::Missing,
      Err(err) => {
        warn!(root = %root.display(), error = %err, "cannot stat watch root");
        return InstallOutcome::Unsupported;
      }
    };
    if !meta.is_dir() {
      debug!(root = %root.display(), "watch root is not a directory");
      return InstallOutcome::Ignored;
    }

    let id = WatchId(self.next_id);
    let mut session = Session {
      excluded: excluded.to_vec(),
      wds: HashSet::new(),
    };
    match self.watch_tree(id, &mut session, root.to_path_buf(), true) {
      Ok(()) => {
        self.next_id += 1;
        debug!(root = %root.display(), id = id.0, descriptors = session.wds.len(), "watch session installed");
        self.sessions.insert(id, session);
        InstallOutcome::Watching(id)
      }
      Err(outcome) => {
        self.rollback(&session);
        outcome
      }
    }
  }

  fn remove(&mut self, id: WatchId) {
    let Some(session) = self.sessions.remove(&id) else {
      return;
    };
    for wd in &session.wds {
      let new_owner = self
        .sessions
        .iter()
        .find(|(_, s)| s.wds.contains(wd))
        .map(|(owner, _)| *owner);
      match new_owner {
        Some(owner) => {
          if let Some(entry) = self.descriptors.get_mut(wd) {
            if entry.session == id {
              entry.session = owner;
            }
          }
        }
        None => {
          let _ = self.watches.remove(wd.clone());
          self.descriptors.remove(wd);
        }
      }
    }
    debug!(id = id.0, "watch session released");
  }

  async fn ready(&mut self) -> Result<(), BackendError> {
    let mut guard = self.fd.readable_mut().await.map_err(BackendError::Wait)?;
    guard.clear_ready();
    Ok(())
  }

  fn drain_events(&mut self) -> Result<Vec<BackendEvent>, BackendError> {
    let mut raw = Vec::new();
    loop {
      match self.fd.get_mut().read_events(&mut self.buffer) {
        Ok(events) => {
          let mut got_any = false;
          for event in events {
            got_any = true;
            raw.push(RawEvent {
              wd: event.wd,
              mask: event.mask,
              name: event.name.map(|n| n.to_os_string()),
            });
          }
          if !got_any {
            break;
          }
        }
        Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
        Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
        Err(err) => return Err(BackendError::Read(err)),
      }
    }

    let mut out = Vec::new();
    for event in raw {
      self.translate(event, &mut out);
    }
    Ok(out)
  }

  fn reset(&mut self) {
    for (wd, _) in self.descriptors.drain() {
      let _ = self.watches.remove(wd);
    }
    self.sessions.clear();
  }
}

//! Mount Filter - classifies mounted filesystems as watchable or not.
//!
//! Change notification only makes sense for local block-backed filesystems.
//! Pseudo-filesystems (`proc`, `sysfs`, `dev*`), swap, user-space bridges
//! (`fuse*` except `fuseblk`) and network filesystems (`nfs`, `cifs`) either
//! never deliver events or deliver them for the wrong host, so roots touching
//! them are excluded during reconciliation.
//!
//! A snapshot is valid for a single reconciliation cycle only; the table is
//! re-read on every cycle because mounts come and go.

use std::fs;
use std::io;
use thiserror::Error;
use tracing::debug;

const MOUNT_TABLE: &str = "/proc/mounts";

/// One mount point, as seen at snapshot time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
  /// Mount path, with getmntent-style octal escapes decoded.
  pub path: String,
  /// Filesystem type as reported by the kernel.
  pub fs_type: String,
}

#[derive(Debug, Error)]
pub enum MountError {
  #[error("cannot read {MOUNT_TABLE}: {0}")]
  Unreadable(#[source] io::Error),
}

/// Source of mount-table snapshots.
///
/// The control loop owns one implementation; tests substitute a static table.
pub trait MountTable {
  /// Snapshot the current mount table and return every unwatchable mount,
  /// in table order. An unreadable table is an error, never an empty list.
  fn unwatchable_mounts(&self) -> Result<Vec<MountEntry>, MountError>;
}

/// The real mount table, read from `/proc/mounts`.
pub struct ProcMounts;

impl MountTable for ProcMounts {
  fn unwatchable_mounts(&self) -> Result<Vec<MountEntry>, MountError> {
    let table = fs::read_to_string(MOUNT_TABLE).map_err(MountError::Unreadable)?;
    Ok(parse_unwatchable(&table))
  }
}

/// A fixed mount list, for tests and tooling.
pub struct StaticMounts(pub Vec<MountEntry>);

impl MountTable for StaticMounts {
  fn unwatchable_mounts(&self) -> Result<Vec<MountEntry>, MountError> {
    Ok(self.0.clone())
  }
}

/// Whether a filesystem type supports change notification.
fn is_watchable(fs_type: &str) -> bool {
  !(fs_type.starts_with("dev")
    || fs_type == "proc"
    || fs_type == "sysfs"
    || fs_type == "swap"
    || (fs_type.starts_with("fuse") && fs_type != "fuseblk")
    || fs_type == "cifs"
    || fs_type == "nfs"
    || fs_type == "nfs4")
}

pub(crate) fn parse_unwatchable(table: &str) -> Vec<MountEntry> {
  let mut mounts = Vec::new();
  for line in table.lines() {
    let mut fields = line.split_whitespace();
    let (Some(_device), Some(path), Some(fs_type)) = (fields.next(), fields.next(), fields.next()) else {
      continue;
    };
    debug!(path, fs_type, "mount table entry");
    // "ignore" is a placeholder entry, not a real mount
    if fs_type == "ignore" || is_watchable(fs_type) {
      continue;
    }
    mounts.push(MountEntry {
      path: unescape_octal(path),
      fs_type: fs_type.to_string(),
    });
  }
  mounts
}

/// Decode `\040`-style octal escapes the kernel uses for whitespace in
/// mount paths.
fn unescape_octal(field: &str) -> String {
  let bytes = field.as_bytes();
  let mut out = Vec::with_capacity(bytes.len());
  let mut i = 0;
  while i < bytes.len() {
    if bytes[i] == b'\\' && i + 3 < bytes.len() {
      let digits = &bytes[i + 1..i + 4];
      if digits.iter().all(|d| (b'0'..=b'7').contains(d)) {
        let value = digits.iter().fold(0u32, |acc, d| acc * 8 + u32::from(d - b'0'));
        if let Ok(byte) = u8::try_from(value) {
          out.push(byte);
          i += 4;
          continue;
        }
      }
    }
    out.push(bytes[i]);
    i += 1;
  }
  String::from_utf8_lossy(&out).into_owned()
}

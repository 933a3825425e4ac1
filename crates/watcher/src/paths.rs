//! Path string helpers shared by the registry and the protocol layer.
//!
//! Roots arrive over the wire as plain strings and may carry a leading `|`
//! marker meaning the path was produced by flattening a symlink chain. The
//! marker is part of the root's identity (it is stored and diffed verbatim)
//! but must never reach the OS: every filesystem operation, mount comparison,
//! and emitted notification uses the de-escaped form.

use std::borrow::Cow;

/// Marker prefixed to roots that originate from a flattened symlink chain.
pub const FLATTEN_MARKER: char = '|';

/// Strip the flattening marker, yielding the path as the OS knows it.
pub fn unflatten(path: &str) -> &str {
  path.strip_prefix(FLATTEN_MARKER).unwrap_or(path)
}

/// Whether `parent` contains `child` (or is equal to it) by path components.
///
/// Pure string comparison on absolute paths; `/a` is not a parent of `/ab`.
pub fn is_parent_path(parent: &str, child: &str) -> bool {
  match child.strip_prefix(parent) {
    Some(rest) => rest.is_empty() || rest.starts_with('/') || parent.ends_with('/'),
    None => false,
  }
}

/// Copy of `path` safe to put on a line-oriented wire.
///
/// Embedded newlines would break protocol framing, so they are removed from
/// the outgoing copy. The stored path is never mutated.
pub fn sanitize_line(path: &str) -> Cow<'_, str> {
  if path.contains('\n') {
    Cow::Owned(path.chars().filter(|c| *c != '\n').collect())
  } else {
    Cow::Borrowed(path)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn unflatten_strips_single_marker() {
    assert_eq!(unflatten("|/home/user/link"), "/home/user/link");
    assert_eq!(unflatten("/home/user/plain"), "/home/user/plain");
    // Only the leading marker is an escape
    assert_eq!(unflatten("/odd|name"), "/odd|name");
  }

  #[test]
  fn parent_path_requires_component_boundary() {
    assert!(is_parent_path("/data", "/data"));
    assert!(is_parent_path("/data", "/data/mnt"));
    assert!(is_parent_path("/", "/data"));
    assert!(!is_parent_path("/data", "/database"));
    assert!(!is_parent_path("/data/mnt", "/data"));
  }

  #[test]
  fn sanitize_removes_embedded_newlines() {
    assert_eq!(sanitize_line("/plain/path"), "/plain/path");
    assert_eq!(sanitize_line("/evil\npath"), "/evilpath");
    assert!(matches!(sanitize_line("/plain"), Cow::Borrowed(_)));
  }
}

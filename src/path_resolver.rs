//! Path Resolver (§4.B). Reads a path argument out of a tracee's memory and
//! decides how it should be interpreted for Target Registry lookup, honoring
//! each hooked syscall's symlink-follow semantics. Grounded on the teacher's
//! `Task::read_c_str` (declared in `task_interface/task.rs`), built here on
//! `remote_mem::read_cstr`.

use nix::unistd::Pid;
use std::path::PathBuf;

use crate::error::{Result, SupervisorError};
use crate::remote_mem;
use crate::remote_ptr::RemotePtr;

pub const PATH_MAX: usize = 4096;

/// Whether the calling syscall should resolve a trailing symlink before
/// matching against the Target Registry, or operate on the link itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowPolicy {
    Follow,
    NoFollow,
}

/// A path argument as read from the tracee, plus enough context to apply the
/// nofollow rule (§4.B: "returns no match even if the link's target would
/// have matched").
#[derive(Debug, Clone)]
pub struct ResolvedPath {
    pub raw: PathBuf,
    pub is_absolute: bool,
}

/// Reads the NUL-terminated path at `addr` in `pid`'s address space, bounded
/// to `PATH_MAX + 1` bytes per §4.C. A path exceeding that bound is a fatal
/// condition for the tracee (§4.D: `PathTooLong`), not a truncation.
pub fn read_path_arg(pid: Pid, addr: RemotePtr<u8>) -> Result<ResolvedPath> {
    if addr.is_null() {
        return Ok(ResolvedPath {
            raw: PathBuf::new(),
            is_absolute: false,
        });
    }
    let bytes = remote_mem::read_cstr(pid, addr, PATH_MAX + 1).map_err(|_| {
        SupervisorError::PathTooLong {
            len: PATH_MAX + 1,
        }
    })?;
    let raw = PathBuf::from(String::from_utf8_lossy(&bytes).into_owned());
    let is_absolute = raw.is_absolute();
    Ok(ResolvedPath { raw, is_absolute })
}

/// Applies `realpath`-style symlink resolution when the syscall's semantics
/// call for it. Non-absolute `AT_*` paths are left untouched — the caller's
/// directory fd governs them, and the supervisor does not track directory
/// fds (§4.B).
pub fn resolve(path: &ResolvedPath, follow: FollowPolicy) -> PathBuf {
    if !path.is_absolute || follow == FollowPolicy::NoFollow {
        return path.raw.clone();
    }
    match std::fs::canonicalize(&path.raw) {
        Ok(resolved) => resolved,
        Err(_) => path.raw.clone(),
    }
}

/// True if `path` names a symlink on the current (pre-substitution)
/// filesystem. Used to apply the "nofollow + symlink => no match" rule even
/// when `follow` would otherwise have resolved it.
pub fn is_symlink(path: &std::path::Path) -> bool {
    std::fs::symlink_metadata(path)
        .map(|m| m.file_type().is_symlink())
        .unwrap_or(false)
}

/// Implements the full §4.B decision: returns `None` when lookup must treat
/// this as "no match" regardless of what the Target Registry contains.
pub fn effective_lookup_path(path: &ResolvedPath, follow: FollowPolicy) -> Option<PathBuf> {
    if path.raw.as_os_str().is_empty() {
        return None;
    }
    if follow == FollowPolicy::NoFollow && is_symlink(&path.raw) {
        return None;
    }
    Some(resolve(path, follow))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_path_is_no_match() {
        let path = ResolvedPath {
            raw: PathBuf::new(),
            is_absolute: false,
        };
        assert_eq!(effective_lookup_path(&path, FollowPolicy::Follow), None);
    }

    #[test]
    fn relative_at_path_is_left_unresolved() {
        let path = ResolvedPath {
            raw: PathBuf::from("subdir/file"),
            is_absolute: false,
        };
        let resolved = resolve(&path, FollowPolicy::Follow);
        assert_eq!(resolved, PathBuf::from("subdir/file"));
    }

    #[test]
    fn nofollow_on_symlink_is_no_match() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("target");
        std::fs::write(&target, b"x").unwrap();
        let link = dir.path().join("link");
        std::os::unix::fs::symlink(&target, &link).unwrap();

        let path = ResolvedPath {
            raw: link.clone(),
            is_absolute: true,
        };
        assert_eq!(
            effective_lookup_path(&path, FollowPolicy::NoFollow),
            None
        );
        assert!(effective_lookup_path(&path, FollowPolicy::Follow).is_some());
    }
}

//! Syscall Rewriter (§4.D) — the core of the redirection engine. Installs
//! hooks on a fixed set of syscalls and processes each intercepted call in
//! two phases (entry-stop, exit-stop), as the Hook Spec table directs.
//! Grounded on the teacher's syscall-processing split in `replay_syscall.rs`
//! (`rep_process_syscall`'s entry/exit staging), adapted from "replay a
//! recorded value" to "substitute a different value".

use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use nix::unistd::Pid;

use crate::child::ChildArena;
use crate::error::{Result, SupervisorError};
use crate::fd_table::FdInfo;
use crate::format_detector;
use crate::helper;
use crate::kernel_abi::{self, SyscallNr};
use crate::path_resolver::{self, FollowPolicy, PATH_MAX};
use crate::registers::Registers;
use crate::remote_mem;
use crate::remote_ptr::RemotePtr;
use crate::supervisor::SupervisorState;
use crate::target::{TargetEntry, TargetPolicy};

/// Android's secure-container staging mountpoint; mounts targeting it are
/// redirected regardless of source device (§4.D mount-hook special case).
const ASEC_SENTINEL_MOUNTPOINT: &str = "/mnt/asec/.stage";

/// One entry in the static table driving entry-stop processing for
/// path-argument syscalls.
#[derive(Debug, Clone, Copy)]
pub struct HookSpec {
    pub name: &'static str,
    pub path_arg_index: usize,
    pub default_follow: FollowPolicy,
    /// Index of an `AT_*` flags argument carrying `AT_SYMLINK_NOFOLLOW`, if
    /// this hook has one.
    pub at_flags_arg_index: Option<usize>,
    /// Index of the `open(2)`-style flags argument carrying `O_NOFOLLOW`/
    /// `O_ACCMODE`, if this hook is part of the open family. Differs by
    /// position between `open` (arg 1) and `openat` (arg 2).
    pub open_flags_arg_index: Option<usize>,
}

const fn spec(
    name: &'static str,
    path_arg_index: usize,
    default_follow: FollowPolicy,
    at_flags_arg_index: Option<usize>,
    open_flags_arg_index: Option<usize>,
) -> HookSpec {
    HookSpec {
        name,
        path_arg_index,
        default_follow,
        at_flags_arg_index,
        open_flags_arg_index,
    }
}

/// Static Hook Spec table (§3, §4.D): the full path-arg family. Syscalls that
/// don't exist in the native ABI's numbering (e.g. the pre-`*at` legacy
/// family on a pure aarch64 kernel, or the 32-bit-only `stat64` family on
/// either architecture) simply fail to resolve in `build_hook_table` and are
/// skipped — not an error, since the corresponding modern syscall covers the
/// same codepath.
const PATH_ARG_HOOKS: &[HookSpec] = &[
    spec("openat", 1, FollowPolicy::Follow, None, Some(2)),
    spec("open", 0, FollowPolicy::Follow, None, Some(1)),
    spec("fchmodat", 1, FollowPolicy::Follow, None, None),
    spec("chmod", 0, FollowPolicy::Follow, None, None),
    spec("fstatat", 1, FollowPolicy::Follow, Some(3), None),
    spec("stat", 0, FollowPolicy::Follow, None, None),
    spec("lstat", 0, FollowPolicy::NoFollow, None, None),
    spec("access", 0, FollowPolicy::Follow, None, None),
    spec("faccessat", 1, FollowPolicy::Follow, Some(3), None),
    spec("chown", 0, FollowPolicy::Follow, None, None),
    spec("lchown", 0, FollowPolicy::NoFollow, None, None),
    spec("fchownat", 1, FollowPolicy::Follow, Some(4), None),
    spec("utime", 0, FollowPolicy::Follow, None, None),
    spec("utimes", 0, FollowPolicy::Follow, None, None),
    spec("futimesat", 1, FollowPolicy::Follow, None, None),
    spec("utimensat", 1, FollowPolicy::Follow, Some(3), None),
    spec("mknodat", 1, FollowPolicy::NoFollow, None, None),
];

pub struct ResolvedHook {
    pub spec: HookSpec,
    pub nr: SyscallNr,
}

pub fn build_hook_table() -> Vec<ResolvedHook> {
    PATH_ARG_HOOKS
        .iter()
        .filter_map(|s| kernel_abi::resolve(s.name).map(|nr| ResolvedHook { spec: *s, nr }))
        .collect()
}

pub fn find_hook<'a>(table: &'a [ResolvedHook], nr: i64) -> Option<&'a ResolvedHook> {
    table.iter().find(|h| h.nr.0 == nr)
}

/// AT_SYMLINK_NOFOLLOW, per `linux/fcntl.h`.
const AT_SYMLINK_NOFOLLOW: u64 = 0x100;
const O_NOFOLLOW: u64 = 0o400_000;

fn follow_policy_for(spec: &HookSpec, regs: &Registers) -> FollowPolicy {
    if let Some(idx) = spec.open_flags_arg_index {
        if regs.arg(idx) as u64 & O_NOFOLLOW != 0 {
            return FollowPolicy::NoFollow;
        }
        return FollowPolicy::Follow;
    }
    if let Some(idx) = spec.at_flags_arg_index {
        if regs.arg(idx) & AT_SYMLINK_NOFOLLOW != 0 {
            return FollowPolicy::NoFollow;
        }
    }
    spec.default_follow
}

/// Result of processing an entry stop: either the call proceeds unmodified,
/// or the tracee should be torn down.
pub enum EntryOutcome {
    Unchanged,
    Rewritten,
    Fatal(SupervisorError),
}

/// Entry-stop protocol for path-arg hooks (§4.D steps 1-5). Lookup is by
/// block-device identity only (`lookup_by_devpath`) — mountpoint-string
/// matching is spec'd only for the mount hook's ASEC sentinel case, never for
/// ordinary path-arg syscalls, so a plain `stat("/data")` naming a mountpoint
/// rather than a block device must not match a Target here.
pub fn handle_path_arg_entry(
    pid: Pid,
    state: &SupervisorState,
    arena: &mut ChildArena,
    hook: &ResolvedHook,
    regs: &mut Registers,
) -> EntryOutcome {
    if !state.hooks_live() {
        return EntryOutcome::Unchanged;
    }

    let addr = RemotePtr::<u8>::new(regs.arg(hook.spec.path_arg_index) as usize);
    let read = match path_resolver::read_path_arg(pid, addr) {
        Ok(r) => r,
        Err(err) => return EntryOutcome::Fatal(err),
    };

    let follow = follow_policy_for(&hook.spec, regs);
    let effective = match path_resolver::effective_lookup_path(&read, follow) {
        Some(p) => p,
        None => return EntryOutcome::Unchanged,
    };

    use std::os::unix::fs::MetadataExt;
    let identity_rdev = std::fs::metadata(&effective).ok().map(|m| m.rdev());
    let target: &TargetEntry = match state.registry.lookup_by_devpath(&effective, identity_rdev) {
        Some(t) => t,
        None => return EntryOutcome::Unchanged,
    };

    // A pure read-only open of a Bind target passes through unchanged: the
    // original path is still logically valid under the bind source.
    if let Some(flags_idx) = hook.spec.open_flags_arg_index {
        if target.policy.is_bind() {
            let flags = regs.arg(flags_idx) as i32;
            let access_mode = flags & libc::O_ACCMODE;
            if access_mode == libc::O_RDONLY {
                return EntryOutcome::Unchanged;
            }
        }
    }

    let purge_dir = match &target.policy {
        TargetPolicy::BindMount { source_dir, .. } => Some(source_dir.clone()),
        TargetPolicy::LoopImage { .. } => None,
    };
    let expected_fs_type = target.fs_type.clone();

    let substitute = target.policy.path_arg_substitute();
    match rewrite_path_arg(pid, arena, regs, hook.spec.path_arg_index, substitute) {
        Ok(()) => {
            if hook.spec.open_flags_arg_index.is_some() {
                arena.pending_open = Some(FdInfo {
                    substituted_path: effective,
                    snapshot: None,
                    expected_fs_type,
                    purge_dir,
                });
            }
            EntryOutcome::Rewritten
        }
        Err(err) => EntryOutcome::Fatal(err),
    }
}

fn rewrite_path_arg(
    pid: Pid,
    arena: &mut ChildArena,
    regs: &mut Registers,
    arg_index: usize,
    substitute: &Path,
) -> Result<()> {
    let bytes = substitute.as_os_str().as_bytes();
    if bytes.len() > PATH_MAX {
        return Err(SupervisorError::PathTooLong { len: bytes.len() });
    }
    let mut nul_terminated = bytes.to_vec();
    nul_terminated.push(0);

    let saved = regs.clone();
    let scratch = remote_mem::alloc_scratch_with(pid, &saved, &nul_terminated)?;
    arena.set_scratch(scratch, nul_terminated.len());

    regs.set_arg(arg_index, scratch.as_usize() as u64);
    regs.write(pid)?;
    Ok(())
}

/// Exit-stop protocol shared by every hook (§4.D): release scratch, and for
/// open-family syscalls, finish FD Table bookkeeping.
pub fn handle_exit(pid: Pid, arena: &mut ChildArena, regs: &Registers) -> Result<()> {
    if let Some((addr, len)) = arena.take_scratch() {
        remote_mem::free_scratch(pid, regs, addr, len)?;
    }

    if let Some(mut info) = arena.pending_open.take() {
        let result = regs.syscall_result();
        if result >= 0 {
            let fd = result as i32;
            info.snapshot = format_detector::pre(fd).ok();
            arena.fd_table.insert(fd, info);
        }
    }
    Ok(())
}

/// Mount hook additions (§4.D): source is arg0, target arg1, fstype arg2,
/// flags arg3.
pub fn handle_mount_entry(
    pid: Pid,
    state: &SupervisorState,
    arena: &mut ChildArena,
    regs: &mut Registers,
) -> EntryOutcome {
    if !state.hooks_live() {
        return EntryOutcome::Unchanged;
    }

    let target_addr = RemotePtr::<u8>::new(regs.arg(1) as usize);
    let target_path = match path_resolver::read_path_arg(pid, target_addr) {
        Ok(r) => r.raw,
        Err(err) => return EntryOutcome::Fatal(err),
    };

    let entry: &TargetEntry = if target_path == Path::new(ASEC_SENTINEL_MOUNTPOINT) {
        match state.registry.lookup_by_fstab_mount(&target_path) {
            Some(t) => t,
            None => return EntryOutcome::Unchanged,
        }
    } else {
        let source_addr = RemotePtr::<u8>::new(regs.arg(0) as usize);
        let source_path = match path_resolver::read_path_arg(pid, source_addr) {
            Ok(r) => r.raw,
            Err(err) => return EntryOutcome::Fatal(err),
        };
        match state.registry.lookup_by_devpath(&source_path, None) {
            Some(t) => t,
            None => return EntryOutcome::Unchanged,
        }
    };

    let source_sub = entry.policy.mount_source_substitute().to_path_buf();
    let is_bind = entry.policy.is_bind();

    if let Err(err) = rewrite_path_arg(pid, arena, regs, 0, &source_sub) {
        return EntryOutcome::Fatal(err);
    }

    if is_bind {
        regs.set_arg(2, 0);
        let flags = regs.arg(3) | libc::MS_BIND as u64;
        regs.set_arg(3, flags);
        if let Err(err) = regs.write(pid) {
            return EntryOutcome::Fatal(err.into());
        }
    }

    EntryOutcome::Rewritten
}

/// Close hook (§4.D): if the fd is tracked, ask the Format Detector whether
/// the backing device was reformatted, and if so schedule a content-only
/// purge of the replacement directory (Bind targets only — Loop targets
/// have nothing analogous to purge, the image itself was replaced).
pub fn handle_close_entry(arena: &mut ChildArena, fd: i32) {
    if let Some(info) = arena.fd_table.get(fd) {
        if let Some(snapshot) = &info.snapshot {
            let reformatted = format_detector::was_format(fd, snapshot).unwrap_or_else(|err| {
                log::warn!("format detector failed for fd {fd}: {err}");
                false
            });
            if reformatted {
                if let Some(dir) = &info.purge_dir {
                    if let Err(err) = helper::purge_directory_contents(dir) {
                        log::warn!("purge of {} failed: {err}", dir.display());
                    }
                }
            }
        }
    }
    arena.fd_table.remove(fd);
}

/// Dup-family handling (§4.D): clone the FD Info for a tracked source fd.
pub fn handle_dup_entry(arena: &mut ChildArena, src_fd: i32) {
    arena.pending_dup_source = arena.fd_table.get(src_fd).cloned();
}

pub fn handle_dup_exit(arena: &mut ChildArena, new_fd: i32, success: bool) {
    let source = arena.pending_dup_source.take();
    if !success {
        return;
    }
    if let Some(info) = source {
        // `dup2`/`dup3` onto an already-tracked destination closes the
        // existing entry first (§4.D): `FdTable::insert` already logs and
        // replaces, satisfying that rule.
        arena.fd_table.insert(new_fd, info);
    }
}

/// fcntl handling (§4.D): only access-mode changes on a tracked fd are
/// unsupported; everything else (FD_CLOEXEC, locks, ...) passes through.
pub fn handle_fcntl_entry(arena: &ChildArena, fd: i32, cmd: i32) -> Result<()> {
    const F_SETFL: i32 = 4;
    if arena.fd_table.contains(fd) && cmd == F_SETFL {
        return Err(SupervisorError::UnsupportedFcntl { fd });
    }
    Ok(())
}

pub fn path_to_cstring_bytes(path: &Path) -> Vec<u8> {
    let mut bytes = path.as_os_str().as_bytes().to_vec();
    bytes.push(0);
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(path: &str) -> FdInfo {
        FdInfo {
            substituted_path: PathBuf::from(path),
            snapshot: None,
            expected_fs_type: "ext4".into(),
            purge_dir: None,
        }
    }

    #[test]
    fn hook_table_resolves_expected_names() {
        let table = build_hook_table();
        assert!(table.iter().any(|h| h.spec.name == "openat"));
        assert!(table.iter().any(|h| h.spec.name == "fchmodat"));
        assert!(table.iter().any(|h| h.spec.name == "fchownat"));
    }

    #[test]
    fn scope_creep_syscalls_are_not_hooked() {
        assert!(!PATH_ARG_HOOKS.iter().any(|h| h.name == "unlinkat"));
        assert!(!PATH_ARG_HOOKS.iter().any(|h| h.name == "mkdirat"));
    }

    #[test]
    fn find_hook_matches_by_number() {
        let table = build_hook_table();
        let openat = table.iter().find(|h| h.spec.name == "openat").unwrap();
        let found = find_hook(&table, openat.nr.0).unwrap();
        assert_eq!(found.spec.name, "openat");
    }

    #[test]
    fn fcntl_setfl_on_tracked_fd_is_unsupported() {
        let mut arena = ChildArena::new(Pid::from_raw(1));
        arena.fd_table.insert(5, info("/dev/block/loop250"));
        let err = handle_fcntl_entry(&arena, 5, 4).unwrap_err();
        assert!(matches!(err, SupervisorError::UnsupportedFcntl { fd: 5 }));
    }

    #[test]
    fn fcntl_on_untracked_fd_is_fine() {
        let arena = ChildArena::new(Pid::from_raw(1));
        assert!(handle_fcntl_entry(&arena, 5, 4).is_ok());
    }

    #[test]
    fn dup_exit_clones_fd_info_under_new_path() {
        let mut arena = ChildArena::new(Pid::from_raw(1));
        arena.fd_table.insert(5, info("/dev/block/loop250"));
        handle_dup_entry(&mut arena, 5);
        assert!(arena.pending_dup_source.is_some());
        handle_dup_exit(&mut arena, 6, true);
        assert!(arena.fd_table.contains(6));
        assert_eq!(
            arena.fd_table.get(6).unwrap().substituted_path,
            PathBuf::from("/dev/block/loop250")
        );
    }

    #[test]
    fn dup_exit_on_failure_does_not_track_new_fd() {
        let mut arena = ChildArena::new(Pid::from_raw(1));
        arena.fd_table.insert(5, info("/dev/block/loop250"));
        handle_dup_entry(&mut arena, 5);
        handle_dup_exit(&mut arena, 6, false);
        assert!(!arena.fd_table.contains(6));
        assert!(arena.pending_dup_source.is_none());
    }

    #[test]
    fn close_entry_removes_tracked_fd() {
        let mut arena = ChildArena::new(Pid::from_raw(1));
        arena.fd_table.insert(5, info("/dev/block/loop250"));
        handle_close_entry(&mut arena, 5);
        assert!(!arena.fd_table.contains(5));
    }
}

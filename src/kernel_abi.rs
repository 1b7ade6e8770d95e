//! Syscall name/number resolution for the native ABI. The Hook Spec (§4.D)
//! names syscalls by symbolic name (`openat`, `mount`, `close`, ...); this
//! module resolves each to the numeric id the running kernel actually uses,
//! once, at hook-table construction time, rather than comparing names on
//! every syscall stop.

/// A syscall identified by its native numeric id. Distinguished from a bare
/// `i64` so a hook table can't accidentally be built against the wrong
/// architecture's numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SyscallNr(pub i64);

macro_rules! syscalls {
    ($fn_name:ident; $($name:ident => $libc_const:ident),+ $(,)?) => {
        fn $fn_name(name: &str) -> Option<SyscallNr> {
            match name {
                $(stringify!($name) => Some(SyscallNr(libc::$libc_const as i64)),)+
                _ => None,
            }
        }
    };
}

// Present under both the legacy (x86_64) and "rationalized" (aarch64)
// syscall tables: the `*at`-suffixed family the rationalized table kept,
// plus the handful of non-path syscalls the Syscall Rewriter also dispatches
// on (close/dup/dup3/fcntl/execve/mount/umount2).
syscalls! { resolve_common;
    openat => SYS_openat,
    close => SYS_close,
    fstatat => SYS_newfstatat,
    fchmodat => SYS_fchmodat,
    fchownat => SYS_fchownat,
    faccessat => SYS_faccessat,
    mknodat => SYS_mknodat,
    futimesat => SYS_futimesat,
    utimensat => SYS_utimensat,
    mount => SYS_mount,
    umount2 => SYS_umount2,
    dup => SYS_dup,
    dup3 => SYS_dup3,
    fcntl => SYS_fcntl,
    execve => SYS_execve,
}

// The pre-`*at` legacy syscalls: dropped from the aarch64 rationalized
// table entirely (replaced by the `*at` family above with `AT_FDCWD`), but
// still the native ABI on x86_64, where a traced 64-bit binary can still
// issue them directly.
#[cfg(target_arch = "x86_64")]
syscalls! { resolve_legacy;
    stat => SYS_stat,
    lstat => SYS_lstat,
    chmod => SYS_chmod,
    access => SYS_access,
    chown => SYS_chown,
    lchown => SYS_lchown,
    utime => SYS_utime,
    utimes => SYS_utimes,
    open => SYS_open,
    dup2 => SYS_dup2,
}

#[cfg(not(target_arch = "x86_64"))]
fn resolve_legacy(_name: &str) -> Option<SyscallNr> {
    None
}

/// Resolves a syscall's symbolic name to its native numeric id. Returns
/// `None` for names this crate doesn't need to hook, or that don't exist on
/// the running architecture.
///
/// A handful of names are kernel-internal aliases or 32-bit-only ABI
/// variants rather than distinct native syscalls:
/// - `newstat`/`newlstat` are the kernel's own names for `stat`/`lstat` and
///   resolve to the same numeric id.
/// - `fstatat64` is the historical 32-bit name for what 64-bit kernels call
///   `newfstatat`; it resolves to the same id as `fstatat`.
/// - `stat64`, `lstat64`, `chown16`, `lchown16` are 32-bit-ABI-only syscalls
///   with no native equivalent on either architecture this crate targets
///   (x86_64, aarch64) and always resolve to `None`.
pub fn resolve(name: &str) -> Option<SyscallNr> {
    match name {
        "newstat" => resolve_legacy("stat"),
        "newlstat" => resolve_legacy("lstat"),
        "fstatat64" => resolve_common("fstatat"),
        "stat64" | "lstat64" | "chown16" | "lchown16" => None,
        other => resolve_common(other).or_else(|| resolve_legacy(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_known_syscalls() {
        assert_eq!(resolve("close"), Some(SyscallNr(libc::SYS_close as i64)));
        assert_eq!(resolve("mount"), Some(SyscallNr(libc::SYS_mount as i64)));
        assert_eq!(resolve("fchownat"), Some(SyscallNr(libc::SYS_fchownat as i64)));
    }

    #[test]
    fn unknown_name_resolves_to_none() {
        assert_eq!(resolve("not_a_syscall"), None);
    }

    #[test]
    fn thirty_two_bit_only_variants_resolve_to_none() {
        assert_eq!(resolve("stat64"), None);
        assert_eq!(resolve("lstat64"), None);
        assert_eq!(resolve("chown16"), None);
        assert_eq!(resolve("lchown16"), None);
    }

    #[test]
    fn kernel_internal_aliases_match_their_canonical_syscall() {
        assert_eq!(resolve("fstatat64"), resolve("fstatat"));
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn legacy_syscalls_resolve_on_x86_64() {
        assert_eq!(resolve("open"), Some(SyscallNr(libc::SYS_open as i64)));
        assert_eq!(resolve("stat"), Some(SyscallNr(libc::SYS_stat as i64)));
        assert_eq!(resolve("newstat"), resolve("stat"));
    }
}

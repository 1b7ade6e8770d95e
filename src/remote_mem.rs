//! Tracee Memory Broker (§4.C): word-level peek/poke for bounded path reads,
//! plus remote syscall injection (scratch-page mmap/munmap) for hooks that
//! need the tracee itself to perform a call, such as substituting a mount
//! source. Grounded on the teacher's `Task::read_bytes_ptrace` /
//! `write_bytes_ptrace` / `AutoRemoteSyscalls` split in `task_interface/task.rs`
//! (those are declared there as stubs; the actual peek/poke/syscall-injection
//! sequence here follows the standard `ptrace(2)` remote-syscall technique
//! the teacher's real upstream implements AutoRemoteSyscalls with).

use nix::sys::ptrace;
use nix::sys::wait::waitpid;
use nix::unistd::Pid;
use std::mem::size_of;

use crate::error::{Result, SupervisorError};
use crate::registers::Registers;
use crate::remote_ptr::RemotePtr;

const WORD_SIZE: usize = size_of::<libc::c_long>();

/// Reads `len` bytes from the tracee's address space starting at `addr`,
/// word at a time via `PTRACE_PEEKDATA`. Used for bounded reads (path
/// arguments, fstab-sized buffers) where mapping `/proc/pid/mem` would be
/// overkill for a supervisor that only ever reads a few hundred bytes at a
/// stretch.
pub fn read_bytes(pid: Pid, addr: RemotePtr<u8>, len: usize) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(len);
    let mut cur = addr.as_usize();
    while out.len() < len {
        let word = ptrace::read(pid, cur as *mut libc::c_void).map_err(|e| {
            SupervisorError::TraceeMemory {
                pid: pid.as_raw(),
                reason: format!("peekdata at 0x{cur:x}: {e}"),
            }
        })?;
        let word_bytes = word.to_ne_bytes();
        let take = (len - out.len()).min(WORD_SIZE);
        out.extend_from_slice(&word_bytes[..take]);
        cur += WORD_SIZE;
    }
    Ok(out)
}

/// Reads a NUL-terminated string from the tracee, up to `max_len` bytes
/// (§4.B: path reads are bounded, never unbounded scans). Returns an error if
/// no NUL byte is found within the bound.
pub fn read_cstr(pid: Pid, addr: RemotePtr<u8>, max_len: usize) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut cur = addr.as_usize();
    while out.len() < max_len {
        let word = ptrace::read(pid, cur as *mut libc::c_void).map_err(|e| {
            SupervisorError::TraceeMemory {
                pid: pid.as_raw(),
                reason: format!("peekdata at 0x{cur:x}: {e}"),
            }
        })?;
        let word_bytes = word.to_ne_bytes();
        for &b in &word_bytes {
            if b == 0 {
                return Ok(out);
            }
            out.push(b);
            if out.len() >= max_len {
                break;
            }
        }
        cur += WORD_SIZE;
    }
    Err(SupervisorError::TraceeMemory {
        pid: pid.as_raw(),
        reason: format!("no NUL terminator within {max_len} bytes"),
    })
}

/// Writes `data` into the tracee's address space at `addr`, word at a time
/// via `PTRACE_POKEDATA`. Partial trailing words are read-modify-written so
/// bytes beyond the write don't get clobbered.
pub fn write_bytes(pid: Pid, addr: RemotePtr<u8>, data: &[u8]) -> Result<()> {
    let mut cur = addr.as_usize();
    let mut offset = 0;
    while offset < data.len() {
        let remaining = data.len() - offset;
        let word = if remaining >= WORD_SIZE {
            libc::c_long::from_ne_bytes(
                data[offset..offset + WORD_SIZE].try_into().unwrap(),
            )
        } else {
            let existing = ptrace::read(pid, cur as *mut libc::c_void).map_err(|e| {
                SupervisorError::TraceeMemory {
                    pid: pid.as_raw(),
                    reason: format!("peekdata (rmw) at 0x{cur:x}: {e}"),
                }
            })?;
            let mut bytes = existing.to_ne_bytes();
            bytes[..remaining].copy_from_slice(&data[offset..]);
            libc::c_long::from_ne_bytes(bytes)
        };
        unsafe {
            ptrace::write(pid, cur as *mut libc::c_void, word as *mut libc::c_void)
        }
        .map_err(|e| SupervisorError::TraceeMemory {
            pid: pid.as_raw(),
            reason: format!("pokedata at 0x{cur:x}: {e}"),
        })?;
        cur += WORD_SIZE;
        offset += WORD_SIZE;
    }
    Ok(())
}

/// Drives the tracee through exactly one syscall it did not itself request,
/// by overwriting its registers to point at a syscall instruction already
/// mapped in its address space (the one it's currently stopped at counts:
/// we're always called from a syscall-exit stop, so `rip`/`pc` already
/// addresses one), single-stepping it through entry and exit, then restoring
/// the original registers. This is the same technique the teacher's
/// `AutoRemoteSyscalls` documents itself as providing, applied directly
/// rather than through a RAII guard object, since the supervisor only ever
/// needs one remote call at a time (allocate scratch, or free it).
pub fn inject_syscall(
    pid: Pid,
    saved: &Registers,
    nr: i64,
    args: [u64; 6],
) -> Result<i64> {
    let mut call_regs = saved.clone();
    call_regs.set_syscall_nr(nr as u64);
    for (i, arg) in args.iter().enumerate() {
        call_regs.set_arg(i, *arg);
    }
    call_regs.write(pid)?;

    ptrace::syscall(pid, None).map_err(|e| SupervisorError::TraceeMemory {
        pid: pid.as_raw(),
        reason: format!("PTRACE_SYSCALL (enter injected call): {e}"),
    })?;
    waitpid(pid, None).map_err(|e| SupervisorError::TraceeMemory {
        pid: pid.as_raw(),
        reason: format!("waitpid after injected syscall entry: {e}"),
    })?;

    ptrace::syscall(pid, None).map_err(|e| SupervisorError::TraceeMemory {
        pid: pid.as_raw(),
        reason: format!("PTRACE_SYSCALL (exit injected call): {e}"),
    })?;
    waitpid(pid, None).map_err(|e| SupervisorError::TraceeMemory {
        pid: pid.as_raw(),
        reason: format!("waitpid after injected syscall exit: {e}"),
    })?;

    let result_regs = Registers::read(pid)?;
    let ret = result_regs.syscall_result();

    saved.write(pid)?;
    Ok(ret)
}

/// Allocates a scratch page in the tracee via an injected `mmap` and writes
/// `data` into it. Used when a hook needs to hand the kernel a *new* path
/// string that doesn't already exist in the tracee's address space (e.g. the
/// substituted mount source). Returns the remote address of the scratch
/// allocation; release it with `free_scratch` once the syscall it was built
/// for has completed.
pub fn alloc_scratch_with(pid: Pid, saved: &Registers, data: &[u8]) -> Result<RemotePtr<u8>> {
    let len = data.len().max(1);
    let page_len = (len + 4095) & !4095;
    let ret = inject_syscall(
        pid,
        saved,
        libc::SYS_mmap,
        [
            0,
            page_len as u64,
            (libc::PROT_READ | libc::PROT_WRITE) as u64,
            (libc::MAP_PRIVATE | libc::MAP_ANONYMOUS) as u64,
            u64::MAX,
            0,
        ],
    )?;
    if ret < 0 {
        return Err(SupervisorError::TraceeMemory {
            pid: pid.as_raw(),
            reason: format!("remote mmap failed: errno {}", -ret),
        });
    }
    let addr = RemotePtr::<u8>::new(ret as usize);
    write_bytes(pid, addr, data)?;
    Ok(addr)
}

pub fn free_scratch(pid: Pid, saved: &Registers, addr: RemotePtr<u8>, len: usize) -> Result<()> {
    let page_len = (len.max(1) + 4095) & !4095;
    let ret = inject_syscall(
        pid,
        saved,
        libc::SYS_munmap,
        [addr.as_usize() as u64, page_len as u64, 0, 0, 0, 0],
    )?;
    if ret < 0 {
        log::warn!("remote munmap of scratch at {addr:?} failed: errno {}", -ret);
    }
    Ok(())
}

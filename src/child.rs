//! Child Lifecycle Manager (§4.H) and Child Arena (§3). One `ChildArena` is
//! owned per live tracee; the supervisor's event loop keeps a map of
//! `Pid -> Rc<RefCell<ChildArena>>`, mirroring the teacher's task/arena
//! ownership graph (`Rc<RefCell<ThreadGroup>>` in `thread_group.rs`) without
//! adopting its record/replay-specific fields.

use std::collections::HashMap;
use std::rc::Rc;
use std::cell::RefCell;
use std::sync::atomic::{AtomicI32, Ordering};

use nix::sys::ptrace;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::sys::wait::waitpid;
use nix::unistd::{fork, ForkResult, Pid};

use crate::error::Result;
use crate::fd_table::{FdInfo, FdTable};
use crate::remote_ptr::RemotePtr;

/// Per-tracee scratch-and-fd bookkeeping (§3 "Child Arena").
pub struct ChildArena {
    pub pid: Pid,
    pub scratch_addr: Option<RemotePtr<u8>>,
    pub scratch_len: usize,
    /// Set at entry by an open-family path-arg hook, consumed at the matching
    /// exit stop to finish FD Table bookkeeping (§4.D, §4.E).
    pub pending_open: Option<FdInfo>,
    /// Set at entry by the dup-family hook, consumed at the matching exit
    /// stop to clone the source fd's tracking info onto the new fd (§4.D).
    pub pending_dup_source: Option<FdInfo>,
    pub fd_table: FdTable,
}

impl ChildArena {
    pub fn new(pid: Pid) -> Self {
        ChildArena {
            pid,
            scratch_addr: None,
            scratch_len: 0,
            pending_open: None,
            pending_dup_source: None,
            fd_table: FdTable::new(),
        }
    }

    pub fn take_scratch(&mut self) -> Option<(RemotePtr<u8>, usize)> {
        let addr = self.scratch_addr.take()?;
        let len = self.scratch_len;
        self.scratch_len = 0;
        Some((addr, len))
    }

    pub fn set_scratch(&mut self, addr: RemotePtr<u8>, len: usize) {
        self.scratch_addr = Some(addr);
        self.scratch_len = len;
    }
}

/// Owns every live tracee's arena and spawns/attaches new ones. On a
/// fork/exec event reported by the ptrace substrate, `create` allocates a
/// fresh arena inheriting nothing from the parent (§4.H: "inheriting no
/// state from parent").
#[derive(Default)]
pub struct ChildLifecycleManager {
    arenas: HashMap<i32, Rc<RefCell<ChildArena>>>,
}

impl ChildLifecycleManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&mut self, pid: Pid) -> Rc<RefCell<ChildArena>> {
        log::debug!("creating child arena for pid {pid}");
        let arena = Rc::new(RefCell::new(ChildArena::new(pid)));
        self.arenas.insert(pid.as_raw(), arena.clone());
        arena
    }

    pub fn get(&self, pid: Pid) -> Option<Rc<RefCell<ChildArena>>> {
        self.arenas.get(&pid.as_raw()).cloned()
    }

    /// Releases the arena for an exited tracee, reporting any entries still
    /// open (the `FdTable`'s `Drop` impl does the reporting) and freeing any
    /// outstanding scratch allocation's bookkeeping (the memory itself died
    /// with the tracee's address space, there is nothing left to `munmap`).
    pub fn destroy(&mut self, pid: Pid) {
        if let Some(arena) = self.arenas.remove(&pid.as_raw()) {
            let arena = arena.borrow();
            if arena.scratch_addr.is_some() {
                log::warn!(
                    "pid {pid} exited with an outstanding scratch allocation; address space is gone, nothing to free"
                );
            }
        } else {
            log::debug!("destroy called for untracked pid {pid}");
        }
    }

    pub fn is_empty(&self) -> bool {
        self.arenas.is_empty()
    }

    pub fn len(&self) -> usize {
        self.arenas.len()
    }
}

/// Forks and execs `program` with `args` under ptrace, stopping the child at
/// its first instruction via `PTRACE_TRACEME` + `SIGSTOP`-like exec-trap
/// convention, returning once the tracer has observed the initial
/// post-execve stop. This is how the supervisor launches the real `/init`.
///
/// # Safety
/// Uses `fork()`; the child branch only calls async-signal-safe functions
/// before `execvp`, per the usual fork-then-exec discipline.
pub fn spawn_traced(program: &std::ffi::CStr, args: &[&std::ffi::CStr]) -> Result<Pid> {
    match unsafe { fork() }? {
        ForkResult::Child => {
            ptrace::traceme().expect("PTRACE_TRACEME failed in child");
            nix::sys::signal::raise(Signal::SIGSTOP).expect("raise(SIGSTOP) failed in child");
            let _ = nix::unistd::execvp(program, args);
            // execvp only returns on failure; the child has no sensible
            // fallback path, so it exits rather than returning into the
            // supervisor's code with a half-initialized process image.
            std::process::exit(127);
        }
        ForkResult::Parent { child } => {
            waitpid(child, None)?;
            ptrace::setoptions(
                child,
                ptrace::Options::PTRACE_O_TRACESYSGOOD
                    | ptrace::Options::PTRACE_O_TRACEFORK
                    | ptrace::Options::PTRACE_O_TRACEVFORK
                    | ptrace::Options::PTRACE_O_TRACECLONE
                    | ptrace::Options::PTRACE_O_TRACEEXEC
                    | ptrace::Options::PTRACE_O_TRACEEXIT,
            )?;
            Ok(child)
        }
    }
}

/// Holds the pid of the most recent SIGUSR1 attach-on-demand request, or -1
/// if none is pending. Written only from the signal handler, drained only
/// from normal (non-signal) context — both sides use plain atomic loads/
/// stores, which are async-signal-safe.
static PENDING_ATTACH_PID: AtomicI32 = AtomicI32::new(-1);

/// `extern "C"` SIGUSR1 handler for §4.H "attach on demand": a helper process
/// not already under ptrace raises SIGUSR1 at the supervisor, with `si_pid`
/// naming itself, to request the supervisor attach to it. Only records the
/// pid; the actual `PTRACE_ATTACH` happens in `poll_attach_requests`, from
/// normal context, since `ptrace` itself is not async-signal-safe.
extern "C" fn sigusr1_handler(_signum: libc::c_int, info: *mut libc::siginfo_t, _ctx: *mut libc::c_void) {
    if info.is_null() {
        return;
    }
    let pid = unsafe { (*info).si_pid() };
    PENDING_ATTACH_PID.store(pid, Ordering::SeqCst);
}

/// Installs the SIGUSR1 handler. Deliberately does not set `SA_RESTART`: the
/// event loop's blocking `waitpid` call must return `EINTR` so
/// `poll_attach_requests` gets a chance to run between wait calls.
pub fn install_attach_on_demand_handler() -> Result<()> {
    let action = SigAction::new(
        SigHandler::SigAction(sigusr1_handler),
        SaFlags::empty(),
        SigSet::empty(),
    );
    unsafe { signal::sigaction(Signal::SIGUSR1, &action)? };
    Ok(())
}

/// Drains any pending SIGUSR1 attach request, attaching to and registering an
/// arena for the signaling pid. Called from the event loop whenever `waitpid`
/// returns `EINTR` (§4.H scenario 6: "Reattach via SIGUSR1").
pub fn poll_attach_requests(children: &mut ChildLifecycleManager) {
    let raw = PENDING_ATTACH_PID.swap(-1, Ordering::SeqCst);
    if raw <= 0 {
        return;
    }
    let pid = Pid::from_raw(raw);
    log::info!("attach-on-demand request from pid {pid}");
    match ptrace::attach(pid) {
        Ok(()) => {
            children.create(pid);
        }
        Err(err) => {
            log::warn!("PTRACE_ATTACH for pid {pid} failed: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poll_attach_requests_is_noop_when_nothing_pending() {
        let mut mgr = ChildLifecycleManager::new();
        poll_attach_requests(&mut mgr);
        assert!(mgr.is_empty());
    }

    #[test]
    fn create_then_get_round_trips() {
        let mut mgr = ChildLifecycleManager::new();
        let pid = Pid::from_raw(1234);
        mgr.create(pid);
        assert!(mgr.get(pid).is_some());
        assert_eq!(mgr.len(), 1);
    }

    #[test]
    fn destroy_removes_arena() {
        let mut mgr = ChildLifecycleManager::new();
        let pid = Pid::from_raw(1234);
        mgr.create(pid);
        mgr.destroy(pid);
        assert!(mgr.get(pid).is_none());
        assert!(mgr.is_empty());
    }

    #[test]
    fn scratch_set_then_take_round_trips() {
        let mut arena = ChildArena::new(Pid::from_raw(1));
        arena.set_scratch(RemotePtr::new(0x7000), 128);
        let (addr, len) = arena.take_scratch().unwrap();
        assert_eq!(addr.as_usize(), 0x7000);
        assert_eq!(len, 128);
        assert!(arena.take_scratch().is_none());
    }
}

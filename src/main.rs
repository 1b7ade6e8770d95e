//! Entry point: parses the kernel command line, builds the Module
//! Descriptor Table, drives the Supervisor State Machine through its
//! stages, then launches the real `/init` under ptrace and runs the
//! single-threaded event loop that dispatches syscall stops to the Syscall
//! Rewriter.

mod child;
mod config;
mod error;
mod fd_table;
mod fstab;
mod format_detector;
mod helper;
mod hooks;
mod kernel_abi;
mod klog;
mod path_resolver;
mod registers;
mod remote_mem;
mod remote_ptr;
mod supervisor;
mod sysfs;
mod target;
mod wait_status;

use std::ffi::{CStr, CString};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use nix::unistd::Pid;

use crate::child::ChildLifecycleManager;
use crate::config::Config;
use crate::error::Result;
use crate::hooks::{EntryOutcome, ResolvedHook};
use crate::registers::Registers;
use crate::supervisor::{ModuleDescriptor, SupervisorState};
use crate::wait_status::WaitStatus;

/// A ptrace-based syscall redirection supervisor for an Android multiboot
/// slot. Invoked in place of `/init` by the initramfs; re-execs the real
/// `/init` under tracing once the fstab and target registry are ready.
#[derive(Parser, Debug)]
#[command(name = "multiboot-hijack")]
struct Cli {
    /// Path to the real init binary to launch under tracing.
    #[arg(default_value = "/init.real")]
    init_path: PathBuf,

    /// Arguments to forward to the real init.
    #[arg(trailing_var_arg = true)]
    init_args: Vec<String>,

    /// Override the multiboot fstab path (defaults to /fstab.multiboot).
    #[arg(long, default_value = "/fstab.multiboot")]
    fstab: PathBuf,

    /// Read cmdline from this file instead of /proc/cmdline (test/debug aid).
    #[arg(long)]
    cmdline_override: Option<PathBuf>,
}

fn module_table() -> Vec<ModuleDescriptor> {
    let mut fstab_module = ModuleDescriptor::new("fstab-target-registry");
    fstab_module.fstab_init = Some(fstab_module_init);

    let mut fs_redirect = ModuleDescriptor::new("fs-redirection");
    fs_redirect.hooks_init = Some(|_state| Ok(()));
    fs_redirect.hook_mount = Some(hooks::handle_mount_entry);

    let mut fd_lifecycle = ModuleDescriptor::new("fd-lifecycle-format-detection");
    fd_lifecycle.hooks_init = Some(|_state| Ok(()));
    fd_lifecycle.child_create = Some(|_state, pid| log::debug!("fd lifecycle tracking started for pid {pid}"));
    fd_lifecycle.child_destroy = Some(|_state, pid| log::debug!("fd lifecycle tracking ended for pid {pid}"));

    vec![fstab_module, fs_redirect, fd_lifecycle]
}

/// Size of a freshly provisioned stub backing image, in 512-byte blocks
/// (64 MiB): big enough to hold an ext4 superblock and journal for format
/// detection, small enough to provision quickly at early boot.
const STUB_IMAGE_BLOCKS: u64 = 131_072;

/// Loop device numbers 250+ are reserved for multiboot stub devices, matching
/// the convention already used elsewhere in this crate's test fixtures.
const STUB_LOOP_BASE: usize = 250;

/// Creates the backing raw image and loop device node for a stub device, so
/// path-arg syscalls redirected to it hit a real, formatted block device
/// rather than a dangling path (§1 "loop-device node creation", §3 stub
/// device invariant). Failures are logged and non-fatal: a missing stub
/// device degrades format detection for that Target, it doesn't affect
/// whether the Target's data is correctly served.
fn provision_stub_device(image_path: &std::path::Path, loop_device: &std::path::Path) {
    if let Err(err) = helper::dd_create_image(image_path, STUB_IMAGE_BLOCKS) {
        log::warn!("failed to create stub image {}: {err}", image_path.display());
        return;
    }
    if let Err(err) = helper::mkfs_ext4(image_path) {
        log::warn!("failed to format stub image {}: {err}", image_path.display());
        return;
    }
    if let Err(err) = helper::losetup_attach(loop_device, image_path, false) {
        log::warn!(
            "failed to attach {} to {}: {err}",
            loop_device.display(),
            image_path.display()
        );
    }
}

/// Populates the Target Registry from the multiboot fstab (§4.J order: this
/// module runs first). Entries flagged `multiboot` become Targets; the
/// concrete bind-vs-loop policy decision and block-device resolution are
/// driven by the on-disk slot layout, resolved here against the sysfs
/// block-device inventory.
fn fstab_module_init(state: &mut SupervisorState) -> Result<()> {
    let fstab_path = std::env::var("MULTIBOOT_FSTAB_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/fstab.multiboot"));

    let records = match fstab::read_fstab(&fstab_path) {
        Ok(records) => records,
        Err(err) => {
            log::warn!("could not read {}: {err}, multiboot disabled", fstab_path.display());
            return Ok(());
        }
    };

    let uevents = sysfs::enumerate_block_devices().unwrap_or_default();

    for record in records.iter().filter(|r| r.is_multiboot()) {
        let canonical = sysfs::find_for_path(&uevents, &record.blk_device)
            .and_then(|u| u.devname.as_ref())
            .map(|name| PathBuf::from(format!("/dev/block/{name}")))
            .unwrap_or_else(|| record.blk_device.clone());

        let rdev = std::fs::metadata(&canonical).ok().map(|m| {
            use std::os::unix::fs::MetadataExt;
            m.rdev()
        });

        let relative_mount = record
            .mount_point
            .strip_prefix("/")
            .unwrap_or(&record.mount_point);
        let slot_source_dir = state.slot_path.join(relative_mount);

        let loop_device = PathBuf::from(format!(
            "/dev/block/loop{}",
            STUB_LOOP_BASE + state.registry.len()
        ));
        let stub_image = state
            .slot_path
            .join(".stub-images")
            .join(format!("loop{}.img", STUB_LOOP_BASE + state.registry.len()));
        if let Some(parent) = stub_image.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        provision_stub_device(&stub_image, &loop_device);

        let policy = target::TargetPolicy::BindMount {
            source_dir: slot_source_dir,
            stub_device: loop_device,
        };

        let entry = target::TargetEntry {
            identity: target::DeviceIdentity {
                blk_device: canonical,
                rdev,
            },
            fs_type: record.fs_type.clone(),
            policy,
            mount_point: PathBuf::from(&record.mount_point),
        };

        if let Err(err) = state.registry.register(entry) {
            log::warn!("skipping duplicate target registration: {err}");
        }
    }

    Ok(())
}

/// Native numeric ids for the fd-lifecycle family, resolved once rather than
/// compared by name on every syscall stop. `dup2` is `None` on architectures
/// (aarch64) whose rationalized ABI dropped it in favor of `dup3`.
struct FdLifecycleSyscalls {
    close: i64,
    dup: i64,
    dup3: i64,
    dup2: Option<i64>,
    fcntl: i64,
}

impl FdLifecycleSyscalls {
    fn resolve() -> Self {
        FdLifecycleSyscalls {
            close: kernel_abi::resolve("close").map(|n| n.0).unwrap_or(-1),
            dup: kernel_abi::resolve("dup").map(|n| n.0).unwrap_or(-1),
            dup3: kernel_abi::resolve("dup3").map(|n| n.0).unwrap_or(-1),
            dup2: kernel_abi::resolve("dup2").map(|n| n.0),
            fcntl: kernel_abi::resolve("fcntl").map(|n| n.0).unwrap_or(-1),
        }
    }
}

fn run_event_loop(
    pid: Pid,
    state: &mut SupervisorState,
    hook_table: &[ResolvedHook],
    modules: &[ModuleDescriptor],
    children: &mut ChildLifecycleManager,
) -> Result<()> {
    children.create(pid);
    supervisor::dispatch_child_create(modules, state, pid);
    let fd_nrs = FdLifecycleSyscalls::resolve();
    let mut in_syscall: std::collections::HashSet<i32> = std::collections::HashSet::new();
    // Tids mid-flight on a dup-family syscall, so the exit stop knows to
    // invoke `handle_dup_exit` without re-inspecting entry-stop arguments.
    let mut pending_dup_tids: std::collections::HashSet<i32> = std::collections::HashSet::new();

    loop {
        let mut raw_status: i32 = 0;
        // `waitpid(2)` with `__WALL` rather than `nix::sys::wait::waitpid`:
        // nix's wrapper doesn't expose `__WALL`, which the supervisor needs
        // to observe tracee threads regardless of which thread group
        // spawned them (ptrace attaches can cross thread-group boundaries
        // via clone/fork events).
        let tid_raw = unsafe { libc::waitpid(-1, &mut raw_status, libc::__WALL) };
        if tid_raw < 0 {
            let errno = nix::errno::Errno::last();
            if errno == nix::errno::Errno::ECHILD {
                break;
            }
            if errno == nix::errno::Errno::EINTR {
                // Not a wait result at all: either the SIGUSR1 attach-on-
                // demand handler fired (§4.H scenario 6), or an unrelated
                // signal hit the supervisor itself. Either way, drain any
                // pending attach request and keep waiting.
                child::poll_attach_requests(children);
                continue;
            }
            return Err(errno.into());
        }
        let tid = Pid::from_raw(tid_raw);
        let status = WaitStatus::new(raw_status);

        if status.exited() {
            log::info!("pid {tid} exited with status {}", status.exit_status().unwrap_or(-1));
            supervisor::dispatch_child_destroy(modules, state, tid);
            children.destroy(tid);
            in_syscall.remove(&tid.as_raw());
            pending_dup_tids.remove(&tid.as_raw());
            if children.is_empty() {
                break;
            }
            continue;
        }
        if status.signaled() {
            log::info!("pid {tid} killed by signal {}", status.term_signal().unwrap_or(0));
            supervisor::dispatch_child_destroy(modules, state, tid);
            children.destroy(tid);
            in_syscall.remove(&tid.as_raw());
            pending_dup_tids.remove(&tid.as_raw());
            if children.is_empty() {
                break;
            }
            continue;
        }
        if let Some(event) = status.ptrace_event() {
            if event == libc::PTRACE_EVENT_FORK
                || event == libc::PTRACE_EVENT_VFORK
                || event == libc::PTRACE_EVENT_CLONE
            {
                if let Ok(new_pid) = nix::sys::ptrace::getevent(tid).map(|p| Pid::from_raw(p as i32)) {
                    children.create(new_pid);
                    supervisor::dispatch_child_create(modules, state, new_pid);
                }
            }
            nix::sys::ptrace::syscall(tid, None).ok();
            continue;
        }
        if status.stopped() && !status.is_syscall_stop() {
            // A genuine signal-delivery stop, not a syscall boundary:
            // forward the signal and keep going.
            let sig = status.stop_signal().and_then(|s| nix::sys::signal::Signal::try_from(s).ok());
            nix::sys::ptrace::cont(tid, sig).ok();
            continue;
        }

        let is_entry = in_syscall.insert(tid.as_raw());
        let arena = match children.get(tid) {
            Some(a) => a,
            None => children.create(tid),
        };
        let mut regs = match Registers::read(tid) {
            Ok(r) => r,
            Err(_) => {
                nix::sys::ptrace::syscall(tid, None).ok();
                continue;
            }
        };

        if is_entry {
            let nr = regs.syscall_nr() as i64;
            let mut arena_ref = arena.borrow_mut();
            let outcome = if nr == libc::SYS_mount {
                supervisor::dispatch_mount_hook(modules, tid, state, &mut arena_ref, &mut regs)
            } else if nr == fd_nrs.close {
                hooks::handle_close_entry(&mut arena_ref, regs.arg(0) as i32);
                EntryOutcome::Unchanged
            } else if nr == fd_nrs.dup || nr == fd_nrs.dup3 || Some(nr) == fd_nrs.dup2 {
                hooks::handle_dup_entry(&mut arena_ref, regs.arg(0) as i32);
                pending_dup_tids.insert(tid.as_raw());
                EntryOutcome::Unchanged
            } else if nr == fd_nrs.fcntl {
                match hooks::handle_fcntl_entry(&arena_ref, regs.arg(0) as i32, regs.arg(1) as i32) {
                    Ok(()) => EntryOutcome::Unchanged,
                    Err(err) => EntryOutcome::Fatal(err),
                }
            } else if let Some(hook) = hooks::find_hook(hook_table, nr) {
                hooks::handle_path_arg_entry(tid, state, &mut arena_ref, hook, &mut regs)
            } else {
                EntryOutcome::Unchanged
            };
            if let EntryOutcome::Fatal(err) = outcome {
                log::error!("fatal hook error for pid {tid}: {err}");
                nix::sys::ptrace::kill(tid).ok();
                supervisor::dispatch_child_destroy(modules, state, tid);
                children.destroy(tid);
                in_syscall.remove(&tid.as_raw());
                pending_dup_tids.remove(&tid.as_raw());
            }
        } else {
            in_syscall.remove(&tid.as_raw());
            let mut arena_ref = arena.borrow_mut();
            if pending_dup_tids.remove(&tid.as_raw()) {
                let result = regs.syscall_result();
                hooks::handle_dup_exit(&mut arena_ref, result as i32, result >= 0);
            }
            if let Err(err) = hooks::handle_exit(tid, &mut arena_ref, &regs) {
                log::warn!("exit-stop processing failed for pid {tid}: {err}");
            }
        }

        nix::sys::ptrace::syscall(tid, None).ok();
    }

    Ok(())
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.cmdline_override {
        Some(path) => {
            let raw = std::fs::read_to_string(path)?;
            Config::from_cmdline_str(&raw)
        }
        None => Config::from_proc_cmdline().unwrap_or_default(),
    };

    klog::init(config.debug_level);
    log::info!("multiboot supervisor starting, multiboot_enabled={}", config.multiboot_enabled());

    if !config.multiboot_enabled() {
        log::info!("multiboot disabled by cmdline, execing real init directly");
        return exec_init_untraced(&cli.init_path, &cli.init_args);
    }

    std::env::set_var("MULTIBOOT_FSTAB_PATH", &cli.fstab);

    let slot_path = config
        .multiboot_source
        .as_ref()
        .map(|m| PathBuf::from("/data/multiboot").join(m.subpath.trim_start_matches('/')))
        .unwrap_or_else(|| PathBuf::from("/data/multiboot/default"));

    let mut state = SupervisorState::new(slot_path, true, config.second_stage_enabled);
    let modules = module_table();

    if let Err(err) = supervisor::early_init(&modules, &mut state) {
        log::error!("early_init failed: {err}, falling back to untraced init");
        return exec_init_untraced(&cli.init_path, &cli.init_args);
    }
    if let Err(err) = supervisor::fstab_init(&modules, &mut state) {
        log::error!("fstab_init failed: {err}, falling back to untraced init");
        return exec_init_untraced(&cli.init_path, &cli.init_args);
    }
    if let Err(err) = supervisor::hooks_init(&modules, &mut state) {
        log::error!("hooks_init failed: {err}, falling back to untraced init");
        return exec_init_untraced(&cli.init_path, &cli.init_args);
    }

    let hook_table = hooks::build_hook_table();

    if let Err(err) = child::install_attach_on_demand_handler() {
        log::warn!("failed to install SIGUSR1 attach-on-demand handler: {err}");
    }

    let program = to_cstring(&cli.init_path);
    let mut argv_owned: Vec<CString> = vec![program.clone()];
    argv_owned.extend(cli.init_args.iter().map(|a| CString::new(a.as_str()).unwrap()));
    let argv_refs: Vec<&CStr> = argv_owned.iter().map(|c| c.as_c_str()).collect();

    let pid = child::spawn_traced(&program, &argv_refs)?;
    nix::sys::ptrace::syscall(pid, None).ok();

    let mut children = ChildLifecycleManager::new();
    run_event_loop(pid, &mut state, &hook_table, &modules, &mut children)
}

fn to_cstring(path: &std::path::Path) -> CString {
    use std::os::unix::ffi::OsStrExt;
    CString::new(path.as_os_str().as_bytes()).expect("path contains a NUL byte")
}

fn exec_init_untraced(path: &std::path::Path, args: &[String]) -> Result<()> {
    let program = to_cstring(path);
    let mut argv_owned: Vec<CString> = vec![program.clone()];
    argv_owned.extend(args.iter().map(|a| CString::new(a.as_str()).unwrap()));
    let argv_refs: Vec<&CStr> = argv_owned.iter().map(|c| c.as_c_str()).collect();
    nix::unistd::execvp(&program, &argv_refs)?;
    unreachable!("execvp only returns on failure, which is mapped to an Err above");
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("multiboot-hijack: fatal: {err}");
            ExitCode::FAILURE
        }
    }
}

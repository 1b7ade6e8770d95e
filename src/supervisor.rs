//! Supervisor State Machine (§3, §4.G) and Module Descriptor Table (§4.J).

use std::path::PathBuf;

use nix::unistd::Pid;

use crate::child::ChildArena;
use crate::error::{Result, SupervisorError};
use crate::hooks::EntryOutcome;
use crate::registers::Registers;
use crate::target::TargetRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    None,
    Early,
    FstabLoaded,
    HooksLive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootMode {
    Recovery,
    Normal,
}

impl BootMode {
    /// Derived from the presence of a recovery binary, matching
    /// `system_is_recovery()` in the system this crate reimplements.
    pub fn detect() -> BootMode {
        if std::path::Path::new("/sbin/recovery").exists() {
            BootMode::Recovery
        } else {
            BootMode::Normal
        }
    }
}

pub struct SupervisorState {
    stage: Stage,
    pub boot_mode: BootMode,
    pub slot_path: PathBuf,
    pub multiboot_enabled: bool,
    pub sndstage_enabled: bool,
    pub registry: TargetRegistry,
}

impl SupervisorState {
    pub fn new(slot_path: PathBuf, multiboot_enabled: bool, sndstage_enabled: bool) -> Self {
        SupervisorState {
            stage: Stage::None,
            boot_mode: BootMode::detect(),
            slot_path,
            multiboot_enabled,
            sndstage_enabled,
            registry: TargetRegistry::new(),
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Stage transitions are monotonic (§8 invariant): attempting to move to
    /// a stage that isn't strictly later than the current one is a logic
    /// error in the caller, not a recoverable condition.
    pub fn advance_to(&mut self, next: Stage) {
        assert!(
            next > self.stage,
            "stage transitions must be monotonic: {:?} -> {:?}",
            self.stage,
            next
        );
        log::info!("supervisor stage {:?} -> {:?}", self.stage, next);
        if next >= Stage::FstabLoaded {
            self.registry.freeze();
        }
        self.stage = next;
    }

    pub fn hooks_live(&self) -> bool {
        self.stage == Stage::HooksLive
    }
}

/// An explicit, data-driven replacement for the original's
/// constructor-registered plugin table (§9, §4.J): each descriptor names the
/// stage callbacks one logical subsystem participates in.
pub struct ModuleDescriptor {
    pub name: &'static str,
    pub early_init: Option<fn(&mut SupervisorState) -> Result<()>>,
    pub fstab_init: Option<fn(&mut SupervisorState) -> Result<()>>,
    pub hooks_init: Option<fn(&mut SupervisorState) -> Result<()>>,
    /// Called once a new tracee's arena is created (§4.J, §9).
    pub child_create: Option<fn(&SupervisorState, Pid)>,
    /// Called just before a tracee's arena is torn down (§4.J, §9).
    pub child_destroy: Option<fn(&SupervisorState, Pid)>,
    /// Invoked by the Syscall Rewriter's mount hook (§4.J): "`hook_mount`
    /// callbacks are invoked... for every descriptor in order, stopping at
    /// the first one that claims the mount."
    pub hook_mount: Option<fn(Pid, &SupervisorState, &mut ChildArena, &mut Registers) -> EntryOutcome>,
}

impl ModuleDescriptor {
    pub const fn new(name: &'static str) -> Self {
        ModuleDescriptor {
            name,
            early_init: None,
            fstab_init: None,
            hooks_init: None,
            child_create: None,
            child_destroy: None,
            hook_mount: None,
        }
    }
}

/// Routes a mount-syscall entry stop through every descriptor's `hook_mount`
/// callback in order, stopping at the first one that claims the mount
/// (returns other than `EntryOutcome::Unchanged`), per §4.J.
pub fn dispatch_mount_hook(
    modules: &[ModuleDescriptor],
    pid: Pid,
    state: &SupervisorState,
    arena: &mut ChildArena,
    regs: &mut Registers,
) -> EntryOutcome {
    for module in modules {
        if let Some(callback) = module.hook_mount {
            match callback(pid, state, arena, regs) {
                EntryOutcome::Unchanged => continue,
                other => return other,
            }
        }
    }
    EntryOutcome::Unchanged
}

/// Notifies every descriptor with a `child_create` callback that a new
/// tracee's arena was created.
pub fn dispatch_child_create(modules: &[ModuleDescriptor], state: &SupervisorState, pid: Pid) {
    for module in modules {
        if let Some(callback) = module.child_create {
            callback(state, pid);
        }
    }
}

/// Notifies every descriptor with a `child_destroy` callback that a tracee's
/// arena is about to be torn down.
pub fn dispatch_child_destroy(modules: &[ModuleDescriptor], state: &SupervisorState, pid: Pid) {
    for module in modules {
        if let Some(callback) = module.child_destroy {
            callback(state, pid);
        }
    }
}

/// Drives an ordered list of module descriptors through one stage callback,
/// short-circuiting on the first error (mirroring `modules_call_*` in the
/// system this crate reimplements, but as explicit data).
pub fn run_stage(
    modules: &[ModuleDescriptor],
    state: &mut SupervisorState,
    select: impl Fn(&ModuleDescriptor) -> Option<fn(&mut SupervisorState) -> Result<()>>,
) -> Result<()> {
    for module in modules {
        if let Some(callback) = select(module) {
            log::debug!("running stage callback for module {}", module.name);
            callback(state).map_err(|err| {
                log::error!("module {} failed stage callback: {err}", module.name);
                err
            })?;
        }
    }
    Ok(())
}

pub fn early_init(modules: &[ModuleDescriptor], state: &mut SupervisorState) -> Result<()> {
    run_stage(modules, state, |m| m.early_init)?;
    state.advance_to(Stage::Early);
    Ok(())
}

pub fn fstab_init(modules: &[ModuleDescriptor], state: &mut SupervisorState) -> Result<()> {
    if state.stage() != Stage::Early {
        return Err(SupervisorError::StageTransition {
            reason: "fstab_init requires stage Early".into(),
        });
    }
    run_stage(modules, state, |m| m.fstab_init)?;
    state.advance_to(Stage::FstabLoaded);
    Ok(())
}

pub fn hooks_init(modules: &[ModuleDescriptor], state: &mut SupervisorState) -> Result<()> {
    if state.stage() != Stage::FstabLoaded {
        return Err(SupervisorError::StageTransition {
            reason: "hooks_init requires stage FstabLoaded".into(),
        });
    }
    run_stage(modules, state, |m| m.hooks_init)?;
    state.advance_to(Stage::HooksLive);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_transitions_are_monotonic() {
        let mut state = SupervisorState::new(PathBuf::from("/data/multiboot/slot1"), true, false);
        assert_eq!(state.stage(), Stage::None);
        state.advance_to(Stage::Early);
        state.advance_to(Stage::FstabLoaded);
        state.advance_to(Stage::HooksLive);
        assert!(state.hooks_live());
    }

    #[test]
    #[should_panic]
    fn backwards_transition_panics() {
        let mut state = SupervisorState::new(PathBuf::from("/x"), true, false);
        state.advance_to(Stage::FstabLoaded);
        state.advance_to(Stage::Early);
    }

    #[test]
    fn reaching_fstab_loaded_freezes_registry() {
        let mut state = SupervisorState::new(PathBuf::from("/x"), true, false);
        state.advance_to(Stage::Early);
        state.advance_to(Stage::FstabLoaded);
        assert!(state.registry.is_frozen());
    }

    #[test]
    fn module_descriptors_run_in_order() {
        static ORDER: std::sync::Mutex<Vec<&str>> = std::sync::Mutex::new(Vec::new());

        fn a(_s: &mut SupervisorState) -> Result<()> {
            ORDER.lock().unwrap().push("a");
            Ok(())
        }
        fn b(_s: &mut SupervisorState) -> Result<()> {
            ORDER.lock().unwrap().push("b");
            Ok(())
        }

        let mut first = ModuleDescriptor::new("first");
        first.early_init = Some(a);
        let mut second = ModuleDescriptor::new("second");
        second.early_init = Some(b);
        let modules = vec![first, second];

        let mut state = SupervisorState::new(PathBuf::from("/x"), true, false);
        early_init(&modules, &mut state).unwrap();
        assert_eq!(*ORDER.lock().unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn stage_prerequisite_is_enforced() {
        let modules: Vec<ModuleDescriptor> = Vec::new();
        let mut state = SupervisorState::new(PathBuf::from("/x"), true, false);
        let err = fstab_init(&modules, &mut state).unwrap_err();
        assert!(matches!(err, SupervisorError::StageTransition { .. }));
    }

    #[test]
    fn hook_mount_dispatch_stops_at_first_claiming_descriptor() {
        fn unchanged(_p: Pid, _s: &SupervisorState, _a: &mut ChildArena, _r: &mut Registers) -> EntryOutcome {
            EntryOutcome::Unchanged
        }
        fn claims(_p: Pid, _s: &SupervisorState, _a: &mut ChildArena, _r: &mut Registers) -> EntryOutcome {
            EntryOutcome::Rewritten
        }

        let mut first = ModuleDescriptor::new("first");
        first.hook_mount = Some(unchanged);
        let mut second = ModuleDescriptor::new("second");
        second.hook_mount = Some(claims);
        let modules = vec![first, second];

        let state = SupervisorState::new(PathBuf::from("/x"), true, false);
        let mut arena = ChildArena::new(Pid::from_raw(1));
        let mut regs = Registers::default();
        let outcome = dispatch_mount_hook(&modules, Pid::from_raw(1), &state, &mut arena, &mut regs);
        assert!(matches!(outcome, EntryOutcome::Rewritten));
    }
}

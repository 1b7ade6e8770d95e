//! Tracee register access (§4.C, §4.D). Grounded on the teacher's
//! `Registers` type, pared down to the native ABI only: the Hook Spec is
//! resolved for the supervisor's own architecture, there is no 32-on-64
//! cross-arch tracee to translate, so we wrap `libc::user_regs_struct`
//! directly rather than the teacher's X86/X64 tagged union.

use nix::sys::ptrace;
use nix::unistd::Pid;

use crate::error::Result;

#[cfg(target_arch = "x86_64")]
mod arch {
    pub fn syscall_nr(regs: &libc::user_regs_struct) -> u64 {
        regs.orig_rax
    }
    pub fn set_syscall_nr(regs: &mut libc::user_regs_struct, nr: u64) {
        regs.orig_rax = nr;
    }
    pub fn arg(regs: &libc::user_regs_struct, i: usize) -> u64 {
        match i {
            0 => regs.rdi,
            1 => regs.rsi,
            2 => regs.rdx,
            3 => regs.r10,
            4 => regs.r8,
            5 => regs.r9,
            _ => panic!("syscall arg index out of range: {i}"),
        }
    }
    pub fn set_arg(regs: &mut libc::user_regs_struct, i: usize, val: u64) {
        match i {
            0 => regs.rdi = val,
            1 => regs.rsi = val,
            2 => regs.rdx = val,
            3 => regs.r10 = val,
            4 => regs.r8 = val,
            5 => regs.r9 = val,
            _ => panic!("syscall arg index out of range: {i}"),
        }
    }
    pub fn ret(regs: &libc::user_regs_struct) -> i64 {
        regs.rax as i64
    }
    pub fn set_ret(regs: &mut libc::user_regs_struct, val: i64) {
        regs.rax = val as u64;
    }
    pub fn ip(regs: &libc::user_regs_struct) -> u64 {
        regs.rip
    }
    pub fn set_ip(regs: &mut libc::user_regs_struct, val: u64) {
        regs.rip = val;
    }
    pub fn sp(regs: &libc::user_regs_struct) -> u64 {
        regs.rsp
    }
}

#[cfg(target_arch = "aarch64")]
mod arch {
    pub fn syscall_nr(regs: &libc::user_regs_struct) -> u64 {
        regs.regs[8]
    }
    pub fn set_syscall_nr(regs: &mut libc::user_regs_struct, nr: u64) {
        regs.regs[8] = nr;
    }
    pub fn arg(regs: &libc::user_regs_struct, i: usize) -> u64 {
        assert!(i < 6, "syscall arg index out of range: {i}");
        regs.regs[i]
    }
    pub fn set_arg(regs: &mut libc::user_regs_struct, i: usize, val: u64) {
        assert!(i < 6, "syscall arg index out of range: {i}");
        regs.regs[i] = val;
    }
    pub fn ret(regs: &libc::user_regs_struct) -> i64 {
        regs.regs[0] as i64
    }
    pub fn set_ret(regs: &mut libc::user_regs_struct, val: i64) {
        regs.regs[0] = val as u64;
    }
    pub fn ip(regs: &libc::user_regs_struct) -> u64 {
        regs.pc
    }
    pub fn set_ip(regs: &mut libc::user_regs_struct, val: u64) {
        regs.pc = val;
    }
    pub fn sp(regs: &libc::user_regs_struct) -> u64 {
        regs.sp
    }
}

/// Snapshot of a tracee's general-purpose registers at a ptrace stop. Mutate
/// and then call `Task::set_regs` (in `hooks.rs`) to write the change back —
/// this type itself never touches the tracee.
#[derive(Clone)]
pub struct Registers {
    inner: libc::user_regs_struct,
}

impl Default for Registers {
    fn default() -> Self {
        Registers {
            inner: unsafe { std::mem::zeroed() },
        }
    }
}

impl Registers {
    pub fn read(pid: Pid) -> Result<Registers> {
        let inner = ptrace::getregs(pid)?;
        Ok(Registers { inner })
    }

    pub fn write(&self, pid: Pid) -> Result<()> {
        ptrace::setregs(pid, self.inner)?;
        Ok(())
    }

    pub fn syscall_nr(&self) -> u64 {
        arch::syscall_nr(&self.inner)
    }

    pub fn set_syscall_nr(&mut self, nr: u64) {
        arch::set_syscall_nr(&mut self.inner, nr);
    }

    /// Zero-indexed syscall argument (0..=5).
    pub fn arg(&self, i: usize) -> u64 {
        arch::arg(&self.inner, i)
    }

    pub fn set_arg(&mut self, i: usize, val: u64) {
        arch::set_arg(&mut self.inner, i, val);
    }

    pub fn syscall_result(&self) -> i64 {
        arch::ret(&self.inner)
    }

    pub fn set_syscall_result(&mut self, val: i64) {
        arch::set_ret(&mut self.inner, val);
    }

    pub fn ip(&self) -> u64 {
        arch::ip(&self.inner)
    }

    pub fn set_ip(&mut self, val: u64) {
        arch::set_ip(&mut self.inner, val);
    }

    pub fn sp(&self) -> u64 {
        arch::sp(&self.inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zeroed() -> libc::user_regs_struct {
        unsafe { std::mem::zeroed() }
    }

    #[test]
    fn arg_roundtrips_through_setter() {
        let mut regs = Registers { inner: zeroed() };
        regs.set_arg(0, 42);
        regs.set_arg(3, 7);
        assert_eq!(regs.arg(0), 42);
        assert_eq!(regs.arg(3), 7);
    }

    #[test]
    fn syscall_nr_roundtrips() {
        let mut regs = Registers { inner: zeroed() };
        regs.set_syscall_nr(libc::SYS_openat as u64);
        assert_eq!(regs.syscall_nr(), libc::SYS_openat as u64);
    }

    #[test]
    fn syscall_result_roundtrips_negative() {
        let mut regs = Registers { inner: zeroed() };
        regs.set_syscall_result(-2);
        assert_eq!(regs.syscall_result(), -2);
    }
}

//! Saved processor state of an interrupted environment.
use crate::x86_64::{selector, PrivilegeLevel, Rflags, GD_UD, GD_UT};

/// X86_64 general purpose registers
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GeneralPurposeRegisters {
    // callee-preserved.
    pub r15: usize,
    // callee-preserved.
    pub r14: usize,
    // callee-preserved.
    pub r13: usize,
    // callee-preserved.
    pub r12: usize,
    pub r11: usize,
    pub r10: usize,
    pub r9: usize,
    pub r8: usize,
    pub rsi: usize,
    pub rdi: usize,
    // callee-preserved.
    pub rbp: usize,
    pub rdx: usize,
    pub rcx: usize,
    // callee-preserved.
    pub rbx: usize,
    pub rax: usize,
}

/// Everything needed to resume an environment where it stopped.
///
/// For a process this is the frame popped on the way back to ring 3. For a
/// guest the general purpose registers are swapped around VM entry/exit by
/// the platform, while `rip`, `rsp` and `rflags` mirror the control
/// structure's guest-state area between exits.
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Trapframe {
    pub regs: GeneralPurposeRegisters,
    pub es: u16,
    pub ds: u16,
    pub trapno: u64,
    pub err: u64,
    pub rip: usize,
    pub cs: u16,
    pub rflags: Rflags,
    pub rsp: usize,
    pub ss: u16,
}

impl Default for Trapframe {
    fn default() -> Self {
        Self {
            regs: GeneralPurposeRegisters::default(),
            es: 0,
            ds: 0,
            trapno: 0,
            err: 0,
            rip: 0,
            cs: 0,
            rflags: Rflags::empty(),
            rsp: 0,
            ss: 0,
        }
    }
}

impl Trapframe {
    /// Frame for a fresh ring 3 process that will start at `rip` with the
    /// stack pointer at `rsp`.
    #[inline]
    pub fn new_user(rip: usize, rsp: usize) -> Self {
        let data = selector(GD_UD, PrivilegeLevel::Ring3);
        Self {
            es: data,
            ds: data,
            ss: data,
            cs: selector(GD_UT, PrivilegeLevel::Ring3),
            rflags: Rflags::IF,
            rip,
            rsp,
            ..Default::default()
        }
    }
}

impl core::fmt::Debug for Trapframe {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> Result<(), core::fmt::Error> {
        writeln!(
            f,
            "RAX: {:016x} | RBX: {:016x}  | RCX: {:016x} | RDX: {:016x}\n\
             RSI: {:016x} | RDI: {:016x}  | RBP: {:016x} | RSP: {:016x}\n\
             R8 : {:016x} | R9 : {:016x}  | R10: {:016x} | R11: {:016x}\n\
             R12: {:016x} | R13: {:016x}  | R14: {:016x} | R15: {:016x}\n\
             RIP: {:016x} | RFLAGS: {:016x} [{:?}]\n\
             CS : {:#x} | SS : {:#x} | DS : {:#x} | ES : {:#x}",
            self.regs.rax,
            self.regs.rbx,
            self.regs.rcx,
            self.regs.rdx,
            self.regs.rsi,
            self.regs.rdi,
            self.regs.rbp,
            self.rsp,
            self.regs.r8,
            self.regs.r9,
            self.regs.r10,
            self.regs.r11,
            self.regs.r12,
            self.regs.r13,
            self.regs.r14,
            self.regs.r15,
            self.rip,
            self.rflags.bits(),
            self.rflags,
            self.cs,
            self.ss,
            self.ds,
            self.es,
        )
    }
}

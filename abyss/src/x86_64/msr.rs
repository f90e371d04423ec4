//! Model-specific register (MSR) indices and bit layouts.

/// Extended feature enable register.
pub const IA32_EFER: u32 = 0xc000_0080;
/// Fs base.
pub const IA32_FS_BASE: u32 = 0xc000_0100;
/// Gs base.
pub const IA32_GS_BASE: u32 = 0xc000_0101;

bitflags::bitflags! {
    /// IA32_EFER.
    #[repr(transparent)]
    pub struct Efer: u64 {
        /// System call extensions.
        const SCE = 1 << 0;
        /// Long mode enable.
        const LME = 1 << 8;
        /// Long mode active.
        const LMA = 1 << 10;
        /// No-execute enable.
        const NXE = 1 << 11;
    }
}

/// One slot of a VM-entry/VM-exit MSR load or store area.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MsrEntry {
    pub msr_index: u32,
    pub _rsv: u32,
    pub msr_value: u64,
}

//! VM-execution, VM-entry and VM-exit control words.

bitflags::bitflags! {
    /// Primary processor-based VM-execution controls.
    pub struct VmcsProcBasedVmexecCtl: u32 {
        /// If this control is 1, a VM exit occurs at the beginning of any
        /// instruction if RFLAGS.IF = 1 and there are no other blocking of
        /// interrupts.
        const INTRWINEXIT = 1 << 2;
        /// HLT causes a VM exit.
        const HLT_EXITING = 1 << 7;
        /// Every I/O instruction causes a VM exit, unless the I/O bitmaps
        /// are in use.
        const UNCONDIOEXIT = 1 << 24;
        /// Consult the I/O bitmaps for I/O instructions.
        const USEIOBMP = 1 << 25;
        /// Consult the MSR bitmaps for RDMSR/WRMSR. Without them every
        /// access exits.
        const USEMSRBMP = 1 << 28;
        /// Use the secondary controls.
        const ACTIVATE_SECONDARY_CTL = 1 << 31;
    }
}

bitflags::bitflags! {
    /// Secondary processor-based VM-execution controls.
    pub struct VmcsProcBasedSecondaryVmexecCtl: u32 {
        /// Translate guest-physical addresses through the EPT.
        const ENABLE_EPT = 1 << 1;
        /// Allow the guest to run unpaged or in real mode.
        const UNRESTRICTED_GUEST = 1 << 7;
    }
}

bitflags::bitflags! {
    /// VM-entry controls.
    pub struct VmcsEntryCtl: u32 {
        /// The logical processor is in IA-32e mode after VM entry.
        const IA32E_MODE_GUEST = 1 << 9;
        /// Load IA32_EFER from the guest-state area.
        const LOAD_IA32_EFER = 1 << 15;
    }
}

bitflags::bitflags! {
    /// VM-exit controls.
    pub struct VmcsExitCtl: u32 {
        /// The host runs in 64-bit mode after VM exit.
        const HOST_ADDRESS_SPACE_SIZE = 1 << 9;
        /// Acknowledge the interrupt controller on external-interrupt exits
        /// so the vector is saved in the exit interruption info.
        const ACK_INTR_ON_EXIT = 1 << 15;
        /// Save guest IA32_EFER on VM exit.
        const SAVE_IA32_EFER = 1 << 20;
        /// Load host IA32_EFER on VM exit.
        const LOAD_IA32_EFER = 1 << 21;
    }
}

/// Valid bit of the interruption-information fields.
pub const INTR_INFO_VALID: u32 = 1 << 31;
/// Vector bits of the interruption-information fields.
pub const INTR_INFO_VECTOR_MASK: u32 = 0xff;

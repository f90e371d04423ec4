//! Capabilities the execution core calls but does not implement.
//!
//! A real kernel backs these with the frame allocator, inline assembly and
//! the local APIC. Host-side tests back them with [`crate::mock`].

use crate::{
    addressing::{Pa, Va},
    interrupt::{GeneralPurposeRegisters, Trapframe},
};

/// Output registers of the `cpuid` instruction.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CpuidResult {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
}

/// How a VMX instruction reported failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VmxFailure {
    /// VMfailInvalid: there is no current control structure.
    Invalid,
    /// VMfailValid: the reason is in the VM-instruction error field.
    Valid,
}

/// Reference-counted physical page frames.
///
/// A freshly allocated frame has a count of zero; the first owner takes a
/// reference with [`incref`]. A frame returns to the free pool when
/// [`decref`] drops its count to zero.
///
/// [`incref`]: PhysicalMemory::incref
/// [`decref`]: PhysicalMemory::decref
pub trait PhysicalMemory: Send + Sync {
    /// Allocate one frame, filled with zeros if `zeroed` is set.
    fn alloc_page(&self, zeroed: bool) -> Option<Pa>;
    /// Take one more reference on `pa`.
    fn incref(&self, pa: Pa);
    /// Drop a reference on `pa`, freeing the frame when none remain.
    fn decref(&self, pa: Pa);
    /// Current reference count of `pa`.
    fn refcount(&self, pa: Pa) -> usize;
    /// Kernel virtual address through which the frame at `pa` is reachable.
    fn kva(&self, pa: Pa) -> Va;
}

/// Per-processor hardware operations.
pub trait HardwareContext: Send + Sync {
    /// Index of the executing processor, below [`crate::MAX_CPU`].
    fn cpu_id(&self) -> usize;

    /// Entry of the boot root table that maps the kernel half. Every
    /// environment root carries a copy of it.
    fn kernel_root_entry(&self) -> u64;

    /// Host frame backing the VGA text buffer.
    fn vga_buffer(&self) -> Pa;

    /// Install `root` as the active address space.
    fn load_address_space(&self, root: Pa);

    /// Switch back to the boot address space.
    fn load_kernel_address_space(&self);

    /// Execute `cpuid` with `leaf` in eax and `subleaf` in ecx.
    fn cpuid(&self, leaf: u32, subleaf: u32) -> CpuidResult;

    /// Signal end-of-interrupt to the local interrupt controller.
    fn lapic_eoi(&self);

    /// Revision identifier that must head every control structure.
    fn vmcs_revision(&self) -> u32;

    /// Make the control structure at `vmcs` current on this processor.
    fn vmptrld(&self, vmcs: Pa) -> Result<(), VmxFailure>;

    /// Read a field of the current control structure.
    fn vmread(&self, field: u32) -> Result<u64, VmxFailure>;

    /// Write a field of the current control structure.
    fn vmwrite(&self, field: u32, value: u64) -> Result<(), VmxFailure>;

    /// Pop `frame` and drop to ring 3.
    ///
    /// # Safety
    /// The address space of the owner of `frame` must be active.
    unsafe fn enter_user(&self, frame: &Trapframe) -> !;

    /// Launch or resume the current control structure with `gprs` loaded.
    /// On the next exit the platform stores the guest registers back into
    /// `gprs` and calls into the kernel's exit entry.
    ///
    /// # Safety
    /// `gprs` must stay valid until the exit stores into it.
    unsafe fn vm_enter(&self, gprs: *mut GeneralPurposeRegisters, launched: bool) -> !;
}

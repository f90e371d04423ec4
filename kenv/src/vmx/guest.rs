//! Per-guest virtualization resources.
//!
//! A guest owns four frames besides its EPT: the control structure, one
//! MSR load/store page (host half first, guest half second) and the two
//! I/O permission bitmaps. They are acquired in that order and released in
//! the reverse one.

use crate::{
    error::{KernelError, VmError},
    memlayout::{IO_RTC, IO_RTC_DATA},
    mm::{write_frame, Page},
    vmx::{
        ept::eptp,
        vm_control::*,
        vmcs::{ActiveVmcs, Field},
    },
};
use abyss::{
    addressing::{Gpa, Pa, PAGE_SIZE},
    interrupt::Trapframe,
    x86_64::{
        msr::{MsrEntry, IA32_EFER},
        Cr0, Cr4, Rflags,
    },
    PhysicalMemory,
};
use core::mem::size_of;

/// Offset of the guest half of the MSR page.
pub const GUEST_MSR_OFFSET: usize = PAGE_SIZE / 2;
/// MSRs switched on every entry and exit.
const SWITCHED_MSRS: [u32; 1] = [IA32_EFER];

/// Virtualization state bound to one guest environment.
#[derive(Debug)]
pub struct GuestBlock {
    vmcs: Pa,
    msr_area: Pa,
    io_bitmap_a: Pa,
    io_bitmap_b: Pa,
    msr_count: usize,
    phys_size: usize,
    entry: Gpa,
    launched: bool,
    pub(crate) vcpu: usize,
    pub(crate) disk_image: u32,
    /// Last value written to the CMOS index port.
    pub(crate) rtc_index: u8,
    /// Host vector waiting for the guest to unmask interrupts.
    pub(crate) pending_vector: Option<u8>,
}

impl GuestBlock {
    /// Allocate the control structure, MSR areas and I/O bitmaps. On
    /// failure every frame obtained so far is released.
    pub(crate) fn new(
        mem: &dyn PhysicalMemory,
        vmcs_revision: u32,
        phys_size: usize,
        entry: Gpa,
    ) -> Result<Self, KernelError> {
        let mut vmcs = Page::new(mem).ok_or(KernelError::NoMem)?;
        let mut msr_area = Page::new(mem).ok_or(KernelError::NoMem)?;
        let mut io_bitmap_a = Page::new(mem).ok_or(KernelError::NoMem)?;
        let io_bitmap_b = Page::new(mem).ok_or(KernelError::NoMem)?;

        vmcs.inner_mut()[..4].copy_from_slice(&(vmcs_revision & 0x7fff_ffff).to_le_bytes());

        let msrs = msr_area.inner_mut();
        for (i, msr) in SWITCHED_MSRS.iter().enumerate() {
            let entry = MsrEntry {
                msr_index: *msr,
                ..Default::default()
            };
            // SAFETY: both halves have room for every switched MSR.
            unsafe {
                let host = msrs.as_mut_ptr().add(i * size_of::<MsrEntry>());
                (host as *mut MsrEntry).write_unaligned(entry);
                let guest = msrs.as_mut_ptr().add(GUEST_MSR_OFFSET + i * size_of::<MsrEntry>());
                (guest as *mut MsrEntry).write_unaligned(entry);
            }
        }

        // Trap the CMOS ports; everything else goes straight to hardware.
        let bitmap = io_bitmap_a.inner_mut();
        for port in [IO_RTC, IO_RTC_DATA] {
            bitmap[port as usize / 8] |= 1 << (port % 8);
        }

        Ok(Self {
            vmcs: vmcs.into_raw(),
            msr_area: msr_area.into_raw(),
            io_bitmap_a: io_bitmap_a.into_raw(),
            io_bitmap_b: io_bitmap_b.into_raw(),
            msr_count: SWITCHED_MSRS.len(),
            phys_size,
            entry,
            launched: false,
            vcpu: 0,
            disk_image: 0,
            rtc_index: 0,
            pending_vector: None,
        })
    }

    /// Release the four frames, last acquired first.
    pub(crate) fn release(self, mem: &dyn PhysicalMemory) {
        for pa in [self.io_bitmap_b, self.io_bitmap_a, self.msr_area, self.vmcs] {
            mem.decref(pa);
        }
    }

    pub fn vmcs(&self) -> Pa {
        self.vmcs
    }

    pub fn msr_area(&self) -> Pa {
        self.msr_area
    }

    pub fn io_bitmaps(&self) -> (Pa, Pa) {
        (self.io_bitmap_a, self.io_bitmap_b)
    }

    pub fn vcpu(&self) -> usize {
        self.vcpu
    }

    pub fn phys_size(&self) -> usize {
        self.phys_size
    }

    pub fn entry(&self) -> Gpa {
        self.entry
    }

    pub fn disk_image(&self) -> u32 {
        self.disk_image
    }

    pub fn launched(&self) -> bool {
        self.launched
    }

    pub fn pending_vector(&self) -> Option<u8> {
        self.pending_vector
    }

    /// Run `f` over the guest half of the MSR area.
    pub fn with_guest_msrs<R>(
        &self,
        mem: &dyn PhysicalMemory,
        f: impl FnOnce(&mut [MsrEntry]) -> R,
    ) -> R {
        // SAFETY: the guest half holds `msr_count` initialized entries at a
        // 16-byte aligned offset, and the kernel lock serializes access.
        let entries = unsafe {
            core::slice::from_raw_parts_mut(
                mem.kva(self.msr_area + GUEST_MSR_OFFSET).as_ptr::<MsrEntry>(),
                self.msr_count,
            )
        };
        f(entries)
    }

    /// Program the active control structure for the next entry and report
    /// whether the structure has been launched before.
    pub(crate) fn prepare_entry(
        &mut self,
        vmcs: &ActiveVmcs,
        ept_root: Pa,
        tf: &Trapframe,
    ) -> Result<bool, VmError> {
        if !self.launched {
            let guest_msrs = (self.msr_area + GUEST_MSR_OFFSET).into_usize() as u64;
            vmcs.write(Field::Eptptr, eptp(ept_root))?;
            vmcs.write(Field::IoBitmapA, self.io_bitmap_a.into_usize() as u64)?;
            vmcs.write(Field::IoBitmapB, self.io_bitmap_b.into_usize() as u64)?;
            vmcs.write(Field::VmexitMsrLoadAddr, self.msr_area.into_usize() as u64)?;
            vmcs.write(Field::VmexitMsrStoreAddr, guest_msrs)?;
            vmcs.write(Field::VmentryMsrLoadAddr, guest_msrs)?;
            for count in [
                Field::VmexitMsrLoadCount,
                Field::VmexitMsrStoreCount,
                Field::VmentryMsrLoadCount,
            ] {
                vmcs.write(count, self.msr_count as u64)?;
            }
            vmcs.write(
                Field::ProcessorBasedVmexecControls,
                (VmcsProcBasedVmexecCtl::USEIOBMP | VmcsProcBasedVmexecCtl::ACTIVATE_SECONDARY_CTL)
                    .bits() as u64,
            )?;
            vmcs.write(
                Field::SecondaryVmexecControls,
                (VmcsProcBasedSecondaryVmexecCtl::ENABLE_EPT
                    | VmcsProcBasedSecondaryVmexecCtl::UNRESTRICTED_GUEST)
                    .bits() as u64,
            )?;
            vmcs.write(
                Field::VmexitControls,
                (VmcsExitCtl::HOST_ADDRESS_SPACE_SIZE | VmcsExitCtl::ACK_INTR_ON_EXIT).bits()
                    as u64,
            )?;
            vmcs.write(Field::VmentryControls, 0)?;
            vmcs.write(Field::GuestCr0, (Cr0::ET | Cr0::NE).bits())?;
            vmcs.write(Field::GuestCr4, Cr4::VMXE.bits())?;
            vmcs.write(Field::GuestLinkPointer, u64::MAX)?;
        }
        vmcs.write(Field::GuestRip, tf.rip as u64)?;
        vmcs.write(Field::GuestRsp, tf.rsp as u64)?;
        vmcs.write(Field::GuestRflags, (tf.rflags | Rflags::_1).bits())?;
        Ok(core::mem::replace(&mut self.launched, true))
    }
}

//! Kernel services the loader calls, on behalf of its own environment.

use abyss::addressing::{Gpa, Va};
use kenv::{
    env::{EnvId, EnvStatus},
    error::KernelError,
    paging::PteFlags,
    vmx::ept::EptFlags,
    Kernel, Platform,
};

pub trait GuestHost {
    /// Create a guest that stays stopped until [`GuestHost::set_status`].
    fn mkguest(&self, phys_size: usize, entry: Gpa) -> Result<EnvId, KernelError>;

    /// Back `va` in the loader with a fresh zeroed page.
    fn page_alloc(&self, va: Va, perm: PteFlags) -> Result<(), KernelError>;

    /// Copy `data` to `va` in the loader.
    fn write_page(&self, va: Va, data: &[u8]) -> Result<(), KernelError>;

    fn page_unmap(&self, va: Va) -> Result<(), KernelError>;

    /// Share the loader page at `va` with `guest` at `gpa`.
    fn ept_map(&self, va: Va, guest: EnvId, gpa: Gpa, perm: EptFlags) -> Result<(), KernelError>;

    fn set_status(&self, guest: EnvId, status: EnvStatus) -> Result<(), KernelError>;

    /// Number of the newest guest's disk image.
    fn vmdisk_number(&self) -> u32;

    fn destroy(&self, guest: EnvId) -> Result<(), KernelError>;

    /// Block until `guest` is gone.
    fn wait(&self, guest: EnvId);
}

/// [`GuestHost`] over a kernel in the same address space, for a loader
/// that runs as the current environment of this processor.
pub struct KernelHost<'k, P: Platform> {
    kernel: &'k Kernel<P>,
}

impl<'k, P: Platform> KernelHost<'k, P> {
    pub fn new(kernel: &'k Kernel<P>) -> Self {
        Self { kernel }
    }
}

impl<P: Platform> GuestHost for KernelHost<'_, P> {
    fn mkguest(&self, phys_size: usize, entry: Gpa) -> Result<EnvId, KernelError> {
        self.kernel.env_mkguest(phys_size, entry)
    }

    fn page_alloc(&self, va: Va, perm: PteFlags) -> Result<(), KernelError> {
        self.kernel.page_alloc(EnvId::CALLER, va, perm)
    }

    fn write_page(&self, va: Va, data: &[u8]) -> Result<(), KernelError> {
        self.kernel.write_page(EnvId::CALLER, va, data)
    }

    fn page_unmap(&self, va: Va) -> Result<(), KernelError> {
        self.kernel.page_unmap(EnvId::CALLER, va)
    }

    fn ept_map(&self, va: Va, guest: EnvId, gpa: Gpa, perm: EptFlags) -> Result<(), KernelError> {
        self.kernel.ept_map(EnvId::CALLER, va, guest, gpa, perm)
    }

    fn set_status(&self, guest: EnvId, status: EnvStatus) -> Result<(), KernelError> {
        self.kernel.env_set_status(guest, status)
    }

    fn vmdisk_number(&self) -> u32 {
        self.kernel.vmdisk_number()
    }

    fn destroy(&self, guest: EnvId) -> Result<(), KernelError> {
        self.kernel.destroy(guest)
    }

    fn wait(&self, guest: EnvId) {
        // Does not return; the loader checks again once it is rescheduled.
        if self.kernel.inspect(guest, |_| ()).is_ok() {
            self.kernel.platform().host().sched_yield();
        }
    }
}

//! Extended page table: guest-physical to host-physical translation.
//!
//! Guest RAM frames are owned by the EPT and released with it. Device
//! windows (the VGA text buffer) are installed with [`EptFlags::UNOWNED`]
//! and left alone on teardown.

use crate::{
    error::MappingError,
    paging::{EntryFormat, PageTable},
};
use abyss::{
    addressing::{Gpa, Pa, Va},
    PhysicalMemory,
};

bitflags::bitflags! {
    /// Flags of an EPT entry.
    pub struct EptFlags: u64 {
        /// Reads allowed.
        const READ = 1 << 0;
        /// Writes allowed.
        const WRITE = 1 << 1;
        /// Instruction fetches allowed.
        const EXECUTE = 1 << 2;
        /// Memory type write-back (leaf entries).
        const MEMTYPE_WB = 6 << 3;
        /// Accessed.
        const ACCESSED = 1 << 8;
        /// Frame is not reference counted by this table.
        const UNOWNED = 1 << 11;
        /// Read, write and execute.
        const FULL = Self::READ.bits | Self::WRITE.bits | Self::EXECUTE.bits;
    }
}

/// EPT entry format.
pub enum EptFormat {}

impl EntryFormat for EptFormat {
    const VALID: u64 = EptFlags::FULL.bits();
    const TABLE: u64 = EptFlags::FULL.bits();
    const UNOWNED: u64 = EptFlags::UNOWNED.bits();
}

/// Top of guest-physical space covered by a 4-level EPT.
pub const GPA_LIMIT: usize = 1 << 48;

/// EPT pointer for a 4-level, write-back table rooted at `root`.
pub fn eptp(root: Pa) -> u64 {
    root.into_usize() as u64 | (3 << 3) | 6
}

/// The mapping service over one guest's EPT.
pub struct ExtendedPageTable<'a> {
    table: PageTable<'a, EptFormat>,
    mem: &'a dyn PhysicalMemory,
}

impl<'a> ExtendedPageTable<'a> {
    pub fn new(mem: &'a dyn PhysicalMemory, root: Pa) -> Self {
        Self {
            table: PageTable::new(mem, root),
            mem,
        }
    }

    /// Map the frame `page` at `gpa`. The EPT takes a reference on `page`.
    ///
    /// `perm` must be a non-empty subset of [`EptFlags::FULL`]. With
    /// `overwrite` clear, an existing mapping at `gpa` is an error.
    pub fn map(
        &mut self,
        page: Pa,
        gpa: Gpa,
        perm: EptFlags,
        overwrite: bool,
    ) -> Result<(), MappingError> {
        let perm = perm & EptFlags::FULL;
        if perm.is_empty() {
            return Err(MappingError::NotExist);
        }
        self.table.map(
            gpa.into_usize(),
            page,
            (perm | EptFlags::MEMTYPE_WB).bits(),
            overwrite,
        )
    }

    /// Map a host device frame at `gpa` without taking ownership of it.
    pub fn map_device(&mut self, hpa: Pa, gpa: Gpa, perm: EptFlags) -> Result<(), MappingError> {
        let flags = (perm & EptFlags::FULL) | EptFlags::UNOWNED;
        self.table.map(gpa.into_usize(), hpa, flags.bits(), false)
    }

    /// Host frame and permission backing `gpa`.
    pub fn translate(&mut self, gpa: Gpa) -> Option<(Pa, EptFlags)> {
        self.table
            .lookup(gpa.into_usize())
            .map(|(pa, flags)| (pa, EptFlags::from_bits_truncate(flags)))
    }

    /// Host virtual address through which the kernel reaches `gpa`.
    pub fn gpa_to_hva(&mut self, gpa: Gpa) -> Option<Va> {
        let (pa, _) = self.translate(gpa)?;
        Some(self.mem.kva(pa) + gpa.page_offset())
    }

    /// Release every guest frame and table. The root is left to its owner.
    pub fn teardown(mut self) {
        self.table.release_below(GPA_LIMIT);
    }
}

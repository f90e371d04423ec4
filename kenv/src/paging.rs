//! Four-level radix tables shared by host page tables and the EPT.
//!
//! Both formats store a 4 KiB-aligned frame address in bits 51:12 and
//! differ only in which bits make an entry present. The tables are walked
//! through [`PhysicalMemory::kva`], so the same code runs on hardware and
//! against [`abyss::mock::MockMemory`].
//!
//! Leaf frames are reference counted: mapping takes a reference, unmapping
//! drops it. Entries carrying the format's `UNOWNED` bit (device windows)
//! are never counted.

use crate::error::MappingError;
use abyss::{
    addressing::{Pa, PAGE_SIZE},
    PhysicalMemory,
};
use core::marker::PhantomData;

/// Frame address bits of an entry.
pub const ADDR_MASK: u64 = 0x000f_ffff_ffff_f000;
const ENTRIES: usize = 512;

/// Bit layout of one paging format.
pub trait EntryFormat {
    /// Any of these set means present.
    const VALID: u64;
    /// Flags of an intermediate entry.
    const TABLE: u64;
    /// Software bit marking a frame the table does not own.
    const UNOWNED: u64;
}

bitflags::bitflags! {
    /// Flags of an x86_64 page table entry.
    pub struct PteFlags: u64 {
        /// Present.
        const P = 1 << 0;
        /// Writable.
        const RW = 1 << 1;
        /// User accessible.
        const US = 1 << 2;
        /// Write through.
        const PWT = 1 << 3;
        /// Cache disable.
        const PCD = 1 << 4;
        /// Accessed.
        const A = 1 << 5;
        /// Dirty.
        const D = 1 << 6;
        /// Frame is not reference counted by this table.
        const UNOWNED = 1 << 9;
        /// Execute disable.
        const XD = 1 << 63;
    }
}

/// Host page table format.
pub enum X86 {}

impl EntryFormat for X86 {
    const VALID: u64 = PteFlags::P.bits();
    const TABLE: u64 = PteFlags::P.bits() | PteFlags::RW.bits() | PteFlags::US.bits();
    const UNOWNED: u64 = PteFlags::UNOWNED.bits();
}

/// A table rooted at `root`, borrowed for the duration of an operation.
pub struct PageTable<'a, F: EntryFormat> {
    mem: &'a dyn PhysicalMemory,
    root: Pa,
    _format: PhantomData<F>,
}

#[inline]
const fn index(addr: usize, level: usize) -> usize {
    (addr >> (12 + 9 * level)) & (ENTRIES - 1)
}

#[inline]
const fn entry_pa(entry: u64) -> Option<Pa> {
    Pa::new((entry & ADDR_MASK) as usize)
}

impl<'a, F: EntryFormat> PageTable<'a, F> {
    pub fn new(mem: &'a dyn PhysicalMemory, root: Pa) -> Self {
        Self {
            mem,
            root,
            _format: PhantomData,
        }
    }

    pub fn root(&self) -> Pa {
        self.root
    }

    fn is_present(entry: u64) -> bool {
        entry & F::VALID != 0
    }

    /// Pointer to the 512 entries of the table frame at `pa`.
    fn entries(&self, pa: Pa) -> *mut u64 {
        self.mem.kva(pa).as_ptr::<u64>()
    }

    /// Read entry `idx` of the root table.
    pub fn root_entry(&self, idx: usize) -> u64 {
        assert!(idx < ENTRIES);
        // SAFETY: the root frame is a live table frame owned by this table.
        unsafe { *self.entries(self.root).add(idx) }
    }

    /// Overwrite entry `idx` of the root table without touching refcounts.
    pub fn set_root_entry(&mut self, idx: usize, entry: u64) {
        assert!(idx < ENTRIES);
        // SAFETY: as in `root_entry`, and `&mut self` excludes other writers.
        unsafe { *self.entries(self.root).add(idx) = entry }
    }

    /// Find the leaf entry slot of `addr`. With `create`, missing
    /// intermediate tables are allocated.
    fn walk(&mut self, addr: usize, create: bool) -> Result<*mut u64, MappingError> {
        let mut table = self.root;
        for level in (1..4).rev() {
            // SAFETY: `table` is a live table frame reached from the root.
            let slot = unsafe { self.entries(table).add(index(addr, level)) };
            let entry = unsafe { *slot };
            table = if Self::is_present(entry) {
                entry_pa(entry).ok_or(MappingError::NotExist)?
            } else if create {
                let pa = self.mem.alloc_page(true).ok_or(MappingError::NoMem)?;
                self.mem.incref(pa);
                unsafe { *slot = pa.into_usize() as u64 | F::TABLE };
                pa
            } else {
                return Err(MappingError::NotExist);
            };
        }
        Ok(unsafe { self.entries(table).add(index(addr, 0)) })
    }

    /// Install `pa` at `addr` with `flags`. Unless `F::UNOWNED` is in
    /// `flags`, the frame gains a reference. With `overwrite`, a previous
    /// mapping is replaced and its frame released.
    pub fn map(&mut self, addr: usize, pa: Pa, flags: u64, overwrite: bool) -> Result<(), MappingError> {
        if addr % PAGE_SIZE != 0 || !pa.is_page_aligned() {
            return Err(MappingError::Unaligned);
        }
        let slot = self.walk(addr, true)?;
        // SAFETY: `walk` returned a slot inside a live leaf table.
        let old = unsafe { *slot };
        if Self::is_present(old) && !overwrite {
            return Err(MappingError::Duplicated);
        }
        if flags & F::UNOWNED == 0 {
            self.mem.incref(pa);
        }
        unsafe { *slot = pa.into_usize() as u64 | flags };
        if Self::is_present(old) {
            self.release_frame(old);
        }
        Ok(())
    }

    /// Remove the mapping at `addr`, returning the frame it pointed to.
    pub fn unmap(&mut self, addr: usize) -> Result<Pa, MappingError> {
        if addr % PAGE_SIZE != 0 {
            return Err(MappingError::Unaligned);
        }
        let slot = self.walk(addr, false)?;
        let old = unsafe { *slot };
        if !Self::is_present(old) {
            return Err(MappingError::NotExist);
        }
        unsafe { *slot = 0 };
        self.release_frame(old);
        entry_pa(old).ok_or(MappingError::NotExist)
    }

    /// Frame and flags mapped at the page containing `addr`.
    pub fn lookup(&mut self, addr: usize) -> Option<(Pa, u64)> {
        let slot = self.walk(addr & !(PAGE_SIZE - 1), false).ok()?;
        let entry = unsafe { *slot };
        if Self::is_present(entry) {
            Some((entry_pa(entry)?, entry & !ADDR_MASK))
        } else {
            None
        }
    }

    fn release_frame(&self, entry: u64) {
        if entry & F::UNOWNED == 0 {
            if let Some(pa) = entry_pa(entry) {
                self.mem.decref(pa);
            }
        }
    }

    /// Drop every mapping below `limit` together with the tables that held
    /// them. The root itself is left to its owner.
    pub fn release_below(&mut self, limit: usize) {
        self.release_level(self.root, 3, 0, limit);
    }

    fn release_level(&self, table: Pa, level: usize, base: usize, limit: usize) {
        let entries = self.entries(table);
        for i in 0..ENTRIES {
            let va = base + (i << (12 + 9 * level));
            if va >= limit {
                break;
            }
            // SAFETY: `table` is a live table frame reached from the root.
            let entry = unsafe { *entries.add(i) };
            if !Self::is_present(entry) {
                continue;
            }
            if level == 0 {
                self.release_frame(entry);
            } else if let Some(child) = entry_pa(entry) {
                self.release_level(child, level - 1, va, limit);
                self.mem.decref(child);
            }
            unsafe { *entries.add(i) = 0 };
        }
    }
}

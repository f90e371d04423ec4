//! Building and tearing down environment address spaces.

use crate::{
    error::KernelError,
    memlayout::{KERNEL_ROOT_SLOT, UTOP, UVPT},
    mm::{write_frame, zero_frame, Page},
    paging::{PageTable, PteFlags, X86},
};
use abyss::{
    addressing::{Pa, Va, PAGE_SIZE},
    HardwareContext, PhysicalMemory,
};

/// Root slot of an address.
const fn root_index(addr: usize) -> usize {
    (addr >> 39) & 0x1ff
}

/// Allocate a root table that shares the kernel half with every other
/// environment and maps itself read-only at [`UVPT`].
pub fn setup_vm(mem: &dyn PhysicalMemory, hw: &dyn HardwareContext) -> Result<Pa, KernelError> {
    let root = Page::new(mem).ok_or(KernelError::NoMem)?;
    let mut pt = PageTable::<X86>::new(mem, root.pa());
    pt.set_root_entry(KERNEL_ROOT_SLOT, hw.kernel_root_entry());
    pt.set_root_entry(
        root_index(UVPT),
        root.pa().into_usize() as u64 | (PteFlags::P | PteFlags::US).bits(),
    );
    Ok(root.into_raw())
}

/// Allocate an empty EPT root.
pub fn setup_ept(mem: &dyn PhysicalMemory) -> Result<Pa, KernelError> {
    Page::new(mem).map(Page::into_raw).ok_or(KernelError::NoMem)
}

/// Release every user mapping below [`UTOP`], then the root itself.
pub fn release_vm(mem: &dyn PhysicalMemory, root: Pa) {
    PageTable::<X86>::new(mem, root).release_below(UTOP);
    mem.decref(root);
}

/// Make sure `[va, va + len)` is backed by zeroed, user-writable pages.
/// Pages that are already present are kept.
pub fn region_alloc(
    mem: &dyn PhysicalMemory,
    root: Pa,
    va: Va,
    len: usize,
) -> Result<(), KernelError> {
    if va.into_usize().checked_add(len).map_or(true, |end| end > UTOP) {
        return Err(KernelError::Inval);
    }
    let mut pt = PageTable::<X86>::new(mem, root);
    let start = va.page_down().into_usize();
    let end = (va + len).page_up().into_usize();
    for addr in (start..end).step_by(PAGE_SIZE) {
        if pt.lookup(addr).is_some() {
            continue;
        }
        let page = Page::new(mem).ok_or(KernelError::NoMem)?;
        pt.map(
            addr,
            page.pa(),
            (PteFlags::P | PteFlags::RW | PteFlags::US).bits(),
            false,
        )?;
    }
    Ok(())
}

/// Copy `data` into the address space at `va`. Every touched page must
/// already be mapped.
pub fn copy_to_user(
    mem: &dyn PhysicalMemory,
    root: Pa,
    va: Va,
    data: &[u8],
) -> Result<(), KernelError> {
    let mut pt = PageTable::<X86>::new(mem, root);
    let mut copied = 0;
    while copied < data.len() {
        let at = va + copied;
        let (frame, _) = pt.lookup(at.into_usize()).ok_or(KernelError::Inval)?;
        let n = (PAGE_SIZE - at.page_offset()).min(data.len() - copied);
        write_frame(mem, frame, at.page_offset(), &data[copied..copied + n]);
        copied += n;
    }
    Ok(())
}

/// Zero `len` bytes of the address space from `va`. Every touched page
/// must already be mapped.
pub fn zero_user(mem: &dyn PhysicalMemory, root: Pa, va: Va, len: usize) -> Result<(), KernelError> {
    let mut pt = PageTable::<X86>::new(mem, root);
    let mut done = 0;
    while done < len {
        let at = va + done;
        let (frame, _) = pt.lookup(at.into_usize()).ok_or(KernelError::Inval)?;
        let n = (PAGE_SIZE - at.page_offset()).min(len - done);
        zero_frame(mem, frame, at.page_offset(), n);
        done += n;
    }
    Ok(())
}

//! Owned references to physical frames.
use abyss::{
    addressing::{Pa, Va, PAGE_SIZE},
    PhysicalMemory,
};

/// A Page representation.
///
/// Holds one reference on a frame and drops it when it goes out of scope,
/// which makes multi-step allocations unwind in reverse order for free.
pub struct Page<'a> {
    mem: &'a dyn PhysicalMemory,
    pa: Pa,
}

impl<'a> Page<'a> {
    /// Allocate a zero-filled page.
    #[inline]
    pub fn new(mem: &'a dyn PhysicalMemory) -> Option<Self> {
        let pa = mem.alloc_page(true)?;
        mem.incref(pa);
        Some(Self { mem, pa })
    }

    /// Get physical address of this page.
    #[inline]
    pub fn pa(&self) -> Pa {
        self.pa
    }

    /// Get virtual address of this page.
    #[inline]
    pub fn va(&self) -> Va {
        self.mem.kva(self.pa)
    }

    /// Consumes the page, returning a pa of the page.
    ///
    /// After calling this function, the caller owns the reference
    /// previously managed by the Page and must release it with
    /// [`Page::from_pa`] or [`PhysicalMemory::decref`].
    #[inline]
    pub fn into_raw(self) -> Pa {
        core::mem::ManuallyDrop::new(self).pa
    }

    /// Constructs a page from a pa.
    ///
    /// ## Safety
    /// `pa` must carry a reference taken by [`Page::into_raw`] that nobody
    /// else will release.
    #[inline]
    pub unsafe fn from_pa(mem: &'a dyn PhysicalMemory, pa: Pa) -> Self {
        Self { mem, pa }
    }

    /// Get mutable reference of underlying slice of the Page.
    pub fn inner_mut(&mut self) -> &mut [u8] {
        // SAFETY: the frame stays allocated while this reference is held,
        // and `&mut self` keeps the slice unique among Page users.
        unsafe { core::slice::from_raw_parts_mut(self.va().as_ptr::<u8>(), PAGE_SIZE) }
    }
}

impl Drop for Page<'_> {
    fn drop(&mut self) {
        self.mem.decref(self.pa);
    }
}

/// Copy `data` into the frame at `pa` starting at `offset`.
pub(crate) fn write_frame(mem: &dyn PhysicalMemory, pa: Pa, offset: usize, data: &[u8]) {
    assert!(offset + data.len() <= PAGE_SIZE);
    // SAFETY: `pa` is a live frame and the range stays inside it.
    unsafe {
        core::ptr::copy_nonoverlapping(
            data.as_ptr(),
            mem.kva(pa).as_ptr::<u8>().add(offset),
            data.len(),
        )
    }
}

/// Fill `len` bytes of the frame at `pa` from `offset` with zero.
pub(crate) fn zero_frame(mem: &dyn PhysicalMemory, pa: Pa, offset: usize, len: usize) {
    assert!(offset + len <= PAGE_SIZE);
    // SAFETY: as in `write_frame`.
    unsafe { core::ptr::write_bytes(mem.kva(pa).as_ptr::<u8>().add(offset), 0, len) }
}

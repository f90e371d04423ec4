//! Host-side stand-ins for [`PhysicalMemory`] and [`HardwareContext`].
//!
//! Frames are heap pages with stable addresses, so raw pointers handed out
//! through [`PhysicalMemory::kva`] stay valid until the frame is freed.
//! The processor keeps every control structure as a map from field
//! encoding to value.

use crate::{
    addressing::{Pa, Va, PAGE_SIZE},
    interrupt::{GeneralPurposeRegisters, Trapframe},
    CpuidResult, HardwareContext, PhysicalMemory, VmxFailure,
};
use alloc::{boxed::Box, collections::BTreeMap, vec::Vec};
use core::sync::atomic::{AtomicUsize, Ordering};
use spin_lock::SpinLock;

/// First physical address handed out by [`MockMemory`].
const MOCK_PA_BASE: usize = 0x1000_0000;
/// Revision identifier reported by [`MockHardware`].
pub const MOCK_VMCS_REVISION: u32 = 0x12;
/// Filler for frames allocated without zeroing.
pub const POISON: u8 = 0xa5;

#[repr(C, align(4096))]
struct Frame([u8; PAGE_SIZE]);

struct Slot {
    frame: Box<Frame>,
    refcnt: usize,
}

#[derive(Default)]
struct Frames {
    slots: BTreeMap<Pa, Slot>,
    next: usize,
    budget: Option<usize>,
    allocated: usize,
}

/// Reference-counted frames backed by the host heap.
#[derive(Default)]
pub struct MockMemory {
    inner: SpinLock<Frames>,
}

impl MockMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allow exactly `n` more allocations before failing. `None` lifts the
    /// limit.
    pub fn set_budget(&self, n: Option<usize>) {
        self.inner.lock().budget = n;
    }

    /// Frames currently allocated.
    pub fn live_pages(&self) -> usize {
        self.inner.lock().slots.len()
    }

    /// Successful allocations since creation.
    pub fn allocations(&self) -> usize {
        self.inner.lock().allocated
    }

    /// Whether `pa` names an allocated frame.
    pub fn is_live(&self, pa: Pa) -> bool {
        self.inner.lock().slots.contains_key(&pa)
    }
}

impl PhysicalMemory for MockMemory {
    fn alloc_page(&self, zeroed: bool) -> Option<Pa> {
        let mut inner = self.inner.lock();
        match inner.budget.as_mut() {
            Some(0) => return None,
            Some(n) => *n -= 1,
            None => (),
        }
        let pa = Pa::new(MOCK_PA_BASE + inner.next * PAGE_SIZE)?;
        inner.next += 1;
        inner.allocated += 1;
        let fill = if zeroed { 0 } else { POISON };
        inner.slots.insert(
            pa,
            Slot {
                frame: Box::new(Frame([fill; PAGE_SIZE])),
                refcnt: 0,
            },
        );
        Some(pa)
    }

    fn incref(&self, pa: Pa) {
        match self.inner.lock().slots.get_mut(&pa) {
            Some(slot) => slot.refcnt += 1,
            None => panic!("incref on unallocated frame {}", pa),
        }
    }

    fn decref(&self, pa: Pa) {
        let mut inner = self.inner.lock();
        let slot = match inner.slots.get_mut(&pa) {
            Some(slot) => slot,
            None => panic!("decref on unallocated frame {}", pa),
        };
        assert!(slot.refcnt > 0, "decref underflow on {}", pa);
        slot.refcnt -= 1;
        if slot.refcnt == 0 {
            inner.slots.remove(&pa);
        }
    }

    fn refcount(&self, pa: Pa) -> usize {
        self.inner
            .lock()
            .slots
            .get(&pa)
            .map(|slot| slot.refcnt)
            .unwrap_or(0)
    }

    fn kva(&self, pa: Pa) -> Va {
        let inner = self.inner.lock();
        let slot = match inner.slots.get(&pa.page_down()) {
            Some(slot) => slot,
            None => panic!("kva of unallocated frame {}", pa),
        };
        Va::from_ptr(slot.frame.0.as_ptr()) + pa.page_offset()
    }
}

#[derive(Default)]
struct CpuState {
    current_vmcs: Option<Pa>,
    vmcs: BTreeMap<Pa, BTreeMap<u32, u64>>,
    cpuid: BTreeMap<(u32, u32), CpuidResult>,
    roots: Vec<Option<Pa>>,
}

/// A scripted processor.
pub struct MockHardware {
    cpu: AtomicUsize,
    eoi: AtomicUsize,
    kernel_root_entry: u64,
    vga: Pa,
    state: SpinLock<CpuState>,
}

impl MockHardware {
    pub fn new(kernel_root_entry: u64, vga: Pa) -> Self {
        Self {
            cpu: AtomicUsize::new(0),
            eoi: AtomicUsize::new(0),
            kernel_root_entry,
            vga,
            state: SpinLock::new(CpuState::default()),
        }
    }

    /// Pretend subsequent calls execute on processor `cpu`.
    pub fn set_cpu(&self, cpu: usize) {
        self.cpu.store(cpu, Ordering::SeqCst);
    }

    /// Script the raw result of `cpuid(leaf, subleaf)`.
    pub fn set_cpuid(&self, leaf: u32, subleaf: u32, result: CpuidResult) {
        self.state.lock().cpuid.insert((leaf, subleaf), result);
    }

    /// Number of end-of-interrupt signals sent.
    pub fn eoi_count(&self) -> usize {
        self.eoi.load(Ordering::SeqCst)
    }

    /// Address spaces installed so far, `None` for the kernel's own.
    pub fn loaded_roots(&self) -> Vec<Option<Pa>> {
        self.state.lock().roots.clone()
    }

    /// Control structure made current by the last `vmptrld`.
    pub fn current_vmcs(&self) -> Option<Pa> {
        self.state.lock().current_vmcs
    }

    /// Peek at a field of the control structure at `vmcs`.
    pub fn field(&self, vmcs: Pa, field: u32) -> Option<u64> {
        self.state
            .lock()
            .vmcs
            .get(&vmcs)
            .and_then(|fields| fields.get(&field).copied())
    }

    /// Preload a field of the control structure at `vmcs`, as the processor
    /// does for exit information.
    pub fn set_field(&self, vmcs: Pa, field: u32, value: u64) {
        self.state
            .lock()
            .vmcs
            .entry(vmcs)
            .or_default()
            .insert(field, value);
    }
}

impl HardwareContext for MockHardware {
    fn cpu_id(&self) -> usize {
        self.cpu.load(Ordering::SeqCst)
    }

    fn kernel_root_entry(&self) -> u64 {
        self.kernel_root_entry
    }

    fn vga_buffer(&self) -> Pa {
        self.vga
    }

    fn load_address_space(&self, root: Pa) {
        self.state.lock().roots.push(Some(root));
    }

    fn load_kernel_address_space(&self) {
        self.state.lock().roots.push(None);
    }

    fn cpuid(&self, leaf: u32, subleaf: u32) -> CpuidResult {
        self.state
            .lock()
            .cpuid
            .get(&(leaf, subleaf))
            .copied()
            .unwrap_or_default()
    }

    fn lapic_eoi(&self) {
        self.eoi.fetch_add(1, Ordering::SeqCst);
    }

    fn vmcs_revision(&self) -> u32 {
        MOCK_VMCS_REVISION
    }

    fn vmptrld(&self, vmcs: Pa) -> Result<(), VmxFailure> {
        let mut state = self.state.lock();
        state.current_vmcs = Some(vmcs);
        state.vmcs.entry(vmcs).or_default();
        Ok(())
    }

    fn vmread(&self, field: u32) -> Result<u64, VmxFailure> {
        let state = self.state.lock();
        let current = state.current_vmcs.ok_or(VmxFailure::Invalid)?;
        Ok(state
            .vmcs
            .get(&current)
            .and_then(|fields| fields.get(&field).copied())
            .unwrap_or(0))
    }

    fn vmwrite(&self, field: u32, value: u64) -> Result<(), VmxFailure> {
        let mut state = self.state.lock();
        let current = state.current_vmcs.ok_or(VmxFailure::Invalid)?;
        state.vmcs.entry(current).or_default().insert(field, value);
        Ok(())
    }

    unsafe fn enter_user(&self, frame: &Trapframe) -> ! {
        panic!("mock processor cannot enter ring 3 at {:#x}", frame.rip)
    }

    unsafe fn vm_enter(&self, _gprs: *mut GeneralPurposeRegisters, launched: bool) -> ! {
        panic!("mock processor cannot enter a guest (launched: {})", launched)
    }
}

//! Creating and destroying environments.
//!
//! An allocation only unlinks its slot from the free list once every
//! resource for the new record has been obtained, so a failed call leaves
//! the table exactly as it found it.

use super::{
    address_space::{release_vm, setup_ept, setup_vm},
    loader,
    table::EnvTable,
    Env, EnvId, EnvKind, EnvStatus, ProcessRole,
};
use crate::{
    error::KernelError,
    memlayout::USTACKTOP,
    vmx::{ept::ExtendedPageTable, guest::GuestBlock},
    Kernel, Platform,
};
use abyss::{
    addressing::Gpa,
    interrupt::Trapframe,
    x86_64::Rflags,
};
use alloc::boxed::Box;
use log::{debug, info};

/// What a new record will be.
pub(crate) enum Blueprint {
    Process,
    Guest { phys_size: usize, entry: Gpa },
}

impl<P: Platform> Kernel<P> {
    /// Slot of the environment running on this processor.
    pub(crate) fn caller(&self, table: &EnvTable) -> Option<usize> {
        table.current(self.hw().cpu_id())
    }

    /// Resolve `id` on behalf of the environment running on this processor.
    ///
    /// Identity zero names the caller. With `require_related`, the target
    /// must be the caller or one of its immediate children.
    pub fn resolve(&self, id: EnvId, require_related: bool) -> Result<EnvId, KernelError> {
        let table = self.envs.lock();
        let idx = table.lookup(id, self.caller(&table), require_related)?;
        Ok(table.get(idx).id)
    }

    /// Allocate a runnable process with an empty user half.
    pub fn allocate(&self, parent: Option<EnvId>) -> Result<EnvId, KernelError> {
        let mut table = self.envs.lock();
        let idx = self.allocate_locked(&mut table, parent, Blueprint::Process)?;
        Ok(table.get(idx).id)
    }

    /// Allocate a runnable guest with `phys_size` bytes of guest memory
    /// that starts executing at `entry`.
    pub fn allocate_guest(
        &self,
        parent: Option<EnvId>,
        phys_size: usize,
        entry: Gpa,
    ) -> Result<EnvId, KernelError> {
        let mut table = self.envs.lock();
        let idx =
            self.allocate_locked(&mut table, parent, Blueprint::Guest { phys_size, entry })?;
        Ok(table.get(idx).id)
    }

    pub(crate) fn allocate_locked(
        &self,
        table: &mut EnvTable,
        parent: Option<EnvId>,
        blueprint: Blueprint,
    ) -> Result<usize, KernelError> {
        let idx = table.free_head().ok_or(KernelError::NoFreeEnv)?;
        let (mem, hw) = (self.mem(), self.hw());

        let (root, kind, tf) = match blueprint {
            Blueprint::Process => (
                setup_vm(mem, hw)?,
                EnvKind::Process(ProcessRole::User),
                Trapframe::new_user(0, USTACKTOP),
            ),
            Blueprint::Guest { phys_size, entry } => {
                let root = setup_ept(mem)?;
                let mut block = match GuestBlock::new(mem, hw.vmcs_revision(), phys_size, entry) {
                    Ok(block) => block,
                    Err(e) => {
                        mem.decref(root);
                        return Err(e);
                    }
                };
                block.vcpu = self.next_vcpu();
                block.disk_image = self.next_vmdisk();
                let tf = Trapframe {
                    rip: entry.into_usize(),
                    ..Default::default()
                };
                (root, EnvKind::Guest(Box::new(block)), tf)
            }
        };

        let id = table.next_id(idx);
        table.pop_free();
        *table.get_mut(idx) = Env {
            link: None,
            id,
            parent,
            status: EnvStatus::Runnable,
            kind,
            tf,
            root: Some(root),
            runs: 0,
            fault_upcall: None,
            ipc_receiving: false,
        };
        match table.get(idx).guest() {
            Some(guest) => info!(
                "{} new guest: vcpu {}, disk image {}, {:#x} bytes",
                id,
                guest.vcpu(),
                guest.disk_image(),
                guest.phys_size()
            ),
            None => debug!("{} new env", id),
        }
        Ok(idx)
    }

    /// Create a process from `image` with no parent.
    ///
    /// Runs while the system boots, before there is anyone to report an
    /// error to, so any failure is fatal.
    pub fn create(&self, image: &[u8], role: ProcessRole) -> EnvId {
        let mut table = self.envs.lock();
        match self.create_locked(&mut table, image, role) {
            Ok(idx) => table.get(idx).id,
            Err(e) => panic!("create: {}", e),
        }
    }

    pub(crate) fn create_locked(
        &self,
        table: &mut EnvTable,
        image: &[u8],
        role: ProcessRole,
    ) -> Result<usize, KernelError> {
        let idx = self.allocate_locked(table, None, Blueprint::Process)?;
        let env = table.get_mut(idx);
        if let Err(e) = loader::load_image(self.mem(), env, image) {
            self.free_locked(table, idx);
            return Err(e);
        }
        env_set_role(table.get_mut(idx), role);
        Ok(idx)
    }

    /// Load `image` into the process `id`, panicking on a malformed image.
    pub fn load_image(&self, id: EnvId, image: &[u8]) {
        if let Err(e) = self.try_load_image(id, image) {
            panic!("load_image {}: {}", id, e);
        }
    }

    /// Load `image` into the process `id`.
    pub fn try_load_image(&self, id: EnvId, image: &[u8]) -> Result<(), KernelError> {
        let mut table = self.envs.lock();
        let idx = table.lookup(id, None, false)?;
        let env = table.get_mut(idx);
        if env.kind.is_guest() {
            return Err(KernelError::BadEnv);
        }
        loader::load_image(self.mem(), env, image)
    }

    /// Destroy `id`.
    ///
    /// An environment running on another processor is only marked
    /// [`EnvStatus::Dying`]; that processor frees it on its next kernel
    /// entry, and destroying it again before then changes nothing.
    /// Destroying the caller itself does not return.
    pub fn destroy(&self, id: EnvId) -> Result<(), KernelError> {
        let mut table = self.envs.lock();
        let cpu = self.hw().cpu_id();
        let caller = table.current(cpu);
        let idx = table.lookup(id, caller, true)?;

        let elsewhere = table.running_on(idx).map_or(false, |owner| owner != cpu);
        let env = table.get_mut(idx);
        if elsewhere || (env.status == EnvStatus::Running && caller != Some(idx)) {
            if env.status != EnvStatus::Dying {
                env.status = EnvStatus::Dying;
                debug!("{} marked dying", env.id);
            }
            return Ok(());
        }
        self.free_locked(&mut table, idx);
        drop(table);

        if caller == Some(idx) {
            self.host().sched_yield();
        }
        Ok(())
    }

    /// Free this processor's environment if someone destroyed it while it
    /// ran. Called on every kernel entry; returns whether it freed one, in
    /// which case the caller has nothing left to resume.
    pub fn reap_current(&self) -> bool {
        let mut table = self.envs.lock();
        match self.caller(&table) {
            Some(idx) if table.get(idx).status == EnvStatus::Dying => {
                debug!("{} reaped", table.get(idx).id);
                self.free_locked(&mut table, idx);
                true
            }
            _ => false,
        }
    }

    /// Release everything `idx` owns and return the slot to the free list.
    ///
    /// `idx` must not be current on any other processor.
    pub(crate) fn free_locked(&self, table: &mut EnvTable, idx: usize) {
        let (mem, hw) = (self.mem(), self.hw());
        let cpu = hw.cpu_id();
        match table.running_on(idx) {
            Some(owner) if owner == cpu => {
                hw.load_kernel_address_space();
                table.set_current(cpu, None);
            }
            Some(owner) => panic!("{} freed while current on cpu {}", table.get(idx).id, owner),
            None => (),
        }

        let env = table.get_mut(idx);
        debug!("{} free env", env.id);
        let kind = core::mem::replace(&mut env.kind, EnvKind::Process(ProcessRole::User));
        let root = env.root.take();
        match (kind, root) {
            (EnvKind::Guest(block), Some(root)) => {
                ExtendedPageTable::new(mem, root).teardown();
                mem.decref(root);
                block.release(mem);
            }
            (EnvKind::Guest(block), None) => block.release(mem),
            (EnvKind::Process(_), Some(root)) => release_vm(mem, root),
            (EnvKind::Process(_), None) => (),
        }
        env.status = EnvStatus::Free;
        env.parent = None;
        env.tf = Trapframe::default();
        env.fault_upcall = None;
        env.ipc_receiving = false;
        table.push_free(idx);
    }
}

fn env_set_role(env: &mut Env, role: ProcessRole) {
    if role == ProcessRole::FileServer {
        env.tf.rflags |= Rflags::IOPL3;
    }
    env.kind = EnvKind::Process(role);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        memlayout::{DEBUG_SECTIONS, GUEST_ENTRY, GUEST_MEM_SZ, USTABDATA, UTOP},
        paging::{PageTable, X86},
        testing::{test_kernel, ElfBuilder, TestPlatform, YIELD_PANIC},
        KernelConfig,
    };
    use abyss::{addressing::PAGE_SIZE, PhysicalMemory};
    use std::panic::{catch_unwind, AssertUnwindSafe};

    fn kernel(capacity: usize) -> Kernel<TestPlatform> {
        test_kernel(KernelConfig::new().capacity(capacity))
    }

    fn entry() -> Gpa {
        Gpa::new(GUEST_ENTRY).unwrap()
    }

    /// Pretend `id` is running on processor `cpu`.
    fn run_on(k: &Kernel<TestPlatform>, id: EnvId, cpu: usize) {
        k.with_table(|table| {
            let idx = table.lookup(id, None, false).unwrap();
            table.get_mut(idx).status = EnvStatus::Running;
            table.set_current(cpu, Some(idx));
        });
    }

    fn expect_yield(f: impl FnOnce()) {
        let err = catch_unwind(AssertUnwindSafe(f)).unwrap_err();
        let msg = err
            .downcast_ref::<String>()
            .map(String::as_str)
            .or_else(|| err.downcast_ref::<&str>().copied());
        assert_eq!(msg, Some(YIELD_PANIC));
    }

    #[test]
    fn allocate_builds_a_runnable_process() {
        let k = kernel(8);
        let id = k.allocate(None).unwrap();
        let (status, root, rflags, rsp) = k
            .inspect(id, |env| {
                (env.status(), env.root().unwrap(), env.trapframe().rflags, env.trapframe().rsp)
            })
            .unwrap();
        assert_eq!(status, EnvStatus::Runnable);
        assert_eq!(rflags, Rflags::IF);
        assert_eq!(rsp, USTACKTOP);
        let pt = PageTable::<X86>::new(&k.platform().mem, root);
        assert_eq!(pt.root_entry(1), crate::testing::KERNEL_ROOT_ENTRY);
    }

    #[test]
    fn capacity_exhaustion_and_reuse() {
        let k = kernel(4);
        let ids: Vec<_> = (0..4).map(|_| k.allocate(None).unwrap()).collect();
        assert_eq!(k.allocate(None), Err(KernelError::NoFreeEnv));

        k.destroy(ids[2]).unwrap();
        let again = k.allocate(None).unwrap();
        assert_eq!(again.slot(3), ids[2].slot(3));
        assert!(again.generation() > ids[2].generation());
    }

    #[test]
    fn live_identities_are_unique() {
        let k = kernel(4);
        let mut live = Vec::new();
        for round in 0..20 {
            live.push(k.allocate(None).unwrap());
            if round % 3 == 2 {
                k.destroy(live.remove(0)).unwrap();
            }
            if live.len() == 4 {
                k.destroy(live.remove(1)).unwrap();
            }
            let mut sorted = live.clone();
            sorted.sort();
            sorted.dedup();
            assert_eq!(sorted.len(), live.len());
        }
    }

    #[test]
    fn stale_identity_never_resolves_to_new_occupant() {
        let k = kernel(1);
        let old = k.allocate(None).unwrap();
        k.destroy(old).unwrap();
        let new = k.allocate(None).unwrap();
        assert_eq!(k.resolve(old, false), Err(KernelError::BadEnv));
        assert_eq!(k.resolve(new, false), Ok(new));
        assert_eq!(k.destroy(old), Err(KernelError::BadEnv));
        assert!(k.inspect(new, |_| ()).is_ok());
    }

    #[test]
    fn resolve_caller_and_children() {
        let k = kernel(8);
        let parent = k.allocate(None).unwrap();
        let child = k.allocate(Some(parent)).unwrap();
        let stranger = k.allocate(None).unwrap();
        assert_eq!(k.resolve(EnvId::CALLER, false), Err(KernelError::BadEnv));

        run_on(&k, parent, 0);
        assert_eq!(k.resolve(EnvId::CALLER, true), Ok(parent));
        assert_eq!(k.resolve(child, true), Ok(child));
        assert_eq!(k.resolve(stranger, true), Err(KernelError::BadEnv));
        assert_eq!(k.resolve(stranger, false), Ok(stranger));
    }

    #[test]
    fn failed_guest_allocation_leaves_no_trace() {
        let k = kernel(4);
        let mem = &k.platform().mem;
        for budget in 0..5 {
            mem.set_budget(Some(budget));
            assert_eq!(
                k.allocate_guest(None, GUEST_MEM_SZ, entry()),
                Err(KernelError::NoMem)
            );
            assert_eq!(mem.live_pages(), 0);
            assert_eq!(k.with_table(|t| t.free_count()), 4);
        }
        mem.set_budget(None);
        k.allocate_guest(None, GUEST_MEM_SZ, entry()).unwrap();
        assert_eq!(k.vcpu_count(), 1);
    }

    #[test]
    fn disk_image_numbers_count_guests_only() {
        let k = kernel(16);
        let mut seen = Vec::new();
        for i in 0..3 {
            k.allocate(None).unwrap();
            let g = k.allocate_guest(None, GUEST_MEM_SZ, entry()).unwrap();
            k.allocate(None).unwrap();
            let (disk, vcpu) = k
                .inspect(g, |env| {
                    let guest = env.guest().unwrap();
                    (guest.disk_image(), guest.vcpu())
                })
                .unwrap();
            assert_eq!(vcpu, i);
            seen.push(disk);
        }
        assert_eq!(seen, [1, 2, 3]);
        assert_eq!(k.vmdisk_number(), 3);
    }

    #[test]
    fn guest_starts_at_its_entry() {
        let k = kernel(2);
        let g = k.allocate_guest(None, GUEST_MEM_SZ, entry()).unwrap();
        let (rip, is_guest) = k
            .inspect(g, |env| (env.trapframe().rip, env.kind().is_guest()))
            .unwrap();
        assert_eq!(rip, GUEST_ENTRY);
        assert!(is_guest);
        assert_eq!(k.try_load_image(g, &[]), Err(KernelError::BadEnv));
    }

    #[test]
    fn destroying_a_guest_releases_all_frames() {
        let k = kernel(2);
        let mem = &k.platform().mem;
        let g = k.allocate_guest(None, GUEST_MEM_SZ, entry()).unwrap();
        k.with_table(|table| {
            let idx = table.lookup(g, None, false).unwrap();
            let root = table.get(idx).root().unwrap();
            let mut ept = ExtendedPageTable::new(mem, root);
            let page = crate::mm::Page::new(mem).unwrap();
            ept.map(page.pa(), Gpa::new(0x50000).unwrap(), crate::vmx::ept::EptFlags::FULL, false)
                .unwrap();
        });
        assert!(mem.live_pages() > 5);
        k.destroy(g).unwrap();
        assert_eq!(mem.live_pages(), 0);
    }

    #[test]
    fn running_elsewhere_is_deferred() {
        let k = kernel(4);
        let hw = &k.platform().hw;
        let victim = k.allocate(None).unwrap();
        run_on(&k, victim, 1);
        let live = k.platform().mem.live_pages();

        hw.set_cpu(0);
        k.destroy(victim).unwrap();
        assert_eq!(k.inspect(victim, |env| env.status()), Ok(EnvStatus::Dying));
        assert_eq!(k.platform().mem.live_pages(), live);
        assert!(!k.reap_current());

        hw.set_cpu(1);
        assert!(k.reap_current());
        assert_eq!(k.inspect(victim, |env| env.status()), Err(KernelError::BadEnv));
        assert_eq!(k.platform().mem.live_pages(), 0);
        assert_eq!(k.current(), None);
        assert_eq!(hw.loaded_roots().last(), Some(&None));
    }

    #[test]
    fn destroying_a_dying_environment_again_frees_nothing() {
        let k = kernel(1);
        let hw = &k.platform().hw;
        let victim = k.allocate(None).unwrap();
        run_on(&k, victim, 1);
        let live = k.platform().mem.live_pages();

        hw.set_cpu(0);
        k.destroy(victim).unwrap();
        k.destroy(victim).unwrap();
        assert_eq!(k.inspect(victim, |env| env.status()), Ok(EnvStatus::Dying));
        assert_eq!(k.platform().mem.live_pages(), live);
        assert_eq!(k.allocate(None), Err(KernelError::NoFreeEnv));

        hw.set_cpu(1);
        assert_eq!(k.current(), Some(victim));
        assert!(k.reap_current());
        assert_eq!(k.current(), None);
        let newcomer = k.allocate(None).unwrap();
        assert_eq!(k.current(), None);
        assert_eq!(k.resolve(victim, false), Err(KernelError::BadEnv));
        assert_eq!(k.resolve(newcomer, false), Ok(newcomer));
    }

    #[test]
    fn current_elsewhere_is_deferred_whatever_its_status() {
        let k = kernel(2);
        let hw = &k.platform().hw;
        let victim = k.allocate(None).unwrap();
        run_on(&k, victim, 1);
        k.with_table(|t| {
            let idx = t.lookup(victim, None, false).unwrap();
            t.get_mut(idx).status = EnvStatus::NotRunnable;
        });

        hw.set_cpu(0);
        k.destroy(victim).unwrap();
        assert_eq!(k.inspect(victim, |env| env.status()), Ok(EnvStatus::Dying));
        hw.set_cpu(1);
        assert!(k.reap_current());
        assert_eq!(k.platform().mem.live_pages(), 0);
    }

    #[test]
    fn freeing_a_slot_current_elsewhere_is_fatal() {
        let k = kernel(2);
        let victim = k.allocate(None).unwrap();
        run_on(&k, victim, 1);
        k.platform().hw.set_cpu(0);
        let r = catch_unwind(AssertUnwindSafe(|| {
            k.with_table(|t| {
                let idx = t.lookup(victim, None, false).unwrap();
                k.free_locked(t, idx);
            })
        }));
        assert!(r.is_err());
    }

    #[test]
    fn destroying_the_caller_yields() {
        let k = kernel(2);
        let me = k.allocate(None).unwrap();
        run_on(&k, me, 0);
        expect_yield(|| {
            let _ = k.destroy(EnvId::CALLER);
        });
        assert_eq!(k.platform().host.yields(), 1);
        assert_eq!(k.with_table(|t| t.free_count()), 2);
        assert!(!k.envs.is_locked());
    }

    #[test]
    fn create_loads_and_applies_role() {
        let k = kernel(4);
        let image = ElfBuilder::new(0x80_0010)
            .segment(0x80_0000, &[0xcc; 0x30], 0x1800)
            .section(DEBUG_SECTIONS[0], b"info")
            .section(DEBUG_SECTIONS[2], b"line")
            .build();
        let fs = k.create(&image, ProcessRole::FileServer);
        let mem = &k.platform().mem;
        k.inspect(fs, |env| {
            assert!(matches!(env.kind(), EnvKind::Process(ProcessRole::FileServer)));
            assert!(env.trapframe().rflags.contains(Rflags::IOPL3 | Rflags::IF));
            assert_eq!(env.trapframe().rip, 0x80_0010);
            assert_eq!(env.trapframe().rsp, USTACKTOP);

            let mut pt = PageTable::<X86>::new(mem, env.root().unwrap());
            let read = |pt: &mut PageTable<X86>, va: usize, len: usize| -> Vec<u8> {
                let (pa, _) = pt.lookup(va).unwrap();
                let kva = mem.kva(pa) + (va % PAGE_SIZE);
                unsafe { core::slice::from_raw_parts(kva.as_ptr::<u8>(), len).to_vec() }
            };
            let mut text = vec![0xccu8; 0x30];
            text.push(0);
            assert_eq!(read(&mut pt, 0x80_0000, 0x31), text);
            assert!(pt.lookup(0x80_1000).is_some());
            assert!(pt.lookup(USTACKTOP - PAGE_SIZE).is_some());
            assert!(pt.lookup(USTACKTOP).is_none());
            assert_eq!(read(&mut pt, USTABDATA, 8), b"infoline");
        })
        .unwrap();
    }

    #[test]
    fn malformed_image_is_rejected() {
        let k = kernel(2);
        let id = k.allocate(None).unwrap();
        assert_eq!(k.try_load_image(id, b"not an elf"), Err(KernelError::NotExec));
        let mut truncated = ElfBuilder::new(0).segment(0x80_0000, &[1; 64], 64).build();
        truncated.truncate(100);
        assert_eq!(k.try_load_image(id, &truncated), Err(KernelError::NotExec));
        let bad = catch_unwind(AssertUnwindSafe(|| k.create(b"\x7fELF", ProcessRole::User)));
        assert!(bad.is_err());
        assert_eq!(k.with_table(|t| t.free_count()), 1);
    }

    #[test]
    fn segment_above_user_top_is_refused() {
        let k = kernel(2);
        let id = k.allocate(None).unwrap();
        let image = ElfBuilder::new(0).segment(UTOP as u64 - 8, &[1; 16], 16).build();
        assert_eq!(k.try_load_image(id, &image), Err(KernelError::Inval));
    }
}

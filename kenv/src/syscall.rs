//! Environment services a host process uses to build and start guests.
//!
//! Every call acts on behalf of the environment running on this
//! processor. Identity arguments must name the caller or one of its
//! immediate children.

use crate::{
    env::{
        address_space::copy_to_user, lifecycle::Blueprint, table::EnvTable, EnvId, EnvKind,
        EnvStatus,
    },
    error::{KernelError, MappingError},
    memlayout::UTOP,
    mm::Page,
    paging::{PageTable, PteFlags, X86},
    vmx::ept::{EptFlags, ExtendedPageTable},
    Kernel, Platform,
};
use abyss::addressing::{Gpa, Pa, Va};
use log::debug;

fn check_user_va(va: Va) -> Result<(), KernelError> {
    if va.into_usize() >= UTOP || !va.is_page_aligned() {
        Err(KernelError::Inval)
    } else {
        Ok(())
    }
}

impl<P: Platform> Kernel<P> {
    fn lookup_related(&self, table: &EnvTable, id: EnvId) -> Result<usize, KernelError> {
        table.lookup(id, self.caller(table), true)
    }

    /// Root table of the process in slot `idx`.
    fn process_root(table: &EnvTable, idx: usize) -> Result<Pa, KernelError> {
        let env = table.get(idx);
        match (&env.kind, env.root) {
            (EnvKind::Process(_), Some(root)) => Ok(root),
            _ => Err(KernelError::BadEnv),
        }
    }

    /// Create a guest with `phys_size` bytes of memory that will start at
    /// `entry`. It stays `NotRunnable` until its creator has loaded it.
    pub fn env_mkguest(&self, phys_size: usize, entry: Gpa) -> Result<EnvId, KernelError> {
        let mut table = self.envs.lock();
        let parent = self.caller(&table).map(|idx| table.get(idx).id);
        let idx =
            self.allocate_locked(&mut table, parent, Blueprint::Guest { phys_size, entry })?;
        let env = table.get_mut(idx);
        env.status = EnvStatus::NotRunnable;
        Ok(env.id)
    }

    /// Map a fresh zeroed page at `va` in `id`, replacing whatever was
    /// there.
    ///
    /// `perm` must include [`PteFlags::P`] and [`PteFlags::US`] and may add
    /// [`PteFlags::RW`].
    pub fn page_alloc(&self, id: EnvId, va: Va, perm: PteFlags) -> Result<(), KernelError> {
        check_user_va(va)?;
        let allowed = PteFlags::P | PteFlags::US | PteFlags::RW;
        if !perm.contains(PteFlags::P | PteFlags::US) || !allowed.contains(perm) {
            return Err(KernelError::Inval);
        }
        let table = self.envs.lock();
        let root = Self::process_root(&table, self.lookup_related(&table, id)?)?;
        let mem = self.mem();
        let page = Page::new(mem).ok_or(KernelError::NoMem)?;
        PageTable::<X86>::new(mem, root).map(va.into_usize(), page.pa(), perm.bits(), true)?;
        Ok(())
    }

    /// Unmap the page at `va` in `id`. Unmapping nothing succeeds.
    pub fn page_unmap(&self, id: EnvId, va: Va) -> Result<(), KernelError> {
        check_user_va(va)?;
        let table = self.envs.lock();
        let root = Self::process_root(&table, self.lookup_related(&table, id)?)?;
        match PageTable::<X86>::new(self.mem(), root).unmap(va.into_usize()) {
            Ok(_) | Err(MappingError::NotExist) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Copy `data` to `va` in `id`. The destination must be mapped.
    pub fn write_page(&self, id: EnvId, va: Va, data: &[u8]) -> Result<(), KernelError> {
        if va.into_usize().checked_add(data.len()).map_or(true, |end| end > UTOP) {
            return Err(KernelError::Inval);
        }
        let table = self.envs.lock();
        let root = Self::process_root(&table, self.lookup_related(&table, id)?)?;
        copy_to_user(self.mem(), root, va, data)
    }

    /// Share the page at `src_va` of process `src` with `guest` at `gpa`.
    ///
    /// `perm` must be a non-empty subset of [`EptFlags::FULL`] and may only
    /// grant writes if the source page is writable. An existing mapping at
    /// `gpa` is not replaced.
    pub fn ept_map(
        &self,
        src: EnvId,
        src_va: Va,
        guest: EnvId,
        gpa: Gpa,
        perm: EptFlags,
    ) -> Result<(), KernelError> {
        check_user_va(src_va)?;
        if perm.is_empty() || !EptFlags::FULL.contains(perm) || !gpa.is_page_aligned() {
            return Err(KernelError::Inval);
        }
        let table = self.envs.lock();
        let src_root = Self::process_root(&table, self.lookup_related(&table, src)?)?;
        let guest_idx = self.lookup_related(&table, guest)?;
        let guest_env = table.get(guest_idx);
        let (phys_size, ept_root) = match (&guest_env.kind, guest_env.root) {
            (EnvKind::Guest(block), Some(root)) => (block.phys_size(), root),
            _ => return Err(KernelError::BadEnv),
        };
        if gpa.into_usize() >= phys_size {
            return Err(KernelError::Inval);
        }

        let mem = self.mem();
        let (frame, flags) = PageTable::<X86>::new(mem, src_root)
            .lookup(src_va.into_usize())
            .ok_or(KernelError::Inval)?;
        if perm.contains(EptFlags::WRITE) && flags & PteFlags::RW.bits() == 0 {
            return Err(KernelError::Inval);
        }
        ExtendedPageTable::new(mem, ept_root).map(frame, gpa, perm, false)?;
        Ok(())
    }

    /// Mark `id` runnable or not runnable.
    pub fn env_set_status(&self, id: EnvId, status: EnvStatus) -> Result<(), KernelError> {
        if !matches!(status, EnvStatus::Runnable | EnvStatus::NotRunnable) {
            return Err(KernelError::Inval);
        }
        let mut table = self.envs.lock();
        let idx = self.lookup_related(&table, id)?;
        let env = table.get_mut(idx);
        match env.status {
            EnvStatus::Dying => return Err(KernelError::BadEnv),
            // Keeps running until it next enters the kernel.
            EnvStatus::Running if status == EnvStatus::Runnable => (),
            _ => env.status = status,
        }
        debug!("{} is now {:?}", env.id, env.status);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        memlayout::{GUEST_ENTRY, GUEST_MEM_SZ, UTEMP},
        testing::{test_kernel, TestPlatform},
        KernelConfig,
    };
    use abyss::{addressing::PAGE_SIZE, PhysicalMemory};

    fn kernel() -> Kernel<TestPlatform> {
        test_kernel(KernelConfig::new().capacity(8))
    }

    fn run_on_cpu0(k: &Kernel<TestPlatform>, id: EnvId) {
        k.with_table(|t| {
            let idx = t.lookup(id, None, false).unwrap();
            k.prepare_run(t, idx).unwrap();
        });
    }

    fn utemp() -> Va {
        Va::new(UTEMP).unwrap()
    }

    fn read_user(k: &Kernel<TestPlatform>, id: EnvId, va: Va, len: usize) -> Vec<u8> {
        let mem = &k.platform().mem;
        let root = k.inspect(id, |e| e.root().unwrap()).unwrap();
        let (frame, _) = PageTable::<X86>::new(mem, root)
            .lookup(va.into_usize())
            .unwrap();
        let base = mem.kva(frame).as_ptr::<u8>() as *const u8;
        unsafe { core::slice::from_raw_parts(base.add(va.page_offset()), len) }.to_vec()
    }

    /// A loader process on processor 0 with one child guest.
    fn loader_and_guest(k: &Kernel<TestPlatform>) -> (EnvId, EnvId) {
        let loader = k.allocate(None).unwrap();
        run_on_cpu0(k, loader);
        let guest = k
            .env_mkguest(GUEST_MEM_SZ, Gpa::new(GUEST_ENTRY).unwrap())
            .unwrap();
        (loader, guest)
    }

    #[test]
    fn new_guest_waits_for_its_parent() {
        let k = kernel();
        let (loader, guest) = loader_and_guest(&k);
        assert_eq!(
            k.inspect(guest, |e| (e.status(), e.parent(), e.kind().is_guest())),
            Ok((EnvStatus::NotRunnable, Some(loader), true))
        );
        assert_eq!(k.vmdisk_number(), 1);
    }

    #[test]
    fn alloc_write_unmap() {
        let k = kernel();
        let (_, _) = loader_and_guest(&k);
        let perm = PteFlags::P | PteFlags::US | PteFlags::RW;

        k.page_alloc(EnvId::CALLER, utemp(), perm).unwrap();
        k.write_page(EnvId::CALLER, utemp() + 0x10, b"boot").unwrap();
        let me = k.current().unwrap();
        assert_eq!(read_user(&k, me, utemp() + 0x10, 4), b"boot");
        assert_eq!(read_user(&k, me, utemp(), 4), [0; 4]);

        // A second allocation replaces the page with a clean one.
        k.page_alloc(EnvId::CALLER, utemp(), perm).unwrap();
        assert_eq!(read_user(&k, me, utemp() + 0x10, 4), [0; 4]);

        k.page_unmap(EnvId::CALLER, utemp()).unwrap();
        k.page_unmap(EnvId::CALLER, utemp()).unwrap();
        assert_eq!(
            k.write_page(EnvId::CALLER, utemp(), b"x"),
            Err(KernelError::Inval)
        );
    }

    #[test]
    fn bad_arguments_are_rejected() {
        let k = kernel();
        let (_, guest) = loader_and_guest(&k);
        let perm = PteFlags::P | PteFlags::US;

        let unaligned = utemp() + 1;
        assert_eq!(k.page_alloc(EnvId::CALLER, unaligned, perm), Err(KernelError::Inval));
        let high = Va::new(UTOP).unwrap();
        assert_eq!(k.page_alloc(EnvId::CALLER, high, perm), Err(KernelError::Inval));
        assert_eq!(
            k.page_alloc(EnvId::CALLER, utemp(), PteFlags::P),
            Err(KernelError::Inval)
        );
        assert_eq!(
            k.page_alloc(EnvId::CALLER, utemp(), perm | PteFlags::PCD),
            Err(KernelError::Inval)
        );
        // A guest has no host page table to map into.
        assert_eq!(k.page_alloc(guest, utemp(), perm), Err(KernelError::BadEnv));
        assert_eq!(
            k.write_page(EnvId::CALLER, Va::new(UTOP - 2).unwrap(), b"abcd"),
            Err(KernelError::Inval)
        );
    }

    #[test]
    fn unrelated_environments_are_off_limits() {
        let k = kernel();
        let (_, guest) = loader_and_guest(&k);
        let stranger = k.allocate(None).unwrap();
        let perm = PteFlags::P | PteFlags::US;

        assert_eq!(k.page_alloc(stranger, utemp(), perm), Err(KernelError::BadEnv));
        assert_eq!(
            k.env_set_status(stranger, EnvStatus::NotRunnable),
            Err(KernelError::BadEnv)
        );

        // The stranger cannot touch the guest either.
        run_on_cpu0(&k, stranger);
        assert_eq!(
            k.env_set_status(guest, EnvStatus::Runnable),
            Err(KernelError::BadEnv)
        );
    }

    #[test]
    fn sharing_a_page_with_the_guest() {
        let k = kernel();
        let (_, guest) = loader_and_guest(&k);
        let mem = &k.platform().mem;
        k.page_alloc(EnvId::CALLER, utemp(), PteFlags::P | PteFlags::US | PteFlags::RW)
            .unwrap();
        k.write_page(EnvId::CALLER, utemp(), &[0xeb, 0xfe]).unwrap();

        let gpa = Gpa::new(GUEST_ENTRY).unwrap();
        k.ept_map(EnvId::CALLER, utemp(), guest, gpa, EptFlags::FULL)
            .unwrap();
        let ept_root = k.inspect(guest, |e| e.root().unwrap()).unwrap();
        let (frame, perm) = ExtendedPageTable::new(mem, ept_root).translate(gpa).unwrap();
        assert_eq!(perm & EptFlags::FULL, EptFlags::FULL);

        // The loader can drop its view; the guest keeps the frame.
        k.page_unmap(EnvId::CALLER, utemp()).unwrap();
        assert!(mem.is_live(frame));
        assert_eq!(mem.refcount(frame), 1);

        k.page_alloc(EnvId::CALLER, utemp(), PteFlags::P | PteFlags::US)
            .unwrap();
        assert_eq!(
            k.ept_map(EnvId::CALLER, utemp(), guest, gpa, EptFlags::READ),
            Err(KernelError::Inval),
            "no overwrite"
        );
        let other = Gpa::new(0x8000).unwrap();
        assert_eq!(
            k.ept_map(EnvId::CALLER, utemp(), guest, other, EptFlags::FULL),
            Err(KernelError::Inval),
            "source is read-only"
        );
        assert_eq!(
            k.ept_map(EnvId::CALLER, utemp(), guest, other, EptFlags::empty()),
            Err(KernelError::Inval)
        );
        assert_eq!(
            k.ept_map(EnvId::CALLER, utemp(), guest, other, EptFlags::UNOWNED),
            Err(KernelError::Inval)
        );
        let beyond = Gpa::new(GUEST_MEM_SZ).unwrap();
        assert_eq!(
            k.ept_map(EnvId::CALLER, utemp(), guest, beyond, EptFlags::READ),
            Err(KernelError::Inval)
        );
        assert_eq!(
            k.ept_map(EnvId::CALLER, utemp(), EnvId::CALLER, other, EptFlags::READ),
            Err(KernelError::BadEnv),
            "target is not a guest"
        );
        let unmapped = utemp() + PAGE_SIZE;
        assert_eq!(
            k.ept_map(EnvId::CALLER, unmapped, guest, other, EptFlags::READ),
            Err(KernelError::Inval)
        );
        k.ept_map(EnvId::CALLER, utemp(), guest, other, EptFlags::READ | EptFlags::EXECUTE)
            .unwrap();
    }

    #[test]
    fn status_changes() {
        let k = kernel();
        let (_, guest) = loader_and_guest(&k);
        k.env_set_status(guest, EnvStatus::Runnable).unwrap();
        assert_eq!(k.inspect(guest, |e| e.status()), Ok(EnvStatus::Runnable));
        assert_eq!(
            k.env_set_status(guest, EnvStatus::Running),
            Err(KernelError::Inval)
        );
        assert_eq!(
            k.env_set_status(guest, EnvStatus::Free),
            Err(KernelError::Inval)
        );

        // The caller itself is running and stays so.
        k.env_set_status(EnvId::CALLER, EnvStatus::Runnable).unwrap();
        assert_eq!(k.inspect(k.current().unwrap(), |e| e.status()), Ok(EnvStatus::Running));
    }
}

//! Resuming an environment on the current processor.
//!
//! The bookkeeping happens under the table lock; the lock is dropped
//! before the processor leaves for ring 3 or for the guest, so nothing
//! that outlives this module may borrow from the table. What crosses the
//! gap is a raw pointer into the record, which stays put because the
//! table never reallocates.

use crate::{
    env::{table::EnvTable, Env, EnvId, EnvKind, EnvStatus},
    error::{KernelError, VmError},
    vmx::vmcs::ActiveVmcs,
    Kernel, Platform,
};
use abyss::interrupt::{GeneralPurposeRegisters, Trapframe};
use log::error;

/// How to enter the environment picked by [`Kernel::prepare_run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Pop this frame into ring 3.
    User(*const Trapframe),
    /// Enter the guest whose control structure is now current.
    Guest {
        gprs: *mut GeneralPurposeRegisters,
        launched: bool,
    },
}

impl<P: Platform> Kernel<P> {
    /// Make `idx` the environment of this processor and prepare the
    /// hardware for entering it.
    ///
    /// Panics if `idx` is current on another processor or is not
    /// runnable.
    pub(crate) fn prepare_run(
        &self,
        table: &mut EnvTable,
        idx: usize,
    ) -> Result<Dispatch, VmError> {
        let hw = self.hw();
        let cpu = hw.cpu_id();

        if table.current(cpu) != Some(idx) {
            let target = table.get(idx);
            if let Some(owner) = table.running_on(idx) {
                panic!("{} dispatched on cpu {} while current on cpu {}", target.id, cpu, owner);
            }
            assert!(
                matches!(target.status, EnvStatus::Runnable | EnvStatus::Running),
                "{} dispatched while {:?}",
                target.id,
                target.status
            );
            if let Some(prev) = table.current(cpu) {
                let prev = table.get_mut(prev);
                if prev.status == EnvStatus::Running {
                    prev.status = EnvStatus::Runnable;
                }
            }
            table.set_current(cpu, Some(idx));
            let env = table.get_mut(idx);
            env.status = EnvStatus::Running;
            env.runs += 1;
            if let (EnvKind::Process(_), Some(root)) = (&env.kind, env.root) {
                hw.load_address_space(root);
            }
        } else if table.get(idx).status == EnvStatus::Runnable {
            table.get_mut(idx).status = EnvStatus::Running;
        }

        let Env {
            id,
            status,
            kind,
            tf,
            root,
            ..
        } = table.get_mut(idx);
        assert_eq!(
            *status,
            EnvStatus::Running,
            "{} dispatched while {:?}",
            id,
            status
        );

        match kind {
            EnvKind::Process(_) => Ok(Dispatch::User(tf as *const Trapframe)),
            EnvKind::Guest(guest) => {
                let root = (*root).ok_or(KernelError::BadEnv)?;
                let vmcs = ActiveVmcs::activate(hw, guest.vmcs())?;
                let launched = guest.prepare_entry(&vmcs, root, tf)?;
                Ok(Dispatch::Guest {
                    gprs: &mut tf.regs as *mut GeneralPurposeRegisters,
                    launched,
                })
            }
        }
    }

    /// Run `id` on this processor.
    ///
    /// A process resumes in ring 3, a guest resumes under virtualization.
    /// Either way control only comes back through a trap or a VM exit.
    pub fn run(&self, id: EnvId) -> ! {
        let hw = self.hw();
        let dispatch = {
            let mut table = self.envs.lock();
            let idx = match table.lookup(id, None, false) {
                Ok(idx) => idx,
                Err(e) => panic!("run {}: {}", id, e),
            };
            self.prepare_run(&mut table, idx)
        };

        match dispatch {
            // SAFETY: the frame belongs to this processor's current
            // environment, whose address space was just installed.
            Ok(Dispatch::User(tf)) => unsafe { hw.enter_user(&*tf) },
            // SAFETY: the registers live in the record of the running
            // guest, which no one else frees while it is `Running` here.
            Ok(Dispatch::Guest { gprs, launched }) => unsafe { hw.vm_enter(gprs, launched) },
            Err(e) => {
                error!("{} cannot be entered: {}", id, e);
                let _ = self.destroy(id);
                self.host().sched_yield()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        memlayout::{GUEST_ENTRY, GUEST_MEM_SZ},
        testing::{test_kernel, TestPlatform},
        vmx::{ept::eptp, vmcs::Field},
        KernelConfig,
    };
    use abyss::addressing::Gpa;
    use std::panic::{catch_unwind, AssertUnwindSafe};

    fn kernel() -> Kernel<TestPlatform> {
        test_kernel(KernelConfig::new().capacity(8))
    }

    fn prepare(k: &Kernel<TestPlatform>, id: EnvId) -> Result<Dispatch, VmError> {
        let mut table = k.envs.lock();
        let idx = table.lookup(id, None, false).unwrap();
        k.prepare_run(&mut table, idx)
    }

    #[test]
    fn switching_processes_demotes_the_previous_one() {
        let k = kernel();
        let a = k.allocate(None).unwrap();
        let b = k.allocate(None).unwrap();

        assert!(matches!(prepare(&k, a), Ok(Dispatch::User(_))));
        assert_eq!(k.inspect(a, |e| (e.status(), e.runs())), Ok((EnvStatus::Running, 1)));
        assert_eq!(k.current(), Some(a));

        prepare(&k, b).unwrap();
        assert_eq!(k.inspect(a, |e| e.status()), Ok(EnvStatus::Runnable));
        assert_eq!(k.inspect(b, |e| (e.status(), e.runs())), Ok((EnvStatus::Running, 1)));

        // Resuming the current environment does not count as a new run.
        prepare(&k, b).unwrap();
        assert_eq!(k.inspect(b, |e| e.runs()), Ok(1));

        let roots = k.platform().hw.loaded_roots();
        let root_of = |id| k.inspect(id, |e| e.root()).unwrap();
        assert_eq!(roots, [root_of(a), root_of(b)]);
    }

    #[test]
    fn dispatching_a_stopped_environment_is_fatal() {
        let k = kernel();
        let a = k.allocate(None).unwrap();
        k.with_table(|t| {
            let idx = t.lookup(a, None, false).unwrap();
            t.get_mut(idx).status = EnvStatus::NotRunnable;
        });
        let r = catch_unwind(AssertUnwindSafe(|| prepare(&k, a)));
        assert!(r.is_err());
    }

    #[test]
    fn one_environment_runs_on_one_processor() {
        let k = kernel();
        let hw = &k.platform().hw;
        let a = k.allocate(None).unwrap();
        prepare(&k, a).unwrap();

        hw.set_cpu(1);
        let r = catch_unwind(AssertUnwindSafe(|| prepare(&k, a)));
        assert!(r.is_err());
        assert_eq!(k.current(), None);
        hw.set_cpu(0);
        assert_eq!(k.current(), Some(a));
        assert_eq!(k.inspect(a, |e| (e.status(), e.runs())), Ok((EnvStatus::Running, 1)));
    }

    #[test]
    fn dying_environment_is_never_resumed() {
        let k = kernel();
        let hw = &k.platform().hw;
        let a = k.allocate(None).unwrap();
        prepare(&k, a).unwrap();

        hw.set_cpu(1);
        k.destroy(a).unwrap();
        assert_eq!(k.inspect(a, |e| e.status()), Ok(EnvStatus::Dying));
        assert!(catch_unwind(AssertUnwindSafe(|| prepare(&k, a))).is_err());

        hw.set_cpu(0);
        assert!(catch_unwind(AssertUnwindSafe(|| prepare(&k, a))).is_err());
        assert_eq!(k.inspect(a, |e| e.status()), Ok(EnvStatus::Dying));
        assert!(k.reap_current());
    }

    #[test]
    fn guest_entry_programs_the_control_structure() {
        let k = kernel();
        let hw = &k.platform().hw;
        let g = k
            .allocate_guest(None, GUEST_MEM_SZ, Gpa::new(GUEST_ENTRY).unwrap())
            .unwrap();
        let (vmcs, root) = k
            .inspect(g, |e| (e.guest().unwrap().vmcs(), e.root().unwrap()))
            .unwrap();

        match prepare(&k, g).unwrap() {
            Dispatch::Guest { launched, .. } => assert!(!launched),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(hw.current_vmcs(), Some(vmcs));
        assert_eq!(hw.field(vmcs, Field::GuestRip as u32), Some(GUEST_ENTRY as u64));
        assert_eq!(hw.field(vmcs, Field::Eptptr as u32), Some(eptp(root)));
        // Guests never switch the host address space.
        assert!(hw.loaded_roots().is_empty());

        match prepare(&k, g).unwrap() {
            Dispatch::Guest { launched, .. } => assert!(launched),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn run_drops_the_lock_before_entering() {
        let k = kernel();
        let a = k.allocate(None).unwrap();
        assert!(catch_unwind(AssertUnwindSafe(|| k.run(a))).is_err());
        assert!(!k.envs.is_locked());
        assert_eq!(k.inspect(a, |e| e.status()), Ok(EnvStatus::Running));
    }
}

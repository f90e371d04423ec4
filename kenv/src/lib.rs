//! The execution core of the kernel.
//!
//! An *environment* is the unit the kernel schedules: either an ordinary
//! ring 3 process or a guest running under hardware virtualization. This
//! crate owns the table of environments and everything that happens to one
//! of them between creation and teardown:
//!
//! - the arena of records with generation-checked identities ([`env::table`]),
//! - creation, image loading and destruction ([`env::lifecycle`]),
//! - building process address spaces and guest EPTs ([`env::address_space`],
//!   [`vmx::ept`]),
//! - resuming an environment on the current processor ([`dispatch`]),
//! - emulating the privileged operations a guest traps on ([`vmexit`]),
//! - the handful of calls a user-level monitor needs to assemble a guest
//!   ([`syscall`]).
//!
//! The core never touches hardware directly. Frame allocation goes through
//! [`PhysicalMemory`], instructions the compiler cannot emit go through
//! [`HardwareContext`], and the scheduler and message passing belong to
//! the embedding kernel behind [`HostServices`].
//!
//! ## Locking
//! One [`SpinLock`] guards the whole table. It is taken on every kernel
//! entry and released before control leaves for an environment or for a
//! host service that may reschedule.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod dispatch;
pub mod env;
pub mod error;
pub mod memlayout;
pub mod mm;
pub mod paging;
pub mod syscall;
#[cfg(any(test, feature = "mock"))]
pub mod testing;
pub mod vmexit;
pub mod vmx;

use abyss::{addressing::Va, HardwareContext, PhysicalMemory};
use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use env::{table::EnvTable, Env, EnvId};
use error::KernelError;
use spin_lock::SpinLock;

/// Services of the embedding kernel that the core calls into.
///
/// None of these is invoked with the table lock held.
pub trait HostServices: Send + Sync {
    /// Try to deliver `value` from `from` to `to`, along with the page at
    /// `page` if there is one.
    fn ipc_try_send(
        &self,
        from: EnvId,
        to: EnvId,
        value: u64,
        page: Option<Va>,
        perm: u64,
    ) -> Result<(), KernelError>;

    /// Wait for a message on behalf of `receiver`.
    ///
    /// A host that blocks by rescheduling never returns here; the sender
    /// then stores the value into the receiver's saved `rax` itself.
    fn ipc_recv(&self, receiver: EnvId) -> Result<u64, KernelError>;

    /// Give up the processor and run something else.
    fn sched_yield(&self) -> !;
}

/// Everything the core needs from the machine it runs on.
pub trait Platform: Send + Sync {
    fn memory(&self) -> &dyn PhysicalMemory;
    fn hardware(&self) -> &dyn HardwareContext;
    fn host(&self) -> &dyn HostServices;
}

/// Runtime knobs of a [`Kernel`].
///
/// ```
/// use kenv::KernelConfig;
///
/// let config = KernelConfig::new().capacity(64);
/// assert_eq!(config.get_capacity(), 64);
/// ```
#[derive(Clone, Copy, Debug)]
pub struct KernelConfig {
    capacity: usize,
    host_shell: Option<&'static [u8]>,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            capacity: memlayout::NENV,
            host_shell: None,
        }
    }
}

impl KernelConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of environment slots. At most `1 << ENVGENSHIFT`.
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Image spawned when a guest hands control back to the host.
    pub fn host_shell(mut self, image: &'static [u8]) -> Self {
        self.host_shell = Some(image);
        self
    }

    pub fn get_capacity(&self) -> usize {
        self.capacity
    }

    pub fn get_host_shell(&self) -> Option<&'static [u8]> {
        self.host_shell
    }
}

/// The environment manager.
pub struct Kernel<P: Platform> {
    platform: P,
    config: KernelConfig,
    pub(crate) envs: SpinLock<EnvTable>,
    vcpu_count: AtomicUsize,
    vmdisk_number: AtomicU32,
}

impl<P: Platform> Kernel<P> {
    /// Build a kernel whose table holds `config.capacity` free slots.
    pub fn new(platform: P, config: KernelConfig) -> Self {
        Self {
            envs: SpinLock::new(EnvTable::new(config.capacity)),
            platform,
            config,
            vcpu_count: AtomicUsize::new(0),
            vmdisk_number: AtomicU32::new(0),
        }
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    #[inline]
    pub(crate) fn mem(&self) -> &dyn PhysicalMemory {
        self.platform.memory()
    }

    #[inline]
    pub(crate) fn hw(&self) -> &dyn HardwareContext {
        self.platform.hardware()
    }

    #[inline]
    pub(crate) fn host(&self) -> &dyn HostServices {
        self.platform.host()
    }

    /// Run `f` with the table locked.
    pub fn with_table<R>(&self, f: impl FnOnce(&mut EnvTable) -> R) -> R {
        f(&mut self.envs.lock())
    }

    /// Run `f` over the live record named by `id`, from kernel context.
    pub fn inspect<R>(&self, id: EnvId, f: impl FnOnce(&Env) -> R) -> Result<R, KernelError> {
        let table = self.envs.lock();
        let idx = table.lookup(id, None, false)?;
        Ok(f(table.get(idx)))
    }

    /// Environment running on this processor.
    pub fn current(&self) -> Option<EnvId> {
        let table = self.envs.lock();
        table
            .current(self.hw().cpu_id())
            .map(|idx| table.get(idx).id())
    }

    /// Virtual CPUs handed out so far.
    pub fn vcpu_count(&self) -> usize {
        self.vcpu_count.load(Ordering::SeqCst)
    }

    /// Disk image number given to the most recent guest; zero before the
    /// first one.
    pub fn vmdisk_number(&self) -> u32 {
        self.vmdisk_number.load(Ordering::SeqCst)
    }

    pub(crate) fn next_vcpu(&self) -> usize {
        self.vcpu_count.fetch_add(1, Ordering::SeqCst)
    }

    pub(crate) fn next_vmdisk(&self) -> u32 {
        self.vmdisk_number.fetch_add(1, Ordering::SeqCst) + 1
    }
}

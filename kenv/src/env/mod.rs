//! Environments: the records the kernel schedules.
//!
//! An environment is either an ordinary ring 3 process or a hardware
//! virtualized guest. Both share the same header; only guests carry a
//! [`GuestBlock`].

pub mod address_space;
pub mod lifecycle;
pub mod loader;
pub mod table;

use crate::vmx::guest::GuestBlock;
use abyss::{addressing::Pa, interrupt::Trapframe};
use alloc::boxed::Box;
use core::fmt;

/// Identity of one occupancy of an environment slot.
///
/// The low bits name the slot, the bits from
/// [`ENVGENSHIFT`](crate::memlayout::ENVGENSHIFT) up count how often it was
/// handed out. Zero never names a record; it stands for the caller.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EnvId(i32);

impl EnvId {
    /// The calling environment.
    pub const CALLER: EnvId = EnvId(0);

    #[inline]
    pub const fn from_raw(raw: i32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn into_raw(self) -> i32 {
        self.0
    }

    /// Slot this identity names, given the table's index mask.
    #[inline]
    pub(crate) const fn slot(self, index_mask: usize) -> usize {
        self.0 as usize & index_mask
    }

    /// Generation part of the identity.
    #[inline]
    pub const fn generation(self) -> i32 {
        self.0 >> crate::memlayout::ENVGENSHIFT
    }
}

impl fmt::Debug for EnvId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:08x}]", self.0)
    }
}

impl fmt::Display for EnvId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:08x}]", self.0)
    }
}

/// Scheduling state of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvStatus {
    Free,
    Runnable,
    Running,
    NotRunnable,
    /// Destroyed while running elsewhere; torn down on its next kernel entry.
    Dying,
}

/// What a process is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessRole {
    User,
    /// The file server. Runs with IOPL 3 and receives guest file requests.
    FileServer,
}

/// Variant part of a record.
#[derive(Debug)]
pub enum EnvKind {
    Process(ProcessRole),
    Guest(Box<GuestBlock>),
}

impl EnvKind {
    pub fn is_guest(&self) -> bool {
        matches!(self, EnvKind::Guest(_))
    }
}

/// One slot of the environment table.
#[derive(Debug)]
pub struct Env {
    pub(crate) link: Option<usize>,
    pub(crate) id: EnvId,
    pub(crate) parent: Option<EnvId>,
    pub(crate) status: EnvStatus,
    pub(crate) kind: EnvKind,
    pub(crate) tf: Trapframe,
    pub(crate) root: Option<Pa>,
    pub(crate) runs: u64,
    pub(crate) fault_upcall: Option<usize>,
    pub(crate) ipc_receiving: bool,
}

impl Env {
    pub(crate) fn empty() -> Self {
        Self {
            link: None,
            id: EnvId::CALLER,
            parent: None,
            status: EnvStatus::Free,
            kind: EnvKind::Process(ProcessRole::User),
            tf: Trapframe::default(),
            root: None,
            runs: 0,
            fault_upcall: None,
            ipc_receiving: false,
        }
    }

    pub fn id(&self) -> EnvId {
        self.id
    }

    pub fn parent(&self) -> Option<EnvId> {
        self.parent
    }

    pub fn status(&self) -> EnvStatus {
        self.status
    }

    pub fn kind(&self) -> &EnvKind {
        &self.kind
    }

    pub fn trapframe(&self) -> &Trapframe {
        &self.tf
    }

    pub fn trapframe_mut(&mut self) -> &mut Trapframe {
        &mut self.tf
    }

    /// Root of the page table, or of the EPT for a guest.
    pub fn root(&self) -> Option<Pa> {
        self.root
    }

    pub fn runs(&self) -> u64 {
        self.runs
    }

    pub fn fault_upcall(&self) -> Option<usize> {
        self.fault_upcall
    }

    pub fn set_fault_upcall(&mut self, upcall: Option<usize>) {
        self.fault_upcall = upcall;
    }

    pub fn ipc_receiving(&self) -> bool {
        self.ipc_receiving
    }

    pub fn set_ipc_receiving(&mut self, receiving: bool) {
        self.ipc_receiving = receiving;
    }

    pub fn guest(&self) -> Option<&GuestBlock> {
        match &self.kind {
            EnvKind::Guest(block) => Some(block),
            EnvKind::Process(_) => None,
        }
    }

    pub fn guest_mut(&mut self) -> Option<&mut GuestBlock> {
        match &mut self.kind {
            EnvKind::Guest(block) => Some(block),
            EnvKind::Process(_) => None,
        }
    }
}

//! Handling VM exits.
//!
//! When a guest traps, the platform stores its general purpose registers
//! back into the guest's record and calls [`Kernel::vmexit`]. The driver
//! pulls `rip`, `rsp` and `rflags` out of the control structure, looks the
//! basic exit reason up in [`HANDLERS`] and runs the matching handler.
//!
//! A handler only reports what it did:
//! - [`VmexitResult::Handled`]: the trapped instruction is emulated; the
//!   driver steps over it using the length the processor reported.
//! - [`VmexitResult::Resume`]: re-execute at the current `rip` (a fault
//!   that was fixed up, or a handler that moved `rip` itself).
//! - [`VmexitResult::Unhandled`]: the operation cannot be emulated.
//!
//! What to do with an unhandled guest is the caller's decision; the
//! driver never tears a guest down by itself.

mod cpuid;
mod ept;
mod hypercall;
mod interrupt;
mod msr;
mod pio;

pub use hypercall::Hypercall;

use crate::{
    env::{Env, EnvId, EnvKind, EnvStatus, ProcessRole},
    error::{KernelError, VmError},
    memlayout::VMX_HOST_FS_ENV,
    vmx::{
        ept::ExtendedPageTable,
        guest::GuestBlock,
        vmcs::{ActiveVmcs, BasicExitReason, ExitReason, Field, Probe},
    },
    Kernel, Platform,
};
use abyss::{
    addressing::{Gpa, Pa, Va},
    interrupt::Trapframe,
    x86_64::Rflags,
    HardwareContext, PhysicalMemory,
};
use log::{debug, info, warn};

/// Outcome of one exit handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmexitResult {
    Handled,
    Resume,
    Unhandled,
}

/// Work a handler leaves for the driver because it needs the rest of the
/// table or a host service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HostCall {
    Send {
        to: EnvId,
        value: u64,
        page: Option<Va>,
        perm: u64,
    },
    Recv,
    BackToHost,
}

/// What a handler gets to work with.
pub struct ExitCtx<'a> {
    pub id: EnvId,
    pub vmcs: &'a ActiveVmcs<'a>,
    pub mem: &'a dyn PhysicalMemory,
    pub hw: &'a dyn HardwareContext,
    pub tf: &'a mut Trapframe,
    pub guest: &'a mut GuestBlock,
    pub ept_root: Pa,
    pub(crate) deferred: Option<HostCall>,
}

impl<'a> ExitCtx<'a> {
    /// The guest's EPT.
    pub fn ept(&self) -> ExtendedPageTable<'a> {
        ExtendedPageTable::new(self.mem, self.ept_root)
    }
}

/// Fetches guest memory through an EPT.
struct EptProbe<'a> {
    mem: &'a dyn PhysicalMemory,
    root: Pa,
}

impl Probe for EptProbe<'_> {
    fn gpa2hva(&self, gpa: Gpa) -> Option<Va> {
        ExtendedPageTable::new(self.mem, self.root).gpa_to_hva(gpa)
    }
}

/// Signature of an exit handler.
pub type Handler = fn(&mut ExitCtx<'_>) -> Result<VmexitResult, VmError>;

/// Exit reasons this kernel emulates. Everything else is unhandled.
pub const HANDLERS: [(BasicExitReason, Handler); 8] = [
    (BasicExitReason::Cpuid, cpuid::handle),
    (BasicExitReason::Rdmsr, msr::rdmsr),
    (BasicExitReason::Wrmsr, msr::wrmsr),
    (BasicExitReason::IoInstruction, pio::handle),
    (BasicExitReason::EptViolation, ept::handle),
    (BasicExitReason::Vmcall, hypercall::handle),
    (BasicExitReason::ExternalInt, interrupt::external),
    (BasicExitReason::InterruptWindow, interrupt::window),
];

/// Handler for `reason`, if there is one.
pub fn handler(reason: BasicExitReason) -> Option<Handler> {
    HANDLERS
        .iter()
        .find(|(r, _)| *r == reason)
        .map(|(_, handler)| *handler)
}

impl<P: Platform> Kernel<P> {
    /// Handle the exit of the guest current on this processor and leave
    /// it ready to be resumed.
    pub fn handle_vmexit(&self) -> Result<VmexitResult, VmError> {
        let (mem, hw) = (self.mem(), self.hw());
        let mut table = self.envs.lock();
        let idx = self.caller(&table).ok_or(KernelError::BadEnv)?;

        let (id, result, deferred) = {
            let Env {
                id, kind, tf, root, ..
            } = table.get_mut(idx);
            let guest = match kind {
                EnvKind::Guest(guest) => &mut **guest,
                EnvKind::Process(_) => return Err(KernelError::BadEnv.into()),
            };
            let ept_root = (*root).ok_or(KernelError::BadEnv)?;
            let vmcs = ActiveVmcs::current(hw);
            tf.rip = vmcs.read(Field::GuestRip)? as usize;
            tf.rsp = vmcs.read(Field::GuestRsp)? as usize;
            tf.rflags = Rflags::from_bits_truncate(vmcs.read(Field::GuestRflags)?);

            let reason = vmcs.exit_reason()?;
            let mut ctx = ExitCtx {
                id: *id,
                vmcs: &vmcs,
                mem,
                hw,
                tf,
                guest,
                ept_root,
                deferred: None,
            };
            let result = match reason {
                ExitReason::BasicExitReason(basic) => match handler(basic) {
                    Some(handle) => handle(&mut ctx)?,
                    None => VmexitResult::Unhandled,
                },
                ExitReason::EntryFailure(_) => VmexitResult::Unhandled,
            };
            match result {
                VmexitResult::Handled => ctx.tf.rip += vmcs.instruction_length()?,
                VmexitResult::Resume => (),
                VmexitResult::Unhandled => {
                    let probe = EptProbe {
                        mem,
                        root: ept_root,
                    };
                    match vmcs.get_instruction(&probe) {
                        Ok(insn) => warn!(
                            "{} unhandled {:?} at {:#x}: {}",
                            id, reason, ctx.tf.rip, insn
                        ),
                        Err(_) => warn!("{} unhandled {:?} at {:#x}", id, reason, ctx.tf.rip),
                    }
                }
            }
            (*id, result, ctx.deferred.take())
        };

        match deferred {
            None => (),
            Some(HostCall::BackToHost) => {
                table.get_mut(idx).status = EnvStatus::NotRunnable;
                info!("{} halted in the background, back to the host", id);
                if let Some(shell) = self.config().get_host_shell() {
                    if let Err(e) = self.create_locked(&mut table, shell, ProcessRole::User) {
                        warn!("cannot spawn the host shell: {}", e);
                    }
                }
            }
            Some(HostCall::Send {
                to,
                value,
                page,
                perm,
            }) => {
                let to = if to.into_raw() == VMX_HOST_FS_ENV {
                    table
                        .find(|env| matches!(env.kind, EnvKind::Process(ProcessRole::FileServer)))
                        .map_or(to, |fs| table.get(fs).id)
                } else {
                    to
                };
                drop(table);
                if let Err(e) = self.host().ipc_try_send(id, to, value, page, perm) {
                    debug!("{} ipc send to {}: {}", id, to, e);
                }
            }
            Some(HostCall::Recv) => {
                drop(table);
                let rax = match self.host().ipc_recv(id) {
                    Ok(value) => value,
                    Err(e) => e.code() as u64,
                };
                let mut table = self.envs.lock();
                // The guest may have been destroyed while waiting.
                if let Ok(idx) = table.lookup(id, None, false) {
                    table.get_mut(idx).tf.regs.rax = rax as usize;
                }
            }
        }
        Ok(result)
    }

    /// Kernel entry for a VM exit on this processor.
    ///
    /// Resumes the guest if it may go on; destroys it if its exit could
    /// not be handled; yields otherwise.
    pub fn vmexit(&self) -> ! {
        if self.reap_current() {
            self.host().sched_yield();
        }
        let id = self.current();
        match self.handle_vmexit() {
            Ok(VmexitResult::Handled | VmexitResult::Resume) => match id {
                Some(id) if self.inspect(id, Env::status) == Ok(EnvStatus::Running) => {
                    self.run(id)
                }
                _ => self.host().sched_yield(),
            },
            outcome => {
                if let Err(e) = outcome {
                    warn!("vmexit failed: {}", e);
                }
                if let Some(id) = id {
                    info!("{} terminated", id);
                    let _ = self.destroy(id);
                }
                self.host().sched_yield()
            }
        }
    }
}

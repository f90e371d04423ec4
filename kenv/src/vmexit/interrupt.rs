//! External interrupts and the interrupt window.
//!
//! An interrupt that arrives while the guest runs is reflected into it.
//! If the guest has interrupts masked, the vector is held back and the
//! processor is asked to exit as soon as the guest can take it.

use super::{ExitCtx, VmexitResult};
use crate::{
    error::VmError,
    vmx::{
        vm_control::{VmcsProcBasedVmexecCtl, INTR_INFO_VALID, INTR_INFO_VECTOR_MASK},
        vmcs::Field,
    },
};
use abyss::x86_64::Rflags;
use log::debug;

fn inject(ctx: &ExitCtx<'_>, vector: u8) -> Result<(), VmError> {
    ctx.vmcs.write(
        Field::VmentryInterruptionInfo,
        (vector as u32 | INTR_INFO_VALID) as u64,
    )
}

pub(super) fn external(ctx: &mut ExitCtx<'_>) -> Result<VmexitResult, VmError> {
    let info = ctx.vmcs.read(Field::VmexitInterruptionInfo)? as u32;
    let vector = (info & INTR_INFO_VECTOR_MASK) as u8;

    if ctx.tf.rflags.contains(Rflags::IF) {
        inject(ctx, vector)?;
    } else {
        if let Some(lost) = ctx.guest.pending_vector.replace(vector) {
            debug!("pending vector {:#x} replaced by {:#x}", lost, vector);
        }
        ctx.vmcs.update(Field::ProcessorBasedVmexecControls, |ctls| {
            ctls | VmcsProcBasedVmexecCtl::INTRWINEXIT.bits() as u64
        })?;
    }
    Ok(VmexitResult::Resume)
}

pub(super) fn window(ctx: &mut ExitCtx<'_>) -> Result<VmexitResult, VmError> {
    ctx.vmcs.update(Field::ProcessorBasedVmexecControls, |ctls| {
        ctls & !(VmcsProcBasedVmexecCtl::INTRWINEXIT.bits() as u64)
    })?;
    if let Some(vector) = ctx.guest.pending_vector.take() {
        inject(ctx, vector)?;
    }
    Ok(VmexitResult::Resume)
}

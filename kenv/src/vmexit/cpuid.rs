//! `cpuid` passthrough.

use super::{ExitCtx, VmexitResult};
use crate::error::VmError;

/// Leaf 1 ecx bit advertising VMX support.
const CPUID_1_ECX_VMX: u32 = 1 << 5;

/// Run the real instruction with the guest's eax/ecx and hand back its
/// result, hiding VMX support so the guest does not try to nest.
pub(super) fn handle(ctx: &mut ExitCtx<'_>) -> Result<VmexitResult, VmError> {
    let regs = &mut ctx.tf.regs;
    let leaf = regs.rax as u32;
    let mut result = ctx.hw.cpuid(leaf, regs.rcx as u32);
    if leaf == 1 {
        result.ecx &= !CPUID_1_ECX_VMX;
    }
    regs.rax = result.eax as usize;
    regs.rbx = result.ebx as usize;
    regs.rcx = result.ecx as usize;
    regs.rdx = result.edx as usize;
    Ok(VmexitResult::Handled)
}

//! `rdmsr`/`wrmsr` emulation.
//!
//! Only EFER is virtualized. Its guest value lives in the guest half of
//! the MSR area, which the processor loads on every entry.

use super::{ExitCtx, VmexitResult};
use crate::{
    error::VmError,
    vmx::{vm_control::VmcsEntryCtl, vmcs::Field},
};
use abyss::x86_64::msr::{Efer, IA32_EFER};

pub(super) fn rdmsr(ctx: &mut ExitCtx<'_>) -> Result<VmexitResult, VmError> {
    let index = ctx.tf.regs.rcx as u32;
    let value = ctx.guest.with_guest_msrs(ctx.mem, |msrs| {
        msrs.iter()
            .find(|e| e.msr_index == index && index == IA32_EFER)
            .map(|e| e.msr_value)
    });
    match value {
        Some(value) => {
            ctx.tf.regs.rdx = (value >> 32) as usize;
            ctx.tf.regs.rax = (value & 0xffff_ffff) as usize;
            Ok(VmexitResult::Handled)
        }
        None => Ok(VmexitResult::Unhandled),
    }
}

pub(super) fn wrmsr(ctx: &mut ExitCtx<'_>) -> Result<VmexitResult, VmError> {
    let index = ctx.tf.regs.rcx as u32;
    let new = ((ctx.tf.regs.rdx as u64) << 32) | (ctx.tf.regs.rax as u64 & 0xffff_ffff);
    let old = ctx.guest.with_guest_msrs(ctx.mem, |msrs| {
        msrs.iter_mut()
            .find(|e| e.msr_index == index && index == IA32_EFER)
            .map(|e| core::mem::replace(&mut e.msr_value, new))
    });
    let old = match old {
        Some(old) => old,
        None => return Ok(VmexitResult::Unhandled),
    };

    let lme = Efer::LME.bits();
    if old & lme == 0 && new & lme != 0 {
        ctx.vmcs.update(Field::VmentryControls, |ctls| {
            ctls | VmcsEntryCtl::IA32E_MODE_GUEST.bits() as u64
        })?;
    }
    Ok(VmexitResult::Handled)
}

#[cfg(test)]
mod tests {
    use crate::vmexit::{tests::Harness, VmexitResult};
    use crate::vmx::{
        vm_control::VmcsEntryCtl,
        vmcs::{BasicExitReason, Field},
    };
    use abyss::x86_64::msr::IA32_EFER;

    const LME: usize = 1 << 8;

    fn write_efer(h: &Harness, value: u64) -> Result<VmexitResult, crate::error::VmError> {
        h.set_regs(|r| {
            r.rcx = IA32_EFER as usize;
            r.rdx = (value >> 32) as usize;
            r.rax = (value & 0xffff_ffff) as usize;
        });
        h.exit(BasicExitReason::Wrmsr, 0x10_0000, 2);
        h.k.handle_vmexit()
    }

    fn read_efer(h: &Harness) -> (usize, usize) {
        h.set_regs(|r| r.rcx = IA32_EFER as usize);
        h.exit(BasicExitReason::Rdmsr, 0x10_0000, 2);
        assert_eq!(h.k.handle_vmexit(), Ok(VmexitResult::Handled));
        let regs = h.regs();
        (regs.rdx, regs.rax)
    }

    #[test]
    fn efer_round_trips_through_the_guest_area() {
        let h = Harness::new();
        assert_eq!(read_efer(&h), (0, 0));
        assert_eq!(write_efer(&h, 0x1_0000_0501), Ok(VmexitResult::Handled));
        assert_eq!(read_efer(&h), (0x1, 0x501));
        assert_eq!(h.rip(), 0x10_0002);
    }

    #[test]
    fn enabling_long_mode_sets_the_entry_control() {
        let h = Harness::new();
        let ia32e = VmcsEntryCtl::IA32E_MODE_GUEST.bits() as u64;
        assert_eq!(write_efer(&h, 1), Ok(VmexitResult::Handled));
        assert_eq!(h.field(Field::VmentryControls), Some(0));

        assert_eq!(write_efer(&h, (LME | 1) as u64), Ok(VmexitResult::Handled));
        assert_eq!(h.field(Field::VmentryControls), Some(ia32e));

        // Only the 0 -> 1 transition touches the controls.
        h.set_field(Field::VmentryControls, 0);
        assert_eq!(write_efer(&h, (LME | 0x100) as u64), Ok(VmexitResult::Handled));
        assert_eq!(h.field(Field::VmentryControls), Some(0));
    }

    #[test]
    fn other_msrs_are_unhandled() {
        let h = Harness::new();
        h.set_regs(|r| r.rcx = 0x1b);
        h.exit(BasicExitReason::Rdmsr, 0x10_0000, 2);
        assert_eq!(h.k.handle_vmexit(), Ok(VmexitResult::Unhandled));
        h.exit(BasicExitReason::Wrmsr, 0x10_0000, 2);
        assert_eq!(h.k.handle_vmexit(), Ok(VmexitResult::Unhandled));
        assert_eq!(h.rip(), 0x10_0000);
    }
}

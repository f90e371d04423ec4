//! Port I/O emulation: just enough of the CMOS to report memory size.
//!
//! The guest selects an NVRAM register by writing its index to port 0x70
//! and reads the value back from port 0x71. Only the four memory-size
//! registers are answered.

use super::{ExitCtx, VmexitResult};
use crate::{
    error::VmError,
    memlayout::{
        BASEMEM_KB, IO_RTC, IO_RTC_DATA, NVRAM_BASEHI, NVRAM_BASELO, NVRAM_EXTHI, NVRAM_EXTLO,
    },
    vmx::vmcs::{Field, IoQualification},
};

/// Value of NVRAM register `index` for a guest with `phys_size` bytes.
fn nvram(index: u8, phys_size: usize) -> Option<u8> {
    let ext_kb = (phys_size / 1024).saturating_sub(1024);
    match index {
        NVRAM_BASELO => Some((BASEMEM_KB & 0xff) as u8),
        NVRAM_BASEHI => Some((BASEMEM_KB >> 8) as u8),
        NVRAM_EXTLO => Some((ext_kb & 0xff) as u8),
        NVRAM_EXTHI => Some((ext_kb >> 8) as u8),
        _ => None,
    }
}

pub(super) fn handle(ctx: &mut ExitCtx<'_>) -> Result<VmexitResult, VmError> {
    let qual = IoQualification::from_bits_truncate(ctx.vmcs.read(Field::VmexitQualification)?);
    let is_in = qual.contains(IoQualification::IN);
    let regs = &mut ctx.tf.regs;

    match (qual.port(), is_in) {
        (IO_RTC, false) => {
            ctx.guest.rtc_index = regs.rax as u8;
            Ok(VmexitResult::Handled)
        }
        (IO_RTC_DATA, true) => match nvram(ctx.guest.rtc_index, ctx.guest.phys_size()) {
            Some(value) => {
                regs.rax = (regs.rax & !0xff) | value as usize;
                Ok(VmexitResult::Handled)
            }
            None => Ok(VmexitResult::Unhandled),
        },
        _ => Ok(VmexitResult::Unhandled),
    }
}

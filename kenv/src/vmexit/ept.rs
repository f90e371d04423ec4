//! Demand paging of guest memory.

use super::{ExitCtx, VmexitResult};
use crate::{
    error::VmError,
    memlayout::{CGA_BUF, EXTPHYSMEM, IOPHYSMEM},
    mm::Page,
    vmx::{ept::EptFlags, vmcs::Field},
};
use abyss::addressing::{Gpa, PAGE_SIZE};
use log::{trace, warn};

/// Back the faulting page with fresh memory if it is guest RAM, or with
/// the host text buffer if it is the VGA window. The guest then retries
/// the access.
///
/// A page that is already mapped is left alone, so a second fault on the
/// same page does not allocate again.
pub(super) fn handle(ctx: &mut ExitCtx<'_>) -> Result<VmexitResult, VmError> {
    let raw = ctx.vmcs.read(Field::GuestPhysicalAddr)? as usize;
    let gpa = match Gpa::new(raw) {
        Some(gpa) => gpa.page_down(),
        None => return Ok(VmexitResult::Unhandled),
    };
    let mut ept = ctx.ept();
    let is_ram = raw < IOPHYSMEM || (EXTPHYSMEM..ctx.guest.phys_size()).contains(&raw);
    let is_vga = (CGA_BUF..CGA_BUF + PAGE_SIZE).contains(&raw);

    if !is_ram && !is_vga {
        return Ok(VmexitResult::Unhandled);
    }
    if ept.translate(gpa).is_some() {
        return Ok(VmexitResult::Resume);
    }
    if is_vga {
        ept.map_device(ctx.hw.vga_buffer(), gpa, EptFlags::FULL)?;
        return Ok(VmexitResult::Resume);
    }

    let page = match Page::new(ctx.mem) {
        Some(page) => page,
        None => {
            warn!("{} out of memory backing {}", ctx.id, gpa);
            return Ok(VmexitResult::Unhandled);
        }
    };
    ept.map(page.pa(), gpa, EptFlags::FULL, false)?;
    trace!("{} demand-mapped {} at {}", ctx.id, page.pa(), gpa);
    Ok(VmexitResult::Resume)
}

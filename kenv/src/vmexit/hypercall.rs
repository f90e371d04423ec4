//! The `vmcall` interface between guests and the host.
//!
//! The call number is in `rax`. Arguments follow in `rbx`, `rcx`, `rdx`
//! and `rsi`; results come back in `rax`, except for [`Hypercall::Mbmap`]
//! which returns its address in `rbx`.

use super::{ExitCtx, HostCall, VmexitResult};
use crate::{
    env::EnvId,
    error::{KernelError, VmError},
    memlayout::{EXTPHYSMEM, IOPHYSMEM, MULTIBOOT_MAP_ADDR},
    mm::Page,
    vmx::ept::EptFlags,
};
use abyss::addressing::Gpa;
use core::convert::TryFrom;
use log::trace;
use num_enum::TryFromPrimitive;

/// Hypercall numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u64)]
pub enum Hypercall {
    /// Build a multiboot memory map and return its guest-physical address.
    Mbmap = 1,
    /// Send `rcx` (and the page at guest-physical `rdx`) to `rbx`.
    IpcSend = 2,
    /// Block until a message arrives from anyone. The sender named in
    /// `rbx` is ignored.
    IpcRecv = 3,
    /// End of interrupt on the local APIC.
    LapicEoi = 4,
    /// Park this guest and start the host shell.
    BackToHost = 5,
    /// Number of this guest's disk image.
    GetDiskImgNum = 6,
}

const MB_FLAG_MMAP: u32 = 0x40;
const MB_INFO_SIZE: usize = 52;
const MB_MMAP_ENTRY_SIZE: usize = 24;
const MB_TYPE_USABLE: u32 = 1;
const MB_TYPE_RESERVED: u32 = 2;

/// Multiboot info block followed by its three memory map entries: low
/// memory, the I/O hole and extended memory.
fn multiboot_map(buf: &mut [u8], phys_size: usize) {
    let entries = [
        (0, IOPHYSMEM, MB_TYPE_USABLE),
        (IOPHYSMEM, EXTPHYSMEM - IOPHYSMEM, MB_TYPE_RESERVED),
        (EXTPHYSMEM, phys_size.saturating_sub(EXTPHYSMEM), MB_TYPE_USABLE),
    ];
    let put = |buf: &mut [u8], off: usize, v: u32| {
        buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
    };

    put(buf, 0, MB_FLAG_MMAP);
    put(buf, 44, (entries.len() * MB_MMAP_ENTRY_SIZE) as u32);
    put(buf, 48, (MULTIBOOT_MAP_ADDR + MB_INFO_SIZE) as u32);
    for (i, (base, len, kind)) in entries.iter().enumerate() {
        let off = MB_INFO_SIZE + i * MB_MMAP_ENTRY_SIZE;
        // `size` does not count itself.
        put(buf, off, (MB_MMAP_ENTRY_SIZE - 4) as u32);
        put(buf, off + 4, *base as u32);
        put(buf, off + 8, (*base as u64 >> 32) as u32);
        put(buf, off + 12, *len as u32);
        put(buf, off + 16, (*len as u64 >> 32) as u32);
        put(buf, off + 20, *kind);
    }
}

pub(super) fn handle(ctx: &mut ExitCtx<'_>) -> Result<VmexitResult, VmError> {
    let call = match Hypercall::try_from(ctx.tf.regs.rax as u64) {
        Ok(call) => call,
        Err(_) => return Ok(VmexitResult::Unhandled),
    };
    trace!("{} hypercall {:?}", ctx.id, call);

    match call {
        Hypercall::Mbmap => {
            let mut page = Page::new(ctx.mem).ok_or(KernelError::NoMem)?;
            multiboot_map(page.inner_mut(), ctx.guest.phys_size());
            let gpa = Gpa::new(MULTIBOOT_MAP_ADDR).ok_or(KernelError::Inval)?;
            ctx.ept().map(page.pa(), gpa, EptFlags::FULL, true)?;
            ctx.tf.regs.rbx = MULTIBOOT_MAP_ADDR;
        }
        Hypercall::IpcSend => {
            let regs = &ctx.tf.regs;
            let page = Gpa::new(regs.rdx).and_then(|gpa| ctx.ept().gpa_to_hva(gpa));
            ctx.deferred = Some(HostCall::Send {
                to: EnvId::from_raw(regs.rbx as i32),
                value: regs.rcx as u64,
                page,
                perm: regs.rsi as u64,
            });
        }
        Hypercall::IpcRecv => {
            // The receive may not come back here, so step over the call
            // before blocking.
            ctx.tf.rip += ctx.vmcs.instruction_length()?;
            ctx.deferred = Some(HostCall::Recv);
            return Ok(VmexitResult::Resume);
        }
        Hypercall::LapicEoi => ctx.hw.lapic_eoi(),
        Hypercall::BackToHost => ctx.deferred = Some(HostCall::BackToHost),
        Hypercall::GetDiskImgNum => ctx.tf.regs.rax = ctx.guest.disk_image as usize,
    }
    Ok(VmexitResult::Handled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        env::ProcessRole,
        memlayout::GUEST_MEM_SZ,
        testing::{ElfBuilder, SentMessage},
        vmexit::tests::Harness,
        vmx::vmcs::BasicExitReason,
    };
    use abyss::PhysicalMemory;

    fn call(h: &Harness, nr: u64, rip: u64) -> Result<VmexitResult, VmError> {
        h.set_regs(|r| r.rax = nr as usize);
        h.exit(BasicExitReason::Vmcall, rip, 3);
        h.k.handle_vmexit()
    }

    fn u32_at(buf: &[u8], off: usize) -> u32 {
        u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
    }

    #[test]
    fn mbmap_describes_guest_memory() {
        let h = Harness::new();
        assert_eq!(call(&h, 1, 0x7000), Ok(VmexitResult::Handled));
        assert_eq!(h.rip(), 0x7003);
        assert_eq!(h.regs().rbx, MULTIBOOT_MAP_ADDR);

        let (pa, _) = h.ept().translate(Gpa::new(MULTIBOOT_MAP_ADDR).unwrap()).unwrap();
        let va = h.k.platform().mem.kva(pa);
        let buf = unsafe { core::slice::from_raw_parts(va.as_ptr::<u8>() as *const u8, 128) };
        assert_eq!(u32_at(buf, 0), 0x40);
        assert_eq!(u32_at(buf, 44), 72);
        assert_eq!(u32_at(buf, 48), 0x6000 + 52);

        let entry = |i: usize| {
            let off = 52 + i * 24;
            (
                u32_at(buf, off),
                u32_at(buf, off + 4),
                u32_at(buf, off + 12),
                u32_at(buf, off + 20),
            )
        };
        assert_eq!(entry(0), (20, 0, 0xa0000, 1));
        assert_eq!(entry(1), (20, 0xa0000, 0x60000, 2));
        assert_eq!(entry(2), (20, 0x100000, (GUEST_MEM_SZ - 0x100000) as u32, 1));

        // Asking again replaces the page instead of failing.
        assert_eq!(call(&h, 1, 0x7003), Ok(VmexitResult::Handled));
    }

    #[test]
    fn send_to_the_host_filesystem_reaches_the_file_server() {
        let h = Harness::new();
        let image = ElfBuilder::new(0x80_0000)
            .segment(0x80_0000, &[0xf4], 1)
            .build();
        let user = h.k.create(&image, ProcessRole::User);
        let fs = h.k.create(&image, ProcessRole::FileServer);

        let mem = &h.k.platform().mem;
        let page = Page::new(mem).unwrap();
        h.ept()
            .map(page.pa(), Gpa::new(0x50000).unwrap(), EptFlags::FULL, false)
            .unwrap();
        h.set_regs(|r| {
            r.rbx = 1;
            r.rcx = 42;
            r.rdx = 0x50010;
            r.rsi = 7;
        });
        assert_eq!(call(&h, 2, 0x7000), Ok(VmexitResult::Handled));

        h.set_regs(|r| {
            r.rbx = user.into_raw() as usize;
            r.rdx = 0;
        });
        assert_eq!(call(&h, 2, 0x7003), Ok(VmexitResult::Handled));

        assert_eq!(
            h.k.platform().host.sent(),
            [
                SentMessage {
                    from: h.guest,
                    to: fs,
                    value: 42,
                    page: Some(mem.kva(page.pa()) + 0x10),
                    perm: 7,
                },
                SentMessage {
                    from: h.guest,
                    to: user,
                    value: 42,
                    page: None,
                    perm: 7,
                },
            ]
        );
        assert!(!h.k.envs.is_locked());
    }

    #[test]
    fn receive_steps_over_the_call_first() {
        let h = Harness::new();
        h.k.platform().host.push_message(0xfeed);
        assert_eq!(call(&h, 3, 0x7200), Ok(VmexitResult::Resume));
        assert_eq!(h.rip(), 0x7203);
        assert_eq!(h.regs().rax, 0xfeed);

        // Nothing queued: the error code lands in rax.
        assert_eq!(call(&h, 3, 0x7203), Ok(VmexitResult::Resume));
        assert_eq!(h.rip(), 0x7206);
        assert_eq!(h.regs().rax, KernelError::Inval.code() as usize);
    }

    #[test]
    fn eoi_and_disk_number() {
        let h = Harness::new();
        assert_eq!(call(&h, 4, 0x7000), Ok(VmexitResult::Handled));
        assert_eq!(h.k.platform().hw.eoi_count(), 1);

        assert_eq!(call(&h, 6, 0x7003), Ok(VmexitResult::Handled));
        assert_eq!(h.regs().rax, 1);
    }

    #[test]
    fn unknown_number_is_unhandled() {
        let h = Harness::new();
        assert_eq!(call(&h, 0, 0x7000), Ok(VmexitResult::Unhandled));
        assert_eq!(call(&h, 99, 0x7000), Ok(VmexitResult::Unhandled));
        assert_eq!(h.rip(), 0x7000);
    }
}

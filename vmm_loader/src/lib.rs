//! Guest bootstrap.
//!
//! Runs in an ordinary environment and builds a guest out of two files:
//! an ELF kernel whose loadable segments go to their physical addresses,
//! and a boot sector that goes to the guest entry point. Every page passes
//! through [`UTEMP`] in the loader on its way into guest memory. The guest
//! also gets a private copy of the clean disk image before it is started.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

mod error;
pub mod fs;
pub mod host;

pub use error::LoaderError;
pub use fs::{File, FileSystem};
pub use host::{GuestHost, KernelHost};

use abyss::addressing::{Gpa, Va, PAGE_SIZE};
use alloc::{format, string::String, vec};
use kenv::{
    env::{EnvId, EnvStatus},
    error::KernelError,
    memlayout::{GUEST_ENTRY, GUEST_MEM_SZ, UTEMP},
    paging::PteFlags,
    vmx::ept::{EptFlags, GPA_LIMIT},
};
use log::{debug, info};
use object::{
    elf::{FileHeader64, ProgramHeader64, PT_LOAD},
    read::elf::{FileHeader, ProgramHeader},
    Endianness,
};

/// The guest kernel.
pub const GUEST_KERN: &str = "/vmm/kernel";
/// The guest boot sector.
pub const GUEST_BOOT: &str = "/vmm/boot";
/// Template every guest disk is copied from.
pub const CLEAN_DISK: &str = "/vmm/clean-fs.img";
pub const BOOT_SECTOR_SIZE: usize = 512;

const EHDR_SIZE: usize = core::mem::size_of::<FileHeader64<Endianness>>();
const PHDR_SIZE: usize = core::mem::size_of::<ProgramHeader64<Endianness>>();

/// Disk image of the guest numbered `n`.
pub fn disk_path(n: u32) -> String {
    format!("/vmm/fs{}.img", n)
}

fn utemp() -> Result<Va, KernelError> {
    Va::new(UTEMP).ok_or(KernelError::Inval)
}

/// Fill `[gpa, gpa + memsz)` of `guest` from `filesz` bytes of `file` at
/// `offset`. Bytes past `filesz` are zero. A range that does not fit in
/// guest-physical space is not an executable.
pub fn map_in_guest<H: GuestHost, F: File>(
    host: &H,
    guest: EnvId,
    gpa: Gpa,
    memsz: usize,
    file: &mut F,
    filesz: usize,
    offset: u64,
) -> Result<(), LoaderError> {
    if filesz > memsz {
        return Err(KernelError::NotExec.into());
    }
    file.seek(offset)?;

    let start = gpa.into_usize();
    let end = start
        .checked_add(memsz)
        .filter(|&end| end <= GPA_LIMIT)
        .ok_or(KernelError::NotExec)?;
    let file_end = start + filesz;
    let tmp = utemp()?;
    let mut buf = vec![0u8; PAGE_SIZE];
    let mut page = gpa.page_down();

    while page.into_usize() < end {
        let base = page.into_usize();
        let lo = base.max(start);
        let hi = (base + PAGE_SIZE).min(file_end);
        buf.fill(0);
        if lo < hi {
            file.read_exact(&mut buf[lo - base..hi - base])?;
        }

        host.page_alloc(tmp, PteFlags::P | PteFlags::US | PteFlags::RW)?;
        let shared = host
            .write_page(tmp, &buf)
            .and_then(|_| host.ept_map(tmp, guest, page, EptFlags::FULL));
        host.page_unmap(tmp)?;
        shared?;
        page = page + PAGE_SIZE;
    }
    Ok(())
}

/// Load every `PT_LOAD` segment of the ELF at `path` into `guest` at its
/// physical address.
pub fn copy_guest_kern_gpa<H: GuestHost, S: FileSystem>(
    host: &H,
    fs: &S,
    guest: EnvId,
    path: &str,
) -> Result<(), LoaderError> {
    let mut file = fs.open(path)?;
    let not_exec = |_| LoaderError::Kernel(KernelError::NotExec);

    let mut ehdr = [0u8; EHDR_SIZE];
    file.read_exact(&mut ehdr).map_err(not_exec)?;
    let header = FileHeader64::<Endianness>::parse(&ehdr[..])
        .map_err(|_| KernelError::NotExec)?;
    let endian = header.endian().map_err(|_| KernelError::NotExec)?;

    let phnum = header.e_phnum(endian) as usize;
    let mut phdrs = vec![0u8; phnum * PHDR_SIZE];
    file.seek(header.e_phoff(endian))?;
    file.read_exact(&mut phdrs).map_err(not_exec)?;
    let (phdrs, _) = object::pod::slice_from_bytes::<ProgramHeader64<Endianness>>(&phdrs, phnum)
        .map_err(|_| KernelError::NotExec)?;

    for ph in phdrs.iter().filter(|ph| ph.p_type(endian) == PT_LOAD) {
        let paddr = ph.p_paddr(endian) as usize;
        let gpa = Gpa::new(paddr).ok_or(KernelError::NotExec)?;
        debug!(
            "{}: vaddr {:#x} to gpa {:#x}",
            path,
            ph.p_vaddr(endian),
            paddr
        );
        map_in_guest(
            host,
            guest,
            gpa,
            ph.p_memsz(endian) as usize,
            &mut file,
            ph.p_filesz(endian) as usize,
            ph.p_offset(endian),
        )?;
    }
    Ok(())
}

/// Create a guest from [`GUEST_KERN`] and [`GUEST_BOOT`], give it its own
/// disk and mark it runnable.
///
/// A guest that cannot be completed is destroyed again.
pub fn boot_guest<H: GuestHost, S: FileSystem>(host: &H, fs: &S) -> Result<EnvId, LoaderError> {
    let entry = Gpa::new(GUEST_ENTRY).ok_or(KernelError::Inval)?;
    let guest = host.mkguest(GUEST_MEM_SZ, entry)?;
    match populate(host, fs, guest, entry) {
        Ok(()) => {
            host.set_status(guest, EnvStatus::Runnable)?;
            Ok(guest)
        }
        Err(e) => {
            let _ = host.destroy(guest);
            Err(e)
        }
    }
}

fn populate<H: GuestHost, S: FileSystem>(
    host: &H,
    fs: &S,
    guest: EnvId,
    entry: Gpa,
) -> Result<(), LoaderError> {
    copy_guest_kern_gpa(host, fs, guest, GUEST_KERN)?;

    let mut boot = fs.open(GUEST_BOOT)?;
    map_in_guest(
        host,
        guest,
        entry,
        BOOT_SECTOR_SIZE,
        &mut boot,
        BOOT_SECTOR_SIZE,
        0,
    )?;

    let disk = disk_path(host.vmdisk_number());
    info!("{} gets a new virtual disk at {}", guest, disk);
    fs.copy(CLEAN_DISK, &disk)
}

/// [`boot_guest`], then wait for the guest to finish.
pub fn run<H: GuestHost, S: FileSystem>(host: &H, fs: &S) -> Result<(), LoaderError> {
    let guest = boot_guest(host, fs)?;
    host.wait(guest);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use kenv::{
        testing::{test_kernel, ElfBuilder, TestPlatform, YIELD_PANIC},
        vmx::ept::ExtendedPageTable,
        Kernel, KernelConfig,
    };
    use std::{
        cell::RefCell,
        collections::BTreeMap,
        panic::{catch_unwind, AssertUnwindSafe},
    };

    #[derive(Default)]
    struct MemFs {
        files: RefCell<BTreeMap<String, Vec<u8>>>,
    }

    impl MemFs {
        fn with(self, path: &str, data: Vec<u8>) -> Self {
            self.files.borrow_mut().insert(path.into(), data);
            self
        }

        fn get(&self, path: &str) -> Option<Vec<u8>> {
            self.files.borrow().get(path).cloned()
        }
    }

    struct MemFile {
        data: Vec<u8>,
        pos: usize,
    }

    impl File for MemFile {
        fn seek(&mut self, offset: u64) -> Result<(), LoaderError> {
            self.pos = offset as usize;
            Ok(())
        }

        fn read(&mut self, buf: &mut [u8]) -> Result<usize, LoaderError> {
            // Hand out at most 100 bytes at a time, like a pipe would.
            let rest = self.data.get(self.pos..).unwrap_or(&[]);
            let n = rest.len().min(buf.len()).min(100);
            buf[..n].copy_from_slice(&rest[..n]);
            self.pos += n;
            Ok(n)
        }
    }

    impl FileSystem for MemFs {
        type File = MemFile;

        fn open(&self, path: &str) -> Result<MemFile, LoaderError> {
            let data = self.get(path).ok_or(KernelError::BadPath)?;
            Ok(MemFile { data, pos: 0 })
        }

        fn copy(&self, from: &str, to: &str) -> Result<(), LoaderError> {
            let data = self.get(from).ok_or(KernelError::BadPath)?;
            self.files.borrow_mut().insert(to.into(), data);
            Ok(())
        }
    }

    fn text() -> Vec<u8> {
        (0..0x1800u32).map(|i| (i % 251) as u8 + 1).collect()
    }

    fn boot_sector() -> Vec<u8> {
        let mut boot = vec![0x90u8; BOOT_SECTOR_SIZE];
        boot[510] = 0x55;
        boot[511] = 0xaa;
        boot
    }

    fn guest_kernel() -> Vec<u8> {
        ElfBuilder::new(0xf010_000c)
            .segment_at(0xf010_0000, 0x10_0000, &text(), 0x2100)
            .segment_at(0xf010_5010, 0x10_5010, &[0xab; 0x20], 0x20)
            .build()
    }

    fn clean_fs() -> MemFs {
        MemFs::default()
            .with(GUEST_KERN, guest_kernel())
            .with(GUEST_BOOT, boot_sector())
            .with(CLEAN_DISK, vec![0xd1; 4096])
    }

    /// A kernel whose processor 0 runs the loader.
    fn kernel_with_loader() -> (Kernel<TestPlatform>, EnvId) {
        let k = test_kernel(KernelConfig::new().capacity(8));
        let loader = k.allocate(None).unwrap();
        // Entering ring 3 is where the mock processor stops.
        assert!(catch_unwind(AssertUnwindSafe(|| k.run(loader))).is_err());
        assert_eq!(k.current(), Some(loader));
        // Build the staging page's tables up front so page counts compare.
        let tmp = Va::new(UTEMP).unwrap();
        k.page_alloc(EnvId::CALLER, tmp, PteFlags::P | PteFlags::US)
            .unwrap();
        k.page_unmap(EnvId::CALLER, tmp).unwrap();
        (k, loader)
    }

    fn read_guest(k: &Kernel<TestPlatform>, guest: EnvId, gpa: usize, len: usize) -> Vec<u8> {
        let root = k.inspect(guest, |e| e.root().unwrap()).unwrap();
        let hva = ExtendedPageTable::new(&k.platform().mem, root)
            .gpa_to_hva(Gpa::new(gpa).unwrap())
            .expect("guest page mapped");
        let ptr = hva.as_ptr::<u8>() as *const u8;
        unsafe { core::slice::from_raw_parts(ptr, len) }.to_vec()
    }

    fn guests(k: &Kernel<TestPlatform>) -> usize {
        k.with_table(|t| (0..t.capacity()).filter(|&i| t.get(i).kind().is_guest()).count())
    }

    #[test]
    fn boots_a_guest() {
        let (k, loader) = kernel_with_loader();
        let fs = clean_fs();
        let guest = boot_guest(&KernelHost::new(&k), &fs).unwrap();

        assert_eq!(
            k.inspect(guest, |e| (e.status(), e.parent())),
            Ok((EnvStatus::Runnable, Some(loader)))
        );

        let text = text();
        assert_eq!(read_guest(&k, guest, 0x10_0000, 0x1000), &text[..0x1000]);
        assert_eq!(read_guest(&k, guest, 0x10_1000, 0x800), &text[0x1000..]);
        assert!(read_guest(&k, guest, 0x10_1800, 0x800).iter().all(|&b| b == 0));
        assert!(read_guest(&k, guest, 0x10_2000, 0x1000).iter().all(|&b| b == 0));
        assert_eq!(read_guest(&k, guest, 0x10_5000, 0x10), [0; 0x10]);
        assert_eq!(read_guest(&k, guest, 0x10_5010, 0x20), [0xab; 0x20]);
        assert_eq!(read_guest(&k, guest, GUEST_ENTRY, BOOT_SECTOR_SIZE), boot_sector());

        assert_eq!(fs.get(&disk_path(1)), Some(vec![0xd1; 4096]));

        // The staging page is gone again.
        let tmp = Va::new(UTEMP).unwrap();
        assert_eq!(
            k.write_page(EnvId::CALLER, tmp, b"x"),
            Err(KernelError::Inval)
        );
    }

    #[test]
    fn each_guest_gets_its_own_disk() {
        let (k, _) = kernel_with_loader();
        let fs = clean_fs();
        let host = KernelHost::new(&k);
        boot_guest(&host, &fs).unwrap();
        boot_guest(&host, &fs).unwrap();
        assert!(fs.get("/vmm/fs1.img").is_some());
        assert!(fs.get("/vmm/fs2.img").is_some());
    }

    #[test]
    fn failures_leave_no_guest_behind() {
        let cases: [(MemFs, LoaderError); 6] = [
            (
                MemFs::default().with(GUEST_BOOT, boot_sector()),
                LoaderError::Kernel(KernelError::BadPath),
            ),
            (
                clean_fs().with(GUEST_KERN, b"#!/bin/sh\n".repeat(8)),
                LoaderError::Kernel(KernelError::NotExec),
            ),
            (
                clean_fs().with(
                    GUEST_KERN,
                    ElfBuilder::new(0).segment(0x10_0000, &[1; 64], 16).build(),
                ),
                LoaderError::Kernel(KernelError::NotExec),
            ),
            (
                clean_fs().with(
                    GUEST_KERN,
                    ElfBuilder::new(0).segment(0x10_0000, &[1; 16], u64::MAX).build(),
                ),
                LoaderError::Kernel(KernelError::NotExec),
            ),
            (
                clean_fs().with(GUEST_BOOT, vec![0x90; 300]),
                LoaderError::ShortRead {
                    expected: BOOT_SECTOR_SIZE,
                    got: 300,
                },
            ),
            (
                MemFs::default()
                    .with(GUEST_KERN, guest_kernel())
                    .with(GUEST_BOOT, boot_sector()),
                LoaderError::Kernel(KernelError::BadPath),
            ),
        ];

        for (fs, expected) in cases {
            let (k, _) = kernel_with_loader();
            let live = k.platform().mem.live_pages();
            assert_eq!(boot_guest(&KernelHost::new(&k), &fs), Err(expected));
            assert_eq!(guests(&k), 0);
            assert_eq!(k.platform().mem.live_pages(), live);
        }
    }

    #[test]
    fn oversized_ranges_are_not_executable() {
        let (k, _) = kernel_with_loader();
        let host = KernelHost::new(&k);
        let guest = host
            .mkguest(GUEST_MEM_SZ, Gpa::new(GUEST_ENTRY).unwrap())
            .unwrap();
        let gpa = Gpa::new(0x10_0000).unwrap();
        let live = k.platform().mem.live_pages();
        for memsz in [usize::MAX, GPA_LIMIT] {
            let mut file = MemFile {
                data: Vec::new(),
                pos: 0,
            };
            assert_eq!(
                map_in_guest(&host, guest, gpa, memsz, &mut file, 0, 0),
                Err(LoaderError::Kernel(KernelError::NotExec))
            );
        }
        assert_eq!(k.platform().mem.live_pages(), live);
    }

    #[test]
    fn run_waits_for_the_guest() {
        let (k, _) = kernel_with_loader();
        let fs = clean_fs();
        let r = catch_unwind(AssertUnwindSafe(|| run(&KernelHost::new(&k), &fs)));
        let msg = r.unwrap_err().downcast::<String>().ok().map(|s| *s);
        assert_eq!(msg.as_deref(), Some(YIELD_PANIC));
        assert_eq!(guests(&k), 1);
    }

    #[test]
    fn error_codes() {
        assert_eq!(
            LoaderError::from(KernelError::BadPath).code(),
            KernelError::BadPath.code()
        );
        let short = LoaderError::ShortRead {
            expected: 512,
            got: 3,
        };
        assert_eq!(short.code(), KernelError::Io.code());
        assert_eq!(short.to_string(), "short read: 3 of 512 bytes");
    }
}

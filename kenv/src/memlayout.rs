//! Fixed addresses and numbers shared with user programs and guests.

use abyss::addressing::PAGE_SIZE;

/// Default number of environment slots.
pub const NENV: usize = 1 << 10;
/// Generation field of an identity starts at this bit.
pub const ENVGENSHIFT: u32 = 12;

/// Root table slot that maps the kernel half, shared by every environment.
pub const KERNEL_ROOT_SLOT: usize = 1;
/// Read-only self map of the current root table.
pub const UVPT: usize = 0x100_0000_0000;
/// Top of the user-writable region.
pub const UTOP: usize = 0xeec0_0000;
/// Top of the single user stack page.
pub const USTACKTOP: usize = UTOP - 2 * PAGE_SIZE;
/// Scratch page a process maps before handing it to someone else.
pub const UTEMP: usize = 0x40_0000;
/// Where debug sections of a loaded image are copied.
pub const USTABDATA: usize = 0x20_0000;
/// Sections copied to [`USTABDATA`], in order.
pub const DEBUG_SECTIONS: [&str; 5] = [
    ".debug_info",
    ".debug_abbrev",
    ".debug_line",
    ".eh_frame",
    ".debug_str",
];

/// Start of the legacy I/O hole in guest physical memory.
pub const IOPHYSMEM: usize = 0xa_0000;
/// End of the legacy I/O hole; extended memory starts here.
pub const EXTPHYSMEM: usize = 0x10_0000;
/// VGA text buffer.
pub const CGA_BUF: usize = 0xb_8000;
/// Where the multiboot memory map is handed to a guest.
pub const MULTIBOOT_MAP_ADDR: usize = 0x6000;
/// Guest physical address the boot sector is loaded at and started from.
pub const GUEST_ENTRY: usize = 0x7000;
/// Default guest physical memory size.
pub const GUEST_MEM_SZ: usize = 20 * 1024 * 1024;

/// Placeholder identity a guest uses to reach the host file server.
pub const VMX_HOST_FS_ENV: i32 = 1;

/// CMOS index register.
pub const IO_RTC: u16 = 0x70;
/// CMOS data register.
pub const IO_RTC_DATA: u16 = IO_RTC + 1;
/// Start of NVRAM in the CMOS index space.
pub const MC_NVRAM_START: u8 = 0x0e;
/// Base memory size in KiB, low byte.
pub const NVRAM_BASELO: u8 = MC_NVRAM_START + 7;
/// Base memory size in KiB, high byte.
pub const NVRAM_BASEHI: u8 = MC_NVRAM_START + 8;
/// Extended memory size in KiB, low byte.
pub const NVRAM_EXTLO: u8 = MC_NVRAM_START + 9;
/// Extended memory size in KiB, high byte.
pub const NVRAM_EXTHI: u8 = MC_NVRAM_START + 10;
/// Base memory reported to guests, in KiB.
pub const BASEMEM_KB: usize = 640;

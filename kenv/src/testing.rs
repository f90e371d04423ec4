//! Test doubles for the platform and a tiny ELF writer.
//!
//! Available to this crate's tests and, with the `mock` feature, to
//! downstream crates.

use crate::{env::EnvId, error::KernelError, HostServices, Kernel, KernelConfig, Platform};
use abyss::{
    addressing::{Pa, Va},
    mock::{MockHardware, MockMemory},
    HardwareContext, PhysicalMemory,
};
use alloc::{collections::VecDeque, string::String, vec, vec::Vec};
use core::sync::atomic::{AtomicUsize, Ordering};
use spin_lock::SpinLock;

/// Root entry the mock processor reports for the kernel half.
pub const KERNEL_ROOT_ENTRY: u64 = 0x00be_e000 | 0x3;
/// Host frame standing in for the VGA text buffer.
pub const VGA_FRAME: usize = 0xb8000;
/// Message of the panic that [`TestHost::sched_yield`] raises.
pub const YIELD_PANIC: &str = "sched_yield";

/// One call to [`HostServices::ipc_try_send`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub from: EnvId,
    pub to: EnvId,
    pub value: u64,
    pub page: Option<Va>,
    pub perm: u64,
}

/// Records sends, replays scripted receives and panics on yield.
#[derive(Default)]
pub struct TestHost {
    sent: SpinLock<Vec<SentMessage>>,
    inbox: SpinLock<VecDeque<u64>>,
    yields: AtomicUsize,
}

impl TestHost {
    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().clone()
    }

    /// Queue a value for the next [`HostServices::ipc_recv`].
    pub fn push_message(&self, value: u64) {
        self.inbox.lock().push_back(value);
    }

    /// Number of times the core tried to yield.
    pub fn yields(&self) -> usize {
        self.yields.load(Ordering::SeqCst)
    }
}

impl HostServices for TestHost {
    fn ipc_try_send(
        &self,
        from: EnvId,
        to: EnvId,
        value: u64,
        page: Option<Va>,
        perm: u64,
    ) -> Result<(), KernelError> {
        self.sent.lock().push(SentMessage {
            from,
            to,
            value,
            page,
            perm,
        });
        Ok(())
    }

    fn ipc_recv(&self, _receiver: EnvId) -> Result<u64, KernelError> {
        self.inbox.lock().pop_front().ok_or(KernelError::Inval)
    }

    fn sched_yield(&self) -> ! {
        self.yields.fetch_add(1, Ordering::SeqCst);
        panic!("{}", YIELD_PANIC)
    }
}

/// Mock memory, mock processor and [`TestHost`] in one [`Platform`].
pub struct TestPlatform {
    pub mem: MockMemory,
    pub hw: MockHardware,
    pub host: TestHost,
}

impl Default for TestPlatform {
    fn default() -> Self {
        Self {
            mem: MockMemory::new(),
            hw: MockHardware::new(KERNEL_ROOT_ENTRY, Pa::new(VGA_FRAME).unwrap()),
            host: TestHost::default(),
        }
    }
}

impl Platform for TestPlatform {
    fn memory(&self) -> &dyn PhysicalMemory {
        &self.mem
    }

    fn hardware(&self) -> &dyn HardwareContext {
        &self.hw
    }

    fn host(&self) -> &dyn HostServices {
        &self.host
    }
}

/// A kernel over a fresh [`TestPlatform`].
pub fn test_kernel(config: KernelConfig) -> Kernel<TestPlatform> {
    Kernel::new(TestPlatform::default(), config)
}

struct Segment {
    vaddr: u64,
    paddr: u64,
    data: Vec<u8>,
    memsz: u64,
}

/// Writes minimal little-endian ELF64 executables: a header, one
/// `PT_LOAD` program header per segment and, if any section was added, a
/// section table with its own name table.
pub struct ElfBuilder {
    entry: u64,
    segments: Vec<Segment>,
    sections: Vec<(String, Vec<u8>)>,
}

const EHDR_SIZE: usize = 64;
const PHDR_SIZE: usize = 56;
const SHDR_SIZE: usize = 64;

impl ElfBuilder {
    pub fn new(entry: u64) -> Self {
        Self {
            entry,
            segments: Vec::new(),
            sections: Vec::new(),
        }
    }

    /// A loadable segment whose physical address equals its virtual one.
    pub fn segment(self, vaddr: u64, data: &[u8], memsz: u64) -> Self {
        self.segment_at(vaddr, vaddr, data, memsz)
    }

    pub fn segment_at(mut self, vaddr: u64, paddr: u64, data: &[u8], memsz: u64) -> Self {
        self.segments.push(Segment {
            vaddr,
            paddr,
            data: data.to_vec(),
            memsz,
        });
        self
    }

    /// A non-allocated section, such as debug info.
    pub fn section(mut self, name: &str, data: &[u8]) -> Self {
        self.sections.push((String::from(name), data.to_vec()));
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let phoff = EHDR_SIZE;
        let mut cursor = phoff + PHDR_SIZE * self.segments.len();

        let mut seg_offsets = Vec::new();
        for seg in &self.segments {
            seg_offsets.push(cursor);
            cursor += seg.data.len();
        }
        let mut sec_offsets = Vec::new();
        for (_, data) in &self.sections {
            sec_offsets.push(cursor);
            cursor += data.len();
        }

        // Section name table: "\0.shstrtab\0name\0..."
        let mut shstrtab = vec![0u8];
        let shstrtab_name = shstrtab.len();
        shstrtab.extend_from_slice(b".shstrtab\0");
        let mut name_offsets = Vec::new();
        for (name, _) in &self.sections {
            name_offsets.push(shstrtab.len());
            shstrtab.extend_from_slice(name.as_bytes());
            shstrtab.push(0);
        }
        let shstrtab_off = cursor;
        cursor += shstrtab.len();
        let shoff = (cursor + 7) & !7;
        let shnum = if self.sections.is_empty() { 0 } else { self.sections.len() + 2 };

        let mut out = Vec::with_capacity(shoff + shnum * SHDR_SIZE);
        out.extend_from_slice(b"\x7fELF");
        out.extend_from_slice(&[2, 1, 1, 0]);
        out.extend_from_slice(&[0; 8]);
        out.extend_from_slice(&2u16.to_le_bytes()); // ET_EXEC
        out.extend_from_slice(&0x3eu16.to_le_bytes()); // EM_X86_64
        out.extend_from_slice(&1u32.to_le_bytes());
        out.extend_from_slice(&self.entry.to_le_bytes());
        out.extend_from_slice(&(phoff as u64).to_le_bytes());
        out.extend_from_slice(&(if shnum == 0 { 0 } else { shoff as u64 }).to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&(EHDR_SIZE as u16).to_le_bytes());
        out.extend_from_slice(&(PHDR_SIZE as u16).to_le_bytes());
        out.extend_from_slice(&(self.segments.len() as u16).to_le_bytes());
        out.extend_from_slice(&(SHDR_SIZE as u16).to_le_bytes());
        out.extend_from_slice(&(shnum as u16).to_le_bytes());
        out.extend_from_slice(&(if shnum == 0 { 0u16 } else { 1 }).to_le_bytes());

        for (seg, off) in self.segments.iter().zip(&seg_offsets) {
            out.extend_from_slice(&1u32.to_le_bytes()); // PT_LOAD
            out.extend_from_slice(&7u32.to_le_bytes());
            out.extend_from_slice(&(*off as u64).to_le_bytes());
            out.extend_from_slice(&seg.vaddr.to_le_bytes());
            out.extend_from_slice(&seg.paddr.to_le_bytes());
            out.extend_from_slice(&(seg.data.len() as u64).to_le_bytes());
            out.extend_from_slice(&seg.memsz.to_le_bytes());
            out.extend_from_slice(&0x1000u64.to_le_bytes());
        }
        for seg in &self.segments {
            out.extend_from_slice(&seg.data);
        }
        for (_, data) in &self.sections {
            out.extend_from_slice(data);
        }
        out.extend_from_slice(&shstrtab);
        out.resize(shoff, 0);

        if shnum != 0 {
            out.extend_from_slice(&[0; SHDR_SIZE]);
            Self::shdr(&mut out, shstrtab_name, 3, shstrtab_off, shstrtab.len());
            for (i, (_, data)) in self.sections.iter().enumerate() {
                Self::shdr(&mut out, name_offsets[i], 1, sec_offsets[i], data.len());
            }
        }
        out
    }

    fn shdr(out: &mut Vec<u8>, name: usize, kind: u32, offset: usize, size: usize) {
        out.extend_from_slice(&(name as u32).to_le_bytes());
        out.extend_from_slice(&kind.to_le_bytes());
        out.extend_from_slice(&0u64.to_le_bytes()); // flags
        out.extend_from_slice(&0u64.to_le_bytes()); // addr
        out.extend_from_slice(&(offset as u64).to_le_bytes());
        out.extend_from_slice(&(size as u64).to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&1u64.to_le_bytes());
        out.extend_from_slice(&0u64.to_le_bytes());
    }
}

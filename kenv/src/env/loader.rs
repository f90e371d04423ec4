//! Loading an executable image into a process address space.

use super::{address_space, Env};
use crate::{
    error::KernelError,
    memlayout::{DEBUG_SECTIONS, USTABDATA, USTACKTOP},
};
use abyss::{
    addressing::{Va, PAGE_SIZE},
    PhysicalMemory,
};
use log::debug;
use object::{
    elf::PT_LOAD,
    read::elf::{ElfFile64, ProgramHeader},
    Endianness, Object, ObjectSection,
};

/// Map every loadable segment of `image` into `env`, give it one stack
/// page below [`USTACKTOP`], copy its debug sections to [`USTABDATA`] and
/// point its saved context at the entry.
pub fn load_image(mem: &dyn PhysicalMemory, env: &mut Env, image: &[u8]) -> Result<(), KernelError> {
    let root = env.root.ok_or(KernelError::BadEnv)?;
    let elf = ElfFile64::<Endianness>::parse(image).map_err(|_| KernelError::NotExec)?;
    let endian = elf.endian();

    for ph in elf.raw_segments() {
        if ph.p_type(endian) != PT_LOAD {
            continue;
        }
        let filesz = ph.p_filesz(endian) as usize;
        let memsz = ph.p_memsz(endian) as usize;
        if filesz > memsz {
            return Err(KernelError::NotExec);
        }
        let va = Va::new(ph.p_vaddr(endian) as usize).ok_or(KernelError::NotExec)?;
        let data = ph.data(endian, image).map_err(|_| KernelError::NotExec)?;
        address_space::region_alloc(mem, root, va, memsz)?;
        address_space::copy_to_user(mem, root, va, data)?;
        address_space::zero_user(mem, root, va + filesz, memsz - filesz)?;
    }

    let stack = Va::new(USTACKTOP - PAGE_SIZE).ok_or(KernelError::Inval)?;
    address_space::region_alloc(mem, root, stack, PAGE_SIZE)?;

    let mut stab = Va::new(USTABDATA).ok_or(KernelError::Inval)?;
    for name in DEBUG_SECTIONS {
        let data = match elf.section_by_name(name).map(|section| section.data()) {
            Some(Ok(data)) if !data.is_empty() => data,
            Some(Err(_)) => return Err(KernelError::NotExec),
            _ => continue,
        };
        address_space::region_alloc(mem, root, stab, data.len())?;
        address_space::copy_to_user(mem, root, stab, data)?;
        debug!("{}: {} at {}, {:#x} bytes", env.id, name, stab, data.len());
        stab += data.len();
    }

    env.tf.rip = elf.entry() as usize;
    env.tf.rsp = USTACKTOP;
    Ok(())
}

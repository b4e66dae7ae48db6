//! Core Dumper: writes `core.<pid>` — an ELF header, one `PT_LOAD` program
//! header per discovered guest mapping, and a payload block filled by a
//! single batched cross-process `process_vm_readv`.

use libc::{c_void, off_t, PT_LOAD};
use nix::sys::mman::{mmap, MapFlags, ProtFlags};
use nix::sys::uio::{process_vm_readv, IoVec, RemoteIoVec};
use nix::unistd::Pid;
use simple_error::{bail, try_with};
use std::fs::File;
use std::io::Write;
use std::mem::size_of;
use std::os::unix::prelude::AsRawFd;
use std::{ptr, slice::from_raw_parts_mut};

use crate::elf::{
    Ehdr, Elf_Half, Elf_Off, Phdr, Shdr, ELFARCH, ELFCLASS, ELFDATA2, ELFMAG0, ELFMAG1, ELFMAG2,
    ELFMAG3, ET_CORE, EV_CURRENT, SHN_UNDEF,
};
use crate::page_math::page_align;
use crate::proc::Mapping;
use crate::result::Result;

fn elf_header(phnum: Elf_Half) -> Ehdr {
    Ehdr {
        e_ident: [
            ELFMAG0, ELFMAG1, ELFMAG2, ELFMAG3, ELFCLASS, ELFDATA2, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
        ],
        e_type: ET_CORE,
        e_machine: ELFARCH,
        e_version: EV_CURRENT,
        e_entry: 0,
        e_phoff: size_of::<Ehdr>() as Elf_Off,
        e_shoff: 0,
        e_flags: 0,
        e_ehsize: size_of::<Ehdr>() as Elf_Half,
        e_phentsize: size_of::<Phdr>() as Elf_Half,
        e_phnum: phnum,
        e_shentsize: size_of::<Shdr>() as Elf_Half,
        e_shnum: 0,
        e_shstrndx: SHN_UNDEF,
    }
}

/// `p_flags = 0` is a documented simplification — the real flags are
/// derivable from the host Region but aren't needed for what this reads.
fn pt_load_header(m: &Mapping, offset: Elf_Off) -> Phdr {
    Phdr {
        p_type: PT_LOAD,
        p_flags: 0,
        p_offset: offset,
        p_vaddr: m.start as _,
        p_paddr: 0,
        p_filesz: m.size() as _,
        p_memsz: m.size() as _,
        p_align: crate::page_math::page_size() as _,
    }
}

fn dump_mappings(
    pid: Pid,
    core_file: &mut File,
    core_size: off_t,
    file_offset: off_t,
    maps: &[Mapping],
) -> Result<()> {
    let buf_size = core_size - file_offset;
    let res = unsafe {
        mmap(
            ptr::null_mut::<c_void>(),
            buf_size as usize,
            ProtFlags::PROT_WRITE,
            MapFlags::MAP_SHARED,
            core_file.as_raw_fd(),
            file_offset,
        )
    };
    let raw_buf = try_with!(res, "cannot mmap core file");
    let buf = unsafe { from_raw_parts_mut(raw_buf as *mut u8, buf_size as usize) };

    let dst_iovs = vec![IoVec::from_mut_slice(buf)];
    let src_iovs = maps
        .iter()
        .map(|m| RemoteIoVec {
            base: m.start,
            len: m.size(),
        })
        .collect::<Vec<_>>();

    try_with!(
        process_vm_readv(pid, dst_iovs.as_slice(), src_iovs.as_slice()),
        "cannot read hypervisor memory"
    );
    unsafe {
        nix::sys::mman::munmap(raw_buf, buf_size as usize).ok();
    }
    Ok(())
}

fn write_corefile(pid: Pid, core_file: &mut File, maps: &[Mapping]) -> Result<()> {
    let header_size = size_of::<Ehdr>() + maps.len() * size_of::<Phdr>();
    let offset = page_align(header_size) as off_t;

    let mut core_size = offset;
    let mut phdrs = Vec::with_capacity(maps.len());
    for m in maps {
        phdrs.push(pt_load_header(m, core_size));
        core_size += m.size() as off_t;
    }

    try_with!(
        core_file.set_len(core_size as u64),
        "cannot truncate core file"
    );
    try_with!(
        core_file.write_all(unsafe { any_as_bytes(&elf_header(maps.len() as Elf_Half)) }),
        "cannot write elf header"
    );
    for ph in &phdrs {
        try_with!(
            core_file.write_all(unsafe { any_as_bytes(ph) }),
            "cannot write program header"
        );
    }
    try_with!(core_file.flush(), "cannot flush core file");

    dump_mappings(pid, core_file, core_size, offset, maps)
}

unsafe fn any_as_bytes<T: Sized>(p: &T) -> &[u8] {
    std::slice::from_raw_parts((p as *const T) as *const u8, size_of::<T>())
}

/// Not a memory-consistent snapshot — the target keeps running while its
/// memory is being copied.
pub fn generate_coredump(pid: Pid, maps: &[Mapping]) -> Result<()> {
    if maps.is_empty() {
        bail!("no guest mappings to dump for pid {}", pid);
    }
    let path = format!("core.{}", pid);
    let mut core_file = try_with!(File::create(&path), "cannot create core file {}", path);
    write_corefile(pid, &mut core_file, maps)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::mman::MapFlags as MF;
    use nix::sys::mman::ProtFlags as PF;

    fn mapping(start: usize, end: usize) -> Mapping {
        Mapping {
            start,
            end,
            prot_flags: PF::PROT_READ | PF::PROT_WRITE,
            map_flags: MF::MAP_PRIVATE,
            offset: 0,
            major_dev: 0,
            minor_dev: 0,
            inode: 0,
            pathname: String::new(),
            phys_addr: 0,
        }
    }

    #[test]
    fn test_elf_header_fields() {
        let hdr = elf_header(3);
        assert_eq!(hdr.e_type, ET_CORE);
        assert_eq!(hdr.e_phnum, 3);
        assert_eq!(hdr.e_phoff as usize, size_of::<Ehdr>());
        assert_eq!(hdr.e_shnum, 0);
    }

    #[test]
    fn test_pt_load_header_layout() {
        let m = mapping(0x1000, 0x3000);
        let ph = pt_load_header(&m, 0x4000);
        assert_eq!(ph.p_type, PT_LOAD);
        assert_eq!(ph.p_flags, 0);
        assert_eq!(ph.p_vaddr as usize, 0x1000);
        assert_eq!(ph.p_paddr, 0);
        assert_eq!(ph.p_filesz as usize, 0x2000);
        assert_eq!(ph.p_memsz, ph.p_filesz);
    }

    #[test]
    fn test_generate_coredump_rejects_empty_maps() {
        let pid = nix::unistd::getpid();
        assert!(generate_coredump(pid, &[]).is_err());
    }

    /// T5: a coredump of a known, single-region layout has exactly one
    /// `PT_LOAD` segment whose `p_vaddr`/`p_filesz` match the source region
    /// and whose payload bytes match a direct read of that same memory.
    #[test]
    #[ignore = "writes core.<pid> to the working directory; run explicitly"]
    fn test_coredump_round_trip() {
        use std::io::Read;

        let size = 64 * 1024;
        let raw = unsafe {
            mmap(
                ptr::null_mut::<c_void>(),
                size,
                PF::PROT_READ | PF::PROT_WRITE,
                MF::MAP_PRIVATE | MF::MAP_ANONYMOUS,
                -1,
                0,
            )
        }
        .expect("cannot mmap guest-like region");
        let buf = unsafe { from_raw_parts_mut(raw as *mut u8, size) };
        for (i, b) in buf.iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }

        let pid = nix::unistd::getpid();
        let start = raw as usize;
        let m = mapping(start, start + size);
        generate_coredump(pid, &[m]).expect("coredump generation failed");

        let path = format!("core.{}", pid);
        let mut raw_file = Vec::new();
        File::open(&path)
            .and_then(|mut f| f.read_to_end(&mut raw_file))
            .expect("cannot read generated core file");

        let ehdr = unsafe { ptr::read(raw_file.as_ptr() as *const Ehdr) };
        assert_eq!(ehdr.e_type, ET_CORE);
        assert_eq!(ehdr.e_phnum, 1);

        let phdr = unsafe { ptr::read(raw_file[ehdr.e_phoff as usize..].as_ptr() as *const Phdr) };
        assert_eq!(phdr.p_vaddr as usize, start);
        assert_eq!(phdr.p_filesz as usize, size);

        let payload_start = phdr.p_offset as usize;
        let payload = &raw_file[payload_start..payload_start + size];
        assert_eq!(payload, &buf[..]);

        std::fs::remove_file(&path).ok();
        unsafe {
            nix::sys::mman::munmap(raw, size).ok();
        }
    }
}

//! Kernel executable loading.
//!
//! Accepts 32-bit and 64-bit little-endian `ET_EXEC` images. Two
//! orthogonal placement modes: `use_va` maps the kernel at its link-time
//! virtual addresses, `alloc_anywhere` (higher-half kernels only) drops
//! the physical placement entirely and lays the segments out inside one
//! freshly allocated contiguous range.

use alloc::vec;
use alloc::vec::Vec;

use bytemuck::{Pod, Zeroable};

use crate::errors::ElfError;
use crate::fs::FileRead;
use crate::mem::{
    page_round_down, page_round_up, AllocFlags, AllocationSpec, MemoryServices, MemoryType,
    PAGE_SHIFT,
};

const EI_NIDENT: usize = 16;

const EI_CLASS: usize = 4;
const EI_DATA: usize = 5;

const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];

const ELFCLASS32: u8 = 1;
const ELFCLASS64: u8 = 2;

const ELFDATA2LSB: u8 = 1;

const EM_386: u16 = 3;
const EM_X86_64: u16 = 62;
const EM_AARCH64: u16 = 183;

const ET_EXEC: u16 = 2;

const PT_LOAD: u32 = 1;
const PN_XNUM: u16 = 0xFFFF;

#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
struct Elf32Ehdr {
    e_ident: [u8; EI_NIDENT],
    e_type: u16,
    e_machine: u16,
    e_version: u32,
    e_entry: u32,
    e_phoff: u32,
    e_shoff: u32,
    e_flags: u32,
    e_ehsize: u16,
    e_phentsize: u16,
    e_phnum: u16,
    e_shentsize: u16,
    e_shnum: u16,
    e_shstrndx: u16,
}

#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
struct Elf64Ehdr {
    e_ident: [u8; EI_NIDENT],
    e_type: u16,
    e_machine: u16,
    e_version: u32,
    e_entry: u64,
    e_phoff: u64,
    e_shoff: u64,
    e_flags: u32,
    e_ehsize: u16,
    e_phentsize: u16,
    e_phnum: u16,
    e_shentsize: u16,
    e_shnum: u16,
    e_shstrndx: u16,
}

#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
struct Elf32Phdr {
    p_type: u32,
    p_offset: u32,
    p_vaddr: u32,
    p_paddr: u32,
    p_filesz: u32,
    p_memsz: u32,
    p_flags: u32,
    p_align: u32,
}

#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
struct Elf64Phdr {
    p_type: u32,
    p_flags: u32,
    p_offset: u64,
    p_vaddr: u64,
    p_paddr: u64,
    p_filesz: u64,
    p_memsz: u64,
    p_align: u64,
}

/// The CPU architecture an ELF image targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElfArch {
    I386,
    Amd64,
    AArch64,
}

impl ElfArch {
    pub fn bitness(self) -> u8 {
        match self {
            ElfArch::I386 => 32,
            _ => 64,
        }
    }
}

/// One load request.
pub struct LoadSpec {
    /// Map using `p_vaddr` instead of `p_paddr`.
    pub use_va: bool,

    /// Ignore the physical placement entirely and allocate one
    /// contiguous range for the whole image. Requires `use_va` and a
    /// fully higher-half image.
    pub alloc_anywhere: bool,

    /// 1 + the highest physical address any byte may land at.
    pub binary_ceiling: u64,

    /// The arch's higher-half base; virtual addresses at or above it are
    /// relocated by it for physical placement.
    pub higher_half_base: u64,

    /// Memory map type for the kernel's pages.
    pub memory_type: MemoryType,
}

/// What ended up where.
#[derive(Debug, Clone, Copy, Default)]
pub struct BinaryInfo {
    pub entrypoint: u64,

    pub virtual_base: u64,
    pub virtual_ceiling: u64,

    pub physical_base: u64,
    pub physical_ceiling: u64,

    /// Unset when the image was mapped by virtual addresses without a
    /// meaningful physical envelope.
    pub physical_valid: bool,
}

struct LoadPh {
    virt_addr: u64,
    phys_addr: u64,
    filesz: u64,
    memsz: u64,
    fileoff: u64,
}

fn header_ident(file: &mut dyn FileRead) -> Result<[u8; EI_NIDENT], ElfError> {
    if file.size() < core::mem::size_of::<Elf64Ehdr>() as u64 {
        return Err(ElfError::InvalidMagic);
    }

    let mut ident = [0u8; EI_NIDENT];
    file.read(&mut ident, 0).map_err(|_| ElfError::ReadFailure)?;

    if ident[..4] != ELF_MAGIC {
        return Err(ElfError::InvalidMagic);
    }

    if ident[EI_DATA] != ELFDATA2LSB {
        return Err(ElfError::NotLittleEndian);
    }

    Ok(ident)
}

/// Inspects the image header and reports the architecture it targets.
pub fn get_arch(file: &mut dyn FileRead) -> Result<ElfArch, ElfError> {
    let ident = header_ident(file)?;

    let mut machine_raw = [0u8; 2];
    file.read(&mut machine_raw, 18)
        .map_err(|_| ElfError::ReadFailure)?;
    let machine = u16::from_le_bytes(machine_raw);

    match (ident[EI_CLASS], machine) {
        (ELFCLASS32, EM_386) => Ok(ElfArch::I386),
        (ELFCLASS64, EM_X86_64) => Ok(ElfArch::Amd64),
        (ELFCLASS64, EM_AARCH64) => Ok(ElfArch::AArch64),
        (ELFCLASS32 | ELFCLASS64, _) => Err(ElfError::UnexpectedMachineType),
        _ => Err(ElfError::InvalidClass),
    }
}

struct ParsedHeader {
    entrypoint: u64,
    machine: u16,
    binary_type: u16,
    ph_offset: u64,
    ph_entry_size: u64,
    ph_count: u16,
    bitness: u8,
}

fn parse_header(file: &mut dyn FileRead) -> Result<ParsedHeader, ElfError> {
    let ident = header_ident(file)?;

    match ident[EI_CLASS] {
        ELFCLASS32 => {
            let mut raw = [0u8; core::mem::size_of::<Elf32Ehdr>()];
            file.read(&mut raw, 0).map_err(|_| ElfError::ReadFailure)?;
            let hdr: Elf32Ehdr = bytemuck::pod_read_unaligned(&raw);

            Ok(ParsedHeader {
                entrypoint: u64::from(hdr.e_entry),
                machine: hdr.e_machine,
                binary_type: hdr.e_type,
                ph_offset: u64::from(hdr.e_phoff),
                ph_entry_size: u64::from(hdr.e_phentsize),
                ph_count: hdr.e_phnum,
                bitness: 32,
            })
        }
        ELFCLASS64 => {
            let mut raw = [0u8; core::mem::size_of::<Elf64Ehdr>()];
            file.read(&mut raw, 0).map_err(|_| ElfError::ReadFailure)?;
            let hdr: Elf64Ehdr = bytemuck::pod_read_unaligned(&raw);

            Ok(ParsedHeader {
                entrypoint: hdr.e_entry,
                machine: hdr.e_machine,
                binary_type: hdr.e_type,
                ph_offset: hdr.e_phoff,
                ph_entry_size: u64::from(hdr.e_phentsize),
                ph_count: hdr.e_phnum,
                bitness: 64,
            })
        }
        _ => Err(ElfError::InvalidClass),
    }
}

fn expected_machine(arch: ElfArch) -> u16 {
    match arch {
        ElfArch::I386 => EM_386,
        ElfArch::Amd64 => EM_X86_64,
        ElfArch::AArch64 => EM_AARCH64,
    }
}

fn load_headers(
    file: &mut dyn FileRead,
    hdr: &ParsedHeader,
) -> Result<Vec<LoadPh>, ElfError> {
    let min_ph_size = if hdr.bitness == 32 {
        core::mem::size_of::<Elf32Phdr>() as u64
    } else {
        core::mem::size_of::<Elf64Phdr>() as u64
    };

    if hdr.ph_count == 0 || hdr.ph_count == PN_XNUM {
        return Err(ElfError::InvalidProgramHeaders);
    }

    if hdr.ph_entry_size < min_ph_size {
        return Err(ElfError::InvalidProgramHeaders);
    }

    let table_bytes = hdr
        .ph_entry_size
        .checked_mul(u64::from(hdr.ph_count))
        .ok_or(ElfError::InvalidProgramHeaders)?;
    let ph_end = hdr
        .ph_offset
        .checked_add(table_bytes)
        .ok_or(ElfError::InvalidProgramHeaders)?;

    if ph_end > file.size() {
        return Err(ElfError::InvalidProgramHeaders);
    }

    let mut raw = vec![0u8; table_bytes as usize];
    file.read(&mut raw, hdr.ph_offset)
        .map_err(|_| ElfError::ReadFailure)?;

    let mut headers = Vec::with_capacity(usize::from(hdr.ph_count));

    for i in 0..usize::from(hdr.ph_count) {
        let entry = &raw[i * hdr.ph_entry_size as usize..];

        if hdr.bitness == 32 {
            let ph: Elf32Phdr =
                bytemuck::pod_read_unaligned(&entry[..core::mem::size_of::<Elf32Phdr>()]);

            if ph.p_type != PT_LOAD {
                continue;
            }

            headers.push(LoadPh {
                virt_addr: u64::from(ph.p_vaddr),
                phys_addr: u64::from(ph.p_paddr),
                filesz: u64::from(ph.p_filesz),
                memsz: u64::from(ph.p_memsz),
                fileoff: u64::from(ph.p_offset),
            });
        } else {
            let ph: Elf64Phdr =
                bytemuck::pod_read_unaligned(&entry[..core::mem::size_of::<Elf64Phdr>()]);

            if ph.p_type != PT_LOAD {
                continue;
            }

            headers.push(LoadPh {
                virt_addr: ph.p_vaddr,
                phys_addr: ph.p_paddr,
                filesz: ph.p_filesz,
                memsz: ph.p_memsz,
                fileoff: ph.p_offset,
            });
        }
    }

    Ok(headers)
}

/// Loads `file` into physical memory per `spec`. The caller picks the
/// expected architecture; a mismatching image is refused.
pub fn load(
    ms: &mut MemoryServices,
    file: &mut dyn FileRead,
    arch: ElfArch,
    spec: &LoadSpec,
) -> Result<BinaryInfo, ElfError> {
    if spec.alloc_anywhere && !spec.use_va {
        return Err(ElfError::InvalidLoadOptions);
    }

    let hdr = parse_header(file)?;

    if hdr.machine != expected_machine(arch) || hdr.bitness != arch.bitness() {
        return Err(ElfError::UnexpectedMachineType);
    }

    if hdr.binary_type != ET_EXEC {
        return Err(ElfError::NotAnExecutable);
    }

    let headers = load_headers(file, &hdr)?;
    if headers.is_empty() {
        return Err(ElfError::InvalidProgramHeaders);
    }

    let mut info = BinaryInfo {
        entrypoint: hdr.entrypoint,
        virtual_base: u64::MAX,
        virtual_ceiling: 0,
        physical_base: u64::MAX,
        physical_ceiling: 0,
        physical_valid: !spec.use_va,
    };

    // Anywhere-allocated images have no fixed physical placement, which
    // only works out when the whole image lives in the higher half.
    let must_be_higher_half = spec.alloc_anywhere;

    for ph in &headers {
        let virt_end = ph
            .virt_addr
            .checked_add(ph.memsz)
            .ok_or(ElfError::InvalidLoadAddress)?;

        if must_be_higher_half && ph.virt_addr < spec.higher_half_base {
            return Err(ElfError::InvalidLoadAddress);
        }

        info.virtual_base = info.virtual_base.min(ph.virt_addr);
        info.virtual_ceiling = info.virtual_ceiling.max(virt_end);

        // Relocate the entrypoint into the physical range if needed
        if !spec.use_va
            && info.entrypoint >= ph.virt_addr
            && info.entrypoint < virt_end
        {
            info.entrypoint -= ph.virt_addr;
            info.entrypoint += ph.phys_addr;
        }

        info.physical_base = info.physical_base.min(ph.phys_addr);
        info.physical_ceiling = info.physical_ceiling.max(ph.phys_addr + ph.memsz);
    }

    let (reference_base, reference_ceiling) = if spec.use_va {
        (info.virtual_base, info.virtual_ceiling)
    } else {
        (info.physical_base, info.physical_ceiling)
    };

    if info.entrypoint < reference_base || info.entrypoint >= reference_ceiling {
        return Err(ElfError::InvalidEntrypoint);
    }

    info.virtual_base = page_round_down(info.virtual_base);
    info.virtual_ceiling = page_round_up(info.virtual_ceiling);
    info.physical_base = page_round_down(info.physical_base);
    info.physical_ceiling = page_round_up(info.physical_ceiling);

    if spec.alloc_anywhere {
        let pages = (info.virtual_ceiling - info.virtual_base) >> PAGE_SHIFT;
        let base = ms
            .allocate_pages(pages, spec.binary_ceiling, spec.memory_type)
            .ok_or(ElfError::OutOfMemory)?;

        info.physical_base = base;
        info.physical_ceiling = base + (pages << PAGE_SHIFT);
        info.physical_valid = true;
    }

    for ph in &headers {
        let mut addr = if spec.use_va { ph.virt_addr } else { ph.phys_addr };

        let file_end = ph
            .fileoff
            .checked_add(ph.filesz)
            .ok_or(ElfError::InvalidProgramHeaders)?;

        if ph.memsz < ph.filesz || file_end > file.size() {
            return Err(ElfError::InvalidProgramHeaders);
        }

        if addr >= spec.higher_half_base {
            if !spec.use_va {
                return Err(ElfError::InvalidLoadAddress);
            }

            addr -= spec.higher_half_base;

            if addr < crate::mem::MB && !spec.alloc_anywhere {
                return Err(ElfError::InvalidLoadAddress);
            }
        }

        let load_base = if spec.alloc_anywhere {
            info.physical_base + (ph.virt_addr - info.virtual_base)
        } else {
            let begin = page_round_down(addr);
            let end = page_round_up(
                addr.checked_add(ph.memsz).ok_or(ElfError::InvalidLoadAddress)?,
            );

            if end > spec.binary_ceiling {
                return Err(ElfError::InvalidLoadAddress);
            }

            ms.allocate(&AllocationSpec {
                addr: begin,
                pages: (end - begin) >> PAGE_SHIFT,
                kind: Some(spec.memory_type),
                flags: AllocFlags::PRECISE,
                ..Default::default()
            })
            .ok_or(ElfError::OutOfMemory)?;

            begin + (addr - begin)
        };

        if ph.filesz != 0 {
            // SAFETY: the target range was allocated above (or, for
            // alloc-anywhere, is inside the image's single allocation)
            // and the loader runs identity mapped.
            let target = unsafe {
                core::slice::from_raw_parts_mut(load_base as *mut u8, ph.filesz as usize)
            };

            file.read(target, ph.fileoff)
                .map_err(|_| ElfError::ReadFailure)?;
        }

        let bytes_to_zero = ph.memsz - ph.filesz;
        if bytes_to_zero != 0 {
            // SAFETY: same as above.
            unsafe {
                core::ptr::write_bytes(
                    (load_base + ph.filesz) as *mut u8,
                    0,
                    bytes_to_zero as usize,
                )
            };
        }
    }

    Ok(info)
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use crate::errors::{CanFail, FsError};

    /// An in-memory file for loader tests.
    pub(crate) struct MemFile(pub Vec<u8>);

    impl FileRead for MemFile {
        fn size(&self) -> u64 {
            self.0.len() as u64
        }

        fn read(&mut self, buf: &mut [u8], offset: u64) -> CanFail<FsError> {
            let start = offset as usize;
            let end = start.checked_add(buf.len()).ok_or(FsError::OutOfBounds)?;

            if end > self.0.len() {
                return Err(FsError::OutOfBounds);
            }

            buf.copy_from_slice(&self.0[start..end]);
            Ok(())
        }
    }

    pub(crate) struct Segment {
        pub vaddr: u64,
        pub paddr: u64,
        pub data: Vec<u8>,
        pub memsz: u64,
    }

    /// Builds a minimal 64-bit executable image.
    pub(crate) fn build_elf64(machine_amd64: bool, entry: u64, segments: &[Segment]) -> Vec<u8> {
        let ehsize = core::mem::size_of::<Elf64Ehdr>();
        let phsize = core::mem::size_of::<Elf64Phdr>();
        let ph_total = phsize * segments.len();

        let mut data_off = (ehsize + ph_total + 0xFFF) & !0xFFF;
        let mut image = vec![0u8; data_off];

        let mut phdrs = Vec::new();
        for seg in segments {
            phdrs.push(Elf64Phdr {
                p_type: PT_LOAD,
                p_flags: 0,
                p_offset: data_off as u64,
                p_vaddr: seg.vaddr,
                p_paddr: seg.paddr,
                p_filesz: seg.data.len() as u64,
                p_memsz: seg.memsz,
                p_align: 0x1000,
            });
            data_off += seg.data.len();
        }

        let ehdr = Elf64Ehdr {
            e_ident: {
                let mut ident = [0u8; EI_NIDENT];
                ident[..4].copy_from_slice(&ELF_MAGIC);
                ident[EI_CLASS] = ELFCLASS64;
                ident[EI_DATA] = ELFDATA2LSB;
                ident[6] = 1;
                ident
            },
            e_type: ET_EXEC,
            e_machine: if machine_amd64 { EM_X86_64 } else { EM_AARCH64 },
            e_version: 1,
            e_entry: entry,
            e_phoff: ehsize as u64,
            e_shoff: 0,
            e_flags: 0,
            e_ehsize: ehsize as u16,
            e_phentsize: phsize as u16,
            e_phnum: segments.len() as u16,
            e_shentsize: 0,
            e_shnum: 0,
            e_shstrndx: 0,
        };

        image[..ehsize].copy_from_slice(bytemuck::bytes_of(&ehdr));

        for (i, ph) in phdrs.iter().enumerate() {
            let off = ehsize + i * phsize;
            image[off..off + phsize].copy_from_slice(bytemuck::bytes_of(ph));
        }

        for seg in segments {
            image.extend_from_slice(&seg.data);
        }

        image
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::{build_elf64, MemFile, Segment};
    use super::*;
    use crate::mem::testutil::Arena;
    use crate::mem::GB;

    fn arena(pages: usize) -> (Arena, MemoryServices) {
        Arena::new(pages)
    }

    #[test]
    fn rejects_bad_magic() {
        let mut file = MemFile(vec![0u8; 128]);
        assert_eq!(get_arch(&mut file), Err(ElfError::InvalidMagic));
    }

    #[test]
    fn reports_arch() {
        let image = build_elf64(
            true,
            0xFFFF_FFFF_8000_0000,
            &[Segment {
                vaddr: 0xFFFF_FFFF_8000_0000,
                paddr: 0x20_0000,
                data: vec![1, 2, 3],
                memsz: 3,
            }],
        );

        let mut file = MemFile(image);
        assert_eq!(get_arch(&mut file).unwrap(), ElfArch::Amd64);
    }

    #[test]
    fn alloc_anywhere_places_segments_relative_to_base() {
        let (_buf, mut ms) = arena(64);

        let payload: Vec<u8> = (0..0x1800u32).map(|i| (i % 255) as u8).collect();
        let image = build_elf64(
            true,
            0xFFFF_FFFF_8000_0000,
            &[Segment {
                vaddr: 0xFFFF_FFFF_8000_0000,
                paddr: 0,
                data: payload.clone(),
                memsz: 0x2000,
            }],
        );

        let mut file = MemFile(image);
        let info = load(
            &mut ms,
            &mut file,
            ElfArch::Amd64,
            &LoadSpec {
                use_va: true,
                alloc_anywhere: true,
                binary_ceiling: 4 * GB,
                higher_half_base: 0xFFFF_FFFF_8000_0000,
                memory_type: MemoryType(0xFFFF_0004),
            },
        )
        .unwrap();

        assert!(info.physical_valid);
        assert_eq!(info.virtual_base, 0xFFFF_FFFF_8000_0000);
        assert_eq!(info.virtual_ceiling, 0xFFFF_FFFF_8000_2000);
        assert_eq!(info.physical_ceiling - info.physical_base, 0x2000);
        assert_eq!(info.entrypoint, 0xFFFF_FFFF_8000_0000);

        // File bytes landed at the allocated base, the rest is zeroed.
        let loaded =
            unsafe { core::slice::from_raw_parts(info.physical_base as *const u8, 0x2000) };
        assert_eq!(&loaded[..payload.len()], &payload[..]);
        assert!(loaded[payload.len()..].iter().all(|&b| b == 0));

        // The kernel's pages carry the protocol-specific type.
        assert!(ms
            .entries()
            .iter()
            .any(|e| e.kind == MemoryType(0xFFFF_0004)
                && e.physical_address == info.physical_base));
    }

    #[test]
    fn anywhere_requires_higher_half() {
        let (_buf, mut ms) = arena(16);

        let image = build_elf64(
            true,
            0x10_0000,
            &[Segment {
                vaddr: 0x10_0000,
                paddr: 0x10_0000,
                data: vec![0; 16],
                memsz: 16,
            }],
        );

        let mut file = MemFile(image);
        let err = load(
            &mut ms,
            &mut file,
            ElfArch::Amd64,
            &LoadSpec {
                use_va: true,
                alloc_anywhere: true,
                binary_ceiling: 4 * GB,
                higher_half_base: 0xFFFF_FFFF_8000_0000,
                memory_type: MemoryType(0xFFFF_0004),
            },
        )
        .unwrap_err();

        assert_eq!(err, ElfError::InvalidLoadAddress);
    }

    #[test]
    fn entrypoint_outside_image_is_rejected() {
        let (_buf, mut ms) = arena(16);

        let image = build_elf64(
            true,
            0xFFFF_FFFF_9000_0000,
            &[Segment {
                vaddr: 0xFFFF_FFFF_8000_0000,
                paddr: 0,
                data: vec![0; 16],
                memsz: 16,
            }],
        );

        let mut file = MemFile(image);
        let err = load(
            &mut ms,
            &mut file,
            ElfArch::Amd64,
            &LoadSpec {
                use_va: true,
                alloc_anywhere: true,
                binary_ceiling: 4 * GB,
                higher_half_base: 0xFFFF_FFFF_8000_0000,
                memory_type: MemoryType(0xFFFF_0004),
            },
        )
        .unwrap_err();

        assert_eq!(err, ElfError::InvalidEntrypoint);
    }

    #[test]
    fn wrong_machine_is_rejected() {
        let (_buf, mut ms) = arena(16);

        let image = build_elf64(
            false, // aarch64
            0xFFFF_FFFF_8000_0000,
            &[Segment {
                vaddr: 0xFFFF_FFFF_8000_0000,
                paddr: 0,
                data: vec![0; 16],
                memsz: 16,
            }],
        );

        let mut file = MemFile(image);
        let err = load(
            &mut ms,
            &mut file,
            ElfArch::Amd64,
            &LoadSpec {
                use_va: true,
                alloc_anywhere: true,
                binary_ceiling: 4 * GB,
                higher_half_base: 0xFFFF_FFFF_8000_0000,
                memory_type: MemoryType(0xFFFF_0004),
            },
        )
        .unwrap_err();

        assert_eq!(err, ElfError::UnexpectedMachineType);
    }
}

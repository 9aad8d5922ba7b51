//! The `ultra` boot protocol driver.
//!
//! Orchestrates the whole load: kernel ELF placement, page table
//! construction, module and stack allocation, video mode selection, the
//! attribute array, and finally the irrevocable jump. The memory map is
//! frozen while the attribute array is written; nothing but the jump may
//! happen after that.

use alloc::vec::Vec;

use crate::arch::{Arch, PtConstraint, PtType};
use crate::config::{Config, LoadableEntry, Value, ValueType};
use crate::elf::{self, BinaryInfo, LoadSpec};
use crate::errors::BootError;
use crate::fs::path::{self, FullPath};
use crate::fs::table::{FsEntry, FsEntryType, FsTable};
use crate::handover::{self, HandoverFlags, HandoverInfo};
use crate::mem::{
    page_count, page_round_up, AllocFlags, AllocationSpec, FixupFlags, MemoryServices,
    MemoryType, KB, PAGE_SHIFT, PAGE_SIZE,
};
use crate::oops;
use crate::services::{ServiceProvider, Services};
use crate::video::{Framebuffer, Resolution, VideoMode, VideoServices, FB_FORMAT_INVALID};
use crate::vm::{MappingSpec, PageTable, PageType};

pub mod attributes;

use attributes::*;

const LOADER_NAME: &str = "hyper";
const LOADER_MAJOR: u16 = 0;
const LOADER_MINOR: u16 = 6;

const MAX_CMDLINE_LEN: usize = 256;
const DEFAULT_STACK_SIZE: u64 = 16 * KB;

/// Memory types this protocol understands; everything else degrades to
/// reserved (or free, for loader-reclaimable) at fixup time.
const KNOWN_MM_TYPES: &[MemoryType] = &[
    MemoryType::FREE,
    MemoryType::RESERVED,
    MemoryType::ACPI_RECLAIMABLE,
    MemoryType::NVS,
    MemoryType::LOADER_RECLAIMABLE,
];

fn mandatory<'src>(value: Option<Value<'src>>, key: &str) -> Result<Value<'src>, BootError> {
    value.ok_or_else(|| BootError::new(alloc::format!("no mandatory key \"{key}\"")))
}

struct BinaryOptions<'src> {
    path_str: &'src str,
    allocate_anywhere: bool,
}

fn get_binary_options<'src>(
    cfg: &Config<'src>,
    le: &LoadableEntry<'src>,
) -> Result<BinaryOptions<'src>, BootError> {
    let value = mandatory(
        cfg.entry_child(le, "binary", ValueType::STRING | ValueType::OBJECT, true)?,
        "binary",
    )?;

    if value.is_object() {
        let path = mandatory(
            cfg.value_child(&value, "path", ValueType::STRING, true)?,
            "binary/path",
        )?;
        let allocate_anywhere = cfg
            .value_child(&value, "allocate-anywhere", ValueType::BOOLEAN, true)?
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        Ok(BinaryOptions {
            path_str: path.as_str().unwrap(),
            allocate_anywhere,
        })
    } else {
        Ok(BinaryOptions {
            path_str: value.as_str().unwrap(),
            allocate_anywhere: false,
        })
    }
}

struct LoadedKernel<'src, 'fse> {
    path: FullPath<'src>,
    fse: &'fse FsEntry,
    allocate_anywhere: bool,
    bin_info: BinaryInfo,
    is_higher_half: bool,
    binary: crate::fs::File,
}

fn load_kernel<'src, 'fse>(
    services: &mut Services,
    fs_table: &'fse FsTable,
    cfg: &Config<'src>,
    le: &LoadableEntry<'src>,
    hi: &mut HandoverInfo,
) -> Result<LoadedKernel<'src, 'fse>, BootError> {
    let arch = services.platform.arch();
    let bo = get_binary_options(cfg, le)?;

    let Some(full_path) = path::parse(bo.path_str) else {
        oops!("invalid value for key binary/path: \"{}\"", bo.path_str);
    };

    let Some(fse) = fs_table.by_full_path(&full_path) else {
        oops!("no such disk/partition {}", bo.path_str);
    };

    let Some(mut binary) = path::open(&*fse.fs, full_path.path_within_partition) else {
        oops!("no such file {}", full_path.path_within_partition);
    };

    let elf_arch = elf::get_arch(binary.as_mut())?;

    let flags = arch.flags_for_binary(elf_arch, bo.allocate_anywhere)?;
    let support = services.platform.flag_support();

    if !support.is_supported(flags) {
        oops!("kernel requires unsupported machine features");
    }

    hi.flags |= flags;

    let higher_half_base = arch.higher_half_base(hi.flags);
    let bin_info = elf::load(
        &mut services.memory,
        binary.as_mut(),
        elf_arch,
        &LoadSpec {
            use_va: true,
            alloc_anywhere: bo.allocate_anywhere,
            binary_ceiling: arch.max_binary_address(hi.flags),
            higher_half_base,
            memory_type: MemoryType(MEMORY_TYPE_KERNEL_BINARY),
        },
    )?;

    hi.entrypoint = bin_info.entrypoint;

    Ok(LoadedKernel {
        path: full_path,
        fse,
        allocate_anywhere: bo.allocate_anywhere,
        bin_info,
        is_higher_half: bin_info.entrypoint >= higher_half_base,
        binary,
    })
}

/*
 * Always map the first huge page worth of physical memory with small
 * pages. This keeps the optional null guard page small, and on x86 also
 * avoids crossing MTRR boundaries with conflicting cache types in the
 * low MiB, which would otherwise cost a TLB-level fracture on every
 * access.
 */
fn map_lower_huge_page(
    pt: &mut PageTable,
    ms: &mut MemoryServices,
    spec: &mut MappingSpec,
    null_guard: bool,
) {
    let old_count = spec.count;
    let mut size_to_map = pt.huge_page_size();

    spec.kind = PageType::Normal;
    spec.physical_base = 0;

    if null_guard {
        spec.physical_base += PAGE_SIZE;
        spec.virtual_base += PAGE_SIZE;
        size_to_map -= PAGE_SIZE;
    }
    spec.count = size_to_map >> PAGE_SHIFT;

    pt.map_pages(ms, spec);

    spec.kind = PageType::Huge;
    spec.physical_base += size_to_map;
    spec.virtual_base += size_to_map;
    spec.count = old_count - 1;
}

fn map_high_memory(
    pt: &mut PageTable,
    ms: &mut MemoryServices,
    direct_map_base: u64,
    direct_map_min_size: u64,
    map_lower: bool,
) {
    let hp_shift = pt.huge_page_shift();

    // Snapshot: mapping allocates table pages, which mutates the map.
    let entries: Vec<_> = ms.entries().to_vec();

    for entry in entries {
        let aligned_end = pt.huge_page_round_up(entry.end());

        if aligned_end <= direct_map_min_size {
            continue;
        }

        let aligned_begin = pt
            .huge_page_round_down(entry.physical_address)
            .max(direct_map_min_size);
        let count = (aligned_end - aligned_begin) >> hp_shift;

        log::info!(
            target: "ultra",
            "mapping high memory: {aligned_begin:#018X} -> {aligned_end:#018X} ({count} pages)"
        );

        let mut spec = MappingSpec {
            virtual_base: aligned_begin,
            physical_base: aligned_begin,
            count,
            kind: PageType::Huge,
            critical: true,
        };

        if map_lower {
            pt.map_pages(ms, &spec);
        }

        spec.virtual_base += direct_map_base;
        pt.map_pages(ms, &spec);
    }
}

fn do_build_page_table(
    arch: Arch,
    ms: &mut MemoryServices,
    kernel: &LoadedKernel<'_, '_>,
    hi: &HandoverInfo,
    ty: PtType,
    higher_half_exclusive: bool,
    null_guard: bool,
) -> Result<PageTable, BootError> {
    let map_lower = !higher_half_exclusive;
    let hh_base = arch.higher_half_base(hi.flags);
    let direct_map_base = hi.direct_map_base;

    let Some(mut pt) = crate::arch::page_table_init(
        ms,
        ty,
        arch.max_pt_address(direct_map_base, hi.flags),
    ) else {
        oops!("out of memory building the page table root");
    };

    let hp_shift = pt.huge_page_shift();
    let direct_map_min_size = arch.adjust_direct_map_min_size(
        arch.minimum_map_length(direct_map_base, hi.flags),
        hi.flags,
    );

    // Direct map the higher half
    let mut spec = MappingSpec {
        virtual_base: direct_map_base,
        physical_base: 0,
        count: direct_map_min_size >> hp_shift,
        kind: PageType::Huge,
        critical: true,
    };

    map_lower_huge_page(&mut pt, ms, &mut spec, false);
    pt.map_pages(ms, &spec);

    if map_lower {
        spec.virtual_base = 0;
        spec.count =
            arch.adjust_direct_map_min_size_for_lower_half(direct_map_min_size, hi.flags)
                >> hp_shift;

        map_lower_huge_page(&mut pt, ms, &mut spec, null_guard);
        pt.map_pages(ms, &spec);
    } else {
        // Steal the identity mapping from the higher half; the kernel
        // drops it once it has moved in.
        let root_cov = pt.level_entry_virtual_coverage(usize::from(pt.levels()) - 1);
        let mut off = 0;

        while off < direct_map_min_size {
            pt.copy_root_entry(direct_map_base + off, off);
            off += root_cov;
        }
    }

    if arch.should_map_high_memory(hi.flags) {
        map_high_memory(&mut pt, ms, direct_map_base, direct_map_min_size, map_lower);
    }

    /*
     * If the kernel had allocate-anywhere set, map its virtual base to
     * wherever it physically landed; otherwise map the higher half onto
     * physical zero so link-address placement holds.
     */
    if kernel.allocate_anywhere {
        let bi = &kernel.bin_info;

        spec.physical_base = bi.physical_base;
        spec.virtual_base = bi.virtual_base;
        spec.count = page_count(bi.physical_ceiling - bi.physical_base);
        spec.kind = PageType::Normal;

        pt.map_pages(ms, &spec);
    } else if hh_base != direct_map_base {
        spec.virtual_base = hh_base;
        spec.count = arch.higher_half_size(hi.flags) >> hp_shift;

        map_lower_huge_page(&mut pt, ms, &mut spec, false);
        pt.map_pages(ms, &spec);
    }

    Ok(pt)
}

fn build_page_table(
    services: &mut Services,
    cfg: &Config<'_>,
    le: &LoadableEntry<'_>,
    kernel: &LoadedKernel<'_, '_>,
    hi: &mut HandoverInfo,
) -> Result<(PageTable, u8), BootError> {
    let arch = services.platform.arch();

    let higher_half_exclusive = cfg
        .entry_child(le, "higher-half-exclusive", ValueType::BOOLEAN, true)?
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    if higher_half_exclusive && !kernel.is_higher_half {
        oops!("higher half exclusive mode is only allowed for higher half kernels");
    }

    if higher_half_exclusive {
        hi.flags |= HandoverFlags::HIGHER_HALF_ONLY;
    }

    let mut pt_levels = 4u64;
    let mut null_guard = false;
    let mut constraint = PtConstraint::Maximum;
    let mut constraint_str = "maximum";

    if let Some(pt_val) = cfg.entry_child(le, "page-table", ValueType::OBJECT, true)? {
        if let Some(levels) = cfg.value_child(&pt_val, "levels", ValueType::UNSIGNED, true)? {
            pt_levels = levels.as_unsigned().unwrap();
        }

        if let Some(guard) = cfg.value_child(&pt_val, "null-guard", ValueType::BOOLEAN, true)? {
            null_guard = guard.as_bool().unwrap();
        }

        if let Some(cs) = cfg.value_child(&pt_val, "constraint", ValueType::STRING, true)? {
            constraint_str = cs.as_str().unwrap();

            constraint = match constraint_str {
                "maximum" => PtConstraint::Maximum,
                "exactly" => PtConstraint::Exactly,
                "at-least" => PtConstraint::AtLeast,
                _ => oops!("invalid page-table constraint '{constraint_str}'"),
            };
        }
    }

    let support = services.platform.flag_support();
    let Some(ty) = arch.configure_pt_type(&mut hi.flags, pt_levels, constraint, &support) else {
        oops!(
            "failed to satisfy page-table constraint '{constraint_str}', {pt_levels} levels not supported"
        );
    };

    let depth = ty.depth();
    if pt_levels < u64::from(depth) && constraint != PtConstraint::AtLeast {
        oops!("invalid page-table levels value {pt_levels}, expected minimum {depth}");
    }

    hi.direct_map_base = arch.direct_map_base(hi.flags);

    let pt = do_build_page_table(
        arch,
        &mut services.memory,
        kernel,
        hi,
        ty,
        higher_half_exclusive,
        null_guard,
    )?;

    Ok((pt, depth))
}

fn module_get_size(cfg: &Config<'_>, value: &Value<'_>) -> Result<u64, BootError> {
    let mask = ValueType::STRING | ValueType::UNSIGNED | ValueType::NONE;

    let Some(size) = cfg.value_child(value, "size", mask, true)? else {
        return Ok(0);
    };

    if size.is_null() {
        return Ok(0);
    }

    if let Some(text) = size.as_str() {
        if text != "auto" {
            oops!("invalid value for key module/size: \"{text}\"");
        }

        return Ok(0);
    }

    let size = size.as_unsigned().unwrap();
    if size == 0 {
        oops!("invalid value for key module/size: \"0\"");
    }

    Ok(size)
}

fn module_get_type(cfg: &Config<'_>, value: &Value<'_>) -> Result<u32, BootError> {
    let mask = ValueType::STRING | ValueType::NONE;

    let Some(ty) = cfg.value_child(value, "type", mask, true)? else {
        return Ok(MODULE_TYPE_FILE);
    };

    match ty.as_str() {
        None | Some("file") => Ok(MODULE_TYPE_FILE),
        Some("memory") => Ok(MODULE_TYPE_MEMORY),
        Some(other) => oops!("invalid value for key module/type: \"{other}\""),
    }
}

fn module_get_load_address(
    cfg: &Config<'_>,
    value: &Value<'_>,
) -> Result<Option<u64>, BootError> {
    let mask = ValueType::STRING | ValueType::UNSIGNED | ValueType::NONE;

    let Some(load_at) = cfg.value_child(value, "load-at", mask, true)? else {
        return Ok(None);
    };

    if load_at.is_null() {
        return Ok(None);
    }

    if let Some(text) = load_at.as_str() {
        if text != "auto" && text != "anywhere" {
            oops!("invalid value for key module/load-at: \"{text}\"");
        }

        return Ok(None);
    }

    Ok(Some(load_at.as_unsigned().unwrap()))
}

/// Allocates the backing pages for a module and zeroes the tail past
/// `zero_after_offset`.
fn module_data_alloc(
    ms: &mut MemoryServices,
    load_address: Option<u64>,
    ceiling: u64,
    size: u64,
    zero_after_offset: u64,
) -> Result<u64, BootError> {
    let byte_span = page_round_up(size);
    let mut spec = AllocationSpec {
        pages: byte_span >> PAGE_SHIFT,
        kind: Some(MemoryType(MEMORY_TYPE_MODULE)),
        flags: AllocFlags::CRITICAL,
        ceiling,
        ..Default::default()
    };

    if let Some(addr) = load_address {
        spec.addr = addr;
        spec.flags |= AllocFlags::PRECISE;

        let Some(end) = addr.checked_add(size) else {
            oops!("invalid module address {addr:#018X} + size {size} combination");
        };

        if end > ceiling {
            oops!("module is too high in memory {addr:#018X} (ceiling: {ceiling:#018X})");
        }
    }

    // CRITICAL allocations never fail.
    let addr = ms.allocate(&spec).unwrap();

    // SAFETY: the range was just allocated and is identity mapped.
    unsafe {
        core::ptr::write_bytes(
            (addr + zero_after_offset) as *mut u8,
            0,
            (byte_span - zero_after_offset) as usize,
        )
    };

    Ok(addr)
}

fn module_load(
    ms: &mut MemoryServices,
    fs_table: &FsTable,
    cfg: &Config<'_>,
    value: &Value<'_>,
    ceiling: u64,
    module_idx: usize,
) -> Result<ModuleInfoAttribute, BootError> {
    let mut attr = ModuleInfoAttribute {
        header: AttributeHeader {
            kind: ATTRIBUTE_MODULE_INFO,
            size_in_bytes: core::mem::size_of::<ModuleInfoAttribute>() as u32,
        },
        name: [0; MODULE_NAME_CAPACITY],
        kind: MODULE_TYPE_FILE,
        reserved: 0,
        address: 0,
        size: 0,
    };

    let mut module_name = "";
    let mut module_size = 0;
    let mut module_type = MODULE_TYPE_FILE;
    let mut load_address = None;

    let path_str = if value.is_object() {
        if let Some(name) = cfg.value_child(value, "name", ValueType::STRING, true)? {
            module_name = name.as_str().unwrap();
        }

        module_size = module_get_size(cfg, value)?;
        module_type = module_get_type(cfg, value)?;
        load_address = module_get_load_address(cfg, value)?;

        cfg.value_child(value, "path", ValueType::STRING, true)?
            .map(|v| v.as_str().unwrap())
    } else {
        value.as_str()
    };

    if module_name.is_empty() {
        copy_terminated(&mut attr.name, &alloc::format!("unnamed_module{module_idx}"));
    } else {
        if module_name.len() >= MODULE_NAME_CAPACITY {
            oops!(
                "module name \"{module_name}\" is too long ({} vs max {})",
                module_name.len(),
                MODULE_NAME_CAPACITY - 1
            );
        }

        copy_terminated(&mut attr.name, module_name);
    }

    log::info!(target: "ultra", "loading module \"{module_name}\"...");

    let module_data;

    if module_type == MODULE_TYPE_FILE {
        let Some(path_str) = path_str else {
            oops!("no mandatory key \"path\"");
        };

        let Some(full_path) = path::parse(path_str) else {
            oops!("invalid module path {path_str}");
        };

        let Some(fse) = fs_table.by_full_path(&full_path) else {
            oops!("no such disk/partition {path_str}");
        };

        let Some(mut file) = path::open(&*fse.fs, full_path.path_within_partition) else {
            oops!("no such file {}", full_path.path_within_partition);
        };

        let mut bytes_to_read = file.size();

        if module_size == 0 {
            module_size = bytes_to_read;
        } else if module_size < bytes_to_read {
            bytes_to_read = module_size;
        }

        module_data =
            module_data_alloc(ms, load_address, ceiling, module_size, bytes_to_read)?;

        // SAFETY: allocated above, identity mapped.
        let target = unsafe {
            core::slice::from_raw_parts_mut(module_data as *mut u8, bytes_to_read as usize)
        };

        if file.read(target, 0).is_err() {
            oops!("failed to read module file");
        }
    } else {
        if module_size == 0 {
            oops!("module size cannot be \"auto\" for type \"memory\"");
        }

        module_data = module_data_alloc(ms, load_address, ceiling, module_size, 0)?;
    }

    attr.kind = module_type;
    attr.address = module_data;
    attr.size = module_size;

    Ok(attr)
}

fn load_kernel_as_module(
    ms: &mut MemoryServices,
    cfg: &Config<'_>,
    le: &LoadableEntry<'_>,
    kernel: &mut LoadedKernel<'_, '_>,
    ceiling: u64,
) -> Result<Option<ModuleInfoAttribute>, BootError> {
    let wanted = cfg
        .entry_child(le, "kernel-as-module", ValueType::BOOLEAN, true)?
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    if !wanted {
        return Ok(None);
    }

    let size = kernel.binary.size();
    let data = module_data_alloc(ms, None, ceiling, size, size)?;

    // SAFETY: allocated above, identity mapped.
    let target = unsafe { core::slice::from_raw_parts_mut(data as *mut u8, size as usize) };

    if kernel.binary.read(target, 0).is_err() {
        oops!("failed to read kernel binary");
    }

    let mut attr = ModuleInfoAttribute {
        header: AttributeHeader {
            kind: ATTRIBUTE_MODULE_INFO,
            size_in_bytes: core::mem::size_of::<ModuleInfoAttribute>() as u32,
        },
        name: [0; MODULE_NAME_CAPACITY],
        kind: MODULE_TYPE_FILE,
        reserved: 0,
        address: data,
        size,
    };
    copy_terminated(&mut attr.name, "__KERNEL__");

    Ok(Some(attr))
}

fn load_all_modules(
    ms: &mut MemoryServices,
    fs_table: &FsTable,
    cfg: &Config<'_>,
    le: &LoadableEntry<'_>,
    ceiling: u64,
    modules: &mut Vec<ModuleInfoAttribute>,
) -> Result<(), BootError> {
    let mask = ValueType::STRING | ValueType::OBJECT;

    let Some(mut value) = cfg.entry_child(le, "module", mask, false)? else {
        return Ok(());
    };

    let mut module_idx = 0;

    loop {
        module_idx += 1;
        modules.push(module_load(ms, fs_table, cfg, &value, ceiling, module_idx)?);

        match cfg.next_of_key(&value, mask, true)? {
            Some(next) => value = next,
            None => return Ok(()),
        }
    }
}

fn get_cmdline<'src>(
    cfg: &Config<'src>,
    le: &LoadableEntry<'src>,
) -> Result<Option<&'src str>, BootError> {
    let Some(value) = cfg.entry_child(le, "cmdline", ValueType::STRING, true)? else {
        return Ok(None);
    };

    let text = value.as_str().unwrap();
    if text.len() > MAX_CMDLINE_LEN {
        oops!("command line is too big: {} vs max {}", text.len(), MAX_CMDLINE_LEN);
    }

    Ok(Some(text))
}

fn allocate_stack(
    ms: &mut MemoryServices,
    cfg: &Config<'_>,
    le: &LoadableEntry<'_>,
    ceiling: u64,
) -> Result<u64, BootError> {
    let mut size = DEFAULT_STACK_SIZE;
    let mut spec = AllocationSpec {
        ceiling,
        kind: Some(MemoryType(MEMORY_TYPE_KERNEL_STACK)),
        flags: AllocFlags::CRITICAL,
        ..Default::default()
    };

    let mask = ValueType::STRING | ValueType::OBJECT;

    if let Some(value) = cfg.entry_child(le, "stack", mask, true)? {
        if value.is_object() {
            let at_mask = ValueType::STRING | ValueType::UNSIGNED;

            if let Some(at) = cfg.value_child(&value, "allocate-at", at_mask, true)? {
                match at.as_str() {
                    Some("anywhere") => {}
                    Some(other) => {
                        oops!("invalid value for key stack/allocate-at: \"{other}\"")
                    }
                    None => {
                        spec.addr = at.as_unsigned().unwrap();
                        spec.flags |= AllocFlags::PRECISE;
                    }
                }
            }

            if let Some(sz) = cfg.value_child(&value, "size", at_mask, true)? {
                match sz.as_str() {
                    Some("auto") => {}
                    Some(other) => oops!("invalid value for key stack/size: \"{other}\""),
                    None => size = page_round_up(sz.as_unsigned().unwrap()),
                }
            }

            if size == 0 || spec.addr.checked_add(size).is_none() {
                oops!(
                    "invalid stack address ({:#018X}) + size ({size}) combination",
                    spec.addr
                );
            }
        } else if value.as_str() != Some("auto") {
            oops!(
                "invalid value for key stack: \"{}\"",
                value.as_str().unwrap_or("")
            );
        }
    }

    spec.pages = size >> PAGE_SHIFT;

    // CRITICAL allocations never fail; the stack pointer starts at the top.
    let base = ms.allocate(&spec).unwrap();
    Ok(base + size)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VideoModeConstraint {
    Exactly,
    AtLeast,
}

struct RequestedVideoMode {
    width: u32,
    height: u32,
    bpp: u16,
    format: u16,
    constraint: VideoModeConstraint,
    none: bool,
}

const DEFAULT_WIDTH: u32 = 1024;
const DEFAULT_HEIGHT: u32 = 768;
const DEFAULT_BPP: u16 = 32;

impl Default for RequestedVideoMode {
    fn default() -> Self {
        Self {
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            bpp: DEFAULT_BPP,
            format: FB_FORMAT_INVALID,
            constraint: VideoModeConstraint::AtLeast,
            none: false,
        }
    }
}

fn video_mode_from_value(
    cfg: &Config<'_>,
    value: &Value<'_>,
    mode: &mut RequestedVideoMode,
) -> Result<(), BootError> {
    if value.is_null() {
        mode.none = true;
        return Ok(());
    }

    if let Some(text) = value.as_str() {
        match text {
            "unset" => mode.none = true,
            "auto" => {}
            other => oops!("invalid value for key video-mode: \"{other}\""),
        }

        return Ok(());
    }

    if let Some(v) = cfg.value_child(value, "width", ValueType::UNSIGNED, true)? {
        mode.width = v.as_unsigned().unwrap() as u32;
    }
    if let Some(v) = cfg.value_child(value, "height", ValueType::UNSIGNED, true)? {
        mode.height = v.as_unsigned().unwrap() as u32;
    }
    if let Some(v) = cfg.value_child(value, "bpp", ValueType::UNSIGNED, true)? {
        mode.bpp = v.as_unsigned().unwrap() as u16;
    }

    if let Some(v) = cfg.value_child(value, "format", ValueType::STRING, true)? {
        let text = v.as_str().unwrap();

        mode.format = if text.eq_ignore_ascii_case("rgb888") {
            crate::video::FB_FORMAT_RGB888
        } else if text.eq_ignore_ascii_case("bgr888") {
            crate::video::FB_FORMAT_BGR888
        } else if text.eq_ignore_ascii_case("rgbx8888") {
            crate::video::FB_FORMAT_RGBX8888
        } else if text.eq_ignore_ascii_case("xrgb8888") {
            crate::video::FB_FORMAT_XRGB8888
        } else if text.eq_ignore_ascii_case("auto") {
            FB_FORMAT_INVALID
        } else {
            oops!("unsupported video-mode format '{text}'");
        };
    }

    if let Some(v) = cfg.value_child(value, "constraint", ValueType::STRING, true)? {
        mode.constraint = match v.as_str().unwrap() {
            "at-least" => VideoModeConstraint::AtLeast,
            "exactly" => VideoModeConstraint::Exactly,
            other => oops!("invalid video mode constraint {other}"),
        };
    }

    Ok(())
}

/// Picks a firmware mode per the request and native resolution.
///
/// `at-least` accepts modes at least as large as the request in every
/// dimension that still fit the native resolution, preferring the
/// largest; `exactly` wants a perfect geometry match.
fn pick_video_mode(
    video: &dyn VideoServices,
    rm: &RequestedVideoMode,
) -> Option<VideoMode> {
    let native = video
        .query_native_resolution()
        .unwrap_or(Resolution {
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
        });

    let mut picked: Option<VideoMode> = None;

    for idx in 0..video.mode_count() {
        let Some(m) = video.query_mode(idx) else {
            continue;
        };

        if rm.format != FB_FORMAT_INVALID && m.format != rm.format {
            continue;
        }

        if rm.constraint == VideoModeConstraint::Exactly {
            if m.width == rm.width && m.height == rm.height && m.bpp == rm.bpp {
                return Some(m);
            }

            continue;
        }

        if m.width > native.width || m.height > native.height {
            continue;
        }

        if m.width < rm.width || m.height < rm.height || m.bpp < rm.bpp {
            continue;
        }

        if let Some(prev) = picked {
            if !(m.width >= prev.width && m.height >= prev.height && m.bpp >= prev.bpp) {
                continue;
            }
        }

        picked = Some(m);
    }

    picked
}

fn set_video_mode(
    services: &mut Services,
    cfg: &Config<'_>,
    le: &LoadableEntry<'_>,
) -> Result<Option<Framebuffer>, BootError> {
    let mut rm = RequestedVideoMode::default();
    let mask = ValueType::OBJECT | ValueType::STRING | ValueType::NONE;

    if let Some(value) = cfg.entry_child(le, "video-mode", mask, true)? {
        video_mode_from_value(cfg, &value, &mut rm)?;
    }

    if rm.none {
        return Ok(None);
    }

    let Some(picked) = pick_video_mode(services.video.as_ref(), &rm) else {
        oops!(
            "failed to pick a video mode according to constraints ({}x{} {} bpp)",
            rm.width, rm.height, rm.bpp
        );
    };

    log::info!(
        target: "ultra",
        "picked video mode {}x{} @ {} bpp", picked.width, picked.height, picked.bpp
    );

    let Ok(fb) = services.video.set_mode(picked.id) else {
        oops!("failed to set picked video mode");
    };

    Ok(Some(fb))
}

struct AttributeArraySpec<'a> {
    platform_type: u32,
    acpi_rsdp_address: u64,
    dtb_address: u64,
    smbios_address: u64,
    direct_map_base: u64,
    page_table_depth: u8,

    kernel_info: KernelInfoAttribute,
    modules: &'a [ModuleInfoAttribute],
    cmdline: Option<&'a str>,
    fb: Option<Framebuffer>,

    array_ceiling: u64,
}

fn kernel_info_attribute(kernel: &LoadedKernel<'_, '_>) -> KernelInfoAttribute {
    let fse = kernel.fse;

    let partition_type = match fse.entry_type {
        FsEntryType::Raw => PARTITION_TYPE_RAW,
        FsEntryType::Mbr => PARTITION_TYPE_MBR,
        FsEntryType::Gpt => PARTITION_TYPE_GPT,
    };

    let mut attr = KernelInfoAttribute {
        header: AttributeHeader {
            kind: ATTRIBUTE_KERNEL_INFO,
            size_in_bytes: core::mem::size_of::<KernelInfoAttribute>() as u32,
        },
        physical_base: kernel.bin_info.physical_base,
        virtual_base: kernel.bin_info.virtual_base,
        range_length: kernel.bin_info.physical_ceiling - kernel.bin_info.physical_base,
        partition_type,
        disk_guid: fse.disk_guid,
        partition_guid: fse.partition_guid,
        disk_index: fse.disk_id,
        partition_index: fse.partition_index,
        path_on_disk: [0; KERNEL_PATH_CAPACITY],
    };

    copy_terminated(&mut attr.path_on_disk, kernel.path.path_within_partition);
    attr
}

/// Allocates and fills the attribute array, freezing the memory map in
/// the process. This is the terminal service call: after it returns only
/// the jump remains.
fn build_attribute_array(ms: &mut MemoryServices, spec: &AttributeArraySpec<'_>) -> u64 {
    let mm_entry_size = core::mem::size_of::<MemoryMapEntry>();

    let cmdline_aligned_length = spec.cmdline.map_or(0, |c| {
        crate::mem::align_up(
            (core::mem::size_of::<AttributeHeader>() + c.len() + 1) as u64,
            8,
        ) as usize
    });

    let mut bytes_needed = core::mem::size_of::<BootContextHeader>();
    bytes_needed += core::mem::size_of::<PlatformInfoAttribute>();
    bytes_needed += core::mem::size_of::<KernelInfoAttribute>();
    bytes_needed += spec.modules.len() * core::mem::size_of::<ModuleInfoAttribute>();
    bytes_needed += cmdline_aligned_length;
    bytes_needed += spec.fb.map_or(0, |_| core::mem::size_of::<FramebufferAttribute>());
    bytes_needed += core::mem::size_of::<AttributeHeader>(); // memory map

    // Give some leeway for the map to grow after the next allocation
    let mut mm_entry_count = ms.release_resources(0, |_, _| {}) + 2;

    bytes_needed += mm_entry_count * mm_entry_size;
    let mut pages_needed = page_count(bytes_needed as u64);

    // The page-rounding slack is free memory map capacity
    mm_entry_count += ((pages_needed << PAGE_SHIFT) as usize - bytes_needed) / mm_entry_size;

    /*
     * Allocate the storage while keeping enough slack for the memory
     * map, which changes with every allocate/free.
     */
    let array_base = loop {
        let base = ms
            .allocate(&AllocationSpec {
                ceiling: spec.array_ceiling,
                pages: pages_needed,
                flags: AllocFlags::CRITICAL,
                ..Default::default()
            })
            .unwrap();

        let new_count = ms.release_resources(0, |_, _| {});

        if mm_entry_count < new_count {
            mm_entry_count += PAGE_SIZE as usize / mm_entry_size;
            ms.free_pages(base, pages_needed);
            pages_needed += 1;

            // The map grew by more than 170 entries after one allocation(??)
            assert!(mm_entry_count > new_count);
            continue;
        }

        mm_entry_count = new_count;
        break base;
    };

    let total_bytes = (pages_needed << PAGE_SHIFT) as usize;

    // SAFETY: just allocated, identity mapped.
    let buf =
        unsafe { core::slice::from_raw_parts_mut(array_base as *mut u8, total_bytes) };
    buf.fill(0);

    let mut cursor = 0usize;
    let mut attribute_count = 0u32;

    fn put(buf: &mut [u8], cursor: &mut usize, bytes: &[u8]) {
        buf[*cursor..*cursor + bytes.len()].copy_from_slice(bytes);
        *cursor += bytes.len();
    }

    // Context header; the attribute count is patched in at the end.
    put(
        buf,
        &mut cursor,
        bytemuck::bytes_of(&BootContextHeader {
            protocol_major: ULTRA_PROTOCOL_MAJOR,
            protocol_minor: ULTRA_PROTOCOL_MINOR,
            attribute_count: 0,
        }),
    );

    let mut platform_info = PlatformInfoAttribute {
        header: AttributeHeader {
            kind: ATTRIBUTE_PLATFORM_INFO,
            size_in_bytes: core::mem::size_of::<PlatformInfoAttribute>() as u32,
        },
        platform_type: spec.platform_type,
        loader_major: LOADER_MAJOR,
        loader_minor: LOADER_MINOR,
        loader_name: [0; 32],
        acpi_rsdp_address: spec.acpi_rsdp_address,
        dtb_address: spec.dtb_address,
        smbios_address: spec.smbios_address,
        higher_half_base: spec.direct_map_base,
        page_table_depth: u32::from(spec.page_table_depth),
        reserved: 0,
    };
    copy_terminated(&mut platform_info.loader_name, LOADER_NAME);
    put(buf, &mut cursor, bytemuck::bytes_of(&platform_info));
    attribute_count += 1;

    put(buf, &mut cursor, bytemuck::bytes_of(&spec.kernel_info));
    attribute_count += 1;

    for module in spec.modules {
        put(buf, &mut cursor, bytemuck::bytes_of(module));
        attribute_count += 1;
    }

    if let Some(cmdline) = spec.cmdline {
        let header = AttributeHeader {
            kind: ATTRIBUTE_COMMAND_LINE,
            size_in_bytes: cmdline_aligned_length as u32,
        };

        let start = cursor;
        put(buf, &mut cursor, bytemuck::bytes_of(&header));
        put(buf, &mut cursor, cmdline.as_bytes());
        cursor = start + cmdline_aligned_length;
        attribute_count += 1;
    }

    if let Some(fb) = spec.fb {
        let attr = FramebufferAttribute {
            header: AttributeHeader {
                kind: ATTRIBUTE_FRAMEBUFFER_INFO,
                size_in_bytes: core::mem::size_of::<FramebufferAttribute>() as u32,
            },
            fb,
        };
        put(buf, &mut cursor, bytemuck::bytes_of(&attr));
        attribute_count += 1;
    }

    // The memory map comes last; writing it releases the services.
    let mm_header_at = cursor;
    cursor += core::mem::size_of::<AttributeHeader>();
    let entries_at = cursor;

    let written = ms.release_resources(mm_entry_count, |i, entry| {
        let kind = if entry.kind == MemoryType::LOADER_RECLAIMABLE {
            MEMORY_TYPE_LOADER_RECLAIMABLE
        } else {
            debug_assert!(
                entry.kind <= MemoryType::NVS || entry.kind >= MemoryType::PROTO_SPECIFIC_BASE
            );
            entry.kind.0
        };

        let wire = MemoryMapEntry {
            physical_address: entry.physical_address,
            size_in_bytes: entry.size_in_bytes,
            kind,
        };

        let at = entries_at + i * mm_entry_size;
        buf[at..at + mm_entry_size].copy_from_slice(bytemuck::bytes_of(&wire));
    });

    assert!(written <= mm_entry_count, "memory map grew after the final allocation");

    let mm_header = AttributeHeader {
        kind: ATTRIBUTE_MEMORY_MAP,
        size_in_bytes: (core::mem::size_of::<AttributeHeader>() + written * mm_entry_size)
            as u32,
    };
    buf[mm_header_at..mm_header_at + 8].copy_from_slice(bytemuck::bytes_of(&mm_header));
    attribute_count += 1;

    // Patch the real attribute count into the context header.
    let final_header = BootContextHeader {
        protocol_major: ULTRA_PROTOCOL_MAJOR,
        protocol_minor: ULTRA_PROTOCOL_MINOR,
        attribute_count,
    };
    buf[..core::mem::size_of::<BootContextHeader>()]
        .copy_from_slice(bytemuck::bytes_of(&final_header));

    array_base
}

/// Everything needed for the final jump.
#[derive(Debug)]
pub struct Prepared {
    pub handover: HandoverInfo,
    pub page_table: PageTable,
}

/// Runs the whole boot sequence short of the jump itself.
pub fn prepare(
    services: &mut Services,
    fs_table: &FsTable,
    cfg: &Config<'_>,
    le: &LoadableEntry<'_>,
) -> Result<Prepared, BootError> {
    let arch = services.platform.arch();
    let mut hi = HandoverInfo::default();

    services.memory.declare_known_types(KNOWN_MM_TYPES);
    services
        .memory
        .fixup(FixupFlags::IF_DIRTY | FixupFlags::OVERLAP_RESOLVE);

    let mut kernel = load_kernel(services, fs_table, cfg, le, &mut hi)?;
    let (page_table, pt_depth) = build_page_table(services, cfg, le, &kernel, &mut hi)?;

    let higher_half_exclusive = hi.flags.contains(HandoverFlags::HIGHER_HALF_ONLY);
    let cmdline = get_cmdline(cfg, le)?;
    let binary_ceiling = arch.max_binary_address(hi.flags);

    let mut modules = Vec::new();
    if let Some(kernel_module) =
        load_kernel_as_module(&mut services.memory, cfg, le, &mut kernel, binary_ceiling)?
    {
        modules.push(kernel_module);
    }
    load_all_modules(
        &mut services.memory,
        fs_table,
        cfg,
        le,
        binary_ceiling,
        &mut modules,
    )?;

    // Module addresses are direct-map relative for kernels that never
    // see the identity mapping.
    if higher_half_exclusive {
        for module in &mut modules {
            module.address += hi.direct_map_base;
        }
    }

    hi.stack = allocate_stack(&mut services.memory, cfg, le, binary_ceiling)?;

    let acpi_rsdp_address = services.platform.find_rsdp().unwrap_or(0);
    let dtb_address = services.platform.find_dtb().unwrap_or(0);
    let smbios_address = services.platform.find_smbios().unwrap_or(0);

    /*
     * Attempt to set the video mode last, as legacy tty logging is gone
     * once it succeeds.
     */
    let fb = set_video_mode(services, cfg, le)?;

    let platform_type = match services.platform.provider() {
        ServiceProvider::Bios => PLATFORM_BIOS,
        ServiceProvider::Uefi => PLATFORM_UEFI,
    };

    services.platform.cleanup();
    handover::prepare_for(&hi);

    let spec = AttributeArraySpec {
        platform_type,
        acpi_rsdp_address,
        dtb_address,
        smbios_address,
        direct_map_base: hi.direct_map_base,
        page_table_depth: pt_depth,
        kernel_info: kernel_info_attribute(&kernel),
        modules: &modules,
        cmdline,
        fb,
        array_ceiling: binary_ceiling,
    };

    /*
     * This also acquires the memory map, so no services can be used
     * after this call.
     */
    let mut attr_array_address = build_attribute_array(&mut services.memory, &spec);

    if kernel.is_higher_half {
        hi.stack += hi.direct_map_base;
        attr_array_address += hi.direct_map_base;
    }

    hi.pt_root = page_table.root();
    hi.arg0 = attr_array_address;
    hi.arg1 = u64::from(ULTRA_MAGIC);

    log::info!(
        target: "ultra",
        "jumping to kernel: entry {:#018X}, stack at {:#018X}, boot context at {:#018X}",
        hi.entrypoint, hi.stack, attr_array_address
    );

    Ok(Prepared {
        handover: hi,
        page_table,
    })
}

/// The irrevocable jump.
///
/// # Safety
///
/// `prepared` must come from a successful [`prepare`] on this machine.
#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
pub unsafe fn execute(prepared: &Prepared) -> ! {
    // SAFETY: guaranteed by the caller.
    unsafe { crate::handover::x86::kernel_handover(&prepared.handover) }
}

/// The irrevocable jump.
///
/// # Safety
///
/// `prepared` must come from a successful [`prepare`] on this machine.
#[cfg(target_arch = "aarch64")]
pub unsafe fn execute(prepared: &Prepared) -> ! {
    let hi = &prepared.handover;
    let ttbr0 = prepared.page_table.root_entry_address_at(0);
    let ttbr1 = prepared.page_table.root_entry_address_at(hi.direct_map_base);

    // 48-bit intermediate physical address size.
    let ips_bits = 0b0101u64 << 32;

    // SAFETY: guaranteed by the caller.
    unsafe { crate::handover::aarch64::kernel_handover(hi, ttbr0, ttbr1, ips_bits) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::VideoError;

    struct FakeVideo {
        modes: Vec<VideoMode>,
        native: Option<Resolution>,
    }

    impl VideoServices for FakeVideo {
        fn mode_count(&self) -> usize {
            self.modes.len()
        }

        fn query_mode(&self, idx: usize) -> Option<VideoMode> {
            self.modes.get(idx).copied()
        }

        fn query_native_resolution(&self) -> Option<Resolution> {
            self.native
        }

        fn set_mode(&mut self, _id: u32) -> Result<Framebuffer, VideoError> {
            Err(VideoError::ModeSetFailure)
        }
    }

    fn mode(width: u32, height: u32, bpp: u16, id: u32) -> VideoMode {
        VideoMode {
            width,
            height,
            bpp,
            format: crate::video::FB_FORMAT_XRGB8888,
            id,
        }
    }

    #[test]
    fn at_least_picks_largest_below_native() {
        let video = FakeVideo {
            modes: alloc::vec![
                mode(1600, 1200, 32, 1),
                mode(1280, 1024, 32, 2),
                mode(1024, 768, 32, 3),
            ],
            native: Some(Resolution {
                width: 1920,
                height: 1200,
            }),
        };

        let rm = RequestedVideoMode::default(); // 1024x768x32 at-least
        let picked = pick_video_mode(&video, &rm).unwrap();
        assert_eq!((picked.width, picked.height), (1600, 1200));
    }

    #[test]
    fn at_least_respects_native_ceiling() {
        let video = FakeVideo {
            modes: alloc::vec![
                mode(1600, 1200, 32, 1),
                mode(1280, 1024, 32, 2),
                mode(1024, 768, 32, 3),
            ],
            native: Some(Resolution {
                width: 1280,
                height: 1024,
            }),
        };

        let rm = RequestedVideoMode::default();
        let picked = pick_video_mode(&video, &rm).unwrap();
        assert_eq!((picked.width, picked.height), (1280, 1024));
    }

    #[test]
    fn exactly_needs_perfect_match() {
        let video = FakeVideo {
            modes: alloc::vec![mode(1280, 1024, 32, 2), mode(1024, 768, 32, 3)],
            native: Some(Resolution {
                width: 1920,
                height: 1080,
            }),
        };

        let rm = RequestedVideoMode {
            constraint: VideoModeConstraint::Exactly,
            ..Default::default()
        };
        let picked = pick_video_mode(&video, &rm).unwrap();
        assert_eq!((picked.width, picked.height), (1024, 768));

        let rm = RequestedVideoMode {
            width: 800,
            height: 600,
            constraint: VideoModeConstraint::Exactly,
            ..Default::default()
        };
        assert!(pick_video_mode(&video, &rm).is_none());
    }

    #[test]
    fn mode_too_small_is_rejected() {
        let video = FakeVideo {
            modes: alloc::vec![mode(800, 600, 32, 1)],
            native: Some(Resolution {
                width: 1920,
                height: 1080,
            }),
        };

        let rm = RequestedVideoMode::default();
        assert!(pick_video_mode(&video, &rm).is_none());
    }

    #[test]
    fn format_filter_applies() {
        let mut m = mode(1280, 1024, 32, 1);
        m.format = crate::video::FB_FORMAT_BGR888;

        let video = FakeVideo {
            modes: alloc::vec![m],
            native: Some(Resolution {
                width: 1920,
                height: 1080,
            }),
        };

        let mut rm = RequestedVideoMode::default();
        rm.format = crate::video::FB_FORMAT_XRGB8888;
        assert!(pick_video_mode(&video, &rm).is_none());

        rm.format = FB_FORMAT_INVALID; // auto
        assert!(pick_video_mode(&video, &rm).is_some());
    }
}

//! Arch-neutral page table construction.
//!
//! One [`PageTable`] shape covers every supported layout by varying the
//! number of levels, the per-table index width and the entry width; the
//! arch layer fills those in (see [`crate::arch`]). Table pages are
//! allocated out of the memory map below `max_table_address` and written
//! through the identity mapping the loader runs under.

use crate::mem::{is_aligned, MemoryServices, GB, PAGE_SHIFT, PAGE_SIZE};

/// Per-arch slot accessors and terminal-entry attribute bits.
#[derive(Debug, Clone, Copy)]
pub struct PageTableOps {
    pub write_slot: fn(*mut u8, u64),
    pub read_slot: fn(*const u8) -> u64,

    /// Attribute bits for a present, writable intermediate table entry.
    pub table_attributes: u64,

    /// Attribute bits for a terminal 4K mapping.
    pub normal_attributes: u64,

    /// Attribute bits for a terminal huge mapping.
    pub huge_attributes: u64,

    pub is_huge: fn(u64) -> bool,

    /// Index width of the level at `idx`, when it differs from the
    /// uniform `table_width_shift` (the AArch64 synthetic root).
    pub width_shift_for_level: Option<fn(levels: u8, idx: usize) -> Option<u8>>,
}

pub fn write_slot_u64(slot: *mut u8, value: u64) {
    // SAFETY: the caller hands us a slot inside a loader-owned table page.
    unsafe { (slot as *mut u64).write(value) }
}

pub fn read_slot_u64(slot: *const u8) -> u64 {
    // SAFETY: same as above.
    unsafe { (slot as *const u64).read() }
}

pub fn write_slot_u32(slot: *mut u8, value: u64) {
    // SAFETY: same as above.
    unsafe { (slot as *mut u32).write(value as u32) }
}

pub fn read_slot_u32_zero_extend(slot: *const u8) -> u64 {
    // SAFETY: same as above.
    unsafe { u64::from((slot as *const u32).read()) }
}

/// Allocates and zeroes one table page below `max_address` (the arch
/// layer picks the ceiling; zero means the 4 GiB default).
pub fn get_table_page(ms: &mut MemoryServices, max_address: u64) -> Option<u64> {
    let mut ceiling = max_address;
    if ceiling == 0 {
        ceiling = 4 * GB;
    }

    let page = ms.allocate_pages(1, ceiling, crate::mem::MemoryType::LOADER_RECLAIMABLE)?;

    // SAFETY: the page was just allocated for us and is identity mapped.
    unsafe { core::ptr::write_bytes(page as *mut u8, 0, PAGE_SIZE as usize) };
    Some(page)
}

#[derive(Debug)]
pub struct PageTable {
    root: u64,
    levels: u8,
    base_shift: u8,
    table_width_shift: u8,
    entry_width: u8,
    entry_address_mask: u64,
    max_table_address: u64,
    ops: PageTableOps,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageType {
    /// 4K pages
    Normal,

    /// 2/4M pages
    Huge,
}

/// One `map_pages` request.
#[derive(Debug, Clone, Copy)]
pub struct MappingSpec {
    pub virtual_base: u64,
    pub physical_base: u64,
    pub count: u64,
    pub kind: PageType,

    /// If set, running out of memory mid-mapping panics instead of
    /// returning `false`.
    pub critical: bool,
}

impl PageTable {
    /// Builds a table with a freshly allocated root. Called by the arch
    /// layer only; everything else goes through [`crate::arch`].
    pub fn with_layout(
        ms: &mut MemoryServices,
        levels: u8,
        table_width_shift: u8,
        entry_width: u8,
        entry_address_mask: u64,
        max_table_address: u64,
        ops: PageTableOps,
    ) -> Option<Self> {
        let root = get_table_page(ms, max_table_address)?;

        Some(Self {
            root,
            levels,
            base_shift: PAGE_SHIFT as u8,
            table_width_shift,
            entry_width,
            entry_address_mask,
            max_table_address,
            ops,
        })
    }

    pub fn root(&self) -> u64 {
        self.root
    }

    pub fn levels(&self) -> u8 {
        self.levels
    }

    pub fn max_table_address(&self) -> u64 {
        self.max_table_address
    }

    pub fn page_size(&self) -> u64 {
        1 << self.base_shift
    }

    pub fn huge_page_shift(&self) -> u32 {
        u32::from(self.base_shift) + u32::from(self.table_width_shift)
    }

    pub fn huge_page_size(&self) -> u64 {
        1 << self.huge_page_shift()
    }

    pub fn huge_page_round_up(&self, value: u64) -> u64 {
        crate::mem::align_up(value, self.huge_page_size())
    }

    pub fn huge_page_round_down(&self, value: u64) -> u64 {
        crate::mem::align_down(value, self.huge_page_size())
    }

    /// Amount of virtual memory covered by one entry of the level at
    /// `lvl_idx`, e.g. 512 GiB for an AMD64 PML4 entry (`lvl_idx = 3`).
    pub fn level_entry_virtual_coverage(&self, lvl_idx: usize) -> u64 {
        1u64 << self.level_bit_offset(lvl_idx)
    }

    fn level_bit_offset(&self, idx: usize) -> u32 {
        u32::from(self.base_shift) + u32::from(self.table_width_shift) * idx as u32
    }

    fn width_shift_for_level(&self, idx: usize) -> u8 {
        if let Some(get) = self.ops.width_shift_for_level {
            if let Some(shift) = get(self.levels, idx) {
                return shift;
            }
        }

        self.table_width_shift
    }

    fn level_index(&self, virtual_address: u64, level: usize) -> usize {
        let width_mask = (1usize << self.width_shift_for_level(level)) - 1;
        let selector = virtual_address >> self.level_bit_offset(level);

        selector as usize & width_mask
    }

    fn slot_at(&self, table: *mut u8, idx: usize) -> *mut u8 {
        // SAFETY: idx is masked to the table width, so this stays within
        // the table page.
        unsafe { table.add(idx * usize::from(self.entry_width)) }
    }

    /// Descends one level through `table[idx]`, lazily allocating a zeroed
    /// table page for an absent entry.
    fn table_at(&self, ms: &mut MemoryServices, table: *mut u8, idx: usize) -> Option<*mut u8> {
        let slot = self.slot_at(table, idx);
        let entry = (self.ops.read_slot)(slot);

        // Present bit is bit 0 across every supported layout.
        if entry & 1 != 0 {
            assert!(!(self.ops.is_huge)(entry), "remapping over a huge page");
            return Some((entry & self.entry_address_mask) as *mut u8);
        }

        let page = get_table_page(ms, self.max_table_address)?;
        (self.ops.write_slot)(slot, page | self.ops.table_attributes);
        Some(page as *mut u8)
    }

    /// Returns the table containing the slots of `want_level` for
    /// `virtual_base`, walking (and lazily populating) the levels above it.
    fn table_for_level(
        &self,
        ms: &mut MemoryServices,
        virtual_base: u64,
        want_level: usize,
    ) -> Option<*mut u8> {
        let mut table = self.root as *mut u8;

        if want_level == usize::from(self.levels) {
            return Some(table);
        }

        let mut level = usize::from(self.levels) - 1;

        loop {
            let idx = self.level_index(virtual_base, level);
            table = self.table_at(ms, table, idx)?;

            if level == want_level {
                return Some(table);
            }

            level -= 1;
        }
    }

    /// Fills as many contiguous terminal entries as share one parent table.
    fn bulk_map(&mut self, ms: &mut MemoryServices, ctx: &mut BulkMapCtx) -> bool {
        let this_level = 1 + usize::from(ctx.huge);
        let bytes_per_page = if ctx.huge {
            self.huge_page_size()
        } else {
            self.page_size()
        };

        assert!(is_aligned(ctx.virtual_base, bytes_per_page));
        assert!(is_aligned(ctx.physical_base, bytes_per_page));

        let Some(table) = self.table_for_level(ms, ctx.virtual_base, this_level) else {
            return false;
        };

        let slot_idx = self.level_index(ctx.virtual_base, this_level - 1);
        let mut slot = self.slot_at(table, slot_idx);

        let slots_left = (1usize << self.table_width_shift) - slot_idx;
        let pages_to_map = ctx.page_count.min(slots_left as u64);
        ctx.page_count -= pages_to_map;

        let bytes_mapped = pages_to_map * bytes_per_page;
        let mut entry = ctx.physical_base | ctx.page_attributes;
        ctx.virtual_base += bytes_mapped;
        ctx.physical_base += bytes_mapped;

        for _ in 0..pages_to_map {
            (self.ops.write_slot)(slot, entry);
            // SAFETY: bounded by slots_left, so we stay within the table.
            slot = unsafe { slot.add(usize::from(self.entry_width)) };
            entry += bytes_per_page;
        }

        true
    }

    /// Maps `spec.count` pages of `spec.kind`, allocating intermediate
    /// tables on demand. Returns `false` on out-of-memory unless the
    /// mapping is critical, in which case it panics.
    pub fn map_pages(&mut self, ms: &mut MemoryServices, spec: &MappingSpec) -> bool {
        let mut ctx = BulkMapCtx {
            virtual_base: spec.virtual_base,
            physical_base: spec.physical_base,
            page_count: spec.count,
            page_attributes: match spec.kind {
                PageType::Normal => self.ops.normal_attributes,
                PageType::Huge => self.ops.huge_attributes,
            },
            huge: spec.kind == PageType::Huge,
        };

        while ctx.page_count != 0 {
            if !self.bulk_map(ms, &mut ctx) {
                if !spec.critical {
                    return false;
                }

                panic!(
                    "out of memory while mapping {} pages at {:#018X} to phys {:#018X} (huge: {})",
                    spec.count, spec.virtual_base, spec.physical_base, ctx.huge
                );
            }
        }

        true
    }

    /// Copies the root table entry covering `src_virtual_address` into the
    /// slot covering `dest_virtual_address`.
    pub fn copy_root_entry(&mut self, src_virtual_address: u64, dest_virtual_address: u64) {
        let top = usize::from(self.levels) - 1;
        let src_idx = self.level_index(src_virtual_address, top);
        let dst_idx = self.level_index(dest_virtual_address, top);

        let root = self.root as *mut u8;
        let entry = (self.ops.read_slot)(self.slot_at(root, src_idx));
        (self.ops.write_slot)(self.slot_at(root, dst_idx), entry);
    }

    /// Writes a raw root table entry. Used by arch init code that must
    /// pre-populate root slots (32-bit PAE).
    pub(crate) fn write_root_slot(&mut self, idx: usize, value: u64) {
        let root = self.root as *mut u8;
        (self.ops.write_slot)(self.slot_at(root, idx), value);
    }

    /// Physical address stored in the root entry covering
    /// `virtual_address`, masked to the table address bits.
    pub fn root_entry_address_at(&self, virtual_address: u64) -> u64 {
        let top = usize::from(self.levels) - 1;
        let idx = self.level_index(virtual_address, top);
        let root = self.root as *mut u8;

        (self.ops.read_slot)(self.slot_at(root, idx)) & self.entry_address_mask
    }
}

struct BulkMapCtx {
    virtual_base: u64,
    physical_base: u64,
    page_count: u64,
    page_attributes: u64,
    huge: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::{self, PtType};
    use crate::mem::testutil::Arena;

    /// Software page walk mirroring the hardware translation.
    fn translate(pt: &PageTable, va: u64) -> Option<u64> {
        let mut level = usize::from(pt.levels);
        let mut table = pt.root as *mut u8;

        loop {
            level -= 1;
            let idx = pt.level_index(va, level);
            let entry = (pt.ops.read_slot)(pt.slot_at(table, idx));

            if entry & 1 == 0 {
                return None;
            }

            let page_bits = pt.level_bit_offset(level);

            if level == 0 || (pt.ops.is_huge)(entry) {
                let base = entry & pt.entry_address_mask;
                return Some(base + (va & ((1u64 << page_bits) - 1)));
            }

            table = (entry & pt.entry_address_mask) as *mut u8;
        }
    }

    fn build(ms: &mut MemoryServices, ty: PtType) -> PageTable {
        // The test arena lives at host heap addresses, so table pages
        // must be allocatable anywhere.
        arch::page_table_init(ms, ty, u64::MAX).expect("failed to build page table root")
    }

    #[test]
    fn amd64_small_mapping_translates() {
        let (arena, mut ms) = Arena::new(64);
        let mut pt = build(&mut ms, PtType::Amd64FourLevel);

        let phys = arena.base() + 0x5000;
        assert!(pt.map_pages(
            &mut ms,
            &MappingSpec {
                virtual_base: 0xFFFF_FFFF_8000_0000,
                physical_base: phys,
                count: 4,
                kind: PageType::Normal,
                critical: false,
            }
        ));

        assert_eq!(translate(&pt, 0xFFFF_FFFF_8000_0000), Some(phys));
        assert_eq!(
            translate(&pt, 0xFFFF_FFFF_8000_3FFF),
            Some(phys + 0x3FFF)
        );
        assert_eq!(translate(&pt, 0xFFFF_FFFF_8000_4000), None);
    }

    #[test]
    fn amd64_huge_mapping_translates() {
        let (arena, mut ms) = Arena::new(64);
        let mut pt = build(&mut ms, PtType::Amd64FourLevel);

        // Self-referential identity-style mapping of the arena base.
        let phys = 0x4000_0000u64; // 1 GiB, 2M aligned
        let _ = arena;

        assert!(pt.map_pages(
            &mut ms,
            &MappingSpec {
                virtual_base: 0x4000_0000,
                physical_base: phys,
                count: 3,
                kind: PageType::Huge,
                critical: false,
            }
        ));

        assert_eq!(translate(&pt, 0x4000_0000), Some(phys));
        assert_eq!(translate(&pt, 0x4020_0123), Some(phys + 0x20_0123));
        assert_eq!(translate(&pt, 0x4060_0000), None);
    }

    #[test]
    fn bulk_fill_crosses_parent_tables() {
        let (arena, mut ms) = Arena::new(128);
        let mut pt = build(&mut ms, PtType::Amd64FourLevel);
        let _ = arena;

        // 1024 pages straddle multiple 512-entry page tables.
        assert!(pt.map_pages(
            &mut ms,
            &MappingSpec {
                virtual_base: 0x40_0000,
                physical_base: 0x80_0000,
                count: 1024,
                kind: PageType::Normal,
                critical: false,
            }
        ));

        assert_eq!(translate(&pt, 0x40_0000), Some(0x80_0000));
        assert_eq!(
            translate(&pt, 0x40_0000 + 1023 * 4096),
            Some(0x80_0000 + 1023 * 4096)
        );
    }

    #[test]
    fn i386_no_pae_layout() {
        let (arena, mut ms) = Arena::new(32);
        let mut pt = build(&mut ms, PtType::I386NoPae);
        let _ = arena;

        assert_eq!(pt.levels(), 2);
        assert_eq!(pt.huge_page_size(), 4 * 1024 * 1024);

        assert!(pt.map_pages(
            &mut ms,
            &MappingSpec {
                virtual_base: 0xC000_0000,
                physical_base: 0x0010_0000,
                count: 16,
                kind: PageType::Normal,
                critical: false,
            }
        ));

        assert_eq!(translate(&pt, 0xC000_0000), Some(0x0010_0000));
        assert_eq!(translate(&pt, 0xC000_F234), Some(0x0010_F234));
    }

    #[test]
    fn aarch64_synthetic_root_separates_halves() {
        let (arena, mut ms) = Arena::new(64);
        let mut pt = build(&mut ms, PtType::AArch64Granule4K48);
        let _ = arena;

        assert_eq!(pt.levels(), 5); // 4 real + 1 synthetic TTBR level

        assert!(pt.map_pages(
            &mut ms,
            &MappingSpec {
                virtual_base: 0xFFFF_0000_0000_0000,
                physical_base: 0x20_0000,
                count: 1,
                kind: PageType::Normal,
                critical: false,
            }
        ));
        assert!(pt.map_pages(
            &mut ms,
            &MappingSpec {
                virtual_base: 0,
                physical_base: 0x30_0000,
                count: 1,
                kind: PageType::Normal,
                critical: false,
            }
        ));

        assert_eq!(translate(&pt, 0xFFFF_0000_0000_0000), Some(0x20_0000));
        assert_eq!(translate(&pt, 0), Some(0x30_0000));

        // The synthetic root has exactly two entries in use; TTBR0/TTBR1
        // are readable through the root entry accessor.
        assert_ne!(pt.root_entry_address_at(0), 0);
        assert_ne!(pt.root_entry_address_at(0xFFFF_0000_0000_0000), 0);
        assert_ne!(
            pt.root_entry_address_at(0),
            pt.root_entry_address_at(0xFFFF_0000_0000_0000)
        );
    }

    #[test]
    fn copy_root_entry_steals_identity() {
        let (arena, mut ms) = Arena::new(64);
        let mut pt = build(&mut ms, PtType::Amd64FourLevel);
        let _ = arena;

        assert!(pt.map_pages(
            &mut ms,
            &MappingSpec {
                virtual_base: 0xFFFF_8000_0000_0000,
                physical_base: 0x20_0000,
                count: 1,
                kind: PageType::Normal,
                critical: false,
            }
        ));

        // The lower half sees the higher half's mapping through the copied
        // root entry.
        pt.copy_root_entry(0xFFFF_8000_0000_0000, 0);
        assert_eq!(translate(&pt, 0), Some(0x20_0000));
    }
}

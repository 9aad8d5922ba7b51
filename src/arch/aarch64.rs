//! AArch64 page table layouts.
//!
//! We pretend TTBR0 and TTBR1 are entries inside an extra page table level
//! for simplicity, to make the walk identical to x86. The jump stub pulls
//! the two real roots back out of the synthetic level right before the
//! handover.

use crate::arch::PtType;
use crate::mem::MemoryServices;
use crate::vm::{self, PageTable, PageTableOps};

pub const PAGE_PRESENT: u64 = 1 << 0;

pub const BLOCK_OR_PAGE_DESCRIPTOR: u64 = 0 << 1;
pub const TABLE_DESCRIPTOR: u64 = 1 << 1;
pub const ACCESS_FLAG: u64 = 1 << 10;

/// The synthetic "lookup level -1" used by the 52-bit layout only covers
/// virtual address bits 48..52.
const LOOKUP_LEVEL_MINUS_1: usize = 4;
const LOOKUP_LEVEL_MINUS_1_WIDTH_SHIFT: u8 = 4;

fn is_huge(entry: u64) -> bool {
    entry & TABLE_DESCRIPTOR == 0
}

fn unified_depth(ty: PtType) -> u8 {
    ty.depth() + 1
}

fn width_shift_for_level(levels: u8, idx: usize) -> Option<u8> {
    if levels == unified_depth(PtType::AArch64Granule4K52) && idx == LOOKUP_LEVEL_MINUS_1 {
        return Some(LOOKUP_LEVEL_MINUS_1_WIDTH_SHIFT);
    }

    None
}

pub fn page_table_init(
    ms: &mut MemoryServices,
    ty: PtType,
    max_table_address: u64,
) -> Option<PageTable> {
    assert!(matches!(
        ty,
        PtType::AArch64Granule4K48 | PtType::AArch64Granule4K52
    ));

    // We don't support 52-bit output addresses, so mask to 48 bits.
    let entry_address_mask = ((1u64 << 48) - 1) & !0xFFF;

    let ops = PageTableOps {
        write_slot: vm::write_slot_u64,
        read_slot: vm::read_slot_u64,
        table_attributes: PAGE_PRESENT | TABLE_DESCRIPTOR | ACCESS_FLAG,
        normal_attributes: PAGE_PRESENT | TABLE_DESCRIPTOR | ACCESS_FLAG,
        huge_attributes: PAGE_PRESENT | BLOCK_OR_PAGE_DESCRIPTOR | ACCESS_FLAG,
        is_huge,
        width_shift_for_level: Some(width_shift_for_level),
    };

    PageTable::with_layout(
        ms,
        unified_depth(ty),
        9,
        8,
        entry_address_mask,
        max_table_address,
        ops,
    )
}

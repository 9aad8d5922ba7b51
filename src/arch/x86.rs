//! x86 page table layouts.

use crate::arch::PtType;
use crate::mem::MemoryServices;
use crate::vm::{self, PageTable, PageTableOps};

pub const PAGE_PRESENT: u64 = 1 << 0;
pub const PAGE_READWRITE: u64 = 1 << 1;
pub const PAGE_HUGE: u64 = 1 << 7;

fn is_huge(entry: u64) -> bool {
    entry & PAGE_HUGE == PAGE_HUGE
}

fn ops(entry_width: u8) -> PageTableOps {
    let (write_slot, read_slot) = if entry_width == 8 {
        (
            vm::write_slot_u64 as fn(*mut u8, u64),
            vm::read_slot_u64 as fn(*const u8) -> u64,
        )
    } else {
        (
            vm::write_slot_u32 as fn(*mut u8, u64),
            vm::read_slot_u32_zero_extend as fn(*const u8) -> u64,
        )
    };

    PageTableOps {
        write_slot,
        read_slot,
        table_attributes: PAGE_PRESENT | PAGE_READWRITE,
        normal_attributes: PAGE_PRESENT | PAGE_READWRITE,
        huge_attributes: PAGE_PRESENT | PAGE_READWRITE | PAGE_HUGE,
        is_huge,
        width_shift_for_level: None,
    }
}

pub fn page_table_init(
    ms: &mut MemoryServices,
    ty: PtType,
    max_table_address: u64,
) -> Option<PageTable> {
    let (table_width_shift, entry_width) = match ty {
        PtType::I386NoPae => (10u8, 4u8),
        PtType::I386Pae | PtType::Amd64FourLevel | PtType::Amd64FiveLevel => (9, 8),
        _ => unreachable!("not an x86 layout"),
    };

    // 52 is the maximum supported number of physical bits
    let entry_address_mask = ((1u64 << 52) - 1) & !0xFFF;

    let mut pt = PageTable::with_layout(
        ms,
        ty.depth(),
        table_width_shift,
        entry_width,
        entry_address_mask,
        max_table_address,
        ops(entry_width),
    )?;

    /*
     * 32-bit PAE paging is strange in that the root table consists of only
     * four pointers with shadow-register semantics: they are cached on CR3
     * load and their WRITE bit is reserved. Lazy allocation of those slots
     * would therefore go unnoticed by the CPU, so pre-populate all four
     * right away with only the PRESENT bit set.
     */
    if ty == PtType::I386Pae {
        for i in 0..4u64 {
            let page = vm::get_table_page(ms, pt.max_table_address())?;
            pt.write_root_slot(i as usize, page | PAGE_PRESENT);
        }
    }

    Some(pt)
}

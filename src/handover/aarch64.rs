//! Final AArch64 register loads and the jump into the kernel.
//!
//! TTBR0/TTBR1 come out of the synthetic root level of the unified page
//! table (see [`crate::arch::aarch64`]), so the jump path never needs to
//! know that the table was built x86-style.

use crate::handover::{HandoverFlags, HandoverInfo};

const TCR_DS: u64 = 1 << 59;
const TCR_TG1_4K_GRANULE: u64 = 0b10 << 30;
const TCR_TG0_4K_GRANULE: u64 = 0b00 << 14;
const TCR_SH1_SHIFT: u32 = 28;
const TCR_ORGN1_SHIFT: u32 = 26;
const TCR_IRGN1_SHIFT: u32 = 24;
const TCR_SH0_SHIFT: u32 = 12;
const TCR_ORGN0_SHIFT: u32 = 10;
const TCR_IRGN0_SHIFT: u32 = 8;
const TCR_T1SZ_SHIFT: u32 = 16;
const TCR_T0SZ_SHIFT: u32 = 0;

const NORMAL_NON_CACHEABLE: u64 = 0b00;
const OUTER_SHAREABLE: u64 = 0b10;

const MAIR_NON_CACHEABLE: u64 = 0b0100;

/// Translation control for both halves: 4K granules, non-cacheable
/// normal memory, input address size per the negotiated flags.
pub fn build_tcr(flags: HandoverFlags, ips_bits: u64) -> u64 {
    let mut tcr = ips_bits;

    let tsz: u64 = if flags.contains(HandoverFlags::AARCH64_52_BIT_IA) {
        // DS gives us 52-bit input addresses; we do not use the split
        // output-address PTE format that comes with it.
        tcr |= TCR_DS;
        64 - 52
    } else {
        64 - 48
    };

    tcr |= NORMAL_NON_CACHEABLE << TCR_IRGN0_SHIFT;
    tcr |= NORMAL_NON_CACHEABLE << TCR_ORGN0_SHIFT;
    tcr |= OUTER_SHAREABLE << TCR_SH0_SHIFT;
    tcr |= TCR_TG0_4K_GRANULE;
    tcr |= tsz << TCR_T0SZ_SHIFT;

    tcr |= NORMAL_NON_CACHEABLE << TCR_IRGN1_SHIFT;
    tcr |= NORMAL_NON_CACHEABLE << TCR_ORGN1_SHIFT;
    tcr |= OUTER_SHAREABLE << TCR_SH1_SHIFT;
    tcr |= TCR_TG1_4K_GRANULE;
    tcr |= tsz << TCR_T1SZ_SHIFT;

    tcr
}

pub fn build_mair() -> u64 {
    MAIR_NON_CACHEABLE
}

/// Loads MAIR/TCR/TTBR0/TTBR1/SCTLR and jumps. The memory map is frozen
/// by the time this is called; nothing here may allocate or log.
///
/// # Safety
///
/// `hi` must describe a fully built address space; `ttbr0`/`ttbr1` must be
/// the two halves' root tables taken from the synthetic level.
pub unsafe fn kernel_handover(hi: &HandoverInfo, ttbr0: u64, ttbr1: u64, ips_bits: u64) -> ! {
    let tcr = build_tcr(hi.flags, ips_bits);
    let mair = build_mair();

    // SAFETY: guaranteed by the caller; this does not return.
    unsafe {
        core::arch::asm!(
            "msr daifset, #0xf",
            "msr mair_el1, {mair}",
            "msr tcr_el1, {tcr}",
            "msr ttbr0_el1, {ttbr0}",
            "msr ttbr1_el1, {ttbr1}",
            "isb",
            "mrs {tmp}, sctlr_el1",
            "orr {tmp}, {tmp}, #1",
            "msr sctlr_el1, {tmp}",
            "isb",
            "mov sp, {stack}",
            "br {entry}",
            mair = in(reg) mair,
            tcr = in(reg) tcr,
            ttbr0 = in(reg) ttbr0,
            ttbr1 = in(reg) ttbr1,
            tmp = out(reg) _,
            stack = in(reg) hi.stack,
            entry = in(reg) hi.entrypoint,
            in("x0") hi.arg0,
            in("x1") hi.arg1,
            options(noreturn)
        )
    }
}

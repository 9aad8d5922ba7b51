//! The terminal state handed to the kernel, and the flags describing it.
//!
//! The memory-map freeze happens immediately before the jump; no service
//! call is permitted after that point. The actual register loads live in
//! the arch-specific submodules and only build for their targets.

use bitflags::bitflags;

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
pub mod x86;

#[cfg(target_arch = "aarch64")]
pub mod aarch64;

bitflags! {
    /// Expected machine state at the moment `entrypoint` is invoked.
    ///
    /// Bit 0 is arch-neutral; bits 27..32 are arch-specific and only
    /// meaningful for the architecture that owns them.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct HandoverFlags: u32 {
        /// Unmap the lower-half identity mapping before the jump; only
        /// valid for higher-half kernels.
        const HIGHER_HALF_ONLY = 1 << 0;

        /// AArch64: 57-bit input addresses with a 4K granule.
        const AARCH64_52_BIT_IA = 1 << 27;

        /// x86: long mode enable.
        const X86_LME = 1 << 28;

        /// x86: page size extension.
        const X86_PSE = 1 << 29;

        /// x86: physical address extension.
        const X86_PAE = 1 << 30;

        /// x86: 57-bit linear addresses (5-level paging).
        const X86_LA57 = 1 << 31;
    }
}

/// Generic handover info structure.
///
/// The page table is expected to contain at least two mappings, both
/// linearly mapping physical ram from address zero: one at `0` and one at
/// `direct_map_base`, each covering at least the arch minimum map length.
#[derive(Debug, Clone, Copy, Default)]
pub struct HandoverInfo {
    /// Address of the kernel binary entry, possibly higher half.
    pub entrypoint: u64,

    /// Address of the top of the kernel stack, possibly higher half.
    pub stack: u64,

    /// Physical address of the root page table page.
    pub pt_root: u64,

    /// Arguments to pass to the kernel entrypoint.
    pub arg0: u64,
    pub arg1: u64,

    /// Base address in the higher half that direct maps physical memory.
    pub direct_map_base: u64,

    pub flags: HandoverFlags,
}

/// The set of handover flags this machine can actually satisfy, as
/// detected by the firmware glue (CPUID on x86, `ID_AA64MMFR*` on AArch64).
#[derive(Debug, Clone, Copy)]
pub struct FlagSupport {
    supported: HandoverFlags,
}

impl FlagSupport {
    pub fn new(supported: HandoverFlags) -> Self {
        Self {
            supported: supported | HandoverFlags::HIGHER_HALF_ONLY,
        }
    }

    /// A baseline x86 machine: everything but 5-level paging.
    pub fn x86_baseline() -> Self {
        Self::new(HandoverFlags::X86_LME | HandoverFlags::X86_PSE | HandoverFlags::X86_PAE)
    }

    /// A baseline AArch64 machine: 48-bit input addresses only.
    pub fn aarch64_baseline() -> Self {
        Self::new(HandoverFlags::empty())
    }

    pub fn is_supported(&self, flag: HandoverFlags) -> bool {
        self.supported.contains(flag)
    }

    /// Every requested flag must be supported; anything else is a bug in
    /// flag derivation, not a user error.
    pub fn ensure_supported(&self, flags: HandoverFlags) {
        assert!(
            self.supported.contains(flags),
            "unsupported handover flags requested: {:?}",
            flags.difference(self.supported)
        );
    }
}

/// Last chance to touch the machine while services are still online.
pub fn prepare_for(_hi: &HandoverInfo) {}

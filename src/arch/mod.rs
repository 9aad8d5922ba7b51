//! Architecture-specific page table layouts and address-space policy.
//!
//! The page table builder in [`crate::vm`] is arch-neutral; this module
//! supplies the per-layout parameters and the boot-protocol policy
//! (higher-half bases, direct-map bases, binary ceilings, constraint
//! resolution). Policy is data-driven off [`Arch`] rather than compile
//! time, so every layout stays testable from one host build.

pub mod aarch64;
pub mod x86;

use crate::handover::{FlagSupport, HandoverFlags};
use crate::mem::{MemoryServices, GB, MB};
use crate::vm::PageTable;

/// Page table layout selector. The numeric depth of each layout is what
/// the kernel sees as `page_table_depth`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PtType {
    I386NoPae,
    I386Pae,
    Amd64FourLevel,
    Amd64FiveLevel,
    AArch64Granule4K48,
    AArch64Granule4K52,
}

impl PtType {
    pub fn depth(self) -> u8 {
        match self {
            PtType::I386NoPae => 2,
            PtType::I386Pae => 3,
            PtType::Amd64FourLevel | PtType::AArch64Granule4K48 => 4,
            PtType::Amd64FiveLevel | PtType::AArch64Granule4K52 => 5,
        }
    }
}

/// How strictly `page-table.levels` must be honored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PtConstraint {
    Exactly,
    AtLeast,
    Maximum,
}

/// Builds a page table of the given layout with a fresh root.
pub fn page_table_init(
    ms: &mut MemoryServices,
    ty: PtType,
    max_table_address: u64,
) -> Option<PageTable> {
    match ty {
        PtType::I386NoPae | PtType::I386Pae | PtType::Amd64FourLevel | PtType::Amd64FiveLevel => {
            x86::page_table_init(ms, ty, max_table_address)
        }
        PtType::AArch64Granule4K48 | PtType::AArch64Granule4K52 => {
            aarch64::page_table_init(ms, ty, max_table_address)
        }
    }
}

/// The CPU architecture a kernel binary targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
    X86,
    AArch64,
}

const AMD64_HIGHER_HALF_BASE: u64 = 0xFFFF_FFFF_8000_0000;
const I686_HIGHER_HALF_BASE: u64 = 0xC000_0000;

const AMD64_DIRECT_MAP_BASE: u64 = 0xFFFF_8000_0000_0000;
const AMD64_LA57_DIRECT_MAP_BASE: u64 = 0xFF00_0000_0000_0000;
const I686_DIRECT_MAP_BASE: u64 = I686_HIGHER_HALF_BASE;

const AARCH64_HIGHER_HALF_BASE: u64 = 0xFFFF_FFFF_8000_0000;
const AARCH64_48BIT_DIRECT_MAP_BASE: u64 = 0xFFFF_0000_0000_0000;
const AARCH64_52BIT_DIRECT_MAP_BASE: u64 = 0xFFF0_0000_0000_0000;

impl Arch {
    pub fn higher_half_base(self, flags: HandoverFlags) -> u64 {
        match self {
            Arch::X86 => {
                if flags.contains(HandoverFlags::X86_LME) {
                    AMD64_HIGHER_HALF_BASE
                } else {
                    I686_HIGHER_HALF_BASE
                }
            }
            Arch::AArch64 => AARCH64_HIGHER_HALF_BASE,
        }
    }

    pub fn higher_half_size(self, flags: HandoverFlags) -> u64 {
        let base = self.higher_half_base(flags);

        let max_addr = match self {
            Arch::X86 if !flags.contains(HandoverFlags::X86_LME) => 4 * GB - 1,
            _ => u64::MAX,
        };

        (max_addr - base) + 1
    }

    pub fn direct_map_base(self, flags: HandoverFlags) -> u64 {
        match self {
            Arch::X86 => {
                if flags.contains(HandoverFlags::X86_LME) {
                    if flags.contains(HandoverFlags::X86_LA57) {
                        AMD64_LA57_DIRECT_MAP_BASE
                    } else {
                        AMD64_DIRECT_MAP_BASE
                    }
                } else {
                    I686_DIRECT_MAP_BASE
                }
            }
            Arch::AArch64 => {
                if flags.contains(HandoverFlags::AARCH64_52_BIT_IA) {
                    AARCH64_52BIT_DIRECT_MAP_BASE
                } else {
                    AARCH64_48BIT_DIRECT_MAP_BASE
                }
            }
        }
    }

    /// 1 + the highest address any part of the kernel binary (or a module,
    /// or the stack) may occupy.
    pub fn max_binary_address(self, flags: HandoverFlags) -> u64 {
        match self {
            Arch::X86 => {
                if flags.contains(HandoverFlags::X86_LME) {
                    // A 32-bit loader build cannot copy above 4 GiB.
                    if cfg!(target_pointer_width = "32") {
                        4 * GB
                    } else {
                        u64::MAX
                    }
                } else {
                    // Must be accessible from the higher half.
                    4 * GB - I686_DIRECT_MAP_BASE
                }
            }
            // No known limitations.
            Arch::AArch64 => u64::MAX,
        }
    }

    pub fn should_map_high_memory(self, flags: HandoverFlags) -> bool {
        match self {
            Arch::X86 => flags.contains(HandoverFlags::X86_LME),
            Arch::AArch64 => true,
        }
    }

    /// Arch flags implied by the binary itself. Fails for option
    /// combinations the architecture cannot express.
    pub fn flags_for_binary(
        self,
        elf_arch: crate::elf::ElfArch,
        allocate_anywhere: bool,
    ) -> Result<HandoverFlags, crate::errors::BootError> {
        match (self, elf_arch) {
            (Arch::X86, crate::elf::ElfArch::I386) => {
                if allocate_anywhere {
                    return Err(crate::errors::BootError::new(alloc::format!(
                        "allocate-anywhere is only allowed for 64 bit kernels"
                    )));
                }

                Ok(HandoverFlags::empty())
            }
            (Arch::X86, crate::elf::ElfArch::Amd64) => Ok(HandoverFlags::X86_LME),
            (Arch::AArch64, crate::elf::ElfArch::AArch64) => Ok(HandoverFlags::empty()),
            _ => Err(crate::errors::BootError::new(alloc::format!(
                "kernel architecture does not match the platform"
            ))),
        }
    }

    /// Resolves `page-table.levels` + constraint into a concrete layout,
    /// extending `flags` with whatever the layout requires.
    pub fn configure_pt_type(
        self,
        flags: &mut HandoverFlags,
        pt_levels: u64,
        constraint: PtConstraint,
        support: &FlagSupport,
    ) -> Option<PtType> {
        match self {
            Arch::X86 => {
                if support.is_supported(HandoverFlags::X86_PSE) {
                    *flags |= HandoverFlags::X86_PSE;
                }

                if flags.contains(HandoverFlags::X86_LME) {
                    *flags |= HandoverFlags::X86_PAE;
                    let mut ty = PtType::Amd64FourLevel;

                    if (pt_levels == 5 || constraint == PtConstraint::AtLeast)
                        && support.is_supported(HandoverFlags::X86_LA57)
                    {
                        *flags |= HandoverFlags::X86_LA57;
                        ty = PtType::Amd64FiveLevel;
                    }

                    if pt_levels == 5
                        && ty != PtType::Amd64FiveLevel
                        && constraint != PtConstraint::Maximum
                    {
                        return None;
                    }

                    Some(ty)
                } else {
                    let mut ty = PtType::I386NoPae;

                    if (pt_levels == 3 || constraint == PtConstraint::AtLeast)
                        && support.is_supported(HandoverFlags::X86_PAE)
                    {
                        *flags |= HandoverFlags::X86_PAE;
                        ty = PtType::I386Pae;
                    }

                    if pt_levels == 3
                        && ty != PtType::I386Pae
                        && constraint != PtConstraint::Maximum
                    {
                        return None;
                    }

                    Some(ty)
                }
            }
            Arch::AArch64 => {
                let mut ty = PtType::AArch64Granule4K48;

                if (pt_levels == 5 || constraint == PtConstraint::AtLeast)
                    && support.is_supported(HandoverFlags::AARCH64_52_BIT_IA)
                {
                    *flags |= HandoverFlags::AARCH64_52_BIT_IA;
                    ty = PtType::AArch64Granule4K52;
                }

                if pt_levels == 5
                    && ty != PtType::AArch64Granule4K52
                    && constraint != PtConstraint::Maximum
                {
                    return None;
                }

                Some(ty)
            }
        }
    }

    /// The minimum amount of physical memory the handover contract
    /// requires to be direct mapped.
    pub fn minimum_map_length(self, direct_map_base: u64, flags: HandoverFlags) -> u64 {
        match self {
            Arch::X86 => {
                if flags.contains(HandoverFlags::X86_LME) {
                    4 * GB
                } else {
                    // At least the entire higher half.
                    assert!(direct_map_base != 0 && direct_map_base % GB == 0);
                    4 * GB - direct_map_base
                }
            }
            Arch::AArch64 => 4 * GB,
        }
    }

    /// 1 + the highest address a page-table page may live at.
    pub fn max_pt_address(self, direct_map_base: u64, flags: HandoverFlags) -> u64 {
        match self {
            Arch::X86 => {
                if flags.contains(HandoverFlags::X86_LME) {
                    // The 32-bit handover trampoline can only reach the
                    // first 4 GiB; a 64-bit loader has no such limit.
                    if cfg!(target_pointer_width = "32") {
                        4 * GB
                    } else {
                        u64::MAX
                    }
                } else {
                    4 * GB - direct_map_base
                }
            }
            Arch::AArch64 => u64::MAX,
        }
    }

    /// Protocol adjustment of the direct-map length for the higher half.
    pub fn adjust_direct_map_min_size(self, direct_map_min_size: u64, flags: HandoverFlags) -> u64 {
        match self {
            Arch::X86 => {
                if !flags.contains(HandoverFlags::X86_LME) {
                    let ret = 4 * GB - I686_DIRECT_MAP_BASE;
                    assert!(ret >= direct_map_min_size);
                    return ret;
                }

                direct_map_min_size.max(4 * GB)
            }
            Arch::AArch64 => direct_map_min_size.max(4 * GB),
        }
    }

    /// Same, for the lower-half identity mapping.
    pub fn adjust_direct_map_min_size_for_lower_half(
        self,
        direct_map_min_size: u64,
        flags: HandoverFlags,
    ) -> u64 {
        match self {
            Arch::X86 if !flags.contains(HandoverFlags::X86_LME) => I686_DIRECT_MAP_BASE,
            _ => direct_map_min_size,
        }
    }
}

/// The kernel binaries we expect the protocol to see start at 1 MiB.
pub const FIRST_USABLE_ADDRESS: u64 = MB;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elf::ElfArch;

    #[test]
    fn amd64_policy() {
        let flags = HandoverFlags::X86_LME;

        assert_eq!(Arch::X86.higher_half_base(flags), 0xFFFF_FFFF_8000_0000);
        assert_eq!(Arch::X86.direct_map_base(flags), 0xFFFF_8000_0000_0000);
        assert_eq!(
            Arch::X86.direct_map_base(flags | HandoverFlags::X86_LA57),
            0xFF00_0000_0000_0000
        );
        assert!(Arch::X86.should_map_high_memory(flags));
    }

    #[test]
    fn i686_policy() {
        let flags = HandoverFlags::empty();

        assert_eq!(Arch::X86.higher_half_base(flags), 0xC000_0000);
        assert_eq!(Arch::X86.direct_map_base(flags), 0xC000_0000);
        assert_eq!(Arch::X86.max_binary_address(flags), 4 * GB - 0xC000_0000);
        assert_eq!(Arch::X86.higher_half_size(flags), 4 * GB - 0xC000_0000);
        assert!(!Arch::X86.should_map_high_memory(flags));
    }

    #[test]
    fn allocate_anywhere_rejected_for_i386() {
        assert!(Arch::X86.flags_for_binary(ElfArch::I386, true).is_err());
        assert_eq!(
            Arch::X86.flags_for_binary(ElfArch::Amd64, true).unwrap(),
            HandoverFlags::X86_LME
        );
    }

    #[test]
    fn pt_constraint_resolution_amd64() {
        let support = FlagSupport::x86_baseline();

        // 5 levels unsupported: "exactly" fails, "maximum" degrades.
        let mut flags = HandoverFlags::X86_LME;
        assert_eq!(
            Arch::X86.configure_pt_type(&mut flags, 5, PtConstraint::Exactly, &support),
            None
        );

        let mut flags = HandoverFlags::X86_LME;
        assert_eq!(
            Arch::X86.configure_pt_type(&mut flags, 5, PtConstraint::Maximum, &support),
            Some(PtType::Amd64FourLevel)
        );
        assert!(flags.contains(HandoverFlags::X86_PAE | HandoverFlags::X86_PSE));

        // With LA57 support, "at-least 4" upgrades to 5 levels.
        let support = FlagSupport::new(
            HandoverFlags::X86_LME
                | HandoverFlags::X86_PSE
                | HandoverFlags::X86_PAE
                | HandoverFlags::X86_LA57,
        );
        let mut flags = HandoverFlags::X86_LME;
        assert_eq!(
            Arch::X86.configure_pt_type(&mut flags, 4, PtConstraint::AtLeast, &support),
            Some(PtType::Amd64FiveLevel)
        );
        assert!(flags.contains(HandoverFlags::X86_LA57));
    }

    #[test]
    fn pt_constraint_resolution_aarch64() {
        let support = FlagSupport::aarch64_baseline();

        let mut flags = HandoverFlags::empty();
        assert_eq!(
            Arch::AArch64.configure_pt_type(&mut flags, 4, PtConstraint::Exactly, &support),
            Some(PtType::AArch64Granule4K48)
        );

        let mut flags = HandoverFlags::empty();
        assert_eq!(
            Arch::AArch64.configure_pt_type(&mut flags, 5, PtConstraint::Exactly, &support),
            None
        );

        let support = FlagSupport::new(HandoverFlags::AARCH64_52_BIT_IA);
        let mut flags = HandoverFlags::empty();
        assert_eq!(
            Arch::AArch64.configure_pt_type(&mut flags, 5, PtConstraint::Exactly, &support),
            Some(PtType::AArch64Granule4K52)
        );
        assert_eq!(
            Arch::AArch64.direct_map_base(flags),
            0xFFF0_0000_0000_0000
        );
    }
}

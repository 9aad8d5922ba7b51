//! The firmware service bundle handed to the loader by its entry stub.
//!
//! Everything the core needs from BIOS or UEFI comes in through here:
//! block devices, video modes, the seeded memory map, and the few
//! platform lookups (RSDP, DTB, SMBIOS) protocols want forwarded.

use alloc::boxed::Box;
use alloc::sync::Arc;

use crate::arch::Arch;
use crate::disk::DiskServices;
use crate::handover::FlagSupport;
use crate::mem::MemoryServices;
use crate::video::VideoServices;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceProvider {
    Bios,
    Uefi,
}

/// Firmware odds and ends that are not disk, video or memory shaped.
pub trait Platform {
    fn provider(&self) -> ServiceProvider;

    /// The architecture kernels must target on this machine.
    fn arch(&self) -> Arch;

    /// Handover flags this machine supports, as detected at early boot.
    fn flag_support(&self) -> FlagSupport;

    /// 16-byte aligned address of the ACPI RSDP, best-effort.
    fn find_rsdp(&self) -> Option<u64> {
        None
    }

    /// Address of the flattened device tree, best-effort.
    fn find_dtb(&self) -> Option<u64> {
        None
    }

    /// Address of the SMBIOS entry point, best-effort.
    fn find_smbios(&self) -> Option<u64> {
        None
    }

    /// Runs firmware cleanup handlers. Called once, right before the
    /// handover is prepared; only memory services may be used afterwards.
    fn cleanup(&mut self) {}
}

/// Everything the loader core runs against.
pub struct Services {
    pub disk: Arc<dyn DiskServices>,
    pub video: Box<dyn VideoServices>,
    pub memory: MemoryServices,
    pub platform: Box<dyn Platform>,
}

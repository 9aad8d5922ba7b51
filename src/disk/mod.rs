//! Block device abstraction.
//!
//! The loader never talks to hardware directly: every firmware backend
//! (BIOS int 13h, UEFI block I/O, ...) exposes its devices through the
//! [`DiskServices`] trait, and everything above works in terms of
//! [`Disk`] descriptors and opaque [`DiskHandle`]s.

use crate::errors::{CanFail, DiskError};

pub mod cache;

pub use cache::BlockCache;

/// Opaque reference to a firmware-owned block device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskHandle(pub usize);

/// A logical block device, as enumerated by the firmware backend.
///
/// Lifetime is the lifetime of the loader; the core never writes to it.
#[derive(Debug, Clone, Copy)]
pub struct Disk {
    /// Index of this disk in enumeration order.
    pub id: u32,

    /// Firmware handle used for read requests.
    pub handle: DiskHandle,

    /// Total number of addressable sectors.
    pub sectors: u64,

    /// log2 of the sector size. 9 for hard drives, 11 for CDs.
    pub block_shift: u8,
}

impl Disk {
    /// Sector size of this device, in bytes.
    pub fn block_size(&self) -> usize {
        1usize << self.block_shift
    }
}

/// Firmware-provided block device services.
///
/// All reads are synchronous and bounded; a failed read returns
/// [`DiskError::ReadFailure`] and is never retried by the core.
pub trait DiskServices {
    /// Number of devices visible to the firmware.
    fn disk_count(&self) -> usize;

    /// Descriptor of the device at `index` in enumeration order.
    fn disk(&self, index: usize) -> Option<Disk>;

    /// Reads `buf.len()` bytes starting at the absolute byte offset.
    fn read(&self, handle: DiskHandle, buf: &mut [u8], byte_offset: u64) -> CanFail<DiskError>;

    /// Reads whole sectors starting at `first_block`. `buf` must be a
    /// multiple of the sector size.
    fn read_blocks(&self, handle: DiskHandle, buf: &mut [u8], first_block: u64)
        -> CanFail<DiskError>;
}

#[cfg(test)]
pub(crate) mod testutil {
    //! In-memory disks for the host test suite.

    use alloc::sync::Arc;
    use alloc::vec::Vec;

    use super::{CanFail, Disk, DiskError, DiskHandle, DiskServices};

    pub struct RamDisk {
        pub data: Vec<u8>,
        pub block_shift: u8,
    }

    /// A [`DiskServices`] backend over plain byte buffers.
    pub struct RamDiskServices {
        disks: Vec<RamDisk>,
    }

    impl RamDiskServices {
        pub fn new() -> Self {
            Self { disks: Vec::new() }
        }

        pub fn add_disk(&mut self, data: Vec<u8>, block_shift: u8) -> DiskHandle {
            assert_eq!(data.len() & ((1 << block_shift) - 1), 0);
            self.disks.push(RamDisk { data, block_shift });
            DiskHandle(self.disks.len() - 1)
        }

        pub fn into_shared(self) -> Arc<dyn DiskServices> {
            Arc::new(self)
        }
    }

    impl DiskServices for RamDiskServices {
        fn disk_count(&self) -> usize {
            self.disks.len()
        }

        fn disk(&self, index: usize) -> Option<Disk> {
            let d = self.disks.get(index)?;

            Some(Disk {
                id: index as u32,
                handle: DiskHandle(index),
                sectors: (d.data.len() >> d.block_shift) as u64,
                block_shift: d.block_shift,
            })
        }

        fn read(&self, handle: DiskHandle, buf: &mut [u8], byte_offset: u64) -> CanFail<DiskError> {
            let d = self.disks.get(handle.0).ok_or(DiskError::NoSuchDisk)?;
            let start = byte_offset as usize;
            let end = start.checked_add(buf.len()).ok_or(DiskError::OutOfBounds)?;

            if end > d.data.len() {
                return Err(DiskError::OutOfBounds);
            }

            buf.copy_from_slice(&d.data[start..end]);
            Ok(())
        }

        fn read_blocks(
            &self,
            handle: DiskHandle,
            buf: &mut [u8],
            first_block: u64,
        ) -> CanFail<DiskError> {
            let shift = self.disks.get(handle.0).ok_or(DiskError::NoSuchDisk)?.block_shift;
            self.read(handle, buf, first_block << shift)
        }
    }
}

//! `GUID Partition Table` discovery. Part of the UEFI standard.

use alloc::sync::Arc;

use bytemuck::{Pod, Zeroable};

use crate::disk::{BlockCache, Disk, DiskServices};
use crate::fs::table::FsTable;
use crate::fs::Guid;

// "EFI PART"
pub const GPT_SIGNATURE: u64 = 0x5452415020494645;

#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct GptHeader {
    /// Identifies an EFI-compatible partition table header.
    /// Should contain the string "EFI PART".
    pub signature: u64,

    /// Revision number for this header.
    pub revision: u32,

    /// Size of the header in bytes.
    pub header_size: u32,

    /// CRC32 checksum for the header.
    pub header_crc32: u32,
    pub reserved: u32,

    /// The LBA that contains this structure.
    pub my_lba: u64,

    /// The LBA of the alternate header.
    pub alternate_lba: u64,

    /// First logical block that may be used by a partition.
    pub first_usable_lba: u64,

    /// Last logical block that may be used by a partition.
    pub last_usable_lba: u64,

    /// GUID used to identify the disk.
    pub disk_guid: Guid,

    /// Starting LBA of the partition entry array.
    pub partition_entry_lba: u64,

    /// Number of entries in the partition entry array.
    pub number_of_partition_entries: u32,

    /// Size in bytes of each entry in the partition entry array.
    pub size_of_partition_entry: u32,

    /// CRC32 of the partition entry array.
    pub partition_entry_array_crc32: u32,
    pub reserved1: u32,
}

const _: () = assert!(core::mem::size_of::<GptHeader>() == 96);

#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct GptPartitionEntry {
    /// Defines the purpose and type of this partition. All-zero means the
    /// slot is unused.
    pub partition_type_guid: Guid,

    /// GUID unique for every partition entry.
    pub unique_partition_guid: Guid,

    pub starting_lba: u64,
    pub ending_lba: u64,

    /// Partition attribute bits.
    pub attributes: u64,

    /// Null-terminated UCS-2 human-readable name.
    pub partition_name: [u16; 36],
}

const _: () = assert!(core::mem::size_of::<GptPartitionEntry>() == 128);

fn do_initialize(
    io: &Arc<dyn DiskServices>,
    table: &mut FsTable,
    disk: &Disk,
    bc: &mut BlockCache,
    hdr: &GptHeader,
) {
    if (hdr.size_of_partition_entry as usize) < core::mem::size_of::<GptPartitionEntry>() {
        log::warn!(
            target: "gpt",
            "invalid partition entry size {}, skipped (disk {})",
            hdr.size_of_partition_entry, disk.id
        );
        return;
    }

    if hdr.number_of_partition_entries == 0 {
        log::warn!(target: "gpt", "empty GPT disk {}?", disk.id);
        return;
    }

    if hdr.partition_entry_lba >= disk.sectors {
        log::warn!(
            target: "gpt",
            "partition entry LBA out of bounds: {}", hdr.partition_entry_lba
        );
        return;
    }

    let mut current_off = hdr.partition_entry_lba << disk.block_shift;

    for part_idx in 0..hdr.number_of_partition_entries {
        let mut raw = [0u8; core::mem::size_of::<GptPartitionEntry>()];

        let ok = bc.read(&mut raw, current_off).is_ok();
        current_off += u64::from(hdr.size_of_partition_entry);

        if !ok {
            continue;
        }

        let pe: GptPartitionEntry = bytemuck::pod_read_unaligned(&raw);

        if pe.partition_type_guid.is_null() {
            continue;
        }

        let lba_range = pe.starting_lba..pe.ending_lba;

        if let Some(fs) = crate::fs::try_detect(io, disk, lba_range, bc) {
            table.add_gpt_entry(disk, part_idx, hdr.disk_guid, pe.unique_partition_guid, fs);
        }
    }
}

/// Returns `true` if LBA 1 carries a GPT signature; filesystems found
/// behind the partition entries are registered as a side effect.
pub fn initialize(
    io: &Arc<dyn DiskServices>,
    table: &mut FsTable,
    disk: &Disk,
    bc: &mut BlockCache,
) -> bool {
    let mut raw = [0u8; core::mem::size_of::<GptHeader>()];

    if bc.read(&mut raw, 1 << disk.block_shift).is_err() {
        return false;
    }

    let hdr: GptHeader = bytemuck::pod_read_unaligned(&raw);

    if hdr.signature != GPT_SIGNATURE {
        return false;
    }

    do_initialize(io, table, disk, bc, &hdr);
    true
}

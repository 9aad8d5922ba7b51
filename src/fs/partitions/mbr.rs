//! MBR (_Master Boot Record_) partition table discovery, including the
//! recursive EBR walk for extended partitions.

use alloc::sync::Arc;

use bytemuck::{Pod, Zeroable};

use crate::disk::{BlockCache, Disk, DiskServices};
use crate::fs::table::FsTable;

pub const MBR_SIGNATURE: u16 = 0xAA55;
pub const OFFSET_TO_SIGNATURE: u64 = 510;

const OFFSET_TO_PARTITION_LIST: u64 = 0x01BE;

const EMPTY_PARTITION: u8 = 0x00;
const EBR_PARTITION: u8 = 0x05;

/// One of the four primary slots (or two meaningful EBR slots).
///
/// All related code uses LBA addressing; the CHS fields are dead weight.
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C, packed)]
pub struct MbrPartitionEntry {
    pub status: u8,
    pub chs_begin: [u8; 3],
    pub kind: u8,
    pub chs_end: [u8; 3],
    pub first_block: u32,
    pub block_count: u32,
}

const _: () = assert!(core::mem::size_of::<MbrPartitionEntry>() == 16);

fn do_initialize(
    io: &Arc<dyn DiskServices>,
    table: &mut FsTable,
    disk: &Disk,
    bc: &mut BlockCache,
    base_index: u32,
    sector_offset: u64,
) {
    let mut raw = [0u8; 4 * core::mem::size_of::<MbrPartitionEntry>()];
    let table_off = (sector_offset << disk.block_shift) + OFFSET_TO_PARTITION_LIST;

    if bc.read(&mut raw, table_off).is_err() {
        return;
    }

    let partitions: [MbrPartitionEntry; 4] = bytemuck::pod_read_unaligned(&raw);
    let is_ebr = base_index != 0;
    let max_partitions = if is_ebr { 2 } else { 4 };

    for (i, part) in partitions.iter().take(max_partitions).enumerate() {
        let real_partition_offset = sector_offset + u64::from(part.first_block);

        if part.kind == EMPTY_PARTITION {
            continue;
        }

        if part.kind == EBR_PARTITION {
            if is_ebr && i == 0 {
                log::warn!(target: "mbr", "EBR with a chain at index 0");
                break;
            }

            do_initialize(
                io,
                table,
                disk,
                bc,
                base_index + if is_ebr { 1 } else { 4 },
                real_partition_offset,
            );
            continue;
        }

        if is_ebr && i == 1 {
            log::warn!(
                target: "mbr",
                "EBR with a non-EBR entry at index 1 ({:#04X})", part.kind
            );
            break;
        }

        let lba_range = real_partition_offset..real_partition_offset + u64::from(part.block_count);

        if let Some(fs) = crate::fs::try_detect(io, disk, lba_range, bc) {
            table.add_mbr_entry(disk, base_index + i as u32, fs);
        }
    }
}

/// Returns `true` if the disk carries an MBR signature; filesystems found
/// behind its partitions are registered as a side effect.
pub fn initialize(
    io: &Arc<dyn DiskServices>,
    table: &mut FsTable,
    disk: &Disk,
    bc: &mut BlockCache,
) -> bool {
    let mut sig = [0u8; 2];

    if bc.read(&mut sig, OFFSET_TO_SIGNATURE).is_err() {
        return false;
    }

    if u16::from_le_bytes(sig) != MBR_SIGNATURE {
        return false;
    }

    do_initialize(io, table, disk, bc, 0, 0);
    true
}

//! Partition table discovery.
//!
//! Each disk is probed GPT first (signature at LBA 1), then MBR
//! (signature at offset 510). A disk carrying neither is skipped as
//! unpartitioned; a protective MBR without a valid GPT header falls into
//! the same bucket, since GPT is authoritative for such disks.

use alloc::sync::Arc;

use crate::disk::{BlockCache, Disk, DiskServices};
use crate::fs::table::FsTable;

pub mod gpt;
pub mod mbr;

/// Probes the partition tables of `disk` and registers every recognized
/// filesystem into `table`.
pub fn detect_all(
    io: &Arc<dyn DiskServices>,
    table: &mut FsTable,
    disk: &Disk,
    bc: &mut BlockCache,
) {
    if gpt::initialize(io, table, disk, bc) {
        return;
    }

    if mbr::initialize(io, table, disk, bc) {
        return;
    }

    // No partition table; the whole disk may still be one filesystem
    // (an ISO9660 CD, a superfloppy FAT volume).
    if let Some(fs) = crate::fs::try_detect(io, disk, 0..disk.sectors, bc) {
        table.add_raw_entry(disk, fs);
        return;
    }

    log::warn!(target: "fs", "unpartitioned drive {} skipped", disk.id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::testutil::RamDiskServices;
    use crate::fs::path::{self, DiskIdentifier, PartitionIdentifier};
    use crate::fs::table::FsEntryType;
    use crate::fs::testimg::{self, Dir, FatImageBuilder};
    use alloc::vec;
    use alloc::vec::Vec;

    fn fat_with_marker(marker: &[u8]) -> Vec<u8> {
        let mut b = FatImageBuilder::new_fat16();
        b.add_file(Dir::Root, "MARKER.BIN", 0, None, marker, false);
        b.finish()
    }

    fn detect(disk_image: Vec<u8>, block_shift: u8) -> FsTable {
        let mut sv = RamDiskServices::new();
        let handle = sv.add_disk(disk_image, block_shift);
        let io = sv.into_shared();
        let disk = io.disk(0).unwrap();
        let mut bc = crate::disk::BlockCache::new(
            io.clone(),
            handle,
            block_shift,
            (4096usize >> block_shift).max(1),
        );

        let mut table = FsTable::new();
        detect_all(&io, &mut table, &disk, &mut bc);
        table
    }

    #[test]
    fn gpt_partition_is_discovered_with_guids() {
        let fat = fat_with_marker(b"gpt marker");
        let (disk, disk_guid, part_guid) = testimg::wrap_gpt(&fat, 64, None);

        let table = detect(disk, 9);
        let entries = table.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].entry_type, FsEntryType::Gpt);
        assert_eq!(entries[0].partition_index, 0);
        assert_eq!(entries[0].disk_guid, disk_guid);
        assert_eq!(entries[0].partition_guid, part_guid);

        // The registered filesystem is usable.
        assert!(path::open(&*entries[0].fs, "/MARKER.BIN").is_some());

        // GUID-based path resolution reaches the same entry.
        let fp = path::FullPath {
            disk: DiskIdentifier::Uuid(disk_guid),
            partition: PartitionIdentifier::Uuid(part_guid),
            path_within_partition: "/MARKER.BIN",
        };
        assert!(table.by_full_path(&fp).is_some());

        let fp = path::FullPath {
            disk: DiskIdentifier::Index(0),
            partition: PartitionIdentifier::Index(0),
            path_within_partition: "/MARKER.BIN",
        };
        assert!(table.by_full_path(&fp).is_some());
    }

    #[test]
    fn mbr_with_ebr_chain_accumulates_indices() {
        let fat_a = fat_with_marker(b"primary");
        let fat_b = fat_with_marker(b"logical one");
        let fat_c = fat_with_marker(b"logical two");
        let fat_sectors = (fat_a.len() / 512) as u32;

        let primary_start = 64u32;
        let ebr1_start = primary_start + fat_sectors;
        let log1_start = ebr1_start + 1;
        let ebr2_rel = 1 + fat_sectors; // relative to ebr1
        let ebr2_start = ebr1_start + ebr2_rel;
        let log2_start = ebr2_start + 1;
        let total = (log2_start + fat_sectors) as usize;

        let mut disk = vec![0u8; total * 512];

        let write_entry = |disk: &mut [u8], at: usize, kind: u8, first: u32, count: u32| {
            disk[at + 4] = kind;
            disk[at + 8..at + 12].copy_from_slice(&first.to_le_bytes());
            disk[at + 12..at + 16].copy_from_slice(&count.to_le_bytes());
        };

        // MBR: one primary FAT partition, one extended chain.
        write_entry(&mut disk, 0x1BE, 0x0C, primary_start, fat_sectors);
        write_entry(&mut disk, 0x1BE + 16, 0x05, ebr1_start, 0);
        disk[510] = 0x55;
        disk[511] = 0xAA;

        // First EBR: logical partition + link to the next EBR.
        let ebr1 = ebr1_start as usize * 512;
        write_entry(&mut disk, ebr1 + 0x1BE, 0x0C, 1, fat_sectors);
        write_entry(&mut disk, ebr1 + 0x1BE + 16, 0x05, ebr2_rel, 0);
        disk[ebr1 + 510] = 0x55;
        disk[ebr1 + 511] = 0xAA;

        // Second EBR: final logical partition.
        let ebr2 = ebr2_start as usize * 512;
        write_entry(&mut disk, ebr2 + 0x1BE, 0x0C, 1, fat_sectors);
        disk[ebr2 + 510] = 0x55;
        disk[ebr2 + 511] = 0xAA;

        let copy_at = |disk: &mut [u8], lba: u32, image: &[u8]| {
            let at = lba as usize * 512;
            disk[at..at + image.len()].copy_from_slice(image);
        };
        copy_at(&mut disk, primary_start, &fat_a);
        copy_at(&mut disk, log1_start, &fat_b);
        copy_at(&mut disk, log2_start, &fat_c);

        let table = detect(disk, 9);
        let entries = table.entries();
        assert_eq!(entries.len(), 3);

        // Primary slots take 0..3; each EBR contributes one index after.
        assert_eq!(entries[0].partition_index, 0);
        assert_eq!(entries[1].partition_index, 4);
        assert_eq!(entries[2].partition_index, 5);
        assert!(entries.iter().all(|e| e.entry_type == FsEntryType::Mbr));

        for entry in entries {
            assert!(path::open(&*entry.fs, "/MARKER.BIN").is_some());
        }
    }

    #[test]
    fn protective_mbr_without_gpt_is_unpartitioned() {
        // Type 0xEE alone, with no valid GPT header behind it.
        let mut disk = vec![0u8; 128 * 512];
        disk[0x1BE + 4] = 0xEE;
        disk[510] = 0x55;
        disk[511] = 0xAA;

        let table = detect(disk, 9);
        assert!(table.entries().is_empty());
    }

    #[test]
    fn raw_iso_disk_registers_as_raw_entry() {
        let image = testimg::build_iso(true);
        let table = detect(image.data.clone(), 11);

        let entries = table.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].entry_type, FsEntryType::Raw);

        // Raw access resolves through DISK<n>::/ paths.
        let fp = path::parse("DISK0::/README.TXT").unwrap();
        assert!(table.by_full_path(&fp).is_some());
    }
}

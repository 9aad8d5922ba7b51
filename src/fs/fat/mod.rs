//! FAT12/16/32 driver.
//!
//! The FAT type is decided by the computed cluster count alone. A cached
//! window of the allocation table (the whole FAT for 12/16, sliding for
//! 32) backs cluster chain walks; per-file chains are flattened lazily
//! into sorted contiguous-run arrays that every read binary-searches.

use core::ops::Range;

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use crate::disk::{BlockCache, Disk, DiskServices};
use crate::errors::{CanFail, FsError};
use crate::fs::{check_read, DirIter, DirRec, DirRecFlags, File, FileRead, FileSystem};

pub mod structures;

use structures::*;

const FAT16_MIN_CLUSTER_COUNT: u32 = 4085;
const FAT32_MIN_CLUSTER_COUNT: u32 = 65525;
const FAT32_CLUSTER_MASK: u32 = 0x0FFF_FFFF;

// This capacity is picked so that the entire FAT is cached for both
// FAT12/16 at all times.
const FAT_VIEW_BYTES: usize = 4096 * 32;
const FAT_VIEW_CAPACITY_FAT32: u32 = (FAT_VIEW_BYTES / 4) as u32;
const FAT_VIEW_OFF_INVALID: u32 = 0xFFFF_FFFF;

const RESERVED_CLUSTER_COUNT: u32 = 2;
const FREE_CLUSTER_VALUE: u32 = 0;
const RESERVED_CLUSTER_VALUE: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FatKind {
    Fat12,
    Fat16,
    Fat32,
}

impl FatKind {
    fn bits(self) -> u32 {
        match self {
            FatKind::Fat12 => 12,
            FatKind::Fat16 => 16,
            FatKind::Fat32 => 32,
        }
    }

    fn eoc_value(self) -> u32 {
        match self {
            FatKind::Fat12 => 0x0000_0FF8,
            FatKind::Fat16 => 0x0000_FFF8,
            FatKind::Fat32 => 0x0FFF_FFF8,
        }
    }

    fn bad_value(self) -> u32 {
        match self {
            FatKind::Fat12 => 0x0000_0FF7,
            FatKind::Fat16 => 0x0000_FFF7,
            FatKind::Fat32 => 0x0FFF_FFF7,
        }
    }
}

enum FatEntry {
    Free,
    Reserved,
    Bad,
    EndOfChain,
    Link(u32),
}

fn classify_fat_value(value: u32, kind: FatKind) -> FatEntry {
    let value = value & FAT32_CLUSTER_MASK;

    match value {
        FREE_CLUSTER_VALUE => FatEntry::Free,
        RESERVED_CLUSTER_VALUE => FatEntry::Reserved,
        _ if value == kind.bad_value() => FatEntry::Bad,
        _ if value >= kind.eoc_value() => FatEntry::EndOfChain,
        _ => FatEntry::Link(value),
    }
}

fn pure_cluster_value(value: u32) -> u32 {
    debug_assert!(value >= RESERVED_CLUSTER_COUNT);
    value - RESERVED_CLUSTER_COUNT
}

struct FatView {
    offset: u32,
    data: Vec<u8>,
}

pub(crate) struct FatInner {
    io: Arc<dyn DiskServices>,
    disk: Disk,
    lba_range: Range<u64>,
    fat_lba_range: Range<u64>,
    data_lba_range: Range<u64>,

    kind: FatKind,
    bytes_per_cluster: u32,
    fat_clusters: u32,

    // FAT32
    root_dir_cluster: u32,

    // FAT12/16 (sector offset from the partition start)
    root_dir_sector_off: u64,
    root_dir_entries: u16,

    view: Mutex<FatView>,
}

impl FatInner {
    fn bytes_per_sector(&self) -> u64 {
        self.disk.block_size() as u64
    }

    fn ensure_view_fat12_or_16(&self, view: &mut FatView) -> bool {
        if view.offset != FAT_VIEW_OFF_INVALID {
            return true;
        }

        let blocks = self.fat_lba_range.end - self.fat_lba_range.start;
        view.data = alloc::vec![0; (blocks * self.bytes_per_sector()) as usize];

        if self
            .io
            .read_blocks(self.disk.handle, &mut view.data, self.fat_lba_range.start)
            .is_err()
        {
            return false;
        }

        view.offset = 0;
        true
    }

    fn ensure_view_fat32(&self, view: &mut FatView, index: u32) -> bool {
        let aligned = index & !(FAT_VIEW_CAPACITY_FAT32 - 1);

        debug_assert!(index < self.fat_clusters);

        // already have it cached
        if view.offset == aligned {
            return true;
        }

        let entries_per_block = self.bytes_per_sector() / 4;
        let first_block = self.fat_lba_range.start + u64::from(aligned) / entries_per_block;
        let blocks = (self.fat_lba_range.end - first_block)
            .min((FAT_VIEW_BYTES as u64) >> self.disk.block_shift);

        view.data = alloc::vec![0; (blocks * self.bytes_per_sector()) as usize];

        if self
            .io
            .read_blocks(self.disk.handle, &mut view.data, first_block)
            .is_err()
        {
            view.offset = FAT_VIEW_OFF_INVALID;
            return false;
        }

        view.offset = aligned;
        true
    }

    /// The FAT entry at `index`, or the bad-cluster value on any failure
    /// (OOM, disk read error, corrupted fs).
    fn fat_entry_at(&self, index: u32) -> u32 {
        let mut view = self.view.lock();

        let cached = match self.kind {
            FatKind::Fat12 | FatKind::Fat16 => self.ensure_view_fat12_or_16(&mut view),
            FatKind::Fat32 => self.ensure_view_fat32(&mut view, index),
        };

        if !cached {
            return self.kind.bad_value();
        }

        match self.kind {
            FatKind::Fat12 => {
                let pos = (index + index / 2) as usize;
                let raw = u16::from_le_bytes([view.data[pos], view.data[pos + 1]]);

                if index & 1 != 0 {
                    u32::from(raw >> 4)
                } else {
                    u32::from(raw & 0x0FFF)
                }
            }
            FatKind::Fat16 => {
                let pos = (index * 2) as usize;
                u32::from(u16::from_le_bytes([view.data[pos], view.data[pos + 1]]))
            }
            FatKind::Fat32 => {
                let pos = ((index - view.offset) * 4) as usize;
                let raw = u32::from_le_bytes([
                    view.data[pos],
                    view.data[pos + 1],
                    view.data[pos + 2],
                    view.data[pos + 3],
                ]);
                raw & FAT32_CLUSTER_MASK
            }
        }
    }

    /// Reads from a data cluster (`cluster` is zero-based, reserved
    /// clusters already subtracted).
    fn fat_read(&self, cluster: u32, offset: u32, buf: &mut [u8]) -> CanFail<FsError> {
        let mut offset_to_read = self.data_lba_range.start * self.bytes_per_sector();
        offset_to_read += u64::from(cluster) * u64::from(self.bytes_per_cluster);
        offset_to_read += u64::from(offset);

        self.io
            .read(self.disk.handle, buf, offset_to_read)
            .map_err(FsError::from)
    }
}

const DIR_EOF: u8 = 1 << 0;
const DIR_FIXED_CAP_ROOT: u8 = 1 << 1;

struct FatDirIter {
    inner: Arc<FatInner>,
    current_cluster: u32,
    first_sector_off: u64,
    current_offset: u32,
    flags: u8,
}

impl FatDirIter {
    fn fixed_root_fetch_next_entry(&mut self) -> Option<FatDirectoryEntry> {
        let inner = &self.inner;
        let entry_size = core::mem::size_of::<FatDirectoryEntry>() as u32;

        if self.current_offset / entry_size == u32::from(inner.root_dir_entries) {
            self.flags |= DIR_EOF;
            return None;
        }

        let mut offset_to_read =
            (inner.lba_range.start + self.first_sector_off) * inner.bytes_per_sector();
        offset_to_read += u64::from(self.current_offset);
        self.current_offset += entry_size;

        let mut raw = [0u8; 32];
        inner
            .io
            .read(inner.disk.handle, &mut raw, offset_to_read)
            .ok()?;

        Some(bytemuck::pod_read_unaligned(&raw))
    }

    fn fetch_next_entry(&mut self) -> Option<FatDirectoryEntry> {
        if self.flags & DIR_EOF != 0 {
            return None;
        }

        if self.flags & DIR_FIXED_CAP_ROOT != 0 {
            return self.fixed_root_fetch_next_entry();
        }

        if self.current_cluster < RESERVED_CLUSTER_COUNT {
            self.flags |= DIR_EOF;
            return None;
        }

        if self.current_offset == self.inner.bytes_per_cluster {
            let next = self.inner.fat_entry_at(self.current_cluster);

            let FatEntry::Link(next) = classify_fat_value(next, self.inner.kind) else {
                self.flags |= DIR_EOF;
                return None;
            };

            self.current_cluster = next;
            self.current_offset = 0;
        }

        let mut raw = [0u8; 32];
        let ok = self
            .inner
            .fat_read(
                pure_cluster_value(self.current_cluster),
                self.current_offset,
                &mut raw,
            )
            .is_ok();
        self.current_offset += core::mem::size_of::<FatDirectoryEntry>() as u32;

        if !ok {
            self.flags |= DIR_EOF;
            return None;
        }

        Some(bytemuck::pod_read_unaligned(&raw))
    }
}

fn generate_short_name_checksum(entry: &FatDirectoryEntry) -> u8 {
    let mut sum: u8 = 0;

    for i in 0..FAT_FULL_SHORT_NAME_LENGTH {
        let byte = if i < FAT_SHORT_NAME_LENGTH {
            entry.filename[i]
        } else {
            entry.extension[i - FAT_SHORT_NAME_LENGTH]
        };

        sum = (sum >> 1).wrapping_add((sum & 1) << 7).wrapping_add(byte);
    }

    sum
}

/// Converts at most `count` UCS-2 characters; stops at a null terminator.
/// Anything outside ASCII becomes '?'.
fn ucs2_to_ascii(ucs2: &[u8], count: usize, out: &mut Vec<u8>) -> usize {
    for i in 0..count {
        let ch = u16::from_le_bytes([ucs2[i * 2], ucs2[i * 2 + 1]]);

        if ch == 0 {
            return i;
        }

        out.push(if ch > 127 { b'?' } else { ch as u8 });
    }

    count
}

/// Fills `out` from the 8.3 entry; `short_name` controls whether the name
/// itself is (re)computed or already set from long-name entries.
fn process_normal_entry(entry: &FatDirectoryEntry, out: &mut DirRec, short_name: bool) {
    if short_name {
        let mut filename = entry.filename;
        let mut extension = entry.extension;

        if entry.case_info & LOWERCASE_NAME_BIT != 0 {
            filename.make_ascii_lowercase();
        }
        if entry.case_info & LOWERCASE_EXTENSION_BIT != 0 {
            extension.make_ascii_lowercase();
        }

        let name_len = filename
            .iter()
            .position(|&b| b == b' ')
            .unwrap_or(FAT_SHORT_NAME_LENGTH);
        let ext_len = extension
            .iter()
            .position(|&b| b == b' ')
            .unwrap_or(FAT_SHORT_EXTENSION_LENGTH);

        let mut name = [0u8; FAT_FULL_SHORT_NAME_LENGTH + 1];
        name[..name_len].copy_from_slice(&filename[..name_len]);
        let mut total = name_len;

        if ext_len != 0 {
            name[total] = b'.';
            total += 1;
            name[total..total + ext_len].copy_from_slice(&extension[..ext_len]);
            total += ext_len;
        }

        out.set_name(&name[..total]);
    }

    out.size = u64::from(entry.size);
    out.opaque[0] = u64::from(entry.first_cluster());
    out.flags = if entry.attributes & SUBDIR_ATTRIBUTE != 0 {
        DirRecFlags::SUBDIR
    } else {
        DirRecFlags::empty()
    };
}

impl DirIter for FatDirIter {
    fn next_rec(&mut self, out: &mut DirRec) -> bool {
        loop {
            let Some(entry) = self.fetch_next_entry() else {
                return false;
            };

            if entry.filename[0] == DELETED_FILE_MARK {
                continue;
            }

            if entry.filename[0] == END_OF_DIRECTORY_MARK {
                self.flags |= DIR_EOF;
                return false;
            }

            if entry.attributes & DEVICE_ATTRIBUTE != 0 {
                continue;
            }

            let is_long = entry.attributes & LONG_NAME_ATTRIBUTE == LONG_NAME_ATTRIBUTE;

            if !is_long {
                if entry.attributes & VOLUME_LABEL_ATTRIBUTE != 0 {
                    continue;
                }

                process_normal_entry(&entry, out, true);
                return true;
            }

            let long: LongNameFatDirectoryEntry = bytemuck::cast(entry);
            let initial_sequence_number = long.sequence_number & SEQUENCE_NUM_BIT_MASK;

            if long.sequence_number & LAST_LOGICAL_ENTRY_BIT == 0 {
                return false;
            }

            if initial_sequence_number == 0
                || usize::from(initial_sequence_number) > MAX_SEQUENCE_NUMBER
            {
                return false;
            }

            // Long entries are stored last-chunk-first; collect per
            // sequence number, then glue together in ascending order.
            let mut chunks: [Vec<u8>; MAX_SEQUENCE_NUMBER] = core::array::from_fn(|_| Vec::new());
            let mut checksums = [0u8; MAX_SEQUENCE_NUMBER];
            let mut sequence_number = initial_sequence_number;
            let mut long = long;

            let entry = loop {
                let idx = usize::from(sequence_number) - 1;
                let mut part = Vec::with_capacity(CHARS_PER_LONG_ENTRY);

                let mut converted = ucs2_to_ascii(&long.name_1, NAME_1_CHARS, &mut part);
                if converted == NAME_1_CHARS {
                    converted = ucs2_to_ascii(&long.name_2, NAME_2_CHARS, &mut part);
                }
                if converted == NAME_2_CHARS {
                    ucs2_to_ascii(&long.name_3, NAME_3_CHARS, &mut part);
                }

                chunks[idx] = part;
                checksums[idx] = long.checksum;

                let Some(next) = self.fetch_next_entry() else {
                    return false;
                };

                if sequence_number == 1 {
                    break next;
                }

                sequence_number -= 1;
                long = bytemuck::cast(next);
            };

            let mut name: Vec<u8> = Vec::new();
            for chunk in chunks[..usize::from(initial_sequence_number)].iter() {
                name.extend_from_slice(chunk);
            }

            if name.is_empty() || name.len() > crate::fs::DIR_REC_MAX_NAME_LEN {
                return false;
            }

            process_normal_entry(&entry, out, false);

            let checksum = generate_short_name_checksum(&entry);
            let checksum_ok = checksums[..usize::from(initial_sequence_number)]
                .iter()
                .all(|&c| c == checksum);

            if checksum_ok {
                out.set_name(&name);
            } else {
                // An invalid checksum only invalidates the long name.
                log::warn!(target: "fat", "invalid long name checksum");
                process_normal_entry(&entry, out, true);
            }

            return true;
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct ContiguousFileRange {
    file_offset_cluster: u32,
    global_cluster: u32,
}

struct FatFile {
    inner: Arc<FatInner>,
    first_cluster: u32,
    size: u64,

    /// Sorted in ascending order by `file_offset_cluster`. Each range at
    /// `i` spans up to `ranges[i + 1].file_offset_cluster - 1`; the last
    /// one ends at the last cluster of the file.
    ranges: Vec<ContiguousFileRange>,
}

impl FatFile {
    fn compute_contiguous_ranges(&mut self) -> CanFail<FsError> {
        let inner = &self.inner;
        let mut ranges = Vec::new();
        let mut range = ContiguousFileRange {
            file_offset_cluster: 0,
            global_cluster: self.first_cluster,
        };
        let mut current_file_offset: u32 = 1;
        let mut current_cluster = self.first_cluster;

        loop {
            let next = inner.fat_entry_at(current_cluster);

            match classify_fat_value(next, inner.kind) {
                FatEntry::EndOfChain => {
                    if u64::from(current_file_offset) * u64::from(inner.bytes_per_cluster)
                        < self.size
                    {
                        log::warn!(target: "fat", "EOC before end of file");
                        return Err(FsError::Corrupted);
                    }

                    ranges.push(range);
                    break;
                }
                FatEntry::Link(next) => {
                    if next != current_cluster + 1 {
                        ranges.push(range);
                        range = ContiguousFileRange {
                            file_offset_cluster: current_file_offset,
                            global_cluster: next,
                        };
                    }

                    current_cluster = next;
                    current_file_offset += 1;
                }
                _ => {
                    log::warn!(
                        target: "fat",
                        "unexpected cluster {next} in chain after {current_cluster}"
                    );
                    return Err(FsError::Corrupted);
                }
            }
        }

        self.ranges = ranges;
        Ok(())
    }

    fn cluster_from_offset(&self, offset: u32) -> u32 {
        debug_assert!(!self.ranges.is_empty());

        let idx = self
            .ranges
            .partition_point(|r| r.file_offset_cluster <= offset)
            - 1;
        let range = &self.ranges[idx];

        range.global_cluster + (offset - range.file_offset_cluster)
    }
}

impl FileRead for FatFile {
    fn size(&self) -> u64 {
        self.size
    }

    fn read(&mut self, buf: &mut [u8], offset: u64) -> CanFail<FsError> {
        if buf.is_empty() {
            return Ok(());
        }

        check_read(self.size, offset, buf.len())?;

        if self.ranges.is_empty() {
            self.compute_contiguous_ranges()?;
        }

        let bpc = u64::from(self.inner.bytes_per_cluster);
        let mut cluster_offset = (offset / bpc) as u32;
        let mut offset_within_cluster = (offset % bpc) as u32;
        let mut written = 0usize;

        while written < buf.len() {
            let cluster = self.cluster_from_offset(cluster_offset);
            cluster_offset += 1;

            let chunk = (buf.len() - written)
                .min((self.inner.bytes_per_cluster - offset_within_cluster) as usize);

            self.inner.fat_read(
                pure_cluster_value(cluster),
                offset_within_cluster,
                &mut buf[written..written + chunk],
            )?;

            written += chunk;
            offset_within_cluster = 0;
        }

        Ok(())
    }
}

pub struct FatFilesystem {
    inner: Arc<FatInner>,
}

impl FileSystem for FatFilesystem {
    fn disk(&self) -> &Disk {
        &self.inner.disk
    }

    fn open_dir(&self, rec: Option<&DirRec>) -> Box<dyn DirIter> {
        match rec {
            None => match self.inner.kind {
                FatKind::Fat32 => Box::new(FatDirIter {
                    inner: self.inner.clone(),
                    current_cluster: self.inner.root_dir_cluster,
                    first_sector_off: 0,
                    current_offset: 0,
                    flags: 0,
                }),
                _ => Box::new(FatDirIter {
                    inner: self.inner.clone(),
                    current_cluster: 0,
                    first_sector_off: self.inner.root_dir_sector_off,
                    current_offset: 0,
                    flags: DIR_FIXED_CAP_ROOT,
                }),
            },
            Some(rec) => Box::new(FatDirIter {
                inner: self.inner.clone(),
                current_cluster: rec.opaque[0] as u32,
                first_sector_off: 0,
                current_offset: 0,
                flags: 0,
            }),
        }
    }

    fn open_file(&self, rec: &DirRec) -> Option<File> {
        Some(Box::new(FatFile {
            inner: self.inner.clone(),
            first_cluster: rec.opaque[0] as u32,
            size: rec.size,
            ranges: Vec::new(),
        }))
    }
}

struct FatInfo {
    kind: FatKind,
    fat_count: u32,
    sectors_per_cluster: u32,
    sectors_per_fat: u32,
    cluster_count: u32,
    reserved_sectors: u32,

    // FAT32
    root_dir_cluster: u32,

    // FAT12/16
    root_dir_sectors: u32,
    max_root_dir_entries: u16,
}

fn check_fs_type(expected: &str, actual: &[u8; 8]) {
    if expected.as_bytes() != actual {
        log::warn!(
            target: "fat",
            "unexpected file system type: {}",
            core::str::from_utf8(actual).unwrap_or("<non-ascii>")
        );
    }
}

fn detect(disk: &Disk, lba_range: &Range<u64>, bpb_raw: &[u8]) -> Option<FatInfo> {
    let bpb20: Dos20Bpb = bytemuck::pod_read_unaligned(&bpb_raw[..13]);
    let ebpb16: Fat12Or16Ebpb = bytemuck::pod_read_unaligned(&bpb_raw[..51]);
    let ebpb32: Fat32Ebpb = bytemuck::pod_read_unaligned(&bpb_raw[..79]);

    if u64::from(bpb20.bytes_per_sector) != disk.block_size() as u64 {
        return None;
    }

    let ebpb16_valid =
        ebpb16.signature == EBPB_OLD_SIGNATURE || ebpb16.signature == EBPB_SIGNATURE;
    let ebpb32_valid = !ebpb16_valid
        && ebpb16.signature < EBPB_OLD_SIGNATURE
        && (ebpb32.signature == EBPB_OLD_SIGNATURE || ebpb32.signature == EBPB_SIGNATURE);

    let mut info = FatInfo {
        kind: FatKind::Fat12,
        fat_count: u32::from(bpb20.fat_count),
        sectors_per_cluster: u32::from(bpb20.sectors_per_cluster),
        sectors_per_fat: u32::from(bpb20.sectors_per_fat_fat12_or_16),
        cluster_count: 0,
        reserved_sectors: u32::from(bpb20.reserved_sectors),
        root_dir_cluster: 0,
        root_dir_sectors: 0,
        max_root_dir_entries: bpb20.max_root_dir_entries,
    };

    if info.sectors_per_fat == 0 {
        // Sectors per FAT not in the DOS 2.0 BPB, this must be FAT32.
        if !ebpb32_valid {
            return None;
        }

        info.sectors_per_fat = ebpb32.sectors_per_fat;
    }

    if info.fat_count == 0
        || info.sectors_per_cluster == 0
        || info.sectors_per_fat == 0
        || info.reserved_sectors == 0
    {
        return None;
    }

    let root_dir_bytes = u32::from(info.max_root_dir_entries) * 32;
    info.root_dir_sectors =
        root_dir_bytes.div_ceil(u32::from(bpb20.bytes_per_sector));

    let mut data_sectors = (lba_range.end - lba_range.start) as u32;
    data_sectors = data_sectors.checked_sub(info.reserved_sectors)?;
    data_sectors = data_sectors.checked_sub(info.root_dir_sectors)?;
    data_sectors = data_sectors.checked_sub(info.fat_count * info.sectors_per_fat)?;
    info.cluster_count = data_sectors / info.sectors_per_cluster;

    if info.cluster_count < FAT16_MIN_CLUSTER_COUNT {
        if ebpb16_valid {
            check_fs_type("FAT12   ", &ebpb16.filesystem_type);
        }

        info.kind = FatKind::Fat12;
        return (info.max_root_dir_entries != 0).then_some(info);
    }

    if info.cluster_count < FAT32_MIN_CLUSTER_COUNT {
        if ebpb16_valid {
            check_fs_type("FAT16   ", &ebpb16.filesystem_type);
        }

        info.kind = FatKind::Fat16;
        return (info.max_root_dir_entries != 0).then_some(info);
    }

    if !ebpb32_valid {
        return None;
    }

    check_fs_type("FAT32   ", &ebpb32.filesystem_type);

    info.kind = FatKind::Fat32;
    info.root_dir_cluster = ebpb32.root_dir_cluster;
    (info.root_dir_cluster >= RESERVED_CLUSTER_COUNT).then_some(info)
}

/// Probes `lba_range` for a FAT filesystem and mounts it on success.
pub fn try_create(
    io: &Arc<dyn DiskServices>,
    disk: &Disk,
    lba_range: Range<u64>,
    bc: &mut BlockCache,
) -> Option<Arc<dyn FileSystem>> {
    let mut bpb_raw = [0u8; 79];

    bc.read(
        &mut bpb_raw,
        (lba_range.start << disk.block_shift) + BPB_OFFSET,
    )
    .ok()?;

    let info = detect(disk, &lba_range, &bpb_raw)?;

    log::info!(
        target: "fat",
        "detected fat{} with {} fats, {} sectors/cluster, {} sectors/fat",
        info.kind.bits(), info.fat_count, info.sectors_per_cluster, info.sectors_per_fat
    );

    let mut lba = lba_range.clone();
    lba.start += u64::from(info.reserved_sectors);

    let fat_lba_range = lba.start..lba.start + u64::from(info.sectors_per_fat);
    lba.start += u64::from(info.sectors_per_fat * info.fat_count);

    let mut root_dir_sector_off = 0;
    if info.kind != FatKind::Fat32 {
        root_dir_sector_off = lba.start - lba_range.start;
        lba.start += u64::from(info.root_dir_sectors);
    }

    let bytes_per_sector = disk.block_size() as u64;
    let fat_len_bytes = (fat_lba_range.end - fat_lba_range.start) * bytes_per_sector;

    let inner = Arc::new(FatInner {
        io: io.clone(),
        disk: *disk,
        lba_range,
        fat_lba_range,
        data_lba_range: lba,
        kind: info.kind,
        bytes_per_cluster: info.sectors_per_cluster * disk.block_size() as u32,
        fat_clusters: (fat_len_bytes / 4) as u32,
        root_dir_cluster: info.root_dir_cluster,
        root_dir_sector_off,
        root_dir_entries: info.max_root_dir_entries,
        view: Mutex::new(FatView {
            offset: FAT_VIEW_OFF_INVALID,
            data: Vec::new(),
        }),
    });

    Some(Arc::new(FatFilesystem { inner }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::testutil::RamDiskServices;
    use crate::fs::path;
    use crate::fs::testimg::{Dir, FatImageBuilder};

    fn mount(image: Vec<u8>, claimed_sectors: Option<u64>) -> Arc<dyn FileSystem> {
        let mut sv = RamDiskServices::new();
        let handle = sv.add_disk(image, 9);
        let io = sv.into_shared();
        let disk = io.disk(0).unwrap();
        let mut bc = BlockCache::new(io.clone(), handle, 9, 8);

        let sectors = claimed_sectors.unwrap_or(disk.sectors);
        try_create(&io, &disk, 0..sectors, &mut bc).expect("fat volume not detected")
    }

    fn patterned(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 253) as u8).collect()
    }

    fn list_names(fs: &dyn FileSystem, rec: Option<&DirRec>) -> Vec<alloc::string::String> {
        let mut iter = fs.open_dir(rec);
        let mut out = Vec::new();
        let mut rec = DirRec::default();

        while iter.next_rec(&mut rec) {
            out.push(rec.name().into());
        }

        out
    }

    #[test]
    fn fat16_root_listing_with_case_bits() {
        let mut b = FatImageBuilder::new_fat16();
        b.add_file(Dir::Root, "KERNEL.ELF", 0, None, b"elf!", false);
        b.add_file(
            Dir::Root,
            "HYPER.CFG",
            LOWERCASE_NAME_BIT | LOWERCASE_EXTENSION_BIT,
            None,
            b"cfg",
            false,
        );

        let fs = mount(b.finish(), None);
        assert_eq!(list_names(&*fs, None), ["KERNEL.ELF", "hyper.cfg"]);
    }

    #[test]
    fn long_names_override_short_ones() {
        let mut b = FatImageBuilder::new_fat16();
        b.add_file(
            Dir::Root,
            "AVERYL~1.TXT",
            0,
            Some("a very long file name.txt"),
            b"data",
            false,
        );

        let fs = mount(b.finish(), None);
        assert_eq!(list_names(&*fs, None), ["a very long file name.txt"]);

        let file = path::open(&*fs, "/a very long file name.txt");
        assert!(file.is_some());
    }

    #[test]
    fn directory_iteration_is_deterministic() {
        let mut b = FatImageBuilder::new_fat16();
        b.add_file(Dir::Root, "A.BIN", 0, None, b"a", false);
        b.add_file(Dir::Root, "B.BIN", 0, Some("b long name.bin"), b"b", false);
        b.add_file(Dir::Root, "C.BIN", 0, None, b"c", false);

        let fs = mount(b.finish(), None);
        assert_eq!(list_names(&*fs, None), list_names(&*fs, None));
    }

    #[test]
    fn fragmented_file_round_trip() {
        let content = patterned(3000);
        let mut b = FatImageBuilder::new_fat16();
        b.add_file(Dir::Root, "FRAG.BIN", 0, None, &content, true);

        let fs = mount(b.finish(), None);
        let mut file = path::open(&*fs, "/FRAG.BIN").unwrap();
        assert_eq!(file.size(), 3000);

        let mut all = alloc::vec![0u8; 3000];
        file.read(&mut all, 0).unwrap();
        assert_eq!(all, content);

        // Concatenating split reads equals the full read, for any split.
        for k in [0usize, 1, 511, 512, 513, 1536, 2999, 3000] {
            let mut head = alloc::vec![0u8; k];
            let mut tail = alloc::vec![0u8; 3000 - k];
            file.read(&mut head, 0).unwrap();
            file.read(&mut tail, k as u64).unwrap();

            head.extend_from_slice(&tail);
            assert_eq!(head, content);
        }

        // Reads past the end fail instead of truncating.
        let mut buf = [0u8; 16];
        assert!(file.read(&mut buf, 2990).is_err());
    }

    #[test]
    fn subdirectory_path_walk() {
        let content = patterned(1200);
        let mut b = FatImageBuilder::new_fat16();
        let boot = b.add_dir(Dir::Root, "BOOT", LOWERCASE_NAME_BIT);
        b.add_file(boot, "KERNEL", LOWERCASE_NAME_BIT, None, &content, false);

        let fs = mount(b.finish(), None);

        let mut file = path::open(&*fs, "/boot/kernel").expect("path walk failed");
        let mut read = alloc::vec![0u8; content.len()];
        file.read(&mut read, 0).unwrap();
        assert_eq!(read, content);

        // A dot component is skipped.
        assert!(path::open(&*fs, "/./boot/./kernel").is_some());

        // A non-final file component fails the walk, as does opening a
        // directory itself.
        assert!(path::open(&*fs, "/boot/kernel/x").is_none());
        assert!(path::open(&*fs, "/boot").is_none());
        assert!(path::open(&*fs, "/missing").is_none());
    }

    #[test]
    fn fat32_volume_with_cluster_root() {
        let content = patterned(5000);
        let mut b = FatImageBuilder::new_fat32();
        let root = b.root();
        b.add_file(root, "KERNEL.ELF", 0, None, &content, true);
        let claimed = b.claimed_sectors();

        let fs = mount(b.finish(), Some(claimed));

        assert_eq!(list_names(&*fs, None), ["KERNEL.ELF"]);

        let mut file = path::open(&*fs, "/KERNEL.ELF").unwrap();
        let mut read = alloc::vec![0u8; content.len()];
        file.read(&mut read, 0).unwrap();
        assert_eq!(read, content);
    }
}

//! ISO9660 driver with Rock Ridge name support.
//!
//! Directory records are variable-length and never straddle a logical
//! block; iteration rounds up to the next block whenever the in-block
//! slack cannot hold the smallest possible record. Rock Ridge names come
//! out of the System Use area, transparently following `CE` continuation
//! areas through a dedicated block cache.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use crate::disk::{BlockCache, Disk, DiskServices};
use crate::errors::{CanFail, FsError};
use crate::fs::{check_read, DirIter, DirRec, DirRecFlags, File, FileRead, FileSystem};

pub mod structures;

use structures::*;

// Must be page-sized so the shared probe cache geometry matches.
const DIRECTORY_CACHE_SIZE: usize = 4096;
const CA_CACHE_SIZE: usize = 4096;

const NO_SU: u8 = 0xFF;

const MAX_SANE_CHAIN_LEN: usize = 200;
const MAX_NAME_LEN: usize = 255;

// System Use entry layout: signature, length, version, payload.
const LEN_SUE_IDX: usize = 2;
const VER_SUE_IDX: usize = 3;

/*
 * If the remaining allocated space following the last recorded System Use
 * Entry is less than four bytes long, it cannot contain another entry and
 * shall be ignored.
 */
const SUE_MIN_LEN: usize = 4;

const SUE_CE_LEN: u8 = 28;
const SUE_CE_BLOCK_IDX: usize = 4;
const SUE_CE_OFF_IDX: usize = 12;
const SUE_CE_LEN_IDX: usize = 20;

const SUE_NM_FLAGS_IDX: usize = 4;
const SUE_NM_FLAG_CONTINUE: u8 = 1 << 0;
const SUE_NM_FLAG_CURDIR: u8 = 1 << 1;
const SUE_NM_FLAG_PARDIR: u8 = 1 << 2;
const SUE_NM_MIN_LEN: u8 = 5;

const SUE_SP_CHECK_BYTE0_IDX: usize = 4;
const SUE_SP_CHECK_BYTE1_IDX: usize = 5;
const SUE_SP_LEN_SKP_IDX: usize = 6;
const SUE_SP_CHECK_BYTE0: u8 = 0xBE;
const SUE_SP_CHECK_BYTE1: u8 = 0xEF;

fn su_signature(sue: &[u8]) -> u16 {
    u16::from(sue[0]) | (u16::from(sue[1]) << 8)
}

fn su_sig(a: u8, b: u8) -> u16 {
    u16::from(a) | (u16::from(b) << 8)
}

fn sue_validate_version(sue: &[u8]) -> bool {
    if sue[VER_SUE_IDX] != 1 {
        log::warn!(
            target: "iso9660",
            "unexpected '{}{}' version {}",
            sue[0] as char, sue[1] as char, sue[VER_SUE_IDX]
        );
        return false;
    }

    true
}

pub(crate) struct IsoInner {
    io: Arc<dyn DiskServices>,
    disk: Disk,

    root_block: u32,
    root_size: u32,
    volume_size: u32,

    /// log2 of the filesystem logical block size (not the disk's).
    block_shift: u8,

    /// Offset of the Rock Ridge data within each System Use area, as
    /// announced by the root `SP` entry. [`NO_SU`] disables Rock Ridge.
    su_off: u8,

    dir_cache: Mutex<BlockCache>,
    ca_cache: Mutex<BlockCache>,
}

/// A raw directory record: fixed header plus identifier and System Use
/// bytes, copied out of the directory cache.
struct RawRecord {
    header: DirRecordHeader,
    data: [u8; 256],
    len: usize,
}

impl RawRecord {
    fn identifier(&self) -> &[u8] {
        let len = usize::from(self.header.identifier_length);
        &self.data[DIR_RECORD_HEADER_SIZE..DIR_RECORD_HEADER_SIZE + len]
    }

    fn su_area(&self) -> &[u8] {
        let start = DIR_RECORD_HEADER_SIZE + self.header.padded_identifier_length();
        &self.data[start.min(self.len)..self.len]
    }
}

/// Fetches the next raw record of a directory spanning
/// `[base_off, base_off + size)`, advancing `cur_off`.
fn fetch_raw_record(
    cache: &mut BlockCache,
    block_shift: u8,
    base_off: u64,
    size: u64,
    cur_off: &mut u64,
) -> Option<RawRecord> {
    let block_size = 1u64 << block_shift;

    let skip_to = |cur_off: &mut u64, off: u64| -> bool {
        // No more entries left
        if size <= off || (size - off) < DIR_RECORD_HEADER_SIZE as u64 {
            *cur_off = size;
            return false;
        }

        *cur_off = off;
        true
    };

    loop {
        if *cur_off >= size {
            return None;
        }

        let aligned_off = (*cur_off + block_size - 1) & !(block_size - 1);
        let mut rec_len_max = (size.min(aligned_off) - *cur_off) as usize;
        if rec_len_max == 0 {
            rec_len_max = 255;
        }

        if rec_len_max <= DIR_RECORD_HEADER_SIZE {
            if !skip_to(cur_off, aligned_off) {
                return None;
            }
            continue;
        }

        let raw = cache.slice(base_off + *cur_off, rec_len_max).ok()?;
        let rec_len = usize::from(raw[0]);

        // Either EOF or we're too close to the next block
        if rec_len == 0 {
            // Enough space but no record, assume EOF
            if rec_len_max == 255 {
                *cur_off = size;
                return None;
            }

            if !skip_to(cur_off, aligned_off) {
                return None;
            }
            continue;
        }

        let header: DirRecordHeader =
            bytemuck::pod_read_unaligned(&raw[..DIR_RECORD_HEADER_SIZE]);
        let rec_len_min = DIR_RECORD_HEADER_SIZE + header.padded_identifier_length();

        if rec_len > rec_len_max || rec_len < rec_len_min {
            log::warn!(
                target: "iso9660",
                "invalid record len {rec_len} (expected min {rec_len_min} max {rec_len_max})"
            );
            return None;
        }

        let mut data = [0u8; 256];
        data[..rec_len].copy_from_slice(&raw[..rec_len]);

        let bytes_left = size - *cur_off;
        if bytes_left < rec_len as u64 {
            log::warn!(
                target: "iso9660",
                "corrupted directory record? size: {rec_len} with {bytes_left} left"
            );
            return None;
        }

        *cur_off += rec_len as u64;

        return Some(RawRecord {
            header,
            data,
            len: rec_len,
        });
    }
}

/// Walks the System Use entries of one record, following `CE`
/// continuation areas when an `IsoInner` (and therefore a CA cache) is
/// available.
struct SuWalk<'a> {
    inner: Option<&'a IsoInner>,
    inline: &'a [u8],

    len: usize,
    cur: usize,

    is_in_ca: bool,
    ca_base: u64,

    next_ca_off: u64,
    next_ca_len: u32,
}

impl<'a> SuWalk<'a> {
    fn new(inner: Option<&'a IsoInner>, su_area: &'a [u8]) -> Self {
        Self {
            inner,
            inline: su_area,
            len: su_area.len(),
            cur: 0,
            is_in_ca: false,
            ca_base: 0,
            next_ca_off: 0,
            next_ca_len: 0,
        }
    }

    fn switch_to_next_ca(&mut self) -> bool {
        if self.next_ca_len == 0 || self.inner.is_none() {
            self.cur = self.len;
            return false;
        }

        self.len = self.next_ca_len as usize;
        self.cur = 0;
        self.ca_base = self.next_ca_off;
        self.is_in_ca = true;

        self.next_ca_off = 0;
        self.next_ca_len = 0;

        true
    }

    /// Copies the next raw entry into `out`; returns its length.
    fn fetch_entry(&mut self, out: &mut [u8; 255]) -> Option<usize> {
        let bytes_left = self.len - self.cur;

        let reported_len = if self.is_in_ca {
            let inner = self.inner?;
            let mut cache = inner.ca_cache.lock();
            let peek = cache.slice(self.ca_base + self.cur as u64, LEN_SUE_IDX + 1).ok()?;
            usize::from(peek[LEN_SUE_IDX])
        } else {
            usize::from(self.inline[self.cur + LEN_SUE_IDX])
        };

        if reported_len > bytes_left || reported_len < SUE_MIN_LEN {
            log::warn!(
                target: "iso9660",
                "invalid SU entry len {reported_len}, expected max {bytes_left}"
            );
            return None;
        }

        if self.is_in_ca {
            let inner = self.inner?;
            let mut cache = inner.ca_cache.lock();
            let entry = cache
                .slice(self.ca_base + self.cur as u64, reported_len)
                .ok()?;
            out[..reported_len].copy_from_slice(entry);
        } else {
            out[..reported_len]
                .copy_from_slice(&self.inline[self.cur..self.cur + reported_len]);
        }

        self.cur += reported_len;
        if self.len - self.cur < SUE_MIN_LEN {
            self.cur = self.len;
        }

        Some(reported_len)
    }

    fn handle_ce(&mut self, sue: &[u8]) {
        if !sue_validate_version(sue) || sue[LEN_SUE_IDX] != SUE_CE_LEN {
            return;
        }

        let Some(inner) = self.inner else {
            return;
        };

        if self.next_ca_len != 0 {
            log::warn!(target: "iso9660", "multiple CEs in one SU field, dropping previous");
        }

        self.next_ca_off =
            u64::from(get_733(&sue[SUE_CE_BLOCK_IDX..])) << inner.block_shift;
        self.next_ca_off += u64::from(get_733(&sue[SUE_CE_OFF_IDX..]));
        self.next_ca_len = get_733(&sue[SUE_CE_LEN_IDX..]);
    }

    /// The next meaningful entry: `CE` and `ST` are consumed internally.
    fn next_entry(&mut self, out: &mut [u8; 255]) -> Option<usize> {
        loop {
            if self.cur == self.len && !self.switch_to_next_ca() {
                return None;
            }

            let len = self.fetch_entry(out)?;

            match su_signature(&out[..len]) {
                sig if sig == su_sig(b'C', b'E') => {
                    let entry = *out;
                    self.handle_ce(&entry[..len]);
                    continue;
                }
                sig if sig == su_sig(b'S', b'T') => {
                    if sue_validate_version(&out[..len]) {
                        self.switch_to_next_ca();
                        continue;
                    }

                    return Some(len);
                }
                _ => return Some(len),
            }
        }
    }
}

/// Extracts the Rock Ridge `NM` name from a System Use area.
fn find_rock_ridge_name(inner: &IsoInner, su_area: &[u8]) -> Option<Vec<u8>> {
    let mut walk = SuWalk::new(Some(inner), su_area);
    let mut entry = [0u8; 255];
    let mut name = Vec::new();

    while let Some(len) = walk.next_entry(&mut entry) {
        let sue = &entry[..len];

        if su_signature(sue) != su_sig(b'N', b'M') {
            continue;
        }

        if !sue_validate_version(sue) {
            return None;
        }

        if len < usize::from(SUE_NM_MIN_LEN) {
            log::warn!(target: "iso9660", "invalid 'NM' len {len}");
            return None;
        }

        let flags = sue[SUE_NM_FLAGS_IDX];
        if flags & (SUE_NM_FLAG_CURDIR | SUE_NM_FLAG_PARDIR) != 0 {
            return None;
        }

        let chunk = &sue[usize::from(SUE_NM_MIN_LEN)..];
        if name.len() + chunk.len() > MAX_NAME_LEN {
            log::warn!(target: "iso9660", "RR name is too long, ignoring");
            return None;
        }

        name.extend_from_slice(chunk);

        if flags & SUE_NM_FLAG_CONTINUE != 0 {
            continue;
        }

        break;
    }

    (!name.is_empty()).then_some(name)
}

/// The plain ECMA-119 identifier: special bytes for `.`/`..`, the
/// `;version` suffix stripped, everything lower-cased.
fn record_read_identifier(rec: &RawRecord, out: &mut DirRec) -> bool {
    let ident = rec.identifier();

    if ident.is_empty() {
        return false;
    }

    if ident[0] == CURDIR_NAME_BYTE {
        out.set_name(b".");
        return true;
    }

    if ident[0] == PARDIR_NAME_BYTE {
        out.set_name(b"..");
        return true;
    }

    let mut name = [0u8; MAX_NAME_LEN];
    let mut len = 0;

    for (i, &cur) in ident.iter().enumerate() {
        let next = ident.get(i + 1).copied().unwrap_or(0);

        // A file without an extension
        if cur == b'.' && next == b';' {
            break;
        }

        if cur == b';' {
            break;
        }

        // Assume lowercase for all files
        name[len] = cur.to_ascii_lowercase();
        len += 1;
    }

    out.set_name(&name[..len]);
    true
}

fn get_record_name(inner: &IsoInner, rec: &RawRecord, out: &mut DirRec) -> bool {
    if inner.su_off != NO_SU {
        let su_area = rec.su_area();
        let off = usize::from(inner.su_off).min(su_area.len());
        let su_area = &su_area[off..];

        if su_area.len() > SUE_MIN_LEN {
            if let Some(name) = find_rock_ridge_name(inner, su_area) {
                out.set_name(&name);
                return true;
            }
        }
    }

    record_read_identifier(rec, out)
}

struct IsoDirIter {
    inner: Arc<IsoInner>,
    base_off: u64,
    cur_off: u64,
    size: u64,
}

impl IsoDirIter {
    fn fetch(&mut self) -> Option<RawRecord> {
        let mut cache = self.inner.dir_cache.lock();

        fetch_raw_record(
            &mut cache,
            self.inner.block_shift,
            self.base_off,
            self.size,
            &mut self.cur_off,
        )
    }

    /// A multi-extent file's size accumulates over its whole record
    /// chain; a chain longer than 200 records is rejected as insane.
    fn read_multiext_size(&mut self, total: &mut u64) -> bool {
        for _ in 0..MAX_SANE_CHAIN_LEN {
            let Some(rec) = self.fetch() else {
                return false;
            };

            *total += u64::from(rec.header.data_length());

            if rec.header.flags & ISO9660_MULTI_EXT == 0 {
                return true;
            }
        }

        log::warn!(target: "iso9660", "record chain is too long (>200), ignoring");
        false
    }
}

impl DirIter for IsoDirIter {
    fn next_rec(&mut self, out: &mut DirRec) -> bool {
        loop {
            let Some(rec) = self.fetch() else {
                return false;
            };

            let flags = rec.header.flags;
            out.opaque[0] = u64::from(rec.header.extent_block());
            out.size = u64::from(rec.header.data_length());

            if !get_record_name(&self.inner, &rec, out) {
                return false;
            }

            if flags & ISO9660_MULTI_EXT != 0 {
                let mut total = out.size;
                if !self.read_multiext_size(&mut total) {
                    return false;
                }
                out.size = total;
            }

            if flags & (ISO9660_ASSOC_FILE | ISO9660_HIDDEN) != 0 {
                continue;
            }

            out.flags = if flags & ISO9660_SUBDIR != 0 {
                DirRecFlags::SUBDIR
            } else {
                DirRecFlags::empty()
            };

            return true;
        }
    }
}

struct IsoFile {
    inner: Arc<IsoInner>,
    first_block: u32,
    size: u64,
}

impl FileRead for IsoFile {
    fn size(&self) -> u64 {
        self.size
    }

    fn read(&mut self, buf: &mut [u8], offset: u64) -> CanFail<FsError> {
        if buf.is_empty() {
            return Ok(());
        }

        check_read(self.size, offset, buf.len())?;

        let final_offset = (u64::from(self.first_block) << self.inner.block_shift) + offset;

        self.inner
            .io
            .read(self.inner.disk.handle, buf, final_offset)
            .map_err(FsError::from)
    }
}

pub struct IsoFilesystem {
    inner: Arc<IsoInner>,
}

impl FileSystem for IsoFilesystem {
    fn disk(&self) -> &Disk {
        &self.inner.disk
    }

    fn open_dir(&self, rec: Option<&DirRec>) -> Box<dyn DirIter> {
        let (first_block, size) = match rec {
            None => (u64::from(self.inner.root_block), u64::from(self.inner.root_size)),
            Some(rec) => (rec.opaque[0], rec.size),
        };

        Box::new(IsoDirIter {
            inner: self.inner.clone(),
            base_off: first_block << self.inner.block_shift,
            cur_off: 0,
            size,
        })
    }

    fn open_file(&self, rec: &DirRec) -> Option<File> {
        Some(Box::new(IsoFile {
            inner: self.inner.clone(),
            first_block: rec.opaque[0] as u32,
            size: rec.size,
        }))
    }
}

/// Discovers the `SP` entry on the first record of the root directory and
/// returns the System Use offset it announces, or [`NO_SU`].
fn discover_su_offset(
    dir_cache: &mut BlockCache,
    block_shift: u8,
    root_block: u32,
    root_size: u32,
) -> u8 {
    let mut cur_off = 0;

    let Some(rec) = fetch_raw_record(
        dir_cache,
        block_shift,
        u64::from(root_block) << block_shift,
        u64::from(root_size),
        &mut cur_off,
    ) else {
        return NO_SU;
    };

    let su_area = rec.su_area();
    if su_area.len() < SUE_MIN_LEN {
        return NO_SU;
    }

    let mut walk = SuWalk::new(None, su_area);
    let mut entry = [0u8; 255];

    let Some(len) = walk.next_entry(&mut entry) else {
        return NO_SU;
    };
    let sue = &entry[..len];

    // Managed to fetch a valid SUE, but it's not 'SP'
    if su_signature(sue) != su_sig(b'S', b'P') {
        log::warn!(
            target: "iso9660",
            "invalid SUE signature, expected 'SP' got '{}{}', assuming LEN_SKP of 0",
            sue[0] as char, sue[1] as char
        );
        return 0;
    }

    if !sue_validate_version(sue) {
        return NO_SU;
    }

    let cb0 = sue[SUE_SP_CHECK_BYTE0_IDX];
    let cb1 = sue[SUE_SP_CHECK_BYTE1_IDX];

    if cb0 != SUE_SP_CHECK_BYTE0 || cb1 != SUE_SP_CHECK_BYTE1 {
        log::warn!(
            target: "iso9660",
            "invalid SP check bytes {cb0:#04X}{cb1:#04X}, expected 0xBEEF"
        );
        return NO_SU;
    }

    let mut su_off = sue[SUE_SP_LEN_SKP_IDX];
    if su_off > 200 {
        log::warn!(target: "iso9660", "bogus 'SP' LEN_SKP value {su_off}, assuming 0");
        su_off = 0;
    }

    su_off
}

/// Probes `disk` for an ISO9660 filesystem: scans the volume descriptor
/// set from sector 16 until a primary descriptor or the terminator.
pub fn try_create(
    io: &Arc<dyn DiskServices>,
    disk: &Disk,
    bc: &mut BlockCache,
) -> Option<Arc<dyn FileSystem>> {
    // Technically possible and could be valid, but we don't support it
    if disk.block_size() as u64 > LOGICAL_SECTOR_SIZE {
        return None;
    }

    let mut cur_off = LOGICAL_SECTOR_SIZE * SYSTEM_AREA_BLOCKS;

    let pvd: PvdPrefix = loop {
        let vd = bc.slice(cur_off, LOGICAL_SECTOR_SIZE as usize).ok()?;

        if &vd[1..6] != STANDARD_IDENTIFIER {
            return None;
        }

        match vd[0] {
            // We don't check supplementary because we don't support Joliet
            VD_TYPE_PRIMARY => {
                break bytemuck::pod_read_unaligned(&vd[..core::mem::size_of::<PvdPrefix>()])
            }
            VD_TYPE_TERMINATOR => return None,
            _ => cur_off += LOGICAL_SECTOR_SIZE,
        }
    };

    let block_size = get_723(&pvd.logical_block_size_723);
    let block_shift: u8 = match block_size {
        2048 => 11,
        1024 => 10,
        512 => 9,
        _ => {
            log::warn!(target: "iso9660", "invalid block size {block_size}, ignoring");
            return None;
        }
    };

    let root: DirRecordHeader =
        bytemuck::pod_read_unaligned(&pvd.root_directory_entry[..DIR_RECORD_HEADER_SIZE]);

    let volume_size = get_733(&pvd.volume_space_size_733);
    let root_block = root.extent_block();
    let root_size = root.data_length();
    let root_last_block = root_block + root_size.div_ceil(u32::from(block_size));

    if volume_size < root_last_block {
        log::warn!(target: "iso9660", "invalid volume size: {volume_size}");
        return None;
    }

    if root_size == 0 || root_last_block >= volume_size || root_last_block < root_block {
        log::warn!(
            target: "iso9660",
            "invalid root directory, block: {root_block}, size: {root_size}"
        );
        return None;
    }

    let mut dir_cache = BlockCache::new(
        io.clone(),
        disk.handle,
        disk.block_shift,
        DIRECTORY_CACHE_SIZE >> disk.block_shift,
    );
    let ca_cache = BlockCache::new(
        io.clone(),
        disk.handle,
        disk.block_shift,
        CA_CACHE_SIZE >> disk.block_shift,
    );

    let su_off = discover_su_offset(&mut dir_cache, block_shift, root_block, root_size);

    log::info!(
        target: "iso9660",
        "detected with block size {block_size}, volume size {volume_size}"
    );

    Some(Arc::new(IsoFilesystem {
        inner: Arc::new(IsoInner {
            io: io.clone(),
            disk: *disk,
            root_block,
            root_size,
            volume_size,
            block_shift,
            su_off,
            dir_cache: Mutex::new(dir_cache),
            ca_cache: Mutex::new(ca_cache),
        }),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::path;
    use crate::fs::testimg::{build_iso, IsoImage};

    fn mount(image: &IsoImage) -> Arc<dyn FileSystem> {
        let mut sv = crate::disk::testutil::RamDiskServices::new();
        let handle = sv.add_disk(image.data.clone(), 11);
        let io = sv.into_shared();
        let disk = io.disk(0).unwrap();
        let mut bc = BlockCache::new(io.clone(), handle, 11, 2);

        try_create(&io, &disk, &mut bc).expect("iso volume not detected")
    }

    fn list_names(fs: &dyn FileSystem) -> Vec<alloc::string::String> {
        let mut iter = fs.open_dir(None);
        let mut out = Vec::new();
        let mut rec = DirRec::default();

        while iter.next_rec(&mut rec) {
            out.push(rec.name().into());
        }

        out
    }

    #[test]
    fn rock_ridge_names_override_identifiers() {
        let image = build_iso(true);
        let fs = mount(&image);

        // The RR name wins where an NM entry exists; plain records fall
        // back to the lower-cased identifier without the version suffix.
        let names = list_names(&*fs);
        assert!(names.contains(&"README.TXT".into()));
        assert!(names.contains(&"plain.bin".into()));
        assert!(!names.iter().any(|n| n.contains("readme~1")));

        let mut file = path::open(&*fs, "/README.TXT").expect("RR name lookup failed");
        let mut read = alloc::vec![0u8; image.readme_content.len()];
        file.read(&mut read, 0).unwrap();
        assert_eq!(read, image.readme_content);

        // The 8.3 identifier is shadowed by the RR name.
        assert!(path::open(&*fs, "/README~1.TXT").is_none());
        assert!(path::open(&*fs, "/readme~1.txt").is_none());
    }

    #[test]
    fn identifiers_without_rock_ridge() {
        let image = build_iso(false);
        let fs = mount(&image);

        let names = list_names(&*fs);
        assert!(names.contains(&"readme~1.txt".into()));

        let mut file = path::open(&*fs, "/readme~1.txt").unwrap();
        let mut read = alloc::vec![0u8; image.readme_content.len()];
        file.read(&mut read, 0).unwrap();
        assert_eq!(read, image.readme_content);
    }

    #[test]
    fn multi_extent_sizes_accumulate() {
        let image = build_iso(true);
        let fs = mount(&image);

        let mut iter = fs.open_dir(None);
        let mut rec = DirRec::default();
        let mut found = false;

        while iter.next_rec(&mut rec) {
            if rec.name() == "multi.bin" {
                assert_eq!(rec.size, image.multi_content.len() as u64);
                found = true;
            }
        }
        assert!(found, "multi-extent file not listed");

        let mut file = path::open(&*fs, "/multi.bin").unwrap();
        let mut read = alloc::vec![0u8; image.multi_content.len()];
        file.read(&mut read, 0).unwrap();
        assert_eq!(read, image.multi_content);
    }

    #[test]
    fn file_reads_are_bounds_checked() {
        let image = build_iso(true);
        let fs = mount(&image);

        let mut file = path::open(&*fs, "/README.TXT").unwrap();
        let mut buf = [0u8; 32];
        assert!(file.read(&mut buf, image.readme_content.len() as u64).is_err());
    }
}

//! Fixed-size block cache with zero-copy references.
//!
//! A [`BlockCache`] is bound to one disk and owns a single window of
//! contiguous sectors. Byte-granular reads are satisfied by sliding the
//! window; callers that want to avoid the copy borrow straight into the
//! window with [`BlockCache::slice`]. While such a borrow is alive the
//! window cannot be repositioned, which the borrow checker enforces for us.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use crate::disk::{DiskHandle, DiskServices};
use crate::errors::{CanFail, DiskError};

pub struct BlockCache {
    io: Arc<dyn DiskServices>,
    handle: DiskHandle,

    buf: Vec<u8>,
    cache_block_cap: usize,
    cache_base: u64,

    block_shift: u8,
    empty: bool,
    direct_io: bool,
}

/// Byte request translated into block coordinates.
struct BlockCoords {
    base_block: u64,
    byte_off: usize,
    block_count: usize,
}

impl BlockCache {
    /// Creates a cache of `block_cap` sectors over the given disk.
    pub fn new(
        io: Arc<dyn DiskServices>,
        handle: DiskHandle,
        block_shift: u8,
        block_cap: usize,
    ) -> Self {
        assert!(block_cap != 0);

        Self {
            io,
            handle,
            buf: vec![0; block_cap << block_shift],
            cache_block_cap: block_cap,
            cache_base: 0,
            block_shift,
            empty: true,
            direct_io: false,
        }
    }

    /// Allows oversized [`read_blocks`](Self::read_blocks) requests to go
    /// straight to the device instead of through the window.
    pub fn enable_direct_io(&mut self) {
        self.direct_io = true;
    }

    pub fn block_size(&self) -> usize {
        1usize << self.block_shift
    }

    /// Repositions the window to `cache_block_cap` sectors starting at
    /// `base_block`. Marks the cache empty on a failed read.
    pub fn refill(&mut self, base_block: u64) -> CanFail<DiskError> {
        // Already cached at this base
        if self.cache_base == base_block && !self.empty {
            return Ok(());
        }

        if let Err(err) = self.io.read_blocks(self.handle, &mut self.buf, base_block) {
            self.empty = true;
            return Err(err);
        }

        self.empty = false;
        self.cache_base = base_block;
        Ok(())
    }

    fn coords_for(&self, byte_off: u64, byte_count: usize) -> BlockCoords {
        debug_assert!(byte_count != 0);

        let block_size = self.block_size();
        let in_block_off = (byte_off as usize) & (block_size - 1);
        let span = in_block_off + byte_count + (block_size - 1);

        BlockCoords {
            base_block: byte_off >> self.block_shift,
            byte_off: in_block_off,
            block_count: span >> self.block_shift,
        }
    }

    /// Offset of `block` inside the current window, along with how many
    /// cached blocks follow it. `None` if the block is not in the window.
    fn cached_span(&self, block: u64) -> Option<(usize, usize)> {
        if self.empty || block < self.cache_base {
            return None;
        }

        let off = (block - self.cache_base) as usize;
        if off >= self.cache_block_cap {
            return None;
        }

        Some((off, self.cache_block_cap - off))
    }

    /// Copies as much of the request as the current window covers.
    /// Returns the number of bytes consumed from `out`.
    fn complete_from_window(&self, coords: &mut BlockCoords, out: &mut [u8]) -> usize {
        let Some((window_off, window_blocks)) = self.cached_span(coords.base_block) else {
            return 0;
        };

        let blocks = window_blocks.min(coords.block_count);
        let avail = (blocks << self.block_shift) - coords.byte_off;
        let bytes = avail.min(out.len());
        let src = (window_off << self.block_shift) + coords.byte_off;

        out[..bytes].copy_from_slice(&self.buf[src..src + bytes]);

        coords.base_block += blocks as u64;
        coords.block_count -= blocks;
        coords.byte_off = 0;

        bytes
    }

    fn exec_request(&mut self, mut coords: BlockCoords, mut out: &mut [u8]) -> CanFail<DiskError> {
        loop {
            let copied = self.complete_from_window(&mut coords, out);
            let rest = out;
            out = &mut rest[copied..];

            if out.is_empty() {
                return Ok(());
            }

            self.refill(coords.base_block)?;
        }
    }

    /// Satisfies an unaligned byte read through the window, one window's
    /// worth of data at a time.
    pub fn read(&mut self, out: &mut [u8], byte_off: u64) -> CanFail<DiskError> {
        if out.is_empty() {
            return Ok(());
        }

        let coords = self.coords_for(byte_off, out.len());
        self.exec_request(coords, out)
    }

    /// Reads whole sectors. Requests larger than the window go straight to
    /// the disk when direct I/O is permitted, with the windowed path as the
    /// fallback (the direct read may fail on alignment or count limits).
    pub fn read_blocks(&mut self, out: &mut [u8], first_block: u64) -> CanFail<DiskError> {
        let count = out.len() >> self.block_shift;
        debug_assert_eq!(out.len() & (self.block_size() - 1), 0);

        if count > self.cache_block_cap
            && self.direct_io
            && self.io.read_blocks(self.handle, out, first_block).is_ok()
        {
            return Ok(());
        }

        let coords = BlockCoords {
            base_block: first_block,
            byte_off: 0,
            block_count: count,
        };

        self.exec_request(coords, out)
    }

    /// Returns a zero-copy reference into the window covering `count` bytes
    /// at `byte_off`. The request must fit in the window.
    ///
    /// The returned borrow pins the window: no repositioning is possible
    /// until it is dropped.
    pub fn slice(&mut self, byte_off: u64, count: usize) -> Result<&[u8], DiskError> {
        let coords = self.coords_for(byte_off, count);

        // Request too large
        assert!(coords.block_count <= self.cache_block_cap);

        // Fast path if this range is already entirely cached
        if let Some((window_off, window_blocks)) = self.cached_span(coords.base_block) {
            if window_blocks >= coords.block_count {
                let start = (window_off << self.block_shift) + coords.byte_off;
                return Ok(&self.buf[start..start + count]);
            }
        }

        self.refill(coords.base_block)?;
        Ok(&self.buf[coords.byte_off..coords.byte_off + count])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::testutil::RamDiskServices;

    fn cache_over(data: Vec<u8>, block_shift: u8, block_cap: usize) -> BlockCache {
        let mut sv = RamDiskServices::new();
        let handle = sv.add_disk(data, block_shift);
        BlockCache::new(sv.into_shared(), handle, block_shift, block_cap)
    }

    fn patterned(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn unaligned_read_crosses_windows() {
        let data = patterned(512 * 64);
        let mut bc = cache_over(data.clone(), 9, 4);

        let mut out = vec![0u8; 5000];
        bc.read(&mut out, 700).unwrap();
        assert_eq!(out[..], data[700..5700]);
    }

    #[test]
    fn read_blocks_larger_than_window() {
        let data = patterned(512 * 64);
        let mut bc = cache_over(data.clone(), 9, 2);
        bc.enable_direct_io();

        let mut out = vec![0u8; 512 * 16];
        bc.read_blocks(&mut out, 8).unwrap();
        assert_eq!(out[..], data[512 * 8..512 * 24]);
    }

    #[test]
    fn slice_is_zero_copy_and_stable() {
        let data = patterned(512 * 16);
        let mut bc = cache_over(data.clone(), 9, 4);

        let s = bc.slice(1000, 300).unwrap();
        assert_eq!(s, &data[1000..1300]);

        // A second request inside the same window must not reposition it.
        let base_before = bc.cache_base;
        let s = bc.slice(1024, 100).unwrap();
        assert_eq!(s, &data[1024..1124]);
        assert_eq!(bc.cache_base, base_before);
    }

    #[test]
    fn read_past_end_fails_and_marks_empty() {
        let data = patterned(512 * 4);
        let mut bc = cache_over(data, 9, 4);

        let mut out = [0u8; 512];
        assert!(bc.read(&mut out, 512 * 100).is_err());
        assert!(bc.empty);
    }

    #[test]
    fn round_trip_split_reads() {
        let data = patterned(512 * 8);
        let mut bc = cache_over(data.clone(), 9, 2);

        for k in [0usize, 1, 511, 512, 513, 2048, 4095] {
            let mut head = vec![0u8; k];
            let mut tail = vec![0u8; data.len() - k];
            bc.read(&mut head, 0).unwrap();
            bc.read(&mut tail, k as u64).unwrap();

            let mut all = head;
            all.extend_from_slice(&tail);
            assert_eq!(all, data);
        }
    }
}

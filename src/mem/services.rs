//! The allocator over the memory map, and the one-way release transition.
//!
//! [`MemoryServices`] owns the authoritative map. Allocations carve typed
//! ranges out of free entries; frees carve free ranges back out of
//! loader-owned ones. [`MemoryServices::release_resources`] hands the final
//! map to the boot protocol and flips the service offline: every entry
//! point checks that state and a use-after-release is a bug, not an error.

use alloc::vec::Vec;

use bitflags::bitflags;

use crate::mem::map::{self, FixupFlags, KnownTypes, MemoryMapEntry, MemoryType};
use crate::mem::{MB, PAGE_SHIFT, PAGE_SIZE};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct AllocFlags: u8 {
        /// The range must start exactly at `AllocationSpec::addr`.
        const PRECISE = 1 << 0;

        /// Failure to satisfy the allocation is fatal.
        const CRITICAL = 1 << 1;
    }
}

/// A single allocation request.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllocationSpec {
    /// First byte of the range for `PRECISE` allocations, ignored otherwise.
    pub addr: u64,

    /// Number of 4096-byte pages.
    pub pages: u64,

    /// 1 + maximum allowed address within the allocated range.
    /// Zero means the default 4 GiB ceiling.
    pub ceiling: u64,

    /// Range type; `None` picks the current default allocation type.
    pub kind: Option<MemoryType>,

    pub flags: AllocFlags,
}

pub struct MemoryServices {
    entries: Vec<MemoryMapEntry>,
    known: KnownTypes,
    default_alloc_type: MemoryType,
    dirty: bool,
    released: bool,
}

impl MemoryServices {
    /// Builds the service from a raw firmware memory map. The buffer may be
    /// unsorted and overlapping; it is fixed up on the spot.
    pub fn from_firmware_map(mut entries: Vec<MemoryMapEntry>) -> Self {
        map::fixup(
            &mut entries,
            &KnownTypes::default(),
            FixupFlags::UNSORTED | FixupFlags::OVERLAP_RESOLVE,
            true,
        );

        Self {
            entries,
            known: KnownTypes::default(),
            default_alloc_type: MemoryType::RESERVED,
            dirty: false,
            released: false,
        }
    }

    /// Declares the memory types the active boot protocol understands.
    /// The map is lazily re-resolved on the next fixup if the set changed.
    pub fn declare_known_types(&mut self, types: &[MemoryType]) {
        let new = KnownTypes::declare(types);

        if new != self.known {
            self.known = new;
            self.dirty = true;
        }
    }

    /// Sets the type used when an allocation does not name one.
    /// Returns the previous default.
    pub fn set_default_alloc_type(&mut self, kind: MemoryType) -> MemoryType {
        core::mem::replace(&mut self.default_alloc_type, kind)
    }

    fn ensure_online(&self, func: &str) {
        assert!(!self.released, "use-after-release: {func}()");
    }

    /// Read-only view of the current map.
    pub fn entries(&self) -> &[MemoryMapEntry] {
        self.ensure_online("entries");
        &self.entries
    }

    /// The address of the last byte of the last entry in the map + 1.
    pub fn highest_map_address(&self) -> u64 {
        self.ensure_online("highest_map_address");
        self.entries.last().map_or(0, MemoryMapEntry::end)
    }

    /// Re-resolves entry types against the currently known set and
    /// re-establishes the map invariants.
    pub fn fixup(&mut self, flags: FixupFlags) {
        self.ensure_online("fixup");
        map::fixup(&mut self.entries, &self.known, flags, self.dirty);
        self.dirty = false;
    }

    /// Index of the entry containing `value`, walking from the top.
    /// With `allow_one_above`, falls back to the first entry above it.
    fn first_range_that_contains(&self, value: u64, allow_one_above: bool) -> Option<usize> {
        let mut index = self.entries.len();

        while index > 0 {
            index -= 1;
            let entry = &self.entries[index];

            if entry.end() <= value {
                // Everything below ends before `value`.
                return (allow_one_above && index != self.entries.len() - 1).then_some(index + 1);
            }

            if entry.physical_address <= value {
                return Some(index);
            }
        }

        (allow_one_above && !self.entries.is_empty()).then_some(0)
    }

    /// Replaces part of `self.entries[index]` with `carved`, splitting the
    /// original into up to three ranges and re-merging the neighborhood.
    fn carve_out_of(&mut self, carved: &MemoryMapEntry, index: usize, invert_priority: bool) {
        let original = self.entries[index];
        let parts = map::shatter(&original, carved, invert_priority);
        let mut cursor = index;

        for part in parts {
            if part.is_empty() {
                continue;
            }

            if part.kind.is_free() && part.size_in_bytes < PAGE_SIZE {
                continue;
            }

            if cursor == index {
                self.entries[cursor] = part;
            } else {
                self.entries.insert(cursor, part);
            }

            cursor += 1;
        }

        assert!(cursor != index, "carve produced no ranges");

        // Shatter may leave trivially mergeable neighbors, correct them.
        map::correct_overlapping(&mut self.entries, index.saturating_sub(1), true);
    }

    fn on_invalid_allocation(page_count: u64, lower_limit: u64, upper_limit: u64) -> ! {
        panic!(
            "invalid allocation of {page_count} pages within {lower_limit:#018X} -> {upper_limit:#018X}"
        );
    }

    fn allocate_within(
        &mut self,
        page_count: u64,
        lower_limit: u64,
        upper_limit: u64,
        kind: MemoryType,
    ) -> Option<u64> {
        let bytes = page_count.checked_shl(PAGE_SHIFT).filter(|&b| b != 0)?;

        self.ensure_online("allocate_within");

        if lower_limit >= upper_limit
            || lower_limit.checked_add(bytes).is_none()
            || lower_limit + bytes > upper_limit
        {
            Self::on_invalid_allocation(page_count, lower_limit, upper_limit);
        }

        let mut index = self.first_range_that_contains(lower_limit, true)?;

        let picked = loop {
            if index == self.entries.len() {
                return None;
            }

            let entry = &self.entries[index];

            if entry.physical_address >= upper_limit {
                return None;
            }

            let usable = if entry.kind.is_free() {
                entry.end().min(upper_limit) - entry.physical_address.max(lower_limit)
            } else {
                0
            };

            if usable >= bytes {
                break entry;
            }

            if entry.end() >= upper_limit || (upper_limit - entry.end()) < bytes {
                return None;
            }

            index += 1;
        };

        let begin = lower_limit.max(picked.physical_address);
        let carved = MemoryMapEntry::new(begin, bytes, kind);
        self.carve_out_of(&carved, index, false);

        Some(begin)
    }

    /// Allocates `count` pages at the exact page-aligned `address`.
    /// Fails if any part of the range is not currently free.
    pub fn allocate_pages_at(
        &mut self,
        address: u64,
        count: u64,
        kind: MemoryType,
    ) -> Option<u64> {
        self.allocate_within(count, address, address + (count << PAGE_SHIFT), kind)
    }

    /// Allocates `count` pages anywhere below `upper_limit`, scanning free
    /// ranges bottom-up starting at 1 MiB.
    pub fn allocate_pages(&mut self, count: u64, upper_limit: u64, kind: MemoryType) -> Option<u64> {
        self.allocate_within(count, MB, upper_limit, kind)
    }

    /// The full-option allocation entry point. `CRITICAL` requests panic
    /// instead of returning `None`.
    pub fn allocate(&mut self, spec: &AllocationSpec) -> Option<u64> {
        let kind = spec.kind.unwrap_or(self.default_alloc_type);
        let ceiling = if spec.ceiling == 0 {
            4 * crate::mem::GB
        } else {
            spec.ceiling
        };

        let result = if spec.flags.contains(AllocFlags::PRECISE) {
            self.allocate_pages_at(spec.addr, spec.pages, kind)
        } else {
            self.allocate_pages(spec.pages, ceiling, kind)
        };

        if result.is_none() {
            if spec.flags.contains(AllocFlags::CRITICAL) {
                panic!(
                    "failed to satisfy a critical allocation at {} with {} pages of type {:#010X}",
                    if spec.flags.contains(AllocFlags::PRECISE) {
                        alloc::format!("{:#018X}", spec.addr)
                    } else {
                        alloc::format!("<any-address>")
                    },
                    spec.pages,
                    kind.0
                );
            }

            log::warn!(
                target: "mm",
                "failed to satisfy an allocation of {} pages of type {:#010X}",
                spec.pages, kind.0
            );
        }

        result
    }

    /// Marks `count` pages starting at `address` free again. The range must
    /// lie entirely within one loader-allocated entry.
    pub fn free_pages(&mut self, address: u64, count: u64) {
        self.ensure_online("free_pages");

        let freed = MemoryMapEntry::new(address, count << PAGE_SHIFT, MemoryType::FREE);

        let index = self
            .first_range_that_contains(address, false)
            .unwrap_or_else(|| panic!("invalid free at {address:#018X}, {count} pages"));

        let owner = &self.entries[index];
        if freed.physical_address < owner.physical_address || freed.end() > owner.end() {
            panic!("invalid free at {address:#018X}, {count} pages");
        }

        self.carve_out_of(&freed, index, true);
    }

    /// Terminal operation: hands the final map to the caller.
    ///
    /// `capacity` is the number of entries the caller has room for; when it
    /// is insufficient, the required count is returned and nothing else
    /// happens. Otherwise `write` is invoked once per entry (in map order)
    /// and the service goes offline: any later service call panics.
    pub fn release_resources(
        &mut self,
        capacity: usize,
        mut write: impl FnMut(usize, &MemoryMapEntry),
    ) -> usize {
        self.ensure_online("release_resources");

        let count = self.entries.len();
        if capacity < count {
            return count;
        }

        for (index, entry) in self.entries.iter().enumerate() {
            write(index, entry);
        }

        self.released = true;
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    fn services_with_free(base: u64, size: u64) -> MemoryServices {
        MemoryServices::from_firmware_map(vec![MemoryMapEntry::new(
            base,
            size,
            MemoryType::FREE,
        )])
    }

    #[test]
    fn bottom_up_first_fit() {
        let mut ms = MemoryServices::from_firmware_map(vec![
            MemoryMapEntry::new(0x10_0000, 0x10000, MemoryType::FREE),
            MemoryMapEntry::new(0x20_0000, 0x10000, MemoryType::FREE),
        ]);

        let addr = ms
            .allocate_pages(2, 4 * crate::mem::GB, MemoryType::LOADER_RECLAIMABLE)
            .unwrap();
        assert_eq!(addr, 0x10_0000);

        // The free entry shrank accordingly.
        assert_eq!(
            ms.entries()[0],
            MemoryMapEntry::new(0x10_0000, 0x2000, MemoryType::LOADER_RECLAIMABLE)
        );
        assert_eq!(
            ms.entries()[1],
            MemoryMapEntry::new(0x10_2000, 0xE000, MemoryType::FREE)
        );
    }

    #[test]
    fn ceiling_is_respected() {
        let mut ms = MemoryServices::from_firmware_map(vec![
            MemoryMapEntry::new(0x10_0000, 0x1000, MemoryType::FREE),
            MemoryMapEntry::new(0x4000_0000, 0x100000, MemoryType::FREE),
        ]);

        // Only the high range fits 4 pages, but it's above the ceiling.
        assert_eq!(
            ms.allocate_pages(4, 0x2000_0000, MemoryType::LOADER_RECLAIMABLE),
            None
        );
    }

    #[test]
    fn exact_allocation_requires_free_range() {
        let mut ms = MemoryServices::from_firmware_map(vec![
            MemoryMapEntry::new(0x10_0000, 0x10000, MemoryType::FREE),
            MemoryMapEntry::new(0x11_0000, 0x1000, MemoryType::RESERVED),
        ]);

        assert_eq!(
            ms.allocate_pages_at(0x10_8000, 2, MemoryType::LOADER_RECLAIMABLE),
            Some(0x10_8000)
        );

        // Partially reserved: must fail.
        assert_eq!(
            ms.allocate_pages_at(0x10_F000, 2, MemoryType::LOADER_RECLAIMABLE),
            None
        );
    }

    #[test]
    fn allocation_round_trip_restores_map() {
        let mut ms = services_with_free(0x10_0000, 0x100000);
        let before = ms.entries().to_vec();

        let addr = ms
            .allocate_pages(8, 4 * crate::mem::GB, MemoryType::LOADER_RECLAIMABLE)
            .unwrap();
        ms.free_pages(addr, 8);

        assert_eq!(ms.entries(), &before[..]);
    }

    #[test]
    fn middle_allocation_splits_into_three() {
        let mut ms = services_with_free(0x10_0000, 0x10000);

        let addr = ms
            .allocate_pages_at(0x10_4000, 2, MemoryType::LOADER_RECLAIMABLE)
            .unwrap();
        assert_eq!(addr, 0x10_4000);

        assert_eq!(
            ms.entries(),
            &[
                MemoryMapEntry::new(0x10_0000, 0x4000, MemoryType::FREE),
                MemoryMapEntry::new(0x10_4000, 0x2000, MemoryType::LOADER_RECLAIMABLE),
                MemoryMapEntry::new(0x10_6000, 0xA000, MemoryType::FREE),
            ]
        );

        // Freeing merges everything back together.
        ms.free_pages(addr, 2);
        assert_eq!(
            ms.entries(),
            &[MemoryMapEntry::new(0x10_0000, 0x10000, MemoryType::FREE)]
        );
    }

    #[test]
    fn release_reports_required_capacity_first() {
        let mut ms = services_with_free(0x10_0000, 0x10000);
        ms.allocate_pages_at(0x10_4000, 1, MemoryType::LOADER_RECLAIMABLE)
            .unwrap();

        let needed = ms.release_resources(0, |_, _| unreachable!());
        assert_eq!(needed, 3);

        let mut written = vec![];
        let count = ms.release_resources(needed, |_, e| written.push(*e));
        assert_eq!(count, 3);
        assert_eq!(written.len(), 3);
    }

    #[test]
    #[should_panic(expected = "use-after-release")]
    fn service_call_after_release_panics() {
        let mut ms = services_with_free(0x10_0000, 0x10000);
        ms.release_resources(64, |_, _| {});
        ms.allocate_pages(1, 4 * crate::mem::GB, MemoryType::LOADER_RECLAIMABLE);
    }

    #[test]
    fn critical_allocation_failure_panics() {
        let mut ms = services_with_free(0x10_0000, 0x1000);

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            ms.allocate(&AllocationSpec {
                pages: 128,
                flags: AllocFlags::CRITICAL,
                ..Default::default()
            })
        }));

        assert!(result.is_err());
    }
}

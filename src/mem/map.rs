//! The authoritative physical memory map.
//!
//! Entries are kept sorted by ascending base, non-overlapping, with
//! adjacent entries of identical type coalesced and every free entry
//! page-aligned in both base and size. [`fixup`] establishes those
//! invariants over a raw firmware-provided buffer and re-establishes them
//! after every mutation that could break them.

use alloc::vec::Vec;

use bitflags::bitflags;

use crate::mem::{align_down, PAGE_SIZE};

/// Typed memory range classification.
///
/// The numeric ordering is load-bearing: overlap resolution assigns the
/// disputed bytes to the *higher* value, so the enumeration must stay
/// monotonic in "importance". Values 1..=7 mirror the ACPI address range
/// types; everything at or above [`MemoryType::PROTO_SPECIFIC_BASE`] belongs
/// to the active boot protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MemoryType(pub u64);

impl MemoryType {
    pub const INVALID: Self = Self(0x0000_0000);
    pub const FREE: Self = Self(0x0000_0001);
    pub const RESERVED: Self = Self(0x0000_0002);
    pub const ACPI_RECLAIMABLE: Self = Self(0x0000_0003);
    pub const NVS: Self = Self(0x0000_0004);
    pub const UNUSABLE: Self = Self(0x0000_0005);
    pub const DISABLED: Self = Self(0x0000_0006);
    pub const PERSISTENT: Self = Self(0x0000_0007);
    pub const MAX_STANDARD: Self = Self::PERSISTENT;

    /// All memory allocated by the loader is marked with this by default;
    /// the real underlying type is of course free.
    pub const LOADER_RECLAIMABLE: Self = Self(0xFFFE_FFFF);

    /// All custom protocol-specific memory types start at this base.
    pub const PROTO_SPECIFIC_BASE: Self = Self(0xFFFF_0000);

    pub fn is_free(self) -> bool {
        self == Self::FREE
    }

    pub fn as_str(self) -> &'static str {
        match self.0 {
            0x0000_0000 => "<invalid>",
            0x0000_0001 => "free",
            0x0000_0002 => "reserved",
            0x0000_0003 => "ACPI-reclaim",
            0x0000_0004 => "NVS",
            0x0000_0005 => "unusable",
            0x0000_0006 => "disabled",
            0x0000_0007 => "persistent",
            0xFFFE_FFFF => "loader-reclaim",
            _ => "<proto-specific>",
        }
    }
}

/// One range of the physical memory map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryMapEntry {
    pub physical_address: u64,
    pub size_in_bytes: u64,
    pub kind: MemoryType,
}

impl MemoryMapEntry {
    pub fn new(physical_address: u64, size_in_bytes: u64, kind: MemoryType) -> Self {
        Self {
            physical_address,
            size_in_bytes,
            kind,
        }
    }

    pub fn end(&self) -> u64 {
        self.physical_address + self.size_in_bytes
    }

    pub(super) fn is_empty(&self) -> bool {
        self.size_in_bytes == 0
    }

    /// A free entry below one page is useless to everyone; drop it.
    pub(super) fn is_valid(&self) -> bool {
        if self.size_in_bytes == 0 {
            return false;
        }

        if !self.kind.is_free() {
            return true;
        }

        self.size_in_bytes >= PAGE_SIZE
    }

    /// Shrinks a free entry to page granularity (base rounded up, length
    /// truncated). Non-free entries are left alone, we are not going to
    /// hand them out anyway.
    pub(super) fn align_if_needed(&mut self) {
        if !self.kind.is_free() {
            return;
        }

        let remainder = self.physical_address % PAGE_SIZE;
        let aligned_begin = if remainder != 0 {
            self.physical_address + (PAGE_SIZE - remainder)
        } else {
            self.physical_address
        };

        if aligned_begin >= self.end() {
            *self = Self::new(0, 0, self.kind);
            return;
        }

        let length = align_down(self.end() - aligned_begin, PAGE_SIZE);
        self.physical_address = aligned_begin;
        self.size_in_bytes = length;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FixupFlags: u8 {
        const UNSORTED = 1 << 0;
        const IF_DIRTY = 1 << 1;
        const OVERLAP_RESOLVE = 1 << 2;
        const NO_PRESERVE_LOADER_RECLAIM = 1 << 3;
    }
}

/// The set of memory types the active boot protocol understands.
///
/// Types it does not understand get downgraded to reserved during fixup;
/// loader-reclaimable memory downgrades all the way to free, since an
/// unaware kernel may reuse it immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KnownTypes {
    standard_mask: u32,
    loader_reclaim: bool,
}

impl Default for KnownTypes {
    fn default() -> Self {
        // Until a protocol declares itself, everything standard is known.
        Self {
            standard_mask: 0xFFFF_FFFF,
            loader_reclaim: true,
        }
    }
}

impl KnownTypes {
    pub fn declare(types: &[MemoryType]) -> Self {
        let mut new = Self {
            standard_mask: 0,
            loader_reclaim: false,
        };

        for &ty in types {
            if ty == MemoryType::INVALID {
                break;
            }

            if ty == MemoryType::LOADER_RECLAIMABLE {
                new.loader_reclaim = true;
                continue;
            }

            assert!(ty <= MemoryType::MAX_STANDARD);
            new.standard_mask |= 1 << ty.0;
        }

        // These must always be set
        assert!(new.knows(MemoryType::FREE) && new.knows(MemoryType::RESERVED));
        new
    }

    fn knows(&self, ty: MemoryType) -> bool {
        self.standard_mask & (1 << ty.0) != 0
    }

    fn resolve(&self, ty: MemoryType, preserve_loader_reclaim: bool) -> MemoryType {
        if ty >= MemoryType::PROTO_SPECIFIC_BASE {
            return ty;
        }

        if ty == MemoryType::LOADER_RECLAIMABLE {
            if self.loader_reclaim || preserve_loader_reclaim {
                return ty;
            }

            return MemoryType::FREE;
        }

        assert!(ty <= MemoryType::MAX_STANDARD, "bogus memory type {ty:?}");

        if self.knows(ty) {
            ty
        } else {
            MemoryType::RESERVED
        }
    }
}

/// Overlap resolution between two ranges, the first of which starts at or
/// before the second. Produces up to three replacement ranges in ascending
/// order.
///
/// - The winning range is determined by its type: the higher value wins
///   (`invert_priority` flips that, which is how freeing carves a free
///   range out of a loader-owned one).
/// - The loser keeps its non-overlapping parts, if any.
/// - Equal types simply merge.
pub(super) fn shatter(
    lhs: &MemoryMapEntry,
    rhs: &MemoryMapEntry,
    invert_priority: bool,
) -> [MemoryMapEntry; 3] {
    debug_assert!(lhs.physical_address <= rhs.physical_address);
    debug_assert!(rhs.physical_address < lhs.end());

    let empty = MemoryMapEntry::new(0, 0, MemoryType::INVALID);
    let mut out = [empty; 3];

    // cut out the overlapping piece by default
    out[0] = MemoryMapEntry::new(
        lhs.physical_address,
        rhs.physical_address - lhs.physical_address,
        lhs.kind,
    );

    // both ranges have the same type, so we can just merge them
    if lhs.kind == rhs.kind {
        out[0].size_in_bytes = lhs.end().max(rhs.end()) - lhs.physical_address;
        return out;
    }

    // other range is fully inside this range
    if rhs.end() <= lhs.end() {
        out[2] = MemoryMapEntry::new(rhs.end(), lhs.end() - rhs.end(), lhs.kind);
    }

    if lhs.kind > rhs.kind && !invert_priority {
        // we cut out the overlapping piece of the other range and keep it
        out[0].size_in_bytes = lhs.end() - lhs.physical_address;

        if lhs.end() <= rhs.end() {
            out[1] = MemoryMapEntry::new(lhs.end(), rhs.end() - lhs.end(), rhs.kind);
        } else {
            // we swallowed the other range entirely
            out[2] = empty;
        }
    } else {
        // our overlapping piece gets cut out and put into the other range
        out[1] = *rhs;
    }

    out
}

fn trivially_mergeable(lhs: &MemoryMapEntry, rhs: &MemoryMapEntry) -> bool {
    lhs.end() == rhs.physical_address && lhs.kind == rhs.kind
}

/// 99% of firmwares return a sorted memory map, which insertion sort
/// handles at O(N). Maps are 10-20 entries, so the worst case is fine too.
pub(super) fn sort(entries: &mut [MemoryMapEntry]) {
    for i in 1..entries.len() {
        let mut j = i;

        while j > 0 && entries[j].physical_address < entries[j - 1].physical_address {
            entries.swap(j, j - 1);
            j -= 1;
        }
    }
}

/// Re-establishes the map invariants starting at index `first`: resolves
/// overlaps (higher type wins), coalesces trivially mergeable neighbors,
/// re-aligns free fragments and drops the ones below a page.
///
/// Because the winner's type may propagate into slot `i`, the cursor walks
/// one step backwards after a resolution to re-examine the previous pair.
pub(super) fn correct_overlapping(
    entries: &mut Vec<MemoryMapEntry>,
    first: usize,
    resolve_allowed: bool,
) {
    let mut i = first;

    while i + 1 < entries.len() {
        let cur = entries[i];
        let next = entries[i + 1];

        if trivially_mergeable(&cur, &next) {
            entries[i].size_in_bytes = next.end() - cur.physical_address;
            entries.remove(i + 1);
            continue;
        }

        if cur.end() <= next.physical_address {
            i += 1;
            continue;
        }

        assert!(
            resolve_allowed,
            "unexpected overlap: {:#018X} -> {:#018X} ({}) vs {:#018X} -> {:#018X} ({})",
            cur.physical_address,
            cur.end(),
            cur.kind.as_str(),
            next.physical_address,
            next.end(),
            next.kind.as_str()
        );

        log::warn!(
            target: "mm",
            "detected overlapping physical ranges: {:#018X} -> {:#018X} ({}) / {:#018X} -> {:#018X} ({})",
            cur.physical_address, cur.end(), cur.kind.as_str(),
            next.physical_address, next.end(), next.kind.as_str()
        );

        let parts = shatter(&cur, &next, false);
        let mut kept = [MemoryMapEntry::new(0, 0, MemoryType::INVALID); 3];
        let mut kept_count = 0;

        for mut part in parts {
            if part.is_empty() {
                continue;
            }

            if part.kind.is_free() {
                part.align_if_needed();

                if part.size_in_bytes < PAGE_SIZE {
                    continue;
                }
            }

            kept[kept_count] = part;
            kept_count += 1;
        }

        assert!(kept_count != 0);

        entries[i] = kept[0];
        match kept_count {
            1 => {
                entries.remove(i + 1);
            }
            2 => entries[i + 1] = kept[1],
            _ => {
                entries[i + 1] = kept[1];
                entries.insert(i + 2, kept[2]);
            }
        }

        // walk backwards one step, because the type of entries[i] could
        // have changed, so there is a chance we can merge i and i - 1
        i = i.saturating_sub(1);
    }
}

/// Turns a possibly-unsorted, possibly-overlapping firmware buffer into a
/// valid memory map. Returns the map untouched when `IF_DIRTY` is passed
/// and `dirty` is unset.
pub fn fixup(
    entries: &mut Vec<MemoryMapEntry>,
    known: &KnownTypes,
    flags: FixupFlags,
    dirty: bool,
) {
    assert!(!entries.is_empty());

    if flags.contains(FixupFlags::UNSORTED) {
        sort(entries);
    }

    if flags.contains(FixupFlags::IF_DIRTY) && !dirty {
        return;
    }

    let preserve_reclaim = !flags.contains(FixupFlags::NO_PRESERVE_LOADER_RECLAIM);

    entries.retain_mut(|entry| {
        entry.kind = known.resolve(entry.kind, preserve_reclaim);
        entry.align_if_needed();
        entry.is_valid()
    });

    correct_overlapping(entries, 0, flags.contains(FixupFlags::OVERLAP_RESOLVE));
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    fn entry(base: u64, size: u64, kind: MemoryType) -> MemoryMapEntry {
        MemoryMapEntry::new(base, size, kind)
    }

    fn assert_invariants(entries: &[MemoryMapEntry]) {
        for w in entries.windows(2) {
            assert!(w[0].physical_address < w[1].physical_address);
            assert!(w[0].end() <= w[1].physical_address, "overlap left behind");
            assert!(
                !(w[0].end() == w[1].physical_address && w[0].kind == w[1].kind),
                "unmerged neighbors"
            );
        }

        for e in entries {
            if e.kind.is_free() {
                assert_eq!(e.physical_address % PAGE_SIZE, 0);
                assert_eq!(e.size_in_bytes % PAGE_SIZE, 0);
                assert!(e.size_in_bytes >= PAGE_SIZE);
            }
        }
    }

    #[test]
    fn unsorted_input_is_sorted_and_merged() {
        let mut map = vec![
            entry(0x8000, 0x1000, MemoryType::FREE),
            entry(0x0, 0x4000, MemoryType::FREE),
            entry(0x4000, 0x4000, MemoryType::FREE),
        ];

        fixup(
            &mut map,
            &KnownTypes::default(),
            FixupFlags::UNSORTED | FixupFlags::OVERLAP_RESOLVE,
            true,
        );

        assert_eq!(map, vec![entry(0x0, 0x9000, MemoryType::FREE)]);
    }

    #[test]
    fn higher_type_wins_overlap() {
        // reserved [0x0, 0x1000) vs ACPI-reclaim [0x800, 0x2800)
        let mut map = vec![
            entry(0x0, 0x1000, MemoryType::RESERVED),
            entry(0x800, 0x2000, MemoryType::ACPI_RECLAIMABLE),
        ];

        fixup(
            &mut map,
            &KnownTypes::default(),
            FixupFlags::OVERLAP_RESOLVE,
            true,
        );

        assert_eq!(
            map,
            vec![
                entry(0x0, 0x800, MemoryType::RESERVED),
                entry(0x800, 0x2000, MemoryType::ACPI_RECLAIMABLE),
            ]
        );
        assert_invariants(&map);
    }

    #[test]
    fn lower_type_loses_and_keeps_tail() {
        // NVS [0x1000, 0x3000) fully inside free [0x0, 0x10000)
        let mut map = vec![
            entry(0x0, 0x10000, MemoryType::FREE),
            entry(0x1000, 0x2000, MemoryType::NVS),
        ];

        fixup(
            &mut map,
            &KnownTypes::default(),
            FixupFlags::OVERLAP_RESOLVE,
            true,
        );

        assert_eq!(
            map,
            vec![
                entry(0x0, 0x1000, MemoryType::FREE),
                entry(0x1000, 0x2000, MemoryType::NVS),
                entry(0x3000, 0xD000, MemoryType::FREE),
            ]
        );
        assert_invariants(&map);
    }

    #[test]
    fn sub_page_free_fragment_is_dropped() {
        let mut map = vec![
            entry(0x0, 0x1800, MemoryType::FREE),
            entry(0x1000, 0x2000, MemoryType::RESERVED),
        ];

        fixup(
            &mut map,
            &KnownTypes::default(),
            FixupFlags::OVERLAP_RESOLVE,
            true,
        );

        assert_eq!(
            map,
            vec![
                entry(0x0, 0x1000, MemoryType::FREE),
                entry(0x1000, 0x2000, MemoryType::RESERVED),
            ]
        );
        assert_invariants(&map);
    }

    #[test]
    fn unknown_types_downgrade() {
        let known = KnownTypes::declare(&[
            MemoryType::FREE,
            MemoryType::RESERVED,
            MemoryType::ACPI_RECLAIMABLE,
            MemoryType::NVS,
        ]);

        let mut map = vec![
            entry(0x0, 0x1000, MemoryType::PERSISTENT),
            entry(0x1000, 0x2000, MemoryType::LOADER_RECLAIMABLE),
            entry(0x3000, 0x1000, MemoryType(0xFFFF_0002)),
        ];

        fixup(&mut map, &known, FixupFlags::OVERLAP_RESOLVE, true);

        // persistent -> reserved, loader-reclaim -> free (protocol does not
        // know it), proto-specific untouched
        assert_eq!(
            map,
            vec![
                entry(0x0, 0x1000, MemoryType::RESERVED),
                entry(0x1000, 0x2000, MemoryType::FREE),
                entry(0x3000, 0x1000, MemoryType(0xFFFF_0002)),
            ]
        );
    }

    #[test]
    fn unaligned_free_entry_is_trimmed() {
        let mut map = vec![entry(0x123, 0x5000, MemoryType::FREE)];

        fixup(
            &mut map,
            &KnownTypes::default(),
            FixupFlags::OVERLAP_RESOLVE,
            true,
        );

        assert_eq!(map, vec![entry(0x1000, 0x4000, MemoryType::FREE)]);
        assert_invariants(&map);
    }

    #[test]
    fn backwards_merge_after_type_propagation() {
        // The middle free range is consumed by the reserved one; afterwards
        // the two reserved ranges must merge.
        let mut map = vec![
            entry(0x0, 0x1000, MemoryType::RESERVED),
            entry(0x1000, 0x1000, MemoryType::FREE),
            entry(0x1000, 0x1000, MemoryType::RESERVED),
        ];

        fixup(
            &mut map,
            &KnownTypes::default(),
            FixupFlags::OVERLAP_RESOLVE,
            true,
        );

        assert_eq!(map, vec![entry(0x0, 0x2000, MemoryType::RESERVED)]);
        assert_invariants(&map);
    }
}

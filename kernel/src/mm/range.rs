// Virtual Range Descriptors
//
// A `Range` describes one contiguous, page-aligned span of an address space
// with uniform protection, mapping flags and backing. The range tracker
// keeps them in a sorted, non-overlapping, coalesced list; this module holds
// the per-range rules that list maintenance is built from.
//
// Key responsibilities:
// - Merge rules (adjacent, same prot/flags, same backing with contiguous
//   file offsets)
// - Split/trim with file offset adjustment
// - The permission a resident page should carry given its sharing state

use core::fmt;

use bitflags::bitflags;

use super::{Prot, VirtAddr};
use crate::fs::FileRef;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MapFlags: u32 {
        /// The hint address must be used as-is. Not stored on the range.
        const EXACT      = 1 << 0;
        /// Writes are visible to every mapping of the same frames/file.
        const SHARED     = 1 << 1;
        /// Caller-supplied frames; the range never owns them.
        const PHYS       = 1 << 2;
        /// Frames come from the file's `direct_map`, bypassing the cache.
        const NOCACHE    = 1 << 3;
        /// Upgrading a shared file mapping to writable consults the file's
        /// access check.
        const CRED_CHECK = 1 << 4;
    }
}

impl MapFlags {
    /// Flags that describe a range rather than a single map request.
    pub fn stored(self) -> MapFlags {
        self - MapFlags::EXACT
    }
}

#[derive(Clone)]
pub struct Backing {
    pub file: FileRef,
    /// File offset of the range's first byte.
    pub offset: u64,
}

impl Backing {
    pub fn new(file: FileRef, offset: u64) -> Self {
        Backing { file, offset }
    }

    fn same_file(&self, other: &Backing) -> bool {
        self.file.id() == other.file.id()
    }
}

impl fmt::Debug for Backing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backing")
            .field("file", &self.file.id())
            .field("offset", &self.offset)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct Range {
    pub start: VirtAddr,
    pub size: usize,
    pub prot: Prot,
    pub flags: MapFlags,
    pub backing: Option<Backing>,
}

impl Range {
    pub fn new(start: VirtAddr, size: usize, prot: Prot, flags: MapFlags, backing: Option<Backing>) -> Self {
        Range { start, size, prot, flags: flags.stored(), backing }
    }

    pub fn end(&self) -> VirtAddr {
        self.start + self.size
    }

    pub fn contains(&self, addr: VirtAddr) -> bool {
        addr >= self.start && addr < self.end()
    }

    pub fn overlaps(&self, start: VirtAddr, end: VirtAddr) -> bool {
        self.start < end && start < self.end()
    }

    pub fn is_shared(&self) -> bool {
        self.flags.contains(MapFlags::SHARED)
    }

    /// Whether resident frames hold a PMM reference taken by this range.
    pub fn owns_frames(&self) -> bool {
        !self.flags.intersects(MapFlags::PHYS | MapFlags::NOCACHE)
    }

    /// File offset backing `addr`, if file-backed.
    pub fn file_offset(&self, addr: VirtAddr) -> Option<u64> {
        self.backing
            .as_ref()
            .map(|b| b.offset + (addr - self.start) as u64)
    }

    pub fn can_merge(&self, next: &Range) -> bool {
        if self.end() != next.start || self.prot != next.prot || self.flags != next.flags {
            return false;
        }
        if self.flags.contains(MapFlags::PHYS) {
            return false;
        }

        match (&self.backing, &next.backing) {
            (None, None) => true,
            (Some(a), Some(b)) => a.same_file(b) && a.offset + self.size as u64 == b.offset,
            _ => false,
        }
    }

    /// Absorbs `next`, which must satisfy `can_merge`.
    pub fn merge(&mut self, next: Range) {
        self.size += next.size;
    }

    /// Cuts the range at `addr`; `self` keeps `[start, addr)` and the returned
    /// range covers `[addr, end)`.
    pub fn split_off(&mut self, addr: VirtAddr) -> Range {
        let right = Range {
            start: addr,
            size: self.end() - addr,
            prot: self.prot,
            flags: self.flags,
            backing: self.backing.as_ref().map(|b| Backing {
                file: b.file.clone(),
                offset: b.offset + (addr - self.start) as u64,
            }),
        };
        self.size = addr - self.start;
        right
    }

    /// Drops `[start, addr)` from the front of the range.
    pub fn trim_front(&mut self, addr: VirtAddr) {
        let cut = addr - self.start;
        if let Some(backing) = self.backing.as_mut() {
            backing.offset += cut as u64;
        }
        self.start = addr;
        self.size -= cut;
    }

    /// Drops `[addr, end)` from the back of the range.
    pub fn trim_back(&mut self, addr: VirtAddr) {
        self.size = addr - self.start;
    }

    /// Permission for a resident page of this range.
    ///
    /// `mapped` is what the page table currently holds for the page and
    /// `refcount` the PMM count of its frame.
    pub fn resident_prot(&self, mapped: Prot, refcount: usize) -> Prot {
        if !self.prot.contains(Prot::WRITE) || !self.owns_frames() {
            return self.prot;
        }

        if self.is_shared() {
            // Shared file pages become writable on their first write fault,
            // which is also when they are dirtied.
            if self.backing.is_some() && !mapped.contains(Prot::WRITE) {
                return self.prot - Prot::WRITE;
            }
            return self.prot;
        }

        // Private: writable only once nobody else references the frame. Page
        // cache frames always carry the cache's own reference.
        if refcount == 1 {
            self.prot
        } else {
            self.prot - Prot::WRITE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::PAGE_SIZE;
    use crate::testing::MockFile;

    fn anon(start: usize, pages: usize) -> Range {
        Range::new(start, pages * PAGE_SIZE, Prot::USER_RW, MapFlags::empty(), None)
    }

    #[test]
    fn exact_is_not_stored() {
        let r = Range::new(0x1000, PAGE_SIZE, Prot::READ, MapFlags::EXACT | MapFlags::SHARED, None);
        assert_eq!(r.flags, MapFlags::SHARED);
    }

    #[test]
    fn adjacent_anonymous_ranges_merge() {
        let mut a = anon(0x10000, 2);
        let b = anon(0x12000, 3);
        assert!(a.can_merge(&b));
        a.merge(b);
        assert_eq!(a.size, 5 * PAGE_SIZE);
    }

    #[test]
    fn merge_requires_identical_attributes() {
        let a = anon(0x10000, 1);
        let mut ro = anon(0x11000, 1);
        ro.prot = Prot::READ | Prot::USER;
        assert!(!a.can_merge(&ro));

        let gap = anon(0x12000, 1);
        assert!(!a.can_merge(&gap));

        let mut phys = anon(0x11000, 1);
        phys.flags = MapFlags::PHYS;
        let mut phys_left = anon(0x10000, 1);
        phys_left.flags = MapFlags::PHYS;
        assert!(!phys_left.can_merge(&phys));
    }

    #[test]
    fn file_ranges_merge_only_with_contiguous_offsets() {
        let file = MockFile::new(7, 16 * PAGE_SIZE);
        let other = MockFile::new(8, 16 * PAGE_SIZE);
        let a = Range::new(0x10000, PAGE_SIZE, Prot::READ, MapFlags::empty(), Some(Backing::new(file.clone(), 0)));
        let b = Range::new(0x11000, PAGE_SIZE, Prot::READ, MapFlags::empty(), Some(Backing::new(file.clone(), PAGE_SIZE as u64)));
        let skip = Range::new(0x11000, PAGE_SIZE, Prot::READ, MapFlags::empty(), Some(Backing::new(file.clone(), 5 * PAGE_SIZE as u64)));
        let foreign = Range::new(0x11000, PAGE_SIZE, Prot::READ, MapFlags::empty(), Some(Backing::new(other, PAGE_SIZE as u64)));

        assert!(a.can_merge(&b));
        assert!(!a.can_merge(&skip));
        assert!(!a.can_merge(&foreign));
        assert!(!a.can_merge(&anon(0x11000, 1)));
    }

    #[test]
    fn split_and_trim_adjust_file_offsets() {
        let file = MockFile::new(1, 16 * PAGE_SIZE);
        let mut r = Range::new(0x20000, 4 * PAGE_SIZE, Prot::READ, MapFlags::empty(), Some(Backing::new(file, 0x4000)));

        let right = r.split_off(0x22000);
        assert_eq!((r.start, r.size), (0x20000, 2 * PAGE_SIZE));
        assert_eq!((right.start, right.size), (0x22000, 2 * PAGE_SIZE));
        assert_eq!(right.backing.as_ref().unwrap().offset, 0x6000);

        r.trim_front(0x21000);
        assert_eq!(r.start, 0x21000);
        assert_eq!(r.backing.as_ref().unwrap().offset, 0x5000);
        assert_eq!(r.file_offset(0x21800), Some(0x5800));

        let mut right = right;
        right.trim_back(0x23000);
        assert_eq!(right.end(), 0x23000);
    }

    #[test]
    fn resident_permissions_follow_sharing_state() {
        let private = anon(0x10000, 1);
        assert_eq!(private.resident_prot(Prot::USER_RW, 1), Prot::USER_RW);
        assert_eq!(private.resident_prot(Prot::USER_RW, 2), Prot::READ | Prot::USER);

        let mut shared = anon(0x10000, 1);
        shared.flags = MapFlags::SHARED;
        assert_eq!(shared.resident_prot(Prot::USER_RW, 3), Prot::USER_RW);

        let file = MockFile::new(2, PAGE_SIZE);
        let mut shared_file = anon(0x10000, 1);
        shared_file.flags = MapFlags::SHARED;
        shared_file.backing = Some(Backing::new(file, 0));
        assert_eq!(shared_file.resident_prot(Prot::READ | Prot::USER, 2), Prot::READ | Prot::USER);
        assert_eq!(shared_file.resident_prot(Prot::USER_RW, 2), Prot::USER_RW);

        let mut device = anon(0x10000, 1);
        device.flags = MapFlags::PHYS;
        assert_eq!(device.resident_prot(Prot::empty(), 0), Prot::USER_RW);
    }
}

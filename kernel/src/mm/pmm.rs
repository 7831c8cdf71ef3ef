// Physical Memory Manager (PMM)
//
// Page-granular physical frame allocator with per-frame reference counts.
// Every other layer of the memory core consumes frames through the
// `FrameAllocator` trait; `BitmapPmm` is the reference implementation.
//
// Key responsibilities:
// - Track free and allocated frames in a compact bitmap
// - Keep an atomic reference count per frame (`hold`/`release`) so that
//   copy-on-write sharing and page-cache residency can share a frame
// - Free a frame exactly when its count drops to zero
// - Give the kernel access to frame contents through the direct map
//
// Implementation details:
// - One bit per frame: 0 = free, 1 = allocated or reserved
// - The bitmap starts "all reserved"; `add_region` releases usable memory
//   reported by the boot loader
// - Bits are claimed with compare-and-swap, so allocation is lock-free
// - `next_hint` gives a next-fit start point for the word scan
// - Contiguous runs (heap large objects) are found by a linear scan under
//   a small spinlock so two runs are never interleaved
//
// Correctness notes:
// - `hold` on a free frame and `release` on a frame whose count is already
//   zero are refcount corruption and abort
// - Frames outside the managed window (device memory) are never counted;
//   callers must not hold or release them

use core::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

use super::PhysAddr;
use crate::sync::IrqMutex;
use crate::{kabort, log_info};

const LOG_ORIGIN: &str = "pmm";

pub const PAGE_SIZE: usize = 4096;

/// Upper bound on frames tracked by the boot-time instance (1 GiB).
pub const MAX_PAGES: usize = 256 * 1024;

const BITS_PER_WORD: usize = 64;

pub trait FrameAllocator: Send + Sync {
    /// Allocates one frame with a reference count of 1.
    fn alloc(&self) -> Option<PhysAddr>;

    fn alloc_zeroed(&self) -> Option<PhysAddr> {
        let frame = self.alloc()?;
        self.zero(frame);
        Some(frame)
    }

    /// Allocates `count` physically contiguous frames, each counted once.
    fn alloc_contiguous(&self, count: usize) -> Option<PhysAddr>;

    fn free_contiguous(&self, base: PhysAddr, count: usize) {
        for i in 0..count {
            self.release(base + i * PAGE_SIZE);
        }
    }

    /// Adds a reference to an allocated frame.
    fn hold(&self, frame: PhysAddr);

    /// Drops a reference; returns true when this freed the frame.
    fn release(&self, frame: PhysAddr) -> bool;

    fn refcount(&self, frame: PhysAddr) -> usize;

    /// Kernel-virtual pointer to the first byte of `frame`.
    fn phys_to_virt(&self, frame: PhysAddr) -> *mut u8;

    fn with_frame(&self, frame: PhysAddr, f: &mut dyn FnMut(&mut [u8])) {
        // Every managed frame is covered by the direct map.
        let bytes = unsafe { core::slice::from_raw_parts_mut(self.phys_to_virt(frame), PAGE_SIZE) };
        f(bytes);
    }

    fn zero(&self, frame: PhysAddr) {
        self.with_frame(frame, &mut |bytes| bytes.fill(0));
    }

    fn copy(&self, dst: PhysAddr, src: PhysAddr) {
        let src = self.phys_to_virt(src) as *const u8;
        self.with_frame(dst, &mut |bytes| unsafe {
            core::ptr::copy_nonoverlapping(src, bytes.as_mut_ptr(), PAGE_SIZE);
        });
    }

    fn stats(&self) -> MemoryStats;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryStats {
    pub total_pages: usize,
    pub free_pages: usize,
    pub used_pages: usize,
    /// Allocated frames with more than one reference.
    pub shared_pages: usize,
}

impl MemoryStats {
    pub const fn free_bytes(&self) -> usize {
        self.free_pages * PAGE_SIZE
    }

    pub const fn used_bytes(&self) -> usize {
        self.used_pages * PAGE_SIZE
    }
}

pub struct BitmapPmm {
    /// Physical address of frame 0 of the managed window.
    base: PhysAddr,
    total: usize,
    /// Added to a physical address to get its direct-map address.
    phys_offset: usize,
    bitmap: &'static [AtomicU64],
    refcounts: &'static [AtomicU32],
    free: AtomicUsize,
    next_hint: AtomicUsize,
    contiguous: IrqMutex<()>,
}

impl BitmapPmm {
    /// Creates an allocator for `frames` frames starting at `base` with every
    /// frame reserved.
    pub fn new(
        base: PhysAddr,
        frames: usize,
        phys_offset: usize,
        bitmap: &'static [AtomicU64],
        refcounts: &'static [AtomicU32],
    ) -> Self {
        let total = frames.min(refcounts.len()).min(bitmap.len() * BITS_PER_WORD);
        for word in bitmap {
            word.store(u64::MAX, Ordering::Relaxed);
        }
        for count in refcounts {
            count.store(0, Ordering::Relaxed);
        }

        BitmapPmm {
            base,
            total,
            phys_offset,
            bitmap,
            refcounts,
            free: AtomicUsize::new(0),
            next_hint: AtomicUsize::new(0),
            contiguous: IrqMutex::new(()),
        }
    }

    /// Marks `[start, start + len)` usable. Partial frames at either edge are
    /// left reserved.
    pub fn add_region(&self, start: PhysAddr, len: usize) {
        let first = super::align_up(start).unwrap_or(usize::MAX);
        let last = super::align_down(start.saturating_add(len));
        let mut added = 0usize;

        let mut frame = first;
        while frame < last {
            if let Some(index) = self.index_of(frame) {
                let (word, bit) = (index / BITS_PER_WORD, index % BITS_PER_WORD);
                let prev = self.bitmap[word].fetch_and(!(1u64 << bit), Ordering::AcqRel);
                if prev & (1u64 << bit) != 0 {
                    added += 1;
                }
            }
            frame += PAGE_SIZE;
        }

        self.free.fetch_add(added, Ordering::AcqRel);
        log_info!(
            LOG_ORIGIN,
            "Region {:#X}..{:#X}: {} frames usable ({} free total)",
            start,
            start.saturating_add(len),
            added,
            self.free.load(Ordering::Relaxed)
        );
    }

    fn index_of(&self, frame: PhysAddr) -> Option<usize> {
        if frame < self.base || frame % PAGE_SIZE != 0 {
            return None;
        }
        let index = (frame - self.base) / PAGE_SIZE;
        (index < self.total).then_some(index)
    }

    fn frame_at(&self, index: usize) -> PhysAddr {
        self.base + index * PAGE_SIZE
    }

    fn try_claim(&self, index: usize) -> bool {
        let (word, bit) = (index / BITS_PER_WORD, index % BITS_PER_WORD);
        let mask = 1u64 << bit;
        self.bitmap[word].fetch_or(mask, Ordering::AcqRel) & mask == 0
    }

    fn unclaim(&self, index: usize) {
        let (word, bit) = (index / BITS_PER_WORD, index % BITS_PER_WORD);
        self.bitmap[word].fetch_and(!(1u64 << bit), Ordering::AcqRel);
    }

    fn is_free(&self, index: usize) -> bool {
        let (word, bit) = (index / BITS_PER_WORD, index % BITS_PER_WORD);
        self.bitmap[word].load(Ordering::Acquire) & (1u64 << bit) == 0
    }

    fn words(&self) -> usize {
        (self.total + BITS_PER_WORD - 1) / BITS_PER_WORD
    }
}

impl FrameAllocator for BitmapPmm {
    fn alloc(&self) -> Option<PhysAddr> {
        if self.free.load(Ordering::Acquire) == 0 {
            return None;
        }

        let words = self.words();
        let start = self.next_hint.load(Ordering::Relaxed) % words.max(1);

        for step in 0..words {
            let word = (start + step) % words;
            let mut current = self.bitmap[word].load(Ordering::Acquire);

            while current != u64::MAX {
                let bit = (!current).trailing_zeros() as usize;
                let index = word * BITS_PER_WORD + bit;
                if index >= self.total {
                    break;
                }

                let mask = 1u64 << bit;
                match self.bitmap[word].compare_exchange_weak(
                    current,
                    current | mask,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => {
                        self.refcounts[index].store(1, Ordering::Release);
                        self.free.fetch_sub(1, Ordering::AcqRel);
                        self.next_hint.store(word, Ordering::Relaxed);
                        return Some(self.frame_at(index));
                    }
                    Err(actual) => current = actual,
                }
            }
        }

        None
    }

    fn alloc_contiguous(&self, count: usize) -> Option<PhysAddr> {
        if count == 0 {
            return None;
        }
        if count == 1 {
            return self.alloc();
        }
        if self.free.load(Ordering::Acquire) < count {
            return None;
        }

        let _serial = self.contiguous.lock();
        let max_start = self.total.checked_sub(count)?;

        let mut start = 0;
        'outer: while start <= max_start {
            for i in 0..count {
                if !self.is_free(start + i) {
                    start += i + 1;
                    continue 'outer;
                }
            }

            for i in 0..count {
                if !self.try_claim(start + i) {
                    // Lost a race against single-frame alloc; roll back.
                    for j in 0..i {
                        self.unclaim(start + j);
                    }
                    start += i + 1;
                    continue 'outer;
                }
            }

            for i in 0..count {
                self.refcounts[start + i].store(1, Ordering::Release);
            }
            self.free.fetch_sub(count, Ordering::AcqRel);
            return Some(self.frame_at(start));
        }

        None
    }

    fn hold(&self, frame: PhysAddr) {
        let index = match self.index_of(frame) {
            Some(index) => index,
            None => kabort!(LOG_ORIGIN, "hold of unmanaged frame {:#X}", frame),
        };

        let result = self.refcounts[index].fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
            (count != 0).then(|| count + 1)
        });
        if result.is_err() {
            kabort!(LOG_ORIGIN, "hold of free frame {:#X}", frame);
        }
    }

    fn release(&self, frame: PhysAddr) -> bool {
        let index = match self.index_of(frame) {
            Some(index) => index,
            None => kabort!(LOG_ORIGIN, "release of unmanaged frame {:#X}", frame),
        };

        let previous = match self.refcounts[index].fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
            count.checked_sub(1)
        }) {
            Ok(previous) => previous,
            Err(_) => kabort!(LOG_ORIGIN, "release of free frame {:#X}", frame),
        };

        if previous == 1 {
            self.unclaim(index);
            self.free.fetch_add(1, Ordering::AcqRel);
            return true;
        }
        false
    }

    fn refcount(&self, frame: PhysAddr) -> usize {
        self.index_of(frame)
            .map(|index| self.refcounts[index].load(Ordering::Acquire) as usize)
            .unwrap_or(0)
    }

    fn phys_to_virt(&self, frame: PhysAddr) -> *mut u8 {
        frame.wrapping_add(self.phys_offset) as *mut u8
    }

    fn stats(&self) -> MemoryStats {
        let free = self.free.load(Ordering::Acquire);
        let shared = self.refcounts[..self.total]
            .iter()
            .filter(|count| count.load(Ordering::Relaxed) > 1)
            .count();
        let usable = free + self.refcounts[..self.total]
            .iter()
            .filter(|count| count.load(Ordering::Relaxed) > 0)
            .count();

        MemoryStats {
            total_pages: usable,
            free_pages: free,
            used_pages: usable - free,
            shared_pages: shared,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{arena, leak_counts};

    fn pmm(frames: usize) -> (BitmapPmm, PhysAddr) {
        let base = arena(frames);
        let (bitmap, counts) = leak_counts(frames);
        let pmm = BitmapPmm::new(base, frames, 0, bitmap, counts);
        pmm.add_region(base, frames * PAGE_SIZE);
        (pmm, base)
    }

    #[test]
    fn alloc_until_exhausted_then_fail() {
        let (pmm, _) = pmm(8);
        let mut frames = Vec::new();
        while let Some(frame) = pmm.alloc() {
            frames.push(frame);
        }
        assert_eq!(frames.len(), 8);
        frames.sort();
        frames.dedup();
        assert_eq!(frames.len(), 8);
        assert_eq!(pmm.stats().free_pages, 0);

        assert!(pmm.release(frames[3]));
        assert_eq!(pmm.alloc(), Some(frames[3]));
    }

    #[test]
    fn frame_is_freed_when_last_reference_drops() {
        let (pmm, _) = pmm(4);
        let frame = pmm.alloc().unwrap();
        pmm.hold(frame);
        assert_eq!(pmm.refcount(frame), 2);
        assert_eq!(pmm.stats().shared_pages, 1);

        assert!(!pmm.release(frame));
        assert_eq!(pmm.stats().free_pages, 3);
        assert!(pmm.release(frame));
        assert_eq!(pmm.refcount(frame), 0);
        assert_eq!(pmm.stats().free_pages, 4);
    }

    #[test]
    #[should_panic(expected = "release of free frame")]
    fn double_release_aborts() {
        let (pmm, _) = pmm(2);
        let frame = pmm.alloc().unwrap();
        pmm.release(frame);
        pmm.release(frame);
    }

    #[test]
    #[should_panic(expected = "hold of free frame")]
    fn hold_of_free_frame_aborts() {
        let (pmm, base) = pmm(2);
        pmm.hold(base);
    }

    #[test]
    fn zeroed_and_copied_contents() {
        let (pmm, _) = pmm(2);
        let a = pmm.alloc_zeroed().unwrap();
        pmm.with_frame(a, &mut |bytes| {
            assert!(bytes.iter().all(|&b| b == 0));
            bytes[0] = 0x5A;
            bytes[PAGE_SIZE - 1] = 0xA5;
        });

        let b = pmm.alloc().unwrap();
        pmm.copy(b, a);
        pmm.with_frame(b, &mut |bytes| {
            assert_eq!(bytes[0], 0x5A);
            assert_eq!(bytes[PAGE_SIZE - 1], 0xA5);
        });
    }

    #[test]
    fn contiguous_runs_skip_holes() {
        let (pmm, base) = pmm(8);
        let lone = pmm.alloc().unwrap();
        assert_eq!(lone, base);

        let run = pmm.alloc_contiguous(3).unwrap();
        assert_eq!(run, base + PAGE_SIZE);
        assert_eq!(pmm.alloc_contiguous(5), None);
        let tail = pmm.alloc_contiguous(4).unwrap();
        assert_eq!(tail, base + 4 * PAGE_SIZE);

        pmm.free_contiguous(run, 3);
        assert_eq!(pmm.stats().free_pages, 3);
    }

    #[test]
    fn region_edges_are_trimmed_to_whole_frames() {
        let base = arena(4);
        let (bitmap, counts) = leak_counts(4);
        let pmm = BitmapPmm::new(base, 4, 0, bitmap, counts);
        pmm.add_region(base + 100, 3 * PAGE_SIZE);
        assert_eq!(pmm.stats().free_pages, 2);
    }
}

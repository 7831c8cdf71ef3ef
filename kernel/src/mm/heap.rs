// x86_64 Kernel Heap Allocator
//
// Backs Rust's `GlobalAlloc` with slab caches for power-of-two size classes
// (16 bytes .. 2 KiB). Requests above the largest class, or with stricter
// alignment than the classes guarantee, take whole contiguous frames.
//
// Implementation details:
// - Pages come straight from the PMM through the physical direct map; the
//   range tracker cannot back the heap because its own range lists live in
//   heap memory
// - Routing is a pure function of the `Layout`, so `dealloc` always finds
//   the path `alloc` took
// - Until `init` runs every allocation fails with a null pointer

use core::alloc::{GlobalAlloc, Layout};
use core::ptr::{null_mut, NonNull};
use core::sync::atomic::{AtomicUsize, Ordering};
use spin::Once;

use super::slab::{PageSource, SlabCache, SlabError, SlabStats};
use super::{pages_for, FrameAllocator, PAGE_SIZE};
use crate::log_info;

const LOG_ORIGIN: &str = "heap";

pub const SIZE_CLASSES: [usize; 8] = [16, 32, 64, 128, 256, 512, 1024, 2048];
const CLASS_NAMES: [&str; 8] = [
    "kmalloc-16",
    "kmalloc-32",
    "kmalloc-64",
    "kmalloc-128",
    "kmalloc-256",
    "kmalloc-512",
    "kmalloc-1k",
    "kmalloc-2k",
];
/// Alignment every size-class object is guaranteed to have.
const CLASS_ALIGN: usize = 16;

/// Page source handing out PMM frames through the direct map.
pub struct PmmPages {
    pmm: &'static dyn FrameAllocator,
    phys_offset: usize,
}

impl PmmPages {
    pub const fn new(pmm: &'static dyn FrameAllocator, phys_offset: usize) -> Self {
        PmmPages { pmm, phys_offset }
    }
}

impl PageSource for PmmPages {
    fn alloc_pages(&self, count: usize) -> Option<NonNull<u8>> {
        let base = if count == 1 { self.pmm.alloc()? } else { self.pmm.alloc_contiguous(count)? };
        NonNull::new(self.pmm.phys_to_virt(base))
    }

    fn free_pages(&self, pages: NonNull<u8>, count: usize) {
        let base = pages.as_ptr() as usize - self.phys_offset;
        self.pmm.free_contiguous(base, count);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapStats {
    pub allocations: usize,
    pub frees: usize,
    /// Pages currently held by large allocations.
    pub large_pages: usize,
}

pub struct KernelHeap {
    classes: [Option<SlabCache>; SIZE_CLASSES.len()],
    pages: &'static dyn PageSource,
    allocations: AtomicUsize,
    frees: AtomicUsize,
    large_pages: AtomicUsize,
}

impl KernelHeap {
    /// With `use_slabs` off every request takes whole pages, which makes
    /// heap corruption easier to pin down.
    pub fn new(pages: &'static dyn PageSource, use_slabs: bool) -> Result<KernelHeap, SlabError> {
        let mut classes: [Option<SlabCache>; SIZE_CLASSES.len()] = Default::default();
        if use_slabs {
            for (i, slot) in classes.iter_mut().enumerate() {
                *slot = Some(SlabCache::new(CLASS_NAMES[i], SIZE_CLASSES[i], CLASS_ALIGN, None, None, pages)?);
            }
        }

        Ok(KernelHeap {
            classes,
            pages,
            allocations: AtomicUsize::new(0),
            frees: AtomicUsize::new(0),
            large_pages: AtomicUsize::new(0),
        })
    }

    fn class_for(&self, layout: Layout) -> Option<&SlabCache> {
        if layout.align() > CLASS_ALIGN {
            return None;
        }
        let size = layout.size().max(1);
        let index = SIZE_CLASSES.iter().position(|&class| class >= size)?;
        self.classes[index].as_ref()
    }

    pub fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
        let ptr = match self.class_for(layout) {
            Some(cache) => cache.alloc().ok()?,
            None => {
                if layout.align() > PAGE_SIZE {
                    return None;
                }
                let count = pages_for(layout.size().max(1));
                let ptr = self.pages.alloc_pages(count)?;
                self.large_pages.fetch_add(count, Ordering::Relaxed);
                ptr
            }
        };
        self.allocations.fetch_add(1, Ordering::Relaxed);
        Some(ptr)
    }

    pub fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        match self.class_for(layout) {
            Some(cache) => cache.free(ptr),
            None => {
                let count = pages_for(layout.size().max(1));
                self.pages.free_pages(ptr, count);
                self.large_pages.fetch_sub(count, Ordering::Relaxed);
            }
        }
        self.frees.fetch_add(1, Ordering::Relaxed);
    }

    /// Gives empty slabs of every class back to the PMM.
    pub fn purge(&self) -> usize {
        self.classes.iter().flatten().map(|cache| cache.purge()).sum()
    }

    pub fn stats(&self) -> HeapStats {
        HeapStats {
            allocations: self.allocations.load(Ordering::Relaxed),
            frees: self.frees.load(Ordering::Relaxed),
            large_pages: self.large_pages.load(Ordering::Relaxed),
        }
    }

    pub fn class_stats(&self, size: usize) -> Option<SlabStats> {
        let index = SIZE_CLASSES.iter().position(|&class| class == size)?;
        self.classes[index].as_ref().map(|cache| cache.stats())
    }
}

static PAGES: Once<PmmPages> = Once::new();
static HEAP: Once<KernelHeap> = Once::new();

pub fn init(pmm: &'static dyn FrameAllocator, phys_offset: usize, use_slabs: bool) -> Result<&'static KernelHeap, SlabError> {
    let pages: &'static PmmPages = PAGES.call_once(|| PmmPages::new(pmm, phys_offset));
    let heap = KernelHeap::new(pages, use_slabs)?;
    let heap = HEAP.call_once(|| heap);
    log_info!(
        LOG_ORIGIN,
        "Initialized: {} size classes up to {} bytes{}",
        SIZE_CLASSES.len(),
        SIZE_CLASSES[SIZE_CLASSES.len() - 1],
        if use_slabs { "" } else { " (disabled, page-granular)" }
    );
    Ok(heap)
}

pub fn get() -> Option<&'static KernelHeap> {
    HEAP.get()
}

/// `#[global_allocator]` front end for the heap.
pub struct GlobalHeap;

unsafe impl GlobalAlloc for GlobalHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        HEAP.get()
            .and_then(|heap| heap.allocate(layout))
            .map_or(null_mut(), NonNull::as_ptr)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if let (Some(heap), Some(ptr)) = (HEAP.get(), NonNull::new(ptr)) {
            heap.deallocate(ptr, layout);
        }
    }
}

// Slab Object Allocator
//
// Fixed-size object pools carved out of whole pages. Every kernel object
// type with a hot allocation path gets its own `SlabCache`; the kernel heap
// is a set of caches for power-of-two size classes.
//
// Slab layouts:
// - Direct (object size <= DIRECT_MAX): one page, objects packed from the
//   start of the page, the slab header in the last bytes of the page. A free
//   object's list link lives in the trailing word of its stride, past the
//   object itself, so constructed state survives while the object is free
// - Indirect (larger objects): a header page plus a separate block holding
//   INDIRECT_BATCH objects; the free list is a stack of indices kept in the
//   header page
//
// Key responsibilities:
// - Grow by requesting pages from a `PageSource` and constructing every
//   object up front
// - Keep slabs on empty/partial/full lists and migrate them as objects come
//   and go; allocation prefers partial slabs so empty ones can be purged
// - Run destructors on free and give empty slabs back on `purge`
//
// Correctness notes:
// - The slab lists are intrusive (the headers live in the slabs themselves)
//   because the slab layer sits below the heap and cannot allocate
//   bookkeeping of its own; every unlink checks the list tag
// - The list lock masks interrupts: the timer trap allocates through the
//   kernel heap, which is built from these caches
// - Double frees and pointers that do not belong to the cache abort
// - Running out of pages is `SlabError::Exhausted`, never fatal

use core::mem::size_of;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicUsize, Ordering};
use super::{align_down, pages_for, PAGE_SIZE};
use crate::sync::IrqMutex;
use crate::{kabort, kassert, log_debug, log_warn};

const LOG_ORIGIN: &str = "slab";

/// Largest object size kept in direct slabs.
pub const DIRECT_MAX: usize = PAGE_SIZE / 8;
/// Objects per indirect slab.
pub const INDIRECT_BATCH: usize = 16;

const LINK_SIZE: usize = size_of::<usize>();
const MAX_OBJECTS: usize = 256;
const SLAB_MAGIC: u32 = 0x51AB_CAFE;

static NEXT_CACHE_ID: AtomicUsize = AtomicUsize::new(1);

/// Where slab caches get their memory from.
pub trait PageSource: Send + Sync {
    /// `count` contiguous, page-aligned, writable pages.
    fn alloc_pages(&self, count: usize) -> Option<NonNull<u8>>;

    fn free_pages(&self, pages: NonNull<u8>, count: usize);
}

/// Object constructor or destructor.
pub type ObjectHook = fn(NonNull<u8>);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlabError {
    /// The page source has nothing left.
    Exhausted,
    InvalidLayout,
}

impl SlabError {
    pub fn to_errno(self) -> i64 {
        match self {
            SlabError::Exhausted => -12,     // ENOMEM
            SlabError::InvalidLayout => -22, // EINVAL
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListTag {
    Detached,
    Empty,
    Partial,
    Full,
}

#[repr(C)]
struct SlabHeader {
    prev: Option<NonNull<SlabHeader>>,
    next: Option<NonNull<SlabHeader>>,
    tag: ListTag,
    magic: u32,
    cache: usize,
    objects: NonNull<u8>,
    in_use: u16,
    /// Indirect only: number of valid entries in `free_idx`.
    free_top: u16,
    /// Direct only: first free object.
    free_head: Option<NonNull<u8>>,
    free_idx: [u16; INDIRECT_BATCH],
    allocated: [u64; MAX_OBJECTS / 64],
    constructed: [u64; MAX_OBJECTS / 64],
}

fn test_bit(bits: &[u64], i: usize) -> bool {
    bits[i / 64] & (1 << (i % 64)) != 0
}

fn set_bit(bits: &mut [u64], i: usize) {
    bits[i / 64] |= 1 << (i % 64);
}

fn clear_bit(bits: &mut [u64], i: usize) {
    bits[i / 64] &= !(1 << (i % 64));
}

const fn align_to(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Doubly linked list of slab headers. Each header records which list it is
/// on; pushing an attached slab or unlinking from the wrong list aborts.
struct SlabList {
    head: Option<NonNull<SlabHeader>>,
    len: usize,
    tag: ListTag,
}

impl SlabList {
    const fn new(tag: ListTag) -> Self {
        SlabList { head: None, len: 0, tag }
    }

    fn first(&self) -> Option<NonNull<SlabHeader>> {
        self.head
    }

    fn len(&self) -> usize {
        self.len
    }

    /// # Safety
    /// `slab` must point to a live header owned by the same cache.
    unsafe fn push(&mut self, mut slab: NonNull<SlabHeader>) {
        let header = slab.as_mut();
        kassert!(
            header.tag == ListTag::Detached,
            LOG_ORIGIN,
            "slab {:p} pushed on {:?} while on {:?}",
            slab,
            self.tag,
            header.tag
        );
        header.prev = None;
        header.next = self.head;
        header.tag = self.tag;
        if let Some(mut head) = self.head {
            head.as_mut().prev = Some(slab);
        }
        self.head = Some(slab);
        self.len += 1;
    }

    /// # Safety
    /// `slab` must point to a live header owned by the same cache.
    unsafe fn unlink(&mut self, mut slab: NonNull<SlabHeader>) {
        let header = slab.as_mut();
        kassert!(
            header.tag == self.tag,
            LOG_ORIGIN,
            "slab {:p} unlinked from {:?} but is on {:?}",
            slab,
            self.tag,
            header.tag
        );
        let (prev, next) = (header.prev, header.next);
        header.prev = None;
        header.next = None;
        header.tag = ListTag::Detached;

        match prev {
            Some(mut prev) => prev.as_mut().next = next,
            None => self.head = next,
        }
        if let Some(mut next) = next {
            next.as_mut().prev = prev;
        }
        self.len -= 1;
    }

    fn iter(&self) -> SlabIter {
        SlabIter { cursor: self.head }
    }
}

struct SlabIter {
    cursor: Option<NonNull<SlabHeader>>,
}

impl Iterator for SlabIter {
    type Item = NonNull<SlabHeader>;

    fn next(&mut self) -> Option<Self::Item> {
        let slab = self.cursor?;
        self.cursor = unsafe { slab.as_ref().next };
        Some(slab)
    }
}

struct SlabLists {
    empty: SlabList,
    partial: SlabList,
    full: SlabList,
    live: usize,
}

// The headers are only touched with the cache lock held.
unsafe impl Send for SlabLists {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlabStats {
    pub empty_slabs: usize,
    pub partial_slabs: usize,
    pub full_slabs: usize,
    pub objects_in_use: usize,
    pub objects_per_slab: usize,
    pub stride: usize,
}

pub struct SlabCache {
    name: &'static str,
    id: usize,
    size: usize,
    stride: usize,
    capacity: usize,
    direct: bool,
    ctor: Option<ObjectHook>,
    dtor: Option<ObjectHook>,
    pages: &'static dyn PageSource,
    lists: IrqMutex<SlabLists>,
}

impl SlabCache {
    pub fn new(
        name: &'static str,
        size: usize,
        align: usize,
        ctor: Option<ObjectHook>,
        dtor: Option<ObjectHook>,
        pages: &'static dyn PageSource,
    ) -> Result<SlabCache, SlabError> {
        if size == 0 || !align.is_power_of_two() || align > PAGE_SIZE {
            return Err(SlabError::InvalidLayout);
        }

        let direct = size <= DIRECT_MAX;
        let (stride, capacity) = if direct {
            let stride = align_to(align_to(size, LINK_SIZE) + LINK_SIZE, align);
            (stride, (PAGE_SIZE - size_of::<SlabHeader>()) / stride)
        } else {
            (align_to(size, align), INDIRECT_BATCH)
        };
        if capacity == 0 {
            return Err(SlabError::InvalidLayout);
        }

        let cache = SlabCache {
            name,
            id: NEXT_CACHE_ID.fetch_add(1, Ordering::Relaxed),
            size,
            stride,
            capacity: capacity.min(MAX_OBJECTS),
            direct,
            ctor,
            dtor,
            pages,
            lists: IrqMutex::new(SlabLists {
                empty: SlabList::new(ListTag::Empty),
                partial: SlabList::new(ListTag::Partial),
                full: SlabList::new(ListTag::Full),
                live: 0,
            }),
        };
        log_debug!(
            LOG_ORIGIN,
            "Cache '{}': size={} stride={} {} slabs of {}",
            name,
            size,
            stride,
            if direct { "direct" } else { "indirect" },
            cache.capacity
        );
        Ok(cache)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn object_size(&self) -> usize {
        self.size
    }

    fn block_pages(&self) -> usize {
        pages_for(self.capacity * self.stride)
    }

    fn object(&self, header: &SlabHeader, index: usize) -> NonNull<u8> {
        // In bounds of the slab's object block.
        unsafe { NonNull::new_unchecked(header.objects.as_ptr().add(index * self.stride)) }
    }

    /// Link slot of a direct-slab object: the last word of its stride.
    fn link(&self, obj: NonNull<u8>) -> *mut usize {
        unsafe { obj.as_ptr().add(self.stride - LINK_SIZE) as *mut usize }
    }

    fn push_free(&self, header: &mut SlabHeader, index: usize) {
        if self.direct {
            let obj = self.object(header, index);
            let next = header.free_head.map_or(0, |p| p.as_ptr() as usize);
            unsafe { ptr::write(self.link(obj), next) };
            header.free_head = Some(obj);
        } else {
            header.free_idx[header.free_top as usize] = index as u16;
            header.free_top += 1;
        }
    }

    fn pop_free(&self, header: &mut SlabHeader) -> Option<usize> {
        if self.direct {
            let obj = header.free_head?;
            let next = unsafe { ptr::read(self.link(obj)) };
            header.free_head = NonNull::new(next as *mut u8);
            Some((obj.as_ptr() as usize - header.objects.as_ptr() as usize) / self.stride)
        } else {
            if header.free_top == 0 {
                return None;
            }
            header.free_top -= 1;
            Some(header.free_idx[header.free_top as usize] as usize)
        }
    }

    fn grow(&self) -> Result<NonNull<SlabHeader>, SlabError> {
        let (header_ptr, objects) = if self.direct {
            let page = self.pages.alloc_pages(1).ok_or(SlabError::Exhausted)?;
            let header = unsafe { page.as_ptr().add(PAGE_SIZE - size_of::<SlabHeader>()) } as *mut SlabHeader;
            (header, page)
        } else {
            let header_page = self.pages.alloc_pages(1).ok_or(SlabError::Exhausted)?;
            let block = match self.pages.alloc_pages(self.block_pages()) {
                Some(block) => block,
                None => {
                    self.pages.free_pages(header_page, 1);
                    return Err(SlabError::Exhausted);
                }
            };
            (header_page.as_ptr() as *mut SlabHeader, block)
        };

        unsafe {
            ptr::write(
                header_ptr,
                SlabHeader {
                    prev: None,
                    next: None,
                    tag: ListTag::Detached,
                    magic: SLAB_MAGIC,
                    cache: self.id,
                    objects,
                    in_use: 0,
                    free_top: 0,
                    free_head: None,
                    free_idx: [0; INDIRECT_BATCH],
                    allocated: [0; MAX_OBJECTS / 64],
                    constructed: [0; MAX_OBJECTS / 64],
                },
            );
        }
        let mut slab = unsafe { NonNull::new_unchecked(header_ptr) };
        let header = unsafe { slab.as_mut() };

        for index in (0..self.capacity).rev() {
            if let Some(ctor) = self.ctor {
                ctor(self.object(header, index));
                set_bit(&mut header.constructed, index);
            }
            self.push_free(header, index);
        }

        log_debug!(LOG_ORIGIN, "Cache '{}' grew a slab at {:p}", self.name, objects);
        Ok(slab)
    }

    pub fn alloc(&self) -> Result<NonNull<u8>, SlabError> {
        let mut lists = self.lists.lock();

        let mut slab = match lists.partial.first().or_else(|| lists.empty.first()) {
            Some(slab) => slab,
            None => {
                let slab = self.grow()?;
                unsafe { lists.empty.push(slab) };
                slab
            }
        };

        let (obj, was_empty, now_full) = {
            let header = unsafe { slab.as_mut() };
            let index = match self.pop_free(header) {
                Some(index) => index,
                None => kabort!(LOG_ORIGIN, "cache '{}': slab {:p} on {:?} has no free object", self.name, slab, header.tag),
            };
            kassert!(
                !test_bit(&header.allocated, index),
                LOG_ORIGIN,
                "cache '{}': object {} of slab {:p} handed out twice",
                self.name,
                index,
                slab
            );
            set_bit(&mut header.allocated, index);

            let obj = self.object(header, index);
            if !test_bit(&header.constructed, index) {
                if let Some(ctor) = self.ctor {
                    ctor(obj);
                    set_bit(&mut header.constructed, index);
                }
            }

            let was_empty = header.in_use == 0;
            header.in_use += 1;
            (obj, was_empty, header.in_use as usize == self.capacity)
        };

        unsafe {
            if was_empty {
                lists.empty.unlink(slab);
                if now_full {
                    lists.full.push(slab);
                } else {
                    lists.partial.push(slab);
                }
            } else if now_full {
                lists.partial.unlink(slab);
                lists.full.push(slab);
            }
        }
        lists.live += 1;
        Ok(obj)
    }

    /// Slab holding `obj`, aborting if it is not one of ours.
    fn slab_of(&self, lists: &SlabLists, obj: NonNull<u8>) -> NonNull<SlabHeader> {
        let addr = obj.as_ptr() as usize;

        if self.direct {
            let header = (align_down(addr) + PAGE_SIZE - size_of::<SlabHeader>()) as *mut SlabHeader;
            let owned = unsafe { (*header).magic == SLAB_MAGIC && (*header).cache == self.id };
            if !owned || addr >= header as usize {
                kabort!(LOG_ORIGIN, "cache '{}': free of foreign pointer {:p}", self.name, obj);
            }
            return unsafe { NonNull::new_unchecked(header) };
        }

        let span = self.capacity * self.stride;
        let found = lists.partial.iter().chain(lists.full.iter()).find(|slab| {
            let base = unsafe { slab.as_ref().objects.as_ptr() as usize };
            addr >= base && addr < base + span
        });
        match found {
            Some(slab) => slab,
            None => kabort!(LOG_ORIGIN, "cache '{}': free of foreign pointer {:p}", self.name, obj),
        }
    }

    pub fn free(&self, obj: NonNull<u8>) {
        let mut lists = self.lists.lock();
        let mut slab = self.slab_of(&lists, obj);

        let (was_full, now_empty) = {
            let header = unsafe { slab.as_mut() };
            let offset = obj.as_ptr() as usize - header.objects.as_ptr() as usize;
            if offset % self.stride != 0 {
                kabort!(LOG_ORIGIN, "cache '{}': free of misaligned pointer {:p}", self.name, obj);
            }
            let index = offset / self.stride;
            kassert!(
                index < self.capacity && test_bit(&header.allocated, index),
                LOG_ORIGIN,
                "cache '{}': double free of {:p}",
                self.name,
                obj
            );

            if let Some(dtor) = self.dtor {
                dtor(obj);
                clear_bit(&mut header.constructed, index);
            }
            clear_bit(&mut header.allocated, index);
            self.push_free(header, index);

            let was_full = header.in_use as usize == self.capacity;
            header.in_use -= 1;
            (was_full, header.in_use == 0)
        };

        unsafe {
            if was_full {
                lists.full.unlink(slab);
                if now_empty {
                    lists.empty.push(slab);
                } else {
                    lists.partial.push(slab);
                }
            } else if now_empty {
                lists.partial.unlink(slab);
                lists.empty.push(slab);
            }
        }
        lists.live -= 1;
    }

    /// Returns every empty slab to the page source. Returns how many went.
    pub fn purge(&self) -> usize {
        let mut lists = self.lists.lock();
        let mut purged = 0;
        while let Some(slab) = lists.empty.first() {
            unsafe { lists.empty.unlink(slab) };
            self.release_slab(slab);
            purged += 1;
        }
        if purged > 0 {
            log_debug!(LOG_ORIGIN, "Cache '{}' purged {} slabs", self.name, purged);
        }
        purged
    }

    fn release_slab(&self, mut slab: NonNull<SlabHeader>) {
        let header = unsafe { slab.as_mut() };
        if let Some(dtor) = self.dtor {
            for index in 0..self.capacity {
                if test_bit(&header.constructed, index) {
                    dtor(self.object(header, index));
                }
            }
        }
        header.magic = 0;
        let objects = header.objects;

        if self.direct {
            self.pages.free_pages(objects, 1);
        } else {
            self.pages.free_pages(objects, self.block_pages());
            self.pages.free_pages(slab.cast(), 1);
        }
    }

    /// Tears the cache down. Every object must have been freed.
    pub fn destroy(self) {
        let live = self.lists.lock().live;
        kassert!(live == 0, LOG_ORIGIN, "cache '{}' destroyed with {} live objects", self.name, live);
    }

    pub fn stats(&self) -> SlabStats {
        let lists = self.lists.lock();
        SlabStats {
            empty_slabs: lists.empty.len(),
            partial_slabs: lists.partial.len(),
            full_slabs: lists.full.len(),
            objects_in_use: lists.live,
            objects_per_slab: self.capacity,
            stride: self.stride,
        }
    }
}

impl Drop for SlabCache {
    fn drop(&mut self) {
        self.purge();
        let lists = self.lists.lock();
        if lists.live > 0 {
            log_warn!(
                LOG_ORIGIN,
                "Cache '{}' dropped with {} live objects; leaking {} slabs",
                self.name,
                lists.live,
                lists.partial.len() + lists.full.len()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::HeapPages;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    fn cache(size: usize, align: usize) -> (SlabCache, &'static HeapPages) {
        let pages = HeapPages::leaked();
        (SlabCache::new("test", size, align, None, None, pages).unwrap(), pages)
    }

    #[test]
    fn rejects_bad_layouts() {
        let pages = HeapPages::leaked();
        for (size, align) in [(0, 8), (32, 3), (32, 2 * PAGE_SIZE), (8, PAGE_SIZE)] {
            assert_eq!(
                SlabCache::new("bad", size, align, None, None, pages).err(),
                Some(SlabError::InvalidLayout),
                "size={} align={}",
                size,
                align
            );
        }
    }

    #[test]
    fn free_objects_keep_their_contents() {
        let (cache, _) = cache(24, 8);
        assert_eq!(cache.stats().stride, 32);

        let obj = cache.alloc().unwrap();
        unsafe { ptr::write_bytes(obj.as_ptr(), 0xAA, 24) };
        cache.free(obj);

        let again = cache.alloc().unwrap();
        assert_eq!(again, obj);
        let bytes = unsafe { core::slice::from_raw_parts(again.as_ptr(), 24) };
        assert!(bytes.iter().all(|&b| b == 0xAA));
        cache.free(again);
    }

    #[test]
    fn alloc_all_then_free_all_returns_to_empty() {
        let (cache, pages) = cache(64, 16);
        let per_slab = cache.stats().objects_per_slab;
        let n = 3 * per_slab + 5;

        let mut seen = HashSet::new();
        let mut objs = Vec::new();
        for _ in 0..n {
            let obj = cache.alloc().unwrap();
            assert_eq!(obj.as_ptr() as usize % 16, 0);
            assert!(seen.insert(obj.as_ptr() as usize), "object issued twice");
            objs.push(obj);
        }
        let stats = cache.stats();
        assert_eq!((stats.full_slabs, stats.partial_slabs, stats.empty_slabs), (3, 1, 0));
        assert_eq!(stats.objects_in_use, n);

        for obj in objs {
            cache.free(obj);
        }
        let stats = cache.stats();
        assert_eq!((stats.full_slabs, stats.partial_slabs, stats.empty_slabs), (0, 0, 4));
        assert_eq!(stats.objects_in_use, 0);

        assert_eq!(cache.purge(), 4);
        assert_eq!(pages.outstanding(), 0);
    }

    #[test]
    fn partial_slabs_are_preferred() {
        let (cache, _) = cache(128, 8);
        let per_slab = cache.stats().objects_per_slab;
        let objs: Vec<_> = (0..per_slab + 1).map(|_| cache.alloc().unwrap()).collect();

        // Free one from the full slab; it becomes partial and serves next.
        cache.free(objs[0]);
        assert_eq!(cache.stats().partial_slabs, 2);
        assert_eq!(cache.alloc().unwrap(), objs[0]);
    }

    #[test]
    fn indirect_slabs_hold_sixteen_objects() {
        let (cache, pages) = cache(1000, 8);
        let stats = cache.stats();
        assert_eq!((stats.objects_per_slab, stats.stride), (INDIRECT_BATCH, 1000));

        let objs: Vec<_> = (0..INDIRECT_BATCH + 1).map(|_| cache.alloc().unwrap()).collect();
        assert_eq!(cache.stats().full_slabs, 1);
        // Header page plus a four-page block per slab.
        assert_eq!(pages.outstanding(), 2 * (1 + pages_for(INDIRECT_BATCH * 1000)));

        let unique: HashSet<_> = objs.iter().map(|o| o.as_ptr() as usize).collect();
        assert_eq!(unique.len(), objs.len());

        for obj in objs {
            cache.free(obj);
        }
        cache.purge();
        assert_eq!(pages.outstanding(), 0);
    }

    static CONSTRUCTED: AtomicUsize = AtomicUsize::new(0);
    static DESTROYED: AtomicUsize = AtomicUsize::new(0);

    fn construct(obj: NonNull<u8>) {
        CONSTRUCTED.fetch_add(1, Ordering::SeqCst);
        unsafe { obj.as_ptr().write(0x5A) };
    }

    fn destruct(obj: NonNull<u8>) {
        DESTROYED.fetch_add(1, Ordering::SeqCst);
        unsafe { obj.as_ptr().write(0) };
    }

    #[test]
    fn constructors_and_destructors_pair_up() {
        let cache = SlabCache::new("hooks", 200, 8, Some(construct), Some(destruct), HeapPages::leaked()).unwrap();
        let per_slab = cache.stats().objects_per_slab;

        let obj = cache.alloc().unwrap();
        assert_eq!(CONSTRUCTED.load(Ordering::SeqCst), per_slab);
        assert_eq!(unsafe { obj.as_ptr().read() }, 0x5A);

        cache.free(obj);
        assert_eq!(DESTROYED.load(Ordering::SeqCst), 1);

        // A destroyed object is rebuilt before it is handed out again.
        let obj = cache.alloc().unwrap();
        assert_eq!(unsafe { obj.as_ptr().read() }, 0x5A);
        assert_eq!(CONSTRUCTED.load(Ordering::SeqCst), per_slab + 1);

        cache.free(obj);
        cache.destroy();
        assert_eq!(CONSTRUCTED.load(Ordering::SeqCst), DESTROYED.load(Ordering::SeqCst));
    }

    static HOOK_CALLS: AtomicUsize = AtomicUsize::new(0);
    static HOOK_SAW_IRQS: AtomicUsize = AtomicUsize::new(0);

    fn record_irq_state(_obj: NonNull<u8>) {
        HOOK_CALLS.fetch_add(1, Ordering::SeqCst);
        if crate::sync::interrupts_enabled() {
            HOOK_SAW_IRQS.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn list_lock_masks_interrupts() {
        let cache =
            SlabCache::new("irq", 64, 8, Some(record_irq_state), Some(record_irq_state), HeapPages::leaked()).unwrap();
        assert!(crate::sync::interrupts_enabled());

        // Hooks run while the list lock is held.
        let obj = cache.alloc().unwrap();
        cache.free(obj);
        assert!(HOOK_CALLS.load(Ordering::SeqCst) > 0);
        assert_eq!(HOOK_SAW_IRQS.load(Ordering::SeqCst), 0);
        assert!(crate::sync::interrupts_enabled());

        // Inside a trap the flag is already clear and must stay clear.
        crate::sync::without_interrupts(|| {
            let obj = cache.alloc().unwrap();
            cache.free(obj);
            assert!(!crate::sync::interrupts_enabled());
        });
        assert!(crate::sync::interrupts_enabled());
    }

    #[test]
    fn running_out_of_pages_is_recoverable() {
        let (cache, pages) = cache(32, 8);
        pages.fail_after(0);
        assert_eq!(cache.alloc(), Err(SlabError::Exhausted));
        assert_eq!(cache.stats().objects_in_use, 0);

        let (indirect, pages) = cache_indirect();
        pages.fail_after(1);
        assert_eq!(indirect.alloc(), Err(SlabError::Exhausted));
        assert_eq!(pages.outstanding(), 0);
    }

    fn cache_indirect() -> (SlabCache, &'static HeapPages) {
        cache(2048, 16)
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_aborts() {
        let (cache, _) = cache(48, 8);
        let obj = cache.alloc().unwrap();
        let _keep = cache.alloc().unwrap();
        cache.free(obj);
        cache.free(obj);
    }

    #[test]
    #[should_panic(expected = "foreign pointer")]
    fn foreign_pointer_aborts() {
        let (a, _) = cache(48, 8);
        let (b, _) = cache(48, 8);
        let obj = a.alloc().unwrap();
        b.free(obj);
    }

    #[test]
    fn concurrent_alloc_and_free() {
        let cache = Arc::new(SlabCache::new("shared", 40, 8, None, None, HeapPages::leaked()).unwrap());
        let workers: Vec<_> = (0..4)
            .map(|_| {
                let cache = cache.clone();
                thread::spawn(move || {
                    for _ in 0..500 {
                        let held: Vec<usize> = (0..8).map(|_| cache.alloc().unwrap().as_ptr() as usize).collect();
                        for addr in held {
                            cache.free(NonNull::new(addr as *mut u8).unwrap());
                        }
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        let stats = cache.stats();
        assert_eq!(stats.objects_in_use, 0);
        assert_eq!(stats.full_slabs + stats.partial_slabs, 0);
    }
}

// Page Cache
//
// Global cache of file pages keyed by (file, page-aligned offset). Demand
// paging of file-backed ranges goes through here, so every mapping of the
// same file page shares one physical frame.
//
// Key responsibilities:
// - At most one `Page` per key, even under concurrent misses
// - Populate pages from the backing file outside the table lock
// - Track dirty pages and write them back on request
// - Drop clean, unmapped pages of a file on eviction
//
// Implementation details:
// - 256 hash buckets plus a per-file page list and a global dirty list, all
//   under one interrupt-safe spinlock; page state bits are atomics
// - A `Page` owns one PMM reference on its frame and releases it when the
//   last `Arc<Page>` goes away
// - A miss allocates the frame before taking the lock, publishes the page
//   in a not-yet-READY state, then fills it; racing fetchers yield to the
//   scheduler until the page becomes READY or ERROR
//
// Correctness notes:
// - A page whose frame is still mapped somewhere is written back but stays
//   DIRTY: a writable shared mapping keeps accepting stores without
//   faulting, so only an unmapped page can be declared clean
// - A page that failed to fill is removed from the table before it is
//   flagged ERROR, so a retrying fetcher never finds it again

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use bitflags::bitflags;

use super::{FrameAllocator, PhysAddr, PAGE_SIZE};
use crate::fs::{FileId, FileRef};
use crate::sync::IrqMutex;
use crate::timer::Clock;
use crate::{log_debug, log_warn};

const LOG_ORIGIN: &str = "pagecache";

pub const BUCKETS: usize = 256;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageState: u32 {
        /// Contents are valid.
        const READY     = 1 << 0;
        /// Modified since the last write-back.
        const DIRTY     = 1 << 1;
        /// Filling failed; the page is no longer in the table.
        const ERROR     = 1 << 2;
        /// Evicted from the cache.
        const TRUNCATED = 1 << 3;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheError {
    OutOfMemory,
    Io,
}

impl CacheError {
    pub fn to_errno(self) -> i64 {
        match self {
            CacheError::OutOfMemory => -12, // ENOMEM
            CacheError::Io => -5,           // EIO
        }
    }
}

pub struct Page {
    frame: PhysAddr,
    file: FileRef,
    offset: u64,
    state: AtomicU32,
    pmm: &'static dyn FrameAllocator,
}

impl Page {
    pub fn frame(&self) -> PhysAddr {
        self.frame
    }

    pub fn file(&self) -> &FileRef {
        &self.file
    }

    pub fn file_id(&self) -> FileId {
        self.file.id()
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn state(&self) -> PageState {
        PageState::from_bits_truncate(self.state.load(Ordering::Acquire))
    }

    pub fn is_ready(&self) -> bool {
        self.state().contains(PageState::READY)
    }

    pub fn is_dirty(&self) -> bool {
        self.state().contains(PageState::DIRTY)
    }

    /// Sets `flags`, returning the previous state.
    fn set(&self, flags: PageState) -> PageState {
        PageState::from_bits_truncate(self.state.fetch_or(flags.bits(), Ordering::AcqRel))
    }

    fn clear(&self, flags: PageState) -> PageState {
        PageState::from_bits_truncate(self.state.fetch_and(!flags.bits(), Ordering::AcqRel))
    }

    fn matches(&self, file: FileId, offset: u64) -> bool {
        self.offset == offset && self.file.id() == file
    }
}

impl Drop for Page {
    fn drop(&mut self) {
        self.pmm.release(self.frame);
    }
}

impl core::fmt::Debug for Page {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Page")
            .field("frame", &self.frame)
            .field("file", &self.file.id())
            .field("offset", &self.offset)
            .field("state", &self.state())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    pub pages: usize,
    pub dirty: usize,
    pub hits: u64,
    pub misses: u64,
    pub io_errors: u64,
}

struct Table {
    buckets: Vec<Vec<Arc<Page>>>,
    files: BTreeMap<FileId, Vec<Arc<Page>>>,
    dirty: Vec<Arc<Page>>,
}

impl Table {
    fn find(&self, file: FileId, offset: u64) -> Option<&Arc<Page>> {
        self.buckets[bucket(file, offset)]
            .iter()
            .find(|page| page.matches(file, offset))
    }

    fn insert(&mut self, page: Arc<Page>) {
        let id = page.file_id();
        self.buckets[bucket(id, page.offset)].push(page.clone());
        self.files.entry(id).or_default().push(page);
    }

    fn remove(&mut self, page: &Arc<Page>) {
        let id = page.file_id();
        let chain = &mut self.buckets[bucket(id, page.offset)];
        if let Some(pos) = chain.iter().position(|p| Arc::ptr_eq(p, page)) {
            chain.swap_remove(pos);
        }
        if let Some(list) = self.files.get_mut(&id) {
            if let Some(pos) = list.iter().position(|p| Arc::ptr_eq(p, page)) {
                list.swap_remove(pos);
            }
            if list.is_empty() {
                self.files.remove(&id);
            }
        }
    }
}

fn bucket(file: FileId, offset: u64) -> usize {
    let hash = file.wrapping_mul(0x9E37_79B9_7F4A_7C15) ^ (offset >> 12);
    (hash % BUCKETS as u64) as usize
}

pub struct PageCache {
    table: IrqMutex<Table>,
    pmm: &'static dyn FrameAllocator,
    clock: &'static dyn Clock,
    hits: AtomicU64,
    misses: AtomicU64,
    io_errors: AtomicU64,
}

impl PageCache {
    pub fn new(pmm: &'static dyn FrameAllocator, clock: &'static dyn Clock) -> Self {
        let mut buckets = Vec::with_capacity(BUCKETS);
        buckets.resize_with(BUCKETS, Vec::new);

        PageCache {
            table: IrqMutex::new(Table {
                buckets,
                files: BTreeMap::new(),
                dirty: Vec::new(),
            }),
            pmm,
            clock,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            io_errors: AtomicU64::new(0),
        }
    }

    /// Returns the READY page holding `file` at `offset` (rounded down to a
    /// page), reading it in on a miss.
    pub fn get_page(&self, file: &FileRef, offset: u64) -> Result<Arc<Page>, CacheError> {
        let id = file.id();
        let offset = offset & !(PAGE_SIZE as u64 - 1);

        loop {
            let cached = self.table.lock().find(id, offset).cloned();
            if let Some(page) = cached {
                if wait_settled(&page) {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(page);
                }
                continue;
            }

            let frame = self.pmm.alloc().ok_or(CacheError::OutOfMemory)?;
            let page = Arc::new(Page {
                frame,
                file: file.clone(),
                offset,
                state: AtomicU32::new(0),
                pmm: self.pmm,
            });

            {
                let mut table = self.table.lock();
                if table.find(id, offset).is_some() {
                    // Someone else published it first; our frame goes back
                    // when `page` drops.
                    continue;
                }
                table.insert(page.clone());
            }
            self.misses.fetch_add(1, Ordering::Relaxed);

            let mut result = Ok(());
            self.pmm.with_frame(frame, &mut |bytes| result = file.fill_page(offset, bytes));

            match result {
                Ok(()) => {
                    page.set(PageState::READY);
                    log_debug!(LOG_ORIGIN, "Filled file {} offset {:#X} into frame {:#X}", id, offset, frame);
                    return Ok(page);
                }
                Err(err) => {
                    self.table.lock().remove(&page);
                    page.set(PageState::ERROR);
                    self.io_errors.fetch_add(1, Ordering::Relaxed);
                    log_warn!(LOG_ORIGIN, "Reading file {} offset {:#X} failed: {:?}", id, offset, err);
                    return Err(CacheError::Io);
                }
            }
        }
    }

    /// Cached page for the key, in whatever state it is.
    pub fn lookup(&self, file: FileId, offset: u64) -> Option<Arc<Page>> {
        let offset = offset & !(PAGE_SIZE as u64 - 1);
        self.table.lock().find(file, offset).cloned()
    }

    /// Marks a page modified. Only the first call after a write-back queues
    /// it and stamps the file's modification time.
    pub fn make_dirty(&self, page: &Arc<Page>) {
        if page.set(PageState::DIRTY).contains(PageState::DIRTY) {
            return;
        }
        self.table.lock().dirty.push(page.clone());
        page.file.set_modified(self.clock.now());
    }

    /// Writes every dirty page back to its file. Pages that fail stay dirty
    /// and queued; the error is reported after all pages were tried. Pages
    /// that are still mapped are written and stay queued.
    pub fn write_back(&self) -> Result<usize, CacheError> {
        let queued = core::mem::take(&mut self.table.lock().dirty);
        let mut written = 0;
        let mut failed = Vec::new();
        let mut mapped = Vec::new();

        for page in queued {
            page.clear(PageState::DIRTY);

            let mut result = Ok(());
            self.pmm.with_frame(page.frame, &mut |bytes| {
                result = page.file.write_page(page.offset, bytes);
            });

            match result {
                Ok(()) => {
                    written += 1;
                    // The page owns one reference; any other is a mapping.
                    if self.pmm.refcount(page.frame) > 1 && !page.set(PageState::DIRTY).contains(PageState::DIRTY) {
                        mapped.push(page);
                    }
                }
                Err(err) => {
                    log_warn!(
                        LOG_ORIGIN,
                        "Write-back of file {} offset {:#X} failed: {:?}",
                        page.file_id(),
                        page.offset,
                        err
                    );
                    // A concurrent `make_dirty` may already have queued it.
                    if !page.set(PageState::DIRTY).contains(PageState::DIRTY) {
                        failed.push(page);
                    }
                }
            }
        }

        let errors = failed.len();
        {
            let mut table = self.table.lock();
            table.dirty.extend(mapped);
            table.dirty.extend(failed);
        }
        if errors == 0 {
            return Ok(written);
        }
        self.io_errors.fetch_add(errors as u64, Ordering::Relaxed);
        Err(CacheError::Io)
    }

    /// Drops clean pages of `file` that nobody maps or holds. Returns the
    /// number of pages evicted.
    pub fn evict_file(&self, file: FileId) -> usize {
        let mut table = self.table.lock();
        let candidates: Vec<Arc<Page>> = match table.files.get(&file) {
            Some(pages) => pages.clone(),
            None => return 0,
        };

        let mut evicted = 0;
        for page in candidates {
            // Held by the bucket, the file list and `candidates`.
            let unused = Arc::strong_count(&page) == 3 && self.pmm.refcount(page.frame) == 1;
            if page.is_dirty() || !page.is_ready() || !unused {
                continue;
            }
            table.remove(&page);
            page.set(PageState::TRUNCATED);
            evicted += 1;
        }

        if evicted > 0 {
            log_debug!(LOG_ORIGIN, "Evicted {} pages of file {}", evicted, file);
        }
        evicted
    }

    pub fn stats(&self) -> CacheStats {
        let table = self.table.lock();
        CacheStats {
            pages: table.files.values().map(Vec::len).sum(),
            dirty: table.dirty.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            io_errors: self.io_errors.load(Ordering::Relaxed),
        }
    }
}

/// Waits until the filler finishes. True if the page is usable.
fn wait_settled(page: &Page) -> bool {
    loop {
        let state = page.state();
        if state.contains(PageState::ERROR) {
            return false;
        }
        if state.contains(PageState::READY) {
            return true;
        }
        crate::sched::relax();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{clock, ManualClock, MockFile, MockPmm};
    use std::thread;

    fn cache(frames: usize) -> (PageCache, &'static MockPmm) {
        let pmm = MockPmm::leaked(frames);
        (PageCache::new(pmm, clock()), pmm)
    }

    #[test]
    fn miss_fills_then_hit_returns_same_page() {
        let (cache, pmm) = cache(8);
        let file: FileRef = MockFile::with_pattern(1, 4 * PAGE_SIZE);

        let page = cache.get_page(&file, PAGE_SIZE as u64 + 17).unwrap();
        assert_eq!(page.offset(), PAGE_SIZE as u64);
        assert!(page.is_ready());
        pmm.with_frame(page.frame(), &mut |bytes| {
            assert_eq!(bytes[0], MockFile::pattern_byte(PAGE_SIZE as u64));
        });

        let again = cache.get_page(&file, PAGE_SIZE as u64).unwrap();
        assert!(Arc::ptr_eq(&page, &again));

        let stats = cache.stats();
        assert_eq!((stats.pages, stats.hits, stats.misses), (1, 1, 1));
    }

    #[test]
    fn concurrent_fetchers_share_one_fill() {
        let (cache, _) = cache(8);
        let mock = MockFile::with_pattern(2, 4 * PAGE_SIZE);
        mock.set_fill_delay_ms(20);
        let file: FileRef = mock.clone();
        let cache: &'static PageCache = Box::leak(Box::new(cache));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let file = file.clone();
                thread::spawn(move || cache.get_page(&file, 0).unwrap())
            })
            .collect();
        let pages: Vec<Arc<Page>> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert!(pages.iter().all(|p| Arc::ptr_eq(p, &pages[0])));
        assert_eq!(mock.fills(), 1);
        assert_eq!(cache.stats().pages, 1);
    }

    #[test]
    fn failed_fill_is_not_cached() {
        let (cache, pmm) = cache(8);
        let mock = MockFile::with_pattern(3, 4 * PAGE_SIZE);
        mock.fail_next_fill();
        let file: FileRef = mock.clone();
        let free_before = pmm.stats().free_pages;

        assert_eq!(cache.get_page(&file, 0).unwrap_err(), CacheError::Io);
        assert!(cache.lookup(3, 0).is_none());
        assert_eq!(pmm.stats().free_pages, free_before);
        assert_eq!(cache.stats().io_errors, 1);

        // The next attempt reads again and succeeds.
        assert!(cache.get_page(&file, 0).unwrap().is_ready());
        assert_eq!(mock.fills(), 2);
    }

    #[test]
    fn out_of_frames_is_reported() {
        let (cache, pmm) = cache(1);
        let file: FileRef = MockFile::with_pattern(4, 4 * PAGE_SIZE);
        let _held = cache.get_page(&file, 0).unwrap();
        assert_eq!(pmm.stats().free_pages, 0);
        assert_eq!(cache.get_page(&file, PAGE_SIZE as u64).unwrap_err(), CacheError::OutOfMemory);
    }

    #[test]
    fn make_dirty_is_idempotent_and_stamps_the_file() {
        let clock = ManualClock::leaked();
        let cache = PageCache::new(MockPmm::leaked(8), clock);
        let mock = MockFile::with_pattern(5, 4 * PAGE_SIZE);
        let file: FileRef = mock.clone();
        let page = cache.get_page(&file, 0).unwrap();

        clock.set(42);
        cache.make_dirty(&page);
        cache.make_dirty(&page);
        assert!(page.is_dirty());
        assert_eq!(cache.stats().dirty, 1);
        assert_eq!(mock.modified_at(), Some(42));
    }

    #[test]
    fn write_back_flushes_and_requeues_failures() {
        let (cache, pmm) = cache(8);
        let mock = MockFile::with_pattern(6, 4 * PAGE_SIZE);
        let file: FileRef = mock.clone();
        let a = cache.get_page(&file, 0).unwrap();
        let b = cache.get_page(&file, PAGE_SIZE as u64).unwrap();
        pmm.with_frame(a.frame(), &mut |bytes| bytes[0] = 0xEE);
        cache.make_dirty(&a);
        cache.make_dirty(&b);

        mock.fail_next_write();
        assert_eq!(cache.write_back(), Err(CacheError::Io));
        assert_eq!(cache.stats().dirty, 1);

        assert_eq!(cache.write_back(), Ok(1));
        assert_eq!(cache.stats().dirty, 0);
        assert!(!a.is_dirty() && !b.is_dirty());
        assert_eq!(mock.written_byte(0), Some(0xEE));
    }

    #[test]
    fn stores_through_a_live_mapping_survive_write_back() {
        let (cache, pmm) = cache(8);
        let mock = MockFile::with_pattern(8, 4 * PAGE_SIZE);
        let file: FileRef = mock.clone();
        let page = cache.get_page(&file, 0).unwrap();

        // A shared writable mapping holds the frame and stores without
        // faulting after the first upgrade.
        pmm.hold(page.frame());
        pmm.with_frame(page.frame(), &mut |bytes| bytes[0] = 0x11);
        cache.make_dirty(&page);
        assert_eq!(cache.write_back(), Ok(1));
        assert_eq!(mock.written_byte(0), Some(0x11));
        assert!(page.is_dirty());

        pmm.with_frame(page.frame(), &mut |bytes| bytes[0] = 0x22);
        assert_eq!(cache.write_back(), Ok(1));
        assert_eq!(mock.written_byte(0), Some(0x22));

        // Unmapped, the next write-back finally leaves it clean.
        pmm.release(page.frame());
        assert_eq!(cache.write_back(), Ok(1));
        assert!(!page.is_dirty());
        assert_eq!(cache.stats().dirty, 0);
        assert_eq!(cache.write_back(), Ok(0));
    }

    #[test]
    fn eviction_skips_dirty_mapped_and_held_pages() {
        let (cache, pmm) = cache(8);
        let file: FileRef = MockFile::with_pattern(7, 8 * PAGE_SIZE);

        let clean = cache.get_page(&file, 0).unwrap();
        let clean_frame = clean.frame();
        drop(clean);

        let dirty = cache.get_page(&file, PAGE_SIZE as u64).unwrap();
        cache.make_dirty(&dirty);
        drop(dirty);

        let mapped = cache.get_page(&file, 2 * PAGE_SIZE as u64).unwrap();
        pmm.hold(mapped.frame());
        let mapped_frame = mapped.frame();
        drop(mapped);

        let held = cache.get_page(&file, 3 * PAGE_SIZE as u64).unwrap();

        assert_eq!(cache.evict_file(7), 1);
        assert!(cache.lookup(7, 0).is_none());
        assert_eq!(pmm.refcount(clean_frame), 0);
        assert!(cache.lookup(7, PAGE_SIZE as u64).is_some());
        assert!(cache.lookup(7, 2 * PAGE_SIZE as u64).is_some());
        assert!(cache.lookup(7, 3 * PAGE_SIZE as u64).is_some());
        assert!(!held.state().contains(PageState::TRUNCATED));

        pmm.release(mapped_frame);
        assert_eq!(cache.evict_file(7), 1);
        assert_eq!(cache.evict_file(99), 0);
    }

    #[test]
    fn keys_spread_over_buckets() {
        let used: std::collections::BTreeSet<usize> = (0..64u64).map(|i| bucket(1, i * PAGE_SIZE as u64)).collect();
        assert!(used.len() > 32);
        assert!(used.iter().all(|&b| b < BUCKETS));
    }
}

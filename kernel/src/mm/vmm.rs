// Virtual Address-Space Range Tracker
//
// Owns the per-address-space list of mapped ranges and keeps it consistent
// with the page tables.
//
// Key responsibilities:
// - Place new ranges (first fit or caller hint) and populate them eagerly
//   from caller frames or fresh zeroed frames, or leave them to demand
//   paging
// - Unmap/protect arbitrary page spans, splitting and trimming ranges
// - Fork a user address space copy-on-write and tear it down on exit
// - Map an address to its address space for the fault handler
//
// Design principles:
// - One spinlock per address space guards its range list; page-table
//   updates for that space happen under the same lock so a concurrent
//   fault never sees a range whose pages are half torn down
// - Failure leaves the range list and page tables exactly as they were
//
// Implementation details:
// - Ranges live in a `Vec` sorted by start address; neighbours with equal
//   attributes are coalesced after every insertion
// - Unmap order is: clear PTEs, invalidate TLB, update bookkeeping, then
//   release frames, so no CPU can reach a frame after it is freed
// - Fork maps the child completely before write-protecting the parent
//
// Correctness notes:
// - Only ranges that own their frames (`Range::owns_frames`) take and drop
//   PMM references; PHYS and NOCACHE frames belong to someone else

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, Ordering};
use spin::{Mutex, MutexGuard};

use super::cache::PageCache;
use super::fault::FixupTable;
use super::range::{Backing, MapFlags, Range};
use super::slab::PageSource;
use super::{
    align_up, is_page_aligned, FrameAllocator, Mmu, PhysAddr, Prot, TableRoot, VirtAddr, VmError,
    KERNEL_RANGE_END, KERNEL_RANGE_START, PAGE_SIZE, USER_END, USER_ORIGIN,
};
use crate::fs::{Access, Credentials};
use crate::timer::Clock;
use crate::{kabort, log_debug, log_info, log_warn};

const LOG_ORIGIN: &str = "vmm";

/// Hardware collaborators shared by every address space.
#[derive(Clone, Copy)]
pub struct Hw {
    pub pmm: &'static dyn FrameAllocator,
    pub mmu: &'static dyn Mmu,
}

/// How a new range gets its pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Populate {
    /// Map caller-owned frames starting at this physical address.
    Physical(PhysAddr),
    /// Map freshly zeroed frames now.
    Allocate,
    /// Map nothing; pages arrive on first fault.
    Reserve,
}

pub struct AddressSpace {
    origin: VirtAddr,
    end: VirtAddr,
    table: TableRoot,
    hw: Hw,
    ranges: Mutex<Vec<Range>>,
}

impl AddressSpace {
    pub fn new(origin: VirtAddr, end: VirtAddr, table: TableRoot, hw: Hw) -> Self {
        AddressSpace {
            origin,
            end,
            table,
            hw,
            ranges: Mutex::new(Vec::new()),
        }
    }

    pub fn origin(&self) -> VirtAddr {
        self.origin
    }

    pub fn end(&self) -> VirtAddr {
        self.end
    }

    pub fn table(&self) -> TableRoot {
        self.table
    }

    pub fn hw(&self) -> Hw {
        self.hw
    }

    pub fn covers(&self, addr: VirtAddr) -> bool {
        addr >= self.origin && addr < self.end
    }

    pub(super) fn lock_ranges(&self) -> MutexGuard<'_, Vec<Range>> {
        self.ranges.lock()
    }

    /// Snapshot of the range list.
    pub fn ranges(&self) -> Vec<Range> {
        self.ranges.lock().clone()
    }

    /// Range covering `addr`.
    pub fn range_at(&self, addr: VirtAddr) -> Option<Range> {
        let ranges = self.ranges.lock();
        find(&ranges, addr).map(|i| ranges[i].clone())
    }

    pub fn map(
        &self,
        hint: Option<VirtAddr>,
        size: usize,
        flags: MapFlags,
        prot: Prot,
        populate: Populate,
        backing: Option<Backing>,
    ) -> Result<VirtAddr, VmError> {
        if size == 0 {
            return Err(VmError::InvalidSize);
        }
        let size = align_up(size).ok_or(VmError::InvalidSize)?;

        let mut flags = flags;
        match populate {
            Populate::Physical(pa) => {
                if backing.is_some() {
                    return Err(VmError::InvalidArgument);
                }
                if !is_page_aligned(pa) {
                    return Err(VmError::InvalidAddress);
                }
                flags |= MapFlags::PHYS;
            }
            Populate::Allocate if backing.is_some() => return Err(VmError::InvalidArgument),
            _ => {}
        }
        if flags.contains(MapFlags::NOCACHE) && backing.is_none() {
            return Err(VmError::InvalidArgument);
        }

        let mut ranges = self.ranges.lock();
        let start = self.place(&ranges, hint, size, flags)?;

        let range = Range::new(start, size, prot, flags, backing);
        let owned = range.owns_frames();
        let pages = size / PAGE_SIZE;

        for i in 0..pages {
            let va = start + i * PAGE_SIZE;
            let result = match populate {
                Populate::Reserve => break,
                Populate::Physical(pa) => self.hw.mmu.map(self.table, va, pa + i * PAGE_SIZE, prot),
                Populate::Allocate => match self.hw.pmm.alloc_zeroed() {
                    Some(frame) => self.hw.mmu.map(self.table, va, frame, prot).map_err(|err| {
                        self.hw.pmm.release(frame);
                        err
                    }),
                    None => Err(VmError::OutOfMemory),
                },
            };

            if let Err(err) = result {
                log_warn!(
                    LOG_ORIGIN,
                    "map {:#X}+{:#X} failed at page {}: {:?}, unwinding",
                    start,
                    size,
                    i,
                    err
                );
                self.unwind(start, i, owned);
                return Err(err);
            }
        }

        insert(&mut ranges, range);

        log_debug!(
            LOG_ORIGIN,
            "Mapped {:#X}..{:#X} prot={:?} flags={:?} {:?}",
            start,
            start + size,
            prot,
            flags,
            populate
        );
        Ok(start)
    }

    fn place(&self, ranges: &[Range], hint: Option<VirtAddr>, size: usize, flags: MapFlags) -> Result<VirtAddr, VmError> {
        if let Some(addr) = hint {
            if is_page_aligned(addr) && self.is_free(ranges, addr, size) {
                return Ok(addr);
            }
            if flags.contains(MapFlags::EXACT) {
                let in_bounds = is_page_aligned(addr)
                    && addr >= self.origin
                    && addr.checked_add(size).map_or(false, |end| end <= self.end);
                return Err(if in_bounds { VmError::AlreadyMapped } else { VmError::InvalidAddress });
            }
        } else if flags.contains(MapFlags::EXACT) {
            return Err(VmError::InvalidArgument);
        }

        self.first_fit(ranges, size).ok_or(VmError::NoSpace)
    }

    fn is_free(&self, ranges: &[Range], start: VirtAddr, size: usize) -> bool {
        let end = match start.checked_add(size) {
            Some(end) => end,
            None => return false,
        };
        start >= self.origin && end <= self.end && !ranges.iter().any(|r| r.overlaps(start, end))
    }

    fn first_fit(&self, ranges: &[Range], size: usize) -> Option<VirtAddr> {
        let mut cursor = self.origin;
        for range in ranges {
            if range.start >= cursor && range.start - cursor >= size {
                return Some(cursor);
            }
            cursor = cursor.max(range.end());
        }
        (self.end >= cursor && self.end - cursor >= size).then_some(cursor)
    }

    /// Undoes the first `pages` pages of a failed map.
    fn unwind(&self, start: VirtAddr, pages: usize, owned: bool) {
        let mut frames = Vec::new();
        for i in 0..pages {
            if let Some(pa) = self.hw.mmu.unmap(self.table, start + i * PAGE_SIZE) {
                frames.push(pa);
            }
        }
        if pages > 0 {
            self.hw.mmu.invalidate_range(self.table, start, start + pages * PAGE_SIZE);
        }
        if owned {
            for pa in frames {
                self.hw.pmm.release(pa);
            }
        }
    }

    fn check_span(&self, addr: VirtAddr, size: usize) -> Result<VirtAddr, VmError> {
        if !is_page_aligned(addr) {
            return Err(VmError::InvalidAddress);
        }
        if size == 0 {
            return Err(VmError::InvalidSize);
        }
        let size = align_up(size).ok_or(VmError::InvalidSize)?;
        let end = addr.checked_add(size).ok_or(VmError::InvalidAddress)?;
        if addr < self.origin || end > self.end {
            return Err(VmError::InvalidAddress);
        }
        Ok(end)
    }

    pub fn unmap(&self, addr: VirtAddr, size: usize) -> Result<(), VmError> {
        let end = self.check_span(addr, size)?;

        let mut ranges = self.ranges.lock();
        if !ranges.iter().any(|r| r.overlaps(addr, end)) {
            return Err(VmError::NotMapped);
        }

        // Page tables first.
        let mut frames = Vec::new();
        for range in ranges.iter().filter(|r| r.overlaps(addr, end)) {
            let from = range.start.max(addr);
            let to = range.end().min(end);
            for va in (from..to).step_by(PAGE_SIZE) {
                if let Some(pa) = self.hw.mmu.unmap(self.table, va) {
                    if range.owns_frames() {
                        frames.push(pa);
                    }
                }
            }
        }
        self.hw.mmu.invalidate_range(self.table, addr, end);

        // Then bookkeeping.
        let mut i = 0;
        while i < ranges.len() {
            if !ranges[i].overlaps(addr, end) {
                i += 1;
                continue;
            }

            let covers_front = addr <= ranges[i].start;
            let covers_back = end >= ranges[i].end();
            match (covers_front, covers_back) {
                (true, true) => {
                    ranges.remove(i);
                    continue;
                }
                (false, false) => {
                    let mut right = ranges[i].split_off(addr);
                    right.trim_front(end);
                    ranges.insert(i + 1, right);
                    i += 2;
                    continue;
                }
                (true, false) => ranges[i].trim_front(end),
                (false, true) => ranges[i].trim_back(addr),
            }
            i += 1;
        }
        drop(ranges);

        // Frames last.
        let released = frames.len();
        for pa in frames {
            self.hw.pmm.release(pa);
        }

        log_debug!(LOG_ORIGIN, "Unmapped {:#X}..{:#X} ({} frames dropped)", addr, end, released);
        Ok(())
    }

    pub fn protect(&self, addr: VirtAddr, size: usize, prot: Prot, cred: &Credentials) -> Result<(), VmError> {
        let end = self.check_span(addr, size)?;

        let mut ranges = self.ranges.lock();

        // The whole span must be mapped.
        let mut cursor = addr;
        for range in ranges.iter().filter(|r| r.overlaps(addr, end)) {
            if range.start > cursor {
                return Err(VmError::NotMapped);
            }
            cursor = range.end();
        }
        if cursor < end {
            return Err(VmError::NotMapped);
        }

        for range in ranges.iter().filter(|r| r.overlaps(addr, end)) {
            let gains_write = prot.contains(Prot::WRITE) && !range.prot.contains(Prot::WRITE);
            if !gains_write || !range.is_shared() || !range.flags.contains(MapFlags::CRED_CHECK) {
                continue;
            }
            if let Some(backing) = &range.backing {
                if backing.file.check_access(cred, Access::Write).is_err() {
                    log_warn!(
                        LOG_ORIGIN,
                        "protect {:#X}..{:#X}: write access to file {} denied for uid {}",
                        addr,
                        end,
                        backing.file.id(),
                        cred.uid
                    );
                    return Err(VmError::PermissionDenied);
                }
            }
        }

        // Page tables first, so a failed remap leaves the ranges untouched.
        let mut updates = Vec::new();
        for range in ranges.iter().filter(|r| r.overlaps(addr, end)) {
            let mut target = range.clone();
            target.prot = prot;
            let from = range.start.max(addr);
            let to = range.end().min(end);
            for va in (from..to).step_by(PAGE_SIZE) {
                let (current, pa) = match (self.hw.mmu.flags(self.table, va), self.hw.mmu.translate(self.table, va)) {
                    (Some(current), Some(pa)) => (current, pa),
                    _ => continue,
                };
                let refcount = if range.owns_frames() { self.hw.pmm.refcount(pa) } else { 0 };
                let resident = target.resident_prot(current, refcount);
                if resident != current {
                    updates.push((va, pa, current, resident));
                }
            }
        }

        for (done, &(va, pa, _, resident)) in updates.iter().enumerate() {
            if let Err(err) = self.hw.mmu.remap(self.table, va, pa, resident) {
                for &(va, pa, previous, _) in &updates[..done] {
                    if self.hw.mmu.remap(self.table, va, pa, previous).is_err() {
                        log_warn!(LOG_ORIGIN, "protect rollback: {:#X} lost its mapping", va);
                    }
                }
                self.hw.mmu.invalidate_range(self.table, addr, end);
                log_warn!(LOG_ORIGIN, "protect {:#X}..{:#X} failed at {:#X}: {:?}, rolled back", addr, end, va, err);
                return Err(err);
            }
        }

        // Then bookkeeping: split so every affected range lies inside the
        // span, and take the new protection.
        let mut i = 0;
        while i < ranges.len() {
            if ranges[i].contains(addr) && ranges[i].start < addr {
                let right = ranges[i].split_off(addr);
                ranges.insert(i + 1, right);
            } else if ranges[i].contains(end) && ranges[i].start < end {
                let right = ranges[i].split_off(end);
                ranges.insert(i + 1, right);
            }
            i += 1;
        }
        for range in ranges.iter_mut().filter(|r| r.overlaps(addr, end)) {
            range.prot = prot;
        }
        self.hw.mmu.invalidate_range(self.table, addr, end);

        coalesce(&mut ranges);
        log_debug!(LOG_ORIGIN, "Protected {:#X}..{:#X} as {:?}", addr, end, prot);
        Ok(())
    }

    /// Tears down every range of the space.
    fn unmap_all(&self) {
        let mut ranges = self.ranges.lock();
        let mut frames = Vec::new();

        for range in ranges.iter() {
            for va in (range.start..range.end()).step_by(PAGE_SIZE) {
                if let Some(pa) = self.hw.mmu.unmap(self.table, va) {
                    if range.owns_frames() {
                        frames.push(pa);
                    }
                }
            }
        }
        self.hw.mmu.invalidate_range(self.table, self.origin, self.end);
        ranges.clear();
        drop(ranges);

        for pa in frames {
            self.hw.pmm.release(pa);
        }
    }
}

/// Kernel slab caches grow through the kernel address space.
impl PageSource for AddressSpace {
    fn alloc_pages(&self, count: usize) -> Option<NonNull<u8>> {
        let addr = self
            .map(None, count * PAGE_SIZE, MapFlags::empty(), Prot::RW, Populate::Allocate, None)
            .ok()?;
        NonNull::new(addr as *mut u8)
    }

    fn free_pages(&self, pages: NonNull<u8>, count: usize) {
        if let Err(err) = self.unmap(pages.as_ptr() as VirtAddr, count * PAGE_SIZE) {
            kabort!(LOG_ORIGIN, "slab pages {:p} not mapped in kernel space: {:?}", pages, err);
        }
    }
}

/// Index of the range covering `addr`.
pub(super) fn find(ranges: &[Range], addr: VirtAddr) -> Option<usize> {
    let i = ranges.partition_point(|r| r.end() <= addr);
    (i < ranges.len() && ranges[i].contains(addr)).then_some(i)
}

fn insert(ranges: &mut Vec<Range>, range: Range) {
    let mut pos = ranges.partition_point(|r| r.start < range.start);
    ranges.insert(pos, range);

    if pos + 1 < ranges.len() && ranges[pos].can_merge(&ranges[pos + 1]) {
        let next = ranges.remove(pos + 1);
        ranges[pos].merge(next);
    }
    if pos > 0 && ranges[pos - 1].can_merge(&ranges[pos]) {
        let current = ranges.remove(pos);
        pos -= 1;
        ranges[pos].merge(current);
    }
}

fn coalesce(ranges: &mut Vec<Range>) {
    let mut i = 0;
    while i + 1 < ranges.len() {
        if ranges[i].can_merge(&ranges[i + 1]) {
            let next = ranges.remove(i + 1);
            ranges[i].merge(next);
        } else {
            i += 1;
        }
    }
}

/// A process's memory: its page table and user address space.
pub struct VmmContext {
    space: AddressSpace,
    destroyed: AtomicBool,
    /// Set when the process died; its threads are reaped by the scheduler.
    terminated: AtomicBool,
}

impl VmmContext {
    pub fn new(hw: Hw) -> Result<Arc<VmmContext>, VmError> {
        let table = hw.mmu.new_table()?;
        log_debug!(LOG_ORIGIN, "New context, table {:#X}", table.0);
        Ok(Arc::new(VmmContext {
            space: AddressSpace::new(USER_ORIGIN, USER_END, table, hw),
            destroyed: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
        }))
    }

    pub fn space(&self) -> &AddressSpace {
        &self.space
    }

    pub fn table(&self) -> TableRoot {
        self.space.table
    }

    /// Copy-on-write duplicate of this context.
    pub fn fork(&self) -> Result<Arc<VmmContext>, VmError> {
        let hw = self.space.hw;
        let parent_table = self.space.table;
        let child = VmmContext::new(hw)?;
        let child_table = child.space.table;

        let parent_ranges = self.space.ranges.lock();
        *child.space.ranges.lock() = parent_ranges.clone();

        let mut downgrade: Vec<(VirtAddr, PhysAddr, Prot)> = Vec::new();

        for range in parent_ranges.iter() {
            for va in (range.start..range.end()).step_by(PAGE_SIZE) {
                let pa = match hw.mmu.translate(parent_table, va) {
                    Some(pa) => pa,
                    None => continue,
                };
                let mapped = hw.mmu.flags(parent_table, va).unwrap_or(range.prot);

                let private = range.owns_frames() && !range.is_shared();
                let child_prot = if private { mapped - Prot::WRITE } else { mapped };

                if let Err(err) = hw.mmu.map(child_table, va, pa, child_prot) {
                    log_warn!(LOG_ORIGIN, "fork: mapping {:#X} in child failed: {:?}", va, err);
                    drop(parent_ranges);
                    // Dropping the child unmaps what was mapped so far and
                    // releases the references taken for it.
                    drop(child);
                    return Err(err);
                }
                if range.owns_frames() {
                    hw.pmm.hold(pa);
                }
                if private && mapped.contains(Prot::WRITE) {
                    downgrade.push((va, pa, mapped - Prot::WRITE));
                }
            }
        }

        // The child is complete; only now does the parent lose write access.
        let (mut lo, mut hi) = (usize::MAX, 0);
        for &(va, pa, prot) in &downgrade {
            if let Err(err) = hw.mmu.remap(parent_table, va, pa, prot) {
                kabort!(LOG_ORIGIN, "fork: write-protecting resident page {:#X} failed: {:?}", va, err);
            }
            lo = lo.min(va);
            hi = hi.max(va + PAGE_SIZE);
        }
        if !downgrade.is_empty() {
            hw.mmu.invalidate_range(parent_table, lo, hi);
        }
        drop(parent_ranges);

        log_info!(
            LOG_ORIGIN,
            "Forked context {:#X} -> {:#X} ({} pages write-protected)",
            parent_table.0,
            child_table.0,
            downgrade.len()
        );
        Ok(child)
    }

    /// Marks the process dead. Returns false if it already was.
    pub fn terminate(&self) -> bool {
        !self.terminated.swap(true, Ordering::AcqRel)
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    /// Unmaps the whole user range and frees the page table. Idempotent.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.space.unmap_all();
        self.space.hw.mmu.destroy_table(self.space.table);
        log_debug!(LOG_ORIGIN, "Destroyed context, table {:#X}", self.space.table.0);
    }
}

impl Drop for VmmContext {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// The memory core: the shared kernel address space, the page cache and
/// the kernel may-fault regions.
pub struct Vm {
    hw: Hw,
    kernel: AddressSpace,
    cache: PageCache,
    fixups: FixupTable,
}

impl Vm {
    pub fn new(hw: Hw, kernel_table: TableRoot, clock: &'static dyn Clock) -> Self {
        log_info!(
            LOG_ORIGIN,
            "Kernel range {:#X}..{:#X}, table {:#X}",
            KERNEL_RANGE_START,
            KERNEL_RANGE_END,
            kernel_table.0
        );
        Vm {
            hw,
            kernel: AddressSpace::new(KERNEL_RANGE_START, KERNEL_RANGE_END, kernel_table, hw),
            cache: PageCache::new(hw.pmm, clock),
            fixups: FixupTable::new(),
        }
    }

    pub fn hw(&self) -> Hw {
        self.hw
    }

    pub fn kernel_space(&self) -> &AddressSpace {
        &self.kernel
    }

    pub fn cache(&self) -> &PageCache {
        &self.cache
    }

    pub fn fixups(&self) -> &FixupTable {
        &self.fixups
    }

    pub fn new_context(&self) -> Result<Arc<VmmContext>, VmError> {
        VmmContext::new(self.hw)
    }

    /// Address space responsible for `addr`: the kernel space at or above
    /// the canonical boundary, otherwise the context's user space.
    pub fn get_space<'a>(&'a self, ctx: Option<&'a VmmContext>, addr: VirtAddr) -> Option<&'a AddressSpace> {
        if addr >= USER_END {
            Some(&self.kernel)
        } else {
            ctx.map(|ctx| ctx.space())
        }
    }

    pub fn get_range(&self, ctx: Option<&VmmContext>, addr: VirtAddr) -> Option<Range> {
        self.get_space(ctx, addr)?.range_at(addr)
    }

    /// Loads the context's table, or the kernel table for kernel threads.
    pub fn switch_to(&self, ctx: Option<&VmmContext>) {
        let root = ctx.map(|ctx| ctx.table()).unwrap_or(self.kernel.table);
        self.hw.mmu.switch_to(root);
    }
}

// Host Test Doubles
//
// In-memory stand-ins for every collaborator the kernel core consumes
// through a trait: frame allocator, page-table layer, backing files,
// clock, CPU platform and slab page source. Compiled only for `cargo test`.
//
// Implementation details:
// - Physical memory is a leaked, page-aligned host allocation; frame
//   addresses are host pointers, so the direct map is the identity
// - Doubles are leaked (`&'static`) because the kernel holds its
//   collaborators as `&'static dyn Trait`
// - Failure injection is counted: `fail_after(n)` lets `n` more requests
//   succeed and fails the rest

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::boxed::Box;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::vec::Vec;

use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use spin::Mutex;

use crate::arch::{FpuState, Platform};
use crate::fs::{Access, BackingFile, Credentials, FileId, IoError};
use crate::mm::pmm::{BitmapPmm, MemoryStats};
use crate::mm::slab::PageSource;
use crate::mm::{FrameAllocator, Hw, Mmu, PhysAddr, Prot, TableRoot, VirtAddr, VmError, PAGE_SIZE};
use crate::timer::Clock;

const UNLIMITED: usize = usize::MAX;

/// Takes one unit from a failure budget; false once it is spent.
fn spend(budget: &AtomicUsize) -> bool {
    budget
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |left| match left {
            UNLIMITED => Some(UNLIMITED),
            0 => None,
            n => Some(n - 1),
        })
        .is_ok()
}

/// Page-aligned host memory standing in for `frames` physical frames.
pub fn arena(frames: usize) -> PhysAddr {
    let layout = Layout::from_size_align(frames.max(1) * PAGE_SIZE, PAGE_SIZE).unwrap();
    let base = unsafe { alloc_zeroed(layout) };
    assert!(!base.is_null());
    base as PhysAddr
}

/// Bitmap words and reference counts for a `BitmapPmm` of `frames` frames.
pub fn leak_counts(frames: usize) -> (&'static [AtomicU64], &'static [AtomicU32]) {
    let words = (frames + 63) / 64;
    let bitmap: Vec<AtomicU64> = (0..words).map(|_| AtomicU64::new(0)).collect();
    let counts: Vec<AtomicU32> = (0..frames).map(|_| AtomicU32::new(0)).collect();
    (Box::leak(bitmap.into_boxed_slice()), Box::leak(counts.into_boxed_slice()))
}

/// A real `BitmapPmm` over an arena, with allocation failure injection.
pub struct MockPmm {
    inner: BitmapPmm,
    budget: AtomicUsize,
}

impl MockPmm {
    pub fn new(frames: usize) -> Self {
        let base = arena(frames);
        let (bitmap, counts) = leak_counts(frames);
        let inner = BitmapPmm::new(base, frames, 0, bitmap, counts);
        inner.add_region(base, frames * PAGE_SIZE);
        MockPmm { inner, budget: AtomicUsize::new(UNLIMITED) }
    }

    pub fn leaked(frames: usize) -> &'static MockPmm {
        Box::leak(Box::new(MockPmm::new(frames)))
    }

    pub fn fail_after(&self, allocations: usize) {
        self.budget.store(allocations, Ordering::Release);
    }
}

impl FrameAllocator for MockPmm {
    fn alloc(&self) -> Option<PhysAddr> {
        if !spend(&self.budget) {
            return None;
        }
        self.inner.alloc()
    }

    fn alloc_contiguous(&self, count: usize) -> Option<PhysAddr> {
        if !spend(&self.budget) {
            return None;
        }
        self.inner.alloc_contiguous(count)
    }

    fn free_contiguous(&self, base: PhysAddr, count: usize) {
        self.inner.free_contiguous(base, count)
    }

    fn hold(&self, frame: PhysAddr) {
        self.inner.hold(frame)
    }

    fn release(&self, frame: PhysAddr) -> bool {
        self.inner.release(frame)
    }

    fn refcount(&self, frame: PhysAddr) -> usize {
        self.inner.refcount(frame)
    }

    fn phys_to_virt(&self, frame: PhysAddr) -> *mut u8 {
        self.inner.phys_to_virt(frame)
    }

    fn stats(&self) -> MemoryStats {
        self.inner.stats()
    }
}

type Leaves = BTreeMap<VirtAddr, (PhysAddr, Prot)>;

/// Page tables as ordered maps; records loads and TLB invalidations.
pub struct MockMmu {
    tables: Mutex<HashMap<TableRoot, Leaves>>,
    next_root: AtomicUsize,
    map_budget: AtomicUsize,
    remap_budget: AtomicUsize,
    invalidations: Mutex<Vec<(TableRoot, VirtAddr, VirtAddr)>>,
    active: Mutex<Option<TableRoot>>,
}

impl MockMmu {
    pub fn new() -> Self {
        MockMmu {
            tables: Mutex::new(HashMap::new()),
            next_root: AtomicUsize::new(1),
            map_budget: AtomicUsize::new(UNLIMITED),
            remap_budget: AtomicUsize::new(UNLIMITED),
            invalidations: Mutex::new(Vec::new()),
            active: Mutex::new(None),
        }
    }

    pub fn leaked() -> &'static MockMmu {
        Box::leak(Box::new(MockMmu::new()))
    }

    /// Lets `maps` more `map` calls succeed, fails the next one, then
    /// recovers.
    pub fn fail_map_after(&self, maps: usize) {
        self.map_budget.store(maps, Ordering::Release);
    }

    /// Same as `fail_map_after`, for `remap`.
    pub fn fail_remap_after(&self, remaps: usize) {
        self.remap_budget.store(remaps, Ordering::Release);
    }

    pub fn mapped_count(&self, root: TableRoot) -> usize {
        self.tables.lock().get(&root).map_or(0, |leaves| leaves.len())
    }

    pub fn invalidations(&self) -> Vec<(TableRoot, VirtAddr, VirtAddr)> {
        self.invalidations.lock().clone()
    }

    pub fn table_count(&self) -> usize {
        self.tables.lock().len()
    }

    pub fn table_exists(&self, root: TableRoot) -> bool {
        self.tables.lock().contains_key(&root)
    }

    pub fn active(&self) -> Option<TableRoot> {
        *self.active.lock()
    }
}

/// Takes one call from a fail-once budget. True when this call must fail;
/// the budget then resets to unlimited.
fn fails_now(budget: &AtomicUsize) -> bool {
    budget
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |left| match left {
            UNLIMITED => None,
            0 => Some(UNLIMITED),
            n => Some(n - 1),
        })
        == Ok(0)
}

impl Default for MockMmu {
    fn default() -> Self {
        MockMmu::new()
    }
}

impl Mmu for MockMmu {
    fn new_table(&self) -> Result<TableRoot, VmError> {
        let root = TableRoot(self.next_root.fetch_add(1, Ordering::Relaxed) * PAGE_SIZE);
        self.tables.lock().insert(root, Leaves::new());
        Ok(root)
    }

    fn destroy_table(&self, root: TableRoot) {
        self.tables.lock().remove(&root);
    }

    fn map(&self, root: TableRoot, virt: VirtAddr, phys: PhysAddr, prot: Prot) -> Result<(), VmError> {
        if fails_now(&self.map_budget) {
            return Err(VmError::OutOfMemory);
        }

        let mut tables = self.tables.lock();
        let leaves = tables.get_mut(&root).ok_or(VmError::InvalidAddress)?;
        if leaves.contains_key(&virt) {
            return Err(VmError::AlreadyMapped);
        }
        leaves.insert(virt, (phys, prot));
        Ok(())
    }

    fn unmap(&self, root: TableRoot, virt: VirtAddr) -> Option<PhysAddr> {
        self.tables.lock().get_mut(&root)?.remove(&virt).map(|(pa, _)| pa)
    }

    fn remap(&self, root: TableRoot, virt: VirtAddr, phys: PhysAddr, prot: Prot) -> Result<(), VmError> {
        if fails_now(&self.remap_budget) {
            return Err(VmError::OutOfMemory);
        }
        let mut tables = self.tables.lock();
        let leaf = tables
            .get_mut(&root)
            .and_then(|leaves| leaves.get_mut(&virt))
            .ok_or(VmError::NotMapped)?;
        *leaf = (phys, prot);
        Ok(())
    }

    fn translate(&self, root: TableRoot, virt: VirtAddr) -> Option<PhysAddr> {
        let page = virt & !(PAGE_SIZE - 1);
        let tables = self.tables.lock();
        tables.get(&root)?.get(&page).map(|&(pa, _)| pa + (virt - page))
    }

    fn flags(&self, root: TableRoot, virt: VirtAddr) -> Option<Prot> {
        let page = virt & !(PAGE_SIZE - 1);
        self.tables.lock().get(&root)?.get(&page).map(|&(_, prot)| prot)
    }

    fn invalidate_range(&self, root: TableRoot, start: VirtAddr, end: VirtAddr) {
        self.invalidations.lock().push((root, start, end));
    }

    fn switch_to(&self, root: TableRoot) {
        *self.active.lock() = Some(root);
    }
}

/// Fresh frame allocator and page-table layer.
pub fn hw(frames: usize) -> (Hw, &'static MockPmm, &'static MockMmu) {
    let pmm = MockPmm::leaked(frames);
    let mmu = MockMmu::leaked();
    (Hw { pmm, mmu }, pmm, mmu)
}

/// Backing file with scripted failures and observable side effects.
pub struct MockFile {
    id: FileId,
    size: u64,
    patterned: bool,
    locked: AtomicBool,
    locks: AtomicUsize,
    direct_base: Mutex<Option<PhysAddr>>,
    denied_uid: Mutex<Option<u32>>,
    fill_delay_ms: AtomicU64,
    fills: AtomicUsize,
    fail_fill: AtomicBool,
    fail_write: AtomicBool,
    modified: Mutex<Option<u64>>,
    written: Mutex<HashMap<u64, Vec<u8>>>,
}

impl MockFile {
    fn build(id: FileId, size: usize, patterned: bool) -> Arc<MockFile> {
        Arc::new(MockFile {
            id,
            size: size as u64,
            patterned,
            locked: AtomicBool::new(false),
            locks: AtomicUsize::new(0),
            direct_base: Mutex::new(None),
            denied_uid: Mutex::new(None),
            fill_delay_ms: AtomicU64::new(0),
            fills: AtomicUsize::new(0),
            fail_fill: AtomicBool::new(false),
            fail_write: AtomicBool::new(false),
            modified: Mutex::new(None),
            written: Mutex::new(HashMap::new()),
        })
    }

    /// A zero-filled file of `size` bytes.
    pub fn new(id: FileId, size: usize) -> Arc<MockFile> {
        MockFile::build(id, size, false)
    }

    /// A file whose byte at `offset` is `pattern_byte(offset)`.
    pub fn with_pattern(id: FileId, size: usize) -> Arc<MockFile> {
        MockFile::build(id, size, true)
    }

    pub fn pattern_byte(offset: u64) -> u8 {
        (offset as u8) ^ ((offset >> 12) as u8).wrapping_mul(0x9D) ^ 0x5C
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Acquire)
    }

    /// Times the lock was taken.
    pub fn lock_count(&self) -> usize {
        self.locks.load(Ordering::Acquire)
    }

    /// Serves `direct_map` from consecutive frames starting at `base`.
    pub fn set_direct_base(&self, base: PhysAddr) {
        *self.direct_base.lock() = Some(base);
    }

    pub fn deny_writes_for(&self, uid: u32) {
        *self.denied_uid.lock() = Some(uid);
    }

    pub fn set_fill_delay_ms(&self, ms: u64) {
        self.fill_delay_ms.store(ms, Ordering::Release);
    }

    pub fn fills(&self) -> usize {
        self.fills.load(Ordering::Acquire)
    }

    pub fn fail_next_fill(&self) {
        self.fail_fill.store(true, Ordering::Release);
    }

    pub fn fail_next_write(&self) {
        self.fail_write.store(true, Ordering::Release);
    }

    pub fn modified_at(&self) -> Option<u64> {
        *self.modified.lock()
    }

    /// Byte at `offset` as last written back, if its page was written.
    pub fn written_byte(&self, offset: u64) -> Option<u8> {
        let page = offset & !(PAGE_SIZE as u64 - 1);
        let written = self.written.lock();
        written.get(&page).map(|bytes| bytes[(offset - page) as usize])
    }
}

impl BackingFile for MockFile {
    fn id(&self) -> FileId {
        self.id
    }

    fn lock(&self) {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            core::hint::spin_loop();
        }
        self.locks.fetch_add(1, Ordering::AcqRel);
    }

    fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }

    fn direct_map(&self, offset: u64) -> Result<PhysAddr, IoError> {
        let base = (*self.direct_base.lock()).ok_or(IoError::Unsupported)?;
        if offset >= self.size {
            return Err(IoError::OutOfRange);
        }
        Ok(base + (offset as usize & !(PAGE_SIZE - 1)))
    }

    fn fill_page(&self, offset: u64, page: &mut [u8]) -> Result<(), IoError> {
        self.fills.fetch_add(1, Ordering::AcqRel);
        let delay = self.fill_delay_ms.load(Ordering::Acquire);
        if delay > 0 {
            std::thread::sleep(std::time::Duration::from_millis(delay));
        }
        if self.fail_fill.swap(false, Ordering::AcqRel) {
            return Err(IoError::Device);
        }
        if offset >= self.size {
            return Err(IoError::OutOfRange);
        }

        for (i, byte) in page.iter_mut().enumerate() {
            let pos = offset + i as u64;
            *byte = if pos < self.size && self.patterned { MockFile::pattern_byte(pos) } else { 0 };
        }
        Ok(())
    }

    fn write_page(&self, offset: u64, page: &[u8]) -> Result<(), IoError> {
        if self.fail_write.swap(false, Ordering::AcqRel) {
            return Err(IoError::Device);
        }
        self.written.lock().insert(offset, page.to_vec());
        Ok(())
    }

    fn set_modified(&self, now: u64) {
        *self.modified.lock() = Some(now);
    }

    fn check_access(&self, cred: &Credentials, access: Access) -> Result<(), IoError> {
        match (access, *self.denied_uid.lock()) {
            (Access::Write, Some(uid)) if uid == cred.uid => Err(IoError::Denied),
            _ => Ok(()),
        }
    }
}

/// Clock advanced by hand.
pub struct ManualClock {
    ticks: AtomicU64,
}

impl ManualClock {
    pub const fn new() -> Self {
        ManualClock { ticks: AtomicU64::new(0) }
    }

    pub fn leaked() -> &'static ManualClock {
        Box::leak(Box::new(ManualClock::new()))
    }

    pub fn set(&self, ticks: u64) {
        self.ticks.store(ticks, Ordering::Release);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> u64 {
        self.ticks.load(Ordering::Acquire)
    }
}

static FROZEN_CLOCK: ManualClock = ManualClock::new();

/// Clock stuck at tick 0.
pub fn clock() -> &'static dyn Clock {
    &FROZEN_CLOCK
}

/// CPU platform recording what the scheduler asked of it.
pub struct MockPlatform {
    cpu: AtomicUsize,
    irqs: AtomicBool,
    halts: AtomicUsize,
    reschedules: AtomicUsize,
    fpu_saves: AtomicUsize,
    kernel_stacks: Mutex<Vec<Option<u64>>>,
    segment_bases: Mutex<(u64, u64)>,
    fault_address: AtomicU64,
}

impl MockPlatform {
    pub fn new(cpus: usize) -> Self {
        MockPlatform {
            cpu: AtomicUsize::new(0),
            irqs: AtomicBool::new(true),
            halts: AtomicUsize::new(0),
            reschedules: AtomicUsize::new(0),
            fpu_saves: AtomicUsize::new(0),
            kernel_stacks: Mutex::new(vec![None; cpus.max(1)]),
            segment_bases: Mutex::new((0, 0)),
            fault_address: AtomicU64::new(0),
        }
    }

    /// Makes `cpu_id` report `cpu`.
    pub fn set_cpu(&self, cpu: usize) {
        self.cpu.store(cpu, Ordering::Release);
    }

    pub fn irqs_enabled(&self) -> bool {
        self.irqs.load(Ordering::Acquire)
    }

    pub fn halts(&self) -> usize {
        self.halts.load(Ordering::Acquire)
    }

    pub fn reschedules(&self) -> usize {
        self.reschedules.load(Ordering::Acquire)
    }

    pub fn fpu_saves(&self) -> usize {
        self.fpu_saves.load(Ordering::Acquire)
    }

    pub fn kernel_stack(&self, cpu: usize) -> Option<u64> {
        self.kernel_stacks.lock().get(cpu).copied().flatten()
    }

    pub fn set_fault_address(&self, addr: u64) {
        self.fault_address.store(addr, Ordering::Release);
    }
}

impl Platform for MockPlatform {
    fn cpu_id(&self) -> usize {
        self.cpu.load(Ordering::Acquire)
    }

    fn irq_save(&self) -> bool {
        self.irqs.swap(false, Ordering::AcqRel)
    }

    fn irq_restore(&self, was_enabled: bool) {
        self.irqs.store(was_enabled, Ordering::Release);
    }

    fn save_fpu(&self, _area: &mut FpuState) {
        self.fpu_saves.fetch_add(1, Ordering::AcqRel);
    }

    fn restore_fpu(&self, _area: &FpuState) {}

    fn read_segment_bases(&self) -> (u64, u64) {
        *self.segment_bases.lock()
    }

    fn write_segment_bases(&self, fs_base: u64, gs_base: u64) {
        *self.segment_bases.lock() = (fs_base, gs_base);
    }

    fn set_kernel_stack(&self, cpu: usize, top: u64) {
        if let Some(slot) = self.kernel_stacks.lock().get_mut(cpu) {
            *slot = Some(top);
        }
    }

    fn halt(&self) {
        self.halts.fetch_add(1, Ordering::AcqRel);
    }

    fn raise_reschedule(&self) {
        self.reschedules.fetch_add(1, Ordering::AcqRel);
    }

    fn fault_address(&self) -> u64 {
        self.fault_address.load(Ordering::Acquire)
    }
}

/// Slab page source over the host allocator.
pub struct HeapPages {
    outstanding: AtomicUsize,
    budget: AtomicUsize,
}

impl HeapPages {
    pub fn leaked() -> &'static HeapPages {
        Box::leak(Box::new(HeapPages {
            outstanding: AtomicUsize::new(0),
            budget: AtomicUsize::new(UNLIMITED),
        }))
    }

    /// Pages currently handed out.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    pub fn fail_after(&self, requests: usize) {
        self.budget.store(requests, Ordering::Release);
    }

    fn layout(count: usize) -> Layout {
        Layout::from_size_align(count * PAGE_SIZE, PAGE_SIZE).unwrap()
    }
}

impl PageSource for HeapPages {
    fn alloc_pages(&self, count: usize) -> Option<NonNull<u8>> {
        if count == 0 || !spend(&self.budget) {
            return None;
        }
        let pages = NonNull::new(unsafe { alloc_zeroed(HeapPages::layout(count)) })?;
        self.outstanding.fetch_add(count, Ordering::AcqRel);
        Some(pages)
    }

    fn free_pages(&self, pages: NonNull<u8>, count: usize) {
        unsafe { dealloc(pages.as_ptr(), HeapPages::layout(count)) };
        self.outstanding.fetch_sub(count, Ordering::AcqRel);
    }
}

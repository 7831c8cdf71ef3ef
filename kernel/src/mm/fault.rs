// Page-Fault Handler
//
// Resolves page faults against the range tracker: demand-populates
// anonymous, file-backed and device ranges, performs copy-on-write, and
// decides what happens to faults nobody can resolve.
//
// Fault flow:
// - Classify: kernel-mode faults above the canonical boundary are only
//   legal inside the dynamic kernel range; user-mode faults never are
// - Resolve: covering address space, then covering range
// - Permission: the access (and user mode) must be allowed by the range
// - Not resident: populate from the device, the page cache, or a zeroed
//   frame
// - Resident but read-only on a write to a writable range: copy-on-write
// - Anything else was spurious (another CPU already resolved it)
//
// Locking:
// - Cache I/O can take a long time, so the page is fetched with the range
//   lock dropped; the range is looked up again afterwards and the fault is
//   retried if it changed underneath
//
// Unresolved faults:
// - Kernel code that may fault on user memory registers its instruction
//   span in the `FixupTable`; such faults resume at the fixup address
// - User-mode faults terminate the faulting process context
// - Everything else is fatal

use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::RwLock;

use super::cache::{CacheError, Page};
use super::range::{MapFlags, Range};
use super::vmm::{find, AddressSpace, Vm, VmmContext};
use super::{align_down, Prot, VirtAddr, KERNEL_RANGE_END, KERNEL_RANGE_START, PAGE_SIZE, USER_END};
use crate::fs::FileLock;
use crate::{log_debug, log_warn};

const LOG_ORIGIN: &str = "fault";

/// x86 page-fault error code bits.
const PF_WRITE: u64 = 1 << 1;
const PF_USER: u64 = 1 << 2;
const PF_INSTR: u64 = 1 << 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultAccess {
    Read,
    Write,
    Execute,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    User,
    Kernel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultInfo {
    pub addr: VirtAddr,
    pub access: FaultAccess,
    pub mode: Mode,
    /// Faulting instruction.
    pub ip: u64,
}

impl FaultInfo {
    pub fn from_error_code(addr: u64, error_code: u64, ip: u64) -> Self {
        let access = if error_code & PF_INSTR != 0 {
            FaultAccess::Execute
        } else if error_code & PF_WRITE != 0 {
            FaultAccess::Write
        } else {
            FaultAccess::Read
        };
        let mode = if error_code & PF_USER != 0 { Mode::User } else { Mode::Kernel };

        FaultInfo { addr: addr as VirtAddr, access, mode, ip }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// A missing page was mapped.
    Populated,
    /// A private page was copied or upgraded in place.
    CopyOnWrite,
    /// A shared page was made writable (and dirtied if file-backed).
    SharedWrite,
    Spurious,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unhandled {
    /// Kernel address outside the dynamic kernel range, or a user-mode
    /// access above the boundary.
    KernelAddress,
    /// No address space for the address (kernel thread touching user memory).
    NoSpace,
    NoRange,
    Permission,
    OutOfMemory,
    Io,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    Handled(FaultKind),
    Unhandled(Unhandled),
}

/// What the trap handler does after the fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Re-execute the faulting instruction.
    Resume,
    /// Continue at a registered fixup address.
    ResumeAt(u64),
    TerminateProcess,
    Abort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FixupRegion {
    start: u64,
    end: u64,
    fixup: u64,
}

/// Kernel instruction spans that are allowed to fault on user memory.
pub struct FixupTable {
    regions: RwLock<Vec<FixupRegion>>,
}

impl FixupTable {
    pub const fn new() -> Self {
        FixupTable { regions: RwLock::new(Vec::new()) }
    }

    pub fn register(&self, start: u64, end: u64, fixup: u64) {
        self.regions.write().push(FixupRegion { start, end, fixup });
    }

    pub fn lookup(&self, ip: u64) -> Option<u64> {
        self.regions
            .read()
            .iter()
            .find(|r| ip >= r.start && ip < r.end)
            .map(|r| r.fixup)
    }
}

impl Default for FixupTable {
    fn default() -> Self {
        FixupTable::new()
    }
}

fn allows(range: &Range, info: &FaultInfo) -> bool {
    let needed = match info.access {
        FaultAccess::Read => Prot::READ,
        FaultAccess::Write => Prot::WRITE,
        FaultAccess::Execute => Prot::EXEC,
    };
    if !range.prot.contains(needed) {
        return false;
    }
    info.mode == Mode::Kernel || range.prot.contains(Prot::USER)
}

fn io_outcome(err: CacheError) -> FaultOutcome {
    match err {
        CacheError::OutOfMemory => FaultOutcome::Unhandled(Unhandled::OutOfMemory),
        CacheError::Io => FaultOutcome::Unhandled(Unhandled::Io),
    }
}

impl Vm {
    /// Resolves a fault taken while `ctx` was the active context.
    pub fn handle_fault(&self, ctx: Option<&VmmContext>, info: &FaultInfo) -> FaultOutcome {
        let addr = info.addr;
        if addr >= USER_END {
            let in_kernel_range = addr >= KERNEL_RANGE_START && addr < KERNEL_RANGE_END;
            if info.mode == Mode::User || !in_kernel_range {
                return FaultOutcome::Unhandled(Unhandled::KernelAddress);
            }
        }

        let space = match self.get_space(ctx, addr) {
            Some(space) => space,
            None => return FaultOutcome::Unhandled(Unhandled::NoSpace),
        };

        loop {
            let range = match space.range_at(addr) {
                Some(range) => range,
                None => return FaultOutcome::Unhandled(Unhandled::NoRange),
            };
            if !allows(&range, info) {
                return FaultOutcome::Unhandled(Unhandled::Permission);
            }

            // Read the file page, if one will be needed, without the lock.
            let page_va = align_down(addr);
            let resident = self.hw().mmu.translate(space.table(), page_va).is_some();
            let cached = match self.prefetch(&range, page_va, resident) {
                Ok(cached) => cached,
                Err(err) => return io_outcome(err),
            };

            if let Some(outcome) = self.resolve_locked(space, info, page_va, cached) {
                return outcome;
            }
            log_debug!(LOG_ORIGIN, "Range at {:#X} changed during fill, retrying", addr);
        }
    }

    fn prefetch(&self, range: &Range, page_va: VirtAddr, resident: bool) -> Result<Option<Arc<Page>>, CacheError> {
        if resident || range.flags.contains(MapFlags::NOCACHE) {
            return Ok(None);
        }
        match &range.backing {
            Some(backing) => {
                let offset = backing.offset + (page_va - range.start) as u64;
                self.cache().get_page(&backing.file, offset).map(Some)
            }
            None => Ok(None),
        }
    }

    /// Second half of the fault under the range lock. `None` asks for a
    /// retry because the range no longer matches what was prefetched.
    fn resolve_locked(
        &self,
        space: &AddressSpace,
        info: &FaultInfo,
        page_va: VirtAddr,
        cached: Option<Arc<Page>>,
    ) -> Option<FaultOutcome> {
        let ranges = space.lock_ranges();
        let range = match find(&ranges, info.addr) {
            Some(i) => &ranges[i],
            None => return Some(FaultOutcome::Unhandled(Unhandled::NoRange)),
        };
        if !allows(range, info) {
            return Some(FaultOutcome::Unhandled(Unhandled::Permission));
        }

        let mmu = self.hw().mmu;
        let table = space.table();

        let pa = match mmu.translate(table, page_va) {
            Some(pa) => pa,
            None => {
                let needs_page = range.backing.is_some() && !range.flags.contains(MapFlags::NOCACHE);
                let usable = match &cached {
                    Some(page) => range.file_offset(page_va) == Some(page.offset())
                        && range.backing.as_ref().map(|b| b.file.id()) == Some(page.file_id()),
                    None => !needs_page,
                };
                if !usable {
                    return None;
                }
                return Some(self.populate(space, range, page_va, cached));
            }
        };

        let mapped = mmu.flags(table, page_va).unwrap_or(Prot::empty());
        if info.access == FaultAccess::Write && !mapped.contains(Prot::WRITE) && range.prot.contains(Prot::WRITE) {
            return Some(self.copy_on_write(space, range, page_va, pa));
        }

        Some(FaultOutcome::Handled(FaultKind::Spurious))
    }

    fn populate(&self, space: &AddressSpace, range: &Range, page_va: VirtAddr, cached: Option<Arc<Page>>) -> FaultOutcome {
        let hw = self.hw();
        let table = space.table();

        if range.flags.contains(MapFlags::NOCACHE) {
            let backing = match &range.backing {
                Some(backing) => backing,
                None => return FaultOutcome::Unhandled(Unhandled::NoRange),
            };
            let offset = backing.offset + (page_va - range.start) as u64;
            let _lock = FileLock::new(&*backing.file);
            let pa = match backing.file.direct_map(offset) {
                Ok(pa) => pa,
                Err(err) => {
                    log_warn!(LOG_ORIGIN, "direct_map of file {} offset {:#X} failed: {:?}", backing.file.id(), offset, err);
                    return FaultOutcome::Unhandled(Unhandled::Io);
                }
            };
            return match hw.mmu.map(table, page_va, pa, range.prot) {
                Ok(()) => FaultOutcome::Handled(FaultKind::Populated),
                Err(_) => FaultOutcome::Unhandled(Unhandled::OutOfMemory),
            };
        }

        if let Some(page) = cached {
            // Cache pages start read-only; writes go through copy-on-write
            // (private) or the dirty-tracking upgrade (shared).
            hw.pmm.hold(page.frame());
            if hw.mmu.map(table, page_va, page.frame(), range.prot - Prot::WRITE).is_err() {
                hw.pmm.release(page.frame());
                return FaultOutcome::Unhandled(Unhandled::OutOfMemory);
            }
            return FaultOutcome::Handled(FaultKind::Populated);
        }

        if range.flags.contains(MapFlags::PHYS) {
            return FaultOutcome::Unhandled(Unhandled::NoRange);
        }

        let frame = match hw.pmm.alloc_zeroed() {
            Some(frame) => frame,
            None => return FaultOutcome::Unhandled(Unhandled::OutOfMemory),
        };
        if hw.mmu.map(table, page_va, frame, range.prot).is_err() {
            hw.pmm.release(frame);
            return FaultOutcome::Unhandled(Unhandled::OutOfMemory);
        }
        FaultOutcome::Handled(FaultKind::Populated)
    }

    fn copy_on_write(&self, space: &AddressSpace, range: &Range, page_va: VirtAddr, pa: super::PhysAddr) -> FaultOutcome {
        let hw = self.hw();
        let table = space.table();

        let upgrade = |kind| match hw.mmu.remap(table, page_va, pa, range.prot) {
            Ok(()) => {
                hw.mmu.invalidate_range(table, page_va, page_va + PAGE_SIZE);
                FaultOutcome::Handled(kind)
            }
            Err(_) => FaultOutcome::Unhandled(Unhandled::OutOfMemory),
        };

        if range.is_shared() || !range.owns_frames() {
            let outcome = upgrade(FaultKind::SharedWrite);
            if outcome == FaultOutcome::Handled(FaultKind::SharedWrite) {
                if let Some(backing) = range.backing.as_ref().filter(|_| range.owns_frames()) {
                    let offset = backing.offset + (page_va - range.start) as u64;
                    if let Some(page) = self.cache().lookup(backing.file.id(), offset) {
                        self.cache().make_dirty(&page);
                    }
                }
            }
            return outcome;
        }

        if hw.pmm.refcount(pa) == 1 {
            return upgrade(FaultKind::CopyOnWrite);
        }

        let copy = match hw.pmm.alloc() {
            Some(copy) => copy,
            None => return FaultOutcome::Unhandled(Unhandled::OutOfMemory),
        };
        hw.pmm.copy(copy, pa);
        if hw.mmu.remap(table, page_va, copy, range.prot).is_err() {
            hw.pmm.release(copy);
            return FaultOutcome::Unhandled(Unhandled::OutOfMemory);
        }
        hw.mmu.invalidate_range(table, page_va, page_va + PAGE_SIZE);
        hw.pmm.release(pa);

        FaultOutcome::Handled(FaultKind::CopyOnWrite)
    }

    /// What the trap handler should do with an outcome.
    pub fn dispose(&self, outcome: FaultOutcome, info: &FaultInfo) -> Disposition {
        let reason = match outcome {
            FaultOutcome::Handled(_) => return Disposition::Resume,
            FaultOutcome::Unhandled(reason) => reason,
        };

        if info.mode == Mode::Kernel {
            if let Some(fixup) = self.fixups().lookup(info.ip) {
                log_debug!(LOG_ORIGIN, "Fault at {:#X} ({:?}) in may-fault region, resuming at {:#X}", info.addr, reason, fixup);
                return Disposition::ResumeAt(fixup);
            }
            return Disposition::Abort;
        }

        log_warn!(
            LOG_ORIGIN,
            "User fault at {:#X} ip={:#X} {:?}: {:?}, terminating process",
            info.addr,
            info.ip,
            info.access,
            reason
        );
        Disposition::TerminateProcess
    }

    pub fn page_fault(&self, ctx: Option<&VmmContext>, info: &FaultInfo) -> Disposition {
        let outcome = self.handle_fault(ctx, info);
        self.dispose(outcome, info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::FileRef;
    use crate::mm::range::Backing;
    use crate::mm::vmm::Populate;
    use crate::mm::{FrameAllocator, Mmu, USER_ORIGIN};
    use crate::testing::{clock, hw, MockFile, MockMmu, MockPmm};

    fn vm(frames: usize) -> (Vm, &'static MockPmm, &'static MockMmu) {
        let (hw, pmm, mmu) = hw(frames);
        (Vm::new(hw, mmu.new_table().unwrap(), clock()), pmm, mmu)
    }

    fn user(addr: VirtAddr, access: FaultAccess) -> FaultInfo {
        FaultInfo { addr, access, mode: Mode::User, ip: 0x40_1000 }
    }

    const URW: Prot = Prot::USER_RW;

    #[test]
    fn decodes_x86_error_codes() {
        let info = FaultInfo::from_error_code(0x1234, PF_WRITE | PF_USER, 0x10);
        assert_eq!((info.access, info.mode), (FaultAccess::Write, Mode::User));
        let info = FaultInfo::from_error_code(0x1234, PF_INSTR, 0x10);
        assert_eq!((info.access, info.mode), (FaultAccess::Execute, Mode::Kernel));
    }

    #[test]
    fn anonymous_fault_maps_a_zeroed_frame() {
        let (vm, pmm, mmu) = vm(32);
        let ctx = vm.new_context().unwrap();
        let va = ctx.space().map(None, PAGE_SIZE, MapFlags::empty(), URW, Populate::Reserve, None).unwrap();

        let outcome = vm.handle_fault(Some(&ctx), &user(va + 0x10, FaultAccess::Write));
        assert_eq!(outcome, FaultOutcome::Handled(FaultKind::Populated));
        let pa = mmu.translate(ctx.table(), va).unwrap();
        assert_eq!(mmu.flags(ctx.table(), va), Some(URW));
        pmm.with_frame(pa, &mut |bytes| assert!(bytes.iter().all(|&b| b == 0)));

        let again = vm.handle_fault(Some(&ctx), &user(va, FaultAccess::Write));
        assert_eq!(again, FaultOutcome::Handled(FaultKind::Spurious));
    }

    #[test]
    fn interior_unmap_then_fault_on_the_hole() {
        let (vm, pmm, mmu) = vm(32);
        let ctx = vm.new_context().unwrap();
        let va = ctx.space().map(None, 3 * PAGE_SIZE, MapFlags::empty(), URW, Populate::Allocate, None).unwrap();
        let frames: Vec<_> = (0..3).map(|i| mmu.translate(ctx.table(), va + i * PAGE_SIZE).unwrap()).collect();
        for (i, &pa) in frames.iter().enumerate() {
            pmm.with_frame(pa, &mut |bytes| bytes.fill(0xA0 + i as u8));
        }

        ctx.space().unmap(va + PAGE_SIZE, PAGE_SIZE).unwrap();
        let spans: Vec<_> = ctx.space().ranges().iter().map(|r| (r.start, r.size)).collect();
        assert_eq!(spans, vec![(va, PAGE_SIZE), (va + 2 * PAGE_SIZE, PAGE_SIZE)]);
        assert!(mmu.translate(ctx.table(), va + PAGE_SIZE).is_none());
        assert_eq!(pmm.refcount(frames[1]), 0);

        for access in [FaultAccess::Read, FaultAccess::Write] {
            let info = user(va + PAGE_SIZE + 8, access);
            let outcome = vm.handle_fault(Some(&ctx), &info);
            assert_eq!(outcome, FaultOutcome::Unhandled(Unhandled::NoRange));
            assert_eq!(vm.dispose(outcome, &info), Disposition::TerminateProcess);
        }

        // The pages around the hole keep their frames and contents.
        for i in [0, 2] {
            let page = va + i * PAGE_SIZE;
            assert_eq!(mmu.translate(ctx.table(), page), Some(frames[i]));
            assert_eq!(vm.handle_fault(Some(&ctx), &user(page, FaultAccess::Write)), FaultOutcome::Handled(FaultKind::Spurious));
            pmm.with_frame(frames[i], &mut |bytes| assert!(bytes.iter().all(|&b| b == 0xA0 + i as u8)));
        }
    }

    #[test]
    fn remapped_region_starts_from_fresh_zeroed_frames() {
        let (vm, pmm, mmu) = vm(32);
        let ctx = vm.new_context().unwrap();
        let va = ctx.space().map(None, 2 * PAGE_SIZE, MapFlags::empty(), URW, Populate::Allocate, None).unwrap();
        let old: Vec<_> = (0..2).map(|i| mmu.translate(ctx.table(), va + i * PAGE_SIZE).unwrap()).collect();
        for &pa in &old {
            pmm.with_frame(pa, &mut |bytes| bytes.fill(0x5E));
            // Keep the old frames allocated so a reuse would show up.
            pmm.hold(pa);
        }

        ctx.space().unmap(va, 2 * PAGE_SIZE).unwrap();
        for &pa in &old {
            assert_eq!(pmm.refcount(pa), 1);
        }

        let again = ctx
            .space()
            .map(Some(va), 2 * PAGE_SIZE, MapFlags::EXACT, URW, Populate::Reserve, None)
            .unwrap();
        assert_eq!(again, va);
        for i in 0..2 {
            let page = va + i * PAGE_SIZE;
            assert!(mmu.translate(ctx.table(), page).is_none());
            assert_eq!(vm.handle_fault(Some(&ctx), &user(page, FaultAccess::Read)), FaultOutcome::Handled(FaultKind::Populated));

            let fresh = mmu.translate(ctx.table(), page).unwrap();
            assert!(!old.contains(&fresh));
            assert_eq!(pmm.refcount(fresh), 1);
            pmm.with_frame(fresh, &mut |bytes| assert!(bytes.iter().all(|&b| b == 0)));
        }
        pmm.with_frame(old[0], &mut |bytes| assert!(bytes.iter().all(|&b| b == 0x5E)));

        for pa in old {
            pmm.release(pa);
        }
    }

    #[test]
    fn permission_and_user_checks() {
        let (vm, _, _) = vm(32);
        let ctx = vm.new_context().unwrap();
        let ro = ctx
            .space()
            .map(None, PAGE_SIZE, MapFlags::empty(), Prot::READ | Prot::USER, Populate::Reserve, None)
            .unwrap();
        let kernel_only = ctx.space().map(None, PAGE_SIZE, MapFlags::empty(), Prot::RW, Populate::Reserve, None).unwrap();

        assert_eq!(
            vm.handle_fault(Some(&ctx), &user(ro, FaultAccess::Write)),
            FaultOutcome::Unhandled(Unhandled::Permission)
        );
        assert_eq!(
            vm.handle_fault(Some(&ctx), &user(ro, FaultAccess::Execute)),
            FaultOutcome::Unhandled(Unhandled::Permission)
        );
        assert_eq!(
            vm.handle_fault(Some(&ctx), &user(kernel_only, FaultAccess::Read)),
            FaultOutcome::Unhandled(Unhandled::Permission)
        );

        let kernel_read = FaultInfo { addr: kernel_only, access: FaultAccess::Read, mode: Mode::Kernel, ip: 0 };
        assert_eq!(vm.handle_fault(Some(&ctx), &kernel_read), FaultOutcome::Handled(FaultKind::Populated));
    }

    #[test]
    fn kernel_addresses_are_classified_first() {
        let (vm, _, _) = vm(32);
        let direct_map = FaultInfo { addr: 0xFFFF_8000_0010_0000, access: FaultAccess::Read, mode: Mode::Kernel, ip: 0 };
        let outcome = vm.handle_fault(None, &direct_map);
        assert_eq!(outcome, FaultOutcome::Unhandled(Unhandled::KernelAddress));
        assert_eq!(vm.dispose(outcome, &direct_map), Disposition::Abort);

        let from_user = user(KERNEL_RANGE_START, FaultAccess::Read);
        assert_eq!(vm.handle_fault(None, &from_user), FaultOutcome::Unhandled(Unhandled::KernelAddress));

        let va = vm
            .kernel_space()
            .map(None, PAGE_SIZE, MapFlags::empty(), Prot::RW, Populate::Reserve, None)
            .unwrap();
        let lazy = FaultInfo { addr: va, access: FaultAccess::Write, mode: Mode::Kernel, ip: 0 };
        assert_eq!(vm.handle_fault(None, &lazy), FaultOutcome::Handled(FaultKind::Populated));

        let no_space = FaultInfo { addr: USER_ORIGIN, access: FaultAccess::Read, mode: Mode::Kernel, ip: 0 };
        assert_eq!(vm.handle_fault(None, &no_space), FaultOutcome::Unhandled(Unhandled::NoSpace));
    }

    #[test]
    fn fork_then_write_copies_for_one_side_only() {
        let (vm, pmm, mmu) = vm(32);
        let parent = vm.new_context().unwrap();
        let va = parent
            .space()
            .map(None, PAGE_SIZE, MapFlags::empty(), URW, Populate::Allocate, None)
            .unwrap();
        let original = mmu.translate(parent.table(), va).unwrap();
        pmm.with_frame(original, &mut |bytes| bytes[7] = 0x77);

        let child = parent.fork().unwrap();
        assert!(pmm.refcount(original) >= 2);

        let outcome = vm.handle_fault(Some(&child), &user(va, FaultAccess::Write));
        assert_eq!(outcome, FaultOutcome::Handled(FaultKind::CopyOnWrite));

        let copy = mmu.translate(child.table(), va).unwrap();
        assert_ne!(copy, original);
        assert_eq!(mmu.translate(parent.table(), va), Some(original));
        assert_eq!(mmu.flags(child.table(), va), Some(URW));
        pmm.with_frame(copy, &mut |bytes| assert_eq!(bytes[7], 0x77));
        assert_eq!(pmm.refcount(original), 1);
        assert!(mmu.invalidations().contains(&(child.table(), va, va + PAGE_SIZE)));

        // The parent is now the sole owner and upgrades without copying.
        let outcome = vm.handle_fault(Some(&parent), &user(va, FaultAccess::Write));
        assert_eq!(outcome, FaultOutcome::Handled(FaultKind::CopyOnWrite));
        assert_eq!(mmu.translate(parent.table(), va), Some(original));
        assert_eq!(mmu.flags(parent.table(), va), Some(URW));
    }

    #[test]
    fn file_pages_come_from_the_cache_read_only() {
        let (vm, pmm, mmu) = vm(32);
        let ctx = vm.new_context().unwrap();
        let file: FileRef = MockFile::with_pattern(11, 4 * PAGE_SIZE);
        let va = ctx
            .space()
            .map(None, 2 * PAGE_SIZE, MapFlags::empty(), URW, Populate::Reserve, Some(Backing::new(file.clone(), PAGE_SIZE as u64)))
            .unwrap();

        let outcome = vm.handle_fault(Some(&ctx), &user(va, FaultAccess::Read));
        assert_eq!(outcome, FaultOutcome::Handled(FaultKind::Populated));

        let page = vm.cache().lookup(11, PAGE_SIZE as u64).unwrap();
        assert_eq!(mmu.translate(ctx.table(), va), Some(page.frame()));
        assert_eq!(mmu.flags(ctx.table(), va), Some(Prot::READ | Prot::USER));
        assert_eq!(pmm.refcount(page.frame()), 2);

        // Private write: the mapping gets its own copy, the cache keeps its page.
        let outcome = vm.handle_fault(Some(&ctx), &user(va, FaultAccess::Write));
        assert_eq!(outcome, FaultOutcome::Handled(FaultKind::CopyOnWrite));
        let private = mmu.translate(ctx.table(), va).unwrap();
        assert_ne!(private, page.frame());
        assert_eq!(pmm.refcount(page.frame()), 1);
        assert!(!page.is_dirty());
        pmm.with_frame(private, &mut |bytes| {
            assert_eq!(bytes[0], MockFile::pattern_byte(PAGE_SIZE as u64));
        });
    }

    #[test]
    fn shared_file_write_upgrades_in_place_and_dirties() {
        let (vm, _, mmu) = vm(32);
        let ctx = vm.new_context().unwrap();
        let mock = MockFile::with_pattern(12, 4 * PAGE_SIZE);
        let file: FileRef = mock.clone();
        let va = ctx
            .space()
            .map(None, PAGE_SIZE, MapFlags::SHARED, URW, Populate::Reserve, Some(Backing::new(file, 0)))
            .unwrap();

        vm.handle_fault(Some(&ctx), &user(va, FaultAccess::Read));
        let page = vm.cache().lookup(12, 0).unwrap();
        assert!(!page.is_dirty());

        let outcome = vm.handle_fault(Some(&ctx), &user(va, FaultAccess::Write));
        assert_eq!(outcome, FaultOutcome::Handled(FaultKind::SharedWrite));
        assert_eq!(mmu.translate(ctx.table(), va), Some(page.frame()));
        assert_eq!(mmu.flags(ctx.table(), va), Some(URW));
        assert!(page.is_dirty());
        assert_eq!(vm.cache().stats().dirty, 1);
        assert!(mock.modified_at().is_some());
    }

    #[test]
    fn read_errors_are_reported() {
        let (vm, _, mmu) = vm(32);
        let ctx = vm.new_context().unwrap();
        let mock = MockFile::with_pattern(13, PAGE_SIZE);
        mock.fail_next_fill();
        let file: FileRef = mock.clone();
        let va = ctx
            .space()
            .map(None, PAGE_SIZE, MapFlags::empty(), URW, Populate::Reserve, Some(Backing::new(file, 0)))
            .unwrap();

        assert_eq!(
            vm.handle_fault(Some(&ctx), &user(va, FaultAccess::Read)),
            FaultOutcome::Unhandled(Unhandled::Io)
        );
        assert!(mmu.translate(ctx.table(), va).is_none());
    }

    #[test]
    fn nocache_ranges_map_device_frames_under_the_file_lock() {
        let (vm, pmm, mmu) = vm(32);
        let ctx = vm.new_context().unwrap();
        let device = pmm.alloc().unwrap();
        let mock = MockFile::new(14, 4 * PAGE_SIZE);
        mock.set_direct_base(device);
        let file: FileRef = mock.clone();
        let va = ctx
            .space()
            .map(None, PAGE_SIZE, MapFlags::NOCACHE | MapFlags::SHARED, URW, Populate::Reserve, Some(Backing::new(file, 0)))
            .unwrap();

        let outcome = vm.handle_fault(Some(&ctx), &user(va, FaultAccess::Write));
        assert_eq!(outcome, FaultOutcome::Handled(FaultKind::Populated));
        assert_eq!(mmu.translate(ctx.table(), va), Some(device));
        assert_eq!(pmm.refcount(device), 1);
        assert_eq!(mock.lock_count(), 1);
        assert!(!mock.is_locked());
        assert_eq!(vm.cache().stats().pages, 0);
    }

    #[test]
    fn kernel_faults_in_fixup_regions_resume_at_the_fixup() {
        let (vm, _, _) = vm(8);
        vm.fixups().register(0xFFFF_FFFF_8010_0000, 0xFFFF_FFFF_8010_0040, 0xFFFF_FFFF_8010_0080);

        let inside = FaultInfo { addr: 0x1000, access: FaultAccess::Read, mode: Mode::Kernel, ip: 0xFFFF_FFFF_8010_0010 };
        assert_eq!(vm.page_fault(None, &inside), Disposition::ResumeAt(0xFFFF_FFFF_8010_0080));

        let outside = FaultInfo { ip: 0xFFFF_FFFF_8020_0000, ..inside };
        assert_eq!(vm.page_fault(None, &outside), Disposition::Abort);
    }

    #[test]
    fn out_of_memory_during_anonymous_fault() {
        let (vm, pmm, _) = vm(32);
        let ctx = vm.new_context().unwrap();
        let va = ctx.space().map(None, PAGE_SIZE, MapFlags::empty(), URW, Populate::Reserve, None).unwrap();
        pmm.fail_after(0);
        assert_eq!(
            vm.handle_fault(Some(&ctx), &user(va, FaultAccess::Read)),
            FaultOutcome::Unhandled(Unhandled::OutOfMemory)
        );
    }
}

// x86_64 4-Level Page Tables
//
// Implements `mm::Mmu` on top of hardware page tables (PML4 -> PDPT -> PD
// -> PT, 4 KiB leaves). Table frames come from the frame allocator and are
// reached through its direct map.
//
// Key responsibilities:
// - Create address-space roots whose kernel half mirrors the shared kernel
//   mappings
// - Map, unmap, remap and query individual pages
// - Translate `Prot` into PTE bits (P, RW, US, NX)
// - Tear down the user half's intermediate tables on destroy
// - Load CR3 and flush stale translations
//
// Kernel half sharing:
// - Every PML4 slot covering the dynamic kernel range is populated once at
//   construction; new roots copy those slots, so later kernel mappings are
//   visible in every address space without touching existing roots
//
// Correctness notes:
// - Intermediate tables in the user half carry US|RW; the leaf decides the
//   effective permission
// - Table frames are allocated zeroed
// - `destroy_table` never descends into the kernel half

use core::sync::atomic::{AtomicUsize, Ordering};

use crate::mm::{
    FrameAllocator, Mmu, PhysAddr, Prot, TableRoot, VirtAddr, VmError, KERNEL_RANGE_END, KERNEL_RANGE_START,
    PAGE_SIZE,
};
use crate::log_info;

const LOG_ORIGIN: &str = "paging";

const ENTRIES_PER_TABLE: usize = 512;
const ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;
/// First PML4 slot of the higher half.
const KERNEL_HALF: usize = ENTRIES_PER_TABLE / 2;

const PTE_PRESENT: u64 = 1 << 0;
const PTE_WRITABLE: u64 = 1 << 1;
const PTE_USER: u64 = 1 << 2;
const PTE_NO_EXECUTE: u64 = 1 << 63;

/// Above this many pages a range flush reloads CR3 instead of `invlpg`.
const FLUSH_ALL_THRESHOLD: usize = 32;

#[repr(transparent)]
#[derive(Clone, Copy)]
struct PageTableEntry(u64);

impl PageTableEntry {
    fn is_present(&self) -> bool {
        self.0 & PTE_PRESENT != 0
    }

    fn addr(&self) -> PhysAddr {
        (self.0 & ADDR_MASK) as PhysAddr
    }

    fn set(&mut self, addr: PhysAddr, flags: u64) {
        self.0 = (addr as u64 & ADDR_MASK) | flags;
    }

    fn clear(&mut self) {
        self.0 = 0;
    }

    fn prot(&self) -> Prot {
        let mut prot = Prot::READ;
        if self.0 & PTE_WRITABLE != 0 {
            prot |= Prot::WRITE;
        }
        if self.0 & PTE_USER != 0 {
            prot |= Prot::USER;
        }
        if self.0 & PTE_NO_EXECUTE == 0 {
            prot |= Prot::EXEC;
        }
        prot
    }
}

fn leaf_flags(prot: Prot) -> u64 {
    let mut flags = PTE_PRESENT;
    if prot.contains(Prot::WRITE) {
        flags |= PTE_WRITABLE;
    }
    if prot.contains(Prot::USER) {
        flags |= PTE_USER;
    }
    if !prot.contains(Prot::EXEC) {
        flags |= PTE_NO_EXECUTE;
    }
    flags
}

#[repr(C, align(4096))]
struct PageTable {
    entries: [PageTableEntry; ENTRIES_PER_TABLE],
}

fn split_indices(virt: VirtAddr) -> [usize; 4] {
    [
        (virt >> 39) & 0x1FF,
        (virt >> 30) & 0x1FF,
        (virt >> 21) & 0x1FF,
        (virt >> 12) & 0x1FF,
    ]
}

pub struct X86Mmu {
    pmm: &'static dyn FrameAllocator,
    kernel_root: TableRoot,
    table_pages: AtomicUsize,
}

impl X86Mmu {
    /// Wraps the boot page table as the kernel root and pre-populates its
    /// kernel-range PML4 slots.
    pub fn new(pmm: &'static dyn FrameAllocator, kernel_root: TableRoot) -> Result<X86Mmu, VmError> {
        let mmu = X86Mmu { pmm, kernel_root, table_pages: AtomicUsize::new(0) };

        let first = split_indices(KERNEL_RANGE_START)[0];
        let last = split_indices(KERNEL_RANGE_END - 1)[0];
        let root = mmu.table(kernel_root.0);
        for slot in first..=last {
            if !root.entries[slot].is_present() {
                let frame = mmu.alloc_table()?;
                root.entries[slot].set(frame, PTE_PRESENT | PTE_WRITABLE);
            }
        }

        log_info!(
            LOG_ORIGIN,
            "Kernel root {:#X}, PML4 slots {}..={} shared",
            kernel_root.0,
            first,
            last
        );
        Ok(mmu)
    }

    pub fn kernel_root(&self) -> TableRoot {
        self.kernel_root
    }

    /// Page-table frames currently allocated by this MMU.
    pub fn table_pages(&self) -> usize {
        self.table_pages.load(Ordering::Relaxed)
    }

    #[allow(clippy::mut_from_ref)]
    fn table(&self, frame: PhysAddr) -> &mut PageTable {
        // Table frames are allocator frames and always covered by the
        // direct map.
        unsafe { &mut *(self.pmm.phys_to_virt(frame) as *mut PageTable) }
    }

    fn alloc_table(&self) -> Result<PhysAddr, VmError> {
        let frame = self.pmm.alloc_zeroed().ok_or(VmError::OutOfMemory)?;
        self.table_pages.fetch_add(1, Ordering::Relaxed);
        Ok(frame)
    }

    fn free_table(&self, frame: PhysAddr) {
        self.pmm.release(frame);
        self.table_pages.fetch_sub(1, Ordering::Relaxed);
    }

    /// Leaf entry for `virt`, creating missing intermediate tables when
    /// `create` is set.
    fn walk(&self, root: TableRoot, virt: VirtAddr, create: bool) -> Result<&mut PageTableEntry, VmError> {
        let indices = split_indices(virt);
        let user_half = indices[0] < KERNEL_HALF;
        let mut table = self.table(root.0);

        for &index in &indices[..3] {
            let entry = &mut table.entries[index];
            if !entry.is_present() {
                if !create {
                    return Err(VmError::NotMapped);
                }
                let frame = self.alloc_table()?;
                let mut flags = PTE_PRESENT | PTE_WRITABLE;
                if user_half {
                    flags |= PTE_USER;
                }
                entry.set(frame, flags);
            }
            table = self.table(entry.addr());
        }
        Ok(&mut table.entries[indices[3]])
    }

    fn free_level(&self, frame: PhysAddr, level: usize) {
        if level > 1 {
            let table = self.table(frame);
            for entry in table.entries.iter_mut().filter(|e| e.is_present()) {
                self.free_level(entry.addr(), level - 1);
                entry.clear();
            }
        }
        self.free_table(frame);
    }
}

impl Mmu for X86Mmu {
    fn new_table(&self) -> Result<TableRoot, VmError> {
        let frame = self.alloc_table()?;
        let src = self.table(self.kernel_root.0);
        let dst = self.table(frame);
        dst.entries[KERNEL_HALF..].copy_from_slice(&src.entries[KERNEL_HALF..]);
        Ok(TableRoot(frame))
    }

    fn destroy_table(&self, root: TableRoot) {
        if root == self.kernel_root {
            return;
        }
        let table = self.table(root.0);
        for entry in table.entries[..KERNEL_HALF].iter_mut().filter(|e| e.is_present()) {
            // PDPT (3) -> PD (2) -> PT (1)
            self.free_level(entry.addr(), 3);
            entry.clear();
        }
        self.free_table(root.0);
    }

    fn map(&self, root: TableRoot, virt: VirtAddr, phys: PhysAddr, prot: Prot) -> Result<(), VmError> {
        if virt % PAGE_SIZE != 0 || phys % PAGE_SIZE != 0 {
            return Err(VmError::InvalidAddress);
        }
        let entry = self.walk(root, virt, true)?;
        if entry.is_present() {
            return Err(VmError::AlreadyMapped);
        }
        entry.set(phys, leaf_flags(prot));
        Ok(())
    }

    fn unmap(&self, root: TableRoot, virt: VirtAddr) -> Option<PhysAddr> {
        let entry = self.walk(root, virt, false).ok()?;
        if !entry.is_present() {
            return None;
        }
        let phys = entry.addr();
        entry.clear();
        Some(phys)
    }

    fn remap(&self, root: TableRoot, virt: VirtAddr, phys: PhysAddr, prot: Prot) -> Result<(), VmError> {
        let entry = self.walk(root, virt, false)?;
        if !entry.is_present() {
            return Err(VmError::NotMapped);
        }
        entry.set(phys, leaf_flags(prot));
        Ok(())
    }

    fn translate(&self, root: TableRoot, virt: VirtAddr) -> Option<PhysAddr> {
        let entry = self.walk(root, virt, false).ok()?;
        entry.is_present().then(|| entry.addr() + (virt % PAGE_SIZE))
    }

    fn flags(&self, root: TableRoot, virt: VirtAddr) -> Option<Prot> {
        let entry = self.walk(root, virt, false).ok()?;
        entry.is_present().then(|| entry.prot())
    }

    fn invalidate_range(&self, root: TableRoot, start: VirtAddr, end: VirtAddr) {
        // TODO: IPI shootdown to the other CPUs once the local APIC driver
        // exposes inter-processor interrupts; only the calling CPU is
        // flushed today.
        let kernel = start >= KERNEL_RANGE_START;
        if !kernel && hw::active_root() != root.0 {
            return;
        }
        let pages = (end.saturating_sub(start)) / PAGE_SIZE;
        if pages > FLUSH_ALL_THRESHOLD {
            hw::load_root(hw::active_root());
        } else {
            for va in (start..end).step_by(PAGE_SIZE) {
                hw::flush_page(va);
            }
        }
    }

    fn switch_to(&self, root: TableRoot) {
        if hw::active_root() != root.0 {
            hw::load_root(root.0);
        }
    }
}

#[cfg(not(test))]
mod hw {
    use x86_64::instructions::tlb;
    use x86_64::registers::control::{Cr3, Cr3Flags};
    use x86_64::structures::paging::PhysFrame;
    use x86_64::{PhysAddr, VirtAddr};

    pub fn active_root() -> usize {
        Cr3::read().0.start_address().as_u64() as usize
    }

    pub fn load_root(root: usize) {
        let frame = PhysFrame::containing_address(PhysAddr::new(root as u64));
        // The root mirrors the kernel half, so the executing code stays
        // mapped across the switch.
        unsafe { Cr3::write(frame, Cr3Flags::empty()) };
    }

    pub fn flush_page(va: usize) {
        tlb::flush(VirtAddr::new_truncate(va as u64));
    }
}

#[cfg(test)]
mod hw {
    use core::sync::atomic::{AtomicUsize, Ordering};

    static ACTIVE: AtomicUsize = AtomicUsize::new(0);

    pub fn active_root() -> usize {
        ACTIVE.load(Ordering::Relaxed)
    }

    pub fn load_root(root: usize) {
        ACTIVE.store(root, Ordering::Relaxed);
    }

    pub fn flush_page(_va: usize) {}
}

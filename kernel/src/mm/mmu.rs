// Page-Table Layer Contract
//
// Architecture-neutral view of the MMU used by the range tracker and the
// fault handler. Implementations own the table format; callers only see
// table roots, page-granular mappings and `Prot` bits.
//
// Correctness notes:
// - `map` fails with `AlreadyMapped` rather than silently replacing an
//   entry; replacing is `remap`
// - `unmap` hands back the frame that was mapped so the caller can release
//   it after the TLB has been invalidated
// - None of the operations flush the TLB implicitly except `switch_to`

use bitflags::bitflags;

use super::{PhysAddr, VirtAddr, VmError};

bitflags! {
    /// Access permissions of a mapping.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Prot: u32 {
        const READ  = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC  = 1 << 2;
        /// Accessible from user mode.
        const USER  = 1 << 3;
    }
}

impl Prot {
    pub const RW: Prot = Prot::READ.union(Prot::WRITE);
    pub const USER_RW: Prot = Prot::RW.union(Prot::USER);
}

/// Physical address of a top-level page table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TableRoot(pub PhysAddr);

pub trait Mmu: Send + Sync {
    /// Creates a table whose kernel half mirrors the shared kernel mappings.
    fn new_table(&self) -> Result<TableRoot, VmError>;

    /// Frees the user half's intermediate tables and the root. Leaf frames
    /// must already be unmapped.
    fn destroy_table(&self, root: TableRoot);

    fn map(&self, root: TableRoot, virt: VirtAddr, phys: PhysAddr, prot: Prot) -> Result<(), VmError>;

    /// Removes a leaf mapping, returning the frame it pointed to.
    fn unmap(&self, root: TableRoot, virt: VirtAddr) -> Option<PhysAddr>;

    /// Changes frame and/or permissions of an existing mapping.
    fn remap(&self, root: TableRoot, virt: VirtAddr, phys: PhysAddr, prot: Prot) -> Result<(), VmError>;

    fn translate(&self, root: TableRoot, virt: VirtAddr) -> Option<PhysAddr>;

    fn flags(&self, root: TableRoot, virt: VirtAddr) -> Option<Prot>;

    /// Flushes stale translations for `[start, end)` on every CPU that may
    /// have `root` loaded.
    fn invalidate_range(&self, root: TableRoot, start: VirtAddr, end: VirtAddr);

    /// Loads `root` on the calling CPU.
    fn switch_to(&self, root: TableRoot);
}

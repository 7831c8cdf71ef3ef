// Memory Management Subsystem
//
// Top-level namespace for the kernel memory core. The physical frame
// allocator and the page-table layer are consumed through traits (`pmm`,
// `mmu`); everything above them lives here: the slab allocator, the
// per-address-space range tracker, the page cache and the page-fault
// state machine.
//
// Layering (leaf first):
// - `pmm`    physical frames with atomic reference counts
// - `mmu`    raw page-table map/unmap/remap/invalidate
// - `slab`   fixed-size object pools, and `heap` built on top of them
// - `range`  the range descriptor and its merge/split rules
// - `vmm`    address spaces, VMM contexts, map/unmap/protect/fork
// - `cache`  file-backed pages keyed by (file, offset)
// - `fault`  glue between all of the above on a page-fault trap
//
// Correctness notes:
// - Frame reference counts are the only state shared across every layer;
//   they are atomics and need no lock of their own
// - No operation leaves a half-mapped range attributed to a space

pub mod pmm;
pub mod mmu;
pub mod slab;
pub mod heap;
pub mod range;
pub mod vmm;
pub mod cache;
pub mod fault;

pub use pmm::{FrameAllocator, PAGE_SIZE};
pub use mmu::{Mmu, Prot, TableRoot};
pub use vmm::{AddressSpace, Hw, Populate, Vm, VmmContext};

pub type PhysAddr = usize;
pub type VirtAddr = usize;

pub const PAGE_SHIFT: usize = 12;

/// First user address handed out; the low 64 KiB stay unmapped to catch
/// null dereferences.
pub const USER_ORIGIN: VirtAddr = 0x0000_0000_0001_0000;
/// Canonical kernel/user boundary (exclusive end of user space).
pub const USER_END: VirtAddr = 0x0000_8000_0000_0000;
/// Start of the higher half, where the physical direct map lives.
pub const KERNEL_BASE: VirtAddr = 0xFFFF_8000_0000_0000;
/// Designated range for dynamic kernel mappings (the kernel address space).
pub const KERNEL_RANGE_START: VirtAddr = 0xFFFF_C000_0000_0000;
pub const KERNEL_RANGE_END: VirtAddr = 0xFFFF_FF80_0000_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    OutOfMemory,
    InvalidAddress,
    InvalidSize,
    InvalidArgument,
    NoSpace,
    NotMapped,
    AlreadyMapped,
    PermissionDenied,
    Io,
}

impl VmError {
    pub fn to_errno(self) -> i64 {
        match self {
            VmError::OutOfMemory => -12,      // ENOMEM
            VmError::InvalidAddress => -14,   // EFAULT
            VmError::InvalidSize => -22,      // EINVAL
            VmError::InvalidArgument => -22,  // EINVAL
            VmError::NoSpace => -12,          // ENOMEM
            VmError::NotMapped => -22,        // EINVAL
            VmError::AlreadyMapped => -17,    // EEXIST
            VmError::PermissionDenied => -13, // EACCES
            VmError::Io => -5,                // EIO
        }
    }
}

#[inline]
pub const fn is_page_aligned(addr: usize) -> bool {
    addr & (PAGE_SIZE - 1) == 0
}

#[inline]
pub const fn align_down(addr: usize) -> usize {
    addr & !(PAGE_SIZE - 1)
}

/// Rounds up to the next page boundary, `None` on overflow.
#[inline]
pub const fn align_up(addr: usize) -> Option<usize> {
    match addr.checked_add(PAGE_SIZE - 1) {
        Some(v) => Some(v & !(PAGE_SIZE - 1)),
        None => None,
    }
}

#[inline]
pub const fn pages_for(size: usize) -> usize {
    (size + PAGE_SIZE - 1) / PAGE_SIZE
}

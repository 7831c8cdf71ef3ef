//! Boot handoff shared between the platform boot stub and the kernel core.
//!
//! The stub (firmware loader, multiboot shim, ...) fills a `BootInfo` and
//! calls `ferrite_main` on the boot CPU. Nothing here is firmware-specific:
//! the memory map uses UEFI descriptor layout because that is what the
//! loaders produce, but the core only asks it for usable physical ranges.

use crate::mm::{align_down, align_up, PhysAddr};

pub const EFI_CONVENTIONAL_MEMORY: u32 = 7;
const EFI_PAGE_SIZE: u64 = 4096;

#[repr(C)]
pub struct MemoryMap {
    pub buffer: *const u8,
    pub size: usize,
    pub descriptor_size: usize,
}

unsafe impl Send for MemoryMap {}
unsafe impl Sync for MemoryMap {}

impl MemoryMap {
    pub const fn new(buffer: *const u8, size: usize, descriptor_size: usize) -> Self {
        Self { buffer, size, descriptor_size }
    }

    pub fn descriptors(&self) -> MemoryMapIter {
        MemoryMapIter {
            buffer: self.buffer,
            size: self.size,
            descriptor_size: self.descriptor_size,
            offset: 0,
        }
    }

    /// Page-aligned `(start, len)` of every conventional-memory descriptor.
    pub fn usable(&self) -> impl Iterator<Item = (PhysAddr, usize)> + '_ {
        self.descriptors()
            .filter(|d| d.typ == EFI_CONVENTIONAL_MEMORY && d.number_of_pages > 0)
            .filter_map(|d| {
                let start = align_up(d.physical_start as usize)?;
                let end = align_down((d.physical_start + d.number_of_pages * EFI_PAGE_SIZE) as usize);
                (end > start).then(|| (start, end - start))
            })
    }

    /// `[lowest, highest)` physical window spanned by usable memory.
    pub fn usable_span(&self) -> Option<(PhysAddr, PhysAddr)> {
        self.usable().fold(None, |span, (start, len)| match span {
            None => Some((start, start + len)),
            Some((lo, hi)) => Some((lo.min(start), hi.max(start + len))),
        })
    }
}

pub struct MemoryMapIter {
    buffer: *const u8,
    size: usize,
    descriptor_size: usize,
    offset: usize,
}

impl Iterator for MemoryMapIter {
    type Item = &'static EfiMemoryDescriptor;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_null() || self.descriptor_size == 0 || self.offset + self.descriptor_size > self.size {
            return None;
        }

        unsafe {
            let desc_ptr = self.buffer.add(self.offset) as *const EfiMemoryDescriptor;
            self.offset += self.descriptor_size;
            Some(&*desc_ptr)
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct EfiMemoryDescriptor {
    pub typ: u32,
    pub pad: u32,
    pub physical_start: u64,
    pub virtual_start: u64,
    pub number_of_pages: u64,
    pub attribute: u64,
}

#[repr(C)]
pub struct BootInfo {
    pub memory_map: MemoryMap,
    /// Virtual address of physical 0 in the loader's direct map.
    pub phys_offset: u64,
    /// Physical address of the active PML4, which becomes the kernel table.
    pub kernel_table: u64,
    /// Frames the loader already handed out (kernel image, page tables)
    /// that conventional-memory descriptors may still report as free.
    pub reserved_start: u64,
    pub reserved_len: u64,
    pub cmdline: *const u8,
    pub cmdline_len: usize,
}

unsafe impl Send for BootInfo {}
unsafe impl Sync for BootInfo {}

impl BootInfo {
    pub const fn empty() -> Self {
        Self {
            memory_map: MemoryMap::new(core::ptr::null(), 0, 0),
            phys_offset: 0,
            kernel_table: 0,
            reserved_start: 0,
            reserved_len: 0,
            cmdline: core::ptr::null(),
            cmdline_len: 0,
        }
    }

    /// Kernel command line; empty when absent or not UTF-8.
    pub fn cmdline(&self) -> &str {
        if self.cmdline.is_null() || self.cmdline_len == 0 {
            return "";
        }
        let bytes = unsafe { core::slice::from_raw_parts(self.cmdline, self.cmdline_len) };
        core::str::from_utf8(bytes).unwrap_or("")
    }

    pub fn is_reserved(&self, frame: PhysAddr) -> bool {
        let frame = frame as u64;
        frame >= self.reserved_start && frame < self.reserved_start + self.reserved_len
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::vec::Vec;

    fn descriptor(typ: u32, start: u64, pages: u64) -> EfiMemoryDescriptor {
        EfiMemoryDescriptor { typ, pad: 0, physical_start: start, virtual_start: 0, number_of_pages: pages, attribute: 0 }
    }

    #[test]
    fn usable_regions_skip_reserved_descriptors() {
        let descriptors = [
            descriptor(EFI_CONVENTIONAL_MEMORY, 0x10_0000, 16),
            descriptor(2, 0x20_0000, 4),
            descriptor(EFI_CONVENTIONAL_MEMORY, 0x40_0000, 0),
            descriptor(EFI_CONVENTIONAL_MEMORY, 0x80_0000, 2),
        ];
        let map = MemoryMap::new(
            descriptors.as_ptr() as *const u8,
            core::mem::size_of_val(&descriptors),
            core::mem::size_of::<EfiMemoryDescriptor>(),
        );

        let regions: Vec<_> = map.usable().collect();
        assert_eq!(regions, [(0x10_0000, 16 * 4096), (0x80_0000, 2 * 4096)]);
        assert_eq!(map.usable_span(), Some((0x10_0000, 0x80_2000)));
    }

    #[test]
    fn empty_handoff_has_no_memory_or_cmdline() {
        let info = BootInfo::empty();
        assert_eq!(info.memory_map.descriptors().count(), 0);
        assert_eq!(info.cmdline(), "");
    }

    #[test]
    fn cmdline_and_reserved_window() {
        let cmdline = "log=debug cpus=2";
        let info = BootInfo {
            cmdline: cmdline.as_ptr(),
            cmdline_len: cmdline.len(),
            reserved_start: 0x10_0000,
            reserved_len: 0x2000,
            ..BootInfo::empty()
        };
        assert_eq!(info.cmdline(), cmdline);
        assert!(info.is_reserved(0x10_1000));
        assert!(!info.is_reserved(0x10_2000));
    }
}

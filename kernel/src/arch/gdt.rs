// Global Descriptor Table (GDT) and Task State Segments (TSS)
//
// Every CPU gets its own GDT and TSS. The code/data descriptors are the
// same everywhere; only the TSS descriptor differs, pointing at that CPU's
// task state with its own rsp0 and interrupt stacks.
//
// Key responsibilities:
// - Define kernel and user code/data segments with correct privilege levels
// - Build the per-CPU TSS (rsp0, double-fault IST, scheduler IST)
// - Install the GDT with `lgdt`, reload segment registers, load the task
//   register with `ltr`
// - Update rsp0 when the scheduler switches to a thread with another
//   kernel stack
//
// Interrupt stacks:
// - IST1 (double fault) keeps a broken kernel stack from escalating into a
//   triple fault
// - IST2 (scheduler) is used by the timer and reschedule vectors; the
//   handler rewrites the trap frame to another thread, so the frame must
//   not live on the stack of the thread being switched out
//
// Correctness notes:
// - Descriptor layouts are hardware-defined (`#[repr(C, packed)]`)
// - Each CPU only touches its own slot after `init`, so the static tables
//   need no lock
// - The I/O permission bitmap is disabled by placing `iomap_base` past the
//   end of the TSS

use core::mem::size_of;
use core::ptr::{addr_of, addr_of_mut};

use crate::config::MAX_CPUS;
use crate::kassert;

use super::{KERNEL_CODE_SELECTOR, KERNEL_DATA_SELECTOR};

const LOG_ORIGIN: &str = "gdt";

/// IST slots as the IDT encodes them (1-based; 0 means "no IST").
pub const DOUBLE_FAULT_IST: u8 = 1;
pub const SCHEDULER_IST: u8 = 2;

const DOUBLE_FAULT_STACK_SIZE: usize = 4096;
const SCHEDULER_STACK_SIZE: usize = 8192;

pub const TSS_SELECTOR: u16 = 0x28;

const GDT_KERNEL_CODE: u64 = 0x00AF9A000000FFFF;
const GDT_KERNEL_DATA: u64 = 0x00AF92000000FFFF;
const GDT_USER_CODE: u64 = 0x00AFFA000000FFFF;
const GDT_USER_DATA: u64 = 0x00AFF2000000FFFF;

#[repr(C, packed)]
struct DescriptorTablePointer {
    limit: u16,
    base: u64,
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
struct Tss {
    _reserved_0: u32,
    rsp0: u64,
    rsp1: u64,
    rsp2: u64,
    _reserved_1: u64,
    ist: [u64; 7],
    _reserved_2: u64,
    _reserved_3: u16,
    iomap_base: u16,
}

impl Tss {
    const EMPTY: Tss = Tss {
        _reserved_0: 0,
        rsp0: 0,
        rsp1: 0,
        rsp2: 0,
        _reserved_1: 0,
        ist: [0; 7],
        _reserved_2: 0,
        _reserved_3: 0,
        iomap_base: 0,
    };
}

#[repr(C, align(16))]
#[derive(Clone, Copy)]
struct Gdt {
    entries: [u64; 7],
}

impl Gdt {
    const TEMPLATE: Gdt = Gdt {
        entries: [0, GDT_KERNEL_CODE, GDT_KERNEL_DATA, GDT_USER_CODE, GDT_USER_DATA, 0, 0],
    };
}

#[repr(C, align(16))]
struct CpuStacks {
    double_fault: [u8; DOUBLE_FAULT_STACK_SIZE],
    scheduler: [u8; SCHEDULER_STACK_SIZE],
}

impl CpuStacks {
    const EMPTY: CpuStacks = CpuStacks {
        double_fault: [0; DOUBLE_FAULT_STACK_SIZE],
        scheduler: [0; SCHEDULER_STACK_SIZE],
    };
}

static mut GDTS: [Gdt; MAX_CPUS] = [Gdt::TEMPLATE; MAX_CPUS];
static mut TSSES: [Tss; MAX_CPUS] = [Tss::EMPTY; MAX_CPUS];
static mut STACKS: [CpuStacks; MAX_CPUS] = [CpuStacks::EMPTY; MAX_CPUS];

/// Installs the GDT and TSS of `cpu` on the executing processor. `rsp0` is
/// the kernel stack used until the scheduler installs the first thread.
pub fn init(cpu: usize, rsp0: u64) {
    kassert!(cpu < MAX_CPUS, LOG_ORIGIN, "CPU {} beyond the descriptor tables", cpu);

    unsafe {
        let tss = &mut *addr_of_mut!(TSSES[cpu]);
        let stacks = addr_of!(STACKS[cpu]);
        tss.rsp0 = rsp0 & !0xF;
        tss.ist[(DOUBLE_FAULT_IST - 1) as usize] =
            addr_of!((*stacks).double_fault) as u64 + DOUBLE_FAULT_STACK_SIZE as u64;
        tss.ist[(SCHEDULER_IST - 1) as usize] =
            addr_of!((*stacks).scheduler) as u64 + SCHEDULER_STACK_SIZE as u64;
        tss.iomap_base = size_of::<Tss>() as u16;

        write_tss_descriptor(cpu);
        load_gdt_and_segments(cpu);
        load_tr();
    }
}

unsafe fn write_tss_descriptor(cpu: usize) {
    let tss_addr = addr_of!(TSSES[cpu]) as u64;
    let limit = (size_of::<Tss>() - 1) as u64;

    let low = limit & 0xFFFF
        | ((tss_addr & 0xFFFFFF) << 16)
        | (0x89u64 << 40)
        | ((limit & 0xF0000) << 32)
        | ((tss_addr & 0xFF000000) << 32);

    let high = tss_addr >> 32;

    let gdt = &mut *addr_of_mut!(GDTS[cpu]);
    gdt.entries[5] = low;
    gdt.entries[6] = high;
}

unsafe fn load_gdt_and_segments(cpu: usize) {
    let ptr = DescriptorTablePointer {
        limit: (size_of::<Gdt>() - 1) as u16,
        base: addr_of!(GDTS[cpu]) as u64,
    };

    core::arch::asm!(
        "lgdt [{gdt_ptr}]",
        "push {code}",
        "lea {tmp}, [rip + 2f]",
        "push {tmp}",
        "retfq",
        "2:",
        "mov ax, {data}",
        "mov ds, ax",
        "mov es, ax",
        "mov ss, ax",
        gdt_ptr = in(reg) &ptr,
        code = const KERNEL_CODE_SELECTOR,
        data = const KERNEL_DATA_SELECTOR,
        tmp = lateout(reg) _,
        out("ax") _,
        options(preserves_flags)
    );
}

unsafe fn load_tr() {
    core::arch::asm!("ltr ax", in("ax") TSS_SELECTOR, options(nostack, preserves_flags));
}

/// Privileged stack loaded on the next ring 3 -> ring 0 transition of `cpu`.
pub fn set_rsp0(cpu: usize, rsp0: u64) {
    if cpu >= MAX_CPUS {
        return;
    }
    unsafe {
        (*addr_of_mut!(TSSES[cpu])).rsp0 = rsp0 & !0xF;
    }
}

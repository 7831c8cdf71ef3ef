// Ferrite Kernel Core
//
// Crate root of the memory and scheduling core of a monolithic x86_64
// kernel. On the kernel target it also provides the entry points the boot
// stub jumps to (`ferrite_main` on the boot CPU, `ferrite_ap_main` on the
// others); on the host the same modules build as an ordinary library so
// the core can be tested against mock hardware.
//
// Key responsibilities:
// - Bring up the frame allocator, kernel heap, page tables, timers, range
//   tracker, page cache and scheduler in dependency order
// - Install the GDT/TSS and IDT of every CPU
// - Route the page-fault, timer and reschedule traps to their subsystems
// - Hand every CPU to the scheduler's idle loop
//
// Initialization order (boot CPU):
// - serial, configuration, log level
// - physical frames (static bitmap sized for `mm::pmm::MAX_PAGES`)
// - kernel heap (slab size classes), so `alloc` works from here on
// - page tables, tick timer, `Vm` (kernel range, page cache, fixups)
// - descriptor tables, trap handlers, scheduler
// - Local APIC timer, then the idle loop
//
// Safety and correctness notes:
// - Interrupts stay disabled until the first `halt` of the idle loop
// - Every global is a `spin::Once`; a failed step aborts boot with a
//   diagnostic instead of continuing half-initialized

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod arch;
pub mod boot;
pub mod build_info;
pub mod config;
pub mod fs;
pub mod log;
pub mod mm;
pub mod panic;
pub mod sched;
#[cfg(not(test))]
pub mod serial;
pub mod sync;
pub mod thread;
pub mod timer;
pub mod trap;

#[cfg(test)]
mod testing;

#[cfg(all(target_arch = "x86_64", not(test)))]
pub use entry::{ferrite_ap_main, ferrite_main};

#[cfg(all(target_arch = "x86_64", not(test)))]
mod entry {
    use core::panic::PanicInfo;
    use core::sync::atomic::{AtomicU32, AtomicU64};

    use spin::Once;

    use crate::arch::paging::X86Mmu;
    use crate::arch::x86::{self, PLATFORM};
    use crate::arch::{apic, gdt, idt, Platform};
    use crate::boot::BootInfo;
    use crate::mm::fault::{Disposition, FaultInfo};
    use crate::mm::pmm::{BitmapPmm, MAX_PAGES};
    use crate::mm::{heap, FrameAllocator, Hw, Mmu, TableRoot, Vm, PAGE_SIZE};
    use crate::sched::{self, Scheduler};
    use crate::timer::TickTimer;
    use crate::trap::{self, TrapFrame, PAGE_FAULT_VECTOR, RESCHEDULE_VECTOR, RFLAGS_IF, TIMER_VECTOR};
    use crate::{build_info, config, kabort, log, log_debug, log_info, serial};

    const LOG_ORIGIN: &str = "kernel:init";

    const BITMAP_ZERO: AtomicU64 = AtomicU64::new(0);
    const REFCOUNT_ZERO: AtomicU32 = AtomicU32::new(0);

    static FRAME_BITMAP: [AtomicU64; MAX_PAGES / 64] = [BITMAP_ZERO; MAX_PAGES / 64];
    static FRAME_REFCOUNTS: [AtomicU32; MAX_PAGES] = [REFCOUNT_ZERO; MAX_PAGES];

    static PMM: Once<BitmapPmm> = Once::new();
    static MMU: Once<X86Mmu> = Once::new();
    static TIMER: Once<TickTimer> = Once::new();
    static VM: Once<Vm> = Once::new();

    #[global_allocator]
    static ALLOCATOR: heap::GlobalHeap = heap::GlobalHeap;

    fn current_rsp() -> u64 {
        let rsp: u64;
        unsafe { core::arch::asm!("mov {}, rsp", out(reg) rsp, options(nomem, nostack, preserves_flags)) };
        rsp
    }

    fn scheduler() -> &'static Scheduler {
        match sched::get() {
            Some(sched) => sched,
            None => kabort!(LOG_ORIGIN, "trap taken before the scheduler exists"),
        }
    }

    fn init_frames(info: &BootInfo) -> &'static BitmapPmm {
        let (low, high) = match info.memory_map.usable_span() {
            Some(span) => span,
            None => kabort!(LOG_ORIGIN, "boot memory map reports no usable memory"),
        };
        let frames = ((high - low) / PAGE_SIZE).min(MAX_PAGES);

        let pmm = PMM.call_once(|| {
            BitmapPmm::new(low, frames, info.phys_offset as usize, &FRAME_BITMAP, &FRAME_REFCOUNTS)
        });

        let reserved_start = info.reserved_start as usize;
        let reserved_end = reserved_start + info.reserved_len as usize;
        for (start, len) in info.memory_map.usable() {
            let end = start + len;
            if end <= reserved_start || start >= reserved_end {
                pmm.add_region(start, len);
                continue;
            }
            if start < reserved_start {
                pmm.add_region(start, reserved_start - start);
            }
            if end > reserved_end {
                pmm.add_region(reserved_end, end - reserved_end);
            }
        }

        let stats = pmm.stats();
        log_info!(
            "pmm",
            "{} MiB usable, {}/{} frames free",
            stats.free_bytes() / (1024 * 1024),
            stats.free_pages,
            stats.total_pages
        );
        pmm
    }

    fn page_fault_trap(frame: &mut TrapFrame) {
        let sched = scheduler();
        let cpu = PLATFORM.cpu_id();
        let info = FaultInfo::from_error_code(PLATFORM.fault_address(), frame.error_code, frame.rip);
        let vm = match VM.get() {
            Some(vm) => vm,
            None => crate::panic::abort_with_frame("fault", frame, format_args!("page fault before the VM exists")),
        };

        // Resolution may sleep on file I/O.
        let thread = sched.current(cpu);
        let ctx = thread.as_ref().and_then(|t| t.vmm().cloned());
        PLATFORM.irq_restore(frame.rflags & RFLAGS_IF != 0);
        let disposition = vm.page_fault(ctx.as_deref(), &info);
        PLATFORM.irq_save();
        drop(ctx);
        drop(thread);

        match disposition {
            Disposition::Resume => {}
            Disposition::ResumeAt(ip) => frame.rip = ip,
            Disposition::TerminateProcess => sched.terminate_process(),
            Disposition::Abort => crate::panic::abort_with_frame(
                "fault",
                frame,
                format_args!("unresolved kernel page fault at {:#X}", info.addr),
            ),
        }
    }

    fn timer_trap(frame: &mut TrapFrame) {
        apic::send_eoi();
        scheduler().on_timer(PLATFORM.cpu_id(), frame);
    }

    fn reschedule_trap(frame: &mut TrapFrame) {
        scheduler().reschedule(PLATFORM.cpu_id(), frame);
    }

    fn install_traps() {
        let handlers: [(u8, trap::TrapHandler); 3] = [
            (PAGE_FAULT_VECTOR, page_fault_trap),
            (TIMER_VECTOR, timer_trap),
            (RESCHEDULE_VECTOR, reschedule_trap),
        ];
        for (vector, handler) in handlers {
            if trap::register(vector, handler).is_err() {
                kabort!(LOG_ORIGIN, "vector {:#04X} registered twice", vector);
            }
        }
    }

    fn init_cpu_tables(cpu: usize) {
        PLATFORM.init_cpu(cpu);
        gdt::init(cpu, current_rsp());
        idt::load();
    }

    /// Boot CPU entry, called by the boot stub with interrupts disabled on
    /// the loader's stack and page tables.
    #[no_mangle]
    pub extern "C" fn ferrite_main(info: &'static BootInfo) -> ! {
        serial::init();
        let cfg = config::init(info.cmdline());
        log_info!(LOG_ORIGIN, "{}", build_info::BOOT_BANNER);

        let pmm = init_frames(info);
        if let Err(e) = heap::init(pmm, info.phys_offset as usize, cfg.heap_slabs) {
            kabort!(LOG_ORIGIN, "kernel heap: {:?}", e);
        }

        let kernel_table = TableRoot(info.kernel_table as usize & !(PAGE_SIZE - 1));
        let mmu = match X86Mmu::new(pmm, kernel_table) {
            Ok(mmu) => MMU.call_once(|| mmu),
            Err(e) => kabort!(LOG_ORIGIN, "page tables: {:?}", e),
        };

        let timer = TIMER.call_once(|| TickTimer::new(cfg.cpus));
        log::set_clock(timer);

        let hw = Hw { pmm: pmm as &'static dyn FrameAllocator, mmu: mmu as &'static dyn Mmu };
        let vm = VM.call_once(|| Vm::new(hw, kernel_table, timer));
        x86::register_fixups(vm.fixups());

        init_cpu_tables(0);
        install_traps();

        let sched = match sched::init(&PLATFORM, timer, vm, cfg.cpus, cfg.quantum_ticks) {
            Ok(sched) => sched,
            Err(e) => kabort!(LOG_ORIGIN, "scheduler: {:?}", e),
        };

        if let Err(e) = apic::init(info.phys_offset as usize) {
            kabort!(LOG_ORIGIN, "local APIC: {:?}", e);
        }
        apic::start_timer(cfg.timer_hz);

        log_debug!(LOG_ORIGIN, "{} page-table frames in use", mmu.table_pages());
        log_info!(LOG_ORIGIN, "Boot CPU entering the scheduler");
        sched.cpu_entry(0)
    }

    /// Secondary CPU entry, called by the boot stub once `ferrite_main` has
    /// reached the scheduler. The CPU must run on the kernel page table.
    #[no_mangle]
    pub extern "C" fn ferrite_ap_main(cpu: usize) -> ! {
        let sched = scheduler();
        if cpu >= sched.cpu_count() {
            kabort!(LOG_ORIGIN, "CPU {} started but only {} configured", cpu, sched.cpu_count());
        }

        init_cpu_tables(cpu);
        apic::init_secondary();
        apic::start_timer(config::get().timer_hz);

        log_info!(LOG_ORIGIN, "CPU {} entering the scheduler", cpu);
        sched.cpu_entry(cpu)
    }

    #[panic_handler]
    fn panic(info: &PanicInfo) -> ! {
        crate::panic::abort("PANIC", format_args!("{}", info))
    }
}

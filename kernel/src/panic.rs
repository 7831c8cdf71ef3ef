// Fatal Error Path
//
// The single non-recoverable transition of the kernel core. Invariant
// violations (double free, queue/running overlap, refcount underflow) and
// faults nobody can resolve end up here.
//
// Key responsibilities:
// - Log the reason with its origin at PANIC level
// - Dump the trapped register state and the top stack words when a trap
//   frame is available
// - Stop the CPU for good
//
// Under `cfg(test)` the transition becomes a Rust panic so that tests can
// observe it with `#[should_panic]`.

use core::fmt;

use crate::build_info;
use crate::trap::TrapFrame;
use crate::log_panic;

const LOG_ORIGIN: &str = "abort";

/// Words dumped from the interrupted stack.
const STACK_DUMP_WORDS: usize = 16;

const EXCEPTION_NAMES: [&str; 32] = [
    "#DE - Divide Error",
    "#DB - Debug",
    "NMI - Non-Maskable Interrupt",
    "#BP - Breakpoint",
    "#OF - Overflow",
    "#BR - Bound Range Exceeded",
    "#UD - Invalid Opcode",
    "#NM - Device Not Available",
    "#DF - Double Fault",
    "Coprocessor Segment Overrun",
    "#TS - Invalid TSS",
    "#NP - Segment Not Present",
    "#SS - Stack-Segment Fault",
    "#GP - General Protection Fault",
    "#PF - Page Fault",
    "Reserved",
    "#MF - x87 FPU Floating-Point Error",
    "#AC - Alignment Check",
    "#MC - Machine Check",
    "#XM - SIMD Floating-Point Exception",
    "#VE - Virtualization Exception",
    "#CP - Control Protection Exception",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
];

pub fn vector_name(vector: u64) -> &'static str {
    EXCEPTION_NAMES
        .get(vector as usize)
        .copied()
        .unwrap_or("External Interrupt")
}

#[cfg(not(test))]
pub fn abort(origin: &str, args: fmt::Arguments) -> ! {
    log_panic!(origin, "{}", args);
    log_panic!(LOG_ORIGIN, "{} halted", build_info::VERSION_TAG);
    halt_forever()
}

#[cfg(test)]
pub fn abort(origin: &str, args: fmt::Arguments) -> ! {
    panic!("[{}] {} ({})", origin, args, build_info::VERSION_TAG);
}

/// Aborts with a dump of the trapped state.
pub fn abort_with_frame(origin: &str, frame: &TrapFrame, args: fmt::Arguments) -> ! {
    dump_frame(frame);
    dump_stack(frame.rsp);
    abort(origin, args)
}

pub fn dump_frame(frame: &TrapFrame) {
    log_panic!(
        LOG_ORIGIN,
        "Trap: {} (vector={}) error code {:#X}",
        vector_name(frame.vector),
        frame.vector,
        frame.error_code
    );
    log_panic!(
        LOG_ORIGIN,
        "RAX={:#018X} RBX={:#018X} RCX={:#018X} RDX={:#018X}",
        frame.rax, frame.rbx, frame.rcx, frame.rdx
    );
    log_panic!(
        LOG_ORIGIN,
        "RSI={:#018X} RDI={:#018X} RBP={:#018X} RSP={:#018X}",
        frame.rsi, frame.rdi, frame.rbp, frame.rsp
    );
    log_panic!(
        LOG_ORIGIN,
        "R8={:#018X} R9={:#018X} R10={:#018X} R11={:#018X}",
        frame.r8, frame.r9, frame.r10, frame.r11
    );
    log_panic!(
        LOG_ORIGIN,
        "R12={:#018X} R13={:#018X} R14={:#018X} R15={:#018X}",
        frame.r12, frame.r13, frame.r14, frame.r15
    );
    log_panic!(
        LOG_ORIGIN,
        "RIP={:#018X} CS={:#06X} RFLAGS={:#018X} SS={:#06X}",
        frame.rip, frame.cs, frame.rflags, frame.ss
    );
}

#[cfg(not(test))]
fn dump_stack(rsp: u64) {
    if rsp == 0 || rsp % 8 != 0 {
        log_panic!(LOG_ORIGIN, "Stack pointer {:#018X} not dumpable", rsp);
        return;
    }

    // Best effort: the frame came from the CPU, so the stack page is mapped
    // unless the fault was a stack overflow into the guard page.
    let words = unsafe { core::slice::from_raw_parts(rsp as *const u64, STACK_DUMP_WORDS) };
    for (i, value) in words.iter().enumerate() {
        log_panic!(LOG_ORIGIN, "Stack[{:02}] = {:#018X}", i, value);
    }
}

#[cfg(test)]
fn dump_stack(rsp: u64) {
    log_panic!(LOG_ORIGIN, "Stack dump of {} words at {:#018X} skipped", STACK_DUMP_WORDS, rsp);
}

#[cfg(not(test))]
pub fn halt_forever() -> ! {
    x86_64::instructions::interrupts::disable();
    loop {
        x86_64::instructions::hlt();
    }
}

/// Aborts with a formatted reason: `kabort!(ORIGIN, "fmt", args..)`.
#[macro_export]
macro_rules! kabort {
    ($origin:expr, $($arg:tt)*) => {
        $crate::panic::abort($origin, format_args!($($arg)*))
    };
}

/// Checks a kernel invariant and aborts when it does not hold.
#[macro_export]
macro_rules! kassert {
    ($cond:expr, $origin:expr, $($arg:tt)*) => {
        if !$cond {
            $crate::panic::abort($origin, format_args!($($arg)*));
        }
    };
}

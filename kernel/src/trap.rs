// Trap Frames and Vector Dispatch
//
// Every exception and interrupt enters the kernel through one assembly stub
// (arch::x86) that pushes the general registers on top of the hardware
// frame and calls `ferrite_trap_dispatch` with a pointer to the resulting
// `TrapFrame`. The frame is also the unit of context switching: the
// scheduler saves it into the outgoing thread and overwrites it with the
// incoming thread's registers before the stub returns with `iretq`.
//
// Key responsibilities:
// - Define the exact register layout pushed by the entry stub
// - Keep a table of Rust handlers indexed by vector
// - Turn unhandled exceptions into a fatal register dump
//
// Correctness notes:
// - The field order of `TrapFrame` must match the push order of the stub;
//   a static size assertion guards the total size
// - Registration happens during boot; dispatch only takes the read lock

use spin::RwLock;

use crate::panic;
use crate::{log_debug, log_warn};

const LOG_ORIGIN: &str = "trap";

pub const PAGE_FAULT_VECTOR: u8 = 14;
pub const TIMER_VECTOR: u8 = 32;
/// Software trap used to enter the scheduler (yield/sleep/exit).
pub const RESCHEDULE_VECTOR: u8 = 0x81;

/// Vectors below this are CPU exceptions.
const FIRST_EXTERNAL_VECTOR: u64 = 32;

/// RFLAGS.IF
pub const RFLAGS_IF: u64 = 1 << 9;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrapFrame {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rbp: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,

    pub vector: u64,
    pub error_code: u64,

    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

const _: () = {
    assert!(core::mem::size_of::<TrapFrame>() == 22 * core::mem::size_of::<u64>());
};

impl TrapFrame {
    /// True when the trap interrupted ring 3.
    pub fn from_user(&self) -> bool {
        self.cs & 0x3 == 0x3
    }
}

pub type TrapHandler = fn(&mut TrapFrame);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapError {
    AlreadyRegistered,
}

static VECTORS: RwLock<[Option<TrapHandler>; 256]> = RwLock::new([None; 256]);

pub fn register(vector: u8, handler: TrapHandler) -> Result<(), TrapError> {
    let mut vectors = VECTORS.write();
    let slot = &mut vectors[vector as usize];
    if slot.is_some() {
        return Err(TrapError::AlreadyRegistered);
    }
    *slot = Some(handler);
    log_debug!(LOG_ORIGIN, "Vector {:#04X} registered", vector);
    Ok(())
}

pub fn unregister(vector: u8) -> Option<TrapHandler> {
    VECTORS.write()[vector as usize].take()
}

pub fn dispatch(frame: &mut TrapFrame) {
    let handler = VECTORS.read().get(frame.vector as usize).copied().flatten();

    match handler {
        Some(handler) => handler(frame),
        None if frame.vector < FIRST_EXTERNAL_VECTOR => panic::abort_with_frame(
            LOG_ORIGIN,
            frame,
            format_args!("Unhandled exception {}", panic::vector_name(frame.vector)),
        ),
        None => log_warn!(
            LOG_ORIGIN,
            "Spurious vector {:#04X} at RIP={:#018X}",
            frame.vector,
            frame.rip
        ),
    }
}

/// Called by the common entry stub with interrupts disabled.
#[cfg(not(test))]
#[no_mangle]
pub extern "C" fn ferrite_trap_dispatch(frame: *mut TrapFrame) {
    // The stub always passes its own stack frame.
    let frame = unsafe { &mut *frame };
    dispatch(frame);
}

// Interrupt Descriptor Table (IDT)
//
// One table shared by every CPU. Each of the 256 vectors points at its
// assembly stub from `arch::x86`, so every trap ends up in
// `trap::dispatch` with a full `TrapFrame`.
//
// Gate assignment:
// - Everything is an interrupt gate (IF cleared on entry) with DPL 0
// - Double fault runs on IST1
// - Timer and reschedule run on the per-CPU scheduler stack (IST2) because
//   their handlers may replace the frame with another thread's
//
// Correctness notes:
// - The IDT is 16-byte aligned as required by the architecture
// - `init` builds the table once; `load` is executed by every CPU

use core::mem::size_of;
use core::ptr::{addr_of, addr_of_mut};

use spin::Once;

use super::gdt::{DOUBLE_FAULT_IST, SCHEDULER_IST};
use super::x86::ferrite_trap_stubs;
use super::KERNEL_CODE_SELECTOR;
use crate::log_info;
use crate::trap::{RESCHEDULE_VECTOR, TIMER_VECTOR};

const LOG_ORIGIN: &str = "idt";

const IDT_SIZE: usize = 256;
const DOUBLE_FAULT_VECTOR: usize = 8;
const GATE_TYPE_INTERRUPT: u8 = 0x8E;

#[repr(C, packed)]
#[derive(Clone, Copy)]
struct IdtEntry {
    offset_low: u16,
    selector: u16,
    ist: u8,
    type_attr: u8,
    offset_mid: u16,
    offset_high: u32,
    reserved: u32,
}

impl IdtEntry {
    const fn new() -> Self {
        IdtEntry {
            offset_low: 0,
            selector: 0,
            ist: 0,
            type_attr: 0,
            offset_mid: 0,
            offset_high: 0,
            reserved: 0,
        }
    }

    fn set_handler(&mut self, handler: u64, selector: u16, ist: u8, type_attr: u8) {
        self.offset_low = (handler & 0xFFFF) as u16;
        self.offset_mid = ((handler >> 16) & 0xFFFF) as u16;
        self.offset_high = ((handler >> 32) & 0xFFFFFFFF) as u32;
        self.selector = selector;
        self.ist = ist & 0x07;
        self.type_attr = type_attr;
        self.reserved = 0;
    }
}

#[repr(C, align(16))]
struct Idt {
    entries: [IdtEntry; IDT_SIZE],
}

#[repr(C, packed)]
struct IdtPointer {
    limit: u16,
    base: u64,
}

static mut IDT: Idt = Idt { entries: [IdtEntry::new(); IDT_SIZE] };
static BUILT: Once<()> = Once::new();

fn ist_for(vector: usize) -> u8 {
    match vector {
        DOUBLE_FAULT_VECTOR => DOUBLE_FAULT_IST,
        v if v == TIMER_VECTOR as usize || v == RESCHEDULE_VECTOR as usize => SCHEDULER_IST,
        _ => 0,
    }
}

fn build() {
    unsafe {
        let idt = &mut *addr_of_mut!(IDT);
        let stubs = &*addr_of!(ferrite_trap_stubs);
        for (vector, entry) in idt.entries.iter_mut().enumerate() {
            entry.set_handler(stubs[vector], KERNEL_CODE_SELECTOR, ist_for(vector), GATE_TYPE_INTERRUPT);
        }
    }
    log_info!(LOG_ORIGIN, "IDT built with {} entries", IDT_SIZE);
}

/// Loads the IDT on the executing CPU, building it on first use.
pub fn load() {
    BUILT.call_once(build);

    let idt_ptr = IdtPointer {
        limit: (size_of::<Idt>() - 1) as u16,
        base: addr_of!(IDT) as u64,
    };
    unsafe {
        core::arch::asm!(
            "lidt [{}]",
            in(reg) &idt_ptr,
            options(readonly, nostack, preserves_flags)
        );
    }
}

// Local APIC and Timer Interrupt Source
//
// Each CPU programs its own Local APIC timer in periodic mode on
// `trap::TIMER_VECTOR`; the legacy 8259 PICs are remapped out of the
// exception range and masked so that they never deliver.
//
// Key responsibilities:
// - Detect and software-enable the Local APIC
// - Calibrate the APIC timer against PIT channel 2 once, on the boot CPU
// - Arm the periodic timer at the configured frequency on every CPU
// - Acknowledge interrupts (EOI)
//
// Implementation details:
// - The APIC register page is reached through the direct map (`phys_offset`)
// - Calibration counts APIC ticks during a 10 ms PIT one-shot; the result is
//   shared by all CPUs, which run from the same bus clock

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use x86_64::instructions::port::Port;
use x86_64::registers::model_specific::Msr;

use crate::trap::TIMER_VECTOR;
use crate::{log_debug, log_info, log_warn};

const LOG_ORIGIN: &str = "apic";

const IA32_APIC_BASE: u32 = 0x1B;
const APIC_BASE_ENABLE: u64 = 1 << 11;
const APIC_BASE_MASK: u64 = 0x000F_FFFF_FFFF_F000;

const APIC_ID: u64 = 0x20;
const APIC_TPR: u64 = 0x80;
const APIC_EOI: u64 = 0xB0;
const APIC_SPURIOUS: u64 = 0xF0;
const APIC_LVT_TIMER: u64 = 0x320;
const APIC_TIMER_INIT: u64 = 0x380;
const APIC_TIMER_CURRENT: u64 = 0x390;
const APIC_TIMER_DIV: u64 = 0x3E0;

const APIC_SW_ENABLE: u32 = 0x100;
const SPURIOUS_VECTOR: u32 = 0xFF;
const LVT_MASKED: u32 = 1 << 16;
const TIMER_MODE_PERIODIC: u32 = 1 << 17;
/// Divide configuration 0b0011: divide by 16.
const TIMER_DIVIDE_16: u32 = 0x3;

const PIT_FREQUENCY: u64 = 1_193_182;
const CALIBRATION_MS: u64 = 10;

const PIC1_CMD: u16 = 0x20;
const PIC1_DATA: u16 = 0x21;
const PIC2_CMD: u16 = 0xA0;
const PIC2_DATA: u16 = 0xA1;

static APIC_VIRT_BASE: AtomicU64 = AtomicU64::new(0);
/// APIC timer ticks (after the divider) per millisecond.
static TICKS_PER_MS: AtomicU32 = AtomicU32::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApicError {
    Unsupported,
    CalibrationFailed,
}

#[inline]
unsafe fn apic_read(offset: u64) -> u32 {
    let addr = (APIC_VIRT_BASE.load(Ordering::Relaxed) + offset) as *const u32;
    core::ptr::read_volatile(addr)
}

#[inline]
unsafe fn apic_write(offset: u64, value: u32) {
    let addr = (APIC_VIRT_BASE.load(Ordering::Relaxed) + offset) as *mut u32;
    core::ptr::write_volatile(addr, value);
}

fn is_apic_supported() -> bool {
    // CPUID.01h:EDX[9]
    let leaf = unsafe { core::arch::x86_64::__cpuid(1) };
    leaf.edx & (1 << 9) != 0
}

unsafe fn disable_legacy_pic() {
    let mut pic1_cmd: Port<u8> = Port::new(PIC1_CMD);
    let mut pic1_data: Port<u8> = Port::new(PIC1_DATA);
    let mut pic2_cmd: Port<u8> = Port::new(PIC2_CMD);
    let mut pic2_data: Port<u8> = Port::new(PIC2_DATA);

    // ICW1..ICW4: remap to 0x20/0x28, cascade on IRQ2, 8086 mode.
    pic1_cmd.write(0x11);
    pic2_cmd.write(0x11);
    pic1_data.write(0x20);
    pic2_data.write(0x28);
    pic1_data.write(4);
    pic2_data.write(2);
    pic1_data.write(0x01);
    pic2_data.write(0x01);

    pic1_data.write(0xFF);
    pic2_data.write(0xFF);
}

unsafe fn enable_local() {
    let mut base_msr = Msr::new(IA32_APIC_BASE);
    let base = base_msr.read();
    if base & APIC_BASE_ENABLE == 0 {
        base_msr.write(base | APIC_BASE_ENABLE);
    }
    apic_write(APIC_SPURIOUS, apic_read(APIC_SPURIOUS) | APIC_SW_ENABLE | SPURIOUS_VECTOR);
    apic_write(APIC_TPR, 0);
}

/// Counts APIC ticks over a PIT channel 2 one-shot.
unsafe fn calibrate() -> u32 {
    let mut gate: Port<u8> = Port::new(0x61);
    let mut command: Port<u8> = Port::new(0x43);
    let mut channel2: Port<u8> = Port::new(0x42);

    let count = (PIT_FREQUENCY * CALIBRATION_MS / 1000) as u16;

    // Gate high, speaker off.
    let value = gate.read();
    gate.write((value & !0x02) | 0x01);
    // Channel 2, lobyte/hibyte, mode 0.
    command.write(0xB0);
    channel2.write(count as u8);
    channel2.write((count >> 8) as u8);

    apic_write(APIC_TIMER_DIV, TIMER_DIVIDE_16);
    apic_write(APIC_LVT_TIMER, LVT_MASKED);
    apic_write(APIC_TIMER_INIT, u32::MAX);

    // Restart the count by toggling the gate, then wait for OUT2.
    let value = gate.read();
    gate.write(value & !0x01);
    gate.write(value | 0x01);
    while gate.read() & 0x20 == 0 {
        core::hint::spin_loop();
    }

    let elapsed = u32::MAX - apic_read(APIC_TIMER_CURRENT);
    apic_write(APIC_TIMER_INIT, 0);
    elapsed / CALIBRATION_MS as u32
}

/// Boot CPU: enables its Local APIC, masks the PICs and calibrates the
/// timer.
pub fn init(phys_offset: usize) -> Result<(), ApicError> {
    if !is_apic_supported() {
        log_warn!(LOG_ORIGIN, "Local APIC not supported");
        return Err(ApicError::Unsupported);
    }

    let phys = unsafe { Msr::new(IA32_APIC_BASE).read() } & APIC_BASE_MASK;
    APIC_VIRT_BASE.store(phys + phys_offset as u64, Ordering::Relaxed);

    let per_ms = unsafe {
        disable_legacy_pic();
        enable_local();
        calibrate()
    };
    if per_ms == 0 {
        return Err(ApicError::CalibrationFailed);
    }
    TICKS_PER_MS.store(per_ms, Ordering::Relaxed);

    log_info!(
        LOG_ORIGIN,
        "Local APIC at {:#X} (id {}), {} timer ticks/ms",
        phys,
        unsafe { apic_read(APIC_ID) } >> 24,
        per_ms
    );
    Ok(())
}

/// Application processors: enable the local unit; `init` has run already.
pub fn init_secondary() {
    unsafe { enable_local() };
}

/// Arms the periodic timer of the executing CPU.
pub fn start_timer(frequency_hz: u32) {
    let per_ms = u64::from(TICKS_PER_MS.load(Ordering::Relaxed));
    let initial = (per_ms * 1000 / u64::from(frequency_hz.max(1))).clamp(1, u64::from(u32::MAX));
    unsafe {
        apic_write(APIC_TIMER_DIV, TIMER_DIVIDE_16);
        apic_write(APIC_LVT_TIMER, TIMER_VECTOR as u32 | TIMER_MODE_PERIODIC);
        apic_write(APIC_TIMER_INIT, initial as u32);
    }
    log_debug!(LOG_ORIGIN, "Timer armed at {} Hz (initial count {})", frequency_hz, initial);
}

pub fn send_eoi() {
    unsafe { apic_write(APIC_EOI, 0) };
}

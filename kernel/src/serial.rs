// Serial Port Driver (Kernel Debug I/O)
//
// Minimal COM1 UART (0x3F8) driver used as the log sink on the kernel
// target. It is the only device this crate touches directly and exists so
// that `panic::abort` diagnostics reach the outside world even when every
// other subsystem is wedged.
//
// Implementation details:
// - Port I/O through `x86_64::instructions::port::Port`
// - 38400 baud (divisor = 3), 8N1, FIFO enabled
// - Transmit holding register is polled before each byte
// - Newlines are normalized to CRLF for terminal compatibility
//
// Concurrency and safety:
// - Global `SERIAL1` is protected by a spinlock
// - `_print` runs with interrupts disabled so entries logged from the timer
//   trap do not interleave with (or deadlock against) the interrupted writer

use core::fmt;
use x86_64::instructions::interrupts;
use x86_64::instructions::port::Port;

const COM1: u16 = 0x3F8;

/// Loopback test byte written during init.
const LOOPBACK_PATTERN: u8 = 0xAE;

pub struct SerialPort {
    base: u16,
    present: bool,
}

impl SerialPort {
    pub const fn new(base: u16) -> Self {
        SerialPort { base, present: false }
    }

    fn write_reg(&self, offset: u16, value: u8) {
        let mut port: Port<u8> = Port::new(self.base + offset);
        unsafe { port.write(value) }
    }

    fn read_reg(&self, offset: u16) -> u8 {
        let mut port: Port<u8> = Port::new(self.base + offset);
        unsafe { port.read() }
    }

    pub fn init(&mut self) {
        self.write_reg(1, 0x00); // interrupts off
        self.write_reg(3, 0x80); // DLAB
        self.write_reg(0, 0x03); // divisor lo
        self.write_reg(1, 0x00); // divisor hi
        self.write_reg(3, 0x03); // 8N1
        self.write_reg(2, 0xC7); // FIFO, clear, 14-byte threshold
        self.write_reg(4, 0x0B);
        self.write_reg(4, 0x1E); // loopback
        self.write_reg(0, LOOPBACK_PATTERN);

        if self.read_reg(0) != LOOPBACK_PATTERN {
            self.present = false;
            return;
        }

        self.write_reg(4, 0x0F);
        self.present = true;
    }

    fn is_transmit_empty(&self) -> bool {
        self.read_reg(5) & 0x20 != 0
    }

    pub fn write_byte(&self, byte: u8) {
        if !self.present {
            return;
        }
        while !self.is_transmit_empty() {
            core::hint::spin_loop();
        }
        self.write_reg(0, byte);
    }
}

impl fmt::Write for SerialPort {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            if byte == b'\n' {
                self.write_byte(b'\r');
            }
            self.write_byte(byte);
        }
        Ok(())
    }
}

pub static SERIAL1: spin::Mutex<SerialPort> = spin::Mutex::new(SerialPort::new(COM1));

pub fn init() {
    SERIAL1.lock().init();
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    use core::fmt::Write;

    interrupts::without_interrupts(|| {
        // Formatting errors are dropped; there is nowhere else to report them.
        let _ = SERIAL1.lock().write_fmt(args);
    });
}

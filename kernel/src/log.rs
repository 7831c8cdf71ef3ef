// Kernel Logging Subsystem
//
// Structured, origin-tagged logging for the kernel core. Every subsystem
// declares a `LOG_ORIGIN` string and logs through the `log_*!` macros,
// which attach a tick-derived timestamp, the severity and the origin.
//
// Key responsibilities:
// - Provide standardized log levels (Debug, Info, Warn, Error, Panic)
// - Attach timestamps and subsystem origin to every log entry
// - Include source location only for DEBUG entries (file:line)
// - Route output to the COM1 serial port on the kernel target
//
// Implementation details:
// - The level is an atomic so it can be changed from the boot command line
//   after early boot without `static mut`
// - Timestamps come from whatever clock the timer subsystem registers with
//   `set_clock`; before that every entry reads t=0
// - Host test builds write to stderr instead of port I/O
//
// Correctness notes:
// - Logging never allocates on the kernel target
// - The serial sink disables interrupts for the duration of one entry so
//   entries from interrupt context do not interleave

use core::fmt;
use core::sync::atomic::{AtomicU8, Ordering};
use spin::Once;

use crate::timer::Clock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Debug = 0,
    Info = 1,
    Warn = 2,
    Error = 3,
    Panic = 4,
}

impl LogLevel {
    pub const fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO ",
            LogLevel::Warn => "WARN ",
            LogLevel::Error => "ERROR",
            LogLevel::Panic => "PANIC",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "debug" => Some(LogLevel::Debug),
            "info" => Some(LogLevel::Info),
            "warn" => Some(LogLevel::Warn),
            "error" => Some(LogLevel::Error),
            "panic" => Some(LogLevel::Panic),
            _ => None,
        }
    }

    const fn from_u8(raw: u8) -> Self {
        match raw {
            0 => LogLevel::Debug,
            1 => LogLevel::Info,
            2 => LogLevel::Warn,
            3 => LogLevel::Error,
            _ => LogLevel::Panic,
        }
    }
}

static CURRENT_LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);
static CLOCK: Once<&'static dyn Clock> = Once::new();

/// Milliseconds per clock tick used for the timestamp column.
const MS_PER_TICK: u64 = 10;

pub fn set_level(level: LogLevel) {
    CURRENT_LOG_LEVEL.store(level as u8, Ordering::Relaxed);
}

pub fn get_level() -> LogLevel {
    LogLevel::from_u8(CURRENT_LOG_LEVEL.load(Ordering::Relaxed))
}

pub fn set_clock(clock: &'static dyn Clock) {
    CLOCK.call_once(|| clock);
}

fn get_timestamp_ms() -> u64 {
    CLOCK.get().map(|clock| clock.now() * MS_PER_TICK).unwrap_or(0)
}

pub fn _log(level: LogLevel, origin: &str, args: fmt::Arguments, file: &str, line: u32) {
    if level < get_level() {
        return;
    }

    let ms = get_timestamp_ms();
    let (seconds, milliseconds) = (ms / 1000, ms % 1000);

    if level == LogLevel::Debug {
        emit(format_args!(
            "[t={}.{:03}s] [{}] [{}] {} ({}:{})\n",
            seconds,
            milliseconds,
            level.as_str(),
            origin,
            args,
            file,
            line
        ));
    } else {
        emit(format_args!(
            "[t={}.{:03}s] [{}] [{}] {}\n",
            seconds,
            milliseconds,
            level.as_str(),
            origin,
            args
        ));
    }
}

#[cfg(not(test))]
fn emit(args: fmt::Arguments) {
    crate::serial::_print(args);
}

#[cfg(test)]
fn emit(args: fmt::Arguments) {
    std::eprint!("{}", args);
}

#[macro_export]
macro_rules! log_debug {
    ($origin:expr, $($arg:tt)*) => {
        $crate::log::_log(
            $crate::log::LogLevel::Debug,
            $origin,
            format_args!($($arg)*),
            file!(),
            line!()
        )
    };
}

#[macro_export]
macro_rules! log_info {
    ($origin:expr, $($arg:tt)*) => {
        $crate::log::_log(
            $crate::log::LogLevel::Info,
            $origin,
            format_args!($($arg)*),
            file!(),
            line!()
        )
    };
}

#[macro_export]
macro_rules! log_warn {
    ($origin:expr, $($arg:tt)*) => {
        $crate::log::_log(
            $crate::log::LogLevel::Warn,
            $origin,
            format_args!($($arg)*),
            file!(),
            line!()
        )
    };
}

#[macro_export]
macro_rules! log_error {
    ($origin:expr, $($arg:tt)*) => {
        $crate::log::_log(
            $crate::log::LogLevel::Error,
            $origin,
            format_args!($($arg)*),
            file!(),
            line!()
        )
    };
}

#[macro_export]
macro_rules! log_panic {
    ($origin:expr, $($arg:tt)*) => {
        $crate::log::_log(
            $crate::log::LogLevel::Panic,
            $origin,
            format_args!($($arg)*),
            file!(),
            line!()
        )
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_names_round_trip_through_the_parser() {
        for level in [LogLevel::Debug, LogLevel::Info, LogLevel::Warn, LogLevel::Error] {
            let name = level.as_str().trim().to_ascii_lowercase();
            assert_eq!(LogLevel::from_name(&name), Some(level));
        }
        assert_eq!(LogLevel::from_name("verbose"), None);
    }

    #[test]
    fn levels_are_ordered_by_severity() {
        assert!(LogLevel::Debug < LogLevel::Info);
        assert!(LogLevel::Error < LogLevel::Panic);
        assert_eq!(LogLevel::from_u8(200), LogLevel::Panic);
    }
}

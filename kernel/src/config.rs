// Boot Configuration
//
// Kernel tunables handed over on the boot command line as whitespace
// separated `key=value` tokens, e.g.
//
//     log=debug quantum=5 hz=100 cpus=4 verbose
//
// Parsing never fails: malformed values and unknown keys are logged and the
// default is kept. The parsed configuration is stored write-once and read
// by the scheduler, the timer wiring and the logger.

use spin::Once;

use crate::log::LogLevel;
use crate::{log_info, log_warn};

const LOG_ORIGIN: &str = "config";

/// Hard upper bound on CPUs the per-CPU tables are sized for.
pub const MAX_CPUS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelConfig {
    pub log_level: LogLevel,
    /// Scheduler quantum in timer ticks.
    pub quantum_ticks: u64,
    pub timer_hz: u32,
    pub cpus: usize,
    /// Serve small kernel heap requests from slab size classes.
    pub heap_slabs: bool,
    pub verbose: bool,
}

impl KernelConfig {
    pub const DEFAULT: KernelConfig = KernelConfig {
        log_level: LogLevel::Info,
        quantum_ticks: 10,
        timer_hz: 100,
        cpus: 1,
        heap_slabs: true,
        verbose: false,
    };

    pub fn parse(cmdline: &str) -> KernelConfig {
        let mut config = KernelConfig::DEFAULT;

        for token in cmdline.split_whitespace() {
            let (key, value) = match token.split_once('=') {
                Some((key, value)) => (key, Some(value)),
                None => (token, None),
            };

            match (key, value) {
                ("log", Some(value)) => match LogLevel::from_name(value) {
                    Some(level) => config.log_level = level,
                    None => log_warn!(LOG_ORIGIN, "Unknown log level '{}'", value),
                },
                ("quantum", Some(value)) => match value.parse::<u64>() {
                    Ok(ticks) if ticks > 0 => config.quantum_ticks = ticks,
                    _ => log_warn!(LOG_ORIGIN, "Invalid quantum '{}'", value),
                },
                ("hz", Some(value)) => match value.parse::<u32>() {
                    Ok(hz) if (1..=10_000).contains(&hz) => config.timer_hz = hz,
                    _ => log_warn!(LOG_ORIGIN, "Invalid timer frequency '{}'", value),
                },
                ("cpus", Some(value)) => match value.parse::<usize>() {
                    Ok(cpus) if (1..=MAX_CPUS).contains(&cpus) => config.cpus = cpus,
                    _ => log_warn!(LOG_ORIGIN, "Invalid CPU count '{}'", value),
                },
                ("heap_slabs", Some(value)) => match value {
                    "on" | "1" | "true" => config.heap_slabs = true,
                    "off" | "0" | "false" => config.heap_slabs = false,
                    _ => log_warn!(LOG_ORIGIN, "Invalid heap_slabs '{}'", value),
                },
                ("verbose", None) => config.verbose = true,
                _ => log_warn!(LOG_ORIGIN, "Ignoring unknown boot option '{}'", token),
            }
        }

        if config.verbose {
            config.log_level = LogLevel::Debug;
        }

        config
    }
}

impl Default for KernelConfig {
    fn default() -> Self {
        KernelConfig::DEFAULT
    }
}

static CONFIG: Once<KernelConfig> = Once::new();

/// Parses and freezes the boot configuration. Later calls return the
/// configuration stored by the first one.
pub fn init(cmdline: &str) -> &'static KernelConfig {
    CONFIG.call_once(|| {
        let config = KernelConfig::parse(cmdline);
        crate::log::set_level(config.log_level);
        log_info!(
            LOG_ORIGIN,
            "log={:?} quantum={} hz={} cpus={} heap_slabs={}",
            config.log_level,
            config.quantum_ticks,
            config.timer_hz,
            config.cpus,
            config.heap_slabs
        );
        config
    })
}

pub fn get() -> &'static KernelConfig {
    CONFIG.get().unwrap_or(&KernelConfig::DEFAULT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_cmdline_yields_defaults() {
        assert_eq!(KernelConfig::parse(""), KernelConfig::DEFAULT);
    }

    #[test]
    fn parses_known_keys() {
        let config = KernelConfig::parse("log=warn quantum=4 hz=250 cpus=8 heap_slabs=off");
        assert_eq!(config.log_level, LogLevel::Warn);
        assert_eq!(config.quantum_ticks, 4);
        assert_eq!(config.timer_hz, 250);
        assert_eq!(config.cpus, 8);
        assert!(!config.heap_slabs);
    }

    #[test]
    fn bad_values_and_unknown_keys_keep_defaults() {
        let config = KernelConfig::parse("quantum=0 cpus=65 hz=abc log=loud root=/dev/sda1");
        assert_eq!(config, KernelConfig::DEFAULT);
    }

    #[test]
    fn verbose_forces_debug_logging() {
        let config = KernelConfig::parse("log=error verbose");
        assert!(config.verbose);
        assert_eq!(config.log_level, LogLevel::Debug);
    }

    #[test]
    fn get_before_init_returns_defaults() {
        if CONFIG.get().is_none() {
            assert_eq!(*get(), KernelConfig::DEFAULT);
        }
    }
}

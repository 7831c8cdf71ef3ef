// Kernel Timers
//
// Tick-based software timers used by the scheduler for the preemption
// quantum and for sleep timeouts.
//
// Key responsibilities:
// - Keep the global tick count (`Clock`)
// - Arm one-shot and periodic callbacks on a given CPU (`Timer`)
// - Run due callbacks from the timer trap of the owning CPU
//
// Implementation details:
// - `TickTimer` keeps one deadline-sorted list per CPU under an
//   interrupt-safe spinlock, since the timer trap takes the same lock
// - CPU 0's timer interrupt advances the global tick count
// - Callbacks run with the list lock dropped so they may arm new timers
// - `resume` re-enables delivery on a CPU after it was parked (e.g. while
//   a CPU is being brought up); expired callbacks wait until then
//
// Hardware programming (APIC/HPET/PIT) is outside this module: the trap
// handler for the timer vector calls `expire(cpu)` on every interrupt.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::sync::IrqMutex;

pub type TimerId = u64;
pub type Callback = Box<dyn FnMut() + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerMode {
    OneShot,
    /// Re-armed with the same period after every expiry.
    Periodic,
}

pub trait Clock: Send + Sync {
    /// Ticks since boot.
    fn now(&self) -> u64;
}

pub trait Timer: Clock {
    /// Arms `callback` to run on `cpu` after `delay` ticks.
    fn insert(&self, cpu: usize, delay: u64, mode: TimerMode, callback: Callback) -> TimerId;

    /// Disarms a timer. Returns false if it already fired (one-shot) or was
    /// never armed.
    fn cancel(&self, id: TimerId) -> bool;

    /// Allows callbacks to run on `cpu`.
    fn resume(&self, cpu: usize);

    /// Runs every due callback of `cpu`. Called from the timer trap.
    fn expire(&self, cpu: usize);
}

struct Entry {
    id: TimerId,
    deadline: u64,
    period: Option<u64>,
    callback: Callback,
}

struct CpuTimers {
    entries: IrqMutex<Vec<Entry>>,
    running: AtomicBool,
    /// Periodic timers cancelled while their callback was executing.
    cancelled: IrqMutex<Vec<TimerId>>,
}

pub struct TickTimer {
    ticks: AtomicU64,
    next_id: AtomicU64,
    cpus: Vec<CpuTimers>,
}

impl TickTimer {
    pub fn new(cpus: usize) -> Self {
        let cpus = (0..cpus.max(1))
            .map(|_| CpuTimers {
                entries: IrqMutex::new(Vec::new()),
                running: AtomicBool::new(false),
                cancelled: IrqMutex::new(Vec::new()),
            })
            .collect();

        TickTimer {
            ticks: AtomicU64::new(0),
            next_id: AtomicU64::new(1),
            cpus,
        }
    }

    /// Number of armed timers on `cpu`.
    pub fn pending(&self, cpu: usize) -> usize {
        self.cpus.get(cpu).map(|c| c.entries.lock().len()).unwrap_or(0)
    }

    fn arm(&self, cpu: usize, entry: Entry) {
        if let Some(timers) = self.cpus.get(cpu) {
            let mut entries = timers.entries.lock();
            let pos = entries.partition_point(|e| e.deadline <= entry.deadline);
            entries.insert(pos, entry);
        }
    }
}

impl Clock for TickTimer {
    fn now(&self) -> u64 {
        self.ticks.load(Ordering::Acquire)
    }
}

impl Timer for TickTimer {
    fn insert(&self, cpu: usize, delay: u64, mode: TimerMode, callback: Callback) -> TimerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let delay = delay.max(1);
        let period = match mode {
            TimerMode::OneShot => None,
            TimerMode::Periodic => Some(delay),
        };

        self.arm(cpu, Entry { id, deadline: self.now() + delay, period, callback });
        id
    }

    fn cancel(&self, id: TimerId) -> bool {
        for timers in &self.cpus {
            let mut entries = timers.entries.lock();
            if let Some(pos) = entries.iter().position(|e| e.id == id) {
                entries.remove(pos);
                return true;
            }
        }

        // Might be executing right now; keep it from being re-armed.
        for timers in &self.cpus {
            timers.cancelled.lock().push(id);
        }
        false
    }

    fn resume(&self, cpu: usize) {
        if let Some(timers) = self.cpus.get(cpu) {
            timers.running.store(true, Ordering::Release);
        }
    }

    fn expire(&self, cpu: usize) {
        let timers = match self.cpus.get(cpu) {
            Some(timers) => timers,
            None => return,
        };

        if cpu == 0 {
            self.ticks.fetch_add(1, Ordering::AcqRel);
        }

        if !timers.running.load(Ordering::Acquire) {
            return;
        }

        let now = self.now();
        let due: Vec<Entry> = {
            let mut entries = timers.entries.lock();
            let split = entries.partition_point(|e| e.deadline <= now);
            entries.drain(..split).collect()
        };

        for mut entry in due {
            (entry.callback)();

            if let Some(period) = entry.period {
                let mut cancelled = timers.cancelled.lock();
                if let Some(pos) = cancelled.iter().position(|&id| id == entry.id) {
                    cancelled.swap_remove(pos);
                    continue;
                }
                drop(cancelled);

                entry.deadline = now + period;
                self.arm(cpu, entry);
            }
        }
    }
}

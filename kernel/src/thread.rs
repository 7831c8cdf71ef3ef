// Thread Control Blocks
//
// Implements the thread abstraction the scheduler dispatches: identity,
// priority, CPU pin, state flags, saved execution context, kernel stack
// and the VMM context the thread runs in.
//
// Key responsibilities:
// - Define thread identity, priority and state flags
// - Hold the saved context (trap frame registers, FXSAVE area, FS/GS
//   bases) that the scheduler swaps on every context switch
// - Own the kernel stack and guard it with a canary
// - Build the initial frame for kernel and user threads
//
// Thread model:
// - States are a flag set: QUEUED -> RUNNING -> {QUEUED, SLEEPING, EXITED},
//   SLEEPING -> QUEUED on wakeup
// - PREEMPTED is set while the scheduler is saving the thread's context
// - A thread is never QUEUED and RUNNING at once
// - Idle threads carry IDLE, are never queued and have no stack of their
//   own (they run on the CPU's boot stack)
//
// Correctness notes:
// - Flag transitions that race with other CPUs (wakeup vs. switch-out) are
//   single compare-and-swap updates on `flags`
// - The context lock is only taken by the scheduler with interrupts off

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

use bitflags::bitflags;
use spin::Mutex;

use crate::arch::{FpuState, KERNEL_CODE_SELECTOR, KERNEL_DATA_SELECTOR, USER_CODE_SELECTOR, USER_DATA_SELECTOR};
use crate::mm::VmmContext;
use crate::trap::{TrapFrame, RFLAGS_IF};

const STACK_CANARY: u64 = 0xDEAD_BEEF_CAFE_BABE;

pub const KERNEL_STACK_SIZE: usize = 16 * 1024;
pub const PRIORITY_LEVELS: usize = 32;

const NO_CPU: usize = usize::MAX;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ThreadFlags: u32 {
        const RUNNING       = 1 << 0;
        const QUEUED        = 1 << 1;
        const SLEEPING      = 1 << 2;
        /// The current sleep may be ended by `WakeReason::Interrupt`.
        const INTERRUPTIBLE = 1 << 3;
        const PREEMPTED     = 1 << 4;
        const EXITED        = 1 << 5;
        const IDLE          = 1 << 6;
        /// The last sleep ended because its timeout fired.
        const TIMED_OUT     = 1 << 7;
        /// The last sleep was interrupted.
        const INTERRUPTED   = 1 << 8;
    }
}

/// Scheduling priority; 0 is the most urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Priority(u8);

impl Priority {
    pub const HIGHEST: Priority = Priority(0);
    pub const NORMAL: Priority = Priority(16);
    pub const LOWEST: Priority = Priority((PRIORITY_LEVELS - 1) as u8);

    pub const fn new(level: u8) -> Option<Priority> {
        if (level as usize) < PRIORITY_LEVELS {
            Some(Priority(level))
        } else {
            None
        }
    }

    pub const fn level(self) -> usize {
        self.0 as usize
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::NORMAL
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeReason {
    /// `wakeup` called by another thread.
    Explicit,
    Timeout,
    /// Cancellation; only ends interruptible sleeps.
    Interrupt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(u64);

impl ThreadId {
    pub fn new() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        ThreadId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for ThreadId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Everything restored when a thread is switched back in.
#[derive(Debug, Clone)]
pub struct Context {
    pub frame: TrapFrame,
    pub fpu: FpuState,
    pub fs_base: u64,
    pub gs_base: u64,
}

impl Context {
    pub fn new(frame: TrapFrame) -> Self {
        Context { frame, fpu: FpuState::initial(), fs_base: 0, gs_base: 0 }
    }

    /// Ring 0 frame entering `entry` on `stack_top`.
    pub fn kernel(entry: u64, arg: u64, stack_top: u64) -> Self {
        Context::new(TrapFrame {
            rip: entry,
            rdi: arg,
            // SysV: rsp + 8 is 16-byte aligned at function entry.
            rsp: (stack_top & !0xF) - 8,
            cs: KERNEL_CODE_SELECTOR as u64,
            ss: KERNEL_DATA_SELECTOR as u64,
            rflags: RFLAGS_IF,
            ..TrapFrame::default()
        })
    }

    /// Ring 3 frame entering `entry` on `user_stack`.
    pub fn user(entry: u64, user_stack: u64) -> Self {
        Context::new(TrapFrame {
            rip: entry,
            rsp: (user_stack & !0xF) - 16,
            cs: USER_CODE_SELECTOR as u64,
            ss: USER_DATA_SELECTOR as u64,
            rflags: RFLAGS_IF,
            ..TrapFrame::default()
        })
    }
}

/// A thread's kernel stack with a canary in its lowest word.
pub struct KernelStack {
    memory: Box<[u8]>,
}

impl KernelStack {
    /// `None` when the heap cannot provide the memory.
    pub fn new(size: usize) -> Option<KernelStack> {
        let mut memory = Vec::new();
        memory.try_reserve_exact(size).ok()?;
        memory.resize(size, 0);
        memory[..8].copy_from_slice(&STACK_CANARY.to_le_bytes());
        Some(KernelStack { memory: memory.into_boxed_slice() })
    }

    pub fn top(&self) -> u64 {
        self.memory.as_ptr() as u64 + self.memory.len() as u64
    }

    pub fn is_intact(&self) -> bool {
        self.memory[..8] == STACK_CANARY.to_le_bytes()
    }
}

/// Kernel thread body.
pub type ThreadEntry = fn(usize);

pub struct Thread {
    id: ThreadId,
    name: &'static str,
    priority: Priority,
    flags: AtomicU32,
    pin: AtomicUsize,
    last_cpu: AtomicUsize,
    entry: Option<(ThreadEntry, usize)>,
    context: Mutex<Context>,
    stack: Option<KernelStack>,
    vmm: Option<Arc<VmmContext>>,
    sleep_seq: AtomicU64,
}

impl Thread {
    pub(crate) fn new(
        name: &'static str,
        priority: Priority,
        pin: Option<usize>,
        context: Context,
        stack: Option<KernelStack>,
        entry: Option<(ThreadEntry, usize)>,
        vmm: Option<Arc<VmmContext>>,
    ) -> Thread {
        Thread {
            id: ThreadId::new(),
            name,
            priority,
            flags: AtomicU32::new(0),
            pin: AtomicUsize::new(pin.unwrap_or(NO_CPU)),
            last_cpu: AtomicUsize::new(NO_CPU),
            entry,
            context: Mutex::new(context),
            stack,
            vmm,
            sleep_seq: AtomicU64::new(0),
        }
    }

    pub(crate) fn idle(cpu: usize) -> Thread {
        let thread = Thread::new(
            "idle",
            Priority::LOWEST,
            Some(cpu),
            Context::new(TrapFrame::default()),
            None,
            None,
            None,
        );
        thread.flags.store(ThreadFlags::IDLE.bits(), Ordering::Relaxed);
        thread
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn flags(&self) -> ThreadFlags {
        ThreadFlags::from_bits_retain(self.flags.load(Ordering::Acquire))
    }

    pub fn is_idle(&self) -> bool {
        self.flags().contains(ThreadFlags::IDLE)
    }

    /// Applies `f` atomically. `f` returning `None` leaves the flags alone;
    /// the result is the previous value on success.
    pub(crate) fn update_flags<F>(&self, mut f: F) -> Result<ThreadFlags, ThreadFlags>
    where
        F: FnMut(ThreadFlags) -> Option<ThreadFlags>,
    {
        self.flags
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |raw| {
                f(ThreadFlags::from_bits_retain(raw)).map(|flags| flags.bits())
            })
            .map(ThreadFlags::from_bits_retain)
            .map_err(ThreadFlags::from_bits_retain)
    }

    pub(crate) fn set_flags(&self, flags: ThreadFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    pub(crate) fn clear_flags(&self, flags: ThreadFlags) {
        self.flags.fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    pub fn pin(&self) -> Option<usize> {
        match self.pin.load(Ordering::Acquire) {
            NO_CPU => None,
            cpu => Some(cpu),
        }
    }

    /// Moves the thread to `cpu` (or lets it float); takes effect the next
    /// time it is dequeued.
    pub(crate) fn set_pin(&self, cpu: Option<usize>) {
        self.pin.store(cpu.unwrap_or(NO_CPU), Ordering::Release);
    }

    pub fn runs_on(&self, cpu: usize) -> bool {
        self.pin().map_or(true, |pin| pin == cpu)
    }

    pub fn last_cpu(&self) -> Option<usize> {
        match self.last_cpu.load(Ordering::Acquire) {
            NO_CPU => None,
            cpu => Some(cpu),
        }
    }

    pub(crate) fn set_last_cpu(&self, cpu: usize) {
        self.last_cpu.store(cpu, Ordering::Release);
    }

    pub(crate) fn context(&self) -> spin::MutexGuard<'_, Context> {
        self.context.lock()
    }

    pub fn kernel_stack_top(&self) -> Option<u64> {
        self.stack.as_ref().map(|stack| stack.top())
    }

    pub fn validate_stack(&self) -> bool {
        self.stack.as_ref().map_or(true, |stack| stack.is_intact())
    }

    pub fn vmm(&self) -> Option<&Arc<VmmContext>> {
        self.vmm.as_ref()
    }

    pub(crate) fn entry(&self) -> Option<(ThreadEntry, usize)> {
        self.entry
    }

    /// Starts a new sleep generation; stale timeouts compare against it.
    pub(crate) fn next_sleep_seq(&self) -> u64 {
        self.sleep_seq.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn sleep_seq(&self) -> u64 {
        self.sleep_seq.load(Ordering::Acquire)
    }
}

impl fmt::Debug for Thread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Thread")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("flags", &self.flags())
            .field("pin", &self.pin())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priorities_are_bounded() {
        assert_eq!(Priority::new(31), Some(Priority::LOWEST));
        assert_eq!(Priority::new(32), None);
        assert!(Priority::HIGHEST < Priority::NORMAL);
    }

    #[test]
    fn kernel_context_starts_aligned_with_interrupts_on() {
        let ctx = Context::kernel(0xFFFF_FFFF_8000_1000, 7, 0x1_0000);
        assert_eq!(ctx.frame.rsp % 16, 8);
        assert_eq!(ctx.frame.rdi, 7);
        assert_eq!(ctx.frame.cs, KERNEL_CODE_SELECTOR as u64);
        assert_ne!(ctx.frame.rflags & RFLAGS_IF, 0);
        assert!(!ctx.frame.from_user());

        let user = Context::user(0x40_0000, 0x7FFF_F000);
        assert!(user.frame.from_user());
        assert_eq!(user.frame.rsp % 16, 0);
    }

    #[test]
    fn stack_canary_detects_overflow() {
        let stack = KernelStack::new(KERNEL_STACK_SIZE).unwrap();
        assert!(stack.is_intact());
        assert_eq!(stack.top() % 8, 0);

        let mut stack = stack;
        stack.memory[3] ^= 0xFF;
        assert!(!stack.is_intact());
    }

    #[test]
    fn flag_updates_are_conditional() {
        let thread = Thread::new("t", Priority::NORMAL, None, Context::new(TrapFrame::default()), None, None, None);
        thread.set_flags(ThreadFlags::SLEEPING);

        let woke = thread.update_flags(|f| f.contains(ThreadFlags::SLEEPING).then(|| f - ThreadFlags::SLEEPING));
        assert_eq!(woke, Ok(ThreadFlags::SLEEPING));
        let again = thread.update_flags(|f| f.contains(ThreadFlags::SLEEPING).then(|| f - ThreadFlags::SLEEPING));
        assert_eq!(again, Err(ThreadFlags::empty()));
    }

    #[test]
    fn pins_and_idle_threads() {
        let idle = Thread::idle(2);
        assert!(idle.is_idle());
        assert!(idle.runs_on(2) && !idle.runs_on(0));
        assert!(idle.kernel_stack_top().is_none());

        let floating = Thread::new("f", Priority::NORMAL, None, Context::new(TrapFrame::default()), None, None, None);
        assert!(floating.runs_on(0) && floating.runs_on(5));
        floating.set_pin(Some(1));
        assert!(!floating.runs_on(0));
    }
}

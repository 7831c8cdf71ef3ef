// Kernel Scheduler
//
// Implements a fixed-priority, round-robin, preemptive scheduler with one
// run queue per CPU and an explicit idle thread on every CPU.
//
// Key responsibilities:
// - Maintain per-CPU ready queues (32 priority levels)
// - Select the next runnable thread on yield, sleep, exit or quantum expiry
// - Put sleeping threads back on a run queue on wakeup or timeout
// - Switch contexts: registers, FPU/SSE, FS/GS bases, privileged stack and
//   (only when it changes) the page table
//
// Scheduling model:
// - Level 0 is the most urgent; lower levels always run first
// - Threads at the same level run round-robin
// - A periodic per-CPU quantum timer requests a reschedule; the switch
//   itself happens on the way out of the timer trap
// - Yield, sleep and exit enter through a software trap
//   (`trap::RESCHEDULE_VECTOR`) so every switch has the same shape: save
//   the trap frame into the outgoing thread, overwrite it with the incoming
//   thread's frame, return with `iretq`
//
// SMP model:
// - Each CPU owns its queue; threads are queued on their pinned CPU, else
//   the CPU they last ran on, else the least loaded one
// - A thread whose pin moved away is migrated the next time its old CPU
//   reschedules
// - No work stealing or load balancing beyond initial placement
//
// Correctness and safety notes:
// - Run queues, `current` and thread flags are only touched with
//   interrupts disabled
// - A thread is never QUEUED and RUNNING at once; checked after every
//   enqueue and every switch
// - Code inside an `InterruptScope` (timer callbacks, IRQ handlers) may
//   not block; `yield_now`/`sleep`/`exit` there abort
// - An outgoing thread's context is saved before RUNNING is cleared, so a
//   concurrent wakeup on another CPU never dispatches a stale context
// - Threads whose address space was terminated are never dispatched again

pub mod runqueue;

use alloc::boxed::Box;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use spin::{Mutex, Once};

use self::runqueue::RunQueue;
use crate::arch::{IrqGuard, Platform};
use crate::mm::{TableRoot, Vm, VmmContext};
use crate::thread::{
    Context, KernelStack, Priority, Thread, ThreadEntry, ThreadFlags, WakeReason, KERNEL_STACK_SIZE,
};
use crate::timer::{Timer, TimerId, TimerMode};
use crate::trap::TrapFrame;
use crate::{kabort, kassert, log_debug, log_info};

const LOG_ORIGIN: &str = "sched";

const NO_ROOT: usize = usize::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedError {
    OutOfMemory,
    InvalidCpu,
}

impl SchedError {
    pub fn to_errno(self) -> i64 {
        match self {
            SchedError::OutOfMemory => -12, // ENOMEM
            SchedError::InvalidCpu => -22,  // EINVAL
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuStats {
    pub switches: u64,
    pub table_loads: u64,
    pub queued: usize,
}

struct PerCpu {
    queue: Mutex<RunQueue>,
    current: Mutex<Option<Arc<Thread>>>,
    idle: Arc<Thread>,
    need_resched: AtomicBool,
    irq_depth: AtomicUsize,
    quantum_timer: Mutex<Option<TimerId>>,
    /// Page-table root currently loaded on this CPU.
    active_root: AtomicUsize,
    switches: AtomicU64,
    table_loads: AtomicU64,
}

impl PerCpu {
    fn new(cpu: usize) -> Self {
        PerCpu {
            queue: Mutex::new(RunQueue::new()),
            current: Mutex::new(None),
            idle: Arc::new(Thread::idle(cpu)),
            need_resched: AtomicBool::new(false),
            irq_depth: AtomicUsize::new(0),
            quantum_timer: Mutex::new(None),
            active_root: AtomicUsize::new(NO_ROOT),
            switches: AtomicU64::new(0),
            table_loads: AtomicU64::new(0),
        }
    }
}

/// Marks interrupt context on one CPU for as long as it lives.
pub struct InterruptScope<'a> {
    depth: &'a AtomicUsize,
}

impl Drop for InterruptScope<'_> {
    fn drop(&mut self) {
        self.depth.fetch_sub(1, Ordering::AcqRel);
    }
}

pub struct Scheduler {
    platform: &'static dyn Platform,
    timer: &'static dyn Timer,
    vm: &'static Vm,
    quantum: u64,
    cpus: Vec<PerCpu>,
    this: Weak<Scheduler>,
}

impl Scheduler {
    pub fn new(
        platform: &'static dyn Platform,
        timer: &'static dyn Timer,
        vm: &'static Vm,
        cpus: usize,
        quantum_ticks: u64,
    ) -> Result<Arc<Scheduler>, SchedError> {
        if cpus == 0 {
            return Err(SchedError::InvalidCpu);
        }

        Ok(Arc::new_cyclic(|this| Scheduler {
            platform,
            timer,
            vm,
            quantum: quantum_ticks.max(1),
            cpus: (0..cpus).map(PerCpu::new).collect(),
            this: this.clone(),
        }))
    }

    pub fn cpu_count(&self) -> usize {
        self.cpus.len()
    }

    fn cpu(&self, cpu: usize) -> &PerCpu {
        match self.cpus.get(cpu) {
            Some(percpu) => percpu,
            None => kabort!(LOG_ORIGIN, "CPU {} out of range ({} configured)", cpu, self.cpus.len()),
        }
    }

    fn check_pin(&self, pin: Option<usize>) -> Result<(), SchedError> {
        match pin {
            Some(cpu) if cpu >= self.cpus.len() => Err(SchedError::InvalidCpu),
            _ => Ok(()),
        }
    }

    /// Creates a kernel thread running `entry(arg)`. The thread is not
    /// queued yet.
    pub fn new_thread(
        &self,
        name: &'static str,
        entry: ThreadEntry,
        arg: usize,
        priority: Priority,
        pin: Option<usize>,
    ) -> Result<Arc<Thread>, SchedError> {
        self.check_pin(pin)?;
        let stack = KernelStack::new(KERNEL_STACK_SIZE).ok_or(SchedError::OutOfMemory)?;
        let context = Context::kernel(kernel_thread_start as usize as u64, 0, stack.top());

        let thread = Arc::new(Thread::new(name, priority, pin, context, Some(stack), Some((entry, arg)), None));
        log_debug!(LOG_ORIGIN, "New kernel thread {} '{}' prio {}", thread.id(), name, priority.level());
        Ok(thread)
    }

    /// Creates a thread entering ring 3 at `entry` inside `vmm`.
    pub fn new_user_thread(
        &self,
        name: &'static str,
        vmm: Arc<VmmContext>,
        entry: u64,
        user_stack: u64,
        priority: Priority,
        pin: Option<usize>,
    ) -> Result<Arc<Thread>, SchedError> {
        self.check_pin(pin)?;
        let stack = KernelStack::new(KERNEL_STACK_SIZE).ok_or(SchedError::OutOfMemory)?;
        let context = Context::user(entry, user_stack);

        let thread = Arc::new(Thread::new(name, priority, pin, context, Some(stack), None, Some(vmm)));
        log_debug!(LOG_ORIGIN, "New user thread {} '{}' prio {}", thread.id(), name, priority.level());
        Ok(thread)
    }

    /// Changes the CPU a thread may run on.
    pub fn set_affinity(&self, thread: &Thread, pin: Option<usize>) -> Result<(), SchedError> {
        self.check_pin(pin)?;
        thread.set_pin(pin);
        Ok(())
    }

    /// Makes a new (or otherwise unscheduled) thread runnable.
    pub fn queue(&self, thread: &Arc<Thread>) {
        let _irq = IrqGuard::new(self.platform);
        let blocked = ThreadFlags::RUNNING
            | ThreadFlags::QUEUED
            | ThreadFlags::SLEEPING
            | ThreadFlags::EXITED
            | ThreadFlags::IDLE;

        if let Err(flags) = thread.update_flags(|f| (!f.intersects(blocked)).then(|| f | ThreadFlags::QUEUED)) {
            kabort!(LOG_ORIGIN, "queue: thread {} is not startable ({:?})", thread.id(), flags);
        }
        self.enqueue(thread.clone());
    }

    fn target_cpu(&self, thread: &Thread) -> usize {
        if let Some(pin) = thread.pin() {
            kassert!(pin < self.cpus.len(), LOG_ORIGIN, "thread {} pinned to missing CPU {}", thread.id(), pin);
            return pin;
        }
        if let Some(last) = thread.last_cpu() {
            return last;
        }
        self.cpus
            .iter()
            .enumerate()
            .min_by_key(|(_, percpu)| percpu.queue.lock().len())
            .map(|(cpu, _)| cpu)
            .unwrap_or(0)
    }

    /// Pushes a thread already marked QUEUED.
    fn enqueue(&self, thread: Arc<Thread>) {
        let _irq = IrqGuard::new(self.platform);
        let cpu = self.target_cpu(&thread);
        let percpu = self.cpu(cpu);
        let priority = thread.priority();

        percpu.queue.lock().push(thread.clone());
        self.check_states(&thread);

        // Preemption happens on the target's next timer trap.
        let preempts = match percpu.current.lock().as_ref() {
            Some(current) => current.is_idle() || priority < current.priority(),
            None => false,
        };
        if preempts {
            percpu.need_resched.store(true, Ordering::Release);
        }
    }

    fn check_states(&self, thread: &Thread) {
        let flags = thread.flags();
        kassert!(
            !flags.contains(ThreadFlags::RUNNING | ThreadFlags::QUEUED),
            LOG_ORIGIN,
            "thread {} is queued and running at once ({:?})",
            thread.id(),
            flags
        );
    }

    /// Enters interrupt context on `cpu`.
    pub fn interrupt_scope(&self, cpu: usize) -> InterruptScope<'_> {
        let depth = &self.cpu(cpu).irq_depth;
        depth.fetch_add(1, Ordering::AcqRel);
        InterruptScope { depth }
    }

    fn assert_may_block(&self, cpu: usize, what: &str) {
        let depth = self.cpu(cpu).irq_depth.load(Ordering::Acquire);
        kassert!(depth == 0, LOG_ORIGIN, "{} called from interrupt context on CPU {}", what, cpu);
    }

    pub fn current(&self, cpu: usize) -> Option<Arc<Thread>> {
        let percpu = self.cpus.get(cpu)?;
        let _irq = IrqGuard::new(self.platform);
        let current = percpu.current.lock().clone();
        current
    }

    pub fn current_thread(&self) -> Option<Arc<Thread>> {
        self.current(self.platform.cpu_id())
    }

    fn running_thread(&self, cpu: usize, what: &str) -> Arc<Thread> {
        match self.current(cpu) {
            Some(thread) if !thread.is_idle() => thread,
            Some(_) => kabort!(LOG_ORIGIN, "{} called by the idle thread of CPU {}", what, cpu),
            None => kabort!(LOG_ORIGIN, "{} called before CPU {} started scheduling", what, cpu),
        }
    }

    /// Gives up the CPU; the caller stays runnable.
    pub fn yield_now(&self) {
        let cpu = self.platform.cpu_id();
        self.assert_may_block(cpu, "yield_now");
        self.platform.raise_reschedule();
    }

    /// Gives up the CPU while the caller polls for a condition, when the
    /// caller is a thread that may block; otherwise a spin hint. Returns
    /// whether it yielded.
    pub fn relax(&self) -> bool {
        let cpu = self.platform.cpu_id();
        let enabled = self.platform.irq_save();
        self.platform.irq_restore(enabled);

        let may_block = match self.cpus.get(cpu) {
            Some(percpu) => percpu.irq_depth.load(Ordering::Acquire) == 0 && self.current(cpu).is_some(),
            None => false,
        };
        if enabled && may_block {
            self.platform.raise_reschedule();
            return true;
        }
        core::hint::spin_loop();
        false
    }

    /// Blocks the calling thread until `wakeup`, or until `timeout` ticks
    /// pass. Only interruptible sleeps end with `WakeReason::Interrupt`.
    pub fn sleep(&self, timeout: Option<u64>, interruptible: bool) -> WakeReason {
        let (thread, timer) = self.arm_sleep(timeout, interruptible);
        self.platform.raise_reschedule();
        self.finish_sleep(&thread, timer)
    }

    fn arm_sleep(&self, timeout: Option<u64>, interruptible: bool) -> (Arc<Thread>, Option<TimerId>) {
        let cpu = self.platform.cpu_id();
        self.assert_may_block(cpu, "sleep");

        let _irq = IrqGuard::new(self.platform);
        let thread = self.running_thread(cpu, "sleep");
        let seq = thread.next_sleep_seq();
        let mut sleeping = ThreadFlags::SLEEPING;
        if interruptible {
            sleeping |= ThreadFlags::INTERRUPTIBLE;
        }
        thread.clear_flags(ThreadFlags::TIMED_OUT | ThreadFlags::INTERRUPTED);
        thread.set_flags(sleeping);

        let timer = timeout.map(|ticks| {
            let sleeper = Arc::downgrade(&thread);
            let sched = self.this.clone();
            self.timer.insert(
                cpu,
                ticks,
                TimerMode::OneShot,
                Box::new(move || {
                    if let (Some(thread), Some(sched)) = (sleeper.upgrade(), sched.upgrade()) {
                        // A later sleep of the same thread is not ours to end.
                        if thread.sleep_seq() == seq {
                            sched.wakeup(&thread, WakeReason::Timeout);
                        }
                    }
                }),
            )
        });

        log_debug!(LOG_ORIGIN, "Thread {} sleeping (timeout {:?})", thread.id(), timeout);
        (thread, timer)
    }

    fn finish_sleep(&self, thread: &Thread, timer: Option<TimerId>) -> WakeReason {
        let reasons = ThreadFlags::TIMED_OUT | ThreadFlags::INTERRUPTED;
        let flags = thread.update_flags(|f| Some(f - reasons)).unwrap_or_else(|f| f);

        let reason = if flags.contains(ThreadFlags::TIMED_OUT) {
            WakeReason::Timeout
        } else if flags.contains(ThreadFlags::INTERRUPTED) {
            WakeReason::Interrupt
        } else {
            WakeReason::Explicit
        };

        if reason != WakeReason::Timeout {
            if let Some(id) = timer {
                let _irq = IrqGuard::new(self.platform);
                self.timer.cancel(id);
            }
        }
        reason
    }

    /// Ends the sleep of `thread`. Returns false if it was not sleeping, or
    /// if `reason` is `Interrupt` and the sleep is not interruptible.
    pub fn wakeup(&self, thread: &Arc<Thread>, reason: WakeReason) -> bool {
        let _irq = IrqGuard::new(self.platform);
        let marker = match reason {
            WakeReason::Explicit => ThreadFlags::empty(),
            WakeReason::Timeout => ThreadFlags::TIMED_OUT,
            WakeReason::Interrupt => ThreadFlags::INTERRUPTED,
        };

        let prev = thread.update_flags(|f| {
            if !f.contains(ThreadFlags::SLEEPING) {
                return None;
            }
            if reason == WakeReason::Interrupt && !f.contains(ThreadFlags::INTERRUPTIBLE) {
                return None;
            }
            let mut next = (f - (ThreadFlags::SLEEPING | ThreadFlags::INTERRUPTIBLE)) | marker;
            // Still on its way out of a CPU: the switch-out path requeues it.
            if !f.contains(ThreadFlags::RUNNING) {
                next |= ThreadFlags::QUEUED;
            }
            Some(next)
        });

        match prev {
            Ok(prev) => {
                if !prev.contains(ThreadFlags::RUNNING) {
                    self.enqueue(thread.clone());
                }
                log_debug!(LOG_ORIGIN, "Thread {} woken ({:?})", thread.id(), reason);
                true
            }
            Err(_) => false,
        }
    }

    /// Terminates the calling thread.
    pub fn exit(&self) -> ! {
        let cpu = self.platform.cpu_id();
        self.assert_may_block(cpu, "exit");
        self.mark_exit(cpu);
        self.platform.raise_reschedule();
        kabort!(LOG_ORIGIN, "exited thread resumed on CPU {}", cpu)
    }

    /// Terminates the calling thread and every other thread of its
    /// process. Siblings are reaped the next time a CPU switches them out
    /// or would dispatch them.
    pub fn terminate_process(&self) -> ! {
        let cpu = self.platform.cpu_id();
        self.assert_may_block(cpu, "terminate_process");
        self.mark_terminated(cpu);
        self.mark_exit(cpu);
        self.platform.raise_reschedule();
        kabort!(LOG_ORIGIN, "terminated thread resumed on CPU {}", cpu)
    }

    fn mark_terminated(&self, cpu: usize) {
        let _irq = IrqGuard::new(self.platform);
        let thread = self.running_thread(cpu, "terminate_process");
        if let Some(vmm) = thread.vmm() {
            if vmm.terminate() {
                log_info!(LOG_ORIGIN, "Process of thread {} terminated, table {:#X}", thread.id(), vmm.table().0);
            }
        }
    }

    fn mark_exit(&self, cpu: usize) {
        let _irq = IrqGuard::new(self.platform);
        let thread = self.running_thread(cpu, "exit");
        thread.set_flags(ThreadFlags::EXITED);
        log_debug!(LOG_ORIGIN, "Thread {} '{}' exiting", thread.id(), thread.name());
    }

    /// Asks `cpu` to reschedule on its next timer trap.
    pub fn request_resched(&self, cpu: usize) {
        if let Some(percpu) = self.cpus.get(cpu) {
            percpu.need_resched.store(true, Ordering::Release);
        }
    }

    /// Timer trap body: runs due timers, then switches if a reschedule is
    /// pending.
    pub fn on_timer(&self, cpu: usize, frame: &mut TrapFrame) {
        {
            let _scope = self.interrupt_scope(cpu);
            self.timer.expire(cpu);
        }
        if self.cpu(cpu).need_resched.load(Ordering::Acquire) {
            self.reschedule(cpu, frame);
        }
    }

    /// Saves the interrupted thread from `frame`, picks the next thread and
    /// loads it into `frame`. Runs with interrupts disabled on the CPU's
    /// scheduler stack.
    pub fn reschedule(&self, cpu: usize, frame: &mut TrapFrame) {
        let percpu = self.cpu(cpu);
        percpu.need_resched.store(false, Ordering::Release);

        let prev = percpu.current.lock().take();
        if let Some(prev) = &prev {
            self.switch_out(cpu, prev, frame);
        }

        let next = self.pick_next(cpu);
        self.switch_in(cpu, &next, frame);

        let changed = prev.as_ref().map_or(true, |prev| prev.id() != next.id());
        if changed {
            percpu.switches.fetch_add(1, Ordering::Relaxed);
        }
        *percpu.current.lock() = Some(next);

        // Last reference to an exited thread goes here, after its page
        // table has been unloaded.
        drop(prev);
    }

    fn switch_out(&self, cpu: usize, prev: &Arc<Thread>, frame: &TrapFrame) {
        prev.set_flags(ThreadFlags::PREEMPTED);
        {
            let mut ctx = prev.context();
            ctx.frame = *frame;
            self.platform.save_fpu(&mut ctx.fpu);
            let (fs_base, gs_base) = self.platform.read_segment_bases();
            ctx.fs_base = fs_base;
            ctx.gs_base = gs_base;
        }

        if !prev.validate_stack() {
            kabort!(LOG_ORIGIN, "kernel stack overflow in thread {} '{}' on CPU {}", prev.id(), prev.name(), cpu);
        }

        if is_reaped(prev) {
            prev.set_flags(ThreadFlags::EXITED);
        }

        let parked = ThreadFlags::SLEEPING | ThreadFlags::EXITED | ThreadFlags::IDLE;
        let flags = prev
            .update_flags(|f| {
                let mut next = f - (ThreadFlags::RUNNING | ThreadFlags::PREEMPTED);
                if !f.intersects(parked) {
                    next |= ThreadFlags::QUEUED;
                }
                Some(next)
            })
            .unwrap_or_else(|f| f);

        if !flags.intersects(parked) {
            self.enqueue(prev.clone());
        }
    }

    fn pick_next(&self, cpu: usize) -> Arc<Thread> {
        let percpu = self.cpu(cpu);

        let migrating = percpu.queue.lock().drain_foreign(cpu);
        for thread in migrating {
            log_debug!(LOG_ORIGIN, "Migrating thread {} away from CPU {}", thread.id(), cpu);
            self.enqueue(thread);
        }

        loop {
            let next = percpu.queue.lock().pop_eligible(cpu);
            match next {
                Some(thread) if is_reaped(&thread) => {
                    let _ = thread.update_flags(|f| Some((f - ThreadFlags::QUEUED) | ThreadFlags::EXITED));
                    log_debug!(LOG_ORIGIN, "Reaped thread {} of a terminated process", thread.id());
                }
                Some(thread) => return thread,
                None => return percpu.idle.clone(),
            }
        }
    }

    fn root_of(&self, vmm: Option<&Arc<VmmContext>>) -> TableRoot {
        vmm.map(|ctx| ctx.table()).unwrap_or_else(|| self.vm.kernel_space().table())
    }

    fn switch_in(&self, cpu: usize, next: &Arc<Thread>, frame: &mut TrapFrame) {
        let percpu = self.cpu(cpu);
        let _ = next.update_flags(|f| Some((f - ThreadFlags::QUEUED) | ThreadFlags::RUNNING));
        next.set_last_cpu(cpu);

        let root = self.root_of(next.vmm());
        if percpu.active_root.swap(root.0, Ordering::AcqRel) != root.0 {
            self.vm.switch_to(next.vmm().map(|ctx| &**ctx));
            percpu.table_loads.fetch_add(1, Ordering::Relaxed);
        }

        if let Some(top) = next.kernel_stack_top() {
            self.platform.set_kernel_stack(cpu, top);
        }

        {
            let ctx = next.context();
            self.platform.write_segment_bases(ctx.fs_base, ctx.gs_base);
            self.platform.restore_fpu(&ctx.fpu);
            *frame = ctx.frame;
        }

        self.check_states(next);
    }

    /// Makes the idle thread current on `cpu` and arms its quantum timer.
    pub fn cpu_start(&self, cpu: usize) {
        let percpu = self.cpu(cpu);
        let _irq = IrqGuard::new(self.platform);

        percpu.idle.set_flags(ThreadFlags::RUNNING);
        percpu.idle.set_last_cpu(cpu);
        *percpu.current.lock() = Some(percpu.idle.clone());
        percpu
            .active_root
            .store(self.vm.kernel_space().table().0, Ordering::Release);

        let sched = self.this.clone();
        let id = self.timer.insert(
            cpu,
            self.quantum,
            TimerMode::Periodic,
            Box::new(move || {
                if let Some(sched) = sched.upgrade() {
                    sched.request_resched(cpu);
                }
            }),
        );
        *percpu.quantum_timer.lock() = Some(id);
        self.timer.resume(cpu);

        log_info!(LOG_ORIGIN, "CPU {} scheduling, quantum {} ticks", cpu, self.quantum);
    }

    /// Per-CPU entry: becomes the idle loop of `cpu`.
    pub fn cpu_entry(&self, cpu: usize) -> ! {
        self.cpu_start(cpu);
        loop {
            self.platform.halt();
            self.yield_now();
        }
    }

    pub fn cpu_stats(&self, cpu: usize) -> Option<CpuStats> {
        let percpu = self.cpus.get(cpu)?;
        let _irq = IrqGuard::new(self.platform);
        Some(CpuStats {
            switches: percpu.switches.load(Ordering::Relaxed),
            table_loads: percpu.table_loads.load(Ordering::Relaxed),
            queued: percpu.queue.lock().len(),
        })
    }
}

/// Whether `thread` belongs to a process that has been terminated.
fn is_reaped(thread: &Thread) -> bool {
    thread.vmm().map_or(false, |vmm| vmm.is_terminated())
}

/// First instruction of every kernel thread.
extern "C" fn kernel_thread_start() -> ! {
    let sched = match get() {
        Some(sched) => sched,
        None => kabort!(LOG_ORIGIN, "kernel thread started without a scheduler"),
    };
    match sched.current_thread().and_then(|thread| thread.entry()) {
        Some((entry, arg)) => entry(arg),
        None => kabort!(LOG_ORIGIN, "kernel thread started without an entry point"),
    }
    sched.exit()
}

static SCHEDULER: Once<Arc<Scheduler>> = Once::new();

/// Constructs the global scheduler. Later calls return the first instance.
pub fn init(
    platform: &'static dyn Platform,
    timer: &'static dyn Timer,
    vm: &'static Vm,
    cpus: usize,
    quantum_ticks: u64,
) -> Result<&'static Arc<Scheduler>, SchedError> {
    if let Some(sched) = SCHEDULER.get() {
        return Ok(sched);
    }
    let sched = Scheduler::new(platform, timer, vm, cpus, quantum_ticks)?;
    log_info!(LOG_ORIGIN, "Initialized: {} CPU(s), {} priority levels", cpus, crate::thread::PRIORITY_LEVELS);
    Ok(SCHEDULER.call_once(|| sched))
}

pub fn get() -> Option<&'static Arc<Scheduler>> {
    SCHEDULER.get()
}

/// `Scheduler::relax` on the global scheduler; a spin hint before it exists.
pub fn relax() {
    match get() {
        Some(sched) => {
            sched.relax();
        }
        None => core::hint::spin_loop(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::Hw;
    use crate::testing::{clock, hw, MockMmu, MockPlatform};
    use crate::timer::TickTimer;
    use std::boxed::Box;

    struct Rig {
        sched: Arc<Scheduler>,
        platform: &'static MockPlatform,
        timer: &'static TickTimer,
        vm: &'static Vm,
        mmu: &'static MockMmu,
        hw: Hw,
    }

    fn rig(cpus: usize, quantum: u64) -> Rig {
        let (hw, _, mmu) = hw(64);
        let platform: &'static MockPlatform = Box::leak(Box::new(MockPlatform::new(cpus)));
        let timer: &'static TickTimer = Box::leak(Box::new(TickTimer::new(cpus)));
        let kernel_table = hw.mmu.new_table().unwrap();
        let vm: &'static Vm = Box::leak(Box::new(Vm::new(hw, kernel_table, clock())));
        let sched = Scheduler::new(platform, timer, vm, cpus, quantum).unwrap();
        Rig { sched, platform, timer, vm, mmu, hw }
    }

    fn body(_: usize) {}

    fn kthread(rig: &Rig, level: u8) -> Arc<Thread> {
        rig.sched.new_thread("test", body, 0, Priority::new(level).unwrap(), None).unwrap()
    }

    fn running(rig: &Rig, cpu: usize) -> Arc<Thread> {
        rig.sched.current(cpu).unwrap()
    }

    #[test]
    fn dispatches_by_priority_then_idles() {
        let rig = rig(1, 100);
        rig.sched.cpu_start(0);
        let low = kthread(&rig, 5);
        let top = kthread(&rig, 0);
        let mid = kthread(&rig, 2);
        for t in [&low, &top, &mid] {
            rig.sched.queue(t);
        }

        let mut frame = TrapFrame::default();
        let mut order = Vec::new();
        for _ in 0..3 {
            rig.sched.reschedule(0, &mut frame);
            let current = running(&rig, 0);
            order.push(current.id());
            rig.sched.mark_exit(0);
        }
        assert_eq!(order, [top.id(), mid.id(), low.id()]);

        rig.sched.reschedule(0, &mut frame);
        assert!(running(&rig, 0).is_idle());
        assert_eq!(rig.sched.cpu_stats(0).unwrap().queued, 0);
    }

    #[test]
    fn running_and_queued_never_overlap() {
        let rig = rig(1, 100);
        rig.sched.cpu_start(0);
        let a = kthread(&rig, 3);
        rig.sched.queue(&a);
        assert!(a.flags().contains(ThreadFlags::QUEUED));
        assert!(!a.flags().contains(ThreadFlags::RUNNING));

        let mut frame = TrapFrame::default();
        rig.sched.reschedule(0, &mut frame);
        assert!(a.flags().contains(ThreadFlags::RUNNING));
        assert!(!a.flags().contains(ThreadFlags::QUEUED));
        assert_eq!(frame.rip, kernel_thread_start as usize as u64);

        // Yield with nothing else ready: it comes straight back.
        rig.sched.reschedule(0, &mut frame);
        assert_eq!(running(&rig, 0).id(), a.id());
        assert!(!a.flags().contains(ThreadFlags::QUEUED));
    }

    #[test]
    #[should_panic(expected = "not startable")]
    fn queueing_a_running_thread_aborts() {
        let rig = rig(1, 100);
        rig.sched.cpu_start(0);
        let a = kthread(&rig, 3);
        rig.sched.queue(&a);
        let mut frame = TrapFrame::default();
        rig.sched.reschedule(0, &mut frame);
        rig.sched.queue(&a);
    }

    #[test]
    fn quantum_expiry_round_robins_and_restores_registers() {
        let rig = rig(1, 2);
        rig.sched.cpu_start(0);
        let a = kthread(&rig, 4);
        let b = kthread(&rig, 4);
        rig.sched.queue(&a);
        rig.sched.queue(&b);

        let mut frame = TrapFrame::default();
        rig.sched.reschedule(0, &mut frame);
        assert_eq!(running(&rig, 0).id(), a.id());
        frame.rax = 0xA;

        rig.sched.on_timer(0, &mut frame);
        assert_eq!(running(&rig, 0).id(), a.id());
        rig.sched.on_timer(0, &mut frame);
        assert_eq!(running(&rig, 0).id(), b.id());
        assert_eq!(frame.rax, 0);
        frame.rax = 0xB;

        rig.sched.on_timer(0, &mut frame);
        rig.sched.on_timer(0, &mut frame);
        assert_eq!(running(&rig, 0).id(), a.id());
        assert_eq!(frame.rax, 0xA);
        assert_eq!(b.context().frame.rax, 0xB);
        assert_eq!(rig.platform.kernel_stack(0), a.kernel_stack_top());
    }

    #[test]
    fn sleep_times_out() {
        let rig = rig(1, 1000);
        rig.sched.cpu_start(0);
        let a = kthread(&rig, 1);
        rig.sched.queue(&a);
        let mut frame = TrapFrame::default();
        rig.sched.reschedule(0, &mut frame);

        let (thread, timer) = rig.sched.arm_sleep(Some(3), false);
        rig.sched.reschedule(0, &mut frame);
        assert!(running(&rig, 0).is_idle());
        assert!(a.flags().contains(ThreadFlags::SLEEPING));

        for _ in 0..3 {
            rig.sched.on_timer(0, &mut frame);
        }
        assert_eq!(running(&rig, 0).id(), a.id());
        assert_eq!(rig.sched.finish_sleep(&thread, timer), WakeReason::Timeout);
        assert_eq!(rig.timer.pending(0), 1);
    }

    #[test]
    fn explicit_wakeup_cancels_the_timeout() {
        let rig = rig(1, 1000);
        rig.sched.cpu_start(0);
        let a = kthread(&rig, 1);
        rig.sched.queue(&a);
        let mut frame = TrapFrame::default();
        rig.sched.reschedule(0, &mut frame);

        let (thread, timer) = rig.sched.arm_sleep(Some(50), false);
        rig.sched.reschedule(0, &mut frame);
        assert!(rig.sched.wakeup(&a, WakeReason::Explicit));
        assert!(!rig.sched.wakeup(&a, WakeReason::Explicit));

        rig.sched.on_timer(0, &mut frame);
        assert_eq!(running(&rig, 0).id(), a.id());
        assert_eq!(rig.sched.finish_sleep(&thread, timer), WakeReason::Explicit);
        // Only the quantum timer is left.
        assert_eq!(rig.timer.pending(0), 1);
    }

    #[test]
    fn interrupt_only_ends_interruptible_sleeps() {
        let rig = rig(1, 1000);
        rig.sched.cpu_start(0);
        let a = kthread(&rig, 1);
        rig.sched.queue(&a);
        let mut frame = TrapFrame::default();
        rig.sched.reschedule(0, &mut frame);

        let (thread, timer) = rig.sched.arm_sleep(None, false);
        rig.sched.reschedule(0, &mut frame);
        assert!(!rig.sched.wakeup(&a, WakeReason::Interrupt));
        assert!(a.flags().contains(ThreadFlags::SLEEPING));
        assert!(rig.sched.wakeup(&a, WakeReason::Explicit));
        rig.sched.reschedule(0, &mut frame);
        assert_eq!(rig.sched.finish_sleep(&thread, timer), WakeReason::Explicit);

        let (thread, timer) = rig.sched.arm_sleep(None, true);
        rig.sched.reschedule(0, &mut frame);
        assert!(rig.sched.wakeup(&a, WakeReason::Interrupt));
        rig.sched.reschedule(0, &mut frame);
        assert_eq!(running(&rig, 0).id(), a.id());
        assert_eq!(rig.sched.finish_sleep(&thread, timer), WakeReason::Interrupt);
    }

    #[test]
    fn wakeup_before_switch_out_is_not_lost() {
        let rig = rig(1, 1000);
        rig.sched.cpu_start(0);
        let a = kthread(&rig, 1);
        rig.sched.queue(&a);
        let mut frame = TrapFrame::default();
        rig.sched.reschedule(0, &mut frame);

        let (thread, timer) = rig.sched.arm_sleep(None, false);
        assert!(rig.sched.wakeup(&a, WakeReason::Explicit));
        assert!(!a.flags().contains(ThreadFlags::QUEUED));

        rig.sched.reschedule(0, &mut frame);
        assert_eq!(running(&rig, 0).id(), a.id());
        assert_eq!(rig.sched.finish_sleep(&thread, timer), WakeReason::Explicit);
    }

    /// Timer that notes the interrupt state of every list operation.
    struct IrqCheckingTimer {
        inner: TickTimer,
        platform: &'static MockPlatform,
        seen_enabled: std::sync::Mutex<Vec<&'static str>>,
    }

    impl IrqCheckingTimer {
        fn note(&self, op: &'static str) {
            if self.platform.irqs_enabled() {
                self.seen_enabled.lock().unwrap().push(op);
            }
        }
    }

    impl crate::timer::Clock for IrqCheckingTimer {
        fn now(&self) -> u64 {
            self.inner.now()
        }
    }

    impl Timer for IrqCheckingTimer {
        fn insert(&self, cpu: usize, delay: u64, mode: TimerMode, callback: crate::timer::Callback) -> TimerId {
            self.note("insert");
            self.inner.insert(cpu, delay, mode, callback)
        }

        fn cancel(&self, id: TimerId) -> bool {
            self.note("cancel");
            self.inner.cancel(id)
        }

        fn resume(&self, cpu: usize) {
            self.inner.resume(cpu)
        }

        fn expire(&self, cpu: usize) {
            self.note("expire");
            self.inner.expire(cpu)
        }
    }

    #[test]
    fn thread_side_lock_paths_run_with_interrupts_masked() {
        let (hw, _, _) = hw(64);
        let platform: &'static MockPlatform = Box::leak(Box::new(MockPlatform::new(1)));
        let timer: &'static IrqCheckingTimer = Box::leak(Box::new(IrqCheckingTimer {
            inner: TickTimer::new(1),
            platform,
            seen_enabled: std::sync::Mutex::new(Vec::new()),
        }));
        let kernel_table = hw.mmu.new_table().unwrap();
        let vm: &'static Vm = Box::leak(Box::new(Vm::new(hw, kernel_table, clock())));
        let sched = Scheduler::new(platform, timer, vm, 1, 1000).unwrap();

        sched.cpu_start(0);
        let a = sched.new_thread("sleeper", body, 0, Priority::new(1).unwrap(), None).unwrap();
        sched.queue(&a);

        // Trap bodies are entered with IF clear, as the hardware does.
        let mut frame = TrapFrame::default();
        {
            let _trap = IrqGuard::new(platform);
            sched.reschedule(0, &mut frame);
        }

        let (thread, id) = sched.arm_sleep(Some(50), false);
        assert!(platform.irqs_enabled());
        {
            let _trap = IrqGuard::new(platform);
            sched.reschedule(0, &mut frame);
        }
        assert!(sched.wakeup(&a, WakeReason::Explicit));
        {
            let _trap = IrqGuard::new(platform);
            sched.on_timer(0, &mut frame);
        }
        assert_eq!(sched.current(0).unwrap().id(), a.id());

        assert_eq!(sched.finish_sleep(&thread, id), WakeReason::Explicit);
        assert_eq!(sched.cpu_stats(0).unwrap().queued, 0);
        assert!(platform.irqs_enabled());
        assert_eq!(*timer.seen_enabled.lock().unwrap(), Vec::<&str>::new());
        assert_eq!(timer.inner.pending(0), 1);
    }

    #[test]
    fn page_table_reloads_only_when_the_space_changes() {
        let rig = rig(1, 1000);
        rig.sched.cpu_start(0);
        let vmm = VmmContext::new(rig.hw).unwrap();
        let a = rig.sched.new_user_thread("a", vmm.clone(), 0x40_0000, 0x7000_0000, Priority::NORMAL, None).unwrap();
        let b = rig.sched.new_user_thread("b", vmm.clone(), 0x40_0000, 0x7000_0000, Priority::NORMAL, None).unwrap();
        rig.sched.queue(&a);
        rig.sched.queue(&b);

        let mut frame = TrapFrame::default();
        rig.sched.reschedule(0, &mut frame);
        assert!(frame.from_user());
        assert_eq!(rig.mmu.active(), Some(vmm.table()));
        assert_eq!(rig.sched.cpu_stats(0).unwrap().table_loads, 1);

        rig.sched.mark_exit(0);
        rig.sched.reschedule(0, &mut frame);
        assert_eq!(running(&rig, 0).id(), b.id());
        assert_eq!(rig.sched.cpu_stats(0).unwrap().table_loads, 1);

        rig.sched.mark_exit(0);
        rig.sched.reschedule(0, &mut frame);
        assert!(running(&rig, 0).is_idle());
        assert_eq!(rig.mmu.active(), Some(rig.vm.kernel_space().table()));
        assert_eq!(rig.sched.cpu_stats(0).unwrap().table_loads, 2);
    }

    #[test]
    fn exited_thread_is_released() {
        let rig = rig(1, 1000);
        rig.sched.cpu_start(0);
        let a = kthread(&rig, 1);
        rig.sched.queue(&a);
        let mut frame = TrapFrame::default();
        rig.sched.reschedule(0, &mut frame);
        assert!(Arc::strong_count(&a) > 1);

        rig.sched.mark_exit(0);
        rig.sched.reschedule(0, &mut frame);
        assert_eq!(Arc::strong_count(&a), 1);
        assert!(a.flags().contains(ThreadFlags::EXITED));
    }

    #[test]
    fn terminating_a_process_reaps_its_other_threads() {
        let rig = rig(1, 1000);
        rig.sched.cpu_start(0);
        let vmm = VmmContext::new(rig.hw).unwrap();
        let other = VmmContext::new(rig.hw).unwrap();
        let faulting = rig.sched.new_user_thread("a", vmm.clone(), 0x40_0000, 0x7000_0000, Priority::NORMAL, None).unwrap();
        let sibling = rig.sched.new_user_thread("b", vmm.clone(), 0x40_0000, 0x7000_0000, Priority::NORMAL, None).unwrap();
        let sleeper = rig.sched.new_user_thread("c", vmm.clone(), 0x40_0000, 0x7000_0000, Priority::NORMAL, None).unwrap();
        let bystander = rig.sched.new_user_thread("d", other, 0x40_0000, 0x7000_0000, Priority::NORMAL, None).unwrap();
        let mut frame = TrapFrame::default();

        // The sleeper goes to sleep first.
        rig.sched.queue(&sleeper);
        rig.sched.reschedule(0, &mut frame);
        let (thread, timer) = rig.sched.arm_sleep(None, false);
        rig.sched.reschedule(0, &mut frame);

        for t in [&faulting, &sibling, &bystander] {
            rig.sched.queue(t);
        }
        rig.sched.reschedule(0, &mut frame);
        assert_eq!(running(&rig, 0).id(), faulting.id());

        rig.sched.mark_terminated(0);
        rig.sched.mark_exit(0);
        assert!(vmm.is_terminated());
        rig.sched.reschedule(0, &mut frame);
        assert_eq!(running(&rig, 0).id(), bystander.id());
        assert!(sibling.flags().contains(ThreadFlags::EXITED));
        assert!(!sibling.flags().contains(ThreadFlags::QUEUED));

        // A woken thread of the dead process never runs again.
        assert!(rig.sched.wakeup(&sleeper, WakeReason::Explicit));
        rig.sched.mark_exit(0);
        rig.sched.reschedule(0, &mut frame);
        assert!(running(&rig, 0).is_idle());
        assert!(sleeper.flags().contains(ThreadFlags::EXITED));
        assert_eq!(rig.sched.finish_sleep(&thread, timer), WakeReason::Explicit);
        assert_eq!(rig.sched.cpu_stats(0).unwrap().queued, 0);
    }

    #[test]
    fn repinned_thread_migrates() {
        let rig = rig(2, 1000);
        rig.sched.cpu_start(0);
        rig.sched.cpu_start(1);
        let a = rig.sched.new_thread("pinned", body, 0, Priority::NORMAL, Some(0)).unwrap();
        rig.sched.queue(&a);
        rig.sched.set_affinity(&a, Some(1)).unwrap();

        let mut frame = TrapFrame::default();
        rig.sched.reschedule(0, &mut frame);
        assert!(running(&rig, 0).is_idle());
        assert_eq!(rig.sched.cpu_stats(1).unwrap().queued, 1);

        rig.sched.reschedule(1, &mut frame);
        assert_eq!(running(&rig, 1).id(), a.id());
        assert_eq!(a.last_cpu(), Some(1));
    }

    #[test]
    fn invalid_pins_are_rejected() {
        let rig = rig(2, 1000);
        assert_eq!(
            rig.sched.new_thread("x", body, 0, Priority::NORMAL, Some(2)).unwrap_err(),
            SchedError::InvalidCpu
        );
        let a = kthread(&rig, 1);
        assert_eq!(rig.sched.set_affinity(&a, Some(9)), Err(SchedError::InvalidCpu));
        assert!(Scheduler::new(rig.platform, rig.timer, rig.vm, 0, 10).is_err());
    }

    #[test]
    fn wakeup_of_urgent_thread_preempts_idle() {
        let rig = rig(1, 1000);
        rig.sched.cpu_start(0);
        let a = kthread(&rig, 1);
        rig.sched.queue(&a);
        let mut frame = TrapFrame::default();
        rig.sched.reschedule(0, &mut frame);
        rig.sched.arm_sleep(None, false);
        rig.sched.reschedule(0, &mut frame);

        rig.sched.wakeup(&a, WakeReason::Explicit);
        rig.sched.on_timer(0, &mut frame);
        assert_eq!(running(&rig, 0).id(), a.id());
    }

    #[test]
    fn relax_yields_only_where_blocking_is_allowed() {
        let rig = rig(1, 1000);
        assert!(!rig.sched.relax());
        rig.sched.cpu_start(0);

        assert!(rig.sched.relax());
        assert_eq!(rig.platform.reschedules(), 1);
        {
            let _irq = IrqGuard::new(rig.platform);
            assert!(!rig.sched.relax());
        }
        {
            let _scope = rig.sched.interrupt_scope(0);
            assert!(!rig.sched.relax());
        }
        assert_eq!(rig.platform.reschedules(), 1);
    }

    #[test]
    fn yield_raises_the_reschedule_trap() {
        let rig = rig(1, 1000);
        rig.sched.cpu_start(0);
        rig.sched.yield_now();
        assert_eq!(rig.platform.reschedules(), 1);
        assert!(rig.platform.irqs_enabled());
    }

    #[test]
    #[should_panic(expected = "interrupt context")]
    fn blocking_inside_an_interrupt_scope_aborts() {
        let rig = rig(1, 1000);
        rig.sched.cpu_start(0);
        let _scope = rig.sched.interrupt_scope(0);
        rig.sched.yield_now();
    }
}

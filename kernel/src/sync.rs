// Interrupt-Safe Locking
//
// Spinlocks that a trap handler may also take must be held with interrupts
// disabled on the local CPU; otherwise a tick arriving inside the critical
// section spins forever on a lock its own CPU owns.
//
// Provided here:
// - `without_interrupts` runs a closure with the interrupt flag cleared and
//   restores the previous state afterwards
// - `IrqMutex` is a `spin::Mutex` whose guard keeps interrupts disabled for
//   as long as it lives
//
// Used by every lock the timer, reschedule or page-fault trap can reach
// without going through the scheduler: timer lists, slab lists, the
// contiguous-frame lock and the page-cache table. The scheduler masks
// through its `Platform` (`arch::IrqGuard`) instead.
//
// On the kernel target the flag is RFLAGS.IF. Host builds keep a per-thread
// flag so tests can observe the masking.

use core::mem::ManuallyDrop;
use core::ops::{Deref, DerefMut};
use spin::{Mutex, MutexGuard};

#[cfg(all(target_arch = "x86_64", not(test)))]
mod flag {
    use x86_64::instructions::interrupts;

    pub fn save() -> bool {
        let was_enabled = interrupts::are_enabled();
        interrupts::disable();
        was_enabled
    }

    pub fn restore(was_enabled: bool) {
        if was_enabled {
            interrupts::enable();
        }
    }

    pub fn enabled() -> bool {
        interrupts::are_enabled()
    }
}


#[cfg(all(not(target_arch = "x86_64"), not(test)))]
mod flag {
    pub fn save() -> bool {
        false
    }

    pub fn restore(_was_enabled: bool) {}

    pub fn enabled() -> bool {
        false
    }
}

/// Whether the executing CPU currently accepts interrupts.
pub fn interrupts_enabled() -> bool {
    flag::enabled()
}

#[inline(always)]
pub fn without_interrupts<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    let was_enabled = flag::save();
    let result = f();
    flag::restore(was_enabled);
    result
}

pub struct IrqMutex<T> {
    inner: Mutex<T>,
}

pub struct IrqMutexGuard<'a, T> {
    guard: ManuallyDrop<MutexGuard<'a, T>>,
    was_enabled: bool,
}

impl<T> IrqMutex<T> {
    pub const fn new(value: T) -> Self {
        IrqMutex { inner: Mutex::new(value) }
    }

    pub fn lock(&self) -> IrqMutexGuard<'_, T> {
        let was_enabled = flag::save();
        IrqMutexGuard { guard: ManuallyDrop::new(self.inner.lock()), was_enabled }
    }

    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}

impl<T> Deref for IrqMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for IrqMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for IrqMutexGuard<'_, T> {
    fn drop(&mut self) {
        // Unlock before interrupts come back.
        unsafe { ManuallyDrop::drop(&mut self.guard) };
        flag::restore(self.was_enabled);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_masks_interrupts_until_dropped() {
        let lock = IrqMutex::new(5u32);
        assert!(interrupts_enabled());
        {
            let mut value = lock.lock();
            assert!(!interrupts_enabled());
            *value += 1;
        }
        assert!(interrupts_enabled());
        assert_eq!(*lock.lock(), 6);
    }

    #[test]
    fn nested_sections_restore_the_outer_state() {
        let outer = IrqMutex::new(());
        let inner = IrqMutex::new(());
        let a = outer.lock();
        {
            let _b = inner.lock();
            assert!(!interrupts_enabled());
        }
        assert!(!interrupts_enabled());
        drop(a);
        assert!(interrupts_enabled());

        let value = without_interrupts(|| {
            assert!(!interrupts_enabled());
            7
        });
        assert_eq!(value, 7);
        assert!(interrupts_enabled());
    }
}

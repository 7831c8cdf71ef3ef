// Architecture Abstraction Layer
//
// The scheduler and the fault path never touch CPU registers directly; they
// go through the `Platform` trait defined here. The x86_64 binding lives in
// the submodules and is the only code in the crate that issues privileged
// instructions.
//
// Key responsibilities:
// - Identify the executing CPU
// - Save/restore the interrupt flag around critical sections (`IrqGuard`)
// - Save/restore FPU/SSE state and the FS/GS segment bases
// - Program the per-CPU privileged stack used on user->kernel transitions
// - Idle the CPU until the next interrupt
//
// Submodules (x86_64 only, compiled out of host tests):
// - `x86`     `X86Platform`, trap entry stubs, may-fault user copy
// - `paging`  4-level page-table binding of `mm::Mmu`
// - `gdt`     per-CPU GDT/TSS with rsp0 and the scheduler IST stack
// - `idt`     interrupt descriptor table wired to the trap stubs
// - `apic`    Local APIC timer and interrupt acknowledgement

#[cfg(all(target_arch = "x86_64", not(test)))]
pub mod apic;
#[cfg(all(target_arch = "x86_64", not(test)))]
pub mod gdt;
#[cfg(all(target_arch = "x86_64", not(test)))]
pub mod idt;
#[cfg(target_arch = "x86_64")]
pub mod paging;
#[cfg(all(target_arch = "x86_64", not(test)))]
pub mod x86;

pub const KERNEL_CODE_SELECTOR: u16 = 0x08;
pub const KERNEL_DATA_SELECTOR: u16 = 0x10;
pub const USER_CODE_SELECTOR: u16 = 0x18 | 3;
pub const USER_DATA_SELECTOR: u16 = 0x20 | 3;

/// FXSAVE/FXRSTOR image: 512 bytes, 16-byte aligned.
#[repr(C, align(16))]
#[derive(Clone)]
pub struct FpuState(pub [u8; 512]);

impl FpuState {
    /// Power-on state: x87 control word 0x037F, MXCSR 0x1F80 (all exceptions
    /// masked, round to nearest).
    pub fn initial() -> Self {
        let mut area = [0u8; 512];
        area[0..2].copy_from_slice(&0x037Fu16.to_le_bytes());
        area[24..28].copy_from_slice(&0x1F80u32.to_le_bytes());
        FpuState(area)
    }
}

impl Default for FpuState {
    fn default() -> Self {
        FpuState::initial()
    }
}

impl core::fmt::Debug for FpuState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FpuState").finish_non_exhaustive()
    }
}

pub trait Platform: Send + Sync {
    /// Index of the executing CPU, dense from 0.
    fn cpu_id(&self) -> usize;

    /// Disables interrupts, returning whether they were enabled.
    fn irq_save(&self) -> bool;
    fn irq_restore(&self, was_enabled: bool);

    fn save_fpu(&self, area: &mut FpuState);
    fn restore_fpu(&self, area: &FpuState);

    /// Returns `(fs_base, gs_base)`.
    fn read_segment_bases(&self) -> (u64, u64);
    fn write_segment_bases(&self, fs_base: u64, gs_base: u64);

    /// Stack loaded on a privilege transition into the kernel (TSS.rsp0).
    fn set_kernel_stack(&self, cpu: usize, top: u64);

    /// Enables interrupts and waits for the next one.
    fn halt(&self);

    /// Enters the scheduler through its software trap on the calling CPU.
    fn raise_reschedule(&self);

    /// Faulting linear address of the last page fault (CR2).
    fn fault_address(&self) -> u64;
}

/// Interrupts stay disabled while the guard lives; the previous state is
/// restored on drop.
pub struct IrqGuard<'a> {
    platform: &'a dyn Platform,
    was_enabled: bool,
}

impl<'a> IrqGuard<'a> {
    pub fn new(platform: &'a dyn Platform) -> Self {
        let was_enabled = platform.irq_save();
        IrqGuard { platform, was_enabled }
    }
}

impl Drop for IrqGuard<'_> {
    fn drop(&mut self) {
        self.platform.irq_restore(self.was_enabled);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockPlatform;

    #[test]
    fn fpu_initial_state_masks_exceptions() {
        let state = FpuState::initial();
        assert_eq!(u16::from_le_bytes([state.0[0], state.0[1]]), 0x037F);
        assert_eq!(u32::from_le_bytes([state.0[24], state.0[25], state.0[26], state.0[27]]), 0x1F80);
        assert_eq!(core::mem::align_of::<FpuState>(), 16);
    }

    #[test]
    fn irq_guard_restores_previous_state() {
        let platform = MockPlatform::new(1);
        assert!(platform.irqs_enabled());
        {
            let _outer = IrqGuard::new(&platform);
            assert!(!platform.irqs_enabled());
            {
                let _inner = IrqGuard::new(&platform);
            }
            assert!(!platform.irqs_enabled());
        }
        assert!(platform.irqs_enabled());
    }
}

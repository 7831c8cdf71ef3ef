// x86_64 Platform Binding
//
// `X86Platform` implements `arch::Platform` with real instructions, and this
// module carries the assembly every trap goes through.
//
// Trap entry:
// - One 16-byte-aligned stub per vector pushes a zero error code where the
//   CPU does not, then the vector number, then jumps to the common path
// - The common path pushes the general registers in `TrapFrame` order and
//   calls `ferrite_trap_dispatch(&mut frame)`; on return it pops whatever is
//   in the frame, which may now describe another thread, and `iretq`s
// - `ferrite_trap_stubs` is the table of stub addresses the IDT is built from
//
// CPU identity:
// - IA32_TSC_AUX holds the dense CPU index, read back with `rdtscp`; GS is
//   left to threads
//
// User copies:
// - `copy_user` is a `rep movsb` whose single instruction is registered in
//   the fault fixup table; a fault on user memory lands on the fixup label,
//   which returns the number of bytes not copied

use core::arch::{asm, global_asm};

use x86_64::instructions::interrupts;
use x86_64::registers::control::{Cr0, Cr0Flags, Cr2, Cr4, Cr4Flags};
use x86_64::registers::model_specific::{FsBase, GsBase, Msr};
use x86_64::VirtAddr;

use super::{gdt, FpuState, Platform};
use crate::mm::fault::FixupTable;
use crate::trap::RESCHEDULE_VECTOR;

const IA32_TSC_AUX: u32 = 0xC000_0103;

global_asm!(
    r#"
.altmacro

.macro TRAP_STUB n
    .align 16
ferrite_trap_stub_\n:
    .if (\n == 8) || ((\n >= 10) && (\n <= 14)) || (\n == 17) || (\n == 21) || (\n == 29) || (\n == 30)
    .else
        push 0
    .endif
    push \n
    jmp ferrite_trap_common
.endm

.macro STUB_ADDR n
    .quad ferrite_trap_stub_\n
.endm

.section .text
.global ferrite_trap_common
ferrite_trap_common:
    push rax
    push rbx
    push rcx
    push rdx
    push rsi
    push rdi
    push rbp
    push r8
    push r9
    push r10
    push r11
    push r12
    push r13
    push r14
    push r15
    cld
    mov rdi, rsp
    call ferrite_trap_dispatch
    pop r15
    pop r14
    pop r13
    pop r12
    pop r11
    pop r10
    pop r9
    pop r8
    pop rbp
    pop rdi
    pop rsi
    pop rdx
    pop rcx
    pop rbx
    pop rax
    add rsp, 16
    iretq

.set vector, 0
.rept 256
    TRAP_STUB %vector
    .set vector, vector + 1
.endr

.section .rodata
.align 8
.global ferrite_trap_stubs
ferrite_trap_stubs:
.set vector, 0
.rept 256
    STUB_ADDR %vector
    .set vector, vector + 1
.endr

.section .text
.global ferrite_copy_user
ferrite_copy_user:
    mov rcx, rdx
.global ferrite_copy_user_start
ferrite_copy_user_start:
    rep movsb
.global ferrite_copy_user_end
ferrite_copy_user_end:
    xor eax, eax
    ret
.global ferrite_copy_user_fixup
ferrite_copy_user_fixup:
    mov rax, rcx
    ret

.noaltmacro
"#
);

extern "C" {
    pub static ferrite_trap_stubs: [u64; 256];
    fn ferrite_copy_user(dst: *mut u8, src: *const u8, len: usize) -> usize;
    fn ferrite_copy_user_start();
    fn ferrite_copy_user_end();
    fn ferrite_copy_user_fixup();
}

pub struct X86Platform;

pub static PLATFORM: X86Platform = X86Platform;

impl X86Platform {
    /// Per-CPU register setup: CPU index, SSE enable.
    pub fn init_cpu(&self, cpu: usize) {
        unsafe {
            Msr::new(IA32_TSC_AUX).write(cpu as u64);

            let mut cr0 = Cr0::read();
            cr0.remove(Cr0Flags::EMULATE_COPROCESSOR | Cr0Flags::TASK_SWITCHED);
            cr0.insert(Cr0Flags::MONITOR_COPROCESSOR);
            Cr0::write(cr0);

            let mut cr4 = Cr4::read();
            cr4.insert(Cr4Flags::OSFXSR | Cr4Flags::OSXMMEXCPT_ENABLE);
            Cr4::write(cr4);

            asm!("fninit", options(nomem, nostack));
        }
    }
}

impl Platform for X86Platform {
    fn cpu_id(&self) -> usize {
        let aux: u32;
        unsafe {
            asm!("rdtscp", out("eax") _, out("edx") _, out("ecx") aux, options(nomem, nostack, preserves_flags));
        }
        aux as usize
    }

    fn irq_save(&self) -> bool {
        let was_enabled = interrupts::are_enabled();
        interrupts::disable();
        was_enabled
    }

    fn irq_restore(&self, was_enabled: bool) {
        if was_enabled {
            interrupts::enable();
        }
    }

    fn save_fpu(&self, area: &mut FpuState) {
        unsafe { asm!("fxsave64 [{}]", in(reg) area.0.as_mut_ptr(), options(nostack, preserves_flags)) };
    }

    fn restore_fpu(&self, area: &FpuState) {
        unsafe { asm!("fxrstor64 [{}]", in(reg) area.0.as_ptr(), options(nostack, preserves_flags)) };
    }

    fn read_segment_bases(&self) -> (u64, u64) {
        (FsBase::read().as_u64(), GsBase::read().as_u64())
    }

    fn write_segment_bases(&self, fs_base: u64, gs_base: u64) {
        FsBase::write(VirtAddr::new_truncate(fs_base));
        GsBase::write(VirtAddr::new_truncate(gs_base));
    }

    fn set_kernel_stack(&self, cpu: usize, top: u64) {
        gdt::set_rsp0(cpu, top);
    }

    fn halt(&self) {
        interrupts::enable_and_hlt();
    }

    fn raise_reschedule(&self) {
        unsafe { asm!("int {v}", v = const RESCHEDULE_VECTOR) };
    }

    fn fault_address(&self) -> u64 {
        Cr2::read().as_u64()
    }
}

/// Makes faults inside `copy_user` recoverable.
pub fn register_fixups(fixups: &FixupTable) {
    fixups.register(
        ferrite_copy_user_start as usize as u64,
        ferrite_copy_user_end as usize as u64,
        ferrite_copy_user_fixup as usize as u64,
    );
}

/// Copies between kernel and user memory. Returns the number of bytes left
/// uncopied when the user side faulted without being resolvable.
///
/// # Safety
/// `dst` and `src` must not overlap; the kernel side must be valid for
/// `len` bytes.
pub unsafe fn copy_user(dst: *mut u8, src: *const u8, len: usize) -> usize {
    ferrite_copy_user(dst, src, len)
}

//! Per-vector entry stubs and the common trap entry/exit path.
//!
//! 256 stubs, 16 bytes apart, so the IDT can compute each handler as
//! `vectors_start + vector * 16`. A stub pushes a zero error code when
//! the CPU did not push one, then the vector number, and falls into
//! `alltraps`, which completes the [`super::trap::TrapFrame`], loads the
//! kernel data segments and hands the frame to `trap_dispatch`.
//!
//! `trap_exit` is the single way back: it restores the frame and
//! `iret`s. The scheduler relies on this — whatever kernel stack we are
//! on when `trap_exit` runs, the frame on top of it is what reaches user
//! mode (or the interrupted kernel code).

use core::arch::global_asm;

// Vectors 8, 10..14 and 17 come with a CPU-pushed error code; everything
// else gets a zero so the frame layout is uniform.
global_asm!(
    r#"
.section .text
.align 16
.global vectors_start
vectors_start:
.set vec, 0
.rept 256
  .align 16
  .if vec == 8 || (vec >= 10 && vec <= 14) || vec == 17
    pushl $vec
    jmp alltraps
  .else
    pushl $0
    pushl $vec
    jmp alltraps
  .endif
  .set vec, vec + 1
.endr

.global alltraps
alltraps:
    pushl %ds
    pushl %es
    pushl %fs
    pushl %gs
    pushal
    movw $0x10, %ax          /* kernel data selector */
    movw %ax, %ds
    movw %ax, %es
    movw %ax, %fs
    movw %ax, %gs
    pushl %esp               /* TrapFrame* argument */
    call trap_dispatch
    addl $4, %esp

.global trap_exit
trap_exit:
    popal
    popl %gs
    popl %fs
    popl %es
    popl %ds
    addl $8, %esp            /* trapno + err */
    iret
"#,
    options(att_syntax)
);

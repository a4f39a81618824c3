//! Multiboot2 header and the protected-mode entry point.
//!
//! The loader drops us in flat 32-bit protected mode, paging off, with
//! the magic in EAX and the info-structure physical address in EBX. The
//! kernel is linked at 0xC0100000 but loaded at 1 MiB, so until paging
//! is on every symbol reference subtracts the 0xC0000000 offset. The
//! entry code fills the two boot page tables (first 8 MiB, both as an
//! identity view and as the 0xC0000000 alias), points CR3 at the
//! canonical kernel directory, sets CR0.PG|WP, and long-jumps into the
//! higher half to call `kernel_main(magic, info)`.

use core::arch::global_asm;

global_asm!(
    r#"
.section .multiboot_header, "aw"
.align 8
multiboot_header_start:
    .long 0xe85250d6                /* magic */
    .long 0                         /* architecture: i386 */
    .long multiboot_header_end - multiboot_header_start
    .long -(0xe85250d6 + 0 + (multiboot_header_end - multiboot_header_start))
    /* end tag */
    .word 0
    .word 0
    .long 8
multiboot_header_end:

.section .boot.text, "ax"
.global _start
_start:
    cli
    movl %eax, %edi                 /* magic */
    movl %ebx, %esi                 /* info physical address */

    /* identity PTEs for the first 4 MiB */
    movl $(BOOT_PT0 - 0xC0000000), %edx
    xorl %ecx, %ecx
1:  movl %ecx, %eax
    shll $12, %eax
    orl $0x3, %eax                  /* present | writable */
    movl %eax, (%edx,%ecx,4)
    incl %ecx
    cmpl $1024, %ecx
    jne 1b

    /* second 4 MiB */
    movl $(BOOT_PT1 - 0xC0000000), %edx
    xorl %ecx, %ecx
2:  movl %ecx, %eax
    shll $12, %eax
    addl $0x400000, %eax
    orl $0x3, %eax
    movl %eax, (%edx,%ecx,4)
    incl %ecx
    cmpl $1024, %ecx
    jne 2b

    /* hang both tables off the directory: identity + higher-half alias */
    movl $(KERNEL_PAGE_DIR - 0xC0000000), %edx
    movl $(BOOT_PT0 - 0xC0000000 + 0x3), %eax
    movl %eax, 0(%edx)              /* pd[0]   -> VA 0x00000000 */
    movl %eax, 3072(%edx)           /* pd[768] -> VA 0xC0000000 */
    movl $(BOOT_PT1 - 0xC0000000 + 0x3), %eax
    movl %eax, 4(%edx)              /* pd[1]   -> VA 0x00400000 */
    movl %eax, 3076(%edx)           /* pd[769] -> VA 0xC0400000 */

    /* paging on, write protect enforced in ring 0 */
    movl %edx, %cr3
    movl %cr0, %eax
    orl $0x80010000, %eax           /* PG | WP */
    movl %eax, %cr0

    /* jump into the higher half */
    movl $3f, %eax
    jmp *%eax

.section .text
3:
    movl $boot_stack_top, %esp
    xorl %ebp, %ebp
    pushl %esi                      /* info */
    pushl %edi                      /* magic */
    call kernel_main
4:  cli
    hlt
    jmp 4b

.section .bss
.align 16
boot_stack:
    .skip 16384
.global boot_stack_top
boot_stack_top:
"#,
    options(att_syntax)
);

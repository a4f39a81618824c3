//! Trap frame and the C-level interrupt dispatcher.
//!
//! Every vector stub funnels into the common entry (`vectors.rs`), which
//! builds a [`TrapFrame`] on the current kernel stack and calls
//! [`trap_dispatch`]. The frame layout is shared bit-for-bit with the
//! entry and exit assembly; never reorder fields.

use core::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;
use spin::Mutex;

use super::cr;
use super::gdt::{USER_CS, USER_DS};
use super::port;
use crate::mm::{VirtAddr, KERNEL_VA_OFFSET};

/// Timer ticks per scheduling slice.
pub const TIME_SLICE: u64 = 10;

/// EFLAGS interrupt-enable bit, seeded into every user frame.
pub const EFLAGS_IF: u32 = 0x200;

// Trap numbers the dispatcher cares about.
pub const T_DIVIDE: u32 = 0;
pub const T_DOUBLE_FAULT: u32 = 8;
pub const T_GPFLT: u32 = 13;
pub const T_PGFLT: u32 = 14;
pub const T_SIMD: u32 = 19;
pub const T_IRQ0: u32 = 32;
pub const T_TIMER: u32 = T_IRQ0;
pub const T_KEYBOARD: u32 = T_IRQ0 + 1;

/// The register file pushed at every ring transition or interrupt.
///
/// Low addresses first: the `pushal` block, the four data-segment
/// selectors (each in a 32-bit push), the stub-pushed trap number and
/// error code, then the hardware frame. `esp`/`ss` at the end exist only
/// when the trap crossed rings; kernel-mode frames stop after `eflags`.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct TrapFrame {
    // pushal, reverse push order
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    pub oesp: u32, // pushal's saved esp; ignored on restore
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
    // segment selectors, each pushed as a dword
    pub gs: u32,
    pub fs: u32,
    pub es: u32,
    pub ds: u32,
    // stub
    pub trapno: u32,
    pub err: u32,
    // hardware
    pub eip: u32,
    pub cs: u32,
    pub eflags: u32,
    pub esp: u32,
    pub ss: u32,
}

impl TrapFrame {
    pub const fn zeroed() -> Self {
        // SAFETY: TrapFrame is plain u32s; all-zero is a valid value.
        unsafe { core::mem::zeroed() }
    }

    /// Did this trap come out of ring 3?
    pub fn from_user(&self) -> bool {
        self.cs & 3 == 3
    }

    /// Seed a frame for first entry into user mode: ring-3 selectors
    /// everywhere, IF set, entry point and stack as given.
    pub fn for_user_entry(entry: u32, user_esp: u32) -> Self {
        let mut tf = Self::zeroed();
        tf.eip = entry;
        tf.cs = USER_CS as u32;
        tf.ds = USER_DS as u32;
        tf.es = USER_DS as u32;
        tf.fs = USER_DS as u32;
        tf.gs = USER_DS as u32;
        tf.ss = USER_DS as u32;
        tf.eflags = EFLAGS_IF;
        tf.esp = user_esp;
        tf
    }
}

bitflags! {
    /// Page-fault error code bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFaultErr: u32 {
        const PRESENT = 1 << 0;
        const WRITE   = 1 << 1;
        const USER    = 1 << 2;
    }
}

static TICKS: AtomicU64 = AtomicU64::new(0);
static SLICE_TICKS: AtomicU64 = AtomicU64::new(0);

/// Monotonic timer tick count since boot.
pub fn ticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

type IrqHandler = fn();

/// Registered device ISRs for vectors 32..=255 (IOAPIC IRQs and MSIs).
static IRQ_HANDLERS: Mutex<[Option<IrqHandler>; 224]> = Mutex::new([None; 224]);

/// Hook a device ISR onto a vector in the IRQ/MSI window.
pub fn register_irq(vector: u32, handler: IrqHandler) {
    if (T_IRQ0..256).contains(&vector) {
        IRQ_HANDLERS.lock()[(vector - T_IRQ0) as usize] = Some(handler);
    }
}

/// End-of-interrupt hook supplied by the LAPIC collaborator.
static EOI_HOOK: Mutex<Option<fn(u32)>> = Mutex::new(None);

pub fn register_eoi(hook: fn(u32)) {
    *EOI_HOOK.lock() = Some(hook);
}

fn send_eoi(vector: u32) {
    if let Some(hook) = *EOI_HOOK.lock() {
        hook(vector);
        return;
    }
    // Legacy 8259 fallback.
    if (40..48).contains(&vector) {
        port::outb(0xA0, 0x20);
    }
    port::outb(0x20, 0x20);
}

/// The C dispatcher. Called by the common entry stub with the frame it
/// just built; `#[no_mangle]` because the stub names it.
///
/// # Safety
///
/// Only the entry stub may call this, with `tf` pointing at a live frame
/// on the current kernel stack.
#[no_mangle]
pub unsafe extern "C" fn trap_dispatch(tf: *mut TrapFrame) {
    // SAFETY: per the contract, the frame lives on our own stack.
    let tf = unsafe { &mut *tf };
    dispatch(tf);
    // Preemption happens only on the way back to ring 3: if the slice
    // expired (or a syscall yielded), reschedule before the frame is
    // restored. schedule() may well not return on this stack.
    if tf.from_user() && crate::sched::take_need_resched() {
        crate::sched::schedule();
    }
}

/// Trap-number switch, shared with the host tests.
pub fn dispatch(tf: &mut TrapFrame) {
    match tf.trapno {
        t if t == super::idt::T_SYSCALL as u32 => crate::syscall::dispatch(tf),
        T_PGFLT => page_fault(tf, VirtAddr::new(cr::read_cr2())),
        T_DIVIDE => fault(tf, "divide error"),
        T_GPFLT => fault(tf, "general protection fault"),
        T_DOUBLE_FAULT => fault(tf, "double fault"),
        T_SIMD => fault(tf, "SIMD exception"),
        T_TIMER => {
            timer_tick();
            send_eoi(T_TIMER);
        }
        v if (T_IRQ0..256).contains(&v) => {
            let handler = IRQ_HANDLERS.lock()[(v - T_IRQ0) as usize];
            match handler {
                Some(h) => h(),
                None => log::warn!("trap: spurious vector {}", v),
            }
            send_eoi(v);
        }
        v => {
            log::warn!("trap: unhandled trap {} from {:#x}", v, tf.eip);
            if !tf.from_user() {
                kernel_fault_halt(tf, "unhandled trap");
            }
        }
    }
}

fn timer_tick() {
    TICKS.fetch_add(1, Ordering::Relaxed);
    let s = SLICE_TICKS.fetch_add(1, Ordering::Relaxed) + 1;
    if s >= TIME_SLICE {
        SLICE_TICKS.store(0, Ordering::Relaxed);
        crate::sched::set_need_resched();
    }
}

/// Page-fault entry, split from [`dispatch`] so tests can feed CR2.
pub fn page_fault(tf: &mut TrapFrame, fault_va: VirtAddr) {
    let err = PageFaultErr::from_bits_truncate(tf.err);
    // A write to a present, read-only page below the kernel split is the
    // copy-on-write signature — from ring 3 directly, or from ring 0
    // while a syscall writes through a user pointer (CR0.WP).
    if fault_va.as_u32() < KERNEL_VA_OFFSET
        && err.contains(PageFaultErr::PRESENT | PageFaultErr::WRITE)
        && crate::task::fork::try_resolve_cow(fault_va)
    {
        return;
    }

    if tf.from_user() {
        log::warn!(
            "trap: user page fault at {:#x} (err {:#x}, eip {:#x}), killing task",
            fault_va.as_u32(),
            tf.err,
            tf.eip
        );
        crate::task::exit::exit_current(-1);
        return;
    }
    crate::println!(
        "kernel page fault: cr2={:#x} err={:#x} eip={:#x}",
        fault_va.as_u32(),
        tf.err,
        tf.eip
    );
    kernel_fault_halt(tf, "page fault");
}

fn fault(tf: &mut TrapFrame, what: &str) {
    if tf.from_user() {
        log::warn!(
            "trap: {} in task at eip {:#x}, killing task",
            what,
            tf.eip
        );
        crate::task::exit::exit_current(-1);
    } else {
        kernel_fault_halt(tf, what);
    }
}

fn kernel_fault_halt(tf: &mut TrapFrame, what: &str) -> ! {
    crate::println!(
        "kernel {}: trap {} err {:#x} eip {:#x} eax {:#x} ebx {:#x} ecx {:#x} edx {:#x} esp {:#x}",
        what,
        tf.trapno,
        tf.err,
        tf.eip,
        tf.eax,
        tf.ebx,
        tf.ecx,
        tf.edx,
        tf.oesp
    );
    crate::arch::x86::halt_forever()
}

#[cfg(not(target_os = "none"))]
pub fn reset_ticks_for_tests() {
    TICKS.store(0, Ordering::Relaxed);
    SLICE_TICKS.store(0, Ordering::Relaxed);
}

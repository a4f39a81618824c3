//! Interrupt descriptor table.
//!
//! All 256 vectors are installed at boot: exceptions and IRQs as
//! interrupt gates (DPL 0, IF cleared on entry), and vector 0x80 as a
//! trap gate with DPL 3 so `int $0x80` from ring 3 is legal and IF stays
//! set across the system call.

use super::gdt::SEL_KCODE;

/// The system-call vector.
pub const T_SYSCALL: u8 = 0x80;

/// One 8-byte gate descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C, packed)]
pub struct GateDesc {
    offset_low: u16,
    selector: u16,
    zero: u8,
    type_attr: u8,
    offset_high: u16,
}

const GATE_PRESENT: u8 = 1 << 7;
const GATE_INTERRUPT32: u8 = 0xE;
const GATE_TRAP32: u8 = 0xF;

impl GateDesc {
    pub const MISSING: Self = Self {
        offset_low: 0,
        selector: 0,
        zero: 0,
        type_attr: 0,
        offset_high: 0,
    };

    pub const fn interrupt(handler: u32, selector: u16, dpl: u8) -> Self {
        Self::gate(handler, selector, dpl, GATE_INTERRUPT32)
    }

    pub const fn trap(handler: u32, selector: u16, dpl: u8) -> Self {
        Self::gate(handler, selector, dpl, GATE_TRAP32)
    }

    const fn gate(handler: u32, selector: u16, dpl: u8, kind: u8) -> Self {
        Self {
            offset_low: (handler & 0xFFFF) as u16,
            selector,
            zero: 0,
            type_attr: GATE_PRESENT | ((dpl & 3) << 5) | kind,
            offset_high: (handler >> 16) as u16,
        }
    }
}

// The table itself only exists on bare metal: every entry's offset is
// computed from the `vectors_start` assembly label (the stubs are 16
// bytes apart).
#[cfg(all(target_arch = "x86", target_os = "none"))]
lazy_static::lazy_static! {
    static ref IDT: [GateDesc; 256] = {
        extern "C" {
            static vectors_start: u8;
        }
        // SAFETY: taking the address of the asm label; never
        // dereferenced.
        let base = unsafe { &vectors_start as *const u8 as u32 };
        let mut idt = [GateDesc::MISSING; 256];
        for (i, entry) in idt.iter_mut().enumerate() {
            *entry = GateDesc::interrupt(base + (i as u32) * 16, SEL_KCODE, 0);
        }
        idt[T_SYSCALL as usize] =
            GateDesc::trap(base + (T_SYSCALL as u32) * 16, SEL_KCODE, 3);
        idt
    };
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
#[repr(C, packed)]
struct DescriptorPointer {
    limit: u16,
    base: u32,
}

/// Load the table. Runs once on the bootstrap CPU with interrupts off.
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub fn init() {
    let ptr = DescriptorPointer {
        limit: core::mem::size_of::<[GateDesc; 256]>() as u16 - 1,
        base: IDT.as_ptr() as u32,
    };
    // SAFETY: the pointer names the lazily built static table.
    unsafe {
        core::arch::asm!("lidt [{}]", in(reg) &ptr as *const DescriptorPointer);
    }
    log::info!("idt: 256 gates, syscall trap gate at {:#x}", T_SYSCALL);
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn gate_encodings() {
        let g = GateDesc::interrupt(0xC010_2030, SEL_KCODE, 0);
        assert_eq!({ g.offset_low }, 0x2030);
        assert_eq!({ g.offset_high }, 0xC010);
        assert_eq!({ g.selector }, SEL_KCODE);
        assert_eq!({ g.type_attr }, 0x8E);

        let s = GateDesc::trap(0xC010_2800, SEL_KCODE, 3);
        // Present, DPL 3, 32-bit trap gate: IF preserved, callable from
        // ring 3.
        assert_eq!({ s.type_attr }, 0xEF);
    }

    #[test]
    fn gate_is_eight_bytes() {
        assert_eq!(core::mem::size_of::<GateDesc>(), 8);
    }
}

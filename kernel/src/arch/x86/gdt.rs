//! Global descriptor table and the task state segment.
//!
//! Six fixed slots: null, kernel code/data, user code/data, TSS. The
//! kernel and user segments are flat 0..4 GiB and differ only in DPL —
//! segmentation exists here purely to switch privilege levels. Of the
//! TSS only `esp0`/`ss0` matter: the CPU reads them on every ring 3 → 0
//! transition to find the kernel stack, so the scheduler must point
//! `esp0` at the incoming task's stack top before it commits.

use lazy_static::lazy_static;

/// Segment selectors (byte offsets into the GDT).
pub const SEL_KCODE: u16 = 0x08;
pub const SEL_KDATA: u16 = 0x10;
pub const SEL_UCODE: u16 = 0x18;
pub const SEL_UDATA: u16 = 0x20;
pub const SEL_TSS: u16 = 0x28;

/// Ring-3 selectors as loaded into segment registers (RPL = 3).
pub const USER_CS: u16 = SEL_UCODE | 3;
pub const USER_DS: u16 = SEL_UDATA | 3;

// Access-byte bits.
const ACC_PRESENT: u8 = 1 << 7;
const ACC_RING3: u8 = 3 << 5;
const ACC_CODE_DATA: u8 = 1 << 4;
const ACC_EXEC: u8 = 1 << 3;
const ACC_RW: u8 = 1 << 1;
/// 32-bit available TSS.
const ACC_TSS32: u8 = 0x9;

// Flag-nibble bits (top of byte 6).
const FLAG_4K: u8 = 1 << 7;
const FLAG_32BIT: u8 = 1 << 6;

/// One 8-byte segment descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C, packed)]
pub struct SegDesc {
    limit_low: u16,
    base_low: u16,
    base_mid: u8,
    access: u8,
    flags_limit_high: u8,
    base_high: u8,
}

impl SegDesc {
    pub const NULL: Self = Self::new(0, 0, 0, 0);

    pub const fn new(base: u32, limit: u32, access: u8, flags: u8) -> Self {
        Self {
            limit_low: (limit & 0xFFFF) as u16,
            base_low: (base & 0xFFFF) as u16,
            base_mid: ((base >> 16) & 0xFF) as u8,
            access,
            flags_limit_high: (flags & 0xF0) | (((limit >> 16) & 0x0F) as u8),
            base_high: ((base >> 24) & 0xFF) as u8,
        }
    }

    /// Flat 4 GiB code/data segment at the given privilege level.
    pub const fn flat(exec: bool, dpl_user: bool) -> Self {
        let mut access = ACC_PRESENT | ACC_CODE_DATA | ACC_RW;
        if exec {
            access |= ACC_EXEC;
        }
        if dpl_user {
            access |= ACC_RING3;
        }
        Self::new(0, 0xF_FFFF, access, FLAG_4K | FLAG_32BIT)
    }

    /// System descriptor for the TSS (byte granular, DPL 0).
    pub const fn tss(base: u32, limit: u32) -> Self {
        Self::new(base, limit, ACC_PRESENT | ACC_TSS32, 0)
    }
}

/// IA-32 task state segment. Only `esp0`/`ss0` are consumed by the
/// hardware in this kernel; the rest exists because the format says so.
#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
pub struct TaskState {
    pub backlink: u32,
    pub esp0: u32,
    pub ss0: u32,
    pub esp1: u32,
    pub ss1: u32,
    pub esp2: u32,
    pub ss2: u32,
    pub cr3: u32,
    pub eip: u32,
    pub eflags: u32,
    pub eax: u32,
    pub ecx: u32,
    pub edx: u32,
    pub ebx: u32,
    pub esp: u32,
    pub ebp: u32,
    pub esi: u32,
    pub edi: u32,
    pub es: u32,
    pub cs: u32,
    pub ss: u32,
    pub ds: u32,
    pub fs: u32,
    pub gs: u32,
    pub ldtr: u32,
    pub trace: u16,
    /// Offset of the (absent) I/O bitmap; set past the limit.
    pub iobase: u16,
}

impl TaskState {
    pub const fn zeroed() -> Self {
        Self {
            backlink: 0,
            esp0: 0,
            ss0: 0,
            esp1: 0,
            ss1: 0,
            esp2: 0,
            ss2: 0,
            cr3: 0,
            eip: 0,
            eflags: 0,
            eax: 0,
            ecx: 0,
            edx: 0,
            ebx: 0,
            esp: 0,
            ebp: 0,
            esi: 0,
            edi: 0,
            es: 0,
            cs: 0,
            ss: 0,
            ds: 0,
            fs: 0,
            gs: 0,
            ldtr: 0,
            trace: 0,
            iobase: 0,
        }
    }
}

lazy_static! {
    /// The single per-CPU TSS. Built once; `esp0` is rewritten on every
    /// dispatch through [`set_kernel_stack`].
    static ref TSS: TaskState = {
        let mut tss = TaskState::zeroed();
        tss.ss0 = SEL_KDATA as u32;
        tss.iobase = core::mem::size_of::<TaskState>() as u16;
        tss
    };
}

lazy_static! {
    static ref GDT: [SegDesc; 6] = {
        let tss_base = &*TSS as *const TaskState as usize as u32;
        [
            SegDesc::NULL,
            SegDesc::flat(true, false),  // kernel code
            SegDesc::flat(false, false), // kernel data
            SegDesc::flat(true, true),   // user code
            SegDesc::flat(false, true),  // user data
            SegDesc::tss(tss_base, core::mem::size_of::<TaskState>() as u32 - 1),
        ]
    };
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
#[repr(C, packed)]
struct DescriptorPointer {
    limit: u16,
    base: u32,
}

/// Load the table, reload the segment registers, and install the TSS.
/// Runs once on the bootstrap CPU with interrupts off.
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub fn init() {
    let ptr = DescriptorPointer {
        limit: core::mem::size_of::<[SegDesc; 6]>() as u16 - 1,
        base: GDT.as_ptr() as u32,
    };

    // SAFETY: the pointer names the lazily built static table; the
    // selector reloads reference descriptors that exist in it. The far
    // return reloads CS, everything else is loaded directly.
    unsafe {
        core::arch::asm!(
            "lgdt [{ptr}]",
            "push {kcode}",
            "lea {tmp}, [2f]",
            "push {tmp}",
            "retf",
            "2:",
            "mov ds, {kdata:x}",
            "mov es, {kdata:x}",
            "mov fs, {kdata:x}",
            "mov gs, {kdata:x}",
            "mov ss, {kdata:x}",
            "ltr {tss:x}",
            ptr = in(reg) &ptr as *const DescriptorPointer,
            kcode = const SEL_KCODE as u32,
            kdata = in(reg) SEL_KDATA as u32,
            tss = in(reg) SEL_TSS,
            tmp = out(reg) _,
        );
    }
    log::info!(
        "gdt: loaded, tss at {:#x}",
        &*TSS as *const TaskState as usize as u32
    );
}

/// Point TSS.esp0 at the kernel stack for the next ring transition.
///
/// The scheduler calls this before every switch to a task; skipping it
/// would make a user-mode interrupt push its frame onto the previous
/// task's kernel stack.
///
/// # Safety-relevant invariant
///
/// Writing through a raw pointer into the lazily initialized static is
/// sound because callers run with interrupts off, so the hardware cannot
/// read the TSS mid-update.
pub fn set_kernel_stack(esp0: u32) {
    // SAFETY: see above; the static outlives every caller.
    unsafe {
        let tss = &*TSS as *const TaskState as *mut TaskState;
        (*tss).esp0 = esp0;
    }
}

/// Current TSS.esp0 (diagnostics and tests).
pub fn kernel_stack() -> u32 {
    TSS.esp0
}

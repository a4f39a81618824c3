//! Early bootstrap allocators.
//!
//! Two arenas cover the window before the physical memory manager is up:
//!
//! 1. a 1 MiB BSS pool served by [`early_alloc`], bump-only, never freed —
//!    callers keep nothing past the PMM handover except lifetime-of-process
//!    data (GDT, IDT, the canonical kernel page directory);
//! 2. a page arena over physical 2 MiB..4 MiB, inside the region the boot
//!    code identity-maps, from which [`alloc_early_page_table`] carves the
//!    kernel page tables that have to exist before any other allocator can.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU32, Ordering};

use spin::Mutex;

use super::addr::{frame_ptr, PhysAddr, PAGE_SIZE};

/// Size of the BSS bump pool.
pub const EARLY_POOL_SIZE: usize = 1024 * 1024;

/// Physical range backing early kernel page tables.
pub const EARLY_PT_BASE: u32 = 0x0020_0000;
pub const EARLY_PT_END: u32 = 0x0040_0000;

#[repr(align(16))]
struct EarlyPool(UnsafeCell<[u8; EARLY_POOL_SIZE]>);

// SAFETY: all access goes through POOL_OFFSET, whose fetch_update makes
// each caller the unique owner of its slice.
unsafe impl Sync for EarlyPool {}

static POOL: EarlyPool = EarlyPool(UnsafeCell::new([0; EARLY_POOL_SIZE]));
static POOL_OFFSET: AtomicU32 = AtomicU32::new(0);

static PT_CURSOR: Mutex<u32> = Mutex::new(EARLY_PT_BASE);

/// Bump-allocate `size` bytes with the given power-of-two alignment.
///
/// Returns a pointer into the static pool, or null once the pool is
/// exhausted. Memory is zeroed (BSS) and never reclaimed.
pub fn early_alloc(size: usize, align: usize) -> *mut u8 {
    debug_assert!(align.is_power_of_two());
    let base = POOL.0.get() as usize;
    let mut claimed = 0usize;
    let res = POOL_OFFSET.fetch_update(Ordering::AcqRel, Ordering::Acquire, |off| {
        let start = (base + off as usize).next_multiple_of(align) - base;
        let end = start.checked_add(size)?;
        if end > EARLY_POOL_SIZE {
            return None;
        }
        claimed = start;
        Some(end as u32)
    });
    match res {
        Ok(_) => (base + claimed) as *mut u8,
        Err(_) => {
            log::error!(
                "early: pool exhausted (want {} bytes, {} used)",
                size,
                POOL_OFFSET.load(Ordering::Relaxed)
            );
            core::ptr::null_mut()
        }
    }
}

/// Bytes handed out so far from the bump pool.
pub fn early_used() -> usize {
    POOL_OFFSET.load(Ordering::Relaxed) as usize
}

/// Allocate one zeroed, page-aligned physical page from the 2..4 MiB
/// arena, for use as a kernel page table.
///
/// Returns `None` when the arena is exhausted; the caller decides whether
/// that is fatal (it is on the init path that populates the direct map).
pub fn alloc_early_page_table() -> Option<PhysAddr> {
    let mut cursor = PT_CURSOR.lock();
    if *cursor >= EARLY_PT_END {
        log::error!("early: page-table arena exhausted");
        return None;
    }
    let pa = PhysAddr::new(*cursor);
    *cursor += PAGE_SIZE as u32;
    // SAFETY: the arena lies inside the boot identity map, so the frame is
    // addressable; the cursor bump above makes us its only owner.
    unsafe {
        core::ptr::write_bytes(frame_ptr(pa), 0, PAGE_SIZE);
    }
    Some(pa)
}

#[cfg(not(target_os = "none"))]
pub fn reset_for_tests() {
    *PT_CURSOR.lock() = EARLY_PT_BASE;
}

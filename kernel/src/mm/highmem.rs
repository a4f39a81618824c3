//! Rotating mapping window for frames above the direct-map limit.
//!
//! The direct map covers physical memory up to `DIRECT_MAP_LIMIT`; the
//! odd frame beyond it (device BARs, memory on large boxes) is reached
//! through a fixed window of page slots at `WINDOW_BASE`. Slots are
//! handed out round-robin; a mapping stays valid until the window wraps
//! around to its slot, which is plenty for the momentary accesses this is
//! used for.

use spin::Mutex;

use super::addr::{PhysAddr, VirtAddr, DIRECT_MAP_LIMIT, PAGE_SIZE};
use super::paging::{self, PteFlags};
use crate::error::VmError;

/// Virtual base of the window.
pub const WINDOW_BASE: u32 = 0xF800_0000;
/// Number of simultaneously live slots.
pub const WINDOW_SLOTS: u32 = 256;

static NEXT_SLOT: Mutex<u32> = Mutex::new(0);

/// Pre-create the window's kernel page tables. Must run before the first
/// task directory is cloned so the window PDEs are part of the frozen
/// kernel half.
pub fn init() -> Result<(), VmError> {
    let mut va = WINDOW_BASE;
    let end = WINDOW_BASE + WINDOW_SLOTS * PAGE_SIZE as u32;
    while va < end {
        paging::ensure_kernel_pde(VirtAddr::new(va))?;
        va = (va & 0xFFC0_0000) + 0x0040_0000;
    }
    Ok(())
}

/// Map `pa` (any frame, typically above the direct-map limit) into the
/// next window slot and return the slot's virtual address.
pub fn map_highmem_physical(pa: PhysAddr) -> Result<VirtAddr, VmError> {
    if !pa.is_page_aligned() {
        return Err(VmError::BadAddress { addr: pa.as_u32() });
    }
    let mut next = NEXT_SLOT.lock();
    let slot = *next;
    *next = (slot + 1) % WINDOW_SLOTS;
    let va = VirtAddr::new(WINDOW_BASE + slot * PAGE_SIZE as u32);
    paging::map_kernel_page(va, pa, PteFlags::KERNEL_RW)?;
    Ok(va)
}

/// Whether a frame needs the window at all.
pub fn needs_window(pa: PhysAddr) -> bool {
    pa.as_u32() >= DIRECT_MAP_LIMIT
}

#[cfg(not(target_os = "none"))]
pub fn reset_for_tests() {
    *NEXT_SLOT.lock() = 0;
}

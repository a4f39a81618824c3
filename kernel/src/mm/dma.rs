//! DMA-coherent region.
//!
//! A fixed physical range reserved at paging init and mapped with caching
//! disabled (PCD) into the canonical kernel directory, virtual address
//! equal to physical. Device drivers carve descriptor rings and transfer
//! buffers out of it with [`alloc_coherent`]; because the mapping is
//! uncached, device writes are visible to the CPU (and vice versa)
//! without explicit flushes.

use spin::Mutex;

use super::addr::{PhysAddr, VirtAddr, PAGE_SIZE};
use super::paging::{self, PteFlags};
use crate::error::VmError;

/// Physical base of the region (12 MiB).
pub const DMA_BASE: u32 = 0x00C0_0000;
/// Region size: 4 MiB is enough for every ring the drivers queue.
pub const DMA_SIZE: u32 = 0x0040_0000;

/// A coherent buffer: both views name the same uncached bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaBuffer {
    pub virt: VirtAddr,
    pub phys: PhysAddr,
}

static CURSOR: Mutex<u32> = Mutex::new(DMA_BASE);

/// Map the whole region into the canonical kernel directory, present +
/// writable + cache-disabled. Runs at paging init, before any task
/// directory is cloned, so the mapping is inherited everywhere.
pub fn init() -> Result<(), VmError> {
    let flags = PteFlags::KERNEL_RW | PteFlags::NO_CACHE;
    let mut off = 0;
    while off < DMA_SIZE {
        let pa = PhysAddr::new(DMA_BASE + off);
        paging::map_kernel_page(VirtAddr::new(pa.as_u32()), pa, flags)?;
        off += PAGE_SIZE as u32;
    }
    log::info!(
        "dma: {} KiB coherent region at {:#x} (uncached, va == pa)",
        DMA_SIZE / 1024,
        DMA_BASE
    );
    Ok(())
}

/// Carve `size` bytes (rounded up to whole pages) off the bump cursor.
pub fn alloc_coherent(size: usize) -> Result<DmaBuffer, VmError> {
    let pages = size.div_ceil(PAGE_SIZE) as u32;
    let mut cursor = CURSOR.lock();
    let pa = *cursor;
    let end = pa
        .checked_add(pages * PAGE_SIZE as u32)
        .ok_or(VmError::DmaExhausted)?;
    if end > DMA_BASE + DMA_SIZE {
        log::error!("dma: region exhausted ({} bytes requested)", size);
        return Err(VmError::DmaExhausted);
    }
    *cursor = end;
    Ok(DmaBuffer {
        virt: VirtAddr::new(pa),
        phys: PhysAddr::new(pa),
    })
}

/// TODO: the bump allocator cannot return individual buffers; the region
/// is reclaimed wholesale at reset. Sized so this never matters in
/// practice.
pub fn free_coherent(_buf: DmaBuffer) {}

/// Whether a page-directory index falls inside the region's identity
/// window. Those PDEs are part of the alias every task directory
/// carries, not task-owned memory.
pub const fn pde_in_window(di: usize) -> bool {
    di >= (DMA_BASE >> 22) as usize && di < ((DMA_BASE + DMA_SIZE - 1) >> 22) as usize + 1
}

#[cfg(not(target_os = "none"))]
pub fn reset_for_tests() {
    *CURSOR.lock() = DMA_BASE;
}
